use super::Error;

/// Dense opcode enumeration, assigned in wire order starting at 0. The byte
/// value is part of the bit-exact wire format and must never be reordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    InfoRequest = 0,
    InfoReply = 1,
    ConnectRequest = 2,
    ConnectResponse = 3,
    HostPingRequest = 4,
    HostPingResponse = 5,
    RedirectorRequest = 6,
    RedirectorResponse = 7,
    RedirectorBindRequest = 8,
    RedirectorBindResponse = 9,
    RedirectorCloseRequest = 10,
    RedirectorCloseResponse = 11,
    DisconnectRequest = 12,
    DisconnectResponse = 13,
}

impl TryFrom<u8> for Opcode {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Self::InfoRequest,
            1 => Self::InfoReply,
            2 => Self::ConnectRequest,
            3 => Self::ConnectResponse,
            4 => Self::HostPingRequest,
            5 => Self::HostPingResponse,
            6 => Self::RedirectorRequest,
            7 => Self::RedirectorResponse,
            8 => Self::RedirectorBindRequest,
            9 => Self::RedirectorBindResponse,
            10 => Self::RedirectorCloseRequest,
            11 => Self::RedirectorCloseResponse,
            12 => Self::DisconnectRequest,
            13 => Self::DisconnectResponse,
            other => return Err(Error::UnknownOpcode(other)),
        })
    }
}
