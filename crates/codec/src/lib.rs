//! ## Framed envelope wire codec
//!
//! Every message exchanged between the agent and the server, on every
//! multiplexed stream, is an [`Envelope`]: a one-byte opcode, a four-byte
//! big-endian payload length, then the payload itself. The decoder mirrors
//! the encoder exactly: read the opcode, read the length, read that many
//! bytes, decode according to the opcode. Decoding is strictly sequential
//! per stream; the codec holds no state across envelopes.

pub mod io;
pub mod opcode;
pub mod payload;

use std::io;

use bytes::{BufMut, BytesMut};

pub use opcode::Opcode;
pub use payload::{Net, NetInterface, Payload, RedirectorInfo, Transport};

#[derive(Debug)]
pub enum Error {
    Truncated,
    UnknownOpcode(u8),
    Decode(bincode::Error),
    Io(io::Error),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Truncated => write!(f, "envelope truncated"),
            Self::UnknownOpcode(op) => write!(f, "unknown opcode: {op}"),
            Self::Decode(err) => write!(f, "payload decode error: {err}"),
            Self::Io(err) => write!(f, "io error: {err}"),
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(value: bincode::Error) -> Self {
        Self::Decode(value)
    }
}

impl From<io::Error> for Error {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

/// 1-byte opcode + 4-byte big-endian payload length.
pub const HEADER_SIZE: usize = 5;

#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub opcode: Opcode,
    pub payload: Payload,
}

impl Envelope {
    pub fn new(payload: Payload) -> Self {
        Self { opcode: payload.opcode(), payload }
    }

    /// Encode this envelope onto `buf`, appending header then payload.
    ///
    /// # Test
    ///
    /// ```
    /// use ligolo_codec::{Envelope, Payload};
    /// use bytes::BytesMut;
    ///
    /// let envelope = Envelope::new(Payload::DisconnectRequest);
    /// let mut buf = BytesMut::new();
    /// envelope.encode(&mut buf).unwrap();
    ///
    /// assert_eq!(buf[0], 12);
    /// assert_eq!(&buf[1..5], &0i32.to_be_bytes());
    /// ```
    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), Error> {
        let body = self.payload.encode()?;
        buf.put_u8(self.opcode as u8);
        buf.put_i32(body.len() as i32);
        buf.extend_from_slice(&body);
        Ok(())
    }

    /// Returns the total number of bytes (header + payload) the envelope at
    /// the front of `bytes` will occupy, once the header itself is present.
    pub fn required_len(bytes: &[u8]) -> Option<usize> {
        if bytes.len() < HEADER_SIZE {
            return None;
        }

        let size = i32::from_be_bytes(bytes[1..5].try_into().unwrap());
        Some(HEADER_SIZE + size.max(0) as usize)
    }

    /// Decode one envelope from the front of `bytes`, returning it along with
    /// the number of bytes consumed. `bytes` must already hold at least
    /// `required_len(bytes)` bytes.
    ///
    /// # Test
    ///
    /// ```
    /// use ligolo_codec::{Envelope, Payload};
    /// use bytes::BytesMut;
    ///
    /// let envelope = Envelope::new(Payload::HostPingResponse { alive: true });
    /// let mut buf = BytesMut::new();
    /// envelope.encode(&mut buf).unwrap();
    ///
    /// let (decoded, consumed) = Envelope::decode(&buf).unwrap();
    /// assert_eq!(consumed, buf.len());
    /// assert_eq!(decoded, envelope);
    /// ```
    pub fn decode(bytes: &[u8]) -> Result<(Self, usize), Error> {
        let total = Self::required_len(bytes).ok_or(Error::Truncated)?;
        if bytes.len() < total {
            return Err(Error::Truncated);
        }

        let opcode = Opcode::try_from(bytes[0])?;
        let payload = Payload::decode(opcode, &bytes[HEADER_SIZE..total])?;

        Ok((Self { opcode, payload }, total))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_every_variant() {
        let samples = vec![
            Payload::InfoRequest,
            Payload::InfoReply {
                name: "agent-1".into(),
                hostname: "corp-ws01".into(),
                interfaces: vec![NetInterface {
                    index: 2,
                    mtu: 1500,
                    name: "eth0".into(),
                    hardware_addr: "aa:bb:cc:dd:ee:ff".into(),
                    flags: 0,
                    addresses: vec!["10.0.0.5/24".into()],
                }],
                redirectors: vec![RedirectorInfo {
                    id: "abc".into(),
                    proto: Transport::Tcp,
                    from: "0.0.0.0:4444".into(),
                    to: "127.0.0.1:8080".into(),
                }],
            },
            Payload::ConnectRequest {
                net: Net::V4,
                transport: Transport::Tcp,
                address: "93.184.216.34".into(),
                port: 80,
            },
            Payload::ConnectResponse { established: true, reset: false },
            Payload::HostPingRequest { address: "10.1.2.3".into() },
            Payload::HostPingResponse { alive: true },
            Payload::RedirectorRequest {
                id: "abc".into(),
                proto: Transport::Udp,
                from: "0.0.0.0:53".into(),
                to: "10.0.0.1:53".into(),
            },
            Payload::RedirectorResponse { id: "abc".into(), err: false, err_string: "".into() },
            Payload::RedirectorBindRequest,
            Payload::RedirectorBindResponse,
            Payload::RedirectorCloseRequest { id: "abc".into() },
            Payload::RedirectorCloseResponse { err: true, err_string: "listener gone".into() },
            Payload::DisconnectRequest,
            Payload::DisconnectResponse,
        ];

        for payload in samples {
            let envelope = Envelope::new(payload);
            let mut buf = BytesMut::new();
            envelope.encode(&mut buf).unwrap();

            let (decoded, consumed) = Envelope::decode(&buf).unwrap();
            assert_eq!(consumed, buf.len());
            assert_eq!(decoded, envelope);
        }
    }

    #[test]
    fn truncated_header_is_reported() {
        let buf = [0u8, 0, 0];
        assert!(matches!(Envelope::decode(&buf), Err(Error::Truncated)));
    }

    #[test]
    fn truncated_body_is_reported() {
        let mut buf = BytesMut::new();
        Envelope::new(Payload::HostPingRequest { address: "1.2.3.4".into() })
            .encode(&mut buf)
            .unwrap();

        let short = &buf[..buf.len() - 1];
        assert!(matches!(Envelope::decode(short), Err(Error::Truncated)));
    }

    #[test]
    fn unknown_opcode_is_rejected() {
        let buf = [99u8, 0, 0, 0, 0];
        assert!(matches!(Envelope::decode(&buf), Err(Error::UnknownOpcode(99))));
    }
}
