use serde::{Deserialize, Serialize};

use super::{Error, Opcode};

/// `transport: {tcp=0, udp=1}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Transport {
    Tcp = 0,
    Udp = 1,
}

/// `net: {v4=0, v6=1}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Net {
    V4 = 0,
    V6 = 1,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetInterface {
    pub index: u32,
    pub mtu: u32,
    pub name: String,
    pub hardware_addr: String,
    pub flags: u32,
    pub addresses: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedirectorInfo {
    pub id: String,
    pub proto: Transport,
    pub from: String,
    pub to: String,
}

/// The decoded payload of an [`Envelope`](crate::Envelope), one variant per
/// opcode. `RedirectorBindRequest`/`RedirectorBindResponse` carry no fields:
/// on the wire they are an empty body, used purely as the protocol-convention
/// marker that distinguishes a redirector accept-callback stream from a
/// freshly opened `ConnectRequest` stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    InfoRequest,
    InfoReply {
        name: String,
        hostname: String,
        interfaces: Vec<NetInterface>,
        redirectors: Vec<RedirectorInfo>,
    },
    ConnectRequest {
        net: Net,
        transport: Transport,
        address: String,
        port: u16,
    },
    ConnectResponse {
        established: bool,
        reset: bool,
    },
    HostPingRequest {
        address: String,
    },
    HostPingResponse {
        alive: bool,
    },
    RedirectorRequest {
        id: String,
        proto: Transport,
        from: String,
        to: String,
    },
    RedirectorResponse {
        id: String,
        err: bool,
        err_string: String,
    },
    RedirectorBindRequest,
    RedirectorBindResponse,
    RedirectorCloseRequest {
        id: String,
    },
    RedirectorCloseResponse {
        err: bool,
        err_string: String,
    },
    DisconnectRequest,
    DisconnectResponse,
}

// Per-variant wire structs. These exist only so `bincode` has something
// concrete to serialize; `Payload` itself is the API client code matches on.
#[derive(Serialize, Deserialize)]
struct InfoReplyWire {
    name: String,
    hostname: String,
    interfaces: Vec<NetInterface>,
    redirectors: Vec<RedirectorInfo>,
}

#[derive(Serialize, Deserialize)]
struct ConnectRequestWire {
    net: Net,
    transport: Transport,
    address: String,
    port: u16,
}

#[derive(Serialize, Deserialize)]
struct ConnectResponseWire {
    established: bool,
    reset: bool,
}

#[derive(Serialize, Deserialize)]
struct HostPingRequestWire {
    address: String,
}

#[derive(Serialize, Deserialize)]
struct HostPingResponseWire {
    alive: bool,
}

#[derive(Serialize, Deserialize)]
struct RedirectorRequestWire {
    id: String,
    proto: Transport,
    from: String,
    to: String,
}

#[derive(Serialize, Deserialize)]
struct RedirectorResponseWire {
    id: String,
    err: bool,
    err_string: String,
}

#[derive(Serialize, Deserialize)]
struct RedirectorCloseRequestWire {
    id: String,
}

#[derive(Serialize, Deserialize)]
struct RedirectorCloseResponseWire {
    err: bool,
    err_string: String,
}

impl Payload {
    pub fn opcode(&self) -> Opcode {
        match self {
            Self::InfoRequest => Opcode::InfoRequest,
            Self::InfoReply { .. } => Opcode::InfoReply,
            Self::ConnectRequest { .. } => Opcode::ConnectRequest,
            Self::ConnectResponse { .. } => Opcode::ConnectResponse,
            Self::HostPingRequest { .. } => Opcode::HostPingRequest,
            Self::HostPingResponse { .. } => Opcode::HostPingResponse,
            Self::RedirectorRequest { .. } => Opcode::RedirectorRequest,
            Self::RedirectorResponse { .. } => Opcode::RedirectorResponse,
            Self::RedirectorBindRequest => Opcode::RedirectorBindRequest,
            Self::RedirectorBindResponse => Opcode::RedirectorBindResponse,
            Self::RedirectorCloseRequest { .. } => Opcode::RedirectorCloseRequest,
            Self::RedirectorCloseResponse { .. } => Opcode::RedirectorCloseResponse,
            Self::DisconnectRequest => Opcode::DisconnectRequest,
            Self::DisconnectResponse => Opcode::DisconnectResponse,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        Ok(match self {
            Self::InfoRequest
            | Self::RedirectorBindRequest
            | Self::RedirectorBindResponse
            | Self::DisconnectRequest
            | Self::DisconnectResponse => Vec::new(),
            Self::InfoReply { name, hostname, interfaces, redirectors } => {
                bincode::serialize(&InfoReplyWire {
                    name: name.clone(),
                    hostname: hostname.clone(),
                    interfaces: interfaces.clone(),
                    redirectors: redirectors.clone(),
                })?
            }
            Self::ConnectRequest { net, transport, address, port } => {
                bincode::serialize(&ConnectRequestWire {
                    net: *net,
                    transport: *transport,
                    address: address.clone(),
                    port: *port,
                })?
            }
            Self::ConnectResponse { established, reset } => {
                bincode::serialize(&ConnectResponseWire { established: *established, reset: *reset })?
            }
            Self::HostPingRequest { address } => {
                bincode::serialize(&HostPingRequestWire { address: address.clone() })?
            }
            Self::HostPingResponse { alive } => {
                bincode::serialize(&HostPingResponseWire { alive: *alive })?
            }
            Self::RedirectorRequest { id, proto, from, to } => {
                bincode::serialize(&RedirectorRequestWire {
                    id: id.clone(),
                    proto: *proto,
                    from: from.clone(),
                    to: to.clone(),
                })?
            }
            Self::RedirectorResponse { id, err, err_string } => {
                bincode::serialize(&RedirectorResponseWire {
                    id: id.clone(),
                    err: *err,
                    err_string: err_string.clone(),
                })?
            }
            Self::RedirectorCloseRequest { id } => {
                bincode::serialize(&RedirectorCloseRequestWire { id: id.clone() })?
            }
            Self::RedirectorCloseResponse { err, err_string } => {
                bincode::serialize(&RedirectorCloseResponseWire {
                    err: *err,
                    err_string: err_string.clone(),
                })?
            }
        })
    }

    pub fn decode(opcode: Opcode, body: &[u8]) -> Result<Self, Error> {
        Ok(match opcode {
            Opcode::InfoRequest => Self::InfoRequest,
            Opcode::InfoReply => {
                let wire: InfoReplyWire = bincode::deserialize(body)?;
                Self::InfoReply {
                    name: wire.name,
                    hostname: wire.hostname,
                    interfaces: wire.interfaces,
                    redirectors: wire.redirectors,
                }
            }
            Opcode::ConnectRequest => {
                let wire: ConnectRequestWire = bincode::deserialize(body)?;
                Self::ConnectRequest {
                    net: wire.net,
                    transport: wire.transport,
                    address: wire.address,
                    port: wire.port,
                }
            }
            Opcode::ConnectResponse => {
                let wire: ConnectResponseWire = bincode::deserialize(body)?;
                Self::ConnectResponse { established: wire.established, reset: wire.reset }
            }
            Opcode::HostPingRequest => {
                let wire: HostPingRequestWire = bincode::deserialize(body)?;
                Self::HostPingRequest { address: wire.address }
            }
            Opcode::HostPingResponse => {
                let wire: HostPingResponseWire = bincode::deserialize(body)?;
                Self::HostPingResponse { alive: wire.alive }
            }
            Opcode::RedirectorRequest => {
                let wire: RedirectorRequestWire = bincode::deserialize(body)?;
                Self::RedirectorRequest {
                    id: wire.id,
                    proto: wire.proto,
                    from: wire.from,
                    to: wire.to,
                }
            }
            Opcode::RedirectorResponse => {
                let wire: RedirectorResponseWire = bincode::deserialize(body)?;
                Self::RedirectorResponse { id: wire.id, err: wire.err, err_string: wire.err_string }
            }
            Opcode::RedirectorBindRequest => Self::RedirectorBindRequest,
            Opcode::RedirectorBindResponse => Self::RedirectorBindResponse,
            Opcode::RedirectorCloseRequest => {
                let wire: RedirectorCloseRequestWire = bincode::deserialize(body)?;
                Self::RedirectorCloseRequest { id: wire.id }
            }
            Opcode::RedirectorCloseResponse => {
                let wire: RedirectorCloseResponseWire = bincode::deserialize(body)?;
                Self::RedirectorCloseResponse { err: wire.err, err_string: wire.err_string }
            }
            Opcode::DisconnectRequest => Self::DisconnectRequest,
            Opcode::DisconnectResponse => Self::DisconnectResponse,
        })
    }
}
