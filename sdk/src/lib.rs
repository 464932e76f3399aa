//! # Ligolo Server SDK
//!
//! A Rust client for the `ligolo-server` operator gRPC API (§6): the same
//! surface the bundled operator tooling uses, wrapped in a small
//! convenience type so a script or a TUI doesn't have to hold raw
//! `tonic`-generated request/response types.
//!
//! ## Usage
//!
//! ```no_run
//! use ligolo_sdk::{LigoloClient, tonic::transport::Channel};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let channel = Channel::from_static("https://127.0.0.1:58008").connect().await?;
//! let mut client = LigoloClient::new(channel);
//!
//! for session in client.list_sessions().await? {
//!     println!("{} ({})", session.alias, session.id);
//! }
//! # Ok(())
//! # }
//! ```

pub mod proto {
    tonic::include_proto!("ligolo.server");
}

pub use tonic;

use tonic::{Request, Response, Status};
use tonic::transport::Channel;

use proto::ligolo_operator_client::LigoloOperatorClient;
use proto::{
    AddOperatorRequest, AddRedirectorRequest, AddRouteRequest, CertificateInfo, Empty, Event,
    GenerateAgentRequest, GenerateAgentResponse, Operator, OperatorCertificate, OperatorName,
    RelayRequest, RemoveRedirectorRequest, RemoveRouteRequest, RenameSessionRequest, Session,
    SessionId,
};

/// A connected client for the `LigoloOperator` service. Every method maps
/// 1:1 onto an RPC in `protos/server.proto`, unwrapping the `tonic::Response`
/// envelope so callers work with plain values.
pub struct LigoloClient(LigoloOperatorClient<Channel>);

impl LigoloClient {
    pub fn new(channel: Channel) -> Self {
        Self(LigoloOperatorClient::new(channel))
    }

    pub async fn list_sessions(&mut self) -> Result<Vec<Session>, Status> {
        Ok(self.0.list_sessions(Request::new(Empty {})).await?.into_inner().sessions)
    }

    pub async fn rename_session(&mut self, id: String, alias: String) -> Result<(), Status> {
        self.0.rename_session(Request::new(RenameSessionRequest { id, alias })).await?;
        Ok(())
    }

    pub async fn kill_session(&mut self, id: String) -> Result<(), Status> {
        self.0.kill_session(Request::new(SessionId { id })).await?;
        Ok(())
    }

    pub async fn add_route(
        &mut self,
        session_id: String,
        cidr: String,
        is_loopback: bool,
        force: bool,
    ) -> Result<(), Status> {
        self.0
            .add_route(Request::new(AddRouteRequest { session_id, cidr, is_loopback, force }))
            .await?;
        Ok(())
    }

    pub async fn remove_route(&mut self, session_id: String, cidr: String) -> Result<(), Status> {
        self.0.remove_route(Request::new(RemoveRouteRequest { session_id, cidr })).await?;
        Ok(())
    }

    pub async fn add_redirector(
        &mut self,
        session_id: String,
        proto: String,
        from: String,
        to: String,
    ) -> Result<(), Status> {
        self.0
            .add_redirector(Request::new(AddRedirectorRequest { session_id, proto, from, to }))
            .await?;
        Ok(())
    }

    pub async fn remove_redirector(&mut self, session_id: String, redirector_id: String) -> Result<(), Status> {
        self.0
            .remove_redirector(Request::new(RemoveRedirectorRequest { session_id, redirector_id }))
            .await?;
        Ok(())
    }

    pub async fn start_relay(
        &mut self,
        session_id: String,
        max_connection: u32,
        max_inflight: u32,
    ) -> Result<(), Status> {
        self.0
            .start_relay(Request::new(RelayRequest { session_id, max_connection, max_inflight }))
            .await?;
        Ok(())
    }

    pub async fn stop_relay(&mut self, id: String) -> Result<(), Status> {
        self.0.stop_relay(Request::new(SessionId { id })).await?;
        Ok(())
    }

    pub async fn generate_agent(&mut self, request: GenerateAgentRequest) -> Result<GenerateAgentResponse, Status> {
        Ok(self.0.generate_agent(Request::new(request)).await?.into_inner())
    }

    pub async fn list_operators(&mut self) -> Result<Vec<Operator>, Status> {
        Ok(self.0.list_operators(Request::new(Empty {})).await?.into_inner().operators)
    }

    pub async fn add_operator(&mut self, name: String, is_admin: bool) -> Result<OperatorCertificate, Status> {
        Ok(self.0.add_operator(Request::new(AddOperatorRequest { name, is_admin })).await?.into_inner())
    }

    pub async fn remove_operator(&mut self, name: String) -> Result<(), Status> {
        self.0.remove_operator(Request::new(OperatorName { name })).await?;
        Ok(())
    }

    pub async fn list_certificates(&mut self) -> Result<Vec<CertificateInfo>, Status> {
        Ok(self.0.list_certificates(Request::new(Empty {})).await?.into_inner().certificates)
    }

    pub async fn regenerate_certificate(&mut self, name: String) -> Result<OperatorCertificate, Status> {
        Ok(self.0.regenerate_certificate(Request::new(OperatorName { name })).await?.into_inner())
    }

    /// Subscribe to the server's lifecycle event bus. The returned stream
    /// yields one `Event` per connect/disconnect/route/redirector/relay
    /// change for as long as the underlying gRPC stream stays open.
    pub async fn event_stream(&mut self) -> Result<tonic::Streaming<Event>, Status> {
        let response: Response<tonic::Streaming<Event>> = self.0.event_stream(Request::new(Empty {})).await?;
        Ok(response.into_inner())
    }
}
