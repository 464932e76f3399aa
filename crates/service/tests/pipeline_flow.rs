//! Drives `negotiate_connect` and `splice` together over a real yamux
//! multiplex pair, the way `pipeline::drain` actually uses them, instead of
//! unit-testing either in isolation.

use std::net::{IpAddr, Ipv4Addr};

use anyhow::Result;
use codec::io::{read_envelope, write_envelope};
use codec::{Envelope, Payload};
use ligolo_service::mux::{Multiplex, Role};
use ligolo_service::netstack::FourTuple;
use ligolo_service::pipeline::{negotiate_connect, rewrite_loopback, Negotiated};
use ligolo_service::route::Route;
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

fn tuple() -> FourTuple {
    FourTuple {
        local_addr: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5)),
        local_port: 51234,
        remote_addr: IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34)),
        remote_port: 80,
    }
}

/// A successful dial: the agent answers `established=true`, the server gets
/// back a live stream, and bytes flow both ways across it.
#[tokio::test]
async fn established_connect_carries_traffic_until_both_sides_close() -> Result<()> {
    let (client_io, server_io) = duplex(64 * 1024);
    let opener_mux = Multiplex::new(client_io, Role::Opener);
    let mut acceptor_mux = Multiplex::new(server_io, Role::Acceptor);

    let mut opener = opener_mux.opener();
    let routes: Vec<Route> = Vec::new();

    let agent_side = tokio::spawn(async move {
        let mut stream = acceptor_mux.accept().await.expect("connect stream opened");
        let request = read_envelope(&mut stream).await.unwrap();
        assert!(matches!(request.payload, Payload::ConnectRequest { .. }));

        write_envelope(&mut stream, &Envelope::new(Payload::ConnectResponse { established: true, reset: false })).await.unwrap();

        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
        stream.write_all(b"world").await.unwrap();
    });

    let negotiated = negotiate_connect(&mut opener, tuple(), codec::Transport::Tcp, &routes).await?;
    let Negotiated::Established(mut stream) = negotiated else {
        panic!("expected an established connection");
    };

    stream.write_all(b"hello").await?;
    let mut buf = [0u8; 5];
    stream.read_exact(&mut buf).await?;
    assert_eq!(&buf, b"world");

    agent_side.await?;
    Ok(())
}

/// A refused dial: the agent answers `established=false, reset=true`, which
/// `negotiate_connect` surfaces as `Negotiated::Reset` for the caller to act
/// on (the netstack injecting an actual RST, not exercised by this test).
#[tokio::test]
async fn refused_connect_is_reported_as_reset() -> Result<()> {
    let (client_io, server_io) = duplex(4096);
    let opener_mux = Multiplex::new(client_io, Role::Opener);
    let mut acceptor_mux = Multiplex::new(server_io, Role::Acceptor);

    let mut opener = opener_mux.opener();
    let routes: Vec<Route> = Vec::new();

    let agent_side = tokio::spawn(async move {
        let mut stream = acceptor_mux.accept().await.expect("connect stream opened");
        read_envelope(&mut stream).await.unwrap();
        write_envelope(&mut stream, &Envelope::new(Payload::ConnectResponse { established: false, reset: true })).await.unwrap();
    });

    let negotiated = negotiate_connect(&mut opener, tuple(), codec::Transport::Tcp, &routes).await?;
    assert!(matches!(negotiated, Negotiated::Reset));

    agent_side.await?;
    Ok(())
}

/// A route claiming the flow's local address as loopback causes
/// `negotiate_connect` to advertise the family's loopback address instead
/// of the tunnel-assigned one (the redirect-to-localhost convention).
#[tokio::test]
async fn a_loopback_route_rewrites_the_advertised_local_address() -> Result<()> {
    let (client_io, server_io) = duplex(4096);
    let opener_mux = Multiplex::new(client_io, Role::Opener);
    let mut acceptor_mux = Multiplex::new(server_io, Role::Acceptor);

    let mut opener = opener_mux.opener();
    let routes = vec![Route::new("10.0.0.0/8".parse()?, true)];

    let agent_side = tokio::spawn(async move {
        let mut stream = acceptor_mux.accept().await.expect("connect stream opened");
        let request = read_envelope(&mut stream).await.unwrap();
        let Payload::ConnectRequest { address, .. } = request.payload else {
            panic!("expected ConnectRequest");
        };
        assert_eq!(address, "127.0.0.1");
        write_envelope(&mut stream, &Envelope::new(Payload::ConnectResponse { established: true, reset: false })).await.unwrap();
    });

    let negotiated = negotiate_connect(&mut opener, tuple(), codec::Transport::Tcp, &routes).await?;
    assert!(matches!(negotiated, Negotiated::Established(_)));

    agent_side.await?;

    assert_eq!(rewrite_loopback(tuple().local_addr, &routes), IpAddr::V4(Ipv4Addr::LOCALHOST));
    Ok(())
}
