//! Exercises the codec the way a real agent/server stream conversation does:
//! several distinct envelope round-trips in sequence over one pipe, each
//! decoded strictly in order, mirroring how `ligolo_codec::io` is actually
//! driven in production rather than testing one payload at a time.

use anyhow::Result;
use ligolo_codec::io::{read_envelope, write_envelope};
use ligolo_codec::{Envelope, Net, NetInterface, Payload, Transport};

#[tokio::test]
async fn one_stream_carries_an_info_then_a_connect_then_a_disconnect() -> Result<()> {
    let (mut server, mut agent) = tokio::io::duplex(4096);

    write_envelope(&mut server, &Envelope::new(Payload::InfoRequest)).await?;
    let request = read_envelope(&mut agent).await?;
    assert!(matches!(request.payload, Payload::InfoRequest));

    let reply = Envelope::new(Payload::InfoReply {
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
        redirectors: vec![],
    });
    write_envelope(&mut agent, &reply).await?;
    let received = read_envelope(&mut server).await?;
    assert_eq!(received, reply);

    write_envelope(
        &mut server,
        &Envelope::new(Payload::ConnectRequest { net: Net::V4, transport: Transport::Tcp, address: "93.184.216.34".into(), port: 80 }),
    )
    .await?;
    let connect_request = read_envelope(&mut agent).await?;
    assert!(matches!(connect_request.payload, Payload::ConnectRequest { .. }));

    write_envelope(&mut agent, &Envelope::new(Payload::ConnectResponse { established: true, reset: false })).await?;
    let connect_response = read_envelope(&mut server).await?;
    assert!(matches!(connect_response.payload, Payload::ConnectResponse { established: true, reset: false }));

    write_envelope(&mut server, &Envelope::new(Payload::DisconnectRequest)).await?;
    let disconnect = read_envelope(&mut agent).await?;
    assert!(matches!(disconnect.payload, Payload::DisconnectRequest));

    Ok(())
}

#[tokio::test]
async fn a_refused_connect_carries_reset_true() -> Result<()> {
    let (mut server, mut agent) = tokio::io::duplex(512);

    write_envelope(
        &mut server,
        &Envelope::new(Payload::ConnectRequest { net: Net::V4, transport: Transport::Tcp, address: "10.0.0.9".into(), port: 9 }),
    )
    .await?;
    read_envelope(&mut agent).await?;

    write_envelope(&mut agent, &Envelope::new(Payload::ConnectResponse { established: false, reset: true })).await?;
    let response = read_envelope(&mut server).await?;
    assert!(matches!(response.payload, Payload::ConnectResponse { established: false, reset: true }));

    Ok(())
}

#[tokio::test]
async fn redirector_request_and_close_round_trip_with_error_details() -> Result<()> {
    let (mut server, mut agent) = tokio::io::duplex(1024);

    write_envelope(
        &mut server,
        &Envelope::new(Payload::RedirectorRequest { id: "r1".into(), proto: Transport::Tcp, from: "0.0.0.0:4444".into(), to: "127.0.0.1:8080".into() }),
    )
    .await?;
    let request = read_envelope(&mut agent).await?;
    let Payload::RedirectorRequest { id, .. } = request.payload else {
        panic!("expected RedirectorRequest");
    };

    write_envelope(&mut agent, &Envelope::new(Payload::RedirectorResponse { id, err: true, err_string: "address in use".into() })).await?;
    let response = read_envelope(&mut server).await?;
    assert!(matches!(response.payload, Payload::RedirectorResponse { err: true, .. }));

    write_envelope(&mut server, &Envelope::new(Payload::RedirectorCloseRequest { id: "r1".into() })).await?;
    read_envelope(&mut agent).await?;
    write_envelope(&mut agent, &Envelope::new(Payload::RedirectorCloseResponse { err: false, err_string: String::new() })).await?;
    let close_response = read_envelope(&mut server).await?;
    assert!(matches!(close_response.payload, Payload::RedirectorCloseResponse { err: false, .. }));

    Ok(())
}
