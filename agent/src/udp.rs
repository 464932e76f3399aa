//! UDP datagram bridging for `ConnectRequest` flows (§4.3). Unlike TCP, a
//! multiplex stream has no datagram boundaries of its own, so each direction
//! is framed with a 2-byte big-endian length prefix purely to preserve
//! message boundaries across the splice — this framing is local to the UDP
//! bridge and has nothing to do with the envelope codec.

use service::mux::Stream;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UdpSocket;

const MAX_DATAGRAM: usize = 64 * 1024;

pub async fn splice_udp(socket: UdpSocket, mut stream: Stream) {
    let mut from_socket = [0u8; MAX_DATAGRAM];

    loop {
        tokio::select! {
            result = socket.recv(&mut from_socket) => {
                let Ok(n) = result else { break };
                if stream.write_u16(n as u16).await.is_err() {
                    break;
                }
                if stream.write_all(&from_socket[..n]).await.is_err() {
                    break;
                }
            }
            result = stream.read_u16() => {
                let Ok(len) = result else { break };
                let mut buf = vec![0u8; len as usize];
                if stream.read_exact(&mut buf).await.is_err() {
                    break;
                }
                if socket.send(&buf).await.is_err() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use service::mux::{Multiplex, Role};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn bridges_datagrams_in_both_directions() {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let mut opener = Multiplex::new(client_io, Role::Opener);
        let mut acceptor = Multiplex::new(server_io, Role::Acceptor);

        let echo = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = echo.local_addr().unwrap();

        let bridged = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        bridged.connect(echo_addr).await.unwrap();

        let far_stream = opener.open().await.unwrap();
        let near_stream = acceptor.accept().await.unwrap();

        let bridge = tokio::spawn(splice_udp(bridged, near_stream));

        let echo_task = tokio::spawn(async move {
            let mut buf = [0u8; MAX_DATAGRAM];
            let (n, peer) = echo.recv_from(&mut buf).await.unwrap();
            echo.send_to(&buf[..n], peer).await.unwrap();
        });

        let mut stream = far_stream;
        let len = stream.write_u16(5).await;
        len.unwrap();
        stream.write_all(b"hello").await.unwrap();

        let reply_len = stream.read_u16().await.unwrap();
        let mut buf = vec![0u8; reply_len as usize];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        echo_task.await.unwrap();
        bridge.abort();
    }
}
