//! Outbound dialing for `ConnectRequest` targets (§4.3), optionally relayed
//! through an HTTP(S) CONNECT or SOCKS5 proxy when the agent itself sits
//! behind one. Direct dialing is the common case; the proxy variants exist
//! for the same reason the reference implementation's agent supports
//! `--proxy`: some footholds can only reach the outside world that way.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

/// Anything splice-able: a live byte stream toward the `ConnectRequest`
/// target, whether dialed directly or negotiated through a proxy.
pub trait AsyncDuplex: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncDuplex for T {}

#[derive(Debug, Clone)]
pub enum Dialer {
    Direct,
    HttpConnect { proxy: String },
    Socks5 { proxy: String },
}

impl Dialer {
    /// Dial `target` ("host:port"), either directly or by negotiating the
    /// configured proxy, and return a connected duplex stream.
    pub async fn dial_tcp(&self, target: &str) -> io::Result<Box<dyn AsyncDuplex>> {
        match self {
            Dialer::Direct => Ok(Box::new(TcpStream::connect(target).await?)),
            Dialer::HttpConnect { proxy } => {
                let mut stream = TcpStream::connect(proxy).await?;
                let request = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n\r\n");
                stream.write_all(request.as_bytes()).await?;

                let status_line = read_http_status_line(&mut stream).await?;
                if !status_line.contains(" 200 ") {
                    return Err(io::Error::new(io::ErrorKind::ConnectionRefused, status_line));
                }
                Ok(Box::new(stream))
            }
            Dialer::Socks5 { proxy } => {
                let mut stream = TcpStream::connect(proxy).await?;
                socks5_handshake(&mut stream, target).await?;
                Ok(Box::new(stream))
            }
        }
    }
}

async fn read_http_status_line(stream: &mut TcpStream) -> io::Result<String> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        stream.read_exact(&mut byte).await?;
        if byte[0] == b'\n' {
            break;
        }
        line.push(byte[0]);
    }

    // Drain the remaining header block up to the blank line; the proxy's
    // reply headers carry nothing the agent needs.
    let mut blank_run = 0;
    loop {
        stream.read_exact(&mut byte).await?;
        if byte[0] == b'\r' {
            continue;
        }
        if byte[0] == b'\n' {
            blank_run += 1;
            if blank_run == 2 {
                break;
            }
        } else {
            blank_run = 0;
        }
    }

    Ok(String::from_utf8_lossy(&line).trim().to_string())
}

/// Minimal SOCKS5 client handshake (RFC 1928): no-auth negotiation followed
/// by a CONNECT request for `target`, parsed as "host:port".
async fn socks5_handshake(stream: &mut TcpStream, target: &str) -> io::Result<()> {
    let (host, port) = target
        .rsplit_once(':')
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "target missing port"))?;
    let port: u16 = port
        .parse()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid port"))?;

    stream.write_all(&[0x05, 0x01, 0x00]).await?;
    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await?;
    if reply != [0x05, 0x00] {
        return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "socks5 proxy rejected no-auth"));
    }

    let mut request = vec![0x05, 0x01, 0x00, 0x03, host.len() as u8];
    request.extend_from_slice(host.as_bytes());
    request.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&request).await?;

    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    if header[1] != 0x00 {
        return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "socks5 connect failed"));
    }

    let skip = match header[3] {
        0x01 => 4 + 2,
        0x03 => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            len[0] as usize + 2
        }
        0x04 => 16 + 2,
        _ => return Err(io::Error::new(io::ErrorKind::InvalidData, "unknown socks5 address type")),
    };
    let mut discard = vec![0u8; skip];
    stream.read_exact(&mut discard).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn direct_dial_reaches_a_local_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let dialer = Dialer::Direct;
        assert!(dialer.dial_tcp(&addr.to_string()).await.is_ok());
    }

    #[tokio::test]
    async fn http_connect_rejects_a_non_200_response() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut discard = [0u8; 256];
            let _ = socket.read(&mut discard).await;
            socket.write_all(b"HTTP/1.1 502 Bad Gateway\r\n\r\n").await.unwrap();
        });

        let dialer = Dialer::HttpConnect { proxy: addr.to_string() };
        let result = dialer.dial_tcp("example.com:443").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn socks5_handshake_rejects_a_proxy_that_refuses_no_auth() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut greeting = [0u8; 3];
            socket.read_exact(&mut greeting).await.unwrap();
            socket.write_all(&[0x05, 0xff]).await.unwrap();
        });

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let result = socks5_handshake(&mut stream, "example.com:443").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn socks5_handshake_rejects_a_target_without_a_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let result = socks5_handshake(&mut stream, "example.com").await;
        assert!(result.is_err());
    }
}
