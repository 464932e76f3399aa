//! Async read/write helpers for [`Envelope`] over any multiplexed stream.
//! Both the agent and the server's packet pipeline exchange envelopes the
//! same way regardless of which side opened the stream, so this lives here
//! rather than being duplicated in each binary.

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{Envelope, Error, HEADER_SIZE, Opcode, Payload};

/// Encode and write one envelope, flushing nothing (callers that need a
/// flush before waiting on a reply should call it explicitly).
pub async fn write_envelope<W: AsyncWrite + Unpin>(w: &mut W, envelope: &Envelope) -> Result<(), Error> {
    let mut buf = BytesMut::new();
    envelope.encode(&mut buf)?;
    w.write_all(&buf).await?;
    Ok(())
}

/// Read exactly one envelope, blocking until the header and then the full
/// payload have arrived.
pub async fn read_envelope<R: AsyncRead + Unpin>(r: &mut R) -> Result<Envelope, Error> {
    let mut header = [0u8; HEADER_SIZE];
    r.read_exact(&mut header).await?;

    let opcode = Opcode::try_from(header[0])?;
    let size = i32::from_be_bytes(header[1..5].try_into().unwrap()).max(0) as usize;

    let mut body = vec![0u8; size];
    r.read_exact(&mut body).await?;

    let payload = Payload::decode(opcode, &body)?;
    Ok(Envelope { opcode, payload })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_over_a_duplex_pipe() {
        let (mut a, mut b) = tokio::io::duplex(256);

        let sent = Envelope::new(Payload::HostPingRequest { address: "10.0.0.1".into() });
        write_envelope(&mut a, &sent).await.unwrap();

        let received = read_envelope(&mut b).await.unwrap();
        assert_eq!(sent, received);
    }
}
