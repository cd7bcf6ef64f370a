//! Length-prefixed frames over a byte stream
//!
//! Every frame is a 4-byte big-endian length followed by that many bytes.
//! Envelopes travel as their bincode encoding inside one frame.

use bincode::{deserialize, serialize};
use shared::{Envelope, PeerId};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest accepted frame. Game state snapshots are the biggest payloads.
pub const MAX_FRAME: usize = 16 * 1024 * 1024;

pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> io::Result<()> {
    if payload.len() > MAX_FRAME {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("frame too large: {} bytes (max {})", payload.len(), MAX_FRAME),
        ));
    }
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    writer.write_all(&frame).await?;
    writer.flush().await
}

/// Reads one frame. A stream closed before or inside a frame yields
/// `UnexpectedEof`.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame too large: {} bytes (max {})", len, MAX_FRAME),
        ));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(payload)
}

pub async fn write_envelope<W: AsyncWrite + Unpin>(writer: &mut W, envelope: &Envelope) -> io::Result<()> {
    let bytes = envelope
        .encode()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    write_frame(writer, &bytes).await
}

pub async fn read_envelope<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Envelope> {
    let bytes = read_frame(reader).await?;
    Envelope::decode(&bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// First frame on a new connection: the peer id the hub assigned
pub async fn write_welcome<W: AsyncWrite + Unpin>(writer: &mut W, id: PeerId) -> io::Result<()> {
    let bytes = serialize(&id).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    write_frame(writer, &bytes).await
}

pub async fn read_welcome<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<PeerId> {
    let bytes = read_frame(reader).await?;
    deserialize(&bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{MessageKind, BROADCAST};
    use tokio_test::io::Builder;

    #[tokio::test]
    async fn test_write_frame_prefixes_length() {
        let mut mock = Builder::new().write(&[0, 0, 0, 3, b'a', b'b', b'c']).build();
        write_frame(&mut mock, b"abc").await.unwrap();
    }

    #[tokio::test]
    async fn test_read_frame_across_chunks() {
        let mut mock = Builder::new()
            .read(&[0, 0])
            .read(&[0, 5, b'h', b'e'])
            .read(b"llo")
            .build();
        assert_eq!(read_frame(&mut mock).await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_empty_frame() {
        let mut mock = Builder::new().read(&[0, 0, 0, 0]).build();
        assert!(read_frame(&mut mock).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let len = (MAX_FRAME as u32 + 1).to_be_bytes();
        let mut mock = Builder::new().read(&len).build();
        let err = read_frame(&mut mock).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);

        let big = vec![0u8; MAX_FRAME + 1];
        let mut sink = Vec::new();
        let err = write_frame(&mut sink, &big).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn test_truncated_frame_is_eof() {
        let mut mock = Builder::new().read(&[0, 0, 0, 9, 1, 2]).build();
        let err = read_frame(&mut mock).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn test_envelopes_in_sequence() {
        let first = Envelope::new(MessageKind::SyncRandom, BROADCAST, PeerId(2), vec![1, 2, 3, 4]);
        let second = Envelope::new(MessageKind::User(3), 4, PeerId::ADMIN, vec![]);

        let mut buf = Vec::new();
        write_welcome(&mut buf, PeerId(5)).await.unwrap();
        write_envelope(&mut buf, &first).await.unwrap();
        write_envelope(&mut buf, &second).await.unwrap();

        let mut reader = buf.as_slice();
        assert_eq!(read_welcome(&mut reader).await.unwrap(), PeerId(5));
        assert_eq!(read_envelope(&mut reader).await.unwrap(), first);
        assert_eq!(read_envelope(&mut reader).await.unwrap(), second);
    }

    #[tokio::test]
    async fn test_short_welcome_rejected() {
        let mut mock = Builder::new().read(&[0, 0, 0, 2, 1, 0]).build();
        let err = read_welcome(&mut mock).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_garbage_envelope_is_invalid_data() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &[0xff]).await.unwrap();
        let err = read_envelope(&mut buf.as_slice()).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
