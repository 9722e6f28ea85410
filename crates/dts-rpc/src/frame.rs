//! Framed transport: one fixed header, then the payload.

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use zerocopy::{AsBytes, FromBytes};

use dts_core::wire::{FrameHeader, FRAME_MAGIC, MAX_PAYLOAD, WIRE_VERSION};

pub const HEADER_LEN: usize = std::mem::size_of::<FrameHeader>();

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("bad frame magic {0:#010x}")]
    BadMagic(u32),
    #[error("unsupported wire version {0}")]
    BadVersion(u8),
    #[error("payload length {0} exceeds the {MAX_PAYLOAD}-byte limit")]
    TooLarge(u32),
}

/// Read one complete frame.
pub async fn read_frame<R>(reader: &mut R) -> Result<(FrameHeader, Bytes), FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut header_buf = [0u8; HEADER_LEN];
    reader.read_exact(&mut header_buf).await?;
    let header = FrameHeader::read_from(&header_buf[..])
        .expect("header buffer length equals header size");

    let magic = header.magic;
    if magic != FRAME_MAGIC {
        return Err(FrameError::BadMagic(magic));
    }
    let version = header.version;
    if version != WIRE_VERSION {
        return Err(FrameError::BadVersion(version));
    }
    let length = header.length;
    if length > MAX_PAYLOAD {
        return Err(FrameError::TooLarge(length));
    }

    let mut payload = vec![0u8; length as usize];
    reader.read_exact(&mut payload).await?;
    Ok((header, Bytes::from(payload)))
}

/// Write one complete frame and flush it.
pub async fn write_frame<W>(
    writer: &mut W,
    header: &FrameHeader,
    payload: &[u8],
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    debug_assert_eq!({ header.length } as usize, payload.len());
    writer.write_all(header.as_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use dts_core::wire::{MsgType, StatusCode};

    #[tokio::test]
    async fn frame_round_trip() {
        let payload = br#"{"task_id":"t-1"}"#;
        let header = FrameHeader::request(MsgType::QueryStatus, 9, payload.len() as u32);

        let mut buf = Vec::new();
        write_frame(&mut buf, &header, payload).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let (parsed, body) = read_frame(&mut cursor).await.unwrap();
        assert_eq!({ parsed.call_id }, 9);
        assert_eq!(parsed.op(), Some(MsgType::QueryStatus));
        assert_eq!(&body[..], payload);
    }

    #[tokio::test]
    async fn rejects_bad_magic() {
        let mut bad = FrameHeader::response(MsgType::SubmitTask, 1, StatusCode::Ok, 0);
        bad.magic = 0xdead_beef;
        let mut buf = Vec::new();
        write_frame(&mut buf, &bad, &[]).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        assert!(matches!(
            read_frame(&mut cursor).await,
            Err(FrameError::BadMagic(0xdead_beef))
        ));
    }

    #[tokio::test]
    async fn rejects_oversized_payload_without_reading_it() {
        let mut header = FrameHeader::request(MsgType::SubmitTask, 1, 0);
        header.length = MAX_PAYLOAD + 1;
        let mut buf = header.as_bytes().to_vec();
        buf.extend_from_slice(&[0u8; 8]);

        let mut cursor = std::io::Cursor::new(buf);
        assert!(matches!(
            read_frame(&mut cursor).await,
            Err(FrameError::TooLarge(_))
        ));
    }
}
