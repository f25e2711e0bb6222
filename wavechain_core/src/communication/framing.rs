/// Length-prefixed JSON framing
///
/// Every message on a wavechain socket is a 4-byte little-endian length
/// followed by that many bytes of UTF-8 JSON.
use crate::error::{WaveError, WaveResult};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest accepted frame body
pub const MAX_FRAME_SIZE: usize = 65536;

/// Write one frame and flush
pub async fn write_frame<W>(writer: &mut W, text: &str) -> WaveResult<()>
where
    W: AsyncWrite + Unpin,
{
    let bytes = text.as_bytes();
    if bytes.len() > MAX_FRAME_SIZE {
        return Err(WaveError::protocol(format!(
            "Frame too large: {} bytes (max {})",
            bytes.len(),
            MAX_FRAME_SIZE
        )));
    }

    let len_bytes = (bytes.len() as u32).to_le_bytes();
    writer.write_all(&len_bytes).await?;
    writer.write_all(bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame; `Ok(None)` when the peer closed cleanly between frames
pub async fn read_frame<R>(reader: &mut R) -> WaveResult<Option<String>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buffer = [0u8; 4];
    match reader.read_exact(&mut len_buffer).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let frame_len = u32::from_le_bytes(len_buffer) as usize;
    if frame_len > MAX_FRAME_SIZE {
        return Err(WaveError::protocol(format!(
            "Frame too large: {} bytes (max {})",
            frame_len, MAX_FRAME_SIZE
        )));
    }

    let mut buffer = vec![0u8; frame_len];
    reader.read_exact(&mut buffer).await?;

    String::from_utf8(buffer)
        .map(Some)
        .map_err(|e| WaveError::protocol(format!("Frame is not UTF-8: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_layout() {
        let mut out = Vec::new();
        write_frame(&mut out, "{}").await.unwrap();
        assert_eq!(out, vec![2, 0, 0, 0, b'{', b'}']);
    }

    #[tokio::test]
    async fn test_read_back_and_clean_eof() {
        let mut out = Vec::new();
        write_frame(&mut out, r#"{"type":"ack"}"#).await.unwrap();
        write_frame(&mut out, r#"{"type":"status_request"}"#).await.unwrap();

        let mut reader = out.as_slice();
        assert_eq!(
            read_frame(&mut reader).await.unwrap().as_deref(),
            Some(r#"{"type":"ack"}"#)
        );
        assert!(read_frame(&mut reader).await.unwrap().is_some());
        assert!(read_frame(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let header = ((MAX_FRAME_SIZE + 1) as u32).to_le_bytes();
        let mut reader = &header[..];
        let err = read_frame(&mut reader).await.unwrap_err();
        assert!(matches!(err, WaveError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_truncated_body_is_io_error() {
        let data = [10u8, 0, 0, 0, b'{'];
        let mut reader = &data[..];
        assert!(matches!(
            read_frame(&mut reader).await,
            Err(WaveError::Io(_))
        ));
    }
}
