//! Length-prefixed frames: a little-endian `u32` length followed by the bytes.

use anyhow::{bail, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest frame either side will accept.
pub const MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

pub async fn write_frame<W>(stream: &mut W, data: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    if data.len() > MAX_FRAME_LEN {
        bail!("frame of {} bytes exceeds limit of {MAX_FRAME_LEN}", data.len());
    }
    stream.write_u32_le(data.len() as u32).await?;
    stream.write_all(data).await?;
    Ok(())
}

/// Read one frame. `Ok(None)` means the stream ended cleanly before a new
/// frame started.
pub async fn read_frame<R>(stream: &mut R) -> Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let len = match stream.read_u32_le().await {
        Ok(v) => v as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Ok(None);
        }
        Err(e) => return Err(e.into()),
    };
    if len > MAX_FRAME_LEN {
        bail!("peer announced a {len} byte frame, limit is {MAX_FRAME_LEN}");
    }

    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_arrive_in_order() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, b"first").await.expect("write");
        write_frame(&mut a, b"").await.expect("write");
        drop(a);

        assert_eq!(read_frame(&mut b).await.expect("read"), Some(b"first".to_vec()));
        assert_eq!(read_frame(&mut b).await.expect("read"), Some(Vec::new()));
        assert_eq!(read_frame(&mut b).await.expect("read"), None);
    }

    #[tokio::test]
    async fn oversized_length_is_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_u32_le((MAX_FRAME_LEN + 1) as u32).await.expect("write");
        assert!(read_frame(&mut b).await.is_err());
    }

    #[tokio::test]
    async fn truncated_frame_is_an_error() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_u32_le(10).await.expect("write");
        a.write_all(b"abc").await.expect("write");
        drop(a);
        assert!(read_frame(&mut b).await.is_err());
    }
}
