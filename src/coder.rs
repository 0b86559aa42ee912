//! Value coders bound to a connection.
//!
//! Two interchangeable encodings are offered. [`Coder::Binary`] frames each
//! value as a 4-byte big-endian length followed by a bincode payload.
//! [`Coder::Json`] writes one compact JSON document per line, which keeps the
//! stream readable with ordinary text tools.

use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest binary frame accepted from a peer.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Encoding used for typed values on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Coder {
    /// Length-prefixed bincode.
    #[default]
    Binary,
    /// Newline-delimited JSON.
    Json,
}

impl Coder {
    /// Short name used in endpoint paths and logs.
    pub fn name(&self) -> &'static str {
        match self {
            Coder::Binary => "binary",
            Coder::Json => "JSON",
        }
    }

    /// Serialize `value` into a ready-to-write frame.
    pub fn to_frame<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>> {
        match self {
            Coder::Binary => {
                let payload =
                    bincode::serialize(value).map_err(|e| Error::Encode(e.to_string()))?;
                if payload.len() > MAX_FRAME_SIZE {
                    return Err(Error::Encode(format!(
                        "frame of {} bytes exceeds limit of {}",
                        payload.len(),
                        MAX_FRAME_SIZE
                    )));
                }
                let mut frame = Vec::with_capacity(4 + payload.len());
                frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
                frame.extend_from_slice(&payload);
                Ok(frame)
            }
            Coder::Json => {
                let mut frame =
                    serde_json::to_vec(value).map_err(|e| Error::Encode(e.to_string()))?;
                frame.push(b'\n');
                Ok(frame)
            }
        }
    }

    /// Write one value. The writer is not flushed.
    pub async fn encode<W, T>(&self, writer: &mut W, value: &T) -> Result<()>
    where
        W: AsyncWrite + Unpin + ?Sized,
        T: Serialize + ?Sized,
    {
        let frame = self.to_frame(value)?;
        writer.write_all(&frame).await?;
        Ok(())
    }

    /// Read one value.
    ///
    /// End of stream before a complete value is reported as an I/O error so
    /// that callers can distinguish a vanished peer from a malformed value.
    pub async fn decode<R, T>(&self, reader: &mut R) -> Result<T>
    where
        R: AsyncBufRead + Unpin + ?Sized,
        T: DeserializeOwned,
    {
        match self {
            Coder::Binary => {
                let mut len_buf = [0u8; 4];
                reader.read_exact(&mut len_buf).await?;
                let len = u32::from_be_bytes(len_buf) as usize;
                if len > MAX_FRAME_SIZE {
                    return Err(Error::Decode(format!(
                        "frame of {} bytes exceeds limit of {}",
                        len, MAX_FRAME_SIZE
                    )));
                }
                let mut payload = vec![0u8; len];
                reader.read_exact(&mut payload).await?;
                bincode::deserialize(&payload).map_err(|e| Error::Decode(e.to_string()))
            }
            Coder::Json => {
                let mut line = Vec::new();
                loop {
                    line.clear();
                    let n = reader.read_until(b'\n', &mut line).await?;
                    if n == 0 {
                        return Err(Error::Io(std::io::Error::new(
                            std::io::ErrorKind::UnexpectedEof,
                            "connection closed while waiting for JSON value",
                        )));
                    }
                    if line.len() > MAX_FRAME_SIZE {
                        return Err(Error::Decode("JSON value too large".into()));
                    }
                    if line.iter().all(|b| b.is_ascii_whitespace()) {
                        continue;
                    }
                    return serde_json::from_slice(&line)
                        .map_err(|e| Error::Decode(e.to_string()));
                }
            }
        }
    }
}

impl fmt::Display for Coder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tokio::io::BufReader;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Update {
        name: String,
        sequence: u64,
        tags: Vec<String>,
    }

    fn sample() -> Update {
        Update {
            name: "image/base".into(),
            sequence: 42,
            tags: vec!["a".into(), "b".into()],
        }
    }

    #[tokio::test]
    async fn test_json_frames_are_single_lines() {
        let frame = Coder::Json.to_frame(&sample()).unwrap();
        assert_eq!(frame.last(), Some(&b'\n'));
        assert_eq!(frame.iter().filter(|b| **b == b'\n').count(), 1);
    }

    #[tokio::test]
    async fn test_stream_of_values_decodes_in_order() {
        for coder in [Coder::Binary, Coder::Json] {
            let mut buf = Vec::new();
            coder.encode(&mut buf, &sample()).await.unwrap();
            coder.encode(&mut buf, &7u32).await.unwrap();
            let mut reader = BufReader::new(Cursor::new(buf));
            let first: Update = coder.decode(&mut reader).await.unwrap();
            let second: u32 = coder.decode(&mut reader).await.unwrap();
            assert_eq!(first, sample(), "coder {coder}");
            assert_eq!(second, 7);
        }
    }

    #[tokio::test]
    async fn test_json_skips_blank_lines() {
        let mut reader = BufReader::new(Cursor::new(b"\n  \n{\"name\":\"x\",\"sequence\":1,\"tags\":[]}\n".to_vec()));
        let update: Update = Coder::Json.decode(&mut reader).await.unwrap();
        assert_eq!(update.name, "x");
    }

    #[tokio::test]
    async fn test_truncated_binary_frame_is_io_error() {
        let mut frame = Coder::Binary.to_frame(&sample()).unwrap();
        frame.truncate(frame.len() - 3);
        let mut reader = BufReader::new(Cursor::new(frame));
        let err = Coder::Binary.decode::<_, Update>(&mut reader).await.unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }

    #[tokio::test]
    async fn test_oversized_length_prefix_is_rejected() {
        let frame = ((MAX_FRAME_SIZE + 1) as u32).to_be_bytes().to_vec();
        let mut reader = BufReader::new(Cursor::new(frame));
        let err = Coder::Binary.decode::<_, Update>(&mut reader).await.unwrap_err();
        assert!(err.is_decode());
    }

    #[tokio::test]
    async fn test_wrong_shape_is_decode_error() {
        let mut reader = BufReader::new(Cursor::new(b"{\"unexpected\":true}\n".to_vec()));
        let err = Coder::Json.decode::<_, Update>(&mut reader).await.unwrap_err();
        assert!(err.is_decode());
    }
}
