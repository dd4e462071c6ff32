//! `Content-Length` framing shared by the proxy server and backend transport.
//!
//! A frame is a header block terminated by an empty line followed by exactly
//! `Content-Length` bytes of JSON:
//!
//! ```text
//! Content-Length: 52\r\n
//! \r\n
//! {"jsonrpc":"2.0","id":1,"method":"shutdown"}
//! ```

use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

/// Largest frame body accepted from a peer.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Longest header line accepted from a peer, terminator included.
pub const MAX_HEADER_LINE: usize = 8 * 1024;

const CONTENT_LENGTH: &str = "content-length";

/// Framing failures.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The underlying stream failed.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The header block is malformed or lacks `Content-Length`.
    #[error("invalid frame header: {0}")]
    InvalidHeader(String),

    /// The peer closed the stream in the middle of a frame.
    #[error("stream closed mid-frame")]
    UnexpectedEof,

    /// The body could not be serialized.
    #[error("failed to serialize message: {0}")]
    Serialize(#[source] serde_json::Error),
}

/// Read the body of the next frame.
///
/// Returns `Ok(None)` on a clean end of stream between frames.
///
/// # Errors
///
/// Returns an error on I/O failure, a malformed or overlong header, an
/// oversized body, or end of stream inside a frame.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Vec<u8>>, CodecError>
where
    R: AsyncBufRead + Unpin,
{
    let mut content_length = None;
    let mut saw_header = false;

    loop {
        let mut line = String::new();
        let read = (&mut *reader)
            .take(MAX_HEADER_LINE as u64)
            .read_line(&mut line)
            .await?;
        if read == 0 {
            return if saw_header {
                Err(CodecError::UnexpectedEof)
            } else {
                Ok(None)
            };
        }
        if !line.ends_with('\n') && read == MAX_HEADER_LINE {
            return Err(CodecError::InvalidHeader(format!(
                "header line exceeds {MAX_HEADER_LINE} bytes"
            )));
        }

        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            if saw_header {
                break;
            }
            // Tolerate blank lines between frames.
            continue;
        }
        saw_header = true;

        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| CodecError::InvalidHeader(line.to_string()))?;
        if name.trim().eq_ignore_ascii_case(CONTENT_LENGTH) {
            let length: usize = value.trim().parse().map_err(|_| {
                CodecError::InvalidHeader(format!("invalid Content-Length: {}", value.trim()))
            })?;
            content_length = Some(length);
        }
    }

    let length = content_length
        .ok_or_else(|| CodecError::InvalidHeader("missing Content-Length header".to_string()))?;
    if length > MAX_FRAME_SIZE {
        return Err(CodecError::InvalidHeader(format!(
            "Content-Length {length} exceeds {MAX_FRAME_SIZE}"
        )));
    }

    let mut body = vec![0u8; length];
    reader.read_exact(&mut body).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            CodecError::UnexpectedEof
        } else {
            CodecError::Io(e)
        }
    })?;
    trace!(body_len = length, "Read frame");
    Ok(Some(body))
}

/// Write `message` as one frame and flush.
///
/// # Errors
///
/// Returns an error if serialization or the write fails.
pub async fn write_message<W>(writer: &mut W, message: &Value) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let body = serde_json::to_vec(message).map_err(CodecError::Serialize)?;
    let header = format!("Content-Length: {}\r\n\r\n", body.len());

    trace!(body_len = body.len(), "Writing frame");

    writer.write_all(header.as_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::BufReader;

    fn frame(body: &str) -> String {
        format!("Content-Length: {}\r\n\r\n{body}", body.len())
    }

    #[tokio::test]
    async fn reads_consecutive_frames() {
        let input = format!("{}{}", frame(r#"{"id":1}"#), frame(r#"{"id":2}"#));
        let mut reader = BufReader::new(input.as_bytes());

        let first = read_frame(&mut reader).await.unwrap().unwrap();
        let second = read_frame(&mut reader).await.unwrap().unwrap();

        assert_eq!(first, br#"{"id":1}"#);
        assert_eq!(second, br#"{"id":2}"#);
        assert!(read_frame(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn header_name_is_case_insensitive_and_extra_headers_are_ignored() {
        let body = r#"{"id":3}"#;
        let input = format!(
            "content-length: {}\r\n\
             Content-Type: application/vscode-jsonrpc; charset=utf-8\r\n\r\n{body}",
            body.len()
        );
        let mut reader = BufReader::new(input.as_bytes());

        let read = read_frame(&mut reader).await.unwrap().unwrap();
        assert_eq!(read, body.as_bytes());
    }

    #[tokio::test]
    async fn missing_content_length_is_rejected() {
        let mut reader = BufReader::new("Content-Type: x\r\n\r\n{}".as_bytes());
        assert!(matches!(
            read_frame(&mut reader).await,
            Err(CodecError::InvalidHeader(_))
        ));
    }

    #[tokio::test]
    async fn truncated_body_is_unexpected_eof() {
        let mut reader = BufReader::new("Content-Length: 10\r\n\r\n{}".as_bytes());
        assert!(matches!(
            read_frame(&mut reader).await,
            Err(CodecError::UnexpectedEof)
        ));
    }

    #[tokio::test]
    async fn endless_header_line_is_rejected() {
        let input = "X".repeat(MAX_HEADER_LINE * 4);
        let mut reader = BufReader::new(input.as_bytes());

        let err = read_frame(&mut reader).await.unwrap_err();
        assert!(
            matches!(err, CodecError::InvalidHeader(ref m) if m.contains("exceeds")),
            "got {err:?}"
        );
    }

    #[tokio::test]
    async fn long_header_line_within_limit_is_accepted() {
        let body = "{}";
        let padding = "a".repeat(MAX_HEADER_LINE - 64);
        let input = format!("X-Padding: {padding}\r\nContent-Length: 2\r\n\r\n{body}");
        let mut reader = BufReader::new(input.as_bytes());

        let read = read_frame(&mut reader).await.unwrap().unwrap();
        assert_eq!(read, body.as_bytes());
    }

    #[tokio::test]
    async fn write_then_read_yields_same_message() {
        let message = json!({"jsonrpc": "2.0", "id": 7, "result": null});
        let mut buf = Vec::new();
        write_message(&mut buf, &message).await.unwrap();

        assert!(buf.starts_with(b"Content-Length: "));
        let mut reader = BufReader::new(buf.as_slice());
        let body = read_frame(&mut reader).await.unwrap().unwrap();
        let back: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(back, message);
    }
}
