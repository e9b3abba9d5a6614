//! Content-Length message framing for JSON messages over stream sockets.
//!
//! This module implements HTTP-style Content-Length framing, the same protocol
//! used by the Language Server Protocol (LSP). This enables reliable message
//! boundaries over stream-oriented sockets.
//!
//! # Wire Format
//!
//! ```text
//! Content-Length: <length>\r\n
//! \r\n
//! <message-body>
//! ```
//!
//! The header parsing is case-insensitive and handles both CRLF and LF line endings.

use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum message size (100MB) to prevent OOM from malicious/buggy peers.
pub const MAX_MESSAGE_SIZE: usize = 100 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum FramingError {
    /// The peer closed the stream before a new message started.
    #[error("Connection closed by peer")]
    Closed,

    #[error("Missing Content-Length header")]
    MissingContentLength,

    #[error("Invalid Content-Length value: {0}")]
    InvalidContentLength(String),

    #[error("Message size {size} exceeds maximum {max} bytes")]
    TooLarge { size: usize, max: usize },

    #[error("Message body is not valid UTF-8")]
    InvalidUtf8(#[source] std::string::FromUtf8Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FramingError {
    /// Whether the stream can no longer be used after this error.
    ///
    /// Only a bad body leaves the stream positioned at the next message.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, FramingError::InvalidUtf8(_))
    }
}

/// Read a Content-Length framed message from the stream.
///
/// # Protocol
///
/// 1. Read headers until an empty line (handles both CRLF and LF)
/// 2. Extract Content-Length header (case-insensitive)
/// 3. Read exactly that many bytes for the body
///
/// Returns `FramingError::Closed` on a clean EOF before any header byte.
pub async fn read_message<R>(reader: &mut R) -> Result<String, FramingError>
where
    R: AsyncBufRead + Unpin,
{
    let mut content_length: Option<usize> = None;
    let mut saw_header = false;

    loop {
        let mut line = String::new();
        let bytes_read = reader.read_line(&mut line).await?;

        if bytes_read == 0 {
            return Err(if saw_header {
                FramingError::Io(std::io::ErrorKind::UnexpectedEof.into())
            } else {
                FramingError::Closed
            });
        }
        saw_header = true;

        let trimmed = line.trim();

        // Empty line signals end of headers
        if trimmed.is_empty() {
            break;
        }

        if let Some((key, value)) = trimmed.split_once(':') {
            if key.trim().eq_ignore_ascii_case("Content-Length") {
                let value = value.trim();
                content_length = Some(
                    value
                        .parse()
                        .map_err(|_| FramingError::InvalidContentLength(value.to_string()))?,
                );
            }
            // Ignore other headers (e.g., Content-Type)
        }
    }

    let size = content_length.ok_or(FramingError::MissingContentLength)?;

    if size > MAX_MESSAGE_SIZE {
        return Err(FramingError::TooLarge {
            size,
            max: MAX_MESSAGE_SIZE,
        });
    }

    let mut body = vec![0u8; size];
    reader.read_exact(&mut body).await?;

    String::from_utf8(body).map_err(FramingError::InvalidUtf8)
}

/// Write a Content-Length framed message to the stream and flush it.
pub async fn write_message<W>(writer: &mut W, body: &str) -> Result<(), FramingError>
where
    W: AsyncWrite + Unpin,
{
    let body_bytes = body.as_bytes();
    let header = format!("Content-Length: {}\r\n\r\n", body_bytes.len());

    writer.write_all(header.as_bytes()).await?;
    writer.write_all(body_bytes).await?;
    writer.flush().await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::BufReader;
    use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
    use tokio::net::UnixStream;
    use tokio::time::timeout;

    /// Test timeout to prevent hanging tests.
    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    /// Create a connected pair of Unix sockets for testing.
    /// Returns (server_read, server_write, client_read, client_write)
    /// The server_read reads what client_write writes, and vice versa.
    fn socket_pair() -> (OwnedReadHalf, OwnedWriteHalf, OwnedReadHalf, OwnedWriteHalf) {
        let (stream_a, stream_b) = UnixStream::pair().expect("Failed to create socket pair");
        let (a_read, a_write) = stream_a.into_split();
        let (b_read, b_write) = stream_b.into_split();
        (a_read, a_write, b_read, b_write)
    }

    async fn read_with_timeout(
        reader: &mut BufReader<OwnedReadHalf>,
    ) -> Result<String, FramingError> {
        timeout(TEST_TIMEOUT, read_message(reader))
            .await
            .expect("Test timed out")
    }

    #[tokio::test]
    async fn test_write_read_roundtrip() {
        let (server_read, _server_write, _client_read, mut client_write) = socket_pair();

        let first = r#"{"type":"command","id":1,"command":{"name":"PING"}}"#;
        let second = r#"{"type":"done"}"#;
        write_message(&mut client_write, first).await.expect("Write failed");
        write_message(&mut client_write, second).await.expect("Write failed");

        let mut reader = BufReader::new(server_read);
        assert_eq!(read_with_timeout(&mut reader).await.unwrap(), first);
        assert_eq!(read_with_timeout(&mut reader).await.unwrap(), second);
    }

    #[tokio::test]
    async fn test_read_missing_content_length() {
        let (server_read, _server_write, _client_read, mut client_write) = socket_pair();

        client_write
            .write_all(b"Content-Type: application/json\r\n\r\n")
            .await
            .expect("Write failed");

        let mut reader = BufReader::new(server_read);
        let result = read_with_timeout(&mut reader).await;
        assert!(matches!(result, Err(FramingError::MissingContentLength)));
    }

    #[tokio::test]
    async fn test_read_handles_lf_only() {
        let (server_read, _server_write, _client_read, mut client_write) = socket_pair();

        let body = r#"{"status":"ok"}"#;
        let raw = format!("Content-Length: {}\n\n{}", body.len(), body);
        client_write
            .write_all(raw.as_bytes())
            .await
            .expect("Write failed");

        let mut reader = BufReader::new(server_read);
        assert_eq!(read_with_timeout(&mut reader).await.unwrap(), body);
    }

    #[tokio::test]
    async fn test_read_case_insensitive_header() {
        let (server_read, _server_write, _client_read, mut client_write) = socket_pair();

        let body = r#"{"status":"ok"}"#;
        let raw = format!("content-length: {}\r\n\r\n{}", body.len(), body);
        client_write
            .write_all(raw.as_bytes())
            .await
            .expect("Write failed");

        let mut reader = BufReader::new(server_read);
        assert_eq!(read_with_timeout(&mut reader).await.unwrap(), body);
    }

    #[tokio::test]
    async fn test_read_invalid_content_length() {
        let (server_read, _server_write, _client_read, mut client_write) = socket_pair();

        client_write
            .write_all(b"Content-Length: lots\r\n\r\n")
            .await
            .expect("Write failed");

        let mut reader = BufReader::new(server_read);
        match read_with_timeout(&mut reader).await {
            Err(FramingError::InvalidContentLength(value)) => assert_eq!(value, "lots"),
            other => panic!("Expected InvalidContentLength, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_read_rejects_oversized_message() {
        let (server_read, _server_write, _client_read, mut client_write) = socket_pair();

        let raw = format!("Content-Length: {}\r\n\r\n", MAX_MESSAGE_SIZE + 1);
        client_write
            .write_all(raw.as_bytes())
            .await
            .expect("Write failed");

        let mut reader = BufReader::new(server_read);
        let err = read_with_timeout(&mut reader).await.unwrap_err();
        assert!(err.to_string().contains("exceeds maximum"), "got: {}", err);
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_invalid_utf8_body_is_recoverable() {
        let (server_read, _server_write, _client_read, mut client_write) = socket_pair();

        client_write
            .write_all(b"Content-Length: 2\r\n\r\n\xff\xfe")
            .await
            .expect("Write failed");
        write_message(&mut client_write, "{}").await.expect("Write failed");

        let mut reader = BufReader::new(server_read);
        let err = read_with_timeout(&mut reader).await.unwrap_err();
        assert!(matches!(err, FramingError::InvalidUtf8(_)));
        assert!(!err.is_fatal());

        // The next message is still readable.
        assert_eq!(read_with_timeout(&mut reader).await.unwrap(), "{}");
    }

    #[tokio::test]
    async fn test_connection_closed_returns_closed() {
        let (server_read, _server_write, _client_read, client_write) = socket_pair();

        drop(client_write);

        let mut reader = BufReader::new(server_read);
        assert!(matches!(
            read_with_timeout(&mut reader).await,
            Err(FramingError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_eof_inside_headers_is_io_error() {
        let (server_read, _server_write, _client_read, mut client_write) = socket_pair();

        client_write
            .write_all(b"Content-Length: 10\r\n")
            .await
            .expect("Write failed");
        drop(client_write);

        let mut reader = BufReader::new(server_read);
        assert!(matches!(
            read_with_timeout(&mut reader).await,
            Err(FramingError::Io(_))
        ));
    }
}
