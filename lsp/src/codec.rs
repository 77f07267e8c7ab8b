//! `Content-Length` framing for JSON-RPC over a byte stream.
//!
//! Every message is `Content-Length: N\r\n\r\n` followed by `N` bytes of
//! JSON. [`FrameReader`] and [`FrameWriter`] wrap the child's stdout/stdin.

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

/// Upper bound on a single frame body (4 MiB).
pub const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("i/o error on language server stream")]
    Io(#[from] std::io::Error),
    #[error("stream ended inside a header block")]
    TruncatedHeaders,
    #[error("header block has no Content-Length")]
    MissingContentLength,
    #[error("invalid Content-Length value {0:?}")]
    InvalidContentLength(String),
    #[error("frame of {0} bytes exceeds the {MAX_FRAME_BYTES} byte limit")]
    Oversized(usize),
    #[error("frame body is not valid JSON")]
    Json(#[from] serde_json::Error),
}

pub struct FrameReader<R> {
    inner: BufReader<R>,
    line: String,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            inner: BufReader::new(reader),
            line: String::new(),
        }
    }

    /// Next frame, or `Ok(None)` when the peer closed the stream between
    /// frames.
    pub async fn read_frame(&mut self) -> Result<Option<serde_json::Value>, CodecError> {
        let Some(len) = self.content_length().await? else {
            return Ok(None);
        };
        if len > MAX_FRAME_BYTES {
            return Err(CodecError::Oversized(len));
        }

        let mut body = vec![0u8; len];
        self.inner.read_exact(&mut body).await?;
        Ok(Some(serde_json::from_slice(&body)?))
    }

    async fn content_length(&mut self) -> Result<Option<usize>, CodecError> {
        let mut len = None;
        let mut started = false;

        loop {
            self.line.clear();
            if self.inner.read_line(&mut self.line).await? == 0 {
                // EOF is only clean before the first header byte.
                return if started {
                    Err(CodecError::TruncatedHeaders)
                } else {
                    Ok(None)
                };
            }
            started = true;

            let header = self.line.trim();
            if header.is_empty() {
                break;
            }
            let Some((name, value)) = header.split_once(':') else {
                continue;
            };
            if name.trim().eq_ignore_ascii_case("Content-Length") {
                let value = value.trim();
                len = Some(
                    value
                        .parse()
                        .map_err(|_| CodecError::InvalidContentLength(value.to_string()))?,
                );
            }
        }

        len.map(Some).ok_or(CodecError::MissingContentLength)
    }
}

pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { inner: writer }
    }

    pub async fn write_frame(&mut self, message: &serde_json::Value) -> Result<(), CodecError> {
        let body = serde_json::to_vec(message)?;
        let header = format!("Content-Length: {}\r\n\r\n", body.len());
        self.inner.write_all(header.as_bytes()).await?;
        self.inner.write_all(&body).await?;
        self.inner.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn framed(body: &str) -> Vec<u8> {
        format!("Content-Length: {}\r\n\r\n{body}", body.len()).into_bytes()
    }

    #[tokio::test]
    async fn writer_output_is_readable() {
        let first = serde_json::json!({"jsonrpc": "2.0", "method": "initialized", "params": {}});
        let second = serde_json::json!({"jsonrpc": "2.0", "id": 7, "result": null});

        let mut buf = Vec::new();
        let mut writer = FrameWriter::new(&mut buf);
        writer.write_frame(&first).await.unwrap();
        writer.write_frame(&second).await.unwrap();

        let mut reader = FrameReader::new(buf.as_slice());
        assert_eq!(reader.read_frame().await.unwrap().unwrap(), first);
        assert_eq!(reader.read_frame().await.unwrap().unwrap(), second);
        assert!(reader.read_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn clean_eof_yields_none() {
        let mut reader = FrameReader::new(&b""[..]);
        assert!(reader.read_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn eof_inside_headers_is_an_error() {
        let mut reader = FrameReader::new(&b"Content-Length: 10\r\n"[..]);
        assert!(matches!(
            reader.read_frame().await,
            Err(CodecError::TruncatedHeaders)
        ));
    }

    #[tokio::test]
    async fn header_name_is_case_insensitive_and_extras_ignored() {
        let body = r#"{"id":1}"#;
        let raw = format!(
            "content-type: application/vscode-jsonrpc; charset=utf-8\r\ncontent-length: {}\r\n\r\n{body}",
            body.len()
        );
        let mut reader = FrameReader::new(raw.as_bytes());
        assert_eq!(reader.read_frame().await.unwrap().unwrap()["id"], 1);
    }

    #[tokio::test]
    async fn missing_length_is_rejected() {
        let mut reader = FrameReader::new(&b"Content-Type: x\r\n\r\n{}"[..]);
        assert!(matches!(
            reader.read_frame().await,
            Err(CodecError::MissingContentLength)
        ));
    }

    #[tokio::test]
    async fn garbage_length_is_rejected() {
        let mut reader = FrameReader::new(&b"Content-Length: lots\r\n\r\n"[..]);
        assert!(matches!(
            reader.read_frame().await,
            Err(CodecError::InvalidContentLength(v)) if v == "lots"
        ));
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected_before_reading_body() {
        let raw = format!("Content-Length: {}\r\n\r\n", MAX_FRAME_BYTES + 1);
        let mut reader = FrameReader::new(raw.as_bytes());
        assert!(matches!(
            reader.read_frame().await,
            Err(CodecError::Oversized(_))
        ));
    }

    #[tokio::test]
    async fn short_body_is_an_io_error() {
        let mut reader = FrameReader::new(&b"Content-Length: 100\r\n\r\n{}"[..]);
        assert!(matches!(reader.read_frame().await, Err(CodecError::Io(_))));
    }

    #[tokio::test]
    async fn length_counts_bytes_not_chars() {
        let raw = framed(r#"{"msg":"E0308: mismatched types é"}"#);
        let mut reader = FrameReader::new(raw.as_slice());
        let frame = reader.read_frame().await.unwrap().unwrap();
        assert!(frame["msg"].as_str().unwrap().ends_with('é'));
    }
}
