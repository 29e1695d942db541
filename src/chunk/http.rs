//! HTTP/1.1 chunked-transfer disguise
//!
//! The body uses standard chunked transfer coding; the envelope is a
//! literal request (client) or response (server) header block, so an
//! observer that only inspects the envelope sees ordinary HTTP.

use super::{
    find_crlf, ChunkDecoder, ChunkEncoder, ChunkError, ChunkHeader, Preamble, StreamRole,
    MAX_CHUNK_LINE_LEN, MAX_HTTP_HEADER_SIZE,
};
use crate::crypto::random_guid;
use bytes::{Buf, BufMut, BytesMut};

const TERMINAL_CHUNK: &[u8] = b"0\r\n\r\n";

/// HTTP envelope + chunk encoder
#[derive(Debug)]
pub struct HttpEncoder {
    role: StreamRole,
    host: String,
}

impl HttpEncoder {
    pub fn new(role: StreamRole, host: impl Into<String>) -> Self {
        Self {
            role,
            host: host.into(),
        }
    }
}

impl ChunkEncoder for HttpEncoder {
    fn encode_preamble(&mut self, keep_alive: bool, out: &mut BytesMut) -> Result<(), ChunkError> {
        let start_line = match self.role {
            StreamRole::Client => format!(
                "POST /{} HTTP/1.1\r\nHost: {}\r\n",
                random_guid()?,
                self.host
            ),
            StreamRole::Server => "HTTP/1.1 200 OK\r\n".to_string(),
        };

        out.put_slice(start_line.as_bytes());
        out.put_slice(b"Content-Type: application/octet-stream\r\n");
        out.put_slice(b"Cache-Control: no-store\r\n");
        out.put_slice(b"Transfer-Encoding: chunked\r\n");
        out.put_slice(if keep_alive {
            b"Connection: keep-alive\r\n".as_slice()
        } else {
            b"Connection: close\r\n".as_slice()
        });
        out.put_slice(b"\r\n");
        Ok(())
    }

    fn encode_chunk(&mut self, payload: &[u8], out: &mut BytesMut) -> Result<(), ChunkError> {
        let line = format!("{:x}\r\n", payload.len());
        out.reserve(line.len() + payload.len() + 2);
        out.put_slice(line.as_bytes());
        out.put_slice(payload);
        out.put_slice(b"\r\n");
        Ok(())
    }

    fn encode_terminal(&mut self, out: &mut BytesMut) -> Result<(), ChunkError> {
        out.put_slice(TERMINAL_CHUNK);
        Ok(())
    }
}

/// HTTP envelope + chunk decoder
#[derive(Debug)]
pub struct HttpDecoder {
    role: StreamRole,
}

impl HttpDecoder {
    pub fn new(role: StreamRole) -> Self {
        Self { role }
    }

    fn check_start_line(&self, line: &str) -> Result<(), ChunkError> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let valid = match self.role {
            // Server reads the client's request line
            StreamRole::Server => parts.len() == 3 && parts[2].starts_with("HTTP/1."),
            // Client reads the server's status line
            StreamRole::Client => {
                parts.len() >= 2 && parts[0].starts_with("HTTP/1.") && parts[1] == "200"
            }
        };

        if valid {
            Ok(())
        } else {
            Err(ChunkError::InvalidHeader(format!("unexpected start line: {}", line)))
        }
    }
}

impl ChunkDecoder for HttpDecoder {
    fn decode_preamble(&mut self, buf: &mut BytesMut) -> Result<Option<Preamble>, ChunkError> {
        let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") else {
            if buf.len() > MAX_HTTP_HEADER_SIZE {
                return Err(ChunkError::HeaderTooLarge(MAX_HTTP_HEADER_SIZE));
            }
            return Ok(None);
        };
        if end > MAX_HTTP_HEADER_SIZE {
            return Err(ChunkError::HeaderTooLarge(MAX_HTTP_HEADER_SIZE));
        }

        let block = std::str::from_utf8(&buf[..end])
            .map_err(|_| ChunkError::InvalidHeader("non-UTF-8 HTTP header".to_string()))?;
        let mut lines = block.split("\r\n");
        self.check_start_line(lines.next().unwrap_or_default())?;

        let mut keep_alive = true;
        for line in lines {
            let (key, value) = line
                .split_once(':')
                .ok_or_else(|| ChunkError::InvalidHeader(format!("malformed header: {}", line)))?;

            if key.trim().eq_ignore_ascii_case("connection") {
                keep_alive = !value.trim().eq_ignore_ascii_case("close");
            }
        }

        buf.advance(end + 4);
        Ok(Some(Preamble { keep_alive }))
    }

    fn decode_header(&mut self, buf: &mut BytesMut) -> Result<Option<ChunkHeader>, ChunkError> {
        let Some(end) = find_crlf(buf) else {
            if buf.len() > MAX_CHUNK_LINE_LEN {
                return Err(ChunkError::HeaderTooLarge(MAX_CHUNK_LINE_LEN));
            }
            return Ok(None);
        };
        if end > MAX_CHUNK_LINE_LEN {
            return Err(ChunkError::HeaderTooLarge(MAX_CHUNK_LINE_LEN));
        }

        let line = std::str::from_utf8(&buf[..end])
            .map_err(|_| ChunkError::InvalidHeader("non-UTF-8 chunk size".to_string()))?;
        // Chunk extensions are tolerated and ignored
        let size = line.split(';').next().unwrap_or_default().trim();
        let len = usize::from_str_radix(size, 16)
            .map_err(|_| ChunkError::InvalidHeader(format!("bad chunk size: {:?}", size)))?;

        if len > 0 {
            buf.advance(end + 2);
            return Ok(Some(ChunkHeader::Data {
                len,
                encrypted: false,
            }));
        }

        // Terminal chunk: size line followed by the empty trailer line
        if buf.len() < end + 4 {
            return Ok(None);
        }
        if &buf[end + 2..end + 4] != b"\r\n" {
            return Err(ChunkError::InvalidHeader(
                "trailer headers are not supported".to_string(),
            ));
        }
        buf.advance(end + 4);
        Ok(Some(ChunkHeader::Terminal))
    }

    fn decode_trailer(&mut self, buf: &mut BytesMut) -> Result<Option<()>, ChunkError> {
        if buf.len() < 2 {
            return Ok(None);
        }
        if &buf[..2] != b"\r\n" {
            return Err(ChunkError::InvalidHeader(
                "missing chunk terminator".to_string(),
            ));
        }
        buf.advance(2);
        Ok(Some(()))
    }
}
