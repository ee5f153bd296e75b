//! HTTP CONNECT upstream client, with optional Basic proxy-auth.

use crate::error::DialError;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const MAX_HEADER_BYTES: usize = 16 * 1024;

/// Send a CONNECT request for `host:port` and require a `200` response.
///
/// `auth_header` is a prebuilt `Proxy-Authorization` value (`Basic …`).
/// Generic over the stream so the same path serves plain TCP and TLS.
/// The response header is consumed byte-by-byte up to the blank line, so
/// any tunneled bytes the proxy sends right after it stay on the stream.
pub async fn connect<S>(
    stream: &mut S,
    host: &str,
    port: u16,
    auth_header: Option<&str>,
) -> Result<(), DialError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let target = format!("{}:{}", host, port);
    let mut request = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n");
    if let Some(value) = auth_header {
        request.push_str(&format!("Proxy-Authorization: {}\r\n", value));
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;

    let status_line = read_response_header(stream).await?;

    // Strict: exactly 200. Other 2xx codes are rejected too.
    let status = status_line
        .split(' ')
        .nth(1)
        .ok_or_else(|| malformed("malformed HTTP status line"))?;
    if status != "200" {
        let reason = match status_line.split_once(' ') {
            Some((_, rest)) => rest.to_string(),
            None => status_line,
        };
        return Err(DialError::ProxyRejected(reason));
    }
    Ok(())
}

/// Read up to and including `\r\n\r\n`, one byte at a time, and return the
/// status line.
async fn read_response_header<S>(stream: &mut S) -> Result<String, DialError>
where
    S: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        stream.read_exact(&mut byte).await?;
        buf.push(byte[0]);
        if buf.ends_with(b"\r\n\r\n") {
            break;
        }
        if buf.len() > MAX_HEADER_BYTES {
            return Err(malformed("HTTP response header too large"));
        }
    }

    let header = String::from_utf8_lossy(&buf);
    let status_line = header
        .split("\r\n")
        .next()
        .unwrap_or_default()
        .to_string();
    if status_line.is_empty() {
        return Err(malformed("empty HTTP response"));
    }
    Ok(status_line)
}

fn malformed(msg: &'static str) -> DialError {
    DialError::Io(io::Error::new(io::ErrorKind::InvalidData, msg))
}
