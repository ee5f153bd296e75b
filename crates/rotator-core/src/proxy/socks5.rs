//! SOCKS5 upstream client (RFC 1928 + RFC 1929).

use crate::error::DialError;
use std::net::IpAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

// Version
pub const VERSION: u8 = 5;

// Auth methods
pub const METHOD_NO_AUTH: u8 = 0x00;
pub const METHOD_USER_PASS: u8 = 0x02;

// Address types
pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

// Commands
pub const CMD_CONNECT: u8 = 0x01;

// Reply codes
pub const REP_SUCCESS: u8 = 0x00;
pub const REP_GENERAL_FAILURE: u8 = 0x01;
pub const REP_NOT_ALLOWED: u8 = 0x02;
pub const REP_NET_UNREACHABLE: u8 = 0x03;
pub const REP_HOST_UNREACHABLE: u8 = 0x04;
pub const REP_CONN_REFUSED: u8 = 0x05;
pub const REP_TTL_EXPIRED: u8 = 0x06;
pub const REP_CMD_NOT_SUPPORTED: u8 = 0x07;
pub const REP_ATYP_NOT_SUPPORTED: u8 = 0x08;

/// Establish a SOCKS5 CONNECT to `host:port` over `stream`.
///
/// The greeting offers exactly one method: username/password when `auth` is
/// present, no-auth otherwise. On success the stream carries application
/// bytes; on error the caller drops (closes) the stream.
pub async fn connect<S>(
    stream: &mut S,
    host: &str,
    port: u16,
    auth: Option<(&str, &str)>,
) -> Result<(), DialError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // ---- Greeting ----
    let offered = if auth.is_some() { METHOD_USER_PASS } else { METHOD_NO_AUTH };
    stream.write_all(&[VERSION, 0x01, offered]).await?;

    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await?;
    if choice[0] != VERSION || choice[1] != offered {
        return Err(DialError::UnsupportedAuthMethod(choice[1]));
    }

    // ---- Sub-negotiation ----
    if let Some((username, password)) = auth {
        let request = encode_auth_request(username, password)?;
        stream.write_all(&request).await?;

        let mut reply = [0u8; 2];
        stream.read_exact(&mut reply).await?;
        if reply[1] != 0x00 {
            return Err(DialError::AuthenticationFailed(reply[1]));
        }
    }

    // ---- CONNECT ----
    let request = encode_connect_request(host, port)?;
    stream.write_all(&request).await?;

    // ---- Reply: VER REP RSV ATYP ----
    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    if head[0] != VERSION {
        return Err(DialError::MalformedReply("unexpected version byte"));
    }
    if head[1] != REP_SUCCESS {
        return Err(DialError::ConnectRejected(head[1]));
    }

    // Consume and discard BND.ADDR + BND.PORT.
    match head[3] {
        ATYP_IPV4 => {
            let mut buf = [0u8; 6];
            stream.read_exact(&mut buf).await?;
        }
        ATYP_IPV6 => {
            let mut buf = [0u8; 18];
            stream.read_exact(&mut buf).await?;
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut buf = vec![0u8; len[0] as usize + 2];
            stream.read_exact(&mut buf).await?;
        }
        _ => return Err(DialError::MalformedReply("unknown address type")),
    }

    Ok(())
}

/// RFC 1929 sub-negotiation request: `01 | ulen | uname | plen | pass`.
pub(crate) fn encode_auth_request(username: &str, password: &str) -> Result<Vec<u8>, DialError> {
    if username.len() > 255 || password.len() > 255 {
        return Err(DialError::CredentialTooLong);
    }
    let mut request = Vec::with_capacity(3 + username.len() + password.len());
    request.push(0x01);
    request.push(username.len() as u8);
    request.extend_from_slice(username.as_bytes());
    request.push(password.len() as u8);
    request.extend_from_slice(password.as_bytes());
    Ok(request)
}

/// CONNECT request: `05 01 00 | ATYP | DST.ADDR | DST.PORT`. IP literals use
/// their binary address types; everything else goes as a domain so the proxy
/// resolves it.
pub(crate) fn encode_connect_request(host: &str, port: u16) -> Result<Vec<u8>, DialError> {
    let mut request = vec![VERSION, CMD_CONNECT, 0x00];
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => {
            request.push(ATYP_IPV4);
            request.extend_from_slice(&ip.octets());
        }
        Ok(IpAddr::V6(ip)) => {
            request.push(ATYP_IPV6);
            request.extend_from_slice(&ip.octets());
        }
        Err(_) => {
            if host.len() > 255 {
                return Err(DialError::HostnameTooLong(host.len()));
            }
            request.push(ATYP_DOMAIN);
            request.push(host.len() as u8);
            request.extend_from_slice(host.as_bytes());
        }
    }
    request.extend_from_slice(&port.to_be_bytes());
    Ok(request)
}

pub fn rep_description(code: u8) -> &'static str {
    match code {
        REP_SUCCESS => "success",
        REP_GENERAL_FAILURE => "general failure",
        REP_NOT_ALLOWED => "connection not allowed",
        REP_NET_UNREACHABLE => "network unreachable",
        REP_HOST_UNREACHABLE => "host unreachable",
        REP_CONN_REFUSED => "connection refused",
        REP_TTL_EXPIRED => "TTL expired",
        REP_CMD_NOT_SUPPORTED => "command not supported",
        REP_ATYP_NOT_SUPPORTED => "address type not supported",
        _ => "unknown",
    }
}
