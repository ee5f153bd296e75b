//! Errors surfaced by the upstream dial pipeline.

use thiserror::Error;

/// Everything that can go wrong between a client dial request and a
/// connected upstream byte stream. Startup/configuration failures use
/// `anyhow` instead and abort the process.
#[derive(Debug, Error)]
pub enum DialError {
    #[error("no proxies loaded from configuration and edge mode is disabled")]
    NoProxiesConfigured,

    #[error("no proxies available")]
    NoProxiesAvailable,

    #[error("no proxies available and edge mode is disabled")]
    NoUpstreamsAndEdgeDisabled,

    #[error("unsupported network: {0}")]
    UnsupportedNetwork(String),

    #[error("invalid target address: {0}")]
    InvalidTarget(String),

    #[error("SOCKS5: unsupported auth method 0x{0:02X}")]
    UnsupportedAuthMethod(u8),

    #[error("SOCKS5: username or password exceeds 255 bytes")]
    CredentialTooLong,

    #[error("SOCKS5: authentication failed (status 0x{0:02X})")]
    AuthenticationFailed(u8),

    #[error("SOCKS5: hostname too long ({0} bytes)")]
    HostnameTooLong(usize),

    #[error("SOCKS5: connect failed with code 0x{0:02X} ({desc})", desc = crate::proxy::socks5::rep_description(*.0))]
    ConnectRejected(u8),

    #[error("SOCKS5: malformed reply: {0}")]
    MalformedReply(&'static str),

    #[error("TLS handshake with proxy failed")]
    TlsHandshakeFailed(#[source] native_tls::Error),

    #[error("proxy error: {0}")]
    ProxyRejected(String),

    #[error("direct connection failed: {0}")]
    DirectDialFailed(#[source] std::io::Error),

    #[error("connecting to upstream proxy failed: {0}")]
    UpstreamDialFailed(#[source] std::io::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("dial cancelled")]
    Cancelled,

    /// Both the direct attempt and the proxied attempt of a single dial
    /// failed; both causes are part of the message.
    #[error("direct connection failed: {direct}, proxy error: {proxy}")]
    BothAttemptsFailed {
        direct: Box<DialError>,
        proxy: Box<DialError>,
    },

    #[error("all connection attempts failed, last error: {0}")]
    AllAttemptsFailed(#[source] Box<DialError>),

    #[error("no connection methods available")]
    NoConnectionMethods,
}
