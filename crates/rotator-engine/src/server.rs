//! Client-facing SOCKS5 server: accept loop, RFC 1928/1929 negotiation,
//! credential validation, and splicing onto the upstream dial pipeline.

use anyhow::{anyhow, Result};
use rotator_core::proxy::socks5::{
    ATYP_DOMAIN, ATYP_IPV4, ATYP_IPV6, CMD_CONNECT, METHOD_NO_AUTH, METHOD_USER_PASS,
    REP_ATYP_NOT_SUPPORTED, REP_CMD_NOT_SUPPORTED, REP_CONN_REFUSED, REP_GENERAL_FAILURE,
    REP_SUCCESS, VERSION,
};
use rotator_core::stats::ConnectionStats;
use rotator_core::{DialError, ProxyDialer, ProxyStream};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

pub struct Server {
    listener: TcpListener,
    dialer: Arc<ProxyDialer>,
    credentials: Arc<HashMap<String, String>>,
    stats: Arc<ConnectionStats>,
    shutdown: CancellationToken,
}

impl Server {
    pub fn new(
        listener: TcpListener,
        dialer: Arc<ProxyDialer>,
        credentials: Arc<HashMap<String, String>>,
        stats: Arc<ConnectionStats>,
        shutdown: CancellationToken,
    ) -> Self {
        Server { listener, dialer, credentials, stats, shutdown }
    }

    pub async fn run(self) -> Result<()> {
        loop {
            let (stream, peer) = tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        error!("Accept error: {}", e);
                        continue;
                    }
                },
                _ = self.shutdown.cancelled() => {
                    info!("Shutting down, no longer accepting connections");
                    return Ok(());
                }
            };

            let dialer = Arc::clone(&self.dialer);
            let credentials = Arc::clone(&self.credentials);
            let stats = Arc::clone(&self.stats);
            let cancel = self.shutdown.child_token();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, peer, dialer, credentials, stats, cancel).await
                {
                    debug!("Connection error from {}: {:#}", peer, e);
                }
            });
        }
    }
}

/// Decrements the active-connection gauge when the handler returns, on every
/// path.
struct ConnGuard(Arc<ConnectionStats>);

impl Drop for ConnGuard {
    fn drop(&mut self) {
        self.0.connection_closed();
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    dialer: Arc<ProxyDialer>,
    credentials: Arc<HashMap<String, String>>,
    stats: Arc<ConnectionStats>,
    cancel: CancellationToken,
) -> Result<()> {
    stats.connection_opened();
    let _guard = ConnGuard(Arc::clone(&stats));

    negotiate_auth(&mut stream, &credentials).await?;
    let (target_host, target_port) = parse_connect_request(&mut stream).await?;
    let target = format_target(&target_host, target_port);

    info!("Connection from {} -> {}", peer, target);

    let upstream = match dialer.dial("tcp", &target, &cancel).await {
        Ok(upstream) => upstream,
        Err(e) => {
            let _ = send_reply(&mut stream, reply_code(&e)).await;
            return Err(e.into());
        }
    };

    send_reply(&mut stream, REP_SUCCESS).await?;
    pipe_streams(stream, upstream, &stats, peer, &target).await;
    Ok(())
}

/// Greeting and method selection. With a non-empty credential map only
/// username/password is acceptable; without one, only no-auth.
async fn negotiate_auth(
    stream: &mut TcpStream,
    credentials: &HashMap<String, String>,
) -> Result<()> {
    let mut head = [0u8; 2];
    stream.read_exact(&mut head).await?;
    if head[0] != VERSION {
        return Err(anyhow!("bad SOCKS version {}", head[0]));
    }
    let mut methods = vec![0u8; head[1] as usize];
    stream.read_exact(&mut methods).await?;

    if credentials.is_empty() {
        if !methods.contains(&METHOD_NO_AUTH) {
            stream.write_all(&[VERSION, 0xFF]).await?;
            return Err(anyhow!("no acceptable auth methods (offered: {:?})", methods));
        }
        stream.write_all(&[VERSION, METHOD_NO_AUTH]).await?;
        return Ok(());
    }

    if !methods.contains(&METHOD_USER_PASS) {
        stream.write_all(&[VERSION, 0xFF]).await?;
        return Err(anyhow!("client did not offer username/password auth"));
    }
    stream.write_all(&[VERSION, METHOD_USER_PASS]).await?;

    // RFC 1929: 01 | ulen | uname | plen | passwd
    let mut auth_head = [0u8; 2];
    stream.read_exact(&mut auth_head).await?;
    if auth_head[0] != 0x01 {
        stream.write_all(&[0x01, 0x01]).await?;
        return Err(anyhow!("bad auth sub-negotiation version {}", auth_head[0]));
    }
    let mut username = vec![0u8; auth_head[1] as usize];
    stream.read_exact(&mut username).await?;
    let mut plen = [0u8; 1];
    stream.read_exact(&mut plen).await?;
    let mut password = vec![0u8; plen[0] as usize];
    stream.read_exact(&mut password).await?;

    let (username, password) = match (String::from_utf8(username), String::from_utf8(password)) {
        (Ok(u), Ok(p)) => (u, p),
        _ => {
            stream.write_all(&[0x01, 0x01]).await?;
            return Err(anyhow!("non-UTF-8 credentials"));
        }
    };

    if credentials.get(&username) != Some(&password) {
        stream.write_all(&[0x01, 0x01]).await?;
        return Err(anyhow!("authentication rejected for user '{}'", username));
    }
    stream.write_all(&[0x01, 0x00]).await?;
    Ok(())
}

/// Request: VER CMD RSV ATYP DST.ADDR DST.PORT; only CONNECT is served.
async fn parse_connect_request(stream: &mut TcpStream) -> Result<(String, u16)> {
    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    if head[0] != VERSION {
        return Err(anyhow!("bad SOCKS version {} in request", head[0]));
    }
    if head[1] != CMD_CONNECT {
        send_reply(stream, REP_CMD_NOT_SUPPORTED).await?;
        return Err(anyhow!("unsupported command 0x{:02X}", head[1]));
    }

    let host = match head[3] {
        ATYP_IPV4 => {
            let mut ip = [0u8; 4];
            stream.read_exact(&mut ip).await?;
            std::net::Ipv4Addr::from(ip).to_string()
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut domain = vec![0u8; len[0] as usize];
            stream.read_exact(&mut domain).await?;
            String::from_utf8(domain)?
        }
        ATYP_IPV6 => {
            let mut ip = [0u8; 16];
            stream.read_exact(&mut ip).await?;
            std::net::Ipv6Addr::from(ip).to_string()
        }
        t => {
            send_reply(stream, REP_ATYP_NOT_SUPPORTED).await?;
            return Err(anyhow!("unknown address type 0x{:02X}", t));
        }
    };

    let mut port = [0u8; 2];
    stream.read_exact(&mut port).await?;
    Ok((host, u16::from_be_bytes(port)))
}

fn format_target(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

async fn send_reply(stream: &mut TcpStream, rep: u8) -> Result<()> {
    // VER REP RSV ATYP=IPv4 BND.ADDR(4) BND.PORT(2)
    stream
        .write_all(&[VERSION, rep, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
        .await?;
    Ok(())
}

/// Map a dial failure onto the REP code the client sees.
fn reply_code(err: &DialError) -> u8 {
    match err {
        DialError::ConnectRejected(code) => *code,
        DialError::AllAttemptsFailed(inner) => reply_code(inner),
        DialError::BothAttemptsFailed { proxy, .. } => reply_code(proxy),
        DialError::HostnameTooLong(_) | DialError::InvalidTarget(_) => REP_ATYP_NOT_SUPPORTED,
        DialError::DirectDialFailed(_)
        | DialError::UpstreamDialFailed(_)
        | DialError::Io(_) => REP_CONN_REFUSED,
        _ => REP_GENERAL_FAILURE,
    }
}

async fn pipe_streams(
    client: TcpStream,
    upstream: ProxyStream,
    stats: &Arc<ConnectionStats>,
    peer: SocketAddr,
    target: &str,
) {
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);

    let client_to_upstream = async move {
        let n = tokio::io::copy(&mut client_read, &mut upstream_write)
            .await
            .unwrap_or(0);
        let _ = upstream_write.shutdown().await;
        n
    };

    let upstream_to_client = async move {
        let n = tokio::io::copy(&mut upstream_read, &mut client_write)
            .await
            .unwrap_or(0);
        let _ = client_write.shutdown().await;
        n
    };

    let (up, down) = tokio::join!(client_to_upstream, upstream_to_client);
    stats.record_transfer(up, down);
    info!(
        peer = %peer,
        target = %target,
        bytes_up = up,
        bytes_down = down,
        active = stats.active(),
        "connection closed"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use rotator_core::Manager;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn spawn_echo_server() -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (mut stream, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => break,
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 64];
                    while let Ok(n) = stream.read(&mut buf).await {
                        if n == 0 || stream.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        addr
    }

    async fn spawn_server(credentials: HashMap<String, String>) -> std::net::SocketAddr {
        let manager = Arc::new(Manager::new(true));
        manager.load(Vec::new()).unwrap();
        let dialer = Arc::new(ProxyDialer::new(manager));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Server::new(
            listener,
            dialer,
            Arc::new(credentials),
            ConnectionStats::new(),
            CancellationToken::new(),
        );
        tokio::spawn(server.run());
        addr
    }

    fn connect_request_for(addr: std::net::SocketAddr) -> Vec<u8> {
        let ip = match addr.ip() {
            std::net::IpAddr::V4(ip) => ip.octets(),
            _ => unreachable!(),
        };
        let mut req = vec![5, 1, 0, 1];
        req.extend_from_slice(&ip);
        req.extend_from_slice(&addr.port().to_be_bytes());
        req
    }

    #[tokio::test]
    async fn test_end_to_end_with_auth() {
        let echo = spawn_echo_server().await;
        let mut credentials = HashMap::new();
        credentials.insert("u".to_string(), "p".to_string());
        let server = spawn_server(credentials).await;

        let mut client = TcpStream::connect(server).await.unwrap();

        client.write_all(&[5, 1, METHOD_USER_PASS]).await.unwrap();
        let mut choice = [0u8; 2];
        client.read_exact(&mut choice).await.unwrap();
        assert_eq!(choice, [5, METHOD_USER_PASS]);

        client.write_all(&[1, 1, b'u', 1, b'p']).await.unwrap();
        let mut status = [0u8; 2];
        client.read_exact(&mut status).await.unwrap();
        assert_eq!(status, [1, 0]);

        client.write_all(&connect_request_for(echo)).await.unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], REP_SUCCESS);

        client.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn test_wrong_password_is_rejected() {
        let mut credentials = HashMap::new();
        credentials.insert("u".to_string(), "p".to_string());
        let server = spawn_server(credentials).await;

        let mut client = TcpStream::connect(server).await.unwrap();
        client.write_all(&[5, 1, METHOD_USER_PASS]).await.unwrap();
        let mut choice = [0u8; 2];
        client.read_exact(&mut choice).await.unwrap();

        client.write_all(&[1, 1, b'u', 1, b'x']).await.unwrap();
        let mut status = [0u8; 2];
        client.read_exact(&mut status).await.unwrap();
        assert_eq!(status, [1, 1]);
    }

    #[tokio::test]
    async fn test_auth_required_but_not_offered() {
        let mut credentials = HashMap::new();
        credentials.insert("u".to_string(), "p".to_string());
        let server = spawn_server(credentials).await;

        let mut client = TcpStream::connect(server).await.unwrap();
        client.write_all(&[5, 1, METHOD_NO_AUTH]).await.unwrap();
        let mut choice = [0u8; 2];
        client.read_exact(&mut choice).await.unwrap();
        assert_eq!(choice, [5, 0xFF]);
    }

    #[tokio::test]
    async fn test_bind_command_is_refused() {
        let mut credentials = HashMap::new();
        credentials.insert("u".to_string(), "p".to_string());
        let server = spawn_server(credentials).await;

        let mut client = TcpStream::connect(server).await.unwrap();
        client.write_all(&[5, 1, METHOD_USER_PASS]).await.unwrap();
        let mut choice = [0u8; 2];
        client.read_exact(&mut choice).await.unwrap();
        client.write_all(&[1, 1, b'u', 1, b'p']).await.unwrap();
        let mut status = [0u8; 2];
        client.read_exact(&mut status).await.unwrap();

        // BIND request
        client
            .write_all(&[5, 2, 0, 1, 127, 0, 0, 1, 0, 80])
            .await
            .unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], REP_CMD_NOT_SUPPORTED);
    }

    #[tokio::test]
    async fn test_unreachable_target_maps_to_refused() {
        let mut credentials = HashMap::new();
        credentials.insert("u".to_string(), "p".to_string());
        let server = spawn_server(credentials).await;

        // A port nothing listens on.
        let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_addr = dead.local_addr().unwrap();
        drop(dead);

        let mut client = TcpStream::connect(server).await.unwrap();
        client.write_all(&[5, 1, METHOD_USER_PASS]).await.unwrap();
        let mut choice = [0u8; 2];
        client.read_exact(&mut choice).await.unwrap();
        client.write_all(&[1, 1, b'u', 1, b'p']).await.unwrap();
        let mut status = [0u8; 2];
        client.read_exact(&mut status).await.unwrap();

        client.write_all(&connect_request_for(dead_addr)).await.unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], REP_CONN_REFUSED);
    }
}
