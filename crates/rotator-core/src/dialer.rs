//! The client-facing dial entry point: direct vs proxied, with edge-mode
//! fallback and error aggregation.

use crate::error::DialError;
use crate::proxy;
use crate::rotator::Manager;
use crate::stream::ProxyStream;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub struct ProxyDialer {
    manager: Arc<Manager>,
}

impl ProxyDialer {
    pub fn new(manager: Arc<Manager>) -> Self {
        ProxyDialer { manager }
    }

    /// Dial `target` (`host:port`) on behalf of one client connection.
    ///
    /// At most one direct attempt (when the rotator prefers direct) plus at
    /// most one proxied attempt are made; when both fail the surfaced error
    /// names both causes. Cancelling `cancel` aborts any in-progress step
    /// and closes whatever was half-open.
    pub async fn dial(
        &self,
        network: &str,
        target: &str,
        cancel: &CancellationToken,
    ) -> Result<ProxyStream, DialError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(DialError::Cancelled),
            res = self.dial_inner(network, target) => res,
        }
    }

    async fn dial_inner(&self, network: &str, target: &str) -> Result<ProxyStream, DialError> {
        if network != "tcp" {
            return Err(DialError::UnsupportedNetwork(network.to_string()));
        }

        let mut last_err: Option<DialError> = None;

        if self.manager.should_use_direct() {
            match TcpStream::connect(target).await {
                Ok(stream) => return Ok(ProxyStream::Tcp(stream)),
                Err(e) => {
                    debug!(target, error = %e, "direct dial failed, falling back to pool");
                    last_err = Some(DialError::DirectDialFailed(e));
                }
            }
        }

        if self.manager.has_proxies() {
            let entry = match self.manager.next() {
                Ok(entry) => entry,
                Err(e) => return Err(merge(last_err, e)),
            };
            let (host, port) = split_host_port(target)?;
            match proxy::connect_through_entry(&entry, &host, port).await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    debug!(upstream = %entry, target, error = %e, "upstream dial failed");
                    last_err = Some(merge(last_err.take(), e));
                }
            }
        } else if !self.manager.is_edge_enabled() {
            return Err(DialError::NoUpstreamsAndEdgeDisabled);
        }

        match last_err {
            Some(e) => Err(DialError::AllAttemptsFailed(Box::new(e))),
            None => Err(DialError::NoConnectionMethods),
        }
    }
}

/// Fold a failed direct attempt into the proxy-side error so both causes
/// survive into the final message.
fn merge(direct: Option<DialError>, proxy: DialError) -> DialError {
    match direct {
        Some(direct) => DialError::BothAttemptsFailed {
            direct: Box::new(direct),
            proxy: Box::new(proxy),
        },
        None => proxy,
    }
}

/// Split `host:port` or `[ipv6]:port` from a dial target.
pub fn split_host_port(target: &str) -> Result<(String, u16), DialError> {
    if let Some(rest) = target.strip_prefix('[') {
        if let Some((host, after)) = rest.split_once(']') {
            if let Some(port_str) = after.strip_prefix(':') {
                let port: u16 = port_str
                    .parse()
                    .map_err(|_| DialError::InvalidTarget(target.to_string()))?;
                return Ok((host.to_string(), port));
            }
        }
        return Err(DialError::InvalidTarget(target.to_string()));
    }
    match target.rsplit_once(':') {
        Some((host, port_str)) if !host.is_empty() && !host.contains(':') => {
            let port: u16 = port_str
                .parse()
                .map_err(|_| DialError::InvalidTarget(target.to_string()))?;
            Ok((host.to_string(), port))
        }
        _ => Err(DialError::InvalidTarget(target.to_string())),
    }
}
