use anyhow::{anyhow, Context, Result};
use std::collections::HashMap;
use std::path::Path;

// ---------------------------------------------------------------------------
// Defaults and environment
// ---------------------------------------------------------------------------

pub const DEFAULT_PROXIES_FILE: &str = "proxies.conf";
pub const DEFAULT_USERS_FILE: &str = "users.conf";
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:1080";

/// Environment variable controlling edge mode. Only the exact string
/// `"true"` enables it; anything else (including unset) disables it.
pub const ENABLE_EDGE_MODE_VAR: &str = "ENABLE_EDGE_MODE";

pub fn edge_mode_from_env() -> bool {
    std::env::var(ENABLE_EDGE_MODE_VAR).map(|v| v == "true").unwrap_or(false)
}

// ---------------------------------------------------------------------------
// Proxy scheme
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyScheme {
    Socks5,
    Socks5h,
    Http,
    Https,
}

impl ProxyScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyScheme::Socks5 => "socks5",
            ProxyScheme::Socks5h => "socks5h",
            ProxyScheme::Http => "http",
            ProxyScheme::Https => "https",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "socks5" => Ok(ProxyScheme::Socks5),
            "socks5h" => Ok(ProxyScheme::Socks5h),
            "http" => Ok(ProxyScheme::Http),
            "https" => Ok(ProxyScheme::Https),
            other => Err(anyhow!("unsupported proxy scheme: {}", other)),
        }
    }
}

impl std::fmt::Display for ProxyScheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Proxy entry
// ---------------------------------------------------------------------------

/// One parsed upstream, immutable after construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyEntry {
    pub scheme: ProxyScheme,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl ProxyEntry {
    /// Parse an upstream URL of the form `scheme://[user[:pass]@]host:port`.
    ///
    /// Bracketed IPv6 hosts (`socks5://[::1]:1080`) are accepted. A username
    /// without a password gets the empty password.
    pub fn parse(url: &str) -> Result<Self> {
        let (scheme_str, rest) = url
            .split_once("://")
            .ok_or_else(|| anyhow!("invalid proxy URL '{}': missing scheme", url))?;
        let scheme = ProxyScheme::from_str(scheme_str)
            .map_err(|e| anyhow!("invalid proxy URL '{}': {}", url, e))?;

        // Credentials are everything before the last '@' so that passwords
        // containing '@' survive.
        let (userinfo, hostport) = match rest.rsplit_once('@') {
            Some((u, h)) => (Some(u), h),
            None => (None, rest),
        };

        let (username, password) = match userinfo {
            Some(info) => {
                let (user, pass) = match info.split_once(':') {
                    Some((u, p)) => (u, p),
                    None => (info, ""),
                };
                if user.is_empty() {
                    return Err(anyhow!("invalid proxy URL '{}': empty username", url));
                }
                (Some(user.to_string()), Some(pass.to_string()))
            }
            None => (None, None),
        };

        let (host, port) = split_authority(hostport)
            .map_err(|e| anyhow!("invalid proxy URL '{}': {}", url, e))?;

        Ok(ProxyEntry { scheme, host, port, username, password })
    }

    /// `(username, password)` if the entry carries credentials; a missing
    /// password defaults to the empty string.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        self.username
            .as_deref()
            .map(|u| (u, self.password.as_deref().unwrap_or("")))
    }
}

impl std::fmt::Display for ProxyEntry {
    /// Credentials are deliberately left out so entries are safe to log.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.host.contains(':') {
            write!(f, "{}://[{}]:{}", self.scheme, self.host, self.port)
        } else {
            write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
        }
    }
}

/// Split `host:port` or `[ipv6]:port`, requiring a numeric non-zero port.
fn split_authority(s: &str) -> Result<(String, u16)> {
    let (host, port_str) = if let Some(rest) = s.strip_prefix('[') {
        let (host, after) = rest
            .split_once(']')
            .ok_or_else(|| anyhow!("unclosed '[' in host"))?;
        let port = after
            .strip_prefix(':')
            .ok_or_else(|| anyhow!("missing port"))?;
        (host, port)
    } else {
        s.rsplit_once(':').ok_or_else(|| anyhow!("missing port"))?
    };

    if host.is_empty() {
        return Err(anyhow!("empty host"));
    }
    if !s.starts_with('[') && host.contains(':') {
        return Err(anyhow!("IPv6 host must be bracketed"));
    }
    let port: u16 = port_str
        .parse()
        .map_err(|_| anyhow!("invalid port '{}'", port_str))?;
    if port == 0 {
        return Err(anyhow!("invalid port '0'"));
    }
    Ok((host.to_string(), port))
}

// ---------------------------------------------------------------------------
// File loading
// ---------------------------------------------------------------------------

/// Load the proxy list: one URL per line, blank lines and `#` comments
/// ignored. Any malformed line aborts the load.
pub fn load_proxy_list(path: impl AsRef<Path>) -> Result<Vec<ProxyEntry>> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read proxy list '{}'", path.display()))?;

    let mut entries = Vec::new();
    for (lineno, raw) in content.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let entry = ProxyEntry::parse(line)
            .with_context(|| format!("{}:{}", path.display(), lineno + 1))?;
        entries.push(entry);
    }
    Ok(entries)
}

/// Load user credentials: one `username:password` per line, split on the
/// first `:`, both sides trimmed. Duplicate usernames: last write wins.
/// Zero valid credentials is an error.
pub fn load_credentials(path: impl AsRef<Path>) -> Result<HashMap<String, String>> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read users file '{}'", path.display()))?;

    let mut credentials = HashMap::new();
    for (lineno, raw) in content.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (user, pass) = line.split_once(':').ok_or_else(|| {
            anyhow!("invalid credential format at {}:{}", path.display(), lineno + 1)
        })?;
        credentials.insert(user.trim().to_string(), pass.trim().to_string());
    }

    if credentials.is_empty() {
        return Err(anyhow!("no valid credentials found in '{}'", path.display()));
    }
    Ok(credentials)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_file(name: &str, content: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!("rotator_test_{}_{}", std::process::id(), name));
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_parse_plain() {
        let e = ProxyEntry::parse("socks5h://127.0.0.1:9050").unwrap();
        assert_eq!(e.scheme, ProxyScheme::Socks5h);
        assert_eq!(e.host, "127.0.0.1");
        assert_eq!(e.port, 9050);
        assert!(e.credentials().is_none());
    }

    #[test]
    fn test_parse_with_credentials() {
        let e = ProxyEntry::parse("socks5://u:p@h:1080").unwrap();
        assert_eq!(e.scheme, ProxyScheme::Socks5);
        assert_eq!(e.host, "h");
        assert_eq!(e.port, 1080);
        assert_eq!(e.credentials(), Some(("u", "p")));
    }

    #[test]
    fn test_parse_username_only() {
        let e = ProxyEntry::parse("http://alice@proxy:3128").unwrap();
        assert_eq!(e.credentials(), Some(("alice", "")));
    }

    #[test]
    fn test_parse_password_with_at_sign() {
        let e = ProxyEntry::parse("http://alice:p@ss@proxy:3128").unwrap();
        assert_eq!(e.credentials(), Some(("alice", "p@ss")));
        assert_eq!(e.host, "proxy");
    }

    #[test]
    fn test_parse_ipv6_host() {
        let e = ProxyEntry::parse("https://[2001:db8::1]:8443").unwrap();
        assert_eq!(e.host, "2001:db8::1");
        assert_eq!(e.port, 8443);
        assert_eq!(e.to_string(), "https://[2001:db8::1]:8443");
    }

    #[test]
    fn test_parse_rejects_bad_urls() {
        assert!(ProxyEntry::parse("localhost:1080").is_err()); // no scheme
        assert!(ProxyEntry::parse("ftp://h:21").is_err()); // unknown scheme
        assert!(ProxyEntry::parse("socks5://h").is_err()); // no port
        assert!(ProxyEntry::parse("http://h:abc").is_err()); // bad port
        assert!(ProxyEntry::parse("http://h:0").is_err()); // zero port
        assert!(ProxyEntry::parse("http://:8080").is_err()); // empty host
        assert!(ProxyEntry::parse("http://:pw@h:8080").is_err()); // empty user
        assert!(ProxyEntry::parse("socks5://2001:db8::1:1080").is_err()); // unbracketed IPv6
    }

    #[test]
    fn test_display_redacts_credentials() {
        let e = ProxyEntry::parse("socks5://u:secret@h:1080").unwrap();
        assert_eq!(e.to_string(), "socks5://h:1080");
    }

    #[test]
    fn test_load_proxy_list() {
        let path = temp_file(
            "proxies",
            "# upstreams\n\nsocks5://a:1080\n  http://b:3128  \n\n# tail\n",
        );
        let entries = load_proxy_list(&path).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].host, "a");
        assert_eq!(entries[1].scheme, ProxyScheme::Http);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn test_load_proxy_list_bad_line() {
        let path = temp_file("proxies_bad", "socks5://a:1080\nnot-a-url\n");
        assert!(load_proxy_list(&path).is_err());
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn test_load_credentials() {
        let path = temp_file(
            "users",
            "# users\nalice:secret\n bob : hunter2 \ncarol:pa:ss\nalice:newer\n",
        );
        let creds = load_credentials(&path).unwrap();
        assert_eq!(creds.len(), 3);
        assert_eq!(creds["alice"], "newer"); // last write wins
        assert_eq!(creds["bob"], "hunter2"); // trimmed
        assert_eq!(creds["carol"], "pa:ss"); // split on first ':'
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn test_load_credentials_invalid_line() {
        let path = temp_file("users_bad", "alice secret\n");
        assert!(load_credentials(&path).is_err());
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn test_load_credentials_empty_is_fatal() {
        let path = temp_file("users_empty", "# nobody here\n\n");
        assert!(load_credentials(&path).is_err());
        let _ = std::fs::remove_file(path);
    }
}
