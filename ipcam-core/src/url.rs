//! Camera endpoint URLs split into the parts the bridge needs.

/// Parsed `http(s)://host[:port][/path]`. An empty host means "not configured".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UrlInfo {
    pub ssl: bool,
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl UrlInfo {
    /// Parse leniently: a missing or unknown scheme yields an empty host.
    pub fn parse(url: &str) -> Self {
        let url = url.trim();
        let (ssl, rest) = if let Some(rest) = strip_prefix_ci(url, "https://") {
            (true, rest)
        } else if let Some(rest) = strip_prefix_ci(url, "http://") {
            (false, rest)
        } else {
            return UrlInfo::default();
        };
        let (authority, path) = match rest.find('/') {
            Some(i) => (&rest[..i], rest[i..].to_string()),
            None => (rest, "/".to_string()),
        };
        // credentials are not forwarded
        let authority = authority.rsplit('@').next().unwrap_or(authority);
        let default_port = if ssl { 443 } else { 80 };
        let Some((host, port)) = split_host_port(authority, default_port) else {
            return UrlInfo::default();
        };
        if host.is_empty() {
            return UrlInfo::default();
        }
        UrlInfo {
            ssl,
            host: host.to_string(),
            port,
            path,
        }
    }

    pub fn is_configured(&self) -> bool {
        !self.host.is_empty()
    }

    /// Full URL again, suitable for an HTTP client.
    pub fn to_url(&self) -> String {
        let scheme = if self.ssl { "https" } else { "http" };
        format!("{}://{}:{}{}", scheme, self.host, self.port, self.path)
    }
}

/// Split `host[:port]` or `[v6addr][:port]`. IPv6 hosts keep their brackets.
fn split_host_port(authority: &str, default_port: u16) -> Option<(&str, u16)> {
    if authority.starts_with('[') {
        let end = authority.find(']')?;
        if end < 2 {
            return None;
        }
        let (host, rest) = authority.split_at(end + 1);
        let port = match rest {
            "" => default_port,
            _ => rest.strip_prefix(':')?.parse().ok()?,
        };
        return Some((host, port));
    }
    match authority.rsplit_once(':') {
        Some((host, port)) => Some((host, port.parse().ok()?)),
        None => Some((authority, default_port)),
    }
}

fn strip_prefix_ci<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    match s.get(..prefix.len()) {
        Some(head) if head.eq_ignore_ascii_case(prefix) => s.get(prefix.len()..),
        _ => None,
    }
}
