use std::fmt;
use std::net::IpAddr;

use crate::error::DispatchError;

/// Scheme, host and port of the server a client talks to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    secure: bool,
    hostname: String,
    port: u16,
    explicit_port: bool,
}

impl Origin {
    /// Parses `http://host[:port]` or `https://host[:port]`. A trailing
    /// `/` is accepted; any other path, query or userinfo is rejected.
    pub fn parse(origin: &str) -> Result<Self, DispatchError> {
        let (secure, rest) = if let Some(rest) = strip_prefix_ci(origin, "https://") {
            (true, rest)
        } else if let Some(rest) = strip_prefix_ci(origin, "http://") {
            (false, rest)
        } else {
            return Err(DispatchError::invalid(
                "Invalid URL protocol: the URL must start with `http:` or `https:`.",
            ));
        };
        let authority = rest.strip_suffix('/').unwrap_or(rest);
        if authority.is_empty() || authority.contains(['/', '?', '#', '@']) {
            return Err(DispatchError::invalid("invalid origin"));
        }

        let (hostname, port) = if let Some(v6) = authority.strip_prefix('[') {
            let Some((addr, tail)) = v6.split_once(']') else {
                return Err(DispatchError::invalid("invalid origin"));
            };
            (format!("[{addr}]"), tail.strip_prefix(':'))
        } else {
            match authority.rsplit_once(':') {
                Some((host, port)) => (host.to_string(), Some(port)),
                None => (authority.to_string(), None),
            }
        };
        if hostname.is_empty() || hostname == "[]" {
            return Err(DispatchError::invalid("invalid origin"));
        }
        let (port, explicit_port) = match port {
            Some(port) => (
                port.parse::<u16>()
                    .map_err(|_| DispatchError::invalid("Invalid URL: port must be a valid integer"))?,
                true,
            ),
            None => (if secure { 443 } else { 80 }, false),
        };

        Ok(Origin {
            secure,
            hostname: hostname.to_ascii_lowercase(),
            port,
            explicit_port,
        })
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    /// `http:` or `https:`.
    pub fn protocol(&self) -> &'static str {
        if self.secure { "https:" } else { "http:" }
    }

    /// Host as written, IPv6 in brackets.
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Host without IPv6 brackets, for connectors.
    pub fn bare_hostname(&self) -> &str {
        self.hostname
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(&self.hostname)
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `hostname[:port]`, the value of the `host` request header.
    pub fn host(&self) -> String {
        if self.explicit_port {
            format!("{}:{}", self.hostname, self.port)
        } else {
            self.hostname.clone()
        }
    }

    /// Servername derived from the hostname; `None` for IP literals.
    pub(crate) fn default_servername(&self) -> Option<String> {
        servername_for(self.bare_hostname())
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.secure { "https" } else { "http" };
        if self.explicit_port {
            write!(f, "{scheme}://{}:{}", self.hostname, self.port)
        } else {
            write!(f, "{scheme}://{}", self.hostname)
        }
    }
}

/// TLS servername for a host header value or hostname. Strips the port
/// and returns `None` for IP addresses, which are not valid SNI names.
pub(crate) fn servername_for(host: &str) -> Option<String> {
    let hostname = if let Some(v6) = host.strip_prefix('[') {
        v6.split_once(']').map(|(addr, _)| addr).unwrap_or(v6)
    } else if host.matches(':').count() == 1 {
        host.split_once(':').map(|(h, _)| h).unwrap_or(host)
    } else {
        host
    };
    if hostname.is_empty() || hostname.parse::<IpAddr>().is_ok() {
        return None;
    }
    Some(hostname.to_string())
}

fn strip_prefix_ci<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    let head = s.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix).then(|| &s[prefix.len()..])
}
