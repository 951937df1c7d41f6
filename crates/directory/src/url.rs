//! Directory URL list parsing
//!
//! The `url` setting is a comma-separated list tried left to right. Each
//! element must use `ldap://` (default port 389) or `ldaps://` (default
//! port 636).

use std::fmt;

use url::Url;

use crate::error::{DirectoryError, Result};

/// Transport scheme of a directory URL
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    /// Plain LDAP, optionally upgraded with StartTLS
    Ldap,
    /// LDAP over TLS
    Ldaps,
}

impl Scheme {
    /// Port used when the URL does not carry one
    pub fn default_port(self) -> u16 {
        match self {
            Self::Ldap => 389,
            Self::Ldaps => 636,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Ldap => "ldap",
            Self::Ldaps => "ldaps",
        }
    }
}

/// A single parsed directory endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryUrl {
    /// Element as written in the configuration
    pub raw: String,
    /// Transport scheme
    pub scheme: Scheme,
    /// Host name or address; also the TLS server name
    pub host: String,
    /// Explicit or default port
    pub port: u16,
}

impl DirectoryUrl {
    /// Parse one element of the URL list
    pub fn parse(raw: &str) -> Result<Self> {
        let parsed = Url::parse(raw)
            .map_err(|e| DirectoryError::InvalidConfig(format!("invalid URL '{raw}': {e}")))?;
        let scheme = match parsed.scheme() {
            "ldap" => Scheme::Ldap,
            "ldaps" => Scheme::Ldaps,
            other => {
                return Err(DirectoryError::InvalidConfig(format!(
                    "invalid URL '{raw}': unsupported scheme '{other}'"
                )));
            }
        };
        let host = parsed
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| DirectoryError::InvalidConfig(format!("invalid URL '{raw}': no host")))?
            .to_string();
        let port = parsed.port().unwrap_or_else(|| scheme.default_port());
        Ok(Self {
            raw: raw.to_string(),
            scheme,
            host,
            port,
        })
    }

    /// Normalised `scheme://host:port` form handed to the LDAP library
    pub fn connect_url(&self) -> String {
        format!("{}://{}:{}", self.scheme.as_str(), self.host, self.port)
    }
}

impl fmt::Display for DirectoryUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Non-empty elements of a comma-separated URL list, trimmed, in order
pub fn split_urls(list: &str) -> impl Iterator<Item = &str> {
    list.split(',').map(str::trim).filter(|s| !s.is_empty())
}

/// Split and parse a comma-separated URL list, keeping per-element errors
/// so that the dialer can report every failure in order.
pub fn parse_urls(list: &str) -> Vec<Result<DirectoryUrl>> {
    split_urls(list).map(DirectoryUrl::parse).collect()
}
