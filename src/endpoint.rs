//! Canonical endpoint keys used to partition admission control.
//!
//! Two requests share admission capacity iff their `EndpointKey`s are
//! equal. Scheme and host are compared case-insensitively; port defaults
//! to the scheme's well-known port when unspecified.

use std::fmt;

use crate::types::{GatekeeperError, Result};

/// `(scheme, host, port)` triple identifying one admission-control domain.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EndpointKey {
    scheme: String,
    host: String,
    port: u16,
}

impl EndpointKey {
    /// Derive the endpoint key for a request URL.
    ///
    /// Scheme and host are lower-cased for comparison; an unspecified
    /// port falls back to the scheme's well-known port (80 for `http`,
    /// 443 for `https`).
    pub fn from_url(url: &reqwest::Url) -> Result<Self> {
        let scheme = url.scheme().to_ascii_lowercase();
        let host = url
            .host_str()
            .ok_or_else(|| GatekeeperError::InvalidRequest(format!("{url} has no host")))?
            .to_ascii_lowercase();
        let port = url.port().unwrap_or_else(|| default_port(&scheme));

        Ok(Self { scheme, host, port })
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

fn default_port(scheme: &str) -> u16 {
    match scheme {
        "https" | "wss" => 443,
        _ => 80,
    }
}
