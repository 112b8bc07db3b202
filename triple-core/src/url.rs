//! Reference URL parsing.
//!
//! Two forms are understood:
//!
//! - `tri://host:port/service.Name?group=g&version=1.0` — a direct
//!   reference to one provider.
//! - `zookeeper://h1:2181,h2:2181,h3:2181/?timeout_ms=3000` — a registry
//!   reference whose authority is a comma-separated host list forwarded
//!   verbatim to the registry client.
//!
//! The comma-separated authority of registry URLs is not a valid URI
//! authority, so parsing is done by hand rather than with a generic URL
//! crate.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use percent_encoding::{percent_decode_str, utf8_percent_encode, NON_ALPHANUMERIC};

use crate::endpoint::{Endpoint, EndpointMetadata};
use crate::error::{Result, TripleError};
use crate::loadbalance::LoadBalance;

/// A parsed reference URL: scheme, verbatim authority, path, and decoded
/// query parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcUrl {
    scheme: String,
    authority: String,
    path: String,
    params: BTreeMap<String, String>,
}

impl RpcUrl {
    pub fn new(scheme: impl Into<String>, authority: impl Into<String>) -> RpcUrl {
        RpcUrl {
            scheme: scheme.into(),
            authority: authority.into(),
            path: String::new(),
            params: BTreeMap::new(),
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> RpcUrl {
        self.path = path.into();
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> RpcUrl {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// The authority exactly as written, including any comma-separated
    /// host list.
    pub fn authority(&self) -> &str {
        &self.authority
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// The path with surrounding slashes stripped: the service name for
    /// `tri://` references.
    pub fn service(&self) -> &str {
        self.path.trim_matches('/')
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    pub fn params(&self) -> &BTreeMap<String, String> {
        &self.params
    }

    /// Split a single-host authority into host and port.
    pub fn host_port(&self) -> Result<(String, u16)> {
        let (host, port) = self.authority.rsplit_once(':').ok_or_else(|| {
            TripleError::InvalidArgument(format!("authority {:?} has no port", self.authority))
        })?;
        if host.is_empty() {
            return Err(TripleError::InvalidArgument(format!(
                "authority {:?} has no host",
                self.authority
            )));
        }
        let port = port.parse::<u16>().map_err(|_| {
            TripleError::InvalidArgument(format!("invalid port in authority {:?}", self.authority))
        })?;
        Ok((host.to_string(), port))
    }
}

impl FromStr for RpcUrl {
    type Err = TripleError;

    fn from_str(input: &str) -> Result<RpcUrl> {
        let (scheme, rest) = input.split_once("://").ok_or_else(|| {
            TripleError::InvalidArgument(format!("URL {input:?} is missing a scheme"))
        })?;
        if scheme.is_empty() {
            return Err(TripleError::InvalidArgument(format!(
                "URL {input:?} is missing a scheme"
            )));
        }
        let (rest, query) = match rest.split_once('?') {
            Some((r, q)) => (r, Some(q)),
            None => (rest, None),
        };
        let (authority, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, ""),
        };
        if authority.is_empty() {
            return Err(TripleError::InvalidArgument(format!(
                "URL {input:?} has an empty authority"
            )));
        }
        let mut params = BTreeMap::new();
        if let Some(query) = query {
            for pair in query.split('&').filter(|p| !p.is_empty()) {
                let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
                params.insert(unescape(key)?, unescape(value)?);
            }
        }
        Ok(RpcUrl {
            scheme: scheme.to_string(),
            authority: authority.to_string(),
            path: path.to_string(),
            params,
        })
    }
}

impl fmt::Display for RpcUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}{}", self.scheme, self.authority, self.path)?;
        let mut sep = '?';
        for (key, value) in &self.params {
            write!(
                f,
                "{sep}{}={}",
                utf8_percent_encode(key, QUERY_ESCAPES),
                utf8_percent_encode(value, QUERY_ESCAPES)
            )?;
            sep = '&';
        }
        Ok(())
    }
}

/// Characters escaped inside query keys and values.
const QUERY_ESCAPES: &percent_encoding::AsciiSet = &percent_encoding::CONTROLS
    .add(b' ')
    .add(b'&')
    .add(b'=')
    .add(b'#')
    .add(b'%')
    .add(b'?');

fn unescape(raw: &str) -> Result<String> {
    percent_decode_str(raw)
        .decode_utf8()
        .map(|s| s.into_owned())
        .map_err(|_| TripleError::InvalidArgument(format!("query component {raw:?} is not UTF-8")))
}

/// Options recognized on reference URLs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UrlOptions {
    pub group: Option<String>,
    pub version: Option<String>,
    pub loadbalance: Option<LoadBalance>,
    pub timeout: Option<Duration>,
    pub max_message_size: Option<usize>,
    pub serialization: Option<String>,
}

impl UrlOptions {
    pub fn from_url(url: &RpcUrl) -> Result<UrlOptions> {
        let mut options = UrlOptions {
            group: url.param("group").map(str::to_string),
            version: url.param("version").map(str::to_string),
            serialization: url.param("serialization").map(str::to_string),
            ..UrlOptions::default()
        };
        if let Some(raw) = url.param("loadbalance") {
            options.loadbalance = Some(raw.parse()?);
        }
        if let Some(raw) = url.param("timeout_ms") {
            let millis = raw.parse::<u64>().map_err(|_| {
                TripleError::InvalidArgument(format!("timeout_ms {raw:?} is not an integer"))
            })?;
            options.timeout = Some(Duration::from_millis(millis));
        }
        if let Some(raw) = url.param("max_message_size") {
            let size = raw.parse::<usize>().map_err(|_| {
                TripleError::InvalidArgument(format!("max_message_size {raw:?} is not an integer"))
            })?;
            options.max_message_size = Some(size);
        }
        Ok(options)
    }
}

/// Render an endpoint as the provider URL published to the registry.
/// Metadata rides in the query string.
pub fn endpoint_to_url(endpoint: &Endpoint) -> String {
    let mut url = RpcUrl::new("tri", endpoint.addr());
    if let Some(weight) = endpoint.metadata.weight {
        url = url.with_param("weight", weight.to_string());
    }
    if let Some(cpu) = endpoint.metadata.cpu {
        url = url.with_param("cpu", cpu.to_string());
    }
    if let Some(group) = &endpoint.metadata.group {
        url = url.with_param("group", group.clone());
    }
    if let Some(version) = &endpoint.metadata.version {
        url = url.with_param("version", version.clone());
    }
    url.to_string()
}

/// Parse a provider URL back into an endpoint.
pub fn endpoint_from_url(raw: &str) -> Result<Endpoint> {
    let url: RpcUrl = raw.parse()?;
    let (host, port) = url.host_port()?;
    let parse_u32 = |key: &str| -> Result<Option<u32>> {
        match url.param(key) {
            Some(v) => v
                .parse::<u32>()
                .map(Some)
                .map_err(|_| TripleError::InvalidArgument(format!("{key} {v:?} in {raw:?}"))),
            None => Ok(None),
        }
    };
    let metadata = EndpointMetadata {
        weight: parse_u32("weight")?,
        cpu: parse_u32("cpu")?,
        group: url.param("group").map(str::to_string),
        version: url.param("version").map(str::to_string),
    };
    Ok(Endpoint::new(host, port).with_metadata(metadata))
}

/// Escape a provider URL for use as a znode name.
pub fn encode_znode_name(raw: &str) -> String {
    utf8_percent_encode(raw, NON_ALPHANUMERIC).to_string()
}

/// Decode a znode name back into a provider URL.
pub fn decode_znode_name(raw: &str) -> Result<String> {
    percent_decode_str(raw)
        .decode_utf8()
        .map(|s| s.into_owned())
        .map_err(|_| TripleError::InvalidArgument(format!("znode name {raw:?} is not UTF-8")))
}
