use http::header::{self, HeaderMap, HeaderName};
use std::collections::HashSet;

/// Headers that only make sense between two adjacent hops
const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TRAILER,
    header::TE,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// Immutable hop-by-hop header set, built once at startup.
///
/// `HeaderName` is always stored lowercase, so lookups are case-insensitive
/// regardless of how the client spelled the header on the wire.
#[derive(Debug, Clone)]
pub struct HopByHopHeaders {
    names: HashSet<HeaderName>,
}

impl HopByHopHeaders {
    pub fn new() -> Self {
        Self {
            names: HOP_BY_HOP.into_iter().collect(),
        }
    }

    pub fn contains(&self, name: &HeaderName) -> bool {
        self.names.contains(name)
    }

    /// Remove every hop-by-hop header in place
    pub fn strip(&self, headers: &mut HeaderMap) {
        for name in &self.names {
            headers.remove(name);
        }
    }

    /// Like [`strip`](Self::strip), but also drops the headers listed in the
    /// `Connection` header tokens, as a reverse proxy is expected to.
    pub fn strip_with_connection_tokens(&self, headers: &mut HeaderMap) {
        let listed: Vec<HeaderName> = headers
            .get_all(header::CONNECTION)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(','))
            .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
            .filter(|name| !self.contains(name))
            .collect();

        for name in listed {
            headers.remove(name);
        }
        self.strip(headers);
    }
}

impl Default for HopByHopHeaders {
    fn default() -> Self {
        Self::new()
    }
}
