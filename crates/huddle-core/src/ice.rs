//! Relay/discovery server list resolution.
//!
//! Bare hostnames in the configured list denote relay (TURN) servers. The
//! resolved list always carries at least one discovery (STUN) entry.

use serde::{Deserialize, Serialize};

pub const DEFAULT_DISCOVERY_SERVER: &str = "stun:stun.l.google.com:19302";

const RELAY_SCHEMES: [&str; 2] = ["turn:", "turns:"];
const DISCOVERY_SCHEMES: [&str; 2] = ["stun:", "stuns:"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn discovery(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }

    pub fn is_discovery(&self) -> bool {
        self.urls.iter().any(|url| has_scheme(url, &DISCOVERY_SCHEMES))
    }

    pub fn is_relay(&self) -> bool {
        self.urls.iter().any(|url| has_scheme(url, &RELAY_SCHEMES))
    }
}

/// Turn a comma-separated server list into descriptors.
///
/// Entries are trimmed and empty ones dropped; order is preserved and no
/// further deduplication happens. Malformed entries pass through as relay URLs.
pub fn resolve(raw_list: &str, username: Option<&str>, credential: Option<&str>) -> Vec<IceServer> {
    let username = username.filter(|u| !u.is_empty());
    let credential = credential.filter(|c| !c.is_empty());

    let mut servers: Vec<IceServer> = raw_list
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| IceServer {
            urls: vec![normalize_url(entry)],
            username: username.map(str::to_string),
            credential: credential.map(str::to_string),
        })
        .collect();

    if !servers.iter().any(IceServer::is_discovery) {
        servers.push(IceServer::discovery(DEFAULT_DISCOVERY_SERVER));
    }
    servers
}

fn normalize_url(entry: &str) -> String {
    if has_scheme(entry, &RELAY_SCHEMES) || has_scheme(entry, &DISCOVERY_SCHEMES) {
        entry.to_string()
    } else {
        format!("turn:{entry}")
    }
}

fn has_scheme(url: &str, schemes: &[&str]) -> bool {
    let lower = url.to_ascii_lowercase();
    schemes.iter().any(|scheme| lower.starts_with(scheme))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_host_becomes_relay_with_credentials() {
        let servers = resolve("turn.example.com", Some("u"), Some("p"));
        assert_eq!(servers.len(), 2);

        let relay = &servers[0];
        assert_eq!(relay.urls, vec!["turn:turn.example.com".to_string()]);
        assert_eq!(relay.username.as_deref(), Some("u"));
        assert_eq!(relay.credential.as_deref(), Some("p"));
        assert!(relay.is_relay());
        assert!(!relay.is_discovery());

        let discovery = &servers[1];
        assert_eq!(discovery, &IceServer::discovery(DEFAULT_DISCOVERY_SERVER));
        assert!(discovery.username.is_none());
    }

    #[test]
    fn empty_list_yields_single_discovery_entry() {
        let servers = resolve("", None, None);
        assert_eq!(servers, vec![IceServer::discovery(DEFAULT_DISCOVERY_SERVER)]);
    }

    #[test]
    fn blank_entries_are_dropped() {
        let servers = resolve(" , ,,  ", Some("u"), None);
        assert_eq!(servers.len(), 1);
        assert!(servers[0].is_discovery());
    }

    #[test]
    fn configured_discovery_suppresses_fallback() {
        let servers = resolve("stun:stun.example.com:3478, turns:relay.example.com:443", None, None);
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0].urls, vec!["stun:stun.example.com:3478".to_string()]);
        assert_eq!(servers[1].urls, vec!["turns:relay.example.com:443".to_string()]);
        assert!(!servers
            .iter()
            .any(|s| s.urls.iter().any(|u| u == DEFAULT_DISCOVERY_SERVER)));
    }

    #[test]
    fn order_preserved_without_dedup() {
        let servers = resolve("a.example.com,b.example.com,a.example.com", None, None);
        let urls: Vec<_> = servers.iter().map(|s| s.urls[0].as_str()).collect();
        assert_eq!(
            urls,
            vec![
                "turn:a.example.com",
                "turn:b.example.com",
                "turn:a.example.com",
                DEFAULT_DISCOVERY_SERVER
            ]
        );
    }

    #[test]
    fn malformed_entry_passes_through_as_relay() {
        let servers = resolve("::not a url::", None, None);
        assert_eq!(servers[0].urls, vec!["turn:::not a url::".to_string()]);
        assert_eq!(servers.len(), 2);
    }

    #[test]
    fn empty_credentials_are_not_attached() {
        let servers = resolve("turn:relay.example.com", Some(""), Some(""));
        assert!(servers[0].username.is_none());
        assert!(servers[0].credential.is_none());
    }
}
