//! Startup configuration for a mesh session.
//!
//! Values are immutable for the lifetime of a session. The binary fills them
//! from CLI flags (with env fallbacks); embedders can use [`MeshConfig::from_env`].

use crate::{Error, Result};

pub const SIGNALING_URL_ENV: &str = "HUDDLE_SIGNALING_URL";
pub const ICE_SERVER_URL_ENV: &str = "HUDDLE_ICE_SERVER_URL";
pub const ICE_USERNAME_ENV: &str = "HUDDLE_ICE_SERVER_USERNAME";
pub const ICE_CREDENTIAL_ENV: &str = "HUDDLE_ICE_SERVER_CREDENTIAL";
pub const ENVIRONMENT_ENV: &str = "HUDDLE_ENVIRONMENT";
pub const ENVIRONMENT_PRODUCTION_ENV: &str = "HUDDLE_ENVIRONMENT_PRODUCTION";
pub const ALLOW_INSECURE_SIGNALING_ENV: &str = "HUDDLE_ALLOW_INSECURE_SIGNALING";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MeshConfig {
    /// WebSocket endpoint of the signaling relay.
    pub signaling_url: String,
    /// Comma-separated relay server list, as configured.
    pub ice_server_urls: String,
    pub ice_username: Option<String>,
    pub ice_credential: Option<String>,
}

impl MeshConfig {
    pub fn new(
        signaling_url: impl Into<String>,
        ice_server_urls: impl Into<String>,
        ice_username: Option<String>,
        ice_credential: Option<String>,
    ) -> Self {
        Self {
            signaling_url: signaling_url.into(),
            ice_server_urls: ice_server_urls.into(),
            ice_username: non_empty(ice_username),
            ice_credential: non_empty(ice_credential),
        }
    }

    /// Build a config from the `HUDDLE_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let signaling_url = lookup(SIGNALING_URL_ENV)
            .ok_or_else(|| Error::config(format!("{SIGNALING_URL_ENV} is not set")))?;
        Ok(Self::new(
            signaling_url,
            lookup(ICE_SERVER_URL_ENV).unwrap_or_default(),
            lookup(ICE_USERNAME_ENV),
            lookup(ICE_CREDENTIAL_ENV),
        ))
    }

    /// Check the signaling endpoint against the deployment policy in the
    /// process environment.
    pub fn validate(&self) -> Result<()> {
        let production = env_bool(ENVIRONMENT_PRODUCTION_ENV, false)
            || std::env::var(ENVIRONMENT_ENV)
                .map(|v| v.eq_ignore_ascii_case("production"))
                .unwrap_or(false);
        let allow_insecure = env_bool(ALLOW_INSECURE_SIGNALING_ENV, false);
        validate_signaling_url(&self.signaling_url, production, allow_insecure)
    }
}

/// Reject signaling URLs that are not WebSocket endpoints, and plain `ws://`
/// in production unless explicitly allowed.
pub fn validate_signaling_url(url: &str, production: bool, allow_insecure: bool) -> Result<()> {
    let normalized = url.trim().to_ascii_lowercase();
    if normalized.is_empty() {
        return Err(Error::config("signaling URL is empty"));
    }
    let insecure = normalized.starts_with("ws://");
    if !insecure && !normalized.starts_with("wss://") {
        return Err(Error::config(format!(
            "signaling URL must use ws:// or wss://, got {url}"
        )));
    }
    if insecure && production && !allow_insecure {
        return Err(Error::config(format!(
            "refusing insecure ws:// signaling URL in production; use wss:// or set {ALLOW_INSECURE_SIGNALING_ENV}=1"
        )));
    }
    Ok(())
}

pub fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(value) => parse_bool(&value),
        Err(_) => default,
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}
