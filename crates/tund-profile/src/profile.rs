//! Profile definitions.

use crate::error::ProfileConfigError;
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

const MAX_ID_LEN: usize = 64;

/// Unique identifier for a profile.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProfileId(String);

impl ProfileId {
    /// Create a validated profile ID.
    pub fn new(id: impl Into<String>) -> Result<Self, ProfileConfigError> {
        let id = id.into();
        if Self::is_valid(&id) {
            Ok(Self(id))
        } else {
            Err(ProfileConfigError::InvalidId(id))
        }
    }

    /// 1-64 characters from `[A-Za-z0-9_.-]`, not starting with a dot.
    pub fn is_valid(id: &str) -> bool {
        !id.is_empty()
            && id.len() <= MAX_ID_LEN
            && !id.starts_with('.')
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProfileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ProfileId {
    type Err = ProfileConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Routing flags handed to the tunnel program.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingPolicy {
    /// Send all traffic through the tunnel
    #[serde(default)]
    pub redirect_gateway: bool,
    /// Drop IPv6 traffic while connected
    #[serde(default)]
    pub block_ipv6: bool,
}

impl RoutingPolicy {
    /// Extra program arguments for these flags.
    pub fn program_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if self.redirect_gateway {
            args.push("--redirect-gateway".to_string());
            args.push("def1".to_string());
        }
        if self.block_ipv6 {
            args.push("--block-ipv6".to_string());
        }
        args
    }
}

/// A user-configured tunnel definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub id: ProfileId,
    /// Display name
    #[serde(default)]
    pub name: String,
    /// Remote endpoint, `host` or `host:port`
    pub server: String,
    /// Reference into the credential store; never the secret itself
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials_ref: Option<String>,
    /// Tunnel program configuration file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_path: Option<PathBuf>,
    /// Extra program arguments
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default)]
    pub routing: RoutingPolicy,
    /// Start automatically when found in the system profile directory
    #[serde(default)]
    pub autostart: bool,
    /// Per-profile override of the service retry policy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
}

impl Profile {
    /// Minimal profile, mostly for tests and tooling.
    pub fn new(id: ProfileId, server: impl Into<String>) -> Self {
        Self {
            name: id.to_string(),
            id,
            server: server.into(),
            credentials_ref: None,
            config_path: None,
            args: Vec::new(),
            routing: RoutingPolicy::default(),
            autostart: false,
            retry: None,
        }
    }

    /// Name for logs and listings.
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            self.id.as_str()
        } else {
            &self.name
        }
    }

    /// Check the profile can be started at all.
    pub fn validate(&self) -> Result<(), ProfileConfigError> {
        if !ProfileId::is_valid(self.id.as_str()) {
            return Err(ProfileConfigError::InvalidId(self.id.to_string()));
        }
        if self.server.trim().is_empty() {
            return Err(ProfileConfigError::MissingServer(self.id.clone()));
        }
        if let Some(policy) = &self.retry {
            policy
                .validate()
                .map_err(|reason| ProfileConfigError::InvalidRetry {
                    id: self.id.clone(),
                    reason,
                })?;
        }
        Ok(())
    }

    /// Load from TOML string
    pub fn from_toml(content: &str) -> Result<Self, ProfileConfigError> {
        toml::from_str(content).map_err(|e| ProfileConfigError::Parse(e.to_string()))
    }

    /// Load from TOML file
    pub fn from_toml_file(path: &Path) -> Result<Self, ProfileConfigError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ProfileConfigError::Io(e.to_string()))?;
        Self::from_toml(&content)
    }

    /// Load from JSON string
    pub fn from_json(content: &str) -> Result<Self, ProfileConfigError> {
        serde_json::from_str(content).map_err(|e| ProfileConfigError::Parse(e.to_string()))
    }
}
