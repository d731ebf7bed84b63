//! Configuration parsing.
//!
//! The daemon reads one TOML file at startup. The `[policy]` section is
//! frozen into a [`PolicyRule`] and never reloaded.
//!
//! ```toml
//! [daemon]
//! socket = "/run/battd/battd.sock"
//!
//! [policy]
//! expected_common_name = "BatteryToolkit Signer"
//! expected_bundle_identifiers = ["me.mhaeuser.batterytoolkit"]
//! manage_uids = [0]
//! manage_gids = [27]
//!
//! [gate]
//! cache_ttl_ms = 500
//!
//! [catalog]
//! dir = "/etc/battd/catalog"
//! trusted_signers = [{ common_name = "BatteryToolkit Signer", public_key = "…" }]
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::gate::CachePolicy;
use crate::identity::{DEFAULT_SUBSYSTEM_RETRIES, MAX_SUBSYSTEM_RETRIES};
use crate::policy::{DEFAULT_MANAGE_UIDS, DEFAULT_PERMITTED_SECURITY_ENTITLEMENTS, PolicyRule};

/// Top-level daemon configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BattdConfig {
    /// Daemon process settings.
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// Expected client identity.
    pub policy: PolicyConfig,

    /// Gate behaviour.
    #[serde(default)]
    pub gate: GateConfig,

    /// Signing catalog used by the Linux code-integrity backend.
    #[serde(default)]
    pub catalog: CatalogConfig,
}

impl BattdConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse and validate configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The TOML is invalid or has unknown keys
    /// - `policy.expected_common_name` is empty
    /// - `gate.subsystem_retries` exceeds [`MAX_SUBSYSTEM_RETRIES`]
    /// - `daemon.max_connections` or `daemon.handshake_timeout_ms` is zero
    /// - no user or group holds the manage right
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Checks constraints serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] describing the first violation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.policy.expected_common_name.trim().is_empty() {
            return Err(ConfigError::Validation(
                "policy.expected_common_name must not be empty".to_string(),
            ));
        }
        if self
            .policy
            .expected_bundle_identifiers
            .iter()
            .any(String::is_empty)
        {
            return Err(ConfigError::Validation(
                "policy.expected_bundle_identifiers must not contain empty strings".to_string(),
            ));
        }
        if self.gate.subsystem_retries > MAX_SUBSYSTEM_RETRIES {
            return Err(ConfigError::Validation(format!(
                "gate.subsystem_retries must be at most {MAX_SUBSYSTEM_RETRIES}, got {}",
                self.gate.subsystem_retries
            )));
        }
        if self.daemon.max_connections == 0 {
            return Err(ConfigError::Validation(
                "daemon.max_connections must be greater than zero".to_string(),
            ));
        }
        if self.daemon.handshake_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "daemon.handshake_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.policy.manage_uids.is_empty() && self.policy.manage_gids.is_empty() {
            return Err(ConfigError::Validation(
                "policy.manage_uids and policy.manage_gids must not both be empty".to_string(),
            ));
        }
        for signer in &self.catalog.trusted_signers {
            if signer.common_name.is_empty() || signer.public_key.is_empty() {
                return Err(ConfigError::Validation(
                    "catalog.trusted_signers entries need common_name and public_key".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Builds the policy rule from `[policy]`.
    #[must_use]
    pub fn policy_rule(&self) -> PolicyRule {
        let policy = &self.policy;
        let mut rule = PolicyRule::new(policy.expected_common_name.clone())
            .with_bundle_identifiers(policy.expected_bundle_identifiers.iter().cloned())
            .require_hardened_runtime(policy.require_hardened_runtime)
            .with_permitted_security_entitlements(
                policy.permitted_security_entitlements.iter().cloned(),
            )
            .with_manage_principals(
                policy.manage_uids.iter().copied(),
                policy.manage_gids.iter().copied(),
            );
        if let Some(team) = &policy.expected_team_identifier {
            rule = rule.with_team_identifier(team.clone());
        }
        rule
    }

    /// Cache policy from `[gate]`.
    #[must_use]
    pub const fn cache_policy(&self) -> CachePolicy {
        CachePolicy::from_ttl_ms(self.gate.cache_ttl_ms)
    }
}

/// `[daemon]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DaemonConfig {
    /// Control socket path.
    #[serde(default = "default_socket")]
    pub socket: PathBuf,

    /// Path to the PID file.
    #[serde(default = "default_pid_file")]
    pub pid_file: PathBuf,

    /// Maximum concurrent client connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Time a client has to send its Hello, in milliseconds.
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket: default_socket(),
            pid_file: default_pid_file(),
            max_connections: default_max_connections(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
        }
    }
}

/// `[policy]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyConfig {
    /// Common name of the signing certificate of authorized clients.
    pub expected_common_name: String,

    /// Accepted signing identifiers. Empty accepts any.
    #[serde(default)]
    pub expected_bundle_identifiers: Vec<String>,

    /// Required team identifier.
    #[serde(default)]
    pub expected_team_identifier: Option<String>,

    /// Deny clients without the hardened-runtime flag.
    #[serde(default)]
    pub require_hardened_runtime: bool,

    /// `security.` entitlements clients may carry.
    #[serde(default = "default_permitted_security_entitlements")]
    pub permitted_security_entitlements: Vec<String>,

    /// Users allowed to change power state. Defaults to root.
    #[serde(default = "default_manage_uids")]
    pub manage_uids: Vec<u32>,

    /// Primary groups allowed to change power state.
    #[serde(default)]
    pub manage_gids: Vec<u32>,
}

/// `[gate]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GateConfig {
    /// Reuse an Allow per connection for this many milliseconds. Absent
    /// re-evaluates on every privileged call.
    #[serde(default)]
    pub cache_ttl_ms: Option<u64>,

    /// Retries after a transient code-integrity failure.
    #[serde(default = "default_subsystem_retries")]
    pub subsystem_retries: u32,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            cache_ttl_ms: None,
            subsystem_retries: default_subsystem_retries(),
        }
    }
}

/// `[catalog]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CatalogConfig {
    /// Directory of `<sha256>.json` catalog entries.
    #[serde(default = "default_catalog_dir")]
    pub dir: PathBuf,

    /// Signers whose catalog entries are trusted.
    #[serde(default)]
    pub trusted_signers: Vec<TrustedSignerConfig>,

    /// Hex Ed25519 public keys whose entries are revoked.
    #[serde(default)]
    pub revoked_keys: Vec<String>,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            dir: default_catalog_dir(),
            trusted_signers: Vec::new(),
            revoked_keys: Vec::new(),
        }
    }
}

/// A trusted catalog signer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrustedSignerConfig {
    /// Certificate common name the signer vouches for.
    pub common_name: String,
    /// Hex Ed25519 public key.
    pub public_key: String,
}

fn default_socket() -> PathBuf {
    PathBuf::from("/run/battd/battd.sock")
}

fn default_pid_file() -> PathBuf {
    PathBuf::from("/run/battd/battd.pid")
}

const fn default_max_connections() -> usize {
    32
}

const fn default_handshake_timeout_ms() -> u64 {
    5_000
}

fn default_manage_uids() -> Vec<u32> {
    DEFAULT_MANAGE_UIDS.to_vec()
}

fn default_permitted_security_entitlements() -> Vec<String> {
    DEFAULT_PERMITTED_SECURITY_ENTITLEMENTS
        .iter()
        .map(|s| (*s).to_string())
        .collect()
}

const fn default_subsystem_retries() -> u32 {
    DEFAULT_SUBSYSTEM_RETRIES
}

fn default_catalog_dir() -> PathBuf {
    PathBuf::from("/etc/battd/catalog")
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// I/O error reading configuration file.
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Validation error.
    #[error("configuration validation failed: {0}")]
    Validation(String),
}
