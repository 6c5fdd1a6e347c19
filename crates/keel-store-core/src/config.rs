//! Provider configuration model.
//!
//! A single hierarchical JSON document with a `Providers` section describes
//! every configured backend. Field names keep the PascalCase spelling of the
//! source documents so existing configuration files load unchanged.

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::debug;

use crate::{StoreError, StoreResult};

//─────────────────────────────
//  Capability flags
//─────────────────────────────

/// A single provider capability flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[allow(missing_docs)]
pub enum Capability {
    Crud,
    Index,
    Archive,
    Purge,
    Backup,
    Health,
    Migration,
}

impl FromStr for Capability {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let cap = if s.eq_ignore_ascii_case("crud") {
            Self::Crud
        } else if s.eq_ignore_ascii_case("index") {
            Self::Index
        } else if s.eq_ignore_ascii_case("archive") {
            Self::Archive
        } else if s.eq_ignore_ascii_case("purge") {
            Self::Purge
        } else if s.eq_ignore_ascii_case("backup") {
            Self::Backup
        } else if s.eq_ignore_ascii_case("health") {
            Self::Health
        } else if s.eq_ignore_ascii_case("migration") {
            Self::Migration
        } else {
            return Err(StoreError::InvalidKey(format!("unknown capability '{s}'")));
        };
        Ok(cap)
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Crud => "Crud",
            Self::Index => "Index",
            Self::Archive => "Archive",
            Self::Purge => "Purge",
            Self::Backup => "Backup",
            Self::Health => "Health",
            Self::Migration => "Migration",
        };
        f.write_str(name)
    }
}

/// Additive set of [`Capability`] flags, written in configuration as a
/// comma-separated string such as `"Crud, Backup"`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities(BTreeSet<Capability>);

impl Capabilities {
    /// The empty capability set.
    pub fn none() -> Self {
        Self::default()
    }

    /// Whether `cap` is present in the set.
    pub fn contains(&self, cap: Capability) -> bool {
        self.0.contains(&cap)
    }

    /// Adds `cap` to the set.
    pub fn insert(&mut self, cap: Capability) {
        self.0.insert(cap);
    }

    /// Whether no flags are set.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates the flags in stable order.
    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        self.0.iter().copied()
    }
}

impl FromStr for Capabilities {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut set = BTreeSet::new();
        for part in s.split(',') {
            if part.trim().is_empty() {
                continue;
            }
            set.insert(part.parse::<Capability>()?);
        }
        Ok(Self(set))
    }
}

impl fmt::Display for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined = self
            .0
            .iter()
            .map(Capability::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        f.write_str(&joined)
    }
}

impl Serialize for Capabilities {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Capabilities {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

//─────────────────────────────
//  Provider settings
//─────────────────────────────

/// Configuration for one named storage provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase", default)]
pub struct ProviderSettings {
    /// Unique provider identity.
    pub name: String,
    /// Opaque hint kept for compatibility with reflection-driven source
    /// documents; not interpreted.
    pub assembly_name: Option<String>,
    /// Registry key selecting the backend kind. Falls back to `name` when
    /// absent.
    pub type_name: Option<String>,
    /// Providers with `Enabled: false` are skipped by the factory.
    pub enabled: bool,
    /// Additive capability flags.
    pub capabilities: Capabilities,
    /// Backend data location: a file path, or `:memory:` for SQLite-style
    /// backends.
    pub data_source: Option<String>,
    /// Root path for hive-backed providers.
    pub root_path: Option<PathBuf>,
    /// Application name for hive-backed providers.
    pub application_name: Option<String>,
    /// Service name for hive-backed providers.
    pub service_name: Option<String>,
    /// Per-value size ceiling in bytes.
    pub max_value_bytes: Option<usize>,
    /// Whether the backend compresses serialized values.
    pub enable_compression: bool,
    /// Per-operation timeout for command-oriented backends.
    pub command_timeout_seconds: Option<u64>,
    /// Connection attempts before the backend reports `Unavailable`.
    pub retry_count: u32,
    /// Delay between connection attempts, in milliseconds.
    pub retry_delay_ms: u64,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            name: String::new(),
            assembly_name: None,
            type_name: None,
            enabled: true,
            capabilities: Capabilities::none(),
            data_source: None,
            root_path: None,
            application_name: None,
            service_name: None,
            max_value_bytes: None,
            enable_compression: false,
            command_timeout_seconds: None,
            retry_count: 0,
            retry_delay_ms: 100,
        }
    }
}

impl ProviderSettings {
    /// A minimal enabled provider with the given name.
    pub fn named(name: impl Into<String>) -> Self {
        Self { name: name.into(), ..Self::default() }
    }

    /// The registry key selecting the backend kind: `TypeName` when set,
    /// otherwise `Name`.
    pub fn kind(&self) -> &str {
        self.type_name.as_deref().unwrap_or(&self.name)
    }
}

//─────────────────────────────
//  Top-level settings document
//─────────────────────────────

/// The single configuration document consumed by the provider factory.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct StoreSettings {
    /// Every configured provider, enabled or not.
    #[serde(default)]
    pub providers: Vec<ProviderSettings>,
}

impl StoreSettings {
    /// Parses a settings document from JSON text and validates it.
    pub fn from_json(text: &str) -> StoreResult<Self> {
        let settings: Self = serde_json::from_str(text).map_err(StoreError::serialization)?;
        settings.validate()?;
        debug!(providers = settings.providers.len(), "loaded store settings");
        Ok(settings)
    }

    /// Reads and parses a settings document from a file.
    pub fn from_file(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            StoreError::unavailable_from(format!("cannot read settings file {}", path.display()), e)
        })?;
        Self::from_json(&text)
    }

    /// Looks up a provider by its unique name.
    pub fn provider(&self, name: &str) -> Option<&ProviderSettings> {
        self.providers.iter().find(|p| p.name == name)
    }

    fn validate(&self) -> StoreResult<()> {
        let mut seen = BTreeSet::new();
        for provider in &self.providers {
            if provider.name.is_empty() {
                return Err(StoreError::InvalidKey("provider name must not be empty".into()));
            }
            if !seen.insert(provider.name.as_str()) {
                return Err(StoreError::InvalidKey(format!(
                    "duplicate provider name '{}'",
                    provider.name
                )));
            }
        }
        Ok(())
    }
}
