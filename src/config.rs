use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Named sync setups read from the user's config file
///
/// ```toml
/// [profiles.health]
/// journal = "~/health.ndjson"
/// endpoint = "https://TOKEN@alice.pryv.me/"
/// streams = ["health", "health/bodyMass"]
/// watch = true
/// ```
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub profiles: BTreeMap<String, Profile>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub journal: Option<String>,
    pub endpoint: Option<String>,
    pub source_id: Option<String>,
    pub watch: Option<bool>,
    pub interval_secs: Option<u64>,
    pub state: Option<String>,
    pub state_dir: Option<String>,
    pub streams: Option<Vec<String>>,
    pub snapshot: Option<String>,
}

impl Config {
    /// `$XDG_CONFIG_HOME/pryv-sync/config.toml`, falling back to the platform
    /// config directory
    pub fn config_path() -> Result<PathBuf> {
        let base = match std::env::var_os("XDG_CONFIG_HOME") {
            Some(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => dirs::config_dir().context("Could not determine config directory")?,
        };
        Ok(base.join("pryv-sync").join("config.toml"))
    }

    /// Load the config file; a missing file is an empty config
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    pub fn list_profiles(&self) -> Vec<&str> {
        self.profiles.keys().map(String::as_str).collect()
    }

    pub fn get_profile(&self, name: &str) -> Option<&Profile> {
        self.profiles.get(name)
    }

    /// Profile rendered for display
    pub fn show_profile(&self, name: &str) -> Option<String> {
        let profile = self.profiles.get(name)?;
        let mut out = format!("Profile: {}\n", name);

        let mut line = |key: &str, value: Option<String>| {
            if let Some(value) = value {
                out.push_str(&format!("  {:<14} {}\n", format!("{}:", key), value));
            }
        };
        line("journal", profile.journal.clone());
        line("endpoint", profile.endpoint.as_deref().map(redact_token));
        line("source_id", profile.source_id.clone());
        line("watch", profile.watch.map(|w| w.to_string()));
        line("interval_secs", profile.interval_secs.map(|i| i.to_string()));
        line("state", profile.state.clone());
        line("state_dir", profile.state_dir.clone());
        line("streams", profile.streams.as_ref().map(|s| s.join(", ")));
        line("snapshot", profile.snapshot.clone());

        Some(out.trim_end().to_string())
    }
}

/// Hide the access token embedded in an API endpoint
pub fn redact_token(endpoint: &str) -> String {
    match endpoint.split_once("://") {
        Some((scheme, rest)) => match rest.split_once('@') {
            Some((_, host)) => format!("{}://***@{}", scheme, host),
            None => endpoint.to_string(),
        },
        None => endpoint.to_string(),
    }
}
