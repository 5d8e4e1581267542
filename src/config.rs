//! Agent configuration.
//!
//! Loaded from a TOML file (`SERA_AGENT_CONFIG` overrides the default path),
//! with decision-service credentials overridable from the environment so
//! secrets can stay out of the file. Validation happens once at startup;
//! everything downstream receives already-checked values.

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::tracker::{default_interlocks, InterlockRule};

pub const DEFAULT_CONFIG_PATH: &str = "sera-agent.toml";

const DEFAULT_MONITORING_INTERVAL_SECS: u64 = 60;
const DEFAULT_DECISION_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    pub plc: PlcConf,
    pub decision: DecisionConf,
    #[serde(default)]
    pub control: ControlConf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlcConf {
    pub ip_address: String,
    #[serde(default)]
    pub rack: u16,
    #[serde(default = "default_slot")]
    pub slot: u16,
}

fn default_slot() -> u16 {
    1
}

#[derive(Debug, Clone, Deserialize)]
pub struct DecisionConf {
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    pub model: String,
    #[serde(default = "default_decision_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_decision_timeout_secs() -> u64 {
    DEFAULT_DECISION_TIMEOUT_SECS
}

#[derive(Debug, Clone, Deserialize)]
pub struct ControlConf {
    #[serde(default = "default_monitoring_interval_secs")]
    pub monitoring_interval_secs: u64,
    /// Defaults to one monitoring interval when absent.
    #[serde(default)]
    pub dwell_secs: Option<u64>,
    #[serde(default = "default_interlocks")]
    pub interlocks: Vec<InterlockRule>,
}

fn default_monitoring_interval_secs() -> u64 {
    DEFAULT_MONITORING_INTERVAL_SECS
}

impl Default for ControlConf {
    fn default() -> Self {
        Self {
            monitoring_interval_secs: DEFAULT_MONITORING_INTERVAL_SECS,
            dwell_secs: None,
            interlocks: default_interlocks(),
        }
    }
}

/// Resolved settings handed to the decision client.
#[derive(Debug, Clone)]
pub struct DecisionSettings {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub timeout: Duration,
}

impl AgentConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let mut config: AgentConfig = toml::from_str(&raw)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Environment beats file for decision-service settings. The lookup is
    /// injected so tests never touch process-wide state.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("BASE_URL") {
            self.decision.base_url = url;
        }
        if let Some(key) = lookup("GEMINI_API_KEY") {
            self.decision.api_key = key;
        }
        if let Some(model) = lookup("GEMINI_MODEL") {
            self.decision.model = model;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.plc.ip_address.is_empty() {
            bail!("plc.ip_address must not be empty");
        }
        if self.decision.base_url.is_empty() {
            bail!("decision.base_url must not be empty (file or BASE_URL)");
        }
        if self.decision.api_key.is_empty() {
            bail!("decision.api_key must not be empty (file or GEMINI_API_KEY)");
        }
        if self.decision.model.is_empty() {
            bail!("decision.model must not be empty (file or GEMINI_MODEL)");
        }
        if self.control.monitoring_interval_secs == 0 {
            bail!("control.monitoring_interval_secs must be at least 1");
        }
        if self.decision.timeout_secs == 0 {
            bail!("decision.timeout_secs must be at least 1");
        }
        for rule in &self.control.interlocks {
            if rule.yields == rule.wins {
                bail!(
                    "control.interlocks: {} cannot be interlocked with itself",
                    rule.yields
                );
            }
        }
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.control.monitoring_interval_secs)
    }

    pub fn dwell(&self) -> Duration {
        Duration::from_secs(
            self.control
                .dwell_secs
                .unwrap_or(self.control.monitoring_interval_secs),
        )
    }

    pub fn decision_settings(&self) -> DecisionSettings {
        DecisionSettings {
            base_url: self.decision.base_url.clone(),
            api_key: self.decision.api_key.clone(),
            model: self.decision.model.clone(),
            timeout: Duration::from_secs(self.decision.timeout_secs),
        }
    }
}
