//! Rally configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{RallyError, Result};
use crate::plan::PhasePlan;

/// Upper bound for any configured duration or offset (ten years).
pub const MAX_SCHEDULE_MS: u64 = 10 * 365 * 24 * 60 * 60 * 1000;

fn check_ms(name: &str, ms: u64) -> Result<()> {
    if ms > MAX_SCHEDULE_MS {
        return Err(RallyError::Config(format!(
            "{name} = {ms}ms exceeds the {MAX_SCHEDULE_MS}ms limit"
        )));
    }
    Ok(())
}

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RallyConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    /// Delivery plans, one per phase. Phases without a plan send nothing.
    #[serde(default)]
    pub phases: Vec<PhasePlan>,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub relay: RelayConfig,
}

impl RallyConfig {
    /// Load config from the default path (~/.rally/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| RallyError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| RallyError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to a specific path.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| RallyError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject configs the engine cannot run.
    pub fn validate(&self) -> Result<()> {
        if self.engine.max_phase == 0 {
            return Err(RallyError::Config("engine.max_phase must be at least 1".into()));
        }
        check_ms("engine.phase_duration_ms", self.engine.phase_duration_ms)?;
        check_ms("engine.advance_debounce_ms", self.engine.advance_debounce_ms)?;
        let mut seen = std::collections::HashSet::new();
        for plan in &self.phases {
            if let Some(ms) = plan.duration_ms {
                check_ms(&format!("phases[{}].duration_ms", plan.phase), ms)?;
            }
            for step in &plan.steps {
                check_ms(&format!("phases[{}].base_offset_ms", plan.phase), step.base_offset_ms)?;
                check_ms(&format!("phases[{}].stagger_ms", plan.phase), step.stagger_ms)?;
            }
            if plan.phase >= self.engine.max_phase {
                return Err(RallyError::Config(format!(
                    "plan for phase {} exceeds max_phase {}",
                    plan.phase, self.engine.max_phase
                )));
            }
            if !seen.insert(plan.phase) {
                return Err(RallyError::Config(format!(
                    "duplicate plan for phase {}",
                    plan.phase
                )));
            }
        }
        if self.relay.enabled && self.relay.webhook_url.is_empty() {
            return Err(RallyError::Config("relay.enabled requires relay.webhook_url".into()));
        }
        Ok(())
    }

    /// Plan for a phase, if one is configured.
    pub fn plan_for(&self, phase: u32) -> Option<&PhasePlan> {
        self.phases.iter().find(|p| p.phase == phase)
    }

    /// Duration of a phase: the plan's override, else the engine default.
    pub fn phase_duration_ms(&self, phase: u32) -> u64 {
        self.plan_for(phase)
            .and_then(|p| p.duration_ms)
            .unwrap_or(self.engine.phase_duration_ms)
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the Rally home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".rally")
    }
}

/// Phase timing and sweep behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Number of phases per operation.
    #[serde(default = "default_max_phase")]
    pub max_phase: u32,
    /// Default phase duration; plans may override per phase.
    #[serde(default = "default_phase_duration_ms")]
    pub phase_duration_ms: u64,
    /// Manual advances within this window of the current phase start are duplicates.
    #[serde(default = "default_advance_debounce_ms")]
    pub advance_debounce_ms: u64,
    /// How often the sweep reconciles due phases and messages.
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    /// Complete operations whose final phase has run its duration.
    #[serde(default)]
    pub auto_complete: bool,
}

fn default_max_phase() -> u32 { 3 }
fn default_phase_duration_ms() -> u64 { 60 * 60 * 1000 }
fn default_advance_debounce_ms() -> u64 { 1000 }
fn default_sweep_interval_ms() -> u64 { 1000 }

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_phase: default_max_phase(),
            phase_duration_ms: default_phase_duration_ms(),
            advance_debounce_ms: default_advance_debounce_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
            auto_complete: false,
        }
    }
}

/// Operation store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// "sqlite" or "memory".
    #[serde(default = "default_store_backend")]
    pub backend: String,
    #[serde(default = "default_store_path")]
    pub path: String,
}

fn default_store_backend() -> String { "sqlite".into() }
fn default_store_path() -> String { "~/.rally/rally.db".into() }

impl StoreConfig {
    /// Store path with `~` expanded.
    pub fn resolved_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.path).to_string())
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_store_backend(),
            path: default_store_path(),
        }
    }
}

/// Gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_host")]
    pub host: String,
}

fn bool_true() -> bool { true }
fn default_port() -> u16 { 3100 }
fn default_host() -> String { "127.0.0.1".into() }

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_port(),
            host: default_host(),
        }
    }
}

/// Built-in webhook sender for ready messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub webhook_url: String,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_poll_interval_secs() -> u64 { 5 }
fn default_timeout_secs() -> u64 { 10 }

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            webhook_url: String::new(),
            headers: Vec::new(),
            poll_interval_secs: default_poll_interval_secs(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{PlanStep, Recipients};

    #[test]
    fn test_defaults_from_empty_toml() {
        let config: RallyConfig = toml::from_str("").unwrap();
        assert_eq!(config.engine.max_phase, 3);
        assert_eq!(config.store.backend, "sqlite");
        assert!(config.phases.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_phase_duration_override() {
        let mut config = RallyConfig::default();
        config.engine.phase_duration_ms = 1000;
        config.phases.push(PhasePlan {
            phase: 1,
            duration_ms: Some(250),
            steps: vec![PlanStep::new(Recipients::All, "go")],
        });
        assert_eq!(config.phase_duration_ms(0), 1000);
        assert_eq!(config.phase_duration_ms(1), 250);
    }

    #[test]
    fn test_validate_rejects_out_of_range_plan() {
        let mut config = RallyConfig::default();
        config.engine.max_phase = 2;
        config.phases.push(PhasePlan {
            phase: 2,
            ..Default::default()
        });
        assert!(matches!(config.validate(), Err(RallyError::Config(_))));

        config.phases[0].phase = 1;
        assert!(config.validate().is_ok());
        config.engine.max_phase = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_unbounded_durations() {
        let mut config = RallyConfig::default();
        config.engine.phase_duration_ms = u64::MAX;
        assert!(matches!(config.validate(), Err(RallyError::Config(_))));

        config.engine.phase_duration_ms = MAX_SCHEDULE_MS;
        assert!(config.validate().is_ok());

        config.phases.push(PhasePlan {
            phase: 0,
            duration_ms: Some(MAX_SCHEDULE_MS + 1),
            steps: vec![],
        });
        assert!(config.validate().is_err());

        config.phases[0].duration_ms = None;
        config.phases[0].steps.push(PlanStep::new(Recipients::Target, "x").at(u64::MAX));
        assert!(config.validate().is_err());

        config.phases[0].steps[0] = PlanStep::new(Recipients::All, "x").stagger(u64::MAX);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = std::env::temp_dir().join("rally-test-config");
        let path = dir.join("config.toml");
        let mut config = RallyConfig::default();
        config.engine.max_phase = 4;
        config.phases.push(PhasePlan {
            phase: 0,
            duration_ms: None,
            steps: vec![PlanStep::new(Recipients::Target, "kickoff").at(200)],
        });
        config.save_to(&path).unwrap();

        let loaded = RallyConfig::load_from(&path).unwrap();
        assert_eq!(loaded.engine.max_phase, 4);
        assert_eq!(loaded.phases, config.phases);
        std::fs::remove_dir_all(&dir).ok();
    }
}
