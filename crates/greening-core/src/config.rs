//! Serde-backed run configuration for scenario sweeps and temperature
//! simulation.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::scenario::{validate_change_prop, Interaction};

/// Tree cover from which a code counts as "high tree" for adjacency.
pub const DEFAULT_SHADE_THRESHOLD: f64 = 0.75;
pub const DEFAULT_NUM_RUNS: usize = 10;
pub const DEFAULT_CHANGE_PROP_STEP: f64 = 0.1;
pub const DEFAULT_SEED: u64 = 42;

/// Decimal places `change_prop_steps` rounds to, so that 0.1 * 3 is 0.3.
const STEP_DECIMALS: i32 = 10;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("change proportion {0} is outside [0, 1]")]
    InvalidChangeProp(f64),
    #[error("change proportion step {0} must be in (0, 1]")]
    InvalidStep(f64),
    #[error("shade threshold {0} is outside [0, 1]")]
    InvalidThreshold(f64),
    #[error("number of scenario runs must be at least 1")]
    NoRuns,
    #[error("no {0} configured")]
    Empty(&'static str),
    #[error("duplicate {0} in configuration")]
    Duplicate(&'static str),
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Json(#[from] serde_json::Error),
}

// ── Batch ─────────────────────────────────────────────────────────────────────

/// Scenario sweep: every (interaction, change_prop, run) combination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub change_props: Vec<f64>,
    pub interactions: Vec<Interaction>,
    pub num_runs: usize,
    pub shade_threshold: f64,
    /// Master seed; per-scenario seeds are derived from it.
    pub seed: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            change_props: change_prop_steps(DEFAULT_CHANGE_PROP_STEP, true),
            interactions: vec![Interaction::Cluster, Interaction::Scatter],
            num_runs: DEFAULT_NUM_RUNS,
            shade_threshold: DEFAULT_SHADE_THRESHOLD,
            seed: DEFAULT_SEED,
        }
    }
}

impl BatchConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.change_props.is_empty() {
            return Err(ConfigError::Empty("change proportions"));
        }
        for &p in &self.change_props {
            validate_change_prop(p).map_err(|_| ConfigError::InvalidChangeProp(p))?;
        }
        let mut sorted = self.change_props.clone();
        sorted.sort_by(|a, b| a.total_cmp(b));
        if sorted.windows(2).any(|w| w[0] == w[1]) {
            return Err(ConfigError::Duplicate("change proportion"));
        }

        if self.interactions.is_empty() {
            return Err(ConfigError::Empty("interactions"));
        }
        let mut interactions = self.interactions.clone();
        interactions.sort();
        interactions.dedup();
        if interactions.len() != self.interactions.len() {
            return Err(ConfigError::Duplicate("interaction"));
        }

        if self.num_runs == 0 {
            return Err(ConfigError::NoRuns);
        }
        if !(0.0..=1.0).contains(&self.shade_threshold) {
            return Err(ConfigError::InvalidThreshold(self.shade_threshold));
        }
        Ok(())
    }

    pub fn from_json_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }
}

/// Evenly spaced change proportions `0, step, 2*step, ..., 1`.
///
/// The grid always ends at 1 (a final short step is added when `step` does
/// not divide 1). Without endpoints the leading 0 and trailing 1 are dropped.
pub fn change_prop_steps(step: f64, include_endpoints: bool) -> Vec<f64> {
    if !(step > 0.0 && step <= 1.0) {
        return Vec::new();
    }
    let scale = 10f64.powi(STEP_DECIMALS);
    let n = (1.0 / step + 1e-9).floor() as usize;
    let mut props: Vec<f64> = (0..=n).map(|i| ((i as f64 * step) * scale).round() / scale).collect();
    if props.last().is_some_and(|&last| last < 1.0) {
        props.push(1.0);
    }
    if !include_endpoints {
        props.retain(|&p| p > 0.0 && p < 1.0);
    }
    props
}

/// Validated variant of [`change_prop_steps`].
pub fn try_change_prop_steps(step: f64, include_endpoints: bool) -> Result<Vec<f64>, ConfigError> {
    if !(step > 0.0 && step <= 1.0) {
        return Err(ConfigError::InvalidStep(step));
    }
    Ok(change_prop_steps(step, include_endpoints))
}

// ── Temperature simulation ────────────────────────────────────────────────────

/// What a failed temperature simulation does to the batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Record the failure, leave the slot missing and keep going.
    #[default]
    BestEffort,
    /// Fail the whole batch (after every scenario has finished).
    Abort,
}

/// Fixed inputs of the urban cooling model, shared by every scenario.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UcmInputs {
    pub biophysical_table: PathBuf,
    pub ref_et_raster: PathBuf,
    /// Rural reference air temperature (°C).
    pub t_ref: f64,
    /// Urban heat island magnitude (°C).
    pub uhi_max: f64,
    /// Cooling capacity method.
    #[serde(default = "default_cc_method")]
    pub cc_method: String,
    /// Calibrated model parameters, passed through verbatim.
    #[serde(default)]
    pub params: BTreeMap<String, serde_json::Value>,
}

fn default_cc_method() -> String {
    "factors".to_string()
}

impl UcmInputs {
    pub fn new(biophysical_table: impl Into<PathBuf>, ref_et_raster: impl Into<PathBuf>, t_ref: f64, uhi_max: f64) -> Self {
        Self {
            biophysical_table: biophysical_table.into(),
            ref_et_raster: ref_et_raster.into(),
            t_ref,
            uhi_max,
            cc_method: default_cc_method(),
            params: BTreeMap::new(),
        }
    }

    /// Load calibrated parameters from a JSON object file.
    pub fn with_params_file(mut self, path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        self.params = serde_json::from_str(&text)?;
        Ok(self)
    }

    /// Derive `t_ref` (minimum) and `uhi_max` (range) from station
    /// temperature observations. Non-finite readings are ignored.
    pub fn reference_from_observations(observations: &[f64]) -> Option<(f64, f64)> {
        let finite = observations.iter().copied().filter(|t| t.is_finite());
        let (min, max) = finite.fold(None, |acc: Option<(f64, f64)>, t| match acc {
            None => Some((t, t)),
            Some((lo, hi)) => Some((lo.min(t), hi.max(t))),
        })?;
        Some((min, max - min))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub failure_policy: FailurePolicy,
    /// Attempts after a transient failure.
    pub transient_retries: u32,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self { failure_policy: FailurePolicy::BestEffort, transient_retries: 1 }
    }
}

impl SimulationConfig {
    pub fn with_policy(failure_policy: FailurePolicy) -> Self {
        Self { failure_policy, transient_retries: 1 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn default_grid_has_eleven_points() {
        let props = change_prop_steps(0.1, true);
        assert_eq!(props.len(), 11);
        assert_eq!(props[0], 0.0);
        assert_eq!(props[3], 0.3);
        assert_eq!(*props.last().unwrap(), 1.0);
    }

    #[test]
    fn endpoints_can_be_dropped() {
        let props = change_prop_steps(0.125, false);
        assert_eq!(props, vec![0.125, 0.25, 0.375, 0.5, 0.625, 0.75, 0.875]);
    }

    #[test]
    fn uneven_step_still_ends_at_one() {
        let props = change_prop_steps(0.3, true);
        assert_eq!(props, vec![0.0, 0.3, 0.6, 0.9, 1.0]);
        assert!(try_change_prop_steps(0.0, true).is_err());
        assert!(try_change_prop_steps(1.5, true).is_err());
    }

    #[test]
    fn default_config_is_valid() {
        let cfg = BatchConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.num_runs, 10);
        assert_relative_eq!(cfg.shade_threshold, 0.75);
    }

    #[test]
    fn invalid_configs_are_rejected() {
        let mut cfg = BatchConfig { num_runs: 0, ..Default::default() };
        assert!(matches!(cfg.validate(), Err(ConfigError::NoRuns)));

        cfg = BatchConfig { change_props: vec![0.2, 1.2], ..Default::default() };
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidChangeProp(_))));

        cfg = BatchConfig { change_props: vec![f64::NAN], ..Default::default() };
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidChangeProp(_))));

        cfg = BatchConfig {
            interactions: vec![Interaction::Cluster, Interaction::Cluster],
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::Duplicate(_))));

        cfg = BatchConfig { shade_threshold: 2.0, ..Default::default() };
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidThreshold(_))));
    }

    #[test]
    fn batch_config_from_partial_json() {
        let cfg: BatchConfig = serde_json::from_str(
            r#"{"interactions": ["random"], "num_runs": 2, "change_props": [0.5]}"#,
        )
        .unwrap();
        assert_eq!(cfg.interactions, vec![Interaction::Random]);
        assert_eq!(cfg.seed, DEFAULT_SEED);
        cfg.validate().unwrap();
    }

    #[test]
    fn unknown_interaction_in_json_is_an_error() {
        let res: Result<BatchConfig, _> = serde_json::from_str(r#"{"interactions": ["clustered"]}"#);
        assert!(res.is_err());
    }

    #[test]
    fn ucm_inputs_defaults_and_params() {
        let dir = tempfile::tempdir().unwrap();
        let params_path = dir.path().join("params.json");
        fs::write(&params_path, r#"{"t_air_average_radius": 500, "k_gi": 0.6}"#).unwrap();

        let inputs = UcmInputs::new("table.csv", "ref_et.tif", 18.0, 6.5)
            .with_params_file(&params_path)
            .unwrap();
        assert_eq!(inputs.cc_method, "factors");
        assert_eq!(inputs.params.len(), 2);
        assert_eq!(inputs.params["k_gi"], serde_json::json!(0.6));
    }

    #[test]
    fn reference_temperatures_from_stations() {
        let (t_ref, uhi) = UcmInputs::reference_from_observations(&[21.5, f64::NAN, 18.0, 24.0]).unwrap();
        assert_relative_eq!(t_ref, 18.0);
        assert_relative_eq!(uhi, 6.0);
        assert!(UcmInputs::reference_from_observations(&[]).is_none());
    }

    #[test]
    fn failure_policy_defaults_to_best_effort() {
        let cfg: SimulationConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.failure_policy, FailurePolicy::BestEffort);
        assert_eq!(cfg.transient_retries, 1);
        let cfg: SimulationConfig = serde_json::from_str(r#"{"failure_policy": "abort"}"#).unwrap();
        assert_eq!(cfg.failure_policy, FailurePolicy::Abort);
    }
}
