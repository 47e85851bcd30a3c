//! Air-temperature simulation of a scenario stack through an external urban
//! cooling model.
//!
//! Each distinct LULC slice is simulated once (endpoint slices shared across
//! slots are not re-run). With the `threading` feature slices are simulated
//! in parallel; results always land in their own slot.

use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::Arc;

#[cfg(feature = "threading")]
use rayon::prelude::*;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::batch::{BatchError, ScenarioStack};
use crate::config::{FailurePolicy, SimulationConfig};
use crate::raster::{LulcCode, LulcRaster};
use crate::scenario::Scenario;

/// Lowest physically meaningful air temperature (°C). The model writes
/// values at or below it for cells it cannot simulate.
pub const ABSOLUTE_ZERO_C: f32 = -273.15;

#[derive(Error, Debug)]
pub enum ModelError {
    /// Worth retrying: scratch storage contention and the like.
    #[error("transient model failure: {0}")]
    Transient(String),
    #[error("model failed: {0}")]
    Failed(String),
    #[error("model returned {actual} values for a raster of {expected} cells")]
    ShapeMismatch { expected: usize, actual: usize },
    #[error("scratch I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ModelError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ModelError::Transient(_) | ModelError::Io(_))
    }
}

/// A calibrated model predicting a temperature field from a LULC raster.
///
/// Implementations hold every other model input themselves and must be pure
/// with respect to `lulc`: equal rasters give equal fields. `scratch_dir` is
/// an empty directory owned by this call and removed once it returns.
pub trait TemperatureModel: Sync {
    fn predict_temperature(&self, lulc: &LulcRaster, scratch_dir: &Path) -> Result<Vec<f32>, ModelError>;
}

#[derive(Error, Debug)]
pub enum SimulationError {
    /// Carries the full per-scenario report; the stack keeps every
    /// temperature that did succeed.
    #[error("{failed} of {total} scenario simulations failed (first: {first})")]
    Aborted { failed: usize, total: usize, first: String, report: SimulationReport },
    #[error(transparent)]
    Stack(#[from] BatchError),
}

/// Replace model nodata (at or below absolute zero) and non-finite values
/// with NaN.
pub fn mask_temperature(values: &mut [f32]) {
    for v in values.iter_mut() {
        if !v.is_finite() || *v <= ABSOLUTE_ZERO_C {
            *v = f32::NAN;
        }
    }
}

// ── Report ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct ScenarioOutcome {
    pub slot: usize,
    pub scenario: Scenario,
    /// Model invocations spent on the slice this slot shares.
    pub attempts: u32,
    pub error: Option<String>,
}

impl ScenarioOutcome {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Per-slot result of [`simulate_temperatures`], in slot order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SimulationReport {
    pub outcomes: Vec<ScenarioOutcome>,
    /// Distinct slices handed to the model.
    pub simulated: usize,
}

impl SimulationReport {
    pub fn failures(&self) -> impl Iterator<Item = &ScenarioOutcome> {
        self.outcomes.iter().filter(|o| !o.succeeded())
    }

    pub fn num_failed(&self) -> usize {
        self.failures().count()
    }

    pub fn all_succeeded(&self) -> bool {
        self.outcomes.iter().all(ScenarioOutcome::succeeded)
    }
}

// ── Fan-out ───────────────────────────────────────────────────────────────────

struct Job {
    /// First slot holding this slice.
    slot: usize,
}

struct JobResult {
    temperature: Result<Arc<[f32]>, ModelError>,
    attempts: u32,
}

/// Simulate every slot of `stack` and attach the temperatures to it.
///
/// A failed slice leaves its slots without temperature. Under
/// [`FailurePolicy::Abort`] the temperatures that did succeed are still
/// attached before the error is returned.
pub fn simulate_temperatures<M: TemperatureModel + ?Sized>(
    stack: &mut ScenarioStack,
    model: &M,
    config: &SimulationConfig,
) -> Result<SimulationReport, SimulationError> {
    // Group slots by storage so shared slices are simulated once.
    let mut job_of_slot = Vec::with_capacity(stack.len());
    let mut jobs: Vec<Job> = Vec::new();
    let mut seen: HashMap<*const LulcCode, usize> = HashMap::new();
    for slot in 0..stack.len() {
        let key = Arc::as_ptr(stack.lulc_arc(slot)) as *const LulcCode;
        let job = *seen.entry(key).or_insert_with(|| {
            jobs.push(Job { slot });
            jobs.len() - 1
        });
        job_of_slot.push(job);
    }
    info!(slots = stack.len(), distinct = jobs.len(), "simulating scenario temperatures");

    let retries = config.transient_retries;
    let shared: &ScenarioStack = stack;
    let run = |job: &Job| simulate_slice(model, &shared.lulc_raster(job.slot), retries);

    #[cfg(feature = "threading")]
    let results: Vec<JobResult> = jobs.par_iter().map(run).collect();
    #[cfg(not(feature = "threading"))]
    let results: Vec<JobResult> = jobs.iter().map(run).collect();

    let mut temps: Vec<Option<Arc<[f32]>>> = Vec::with_capacity(stack.len());
    let mut outcomes = Vec::with_capacity(stack.len());
    for (slot, &job) in job_of_slot.iter().enumerate() {
        let result = &results[job];
        let scenario = stack.scenario(slot);
        let error = match &result.temperature {
            Ok(t) => {
                temps.push(Some(Arc::clone(t)));
                None
            }
            Err(e) => {
                temps.push(None);
                Some(e.to_string())
            }
        };
        outcomes.push(ScenarioOutcome { slot, scenario, attempts: result.attempts, error });
    }

    for (job, result) in jobs.iter().zip(&results) {
        if let Err(e) = &result.temperature {
            warn!(scenario = %stack.scenario(job.slot), attempts = result.attempts, "simulation failed: {e}");
        }
    }

    stack.set_temperatures(temps)?;
    let report = SimulationReport { outcomes, simulated: jobs.len() };
    let failed = report.num_failed();
    info!(total = report.outcomes.len(), failed, "temperature simulation finished");

    if failed > 0 && config.failure_policy == FailurePolicy::Abort {
        let first = report.failures().next().and_then(|o| o.error.clone()).unwrap_or_default();
        return Err(SimulationError::Aborted { failed, total: report.outcomes.len(), first, report });
    }
    Ok(report)
}

/// Run the model on one slice, retrying transient failures up to `retries`
/// times. Every attempt gets a fresh scratch directory.
fn simulate_slice<M: TemperatureModel + ?Sized>(model: &M, lulc: &LulcRaster, retries: u32) -> JobResult {
    let mut attempts = 0;
    loop {
        attempts += 1;
        match attempt(model, lulc) {
            Ok(t) => {
                return JobResult { temperature: Ok(Arc::from(t)), attempts };
            }
            Err(e) if e.is_transient() && attempts <= retries => {
                debug!(attempts, "retrying after transient failure: {e}");
            }
            Err(e) => return JobResult { temperature: Err(e), attempts },
        }
    }
}

fn attempt<M: TemperatureModel + ?Sized>(model: &M, lulc: &LulcRaster) -> Result<Vec<f32>, ModelError> {
    let scratch = tempfile::Builder::new().prefix("greening-ucm-").tempdir()?;
    let mut values = model.predict_temperature(lulc, scratch.path())?;
    if values.len() != lulc.len() {
        return Err(ModelError::ShapeMismatch { expected: lulc.len(), actual: values.len() });
    }
    mask_temperature(&mut values);
    Ok(values)
}
