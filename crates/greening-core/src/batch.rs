//! Scenario batch orchestration and the labeled scenario stack.
//!
//! The stack is indexed by `(interaction, change_prop, run)` slot plus the
//! raster grid. Endpoint slices (`change_prop` 0 and 1) are computed once and
//! shared by every `(interaction, run)` slot.

use std::fs::File;
use std::io::{self, BufReader, BufWriter};
use std::path::Path;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::biophysical::{BaseCategory, BiophysicalTable};
use crate::config::{BatchConfig, ConfigError};
use crate::eligibility::{build_eligibility, inner_road_mask, EligibilityError, ExclusionMask};
use crate::next_code::build_next_code_map;
use crate::raster::{GeoTransform, LulcCode, LulcRaster, RasterError};
use crate::scenario::{generate, Interaction, Scenario, ScenarioError};

/// Dimension names of the persisted stack, outermost first.
pub const STACK_DIMS: [&str; 5] = ["interaction", "change_prop", "scenario_run", "y", "x"];

#[derive(Error, Debug)]
pub enum BatchError {
    #[error("invalid batch configuration: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Eligibility(#[from] EligibilityError),
    #[error(transparent)]
    Scenario(#[from] ScenarioError),
    #[error(transparent)]
    Raster(#[from] RasterError),
    #[error("stack I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("stack JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("malformed stack file: {0}")]
    Format(String),
}

// ── Seeds ─────────────────────────────────────────────────────────────────────

fn splitmix64(mut z: u64) -> u64 {
    z = z.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Per-scenario RNG seed. Depends only on its keys, never on the order in
/// which scenarios are generated.
pub fn scenario_seed(seed: u64, interaction: Interaction, change_prop: f64, run: usize) -> u64 {
    [interaction.key(), change_prop.to_bits(), run as u64]
        .into_iter()
        .fold(splitmix64(seed), |h, key| splitmix64(h ^ key))
}

// ── Stack ─────────────────────────────────────────────────────────────────────

/// Grid shape and georeferencing shared by every slice of a stack.
#[derive(Debug, Clone, PartialEq)]
struct Grid {
    width: usize,
    height: usize,
    nodata: LulcCode,
    transform: GeoTransform,
    crs: Option<String>,
}

impl Grid {
    fn of(raster: &LulcRaster) -> Self {
        Self {
            width: raster.width,
            height: raster.height,
            nodata: raster.nodata,
            transform: raster.transform,
            crs: raster.crs.clone(),
        }
    }

    fn cells(&self) -> usize {
        self.width * self.height
    }
}

/// Scenario LULC rasters (and optionally simulated temperatures) for every
/// `(interaction, change_prop, run)` slot.
///
/// Slots are numbered interaction-major, then change proportion, then run.
#[derive(Debug, Clone)]
pub struct ScenarioStack {
    interactions: Vec<Interaction>,
    change_props: Vec<f64>,
    num_runs: usize,
    grid: Grid,
    lulc: Vec<Arc<[LulcCode]>>,
    temperature: Option<Vec<Option<Arc<[f32]>>>>,
}

impl ScenarioStack {
    pub fn interactions(&self) -> &[Interaction] {
        &self.interactions
    }

    pub fn change_props(&self) -> &[f64] {
        &self.change_props
    }

    pub fn num_runs(&self) -> usize {
        self.num_runs
    }

    /// Number of slots.
    pub fn len(&self) -> usize {
        self.lulc.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lulc.is_empty()
    }

    /// (height, width) of every slice.
    pub fn shape(&self) -> (usize, usize) {
        (self.grid.height, self.grid.width)
    }

    pub fn nodata(&self) -> LulcCode {
        self.grid.nodata
    }

    pub fn transform(&self) -> GeoTransform {
        self.grid.transform
    }

    pub fn crs(&self) -> Option<&str> {
        self.grid.crs.as_deref()
    }

    pub fn slot(&self, interaction: usize, change_prop: usize, run: usize) -> usize {
        (interaction * self.change_props.len() + change_prop) * self.num_runs + run
    }

    /// Inverse of [`ScenarioStack::slot`].
    pub fn slot_indices(&self, slot: usize) -> (usize, usize, usize) {
        let run = slot % self.num_runs;
        let rest = slot / self.num_runs;
        (rest / self.change_props.len(), rest % self.change_props.len(), run)
    }

    pub fn scenario(&self, slot: usize) -> Scenario {
        let (i, p, run) = self.slot_indices(slot);
        Scenario { interaction: self.interactions[i], change_prop: self.change_props[p], run }
    }

    /// Slot of the first occurrence of `(interaction, change_prop, run)`.
    pub fn find(&self, interaction: Interaction, change_prop: f64, run: usize) -> Option<usize> {
        let i = self.interactions.iter().position(|&x| x == interaction)?;
        let p = self.change_props.iter().position(|&x| x == change_prop)?;
        (run < self.num_runs).then(|| self.slot(i, p, run))
    }

    pub fn lulc(&self, slot: usize) -> &[LulcCode] {
        &self.lulc[slot]
    }

    /// Slice `slot` as a standalone raster with the stack's georeferencing.
    pub fn lulc_raster(&self, slot: usize) -> LulcRaster {
        LulcRaster {
            data: self.lulc[slot].to_vec(),
            width: self.grid.width,
            height: self.grid.height,
            nodata: self.grid.nodata,
            transform: self.grid.transform,
            crs: self.grid.crs.clone(),
        }
    }

    /// Whether two slots point at the same storage.
    pub fn shares_lulc(&self, a: usize, b: usize) -> bool {
        Arc::ptr_eq(&self.lulc[a], &self.lulc[b])
    }

    pub(crate) fn lulc_arc(&self, slot: usize) -> &Arc<[LulcCode]> {
        &self.lulc[slot]
    }

    pub fn has_temperature(&self) -> bool {
        self.temperature.is_some()
    }

    /// Simulated temperature of `slot`; `None` when not simulated or failed.
    pub fn temperature(&self, slot: usize) -> Option<&[f32]> {
        self.temperature.as_ref()?.get(slot)?.as_deref()
    }

    pub fn set_temperatures(&mut self, temps: Vec<Option<Arc<[f32]>>>) -> Result<(), BatchError> {
        if temps.len() != self.len() {
            return Err(BatchError::Format(format!(
                "{} temperature slots for a stack of {}",
                temps.len(),
                self.len()
            )));
        }
        let cells = self.grid.cells();
        if let Some(bad) = temps.iter().flatten().find(|t| t.len() != cells) {
            return Err(RasterError::SizeMismatch {
                len: bad.len(),
                width: self.grid.width,
                height: self.grid.height,
            }
            .into());
        }
        self.temperature = Some(temps);
        Ok(())
    }

    pub fn x_coords(&self) -> Vec<f64> {
        (0..self.grid.width).map(|c| self.grid.transform.xy(0, c).0).collect()
    }

    pub fn y_coords(&self) -> Vec<f64> {
        (0..self.grid.height).map(|r| self.grid.transform.xy(r, 0).1).collect()
    }

    // ── Persistence ───────────────────────────────────────────────────────────

    pub fn save_json(&self, path: impl AsRef<Path>) -> Result<(), BatchError> {
        let writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer(writer, &self.to_file())?;
        Ok(())
    }

    pub fn load_json(path: impl AsRef<Path>) -> Result<Self, BatchError> {
        let reader = BufReader::new(File::open(path)?);
        let file: StackFile = serde_json::from_reader(reader)?;
        Self::from_file(file)
    }

    /// Point equal `change_prop` 0 and 1 slices at one storage again, so a
    /// loaded stack shares them the way [`run_batch`] built them.
    fn share_endpoint_slices(&mut self) {
        for p in 0..self.change_props.len() {
            let change_prop = self.change_props[p];
            if change_prop != 0.0 && change_prop != 1.0 {
                continue;
            }
            let mut shared: Vec<Arc<[LulcCode]>> = Vec::new();
            for i in 0..self.interactions.len() {
                for r in 0..self.num_runs {
                    let slot = self.slot(i, p, r);
                    match shared.iter().find(|s| s[..] == self.lulc[slot][..]) {
                        Some(s) => self.lulc[slot] = Arc::clone(s),
                        None => shared.push(Arc::clone(&self.lulc[slot])),
                    }
                }
            }
        }
    }

    fn to_file(&self) -> StackFile {
        let lulc = self.lulc.iter().flat_map(|s| s.iter().copied()).collect();
        let cells = self.grid.cells();
        let temperature = self.temperature.as_ref().map(|temps| {
            temps
                .iter()
                .flat_map(|slot| match slot {
                    Some(t) => t.iter().map(|&v| v.is_finite().then_some(v)).collect::<Vec<_>>(),
                    None => vec![None; cells],
                })
                .collect()
        });
        StackFile {
            dims: STACK_DIMS.iter().map(|d| d.to_string()).collect(),
            coords: StackCoords {
                interaction: self.interactions.clone(),
                change_prop: self.change_props.clone(),
                scenario_run: (0..self.num_runs).collect(),
                y: self.y_coords(),
                x: self.x_coords(),
            },
            attrs: StackAttrs {
                crs: self.grid.crs.clone(),
                transform: self.grid.transform.to_gdal(),
                nodata: self.grid.nodata,
            },
            lulc,
            temperature,
        }
    }

    fn from_file(file: StackFile) -> Result<Self, BatchError> {
        if file.dims != STACK_DIMS {
            return Err(BatchError::Format(format!("unexpected dims {:?}", file.dims)));
        }
        let StackCoords { interaction, change_prop, scenario_run, y, x } = file.coords;
        let grid = Grid {
            width: x.len(),
            height: y.len(),
            nodata: file.attrs.nodata,
            transform: GeoTransform::from_gdal(file.attrs.transform),
            crs: file.attrs.crs,
        };
        let cells = grid.cells();
        let slots = interaction.len() * change_prop.len() * scenario_run.len();
        if file.lulc.len() != slots * cells {
            return Err(BatchError::Format(format!(
                "{} LULC values for {} slots of {} cells",
                file.lulc.len(),
                slots,
                cells
            )));
        }

        let chunk = cells.max(1);
        let lulc: Vec<Arc<[LulcCode]>> = if cells == 0 {
            vec![Arc::from(Vec::new()); slots]
        } else {
            file.lulc.chunks(chunk).map(Arc::from).collect()
        };

        let mut stack = Self {
            interactions: interaction,
            change_props: change_prop,
            num_runs: scenario_run.len(),
            grid,
            lulc,
            temperature: None,
        };
        stack.share_endpoint_slices();

        if let Some(values) = file.temperature {
            if values.len() != slots * cells {
                return Err(BatchError::Format(format!(
                    "{} temperature values for {} slots of {} cells",
                    values.len(),
                    slots,
                    cells
                )));
            }
            // A slot with no value at all was never simulated (or failed).
            let temps = values
                .chunks(chunk)
                .take(slots)
                .map(|slot| {
                    if slot.iter().all(Option::is_none) {
                        None
                    } else {
                        let data: Vec<f32> = slot.iter().map(|v| v.unwrap_or(f32::NAN)).collect();
                        Some(Arc::from(data))
                    }
                })
                .collect();
            stack.set_temperatures(temps)?;
        }
        Ok(stack)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StackFile {
    dims: Vec<String>,
    coords: StackCoords,
    attrs: StackAttrs,
    lulc: Vec<LulcCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    temperature: Option<Vec<Option<f32>>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StackCoords {
    interaction: Vec<Interaction>,
    change_prop: Vec<f64>,
    scenario_run: Vec<usize>,
    y: Vec<f64>,
    x: Vec<f64>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StackAttrs {
    crs: Option<String>,
    transform: [f64; 6],
    nodata: LulcCode,
}

// ── Orchestrator ──────────────────────────────────────────────────────────────

/// Generate every scenario of `config` from `raster`, excluding inner roads.
pub fn run_batch(raster: &LulcRaster, table: &BiophysicalTable, config: &BatchConfig) -> Result<ScenarioStack, BatchError> {
    let exclusion = inner_road_mask(raster, table);
    run_batch_with_exclusion(raster, table, config, &exclusion)
}

/// [`run_batch`] with an explicit exclusion mask.
///
/// Order of work:
///   1. Next-code map and eligibility index (once)
///   2. `change_prop` 0 and 1 slices (once, shared across slots)
///   3. Every other slot with its own seeded RNG
pub fn run_batch_with_exclusion(
    raster: &LulcRaster,
    table: &BiophysicalTable,
    config: &BatchConfig,
    exclusion: &ExclusionMask,
) -> Result<ScenarioStack, BatchError> {
    config.validate()?;

    let next_codes = build_next_code_map(table, &BaseCategory::CHANGEABLE);
    let index = build_eligibility(raster, &next_codes, table, config.shade_threshold, exclusion)?;
    info!(
        eligible = index.len(),
        next_codes = next_codes.len(),
        shade_threshold = config.shade_threshold,
        "eligibility built"
    );

    let start: Arc<[LulcCode]> = Arc::from(raster.data.clone());
    let mut end: Option<Arc<[LulcCode]>> = None;

    let n_slots = config.interactions.len() * config.change_props.len() * config.num_runs;
    let mut lulc: Vec<Arc<[LulcCode]>> = Vec::with_capacity(n_slots);
    for &interaction in &config.interactions {
        for &change_prop in &config.change_props {
            for run in 0..config.num_runs {
                let mut rng = StdRng::seed_from_u64(scenario_seed(config.seed, interaction, change_prop, run));
                let slice = if change_prop == 0.0 {
                    Arc::clone(&start)
                } else if change_prop == 1.0 {
                    match &end {
                        Some(end) => Arc::clone(end),
                        None => {
                            let full = generate(&index, raster, 1.0, interaction, &mut rng)?;
                            let shared: Arc<[LulcCode]> = Arc::from(full.data);
                            end = Some(Arc::clone(&shared));
                            shared
                        }
                    }
                } else {
                    let out = generate(&index, raster, change_prop, interaction, &mut rng)?;
                    Arc::from(out.data)
                };
                debug!(%interaction, change_prop, run, "generated scenario");
                lulc.push(slice);
            }
        }
    }

    info!(scenarios = lulc.len(), "generated scenario LULC stack");
    Ok(ScenarioStack {
        interactions: config.interactions.clone(),
        change_props: config.change_props.clone(),
        num_runs: config.num_runs,
        grid: Grid::of(raster),
        lulc,
        temperature: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::biophysical::BiophysicalRecord as Rec;

    const NODATA: LulcCode = 0;

    /// Garden codes 1 (shade 0.1) -> 2 (shade 0.9), 3 is a high-tree garden.
    fn table() -> BiophysicalTable {
        BiophysicalTable::new(vec![
            Rec::new(1, BaseCategory::Garden, 0.1, 0.0),
            Rec::new(2, BaseCategory::Garden, 0.8, 0.0),
            Rec::new(3, BaseCategory::Other(20), 0.9, 0.0),
        ])
        .unwrap()
    }

    /// 12x12 raster of low-shade gardens with a block of trees in one corner.
    fn raster() -> LulcRaster {
        let mut r = LulcRaster::filled(12, 12, 1, NODATA).with_crs("epsg:2056");
        r.transform = GeoTransform::from_origin(2_530_000.0, 1_160_000.0, 10.0, 10.0);
        for row in 0..4 {
            for col in 0..4 {
                r.set(row, col, 3);
            }
        }
        r.set(11, 11, NODATA);
        r
    }

    fn config() -> BatchConfig {
        BatchConfig {
            change_props: vec![0.0, 0.5, 1.0],
            interactions: vec![Interaction::Cluster, Interaction::Scatter],
            num_runs: 3,
            shade_threshold: 0.75,
            seed: 7,
        }
    }

    #[test]
    fn endpoints_are_shared_and_middle_differs() {
        let src = raster();
        let stack = run_batch(&src, &table(), &config()).unwrap();
        assert_eq!(stack.len(), 18);

        let zero: Vec<usize> = (0..2).flat_map(|i| (0..3).map(move |r| (i, r))).map(|(i, r)| stack.slot(i, 0, r)).collect();
        let one: Vec<usize> = (0..2).flat_map(|i| (0..3).map(move |r| (i, r))).map(|(i, r)| stack.slot(i, 2, r)).collect();
        for &s in &zero {
            assert_eq!(stack.lulc(s), &src.data[..]);
            assert!(stack.shares_lulc(s, zero[0]));
        }
        for &s in &one {
            assert!(stack.shares_lulc(s, one[0]));
        }
        // every eligible garden is greened at p = 1
        assert!(stack.lulc(one[0]).iter().all(|&c| c != 1));

        let cluster = stack.lulc(stack.slot(0, 1, 0));
        let scatter = stack.lulc(stack.slot(1, 1, 0));
        assert_ne!(cluster, scatter);
        assert_ne!(cluster, &src.data[..]);
    }

    #[test]
    fn half_proportion_changes_half_of_eligible_cells() {
        let src = raster();
        let stack = run_batch(&src, &table(), &config()).unwrap();
        // 144 cells - 16 trees - 1 nodata
        let eligible = 127;
        let slot = stack.slot(0, 1, 2);
        let changed = stack.lulc(slot).iter().zip(&src.data).filter(|(a, b)| a != b).count();
        assert_eq!(changed, eligible / 2);
    }

    #[test]
    fn cluster_greens_next_to_existing_trees() {
        let src = raster();
        let stack = run_batch(&src, &table(), &config()).unwrap();
        let slot = stack.find(Interaction::Cluster, 0.5, 0).unwrap();
        let lulc = stack.lulc(slot);
        // cells touching the tree block score highest and are always taken
        assert_eq!(lulc[4 * 12], 2);
        assert_eq!(lulc[4], 2);
        let slot = stack.find(Interaction::Scatter, 0.5, 0).unwrap();
        assert_eq!(stack.lulc(slot)[4 * 12], 1);
    }

    #[test]
    fn same_seed_same_stack_and_seeds_are_keyed() {
        let a = run_batch(&raster(), &table(), &config()).unwrap();
        let b = run_batch(&raster(), &table(), &config()).unwrap();
        for s in 0..a.len() {
            assert_eq!(a.lulc(s), b.lulc(s));
        }
        let base = scenario_seed(7, Interaction::Cluster, 0.5, 0);
        assert_ne!(base, scenario_seed(7, Interaction::Scatter, 0.5, 0));
        assert_ne!(base, scenario_seed(7, Interaction::Cluster, 0.25, 0));
        assert_ne!(base, scenario_seed(7, Interaction::Cluster, 0.5, 1));
        assert_ne!(base, scenario_seed(8, Interaction::Cluster, 0.5, 0));
    }

    #[test]
    fn slot_indexing_roundtrips() {
        let stack = run_batch(&raster(), &table(), &config()).unwrap();
        for slot in 0..stack.len() {
            let (i, p, r) = stack.slot_indices(slot);
            assert_eq!(stack.slot(i, p, r), slot);
        }
        let sc = stack.scenario(stack.slot(1, 1, 2));
        assert_eq!(sc, Scenario { interaction: Interaction::Scatter, change_prop: 0.5, run: 2 });
        assert!(stack.find(Interaction::Random, 0.5, 0).is_none());
    }

    #[test]
    fn invalid_config_is_fatal() {
        let cfg = BatchConfig { change_props: vec![0.5, 1.5], ..config() };
        assert!(matches!(run_batch(&raster(), &table(), &cfg), Err(BatchError::Config(_))));
    }

    #[test]
    fn json_file_keeps_labels_and_missing_temperatures() {
        let src = raster();
        let mut stack = run_batch(&src, &table(), &config()).unwrap();
        let temps: Vec<Option<Arc<[f32]>>> = (0..stack.len())
            .map(|s| {
                if s == 4 {
                    None
                } else {
                    let mut t = vec![25.0f32; 144];
                    t[143] = f32::NAN;
                    Some(Arc::from(t))
                }
            })
            .collect();
        stack.set_temperatures(temps).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stack.json");
        stack.save_json(&path).unwrap();
        let back = ScenarioStack::load_json(&path).unwrap();

        assert_eq!(back.interactions(), stack.interactions());
        assert_eq!(back.change_props(), stack.change_props());
        assert_eq!(back.shape(), (12, 12));
        assert_eq!(back.crs(), Some("epsg:2056"));
        assert_eq!(back.transform(), stack.transform());
        for s in 0..stack.len() {
            assert_eq!(back.lulc(s), stack.lulc(s));
        }
        assert!(back.temperature(4).is_none());
        let t = back.temperature(0).unwrap();
        assert_eq!(t[0], 25.0);
        assert!(t[143].is_nan());
        assert_eq!(back.x_coords()[0], 2_530_005.0);
    }

    #[test]
    fn loaded_stack_shares_endpoint_slices() {
        let stack = run_batch(&raster(), &table(), &config()).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stack.json");
        stack.save_json(&path).unwrap();
        let back = ScenarioStack::load_json(&path).unwrap();

        for p in [0, 2] {
            let first = back.slot(0, p, 0);
            for i in 0..2 {
                for r in 0..3 {
                    assert!(back.shares_lulc(first, back.slot(i, p, r)));
                }
            }
        }
        assert!(!back.shares_lulc(back.slot(0, 1, 0), back.slot(0, 1, 1)));
        assert!(!back.shares_lulc(back.slot(0, 0, 0), back.slot(0, 2, 0)));
    }

    #[test]
    fn temperature_slots_must_match() {
        let mut stack = run_batch(&raster(), &table(), &config()).unwrap();
        assert!(stack.set_temperatures(vec![None; 3]).is_err());
        let bad: Vec<Option<Arc<[f32]>>> = (0..stack.len()).map(|_| Some(Arc::from(vec![0.0f32; 2]))).collect();
        assert!(stack.set_temperatures(bad).is_err());
    }
}
