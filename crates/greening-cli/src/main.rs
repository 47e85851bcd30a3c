//! Urban greening scenario pipeline: cover-based LULC reclassification,
//! scenario stack generation, temperature simulation and landscape metrics.

mod raster_io;
mod ucm;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use greening_core::batch::{run_batch, ScenarioStack};
use greening_core::biophysical::BiophysicalTable;
use greening_core::config::{
    try_change_prop_steps, BatchConfig, FailurePolicy, SimulationConfig, UcmInputs,
    DEFAULT_CHANGE_PROP_STEP, DEFAULT_NUM_RUNS, DEFAULT_SEED, DEFAULT_SHADE_THRESHOLD,
};
use greening_core::landscape::evaluate_stack;
use greening_core::reclassify::{reclassify_by_cover, AttributeTable, CoverRaster, ReclassifyParams};
use greening_core::scenario::Interaction;
use greening_core::temperature::{simulate_temperatures, SimulationError, SimulationReport};

use crate::ucm::ExternalUcm;

// ── CLI ──────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "greening", version, about = "Urban greening scenarios and their effect on air temperature")]
struct Cli {
    /// Debug-level logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Split LULC classes by binned tree and building cover
    Reclassify {
        /// Base LULC GeoTIFF
        lulc: PathBuf,
        /// Tree cover fraction GeoTIFF
        tree_cover: PathBuf,
        /// Building cover fraction GeoTIFF
        bldg_cover: PathBuf,
        /// Attribute CSV of the base LULC classes
        base_table: PathBuf,
        /// Output reclassified LULC GeoTIFF
        dst_tif: PathBuf,
        /// Output biophysical table CSV
        dst_csv: PathBuf,
        #[arg(long, default_value_t = 4)]
        num_tree_bins: usize,
        #[arg(long, default_value_t = 4)]
        num_bldg_bins: usize,
        /// Nodata of the base LULC raster when it carries no GDAL_NODATA tag
        #[arg(long)]
        nodata: Option<i32>,
        #[arg(long, default_value_t = 0)]
        dst_nodata: i32,
    },
    /// Generate the scenario LULC stack
    Scenarios {
        /// Reclassified LULC GeoTIFF
        lulc: PathBuf,
        /// Biophysical table CSV
        biophysical_table: PathBuf,
        /// Output stack JSON
        dst: PathBuf,
        /// Nodata of the LULC raster when it carries no GDAL_NODATA tag
        #[arg(long)]
        nodata: Option<i32>,
        #[command(flatten)]
        sweep: SweepArgs,
    },
    /// Simulate air temperature for every scenario of a stack
    Simulate {
        /// Scenario stack JSON
        stack: PathBuf,
        /// Biophysical table CSV
        biophysical_table: PathBuf,
        /// Reference evapotranspiration GeoTIFF
        ref_et: PathBuf,
        /// Calibrated model parameters JSON
        params: PathBuf,
        /// Output stack JSON with temperatures
        dst: PathBuf,
        /// Urban cooling model executable
        #[arg(long, default_value = "ucm-predict")]
        ucm_command: PathBuf,
        /// Rural reference temperature (°C)
        #[arg(long, requires = "uhi_max", conflicts_with = "station_temperatures")]
        t_ref: Option<f64>,
        /// Urban heat island magnitude (°C)
        #[arg(long, requires = "t_ref")]
        uhi_max: Option<f64>,
        /// Station temperature CSV (first column is the station id) from
        /// which t_ref and uhi_max are derived
        #[arg(long)]
        station_temperatures: Option<PathBuf>,
        #[arg(long, default_value = "factors")]
        cc_method: String,
        /// Fail the batch if any scenario fails
        #[arg(long)]
        abort_on_failure: bool,
        /// Seconds before a model run is killed and counted as failed (0: no limit)
        #[arg(long, default_value_t = 3600)]
        model_timeout: u64,
        /// Write the per-scenario outcome report as JSON
        #[arg(long)]
        report: Option<PathBuf>,
        /// Also dump one temperature GeoTIFF per scenario into this directory
        #[arg(long)]
        temperature_dir: Option<PathBuf>,
    },
    /// High-tree landscape metrics (and mean temperature) per scenario
    Metrics {
        /// Scenario stack JSON
        stack: PathBuf,
        /// Biophysical table CSV
        biophysical_table: PathBuf,
        /// Output metrics CSV
        dst: PathBuf,
        #[arg(long, default_value_t = DEFAULT_SHADE_THRESHOLD)]
        shade_threshold: f64,
    },
}

#[derive(clap::Args, Debug)]
struct SweepArgs {
    /// JSON batch configuration; replaces the sweep flags below
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long, default_value_t = DEFAULT_SHADE_THRESHOLD)]
    shade_threshold: f64,
    #[arg(long, default_value_t = DEFAULT_NUM_RUNS)]
    num_scenario_runs: usize,
    #[arg(long, default_value_t = DEFAULT_CHANGE_PROP_STEP)]
    change_prop_step: f64,
    /// Include the 0 and 1 change proportions (default)
    #[arg(long, overrides_with = "no_endpoints")]
    include_endpoints: bool,
    /// Drop the 0 and 1 change proportions
    #[arg(long, overrides_with = "include_endpoints")]
    no_endpoints: bool,
    #[arg(long, value_delimiter = ',', default_values_t = [Interaction::Cluster, Interaction::Scatter])]
    interactions: Vec<Interaction>,
    #[arg(long, default_value_t = DEFAULT_SEED)]
    seed: u64,
}

impl SweepArgs {
    fn batch_config(&self) -> Result<BatchConfig> {
        if let Some(path) = &self.config {
            return BatchConfig::from_json_path(path)
                .with_context(|| format!("Cannot load batch config {}", path.display()));
        }
        let include_endpoints = self.include_endpoints || !self.no_endpoints;
        Ok(BatchConfig {
            change_props: try_change_prop_steps(self.change_prop_step, include_endpoints)?,
            interactions: self.interactions.clone(),
            num_runs: self.num_scenario_runs,
            shade_threshold: self.shade_threshold,
            seed: self.seed,
        })
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────────

fn setup_logging(verbose: bool) -> Result<()> {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("Setting default subscriber failed")
}

fn read_table(path: &Path) -> Result<BiophysicalTable> {
    BiophysicalTable::from_csv_path(path).with_context(|| format!("Cannot read biophysical table {}", path.display()))
}

fn read_stack(path: &Path) -> Result<ScenarioStack> {
    ScenarioStack::load_json(path).with_context(|| format!("Cannot read scenario stack {}", path.display()))
}

fn read_cover(path: &Path) -> Result<CoverRaster> {
    let r = raster_io::read_float(path)?;
    Ok(CoverRaster::new(r.data, r.info.width, r.info.height)?)
}

/// Every numeric cell of a station temperature CSV, first column excluded.
fn read_station_temperatures(path: &Path) -> Result<Vec<f64>> {
    let mut rdr = csv::Reader::from_path(path).with_context(|| format!("Cannot open {}", path.display()))?;
    let mut values = Vec::new();
    for record in rdr.records() {
        let record = record?;
        values.extend(record.iter().skip(1).filter_map(|v| v.trim().parse::<f64>().ok()));
    }
    Ok(values)
}

#[derive(Serialize)]
struct ReportEntry<'a> {
    interaction: Interaction,
    change_prop: f64,
    scenario_run: usize,
    attempts: u32,
    error: Option<&'a str>,
}

fn write_report(path: &Path, report: &SimulationReport) -> Result<()> {
    let entries: Vec<ReportEntry> = report
        .outcomes
        .iter()
        .map(|o| ReportEntry {
            interaction: o.scenario.interaction,
            change_prop: o.scenario.change_prop,
            scenario_run: o.scenario.run,
            attempts: o.attempts,
            error: o.error.as_deref(),
        })
        .collect();
    std::fs::write(path, serde_json::to_string_pretty(&entries)?)
        .with_context(|| format!("Cannot write report {}", path.display()))
}

/// One GeoTIFF per simulated slot, named `T_<interaction>_<change_prop>_<run>.tif`.
fn dump_temperatures(stack: &ScenarioStack, dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir).with_context(|| format!("Cannot create {}", dir.display()))?;
    let (height, width) = stack.shape();
    let info = raster_io::GeoInfo {
        width,
        height,
        transform: stack.transform(),
        crs: stack.crs().map(str::to_string),
        nodata: None,
    };
    let mut written = 0;
    for slot in 0..stack.len() {
        let Some(t) = stack.temperature(slot) else { continue };
        let s = stack.scenario(slot);
        let path = dir.join(format!("T_{}_{}_{}.tif", s.interaction, s.change_prop, s.run));
        raster_io::write_float(&path, t, &info)?;
        written += 1;
    }
    info!(written, "dumped scenario temperatures to {}", dir.display());
    Ok(())
}

/// Write the report whatever the failure policy decided, then fail if any
/// scenario has no temperature.
fn finish_simulation(outcome: Result<SimulationReport, SimulationError>, report_path: Option<&Path>) -> Result<()> {
    let summary = match outcome {
        Ok(summary) => summary,
        Err(SimulationError::Aborted { report, .. }) => report,
        Err(e) => return Err(e.into()),
    };
    if let Some(path) = report_path {
        write_report(path, &summary)?;
        info!("dumped simulation report to {}", path.display());
    }
    if !summary.all_succeeded() {
        for o in summary.failures() {
            warn!(scenario = %o.scenario, error = o.error.as_deref().unwrap_or_default(), "no temperature");
        }
        bail!("{} of {} scenarios failed", summary.num_failed(), summary.outcomes.len());
    }
    Ok(())
}

// ── Commands ─────────────────────────────────────────────────────────────────

#[allow(clippy::too_many_arguments)]
fn cmd_reclassify(
    lulc: &Path,
    nodata: Option<i32>,
    tree_cover: &Path,
    bldg_cover: &Path,
    base_table: &Path,
    dst_tif: &Path,
    dst_csv: &Path,
    params: ReclassifyParams,
) -> Result<()> {
    let lulc = raster_io::read_lulc(lulc, nodata)?;
    let tree = read_cover(tree_cover)?;
    let bldg = read_cover(bldg_cover)?;
    let base = AttributeTable::from_csv_path(base_table)
        .with_context(|| format!("Cannot read base table {}", base_table.display()))?;
    info!(width = lulc.width, height = lulc.height, "read LULC, tree cover and building cover");

    let out = reclassify_by_cover(&lulc, &tree, &bldg, &base, &params)?;
    raster_io::write_lulc(dst_tif, &out.raster)?;
    info!("dumped reclassified raster to {}", dst_tif.display());
    out.table
        .to_csv_path(dst_csv)
        .with_context(|| format!("Cannot write {}", dst_csv.display()))?;
    info!("dumped reclassified biophysical table to {}", dst_csv.display());
    Ok(())
}

fn cmd_scenarios(lulc: &Path, nodata: Option<i32>, table: &Path, dst: &Path, sweep: &SweepArgs) -> Result<()> {
    let config = sweep.batch_config()?;
    let raster = raster_io::read_lulc(lulc, nodata)?;
    let table = read_table(table)?;
    let stack = run_batch(&raster, &table, &config)?;
    stack.save_json(dst).with_context(|| format!("Cannot write {}", dst.display()))?;
    info!(scenarios = stack.len(), "dumped scenario stack to {}", dst.display());
    Ok(())
}

fn cmd_metrics(stack: &Path, table: &Path, dst: &Path, shade_threshold: f64) -> Result<()> {
    let stack = read_stack(stack)?;
    let table = read_table(table)?;
    let rows = evaluate_stack(&stack, &table, shade_threshold);
    let mut wtr = csv::Writer::from_path(dst).with_context(|| format!("Cannot create {}", dst.display()))?;
    for row in &rows {
        wtr.serialize(row)?;
    }
    wtr.flush()?;
    info!(rows = rows.len(), "dumped scenario metrics to {}", dst.display());
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose)?;

    match cli.command {
        Commands::Reclassify {
            lulc,
            tree_cover,
            bldg_cover,
            base_table,
            dst_tif,
            dst_csv,
            num_tree_bins,
            num_bldg_bins,
            nodata,
            dst_nodata,
        } => {
            let params = ReclassifyParams { num_tree_bins, num_bldg_bins, dst_nodata };
            cmd_reclassify(&lulc, nodata, &tree_cover, &bldg_cover, &base_table, &dst_tif, &dst_csv, params)
        }
        Commands::Scenarios { lulc, biophysical_table, dst, nodata, sweep } => {
            cmd_scenarios(&lulc, nodata, &biophysical_table, &dst, &sweep)
        }
        Commands::Simulate {
            stack,
            biophysical_table,
            ref_et,
            params,
            dst,
            ucm_command,
            t_ref,
            uhi_max,
            station_temperatures,
            cc_method,
            abort_on_failure,
            model_timeout,
            report,
            temperature_dir,
        } => {
            let (t_ref, uhi_max) = match (t_ref, uhi_max, station_temperatures) {
                (Some(t), Some(u), _) => (t, u),
                (_, _, Some(path)) => UcmInputs::reference_from_observations(&read_station_temperatures(&path)?)
                    .with_context(|| format!("No temperature readings in {}", path.display()))?,
                _ => bail!("Either --t-ref and --uhi-max or --station-temperatures is required"),
            };
            let mut inputs = UcmInputs::new(biophysical_table, ref_et, t_ref, uhi_max)
                .with_params_file(&params)
                .with_context(|| format!("Cannot load model parameters {}", params.display()))?;
            inputs.cc_method = cc_method;
            info!(t_ref, uhi_max, "urban cooling model reference temperatures");

            let mut scenario_stack = read_stack(&stack)?;
            let mut model = ExternalUcm::new(ucm_command, inputs);
            if model_timeout > 0 {
                model = model.with_timeout(Duration::from_secs(model_timeout));
            }
            let policy = if abort_on_failure { FailurePolicy::Abort } else { FailurePolicy::BestEffort };
            let outcome = simulate_temperatures(&mut scenario_stack, &model, &SimulationConfig::with_policy(policy));

            scenario_stack.save_json(&dst).with_context(|| format!("Cannot write {}", dst.display()))?;
            info!("dumped scenario stack with temperatures to {}", dst.display());

            if let Some(dir) = &temperature_dir {
                dump_temperatures(&scenario_stack, dir)?;
            }
            finish_simulation(outcome, report.as_deref())
        }
        Commands::Metrics { stack, biophysical_table, dst, shade_threshold } => {
            cmd_metrics(&stack, &biophysical_table, &dst, shade_threshold)
        }
    }
}
