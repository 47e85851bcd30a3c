//! Urban greening scenarios: tree-cover scenario generation on LULC rasters,
//! temperature simulation fan-out and landscape metrics.

pub mod batch;
pub mod biophysical;
pub mod config;
pub mod eligibility;
pub mod landscape;
pub mod next_code;
pub mod raster;
pub mod reclassify;
pub mod scenario;
pub mod temperature;

pub use batch::{run_batch, scenario_seed, BatchError, ScenarioStack};
pub use biophysical::{BaseCategory, BiophysicalRecord, BiophysicalTable, TableError};
pub use config::{BatchConfig, FailurePolicy, SimulationConfig, UcmInputs};
pub use eligibility::{build_eligibility, inner_road_mask, EligibilityIndex, ExclusionMask};
pub use landscape::{evaluate_stack, ClassMetrics, LandscapeClass, MetricsRow};
pub use next_code::{build_next_code_map, NextCodeMap};
pub use raster::{GeoTransform, LulcCode, LulcRaster, RasterError};
pub use reclassify::{reclassify_by_cover, AttributeTable, CoverRaster, ReclassifyParams};
pub use scenario::{generate, select_cells, Interaction, Scenario, ScenarioError};
pub use temperature::{simulate_temperatures, ModelError, SimulationError, SimulationReport, TemperatureModel};
