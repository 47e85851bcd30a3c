//! Binary high-tree landscape classification and class-level landscape
//! metrics of the high-tree class.

use std::collections::{HashSet, VecDeque};

#[cfg(feature = "threading")]
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::batch::ScenarioStack;
use crate::biophysical::BiophysicalTable;
use crate::raster::{LulcCode, LulcRaster};
use crate::scenario::Interaction;

/// Square metres per hectare.
const HECTARE_M2: f64 = 10_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LandscapeClass {
    NoData = 0,
    HighTree = 1,
    Other = 2,
}

/// Classify every cell: `HighTree` when its code's shade reaches
/// `shade_threshold`, `Other` for any other valid cell.
pub fn landscape_classes(raster: &LulcRaster, table: &BiophysicalTable, shade_threshold: f64) -> Vec<LandscapeClass> {
    classify(&raster.data, raster.nodata, &table.high_tree_codes(shade_threshold))
}

fn classify(data: &[LulcCode], nodata: LulcCode, high: &HashSet<LulcCode>) -> Vec<LandscapeClass> {
    data.iter()
        .map(|&code| {
            if code == nodata {
                LandscapeClass::NoData
            } else if high.contains(&code) {
                LandscapeClass::HighTree
            } else {
                LandscapeClass::Other
            }
        })
        .collect()
}

/// Class-level metrics of one landscape class.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClassMetrics {
    /// Percent of the valid landscape covered by the class.
    pub proportion_of_landscape: f64,
    /// Class edge (m) per valid landscape hectare.
    pub edge_density: f64,
    /// Mean patch area (ha). NaN without patches.
    pub area_mn: f64,
    /// Mean patch shape index. NaN without patches.
    pub shape_index_mn: f64,
}

/// A classified grid with square cells of side `res` metres.
#[derive(Debug, Clone)]
pub struct Landscape {
    classes: Vec<LandscapeClass>,
    width: usize,
    height: usize,
    res: f64,
}

struct Patch {
    cells: usize,
    /// Cell edges on the patch boundary, grid boundary included.
    perimeter: usize,
}

impl Landscape {
    pub fn new(classes: Vec<LandscapeClass>, width: usize, height: usize, res: f64) -> Self {
        debug_assert_eq!(classes.len(), width * height);
        Self { classes, width, height, res }
    }

    pub fn from_raster(raster: &LulcRaster, table: &BiophysicalTable, shade_threshold: f64) -> Self {
        Self::new(
            landscape_classes(raster, table, shade_threshold),
            raster.width,
            raster.height,
            raster.transform.resolution(),
        )
    }

    pub fn classes(&self) -> &[LandscapeClass] {
        &self.classes
    }

    fn valid_cells(&self) -> usize {
        self.classes.iter().filter(|&&c| c != LandscapeClass::NoData).count()
    }

    /// 4-neighbours of cell `i` that lie inside the grid.
    fn rook(&self, i: usize) -> impl Iterator<Item = usize> {
        let (r, c, w, h) = (i / self.width, i % self.width, self.width, self.height);
        [
            (r > 0).then(|| i - w),
            (r + 1 < h).then(|| i + w),
            (c > 0).then(|| i - 1),
            (c + 1 < w).then(|| i + 1),
        ]
        .into_iter()
        .flatten()
    }

    /// Shared edges between `class` and another valid class. Edges against
    /// nodata or the grid boundary are not counted.
    fn class_edges(&self, class: LandscapeClass) -> usize {
        let mut edges = 0;
        for (i, &c) in self.classes.iter().enumerate() {
            if c != class {
                continue;
            }
            edges += self
                .rook(i)
                .filter(|&j| {
                    let other = self.classes[j];
                    other != class && other != LandscapeClass::NoData
                })
                .count();
        }
        edges
    }

    /// 8-connected patches of `class`.
    fn patches(&self, class: LandscapeClass) -> Vec<Patch> {
        let (w, h) = (self.width as isize, self.height as isize);
        let mut seen = vec![false; self.classes.len()];
        let mut patches = Vec::new();
        let mut queue = VecDeque::new();

        for start in 0..self.classes.len() {
            if seen[start] || self.classes[start] != class {
                continue;
            }
            seen[start] = true;
            queue.push_back(start);
            let mut patch = Patch { cells: 0, perimeter: 0 };

            while let Some(i) = queue.pop_front() {
                patch.cells += 1;
                patch.perimeter += 4 - self.rook(i).filter(|&j| self.classes[j] == class).count();

                let (r, c) = ((i / self.width) as isize, (i % self.width) as isize);
                for dr in -1..=1 {
                    for dc in -1..=1 {
                        let (nr, nc) = (r + dr, c + dc);
                        if (dr, dc) == (0, 0) || nr < 0 || nc < 0 || nr >= h || nc >= w {
                            continue;
                        }
                        let j = (nr * w + nc) as usize;
                        if !seen[j] && self.classes[j] == class {
                            seen[j] = true;
                            queue.push_back(j);
                        }
                    }
                }
            }
            patches.push(patch);
        }
        patches
    }

    pub fn class_metrics(&self, class: LandscapeClass) -> ClassMetrics {
        let valid = self.valid_cells();
        let cell_area = self.res * self.res;
        let landscape_area = valid as f64 * cell_area;
        if valid == 0 {
            return ClassMetrics {
                proportion_of_landscape: f64::NAN,
                edge_density: f64::NAN,
                area_mn: f64::NAN,
                shape_index_mn: f64::NAN,
            };
        }

        let class_cells = self.classes.iter().filter(|&&c| c == class).count();
        let edge_len = self.class_edges(class) as f64 * self.res;
        let patches = self.patches(class);

        let (area_mn, shape_index_mn) = if patches.is_empty() {
            (f64::NAN, f64::NAN)
        } else {
            let n = patches.len() as f64;
            let area = patches.iter().map(|p| p.cells as f64 * cell_area / HECTARE_M2).sum::<f64>() / n;
            let shape = patches
                .iter()
                .map(|p| 0.25 * p.perimeter as f64 / (p.cells as f64).sqrt())
                .sum::<f64>()
                / n;
            (area, shape)
        };

        ClassMetrics {
            proportion_of_landscape: 100.0 * class_cells as f64 / valid as f64,
            edge_density: edge_len / (landscape_area / HECTARE_M2),
            area_mn,
            shape_index_mn,
        }
    }
}

/// Mean of the finite values, `None` if there are none.
pub fn mean_temperature(values: &[f32]) -> Option<f64> {
    let (sum, n) = values
        .iter()
        .filter(|v| v.is_finite())
        .fold((0.0f64, 0usize), |(s, n), &v| (s + v as f64, n + 1));
    (n > 0).then(|| sum / n as f64)
}

/// One row of the scenario metrics table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsRow {
    pub interaction: Interaction,
    pub change_prop: f64,
    pub scenario_run: usize,
    pub proportion_of_landscape: f64,
    pub edge_density: f64,
    pub area_mn: f64,
    pub shape_index_mn: f64,
    /// Mean simulated temperature (°C), when simulated.
    #[serde(rename = "T_avg")]
    pub t_avg: Option<f64>,
}

/// High-tree class metrics (and mean temperature, when present) for every
/// slot of `stack`, in slot order.
pub fn evaluate_stack(stack: &ScenarioStack, table: &BiophysicalTable, shade_threshold: f64) -> Vec<MetricsRow> {
    let high = table.high_tree_codes(shade_threshold);
    let (height, width) = stack.shape();
    let res = stack.transform().resolution();

    let row = |slot: usize| {
        let classes = classify(stack.lulc(slot), stack.nodata(), &high);
        let m = Landscape::new(classes, width, height, res).class_metrics(LandscapeClass::HighTree);
        let scenario = stack.scenario(slot);
        MetricsRow {
            interaction: scenario.interaction,
            change_prop: scenario.change_prop,
            scenario_run: scenario.run,
            proportion_of_landscape: m.proportion_of_landscape,
            edge_density: m.edge_density,
            area_mn: m.area_mn,
            shape_index_mn: m.shape_index_mn,
            t_avg: stack.temperature(slot).and_then(mean_temperature),
        }
    };

    #[cfg(feature = "threading")]
    let rows: Vec<MetricsRow> = (0..stack.len()).into_par_iter().map(row).collect();
    #[cfg(not(feature = "threading"))]
    let rows: Vec<MetricsRow> = (0..stack.len()).map(row).collect();

    info!(rows = rows.len(), shade_threshold, "computed landscape metrics");
    rows
}
