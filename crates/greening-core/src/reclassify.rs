//! Reclassification of a base LULC raster by binned tree and building cover.
//!
//! Every base class is split into `num_tree_bins * num_bldg_bins` new codes,
//! one per (tree cover bin, building cover bin) pair, and the biophysical
//! table is derived from the base class attributes.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::biophysical::{parse_code, parse_f64, BaseCategory, BiophysicalRecord, BiophysicalTable, TableError};
use crate::raster::{LulcCode, LulcRaster, RasterError};

/// Base attribute renamed on output.
const RENAMED_COLUMNS: [(&str, &str); 1] = [("crop_factor", "kc")];
/// Columns produced by the reclassification itself; never copied from the base.
const RESERVED_COLUMNS: [&str; 4] = ["lucode", "orig_lucode", "shade", "building_intensity"];

#[derive(Error, Debug)]
pub enum ReclassifyError {
    #[error("number of {0} bins must be at least 1")]
    NoBins(&'static str),
    #[error("{name} cover raster: {source}")]
    Cover { name: &'static str, source: RasterError },
    #[error("destination nodata {0} collides with a reclassified code")]
    NodataCollision(LulcCode),
    #[error(transparent)]
    Table(#[from] TableError),
}

// ── Bins ──────────────────────────────────────────────────────────────────────

/// `n + 1` evenly spaced edges over `[0, 1]`.
pub fn bin_edges(n: usize) -> Vec<f64> {
    (0..=n).map(|i| i as f64 / n as f64).collect()
}

/// Midpoints of the `n` bins.
pub fn bin_centers(n: usize) -> Vec<f64> {
    (1..=n).map(|i| (2 * i - 1) as f64 / (2 * n) as f64).collect()
}

/// 1-based bin of `value`; bins are closed below and open above except the
/// last, which also holds 1. NaN and values outside `[0, 1]` have no bin.
pub fn cover_bin(value: f64, edges: &[f64]) -> Option<usize> {
    let n = edges.len().checked_sub(1)?;
    if n == 0 || !(edges[0]..=edges[n]).contains(&value) {
        return None;
    }
    (1..=n)
        .find(|&i| edges[i - 1] <= value && value < edges[i])
        .or(Some(n))
}

// ── Inputs ────────────────────────────────────────────────────────────────────

/// Per-pixel cover fraction grid (tree or building cover).
#[derive(Debug, Clone, PartialEq)]
pub struct CoverRaster {
    pub data: Vec<f32>,
    pub width: usize,
    pub height: usize,
}

impl CoverRaster {
    pub fn new(data: Vec<f32>, width: usize, height: usize) -> Result<Self, RasterError> {
        if data.len() != width * height {
            return Err(RasterError::SizeMismatch { len: data.len(), width, height });
        }
        Ok(Self { data, width, height })
    }

    fn ensure_shape(&self, lulc: &LulcRaster) -> Result<(), RasterError> {
        lulc.ensure_shape(self.height, self.width).map_err(|_| RasterError::ShapeMismatch {
            expected: lulc.shape(),
            actual: (self.height, self.width),
        })
    }
}

/// Numeric attributes of the base LULC classes, keyed by `lucode`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttributeTable {
    columns: Vec<String>,
    rows: HashMap<LulcCode, BTreeMap<String, f64>>,
}

impl AttributeTable {
    pub fn new(columns: Vec<String>, rows: HashMap<LulcCode, BTreeMap<String, f64>>) -> Self {
        Self { columns, rows }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn get(&self, code: LulcCode) -> Option<&BTreeMap<String, f64>> {
        self.rows.get(&code)
    }

    pub fn from_csv_path(path: impl AsRef<Path>) -> Result<Self, TableError> {
        Self::from_csv_reader(std::fs::File::open(path)?)
    }

    /// Parse a CSV with a `lucode` column. Other all-numeric columns are kept
    /// in their original order.
    pub fn from_csv_reader<R: io::Read>(reader: R) -> Result<Self, TableError> {
        let mut rdr = csv::Reader::from_reader(reader);
        let headers: Vec<String> = rdr.headers()?.iter().map(|h| h.trim().to_string()).collect();
        let lucode_col = headers
            .iter()
            .position(|h| h == "lucode")
            .ok_or_else(|| TableError::MissingColumn("lucode".into()))?;
        let records: Vec<csv::StringRecord> = rdr.records().collect::<Result<_, _>>()?;

        let numeric: Vec<usize> = (0..headers.len())
            .filter(|&i| i != lucode_col)
            .filter(|&i| records.iter().all(|r| r.get(i).and_then(parse_f64).is_some()))
            .collect();

        let mut rows = HashMap::with_capacity(records.len());
        for (i, record) in records.iter().enumerate() {
            let raw = record.get(lucode_col).unwrap_or("");
            let code = parse_code(raw).ok_or_else(|| TableError::InvalidValue {
                row: i + 1,
                column: "lucode".into(),
                value: raw.to_string(),
            })?;
            let attrs = numeric
                .iter()
                .filter_map(|&c| record.get(c).and_then(parse_f64).map(|v| (headers[c].clone(), v)))
                .collect();
            if rows.insert(code, attrs).is_some() {
                return Err(TableError::DuplicateCode(code));
            }
        }
        let columns = numeric.iter().map(|&c| headers[c].clone()).collect();
        Ok(Self { columns, rows })
    }
}

// ── Reclassification ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReclassifyParams {
    pub num_tree_bins: usize,
    pub num_bldg_bins: usize,
    pub dst_nodata: LulcCode,
}

impl Default for ReclassifyParams {
    fn default() -> Self {
        Self { num_tree_bins: 4, num_bldg_bins: 4, dst_nodata: 0 }
    }
}

#[derive(Debug, Clone)]
pub struct Reclassification {
    pub raster: LulcRaster,
    pub table: BiophysicalTable,
}

/// Reclassify `lulc` by tree and building cover.
///
/// New codes start at 1 and are allocated per base class (ascending), tree
/// bins outer and building bins inner. Pixels that are nodata or whose cover
/// has no bin become `dst_nodata`. Base classes missing from `base` keep
/// their pixels but get no table rows.
pub fn reclassify_by_cover(
    lulc: &LulcRaster,
    tree_cover: &CoverRaster,
    bldg_cover: &CoverRaster,
    base: &AttributeTable,
    params: &ReclassifyParams,
) -> Result<Reclassification, ReclassifyError> {
    let (nt, nb) = (params.num_tree_bins, params.num_bldg_bins);
    if nt == 0 {
        return Err(ReclassifyError::NoBins("tree"));
    }
    if nb == 0 {
        return Err(ReclassifyError::NoBins("building"));
    }
    tree_cover.ensure_shape(lulc).map_err(|source| ReclassifyError::Cover { name: "tree", source })?;
    bldg_cover.ensure_shape(lulc).map_err(|source| ReclassifyError::Cover { name: "building", source })?;

    let classes: BTreeSet<LulcCode> = (0..lulc.len()).filter(|&i| !lulc.is_nodata(i)).map(|i| lulc.data[i]).collect();
    let per_class = nt * nb;
    let first_code: HashMap<LulcCode, LulcCode> = classes
        .iter()
        .enumerate()
        .map(|(k, &class)| (class, (1 + k * per_class) as LulcCode))
        .collect();
    let max_code = (classes.len() * per_class) as LulcCode;
    if (1..=max_code).contains(&params.dst_nodata) {
        return Err(ReclassifyError::NodataCollision(params.dst_nodata));
    }

    let tree_edges = bin_edges(nt);
    let bldg_edges = bin_edges(nb);
    let data: Vec<LulcCode> = (0..lulc.len())
        .map(|i| {
            if lulc.is_nodata(i) {
                return params.dst_nodata;
            }
            let t = cover_bin(tree_cover.data[i] as f64, &tree_edges);
            let b = cover_bin(bldg_cover.data[i] as f64, &bldg_edges);
            match (first_code.get(&lulc.data[i]), t, b) {
                (Some(&first), Some(t), Some(b)) => first + ((t - 1) * nb + (b - 1)) as LulcCode,
                _ => params.dst_nodata,
            }
        })
        .collect();

    let raster = LulcRaster {
        data,
        width: lulc.width,
        height: lulc.height,
        nodata: params.dst_nodata,
        transform: lulc.transform,
        crs: lulc.crs.clone(),
    };
    let table = reclassified_table(&classes, &first_code, base, nt, nb)?;

    info!(
        classes = classes.len(),
        codes = classes.len() * per_class,
        rows = table.len(),
        "reclassified LULC by tree and building cover"
    );
    Ok(Reclassification { raster, table })
}

fn output_column(name: &str) -> &str {
    RENAMED_COLUMNS
        .iter()
        .find(|(from, _)| *from == name)
        .map_or(name, |(_, to)| to)
}

fn reclassified_table(
    classes: &BTreeSet<LulcCode>,
    first_code: &HashMap<LulcCode, LulcCode>,
    base: &AttributeTable,
    nt: usize,
    nb: usize,
) -> Result<BiophysicalTable, TableError> {
    let tree_centers = bin_centers(nt);
    let bldg_centers = bin_centers(nb);
    let has_albedo = ["albedo_min", "albedo_max"].iter().all(|c| base.columns().iter().any(|x| x == c));

    let copied: Vec<&String> = base
        .columns()
        .iter()
        .filter(|c| !matches!(c.as_str(), "albedo_min" | "albedo_max"))
        .filter(|c| !RESERVED_COLUMNS.contains(&output_column(c)))
        .filter(|c| !(has_albedo && c.as_str() == "albedo"))
        .collect();
    let mut attr_columns: Vec<String> = copied.iter().map(|c| output_column(c).to_string()).collect();
    if has_albedo {
        attr_columns.push("albedo".into());
    }

    let (bldg_lo, bldg_hi) = (bldg_centers[0], bldg_centers[nb - 1]);
    let mut records = Vec::with_capacity(classes.len() * nt * nb);
    for class in classes {
        let Some(attrs) = base.get(*class) else {
            warn!(class, "base class has no attributes, its codes get no table rows");
            continue;
        };
        let first = first_code[class];
        for (ti, &shade) in tree_centers.iter().enumerate() {
            for (bi, &building_intensity) in bldg_centers.iter().enumerate() {
                let lucode = first + (ti * nb + bi) as LulcCode;
                let mut rec = BiophysicalRecord::new(lucode, BaseCategory::from_code(*class), shade, building_intensity);
                for column in &copied {
                    if let Some(&v) = attrs.get(column.as_str()) {
                        rec.attrs.insert(output_column(column).to_string(), v);
                    }
                }
                if let (Some(&lo), Some(&hi)) = (attrs.get("albedo_min"), attrs.get("albedo_max")) {
                    let albedo = if nb == 1 {
                        hi
                    } else {
                        hi - (hi - lo) * (building_intensity - bldg_lo) / (bldg_hi - bldg_lo)
                    };
                    rec.attrs.insert("albedo".into(), albedo);
                }
                records.push(rec);
            }
        }
    }
    BiophysicalTable::with_columns(records, attr_columns)
}
