//! Biophysical table: per-LULC-code base category, tree cover ("shade") and
//! building cover ("building intensity"), plus any extra numeric columns the
//! urban cooling model consumes (kc, albedo, green_area, ...).

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::io;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::raster::LulcCode;

/// Columns accepted as the base-category column, in lookup order.
pub const BASE_CATEGORY_COLUMNS: [&str; 3] = ["orig_lucode", "lulc_code", "base_category"];

#[derive(Error, Debug)]
pub enum TableError {
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("biophysical table is missing required column '{0}'")]
    MissingColumn(String),
    #[error("row {row}: invalid value '{value}' in column '{column}'")]
    InvalidValue { row: usize, column: String, value: String },
    #[error("row {row}: {column} = {value} is outside [0, 1]")]
    OutOfRange { row: usize, column: String, value: f64 },
    #[error("duplicate lucode {0}")]
    DuplicateCode(LulcCode),
}

/// Base land-cover category a (reclassified) LULC code derives from.
///
/// Numeric codes follow the cadastral survey classes the tables are built on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BaseCategory {
    Building,
    Road,
    Sidewalk,
    TrafficIsland,
    OtherImpervious,
    Garden,
    Other(LulcCode),
}

impl BaseCategory {
    /// Categories whose codes can be upgraded to a higher tree cover.
    pub const CHANGEABLE: [BaseCategory; 6] = [
        BaseCategory::Building,
        BaseCategory::Road,
        BaseCategory::Sidewalk,
        BaseCategory::TrafficIsland,
        BaseCategory::OtherImpervious,
        BaseCategory::Garden,
    ];

    pub fn from_code(code: LulcCode) -> Self {
        match code {
            0 => BaseCategory::Building,
            1 => BaseCategory::Road,
            2 => BaseCategory::Sidewalk,
            3 => BaseCategory::TrafficIsland,
            7 => BaseCategory::OtherImpervious,
            11 => BaseCategory::Garden,
            other => BaseCategory::Other(other),
        }
    }

    pub fn code(self) -> LulcCode {
        match self {
            BaseCategory::Building => 0,
            BaseCategory::Road => 1,
            BaseCategory::Sidewalk => 2,
            BaseCategory::TrafficIsland => 3,
            BaseCategory::OtherImpervious => 7,
            BaseCategory::Garden => 11,
            BaseCategory::Other(code) => code,
        }
    }

    pub fn is_changeable(self) -> bool {
        !matches!(self, BaseCategory::Other(_))
    }
}

impl FromStr for BaseCategory {
    type Err = String;

    /// Accepts either the numeric base code or a category name.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Ok(code) = s.parse::<LulcCode>() {
            return Ok(Self::from_code(code));
        }
        // Integer codes written by some tools come through as floats ("1.0").
        if let Ok(v) = s.parse::<f64>() {
            if v.fract() == 0.0 {
                return Ok(Self::from_code(v as LulcCode));
            }
        }
        match s.to_ascii_lowercase().replace(['-', ' '], "_").as_str() {
            "building" => Ok(BaseCategory::Building),
            "road" => Ok(BaseCategory::Road),
            "sidewalk" => Ok(BaseCategory::Sidewalk),
            "traffic_island" => Ok(BaseCategory::TrafficIsland),
            "other_impervious" => Ok(BaseCategory::OtherImpervious),
            "garden" => Ok(BaseCategory::Garden),
            _ => Err(format!("unknown base category '{s}'")),
        }
    }
}

impl fmt::Display for BaseCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BaseCategory::Other(code) => write!(f, "other({code})"),
            cat => write!(f, "{}", format!("{cat:?}").to_ascii_lowercase()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BiophysicalRecord {
    pub lucode: LulcCode,
    pub base_category: BaseCategory,
    /// Tree canopy cover fraction, 0-1.
    pub shade: f64,
    /// Building cover fraction, 0-1.
    pub building_intensity: f64,
    /// Extra numeric columns keyed by column name.
    #[serde(default)]
    pub attrs: BTreeMap<String, f64>,
}

impl BiophysicalRecord {
    pub fn new(lucode: LulcCode, base_category: BaseCategory, shade: f64, building_intensity: f64) -> Self {
        Self { lucode, base_category, shade, building_intensity, attrs: BTreeMap::new() }
    }

    /// Tree plus building cover fits within a single pixel.
    pub fn is_feasible(&self) -> bool {
        self.shade + self.building_intensity <= 1.0 + FEASIBILITY_TOLERANCE
    }
}

/// Absolute tolerance on `shade + building_intensity <= 1`; bin centres such
/// as 0.875 + 0.125 must count as feasible.
pub const FEASIBILITY_TOLERANCE: f64 = 1e-9;

/// Lookup table from LULC code to its biophysical record.
#[derive(Debug, Clone, Default)]
pub struct BiophysicalTable {
    records: Vec<BiophysicalRecord>,
    index: HashMap<LulcCode, usize>,
    /// Extra attribute columns in their original order.
    attr_columns: Vec<String>,
}

impl BiophysicalTable {
    pub fn new(records: Vec<BiophysicalRecord>) -> Result<Self, TableError> {
        let mut attr_columns: Vec<String> = Vec::new();
        for rec in &records {
            for key in rec.attrs.keys() {
                if !attr_columns.contains(key) {
                    attr_columns.push(key.clone());
                }
            }
        }
        Self::with_columns(records, attr_columns)
    }

    pub(crate) fn with_columns(records: Vec<BiophysicalRecord>, attr_columns: Vec<String>) -> Result<Self, TableError> {
        let mut index = HashMap::with_capacity(records.len());
        for (i, rec) in records.iter().enumerate() {
            for (column, value) in [("shade", rec.shade), ("building_intensity", rec.building_intensity)] {
                if !(0.0..=1.0).contains(&value) {
                    return Err(TableError::OutOfRange { row: i + 1, column: column.into(), value });
                }
            }
            if index.insert(rec.lucode, i).is_some() {
                return Err(TableError::DuplicateCode(rec.lucode));
            }
        }
        Ok(Self { records, index, attr_columns })
    }

    pub fn records(&self) -> &[BiophysicalRecord] {
        &self.records
    }

    pub fn attr_columns(&self) -> &[String] {
        &self.attr_columns
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, code: LulcCode) -> Option<&BiophysicalRecord> {
        self.index.get(&code).map(|&i| &self.records[i])
    }

    pub fn shade(&self, code: LulcCode) -> Option<f64> {
        self.get(code).map(|r| r.shade)
    }

    /// Codes whose tree cover reaches `threshold`.
    pub fn high_tree_codes(&self, threshold: f64) -> HashSet<LulcCode> {
        self.records
            .iter()
            .filter(|r| r.shade >= threshold)
            .map(|r| r.lucode)
            .collect()
    }

    pub fn codes_in_category(&self, category: BaseCategory) -> HashSet<LulcCode> {
        self.records
            .iter()
            .filter(|r| r.base_category == category)
            .map(|r| r.lucode)
            .collect()
    }

    pub fn from_csv_path(path: impl AsRef<Path>) -> Result<Self, TableError> {
        let file = std::fs::File::open(path)?;
        Self::from_csv_reader(file)
    }

    /// Parse a CSV table. Required columns: `lucode`, `shade`,
    /// `building_intensity` and one of [`BASE_CATEGORY_COLUMNS`]. Every other
    /// column whose values are all numeric is kept as an attribute.
    pub fn from_csv_reader<R: io::Read>(reader: R) -> Result<Self, TableError> {
        let mut rdr = csv::Reader::from_reader(reader);
        let headers: Vec<String> = rdr.headers()?.iter().map(|h| h.trim().to_string()).collect();

        let column = |name: &str| headers.iter().position(|h| h == name);
        let required = |name: &str| column(name).ok_or_else(|| TableError::MissingColumn(name.into()));
        let lucode_col = required("lucode")?;
        let shade_col = required("shade")?;
        let bi_col = required("building_intensity")?;
        let base_col = BASE_CATEGORY_COLUMNS
            .iter()
            .find_map(|name| column(name))
            .ok_or_else(|| TableError::MissingColumn(BASE_CATEGORY_COLUMNS.join("|")))?;

        let rows: Vec<csv::StringRecord> = rdr.records().collect::<Result<_, _>>()?;

        let reserved = [lucode_col, shade_col, bi_col, base_col];
        let attr_cols: Vec<usize> = (0..headers.len())
            .filter(|i| !reserved.contains(i))
            .filter(|&i| {
                let numeric = rows.iter().all(|row| row.get(i).is_some_and(|v| parse_f64(v).is_some()));
                if !numeric {
                    debug!(column = %headers[i], "dropping non-numeric biophysical column");
                }
                numeric
            })
            .collect();

        let mut records = Vec::with_capacity(rows.len());
        for (i, row) in rows.iter().enumerate() {
            let row_no = i + 1;
            let field = |col: usize| row.get(col).unwrap_or("").trim();
            let invalid = |col: usize| TableError::InvalidValue {
                row: row_no,
                column: headers[col].clone(),
                value: field(col).to_string(),
            };

            let lucode = parse_code(field(lucode_col)).ok_or_else(|| invalid(lucode_col))?;
            let base_category = field(base_col).parse::<BaseCategory>().map_err(|_| invalid(base_col))?;
            let shade = parse_f64(field(shade_col)).ok_or_else(|| invalid(shade_col))?;
            let building_intensity = parse_f64(field(bi_col)).ok_or_else(|| invalid(bi_col))?;
            let attrs = attr_cols
                .iter()
                .filter_map(|&c| parse_f64(field(c)).map(|v| (headers[c].clone(), v)))
                .collect();

            records.push(BiophysicalRecord { lucode, base_category, shade, building_intensity, attrs });
        }

        let attr_columns = attr_cols.iter().map(|&c| headers[c].clone()).collect();
        Self::with_columns(records, attr_columns)
    }

    pub fn to_csv_path(&self, path: impl AsRef<Path>) -> Result<(), TableError> {
        let file = std::fs::File::create(path)?;
        self.to_csv_writer(file)
    }

    /// Write the table as CSV with `lucode, orig_lucode, shade,
    /// building_intensity` followed by the attribute columns.
    pub fn to_csv_writer<W: io::Write>(&self, writer: W) -> Result<(), TableError> {
        let mut wtr = csv::Writer::from_writer(writer);
        let mut header = vec!["lucode", "orig_lucode", "shade", "building_intensity"];
        header.extend(self.attr_columns.iter().map(String::as_str));
        wtr.write_record(&header)?;

        for rec in &self.records {
            let mut row = vec![
                rec.lucode.to_string(),
                rec.base_category.code().to_string(),
                rec.shade.to_string(),
                rec.building_intensity.to_string(),
            ];
            row.extend(
                self.attr_columns
                    .iter()
                    .map(|c| rec.attrs.get(c).map(|v| v.to_string()).unwrap_or_default()),
            );
            wtr.write_record(&row)?;
        }
        wtr.flush()?;
        Ok(())
    }
}

pub(crate) fn parse_f64(s: &str) -> Option<f64> {
    s.trim().parse::<f64>().ok()
}

pub(crate) fn parse_code(s: &str) -> Option<LulcCode> {
    let s = s.trim();
    s.parse::<LulcCode>().ok().or_else(|| {
        let v = s.parse::<f64>().ok()?;
        (v.fract() == 0.0).then_some(v as LulcCode)
    })
}
