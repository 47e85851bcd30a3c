//! Eligible cells and their Moore-neighbourhood adjacency to high tree cover.
//!
//! Built once per (raster, shade threshold) and shared read-only by every
//! scenario generated from that raster.

use std::collections::HashSet;

use thiserror::Error;
use tracing::debug;

use crate::biophysical::{BaseCategory, BiophysicalTable};
use crate::next_code::NextCodeMap;
use crate::raster::{LulcCode, LulcRaster, RasterError};

#[derive(Error, Debug, PartialEq)]
pub enum EligibilityError {
    #[error("exclusion mask: {0}")]
    Mask(#[from] RasterError),
    #[error("shade threshold {0} is outside [0, 1]")]
    InvalidThreshold(f64),
}

/// Boolean grid of cells that must never change, same shape as the raster.
#[derive(Debug, Clone, PartialEq)]
pub struct ExclusionMask {
    pub data: Vec<bool>,
    pub width: usize,
    pub height: usize,
}

impl ExclusionMask {
    /// Mask that excludes nothing.
    pub fn empty(width: usize, height: usize) -> Self {
        Self { data: vec![false; width * height], width, height }
    }

    pub fn count(&self) -> usize {
        self.data.iter().filter(|&&v| v).count()
    }

    fn ensure_shape(&self, raster: &LulcRaster) -> Result<(), RasterError> {
        if (self.height, self.width) != raster.shape() || self.data.len() != raster.len() {
            return Err(RasterError::ShapeMismatch {
                expected: raster.shape(),
                actual: (self.height, self.width),
            });
        }
        Ok(())
    }
}

/// A cell that can be greened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EligibleCell {
    /// Row-major cell index into the raster.
    pub index: usize,
    pub next_code: LulcCode,
    /// High-tree cells in the 3x3 window around the cell, itself included (0-9).
    pub adjacency_score: u8,
}

/// Immutable per-raster change metadata: the eligible cells in raster order.
#[derive(Debug, Clone, PartialEq)]
pub struct EligibilityIndex {
    cells: Vec<EligibleCell>,
    width: usize,
    height: usize,
    shade_threshold: f64,
}

impl EligibilityIndex {
    /// Assemble an index from precomputed cells (sorted by raster index).
    pub fn from_cells(mut cells: Vec<EligibleCell>, width: usize, height: usize, shade_threshold: f64) -> Self {
        cells.sort_by_key(|c| c.index);
        Self { cells, width, height, shade_threshold }
    }

    pub fn cells(&self) -> &[EligibleCell] {
        &self.cells
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn shade_threshold(&self) -> f64 {
        self.shade_threshold
    }

    /// (height, width) of the raster the index was built from.
    pub fn shape(&self) -> (usize, usize) {
        (self.height, self.width)
    }
}

/// Cells whose code has tree cover `>= shade_threshold`. Cells without a
/// table entry (nodata included) are `false`.
pub fn high_tree_mask(raster: &LulcRaster, table: &BiophysicalTable, shade_threshold: f64) -> Vec<bool> {
    let high: HashSet<LulcCode> = table.high_tree_codes(shade_threshold);
    raster
        .data
        .iter()
        .enumerate()
        .map(|(i, code)| !raster.is_nodata(i) && high.contains(code))
        .collect()
}

/// 3x3 box sum of `mask`. Out-of-grid neighbours replicate the nearest edge
/// cell, so every cell sums exactly nine values.
pub fn moore_convolve(mask: &[bool], width: usize, height: usize) -> Vec<u8> {
    let mut out = vec![0u8; width * height];
    if width == 0 || height == 0 {
        return out;
    }
    for r in 0..height {
        for c in 0..width {
            let mut sum = 0u8;
            for dr in -1i64..=1 {
                let nr = (r as i64 + dr).clamp(0, height as i64 - 1) as usize;
                for dc in -1i64..=1 {
                    let nc = (c as i64 + dc).clamp(0, width as i64 - 1) as usize;
                    sum += mask[nr * width + nc] as u8;
                }
            }
            out[r * width + c] = sum;
        }
    }
    out
}

/// Binary erosion under 8-connectivity; out-of-grid cells count as `false`,
/// so border cells never survive.
pub fn binary_erosion(mask: &[bool], width: usize, height: usize) -> Vec<bool> {
    let mut out = vec![false; width * height];
    if width < 3 || height < 3 {
        return out;
    }
    for r in 1..height - 1 {
        for c in 1..width - 1 {
            out[r * width + c] = (r - 1..=r + 1)
                .all(|nr| (c - 1..=c + 1).all(|nc| mask[nr * width + nc]));
        }
    }
    out
}

/// Road cells entirely surrounded by road cells: no room for new trees.
pub fn inner_road_mask(raster: &LulcRaster, table: &BiophysicalTable) -> ExclusionMask {
    let road_codes = table.codes_in_category(BaseCategory::Road);
    let road: Vec<bool> = raster
        .data
        .iter()
        .enumerate()
        .map(|(i, code)| !raster.is_nodata(i) && road_codes.contains(code))
        .collect();
    let data = binary_erosion(&road, raster.width, raster.height);
    ExclusionMask { data, width: raster.width, height: raster.height }
}

/// Collect the eligible cells of `raster`.
///
/// A cell is eligible when it is not nodata, its code has a next code and it
/// is not excluded by `exclusion`.
pub fn build_eligibility(
    raster: &LulcRaster,
    next_codes: &NextCodeMap,
    table: &BiophysicalTable,
    shade_threshold: f64,
    exclusion: &ExclusionMask,
) -> Result<EligibilityIndex, EligibilityError> {
    if !(0.0..=1.0).contains(&shade_threshold) {
        return Err(EligibilityError::InvalidThreshold(shade_threshold));
    }
    exclusion.ensure_shape(raster)?;

    let high = high_tree_mask(raster, table, shade_threshold);
    let scores = moore_convolve(&high, raster.width, raster.height);

    let cells: Vec<EligibleCell> = raster
        .data
        .iter()
        .enumerate()
        .filter(|&(i, _)| !raster.is_nodata(i) && !exclusion.data[i])
        .filter_map(|(i, &code)| {
            next_codes.get(code).map(|next_code| EligibleCell {
                index: i,
                next_code,
                adjacency_score: scores[i],
            })
        })
        .collect();

    debug!(
        eligible = cells.len(),
        excluded = exclusion.count(),
        shade_threshold,
        "built eligibility index"
    );

    Ok(EligibilityIndex {
        cells,
        width: raster.width,
        height: raster.height,
        shade_threshold,
    })
}
