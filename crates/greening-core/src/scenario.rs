//! Scenario generation: choose which eligible cells are greened for a given
//! change proportion and spatial interaction policy.

use std::fmt;
use std::str::FromStr;

use rand::seq::index;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::eligibility::{EligibilityIndex, EligibleCell};
use crate::raster::{LulcRaster, RasterError};

/// Highest possible adjacency score of a 3x3 window.
const MAX_SCORE: usize = 9;

#[derive(Error, Debug, PartialEq)]
pub enum ScenarioError {
    #[error("change proportion {0} is outside [0, 1]")]
    InvalidChangeProp(f64),
    #[error("unknown interaction '{0}' (expected random, cluster or scatter)")]
    UnknownInteraction(String),
    #[error("eligibility index does not match raster: {0}")]
    Raster(#[from] RasterError),
}

/// Spatial rule deciding which eligible cells are greened first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Interaction {
    /// Uniform sample of the eligible cells.
    Random,
    /// Prefer cells surrounded by high tree cover.
    Cluster,
    /// Prefer cells far from high tree cover.
    Scatter,
}

impl Interaction {
    pub const ALL: [Interaction; 3] = [Interaction::Random, Interaction::Cluster, Interaction::Scatter];

    pub fn as_str(self) -> &'static str {
        match self {
            Interaction::Random => "random",
            Interaction::Cluster => "cluster",
            Interaction::Scatter => "scatter",
        }
    }

    /// Stable numeric key used for seed derivation.
    pub fn key(self) -> u64 {
        match self {
            Interaction::Random => 0,
            Interaction::Cluster => 1,
            Interaction::Scatter => 2,
        }
    }
}

impl FromStr for Interaction {
    type Err = ScenarioError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "random" => Ok(Interaction::Random),
            "cluster" => Ok(Interaction::Cluster),
            "scatter" => Ok(Interaction::Scatter),
            _ => Err(ScenarioError::UnknownInteraction(s.to_string())),
        }
    }
}

impl fmt::Display for Interaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One point of a scenario sweep.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    pub interaction: Interaction,
    pub change_prop: f64,
    pub run: usize,
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.interaction, self.change_prop, self.run)
    }
}

pub fn validate_change_prop(change_prop: f64) -> Result<(), ScenarioError> {
    if (0.0..=1.0).contains(&change_prop) {
        Ok(())
    } else {
        Err(ScenarioError::InvalidChangeProp(change_prop))
    }
}

/// `floor(n_eligible * change_prop)`.
pub fn num_to_change(n_eligible: usize, change_prop: f64) -> usize {
    (n_eligible as f64 * change_prop).floor() as usize
}

/// Positions (into `index.cells()`, ascending) of the cells to green.
///
/// Endpoints are deterministic and never touch `rng`. In between, exactly
/// [`num_to_change`] cells are returned:
/// - `Random` samples uniformly without replacement.
/// - `Cluster` takes every cell scoring above the boundary score of the
///   descending ranking, then fills the quota by sampling among the cells
///   tied at that boundary score.
/// - `Scatter` does the same on the ascending ranking.
pub fn select_cells<R: Rng + ?Sized>(
    index: &EligibilityIndex,
    change_prop: f64,
    interaction: Interaction,
    rng: &mut R,
) -> Result<Vec<usize>, ScenarioError> {
    validate_change_prop(change_prop)?;
    let n = index.len();
    if change_prop == 0.0 {
        return Ok(Vec::new());
    }
    if change_prop == 1.0 {
        return Ok((0..n).collect());
    }

    let k = num_to_change(n, change_prop);
    if k == 0 {
        return Ok(Vec::new());
    }

    let mut selected = match interaction {
        Interaction::Random => index::sample(rng, n, k).into_vec(),
        Interaction::Cluster => select_ranked(index.cells(), k, true, rng),
        Interaction::Scatter => select_ranked(index.cells(), k, false, rng),
    };
    selected.sort_unstable();
    Ok(selected)
}

/// Boundary-score selection. Scores live in `[0, 9]`, so the ranking is a
/// counting pass rather than a sort.
fn select_ranked<R: Rng + ?Sized>(cells: &[EligibleCell], k: usize, descending: bool, rng: &mut R) -> Vec<usize> {
    let mut counts = [0usize; MAX_SCORE + 1];
    for cell in cells {
        counts[cell.adjacency_score as usize] += 1;
    }

    let order: Vec<usize> = if descending {
        (0..=MAX_SCORE).rev().collect()
    } else {
        (0..=MAX_SCORE).collect()
    };

    // Boundary score: the score at rank k - 1 of the ranking.
    let mut taken = 0usize;
    let mut boundary = order[order.len() - 1];
    for &score in &order {
        if taken + counts[score] >= k {
            boundary = score;
            break;
        }
        taken += counts[score];
    }
    let boundary = boundary as u8;
    let beats = |score: u8| if descending { score > boundary } else { score < boundary };

    let mut selected: Vec<usize> = Vec::with_capacity(k);
    let mut ties: Vec<usize> = Vec::new();
    for (pos, cell) in cells.iter().enumerate() {
        if beats(cell.adjacency_score) {
            selected.push(pos);
        } else if cell.adjacency_score == boundary {
            ties.push(pos);
        }
    }

    let quota = k - selected.len();
    debug!(boundary, above = selected.len(), ties = ties.len(), quota, "ranked selection");
    selected.extend(index::sample(rng, ties.len(), quota).into_iter().map(|i| ties[i]));
    selected
}

/// Generate a scenario raster: a copy of `raster` with the selected eligible
/// cells rewritten to their next code.
///
/// An empty eligible set, or a proportion that rounds down to zero cells,
/// yields an unmodified copy.
pub fn generate<R: Rng + ?Sized>(
    index: &EligibilityIndex,
    raster: &LulcRaster,
    change_prop: f64,
    interaction: Interaction,
    rng: &mut R,
) -> Result<LulcRaster, ScenarioError> {
    validate_change_prop(change_prop)?;
    let (height, width) = index.shape();
    raster.ensure_shape(height, width)?;

    if change_prop > 0.0 && index.is_empty() {
        warn!(change_prop, %interaction, "no eligible cells, scenario is a no-op");
        return Ok(raster.clone());
    }

    let selected = select_cells(index, change_prop, interaction, rng)?;
    if selected.is_empty() && change_prop > 0.0 {
        debug!(change_prop, eligible = index.len(), "change proportion rounds down to zero cells");
    }

    let mut out = raster.clone();
    let cells = index.cells();
    for pos in selected {
        let cell = cells[pos];
        out.data[cell.index] = cell.next_code;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eligibility::EligibleCell;
    use crate::raster::LulcRaster;
    use rand::rngs::StdRng;
    use rand::{RngCore, SeedableRng};
    use std::collections::HashSet;

    const FROM: i32 = 1;
    const TO: i32 = 2;

    /// 10x10 raster of changeable cells with scores cycling through 0..=8.
    fn fixture() -> (LulcRaster, EligibilityIndex) {
        let raster = LulcRaster::filled(10, 10, FROM, 0);
        let cells = (0..100)
            .map(|i| EligibleCell { index: i, next_code: TO, adjacency_score: (i % 9) as u8 })
            .collect();
        (raster, EligibilityIndex::from_cells(cells, 10, 10, 0.75))
    }

    fn changed(before: &LulcRaster, after: &LulcRaster) -> HashSet<usize> {
        before
            .data
            .iter()
            .zip(&after.data)
            .enumerate()
            .filter(|(_, (a, b))| a != b)
            .map(|(i, _)| i)
            .collect()
    }

    #[test]
    fn zero_proportion_is_identity_and_consumes_no_randomness() {
        let (raster, idx) = fixture();
        let mut rng = StdRng::seed_from_u64(7);
        let mut reference = rng.clone();
        for interaction in Interaction::ALL {
            let out = generate(&idx, &raster, 0.0, interaction, &mut rng).unwrap();
            assert_eq!(out, raster);
        }
        assert_eq!(rng.next_u64(), reference.next_u64());
    }

    #[test]
    fn full_proportion_is_policy_invariant() {
        let (raster, idx) = fixture();
        let mut rng = StdRng::seed_from_u64(7);
        let outs: Vec<LulcRaster> = Interaction::ALL
            .iter()
            .map(|&i| generate(&idx, &raster, 1.0, i, &mut rng).unwrap())
            .collect();
        assert!(outs.windows(2).all(|w| w[0] == w[1]));
        assert!(outs[0].data.iter().all(|&c| c == TO));
    }

    #[test]
    fn exact_number_of_cells_change() {
        let (raster, idx) = fixture();
        let mut rng = StdRng::seed_from_u64(3);
        for interaction in Interaction::ALL {
            for p in [0.01, 0.1, 0.25, 0.3, 0.5, 0.77, 0.99] {
                let out = generate(&idx, &raster, p, interaction, &mut rng).unwrap();
                assert_eq!(
                    changed(&raster, &out).len(),
                    num_to_change(100, p),
                    "{interaction} at {p}"
                );
            }
        }
    }

    #[test]
    fn cluster_thirty_percent_takes_highest_scores() {
        let (_, idx) = fixture();
        let mut rng = StdRng::seed_from_u64(11);
        let sel = select_cells(&idx, 0.3, Interaction::Cluster, &mut rng).unwrap();
        assert_eq!(sel.len(), 30);

        let scores: Vec<u8> = sel.iter().map(|&p| idx.cells()[p].adjacency_score).collect();
        // 11 cells each at 8 and 7, then 8 of the 11 cells at 6
        assert!(scores.iter().all(|&s| s >= 6));
        assert_eq!(scores.iter().filter(|&&s| s == 8).count(), 11);
        assert_eq!(scores.iter().filter(|&&s| s == 7).count(), 11);
        assert_eq!(scores.iter().filter(|&&s| s == 6).count(), 8);
    }

    #[test]
    fn scatter_prefers_isolated_cells() {
        let (_, idx) = fixture();
        let mut rng = StdRng::seed_from_u64(11);
        let sel = select_cells(&idx, 0.2, Interaction::Scatter, &mut rng).unwrap();
        assert_eq!(sel.len(), 20);
        let scores: Vec<u8> = sel.iter().map(|&p| idx.cells()[p].adjacency_score).collect();
        // 12 cells at 0, then 8 of the 11 at 1
        assert_eq!(scores.iter().filter(|&&s| s == 0).count(), 12);
        assert_eq!(scores.iter().filter(|&&s| s == 1).count(), 8);
    }

    #[test]
    fn cluster_expansion_is_monotonic_above_the_boundary() {
        let (_, idx) = fixture();
        let mut rng = StdRng::seed_from_u64(5);
        let small: HashSet<usize> = select_cells(&idx, 0.2, Interaction::Cluster, &mut rng)
            .unwrap()
            .into_iter()
            .collect();
        let large: HashSet<usize> = select_cells(&idx, 0.5, Interaction::Cluster, &mut rng)
            .unwrap()
            .into_iter()
            .collect();
        // p = 0.5 -> 50 cells, boundary score 4; everything scoring above 4 is in
        let boundary = 4;
        for &pos in &small {
            let s = idx.cells()[pos].adjacency_score;
            assert!(s > boundary);
            assert!(large.contains(&pos));
        }
    }

    #[test]
    fn same_seed_same_scenario() {
        let (raster, idx) = fixture();
        for interaction in Interaction::ALL {
            let a = generate(&idx, &raster, 0.4, interaction, &mut StdRng::seed_from_u64(99)).unwrap();
            let b = generate(&idx, &raster, 0.4, interaction, &mut StdRng::seed_from_u64(99)).unwrap();
            assert_eq!(a, b);
        }
    }

    #[test]
    fn empty_eligible_set_is_a_no_op() {
        let raster = LulcRaster::filled(4, 4, FROM, 0);
        let idx = EligibilityIndex::from_cells(Vec::new(), 4, 4, 0.75);
        let mut rng = StdRng::seed_from_u64(1);
        let out = generate(&idx, &raster, 0.5, Interaction::Cluster, &mut rng).unwrap();
        assert_eq!(out, raster);
    }

    #[test]
    fn invalid_change_prop_is_rejected() {
        let (raster, idx) = fixture();
        let mut rng = StdRng::seed_from_u64(1);
        for p in [-0.1, 1.5, f64::NAN] {
            assert!(matches!(
                generate(&idx, &raster, p, Interaction::Random, &mut rng),
                Err(ScenarioError::InvalidChangeProp(_))
            ));
        }
    }

    #[test]
    fn mismatched_raster_is_rejected() {
        let (_, idx) = fixture();
        let other = LulcRaster::filled(5, 5, FROM, 0);
        let mut rng = StdRng::seed_from_u64(1);
        assert!(matches!(
            generate(&idx, &other, 0.5, Interaction::Random, &mut rng),
            Err(ScenarioError::Raster(_))
        ));
    }

    #[test]
    fn interaction_parsing() {
        assert_eq!("Cluster".parse::<Interaction>().unwrap(), Interaction::Cluster);
        assert_eq!(" scatter ".parse::<Interaction>().unwrap(), Interaction::Scatter);
        assert!(matches!(
            "clustered".parse::<Interaction>(),
            Err(ScenarioError::UnknownInteraction(_))
        ));
    }
}
