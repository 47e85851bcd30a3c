//! Next-code resolution: for each changeable LULC code, the code with the
//! highest feasible tree cover that keeps the same base category and the same
//! building cover.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

use tracing::debug;

use crate::biophysical::{BaseCategory, BiophysicalRecord, BiophysicalTable};
use crate::raster::LulcCode;

/// Mapping from a LULC code to the code it becomes when greened.
///
/// Every mapping strictly increases `shade`, so following the map always
/// terminates. Codes absent from the map are terminal.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NextCodeMap {
    map: HashMap<LulcCode, LulcCode>,
}

impl NextCodeMap {
    pub fn get(&self, code: LulcCode) -> Option<LulcCode> {
        self.map.get(&code).copied()
    }

    pub fn contains(&self, code: LulcCode) -> bool {
        self.map.contains_key(&code)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (LulcCode, LulcCode)> + '_ {
        self.map.iter().map(|(&k, &v)| (k, v))
    }

    /// Follow the map from `code` until a terminal code is reached.
    pub fn terminal(&self, code: LulcCode) -> LulcCode {
        let mut current = code;
        // bounded by the number of mappings since shade strictly increases
        for _ in 0..=self.map.len() {
            match self.map.get(&current) {
                Some(&next) => current = next,
                None => break,
            }
        }
        current
    }
}

/// Build the next-code map for the given changeable categories.
///
/// Per category (skipped when all its codes share a single shade value):
/// infeasible codes (`shade + building_intensity > 1`) are dropped; the rest
/// are grouped by building intensity. Within each group the code with the
/// highest shade (largest `lucode` on ties) is the target and every code with
/// strictly lower shade maps to it.
pub fn build_next_code_map(table: &BiophysicalTable, changeable: &[BaseCategory]) -> NextCodeMap {
    let mut map = HashMap::new();

    for &category in changeable {
        let records: Vec<&BiophysicalRecord> = table
            .records()
            .iter()
            .filter(|r| r.base_category == category)
            .collect();

        let mut shades: Vec<f64> = records.iter().map(|r| r.shade).collect();
        shades.sort_by(|a, b| a.total_cmp(b));
        shades.dedup();
        if shades.len() <= 1 {
            debug!(%category, "single shade tier, no changeable codes");
            continue;
        }

        // Strata keyed by building intensity (bit pattern keeps f64 hashable
        // and exact; intensities come from bin centres).
        let mut strata: BTreeMap<u64, Vec<&BiophysicalRecord>> = BTreeMap::new();
        for rec in records.into_iter().filter(|r| r.is_feasible()) {
            strata.entry(rec.building_intensity.to_bits()).or_default().push(rec);
        }

        for (_, mut stratum) in strata {
            stratum.sort_by(|a, b| by_shade_then_code(a, b));
            let Some(target) = stratum.last() else { continue };
            for rec in &stratum {
                if rec.shade < target.shade {
                    map.insert(rec.lucode, target.lucode);
                }
            }
        }
    }

    debug!(n = map.len(), "built next-code map");
    NextCodeMap { map }
}

fn by_shade_then_code(a: &BiophysicalRecord, b: &BiophysicalRecord) -> Ordering {
    a.shade.total_cmp(&b.shade).then(a.lucode.cmp(&b.lucode))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::biophysical::BiophysicalRecord as Rec;

    /// Road codes laid out as in a 4x4 cover reclassification: tree bins
    /// outer, building bins inner, centres at 0.125/0.375/0.625/0.875.
    fn road_table() -> BiophysicalTable {
        let centres = [0.125, 0.375, 0.625, 0.875];
        let mut recs = Vec::new();
        let mut code = 1;
        for &tree in &centres {
            for &bldg in &centres {
                recs.push(Rec::new(code, BaseCategory::Road, tree, bldg));
                code += 1;
            }
        }
        BiophysicalTable::new(recs).unwrap()
    }

    #[test]
    fn maps_to_highest_feasible_shade_with_same_building_cover() {
        let map = build_next_code_map(&road_table(), &BaseCategory::CHANGEABLE);
        // tree 0.125 / bldg 0.125 (code 1) -> tree 0.875 / bldg 0.125 (code 13)
        assert_eq!(map.get(1), Some(13));
        // tree 0.125 / bldg 0.375 (code 2) -> tree 0.625 / bldg 0.375 (code 10)
        assert_eq!(map.get(2), Some(10));
        // tree 0.125 / bldg 0.875 (code 4): only feasible shade is 0.125 -> terminal
        assert_eq!(map.get(4), None);
        // targets are terminal
        assert_eq!(map.get(13), None);
        assert_eq!(map.get(10), None);
    }

    #[test]
    fn infeasible_codes_are_neither_sources_nor_targets() {
        let table = road_table();
        let map = build_next_code_map(&table, &BaseCategory::CHANGEABLE);
        for (from, to) in map.iter() {
            assert!(table.get(from).unwrap().is_feasible());
            assert!(table.get(to).unwrap().is_feasible());
        }
        // tree 0.875 / bldg 0.375 (code 14) is infeasible
        assert!(!map.contains(14));
        assert!(map.iter().all(|(_, to)| to != 14));
    }

    #[test]
    fn no_self_maps_and_no_cycles() {
        let table = road_table();
        let map = build_next_code_map(&table, &BaseCategory::CHANGEABLE);
        assert!(!map.is_empty());
        for (from, to) in map.iter() {
            assert_ne!(from, to);
            assert!(table.shade(to).unwrap() > table.shade(from).unwrap());
            let end = map.terminal(from);
            assert!(!map.contains(end));
        }
    }

    #[test]
    fn single_shade_category_is_skipped() {
        let recs = vec![
            Rec::new(1, BaseCategory::Sidewalk, 0.5, 0.0),
            Rec::new(2, BaseCategory::Sidewalk, 0.5, 0.25),
        ];
        let table = BiophysicalTable::new(recs).unwrap();
        assert!(build_next_code_map(&table, &BaseCategory::CHANGEABLE).is_empty());
    }

    #[test]
    fn non_changeable_categories_are_ignored() {
        let recs = vec![
            Rec::new(1, BaseCategory::Other(5), 0.1, 0.0),
            Rec::new(2, BaseCategory::Other(5), 0.9, 0.0),
        ];
        let table = BiophysicalTable::new(recs).unwrap();
        assert!(build_next_code_map(&table, &BaseCategory::CHANGEABLE).is_empty());
    }

    #[test]
    fn shade_ties_at_the_top_pick_largest_code_and_stay_terminal() {
        let recs = vec![
            Rec::new(1, BaseCategory::Garden, 0.1, 0.0),
            Rec::new(7, BaseCategory::Garden, 0.9, 0.0),
            Rec::new(3, BaseCategory::Garden, 0.9, 0.0),
        ];
        let table = BiophysicalTable::new(recs).unwrap();
        let map = build_next_code_map(&table, &BaseCategory::CHANGEABLE);
        assert_eq!(map.get(1), Some(7));
        assert_eq!(map.get(3), None);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn result_does_not_depend_on_row_order() {
        let table = road_table();
        let mut reversed = table.records().to_vec();
        reversed.reverse();
        let reversed = BiophysicalTable::new(reversed).unwrap();
        assert_eq!(
            build_next_code_map(&table, &BaseCategory::CHANGEABLE),
            build_next_code_map(&reversed, &BaseCategory::CHANGEABLE)
        );
    }
}
