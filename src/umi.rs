// src/umi.rs
// UMI Extractor & Deduplicator: extracts the degenerate window trailing the
// tag region and collapses near-duplicates via an error-probability-weighted
// edit-distance sweep.

use std::collections::{HashMap, HashSet};

use crate::classifier::Orientation;
use crate::dna::revcomp;

const DEDUP_SWEEP_LIMIT: usize = 10_000;

#[derive(Debug, Clone)]
pub struct DegenPattern {
    pub static_prefix: Vec<u8>,
    pub n_len: usize,
}

fn umi_region(read_seq: &[u8], tag_start: usize, l_total: usize, orientation: Orientation) -> Option<Vec<u8>> {
    match orientation {
        Orientation::Forward => {
            let from = tag_start + l_total;
            if from > read_seq.len() {
                return None;
            }
            Some(read_seq[from..].to_vec())
        }
        Orientation::Reverse => {
            if tag_start > read_seq.len() {
                return None;
            }
            Some(revcomp(&read_seq[..tag_start]))
        }
    }
}

/// Extracts the UMI window from a read given the absolute position of the
/// tag-string's first base and the total tag+overhang length.
pub fn extract_umi(
    read_seq: &[u8],
    tag_start: usize,
    l_total: usize,
    orientation: Orientation,
    pattern: &DegenPattern,
) -> Option<Vec<u8>> {
    if pattern.n_len == 0 {
        return None;
    }
    let region = umi_region(read_seq, tag_start, l_total, orientation)?;

    if region.len() < pattern.static_prefix.len() + pattern.n_len {
        return None;
    }
    if &region[..pattern.static_prefix.len()] != pattern.static_prefix.as_slice() {
        return None;
    }
    let start = pattern.static_prefix.len();
    Some(region[start..start + pattern.n_len].to_vec())
}

/// Returns the bytes actually observed where `pattern.static_prefix` was
/// expected, regardless of whether they match — used to calibrate the
/// background error rate even on reads where extraction itself failed.
pub fn observed_prefix(
    read_seq: &[u8],
    tag_start: usize,
    l_total: usize,
    orientation: Orientation,
    pattern: &DegenPattern,
) -> Option<Vec<u8>> {
    if pattern.static_prefix.is_empty() {
        return None;
    }
    let region = umi_region(read_seq, tag_start, l_total, orientation)?;
    region.get(..pattern.static_prefix.len()).map(|s| s.to_vec())
}

/// Two-row dynamic-programming Levenshtein distance (O(min(m,n)) memory).
pub fn levenshtein(a: &[u8], b: &[u8]) -> usize {
    let (m, n) = (a.len(), b.len());
    if m == 0 {
        return n;
    }
    if n == 0 {
        return m;
    }
    let mut prev: Vec<usize> = (0..=n).collect();
    let mut curr: Vec<usize> = vec![0; n + 1];
    for i in 1..=m {
        curr[0] = i;
        for j in 1..=n {
            let cost = if a[i - 1] == b[j - 1] { 0 } else { 1 };
            curr[j] = (prev[j] + 1).min(curr[j - 1] + 1).min(prev[j - 1] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[n]
}

/// Minimum Levenshtein distance over extending/truncating `b` by up to
/// `max_indel` bases at either end, padding with the corresponding slice of
/// `a` on the right or truncating `b` from the left.
pub fn min_seq_ld(a: &[u8], b: &[u8], max_indel: usize) -> usize {
    let mut best = usize::MAX;
    for k in 0..=max_indel {
        let mut padded = b.to_vec();
        let start = b.len();
        let end = (start + k).min(a.len());
        if end > start {
            padded.extend_from_slice(&a[start..end]);
        }
        let truncated: Vec<u8> = if k <= b.len() { b[k..].to_vec() } else { Vec::new() };

        best = best.min(levenshtein(a, &padded)).min(levenshtein(a, &truncated));
    }
    best
}

/// Accumulates per-staticSeq edit-distance observations against a read's
/// first `|staticSeq|` bases, used to calibrate `baseError[e]`.
#[derive(Debug, Default)]
pub struct ErrorCalibrator {
    observations: HashMap<Vec<u8>, (u64, HashMap<usize, u64>)>,
}

impl ErrorCalibrator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, static_seq: &[u8], observed_prefix: &[u8]) {
        if static_seq.is_empty() {
            return;
        }
        let dist = levenshtein(static_seq, observed_prefix);
        let entry = self
            .observations
            .entry(static_seq.to_vec())
            .or_insert_with(|| (0, HashMap::new()));
        entry.0 += 1;
        *entry.1.entry(dist).or_insert(0) += 1;
    }

    /// Folds another calibrator's observations into this one; commutative and
    /// associative, so shard merge order doesn't matter.
    pub fn merge(&mut self, other: ErrorCalibrator) {
        for (static_seq, (total, dist_counts)) in other.observations {
            let entry = self.observations.entry(static_seq).or_insert_with(|| (0, HashMap::new()));
            entry.0 += total;
            for (dist, count) in dist_counts {
                *entry.1.entry(dist).or_insert(0) += count;
            }
        }
    }

    /// `baseError[e] = max over staticSeqs of (observations at distance e) / (total * |staticSeq|)`.
    pub fn base_error_rates(&self, max_e: usize) -> HashMap<usize, f64> {
        let mut result = HashMap::new();
        let have_data = self.observations.values().any(|(total, _)| *total > 0);
        if !have_data {
            return result;
        }
        for e in 1..=max_e {
            let mut max_rate = 0.0f64;
            for (static_seq, (total, dist_counts)) in &self.observations {
                if *total == 0 {
                    continue;
                }
                let obs = *dist_counts.get(&e).unwrap_or(&0) as f64;
                let rate = obs / (*total as f64 * static_seq.len() as f64);
                if rate > max_rate {
                    max_rate = rate;
                }
            }
            result.insert(e, max_rate);
        }
        result
    }
}

/// Collapses near-duplicate UMIs in `umis` (a count-multiset), returning the
/// deduplicated unique count.
pub fn dedup_count(
    umis: &HashMap<Vec<u8>, u64>,
    base_error: &HashMap<usize, f64>,
    max_degen_errors: usize,
) -> u64 {
    if umis.is_empty() {
        return 0;
    }
    if umis.len() > DEDUP_SWEEP_LIMIT {
        return umis.len() as u64;
    }

    let mut uniques: Vec<(Vec<u8>, u64)> = umis.iter().map(|(k, v)| (k.clone(), *v)).collect();
    // Sort by decreasing multiplicity, tie-break lexicographic ascending.
    uniques.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    let a_list = uniques.clone();
    let mut r_list = uniques;
    r_list.reverse();

    let mut dedup = a_list.len() as i64;
    let mut removed: HashSet<Vec<u8>> = HashSet::new();

    let a_working: &[(Vec<u8>, u64)] = if a_list.len() > 1 {
        &a_list[..a_list.len() - 1]
    } else {
        &[]
    };
    let r_working: &[(Vec<u8>, u64)] = if r_list.len() > 1 {
        &r_list[..r_list.len() - 1]
    } else {
        &[]
    };

    for (u_seq, u_count) in a_working {
        if removed.contains(u_seq) {
            continue;
        }
        for e in 1..=max_degen_errors {
            let Some(&rate) = base_error.get(&e) else {
                continue;
            };
            let tau = (*u_count as f64) * (u_seq.len() as f64) * rate;
            for (v_seq, v_count) in r_working {
                if removed.contains(v_seq) || v_seq == u_seq {
                    continue;
                }
                if (*v_count as f64) < tau {
                    if min_seq_ld(u_seq, v_seq, e) <= e {
                        removed.insert(v_seq.clone());
                        dedup -= 1;
                    }
                } else {
                    break;
                }
            }
        }
    }

    dedup.max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_umi_forward() {
        let read = b"GTCAGAAACCCCCAGCAAAAA";
        // tag_start = 5 ("AAACCC" begins at index5), l_total = 6
        let pattern = DegenPattern {
            static_prefix: b"CCAGCA".to_vec(),
            n_len: 4,
        };
        let umi = extract_umi(read, 5, 6, Orientation::Forward, &pattern);
        assert_eq!(umi, Some(b"AAAA".to_vec()));
    }

    #[test]
    fn test_extract_umi_missing_pattern() {
        let read = b"GTCAGAAACCCXXXXXX";
        let pattern = DegenPattern {
            static_prefix: b"CCAGCA".to_vec(),
            n_len: 4,
        };
        assert_eq!(extract_umi(read, 5, 6, Orientation::Forward, &pattern), None);
    }

    #[test]
    fn test_levenshtein() {
        assert_eq!(levenshtein(b"AAAA", b"AAAA"), 0);
        assert_eq!(levenshtein(b"AAAA", b"AAAT"), 1);
        assert_eq!(levenshtein(b"AAAA", b"AAA"), 1);
        assert_eq!(levenshtein(b"kitten", b"sitting"), 3);
    }

    #[test]
    fn test_min_seq_ld() {
        assert_eq!(min_seq_ld(b"AAAA", b"AAA", 1), 0); // padding AAA with A -> AAAA
        assert_eq!(min_seq_ld(b"AAAA", b"AAAA", 0), 0);
    }

    #[test]
    fn test_dedup_scenario_umi_not_collapsed_below_threshold() {
        // Spec §8 scenario 4: AAAA x2, AAAT x1, baseError[1] = 0.01 -> no collapse.
        let mut umis = HashMap::new();
        umis.insert(b"AAAA".to_vec(), 2u64);
        umis.insert(b"AAAT".to_vec(), 1u64);
        let mut base_error = HashMap::new();
        base_error.insert(1usize, 0.01);
        assert_eq!(dedup_count(&umis, &base_error, 1), 2);
    }

    #[test]
    fn test_dedup_collapses_low_count_near_duplicate() {
        let mut umis = HashMap::new();
        umis.insert(b"AAAA".to_vec(), 100u64);
        umis.insert(b"AAAT".to_vec(), 1u64);
        let mut base_error = HashMap::new();
        base_error.insert(1usize, 0.5); // tau = 100*4*0.5 = 200 > 1
        assert_eq!(dedup_count(&umis, &base_error, 1), 1);
    }

    #[test]
    fn test_error_calibrator() {
        let mut cal = ErrorCalibrator::new();
        cal.record(b"CCAGCA", b"CCAGCA");
        cal.record(b"CCAGCA", b"CCAGCA");
        cal.record(b"CCAGCA", b"CCAGTA");
        let rates = cal.base_error_rates(1);
        // 1 observation at distance 1 out of 3 total * 6 bases = 1/18
        assert!((rates[&1] - (1.0 / 18.0)).abs() < 1e-9);
    }
}
