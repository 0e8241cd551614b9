// src/aggregator.rs
// Aggregator & Over-Representation Analyzer: accumulates per-compound counts
// as reads flow in, then (after end-of-stream) runs UMI deduplication and
// classifies tags/tag-pairs into sigma-bins of over-representation.

use std::collections::HashMap;

use crate::classifier::{MatchedRead, Orientation};
use crate::inventory::{ClosingPrimerId, Cycle, TagCode, TagInventory};
use crate::matcher::CycleSpec;
use crate::umi::{self, DegenPattern, ErrorCalibrator};

/// `(ClosingPrimerId, [(cycle, tagCode), ...])`: the unit of counting.
pub type CompoundKey = (ClosingPrimerId, Vec<(Cycle, TagCode)>);

#[derive(Debug, Default, Clone)]
pub struct CompoundStats {
    pub raw_count: u64,
    pub strand_net: i64,
    pub umi_multiset: HashMap<Vec<u8>, u64>,
    /// Set when at least one contributing read matched but its UMI pattern
    /// failed to extract (spec's "recoverable degradation").
    pub undedup: bool,
    pub dedup_count: u64,
}

impl CompoundStats {
    pub fn strand_bias(&self) -> f64 {
        if self.raw_count == 0 {
            0.0
        } else {
            self.strand_net.unsigned_abs() as f64 / self.raw_count as f64
        }
    }

    pub fn expected(&self, cp_id: &ClosingPrimerId, codes: &[(Cycle, TagCode)], inventory: &TagInventory) -> bool {
        codes.iter().all(|(_, code)| inventory.is_valid(cp_id, code))
    }
}

#[derive(Debug, Default)]
pub struct Aggregator {
    pub compounds: HashMap<CompoundKey, CompoundStats>,
    pub calibrator: ErrorCalibrator,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_match(
        &mut self,
        m: &MatchedRead,
        read_seq: &[u8],
        cycles: &[CycleSpec],
        patterns: &HashMap<ClosingPrimerId, DegenPattern>,
        umi_enabled: bool,
    ) {
        let codes: Vec<(Cycle, TagCode)> = cycles
            .iter()
            .zip(m.cp_match.codes.iter())
            .map(|(spec, code)| (spec.cycle, code.clone()))
            .collect();
        let key: CompoundKey = (m.cp_match.cp_id.clone(), codes);
        let stats = self.compounds.entry(key).or_default();
        stats.raw_count += 1;
        stats.strand_net += match m.orientation {
            Orientation::Forward => 1,
            Orientation::Reverse => -1,
        };

        if !umi_enabled {
            return;
        }
        let Some(pattern) = patterns.get(&m.cp_match.cp_id) else {
            return;
        };
        if pattern.n_len == 0 {
            return;
        }

        if let Some(observed) = umi::observed_prefix(read_seq, m.tag_start, m.consumed_len, m.orientation, pattern) {
            self.calibrator.record(&pattern.static_prefix, &observed);
        }

        match umi::extract_umi(read_seq, m.tag_start, m.consumed_len, m.orientation, pattern) {
            Some(u) => {
                *stats.umi_multiset.entry(u).or_insert(0) += 1;
            }
            None => stats.undedup = true,
        }
    }

    /// Runs the UMI dedup sweep (spec.md §4.5) over every compound.
    pub fn finalize_dedup(&mut self, max_degen_errors: usize) {
        let base_error = self.calibrator.base_error_rates(max_degen_errors.max(1));
        for stats in self.compounds.values_mut() {
            stats.dedup_count = if stats.umi_multiset.is_empty() {
                if stats.undedup {
                    1
                } else {
                    stats.raw_count
                }
            } else {
                umi::dedup_count(&stats.umi_multiset, &base_error, max_degen_errors)
            };
        }
    }

    pub fn matched_cp_reads(&self, cp_id: &ClosingPrimerId) -> u64 {
        self.compounds
            .iter()
            .filter(|(k, _)| &k.0 == cp_id)
            .map(|(_, v)| v.raw_count)
            .sum()
    }

    pub fn analyze_over_representation(&self) -> OverRepResult {
        OverRepResult::build(&self.compounds)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OverType {
    Raw,
    Dedup,
    Unique,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct StructStats {
    pub raw: u64,
    pub dedup: u64,
    pub unique: u64,
}

impl StructStats {
    fn value(&self, t: OverType) -> f64 {
        match t {
            OverType::Raw => self.raw as f64,
            OverType::Dedup => self.dedup as f64,
            OverType::Unique => self.unique as f64,
        }
    }
}

pub type PlaneKey = (Cycle, TagCode);
pub type LineKey = (Cycle, TagCode, Cycle, TagCode);

fn normalize_line(a: &(Cycle, TagCode), b: &(Cycle, TagCode)) -> LineKey {
    if a <= b {
        (a.0, a.1.clone(), b.0, b.1.clone())
    } else {
        (b.0, b.1.clone(), a.0, a.1.clone())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AxisStats {
    pub mean: f64,
    pub std: f64,
}

impl AxisStats {
    fn from_values(values: &[f64]) -> Self {
        if values.is_empty() {
            return AxisStats::default();
        }
        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        AxisStats { mean, std: var.sqrt() }
    }

    /// `v > mean + std` is "over"; its sigma-bin is `ceil((v - mean) / std)`.
    fn sigma_bin(&self, v: f64) -> i64 {
        if self.std <= 0.0 || v <= self.mean + self.std {
            return 0;
        }
        ((v - self.mean) / self.std).ceil() as i64
    }
}

#[derive(Debug, Default)]
struct CpOverRep {
    planes: HashMap<PlaneKey, StructStats>,
    lines: HashMap<LineKey, StructStats>,
    plane_axis: HashMap<OverType, AxisStats>,
    line_axis: HashMap<OverType, AxisStats>,
    compound_raw_axis: AxisStats,
    compound_dedup_axis: AxisStats,
}

#[derive(Debug, Default)]
pub struct OverRepResult {
    per_cp: HashMap<ClosingPrimerId, CpOverRep>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CompoundOverSignals {
    pub sdcount_raw: i64,
    pub sdcount_dedup: i64,
    pub over_raw_lines: f64,
    pub over_dedup_lines: f64,
    pub over_unique_lines: f64,
    pub over_raw_planes: f64,
    pub over_dedup_planes: f64,
    pub over_unique_planes: f64,
}

const OVER_TYPES: [OverType; 3] = [OverType::Raw, OverType::Dedup, OverType::Unique];

impl OverRepResult {
    fn build(compounds: &HashMap<CompoundKey, CompoundStats>) -> Self {
        let mut per_cp: HashMap<ClosingPrimerId, CpOverRep> = HashMap::new();

        for (key, stats) in compounds {
            let (cp_id, codes) = key;
            let entry = per_cp.entry(cp_id.clone()).or_default();
            for (cycle, code) in codes {
                let s = entry.planes.entry((*cycle, code.clone())).or_default();
                s.raw += stats.raw_count;
                s.dedup += stats.dedup_count;
                s.unique += 1;
            }
            for i in 0..codes.len() {
                for j in (i + 1)..codes.len() {
                    let key = normalize_line(&codes[i], &codes[j]);
                    let s = entry.lines.entry(key).or_default();
                    s.raw += stats.raw_count;
                    s.dedup += stats.dedup_count;
                    s.unique += 1;
                }
            }
        }

        for entry in per_cp.values_mut() {
            for &t in &OVER_TYPES {
                let plane_values: Vec<f64> = entry.planes.values().map(|s| s.value(t)).collect();
                entry.plane_axis.insert(t, AxisStats::from_values(&plane_values));
                let line_values: Vec<f64> = entry.lines.values().map(|s| s.value(t)).collect();
                entry.line_axis.insert(t, AxisStats::from_values(&line_values));
            }
        }

        for cp_id in per_cp.keys().cloned().collect::<Vec<_>>() {
            let raw_values: Vec<f64> = compounds
                .iter()
                .filter(|(k, _)| k.0 == cp_id)
                .map(|(_, v)| v.raw_count as f64)
                .collect();
            let dedup_values: Vec<f64> = compounds
                .iter()
                .filter(|(k, _)| k.0 == cp_id)
                .map(|(_, v)| v.dedup_count as f64)
                .collect();
            let entry = per_cp.get_mut(&cp_id).unwrap();
            entry.compound_raw_axis = AxisStats::from_values(&raw_values);
            entry.compound_dedup_axis = AxisStats::from_values(&dedup_values);
        }

        OverRepResult { per_cp }
    }

    pub fn signals_for(&self, key: &CompoundKey, stats: &CompoundStats) -> CompoundOverSignals {
        let (cp_id, codes) = key;
        let Some(entry) = self.per_cp.get(cp_id) else {
            return CompoundOverSignals::default();
        };

        let sdcount_raw = entry.compound_raw_axis.sigma_bin(stats.raw_count as f64);
        let sdcount_dedup = entry.compound_dedup_axis.sigma_bin(stats.dedup_count as f64);

        let mut planes_sum = HashMap::new();
        for &t in &OVER_TYPES {
            let axis = entry.plane_axis.get(&t).copied().unwrap_or_default();
            let mut sum = 0.0f64;
            for (cycle, code) in codes {
                if let Some(s) = entry.planes.get(&(*cycle, code.clone())) {
                    let bin = axis.sigma_bin(s.value(t));
                    if bin > 0 {
                        sum += bin as f64;
                        if bin > 1 {
                            sum += 0.1;
                        }
                    }
                }
            }
            planes_sum.insert(t, sum);
        }

        let mut lines_sum = HashMap::new();
        for &t in &OVER_TYPES {
            let axis = entry.line_axis.get(&t).copied().unwrap_or_default();
            let mut sum = 0.0f64;
            for i in 0..codes.len() {
                for j in (i + 1)..codes.len() {
                    let lkey = normalize_line(&codes[i], &codes[j]);
                    if let Some(s) = entry.lines.get(&lkey) {
                        let bin = axis.sigma_bin(s.value(t));
                        if bin > 0 {
                            sum += bin as f64;
                            if bin > 1 {
                                sum += 0.1;
                            }
                        }
                    }
                }
            }
            lines_sum.insert(t, sum);
        }

        CompoundOverSignals {
            sdcount_raw,
            sdcount_dedup,
            over_raw_lines: lines_sum[&OverType::Raw],
            over_dedup_lines: lines_sum[&OverType::Dedup],
            over_unique_lines: lines_sum[&OverType::Unique],
            over_raw_planes: planes_sum[&OverType::Raw],
            over_dedup_planes: planes_sum[&OverType::Dedup],
            over_unique_planes: planes_sum[&OverType::Unique],
        }
    }

    /// Flat list of every (cpId, structure, type) triple classified as
    /// over-represented (`v > mean + std`), for the `.over` companion file.
    pub fn over_represented(&self) -> Vec<OverEntry> {
        let mut out = Vec::new();
        for (cp_id, entry) in &self.per_cp {
            for &t in &OVER_TYPES {
                let axis = entry.plane_axis.get(&t).copied().unwrap_or_default();
                for (key, s) in &entry.planes {
                    let bin = axis.sigma_bin(s.value(t));
                    if bin > 0 {
                        out.push(OverEntry {
                            cp_id: cp_id.clone(),
                            structure: StructureDesc::Plane(key.clone()),
                            over_type: t,
                            value: s.value(t),
                            sigma_bin: bin,
                        });
                    }
                }
                let axis = entry.line_axis.get(&t).copied().unwrap_or_default();
                for (key, s) in &entry.lines {
                    let bin = axis.sigma_bin(s.value(t));
                    if bin > 0 {
                        out.push(OverEntry {
                            cp_id: cp_id.clone(),
                            structure: StructureDesc::Line(key.clone()),
                            over_type: t,
                            value: s.value(t),
                            sigma_bin: bin,
                        });
                    }
                }
            }
        }
        out
    }
}

#[derive(Debug, Clone)]
pub enum StructureDesc {
    Plane(PlaneKey),
    Line(LineKey),
}

#[derive(Debug, Clone)]
pub struct OverEntry {
    pub cp_id: ClosingPrimerId,
    pub structure: StructureDesc,
    pub over_type: OverType,
    pub value: f64,
    pub sigma_bin: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::SimilarKind;
    use crate::inventory::TagCode;
    use crate::matcher::CpMatch;

    fn matched(cp_id: &str, codes: &[&str], orientation: Orientation) -> MatchedRead {
        MatchedRead {
            cp_match: CpMatch {
                cp_id: ClosingPrimerId(cp_id.to_string()),
                codes: codes.iter().map(|c| TagCode(c.to_string())).collect(),
            },
            orientation,
            similar: None::<SimilarKind>,
            indel_positions: Vec::new(),
            substitutions: Vec::new(),
            tag_start: 5,
            consumed_len: 6,
            recovered: false,
        }
    }

    fn cycles() -> Vec<CycleSpec> {
        vec![
            CycleSpec { cycle: 1, len: 3, overhang: vec![] },
            CycleSpec { cycle: 2, len: 3, overhang: vec![] },
        ]
    }

    #[test]
    fn test_record_match_accumulates_raw_and_strand() {
        let mut agg = Aggregator::new();
        let patterns = HashMap::new();
        agg.record_match(&matched("CC", &["1.001", "2.001"], Orientation::Forward), b"GTCAGAAACCCCCAGCA", &cycles(), &patterns, false);
        agg.record_match(&matched("CC", &["1.001", "2.001"], Orientation::Reverse), b"GTCAGAAACCCCCAGCA", &cycles(), &patterns, false);
        agg.record_match(&matched("CC", &["1.001", "2.001"], Orientation::Forward), b"GTCAGAAACCCCCAGCA", &cycles(), &patterns, false);

        let key: CompoundKey = (
            ClosingPrimerId("CC".into()),
            vec![(1, TagCode("1.001".into())), (2, TagCode("2.001".into()))],
        );
        let stats = agg.compounds.get(&key).unwrap();
        assert_eq!(stats.raw_count, 3);
        assert_eq!(stats.strand_net, 1);
        assert!((stats.strand_bias() - (1.0 / 3.0)).abs() < 1e-9);
    }

    #[test]
    fn test_undedup_default_when_umi_extraction_fails() {
        let mut agg = Aggregator::new();
        let mut patterns = HashMap::new();
        patterns.insert(
            ClosingPrimerId("CC".into()),
            DegenPattern {
                static_prefix: b"ZZZZZZ".to_vec(),
                n_len: 4,
            },
        );
        agg.record_match(&matched("CC", &["1.001", "2.001"], Orientation::Forward), b"GTCAGAAACCCCCAGCA", &cycles(), &patterns, true);
        agg.finalize_dedup(1);

        let key: CompoundKey = (
            ClosingPrimerId("CC".into()),
            vec![(1, TagCode("1.001".into())), (2, TagCode("2.001".into()))],
        );
        let stats = agg.compounds.get(&key).unwrap();
        assert!(stats.undedup);
        assert_eq!(stats.dedup_count, 1);
    }

    #[test]
    fn test_over_representation_flags_dominant_tag() {
        let mut agg = Aggregator::new();
        let patterns = HashMap::new();
        // Compound A (1.001,2.001) gets 100 reads; three other compounds get 1 each.
        for _ in 0..100 {
            agg.record_match(&matched("CC", &["1.001", "2.001"], Orientation::Forward), b"x", &cycles(), &patterns, false);
        }
        agg.record_match(&matched("CC", &["1.002", "2.002"], Orientation::Forward), b"x", &cycles(), &patterns, false);
        agg.record_match(&matched("CC", &["1.003", "2.002"], Orientation::Forward), b"x", &cycles(), &patterns, false);
        agg.record_match(&matched("CC", &["1.004", "2.003"], Orientation::Forward), b"x", &cycles(), &patterns, false);
        agg.finalize_dedup(1);

        let analysis = agg.analyze_over_representation();
        let key: CompoundKey = (
            ClosingPrimerId("CC".into()),
            vec![(1, TagCode("1.001".into())), (2, TagCode("2.001".into()))],
        );
        let stats = agg.compounds.get(&key).unwrap();
        let signals = analysis.signals_for(&key, stats);
        assert!(signals.over_raw_planes > 0.0);
        assert!(signals.over_raw_lines > 0.0);
    }
}
