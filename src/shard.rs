// src/shard.rs
// Shard Reducer: fans a stream of FASTQ batches out across independent
// PipelineState-equivalents (one `ShardState` per batch) and merges them
// back, plus the on-disk shard artifact reader/writer for out-of-process
// workers that produced a `shard_<i>.allTags` file independently.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

use anyhow::{bail, Context, Result};
use rayon::prelude::*;

use crate::aggregator::Aggregator;
use crate::classifier::{classify_read, validate_read, ClassifierCounters, ClassifyOptions};
use crate::fastq::FastqRecord;
use crate::inventory::{parse_cycle, ClosingPrimerId, TagCode, TagInventory};
use crate::matcher::CycleSpec;
use crate::primer::PrimerSet;
use crate::umi::DegenPattern;

/// One shard's worth of accumulated state: classifier tallies plus the
/// per-compound counts the Aggregator has seen so far. Each parallel batch
/// owns one of these; nothing is shared across batches beyond the
/// (read-only) inventory/primer/options inputs.
#[derive(Debug, Default)]
pub struct ShardState {
    pub counters: ClassifierCounters,
    pub aggregator: Aggregator,
}

impl ShardState {
    /// Commutative, associative merge: the order shards are folded in
    /// doesn't affect the result.
    pub fn merge(&mut self, other: ShardState) {
        merge_counters(&mut self.counters, &other.counters);
        for (key, stats) in other.aggregator.compounds {
            let entry = self.aggregator.compounds.entry(key).or_default();
            entry.raw_count += stats.raw_count;
            entry.strand_net += stats.strand_net;
            entry.undedup = entry.undedup || stats.undedup;
            for (umi, count) in stats.umi_multiset {
                *entry.umi_multiset.entry(umi).or_insert(0) += count;
            }
        }
        self.aggregator.calibrator.merge(other.aggregator.calibrator);
    }
}

pub fn merge_counters(a: &mut ClassifierCounters, b: &ClassifierCounters) {
    a.total += b.total;
    a.shorter += b.shorter;
    a.reduced += b.reduced;
    a.longer += b.longer;
    a.low_qual += b.low_qual;
    a.invalid += b.invalid;
    a.opened_only += b.opened_only;
    a.opened += b.opened;
    a.unfound += b.unfound;
    a.chimera += b.chimera;
    a.matched += b.matched;
    a.forward += b.forward;
    a.reverse += b.reverse;
    a.similar += b.similar;
    a.matched_recovered += b.matched_recovered;
}

/// Runs one batch of reads through the classifier/matcher/aggregator chain
/// single-threaded, producing an independent `ShardState`.
pub fn process_batch(
    records: &[FastqRecord],
    primers: &PrimerSet,
    cycles: &[CycleSpec],
    inventory: &TagInventory,
    classify_opts: &ClassifyOptions,
    umi_patterns: &HashMap<ClosingPrimerId, DegenPattern>,
    umi_enabled: bool,
) -> ShardState {
    let mut state = ShardState::default();

    for rec in records {
        if !validate_read(&rec.seq, Some(&rec.qual)) {
            state.counters.total += 1;
            state.counters.invalid += 1;
            continue;
        }

        let result = classify_read(&rec.seq, Some(&rec.qual), primers, cycles, inventory, classify_opts, &mut state.counters);
        for m in &result.matches {
            state.aggregator.record_match(m, &rec.seq, cycles, umi_patterns, umi_enabled);
        }
    }

    state
}

/// Fans `batches` out across rayon's thread pool, one `ShardState` per
/// batch, and folds them back into a single merged state.
pub fn run_parallel(
    batches: Vec<Vec<FastqRecord>>,
    primers: &PrimerSet,
    cycles: &[CycleSpec],
    inventory: &TagInventory,
    classify_opts: &ClassifyOptions,
    umi_patterns: &HashMap<ClosingPrimerId, DegenPattern>,
    umi_enabled: bool,
) -> ShardState {
    batches
        .into_par_iter()
        .map(|batch| process_batch(&batch, primers, cycles, inventory, classify_opts, umi_patterns, umi_enabled))
        .reduce(ShardState::default, |mut a, b| {
            a.merge(b);
            a
        })
}

fn format_umi_multiset(umis: &HashMap<Vec<u8>, u64>) -> String {
    let mut parts: Vec<String> = umis
        .iter()
        .map(|(u, c)| format!("{}:{c}", String::from_utf8_lossy(u)))
        .collect();
    parts.sort();
    parts.join(";")
}

fn parse_umi_multiset(s: &str) -> HashMap<Vec<u8>, u64> {
    let mut m = HashMap::new();
    if s.is_empty() {
        return m;
    }
    for part in s.split(';') {
        if let Some((umi, count)) = part.split_once(':') {
            if let Ok(c) = count.parse::<u64>() {
                m.insert(umi.as_bytes().to_vec(), c);
            }
        }
    }
    m
}

/// Writes every compound's counts as one `match,cpId,count,strandNet,umis`
/// line. `match` is the compound's tag codes joined by `-`; the UMI field
/// extends the literal format with an explicit `umi:count` multiset (instead
/// of a bare semicolon list) so a reducer can recover exact multiplicities
/// rather than just set membership.
pub fn write_shard_file(path: &Path, aggregator: &Aggregator) -> Result<()> {
    let file = File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    let mut writer = std::io::BufWriter::new(file);
    for (key, stats) in &aggregator.compounds {
        let (cp_id, codes) = key;
        let match_str = codes.iter().map(|(_, code)| code.0.as_str()).collect::<Vec<_>>().join("-");
        let umi_str = format_umi_multiset(&stats.umi_multiset);
        writeln!(writer, "{match_str},{},{},{},{umi_str}", cp_id.0, stats.raw_count, stats.strand_net)
            .with_context(|| format!("failed to write {}", path.display()))?;
    }
    Ok(())
}

/// Streams `path` line by line and folds its counts into `aggregator`,
/// without loading the whole shard file into memory at once. Per-read
/// `undedup` granularity isn't representable in the artifact format, so a
/// compound merged from shard files is treated as dedup-eligible whenever
/// any shard contributed UMI observations for it — a known limitation
/// parallel to the cross-shard `MaxTagLength` averaging one.
pub fn merge_shard_file(path: &Path, aggregator: &mut Aggregator) -> Result<()> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let reader = BufReader::new(file);

    for (lineno, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("I/O error reading {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.splitn(5, ',').collect();
        if fields.len() != 5 {
            bail!("malformed shard line {} in {}: {:?}", lineno + 1, path.display(), line);
        }

        let codes: Result<Vec<(crate::inventory::Cycle, TagCode)>> = fields[0]
            .split('-')
            .map(|s| {
                let code = TagCode(s.to_string());
                let cycle = parse_cycle(s)?;
                Ok((cycle, code))
            })
            .collect();
        let codes = codes.with_context(|| format!("malformed shard line {} in {}", lineno + 1, path.display()))?;
        let cp_id = ClosingPrimerId(fields[1].to_string());
        let raw_count: u64 = fields[2]
            .parse()
            .with_context(|| format!("malformed shard line {} in {}", lineno + 1, path.display()))?;
        let strand_net: i64 = fields[3]
            .parse()
            .with_context(|| format!("malformed shard line {} in {}", lineno + 1, path.display()))?;
        let umis = parse_umi_multiset(fields[4]);

        let key = (cp_id, codes);
        let stats = aggregator.compounds.entry(key).or_default();
        stats.raw_count += raw_count;
        stats.strand_net += strand_net;
        for (umi, count) in umis {
            *stats.umi_multiset.entry(umi).or_insert(0) += count;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::TagCode;

    fn sample_aggregator() -> Aggregator {
        let mut agg = Aggregator::new();
        let patterns = HashMap::new();
        let cycles = vec![
            CycleSpec { cycle: 1, len: 3, overhang: vec![] },
            CycleSpec { cycle: 2, len: 3, overhang: vec![] },
        ];
        let m = crate::classifier::MatchedRead {
            cp_match: crate::matcher::CpMatch {
                cp_id: ClosingPrimerId("CC".into()),
                codes: vec![TagCode("1.001".into()), TagCode("2.001".into())],
            },
            orientation: crate::classifier::Orientation::Forward,
            similar: None,
            indel_positions: Vec::new(),
            substitutions: Vec::new(),
            tag_start: 0,
            consumed_len: 6,
            recovered: false,
        };
        agg.record_match(&m, b"x", &cycles, &patterns, false);
        agg
    }

    #[test]
    fn test_write_then_merge_round_trip() {
        let agg = sample_aggregator();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shard_0.allTags");
        write_shard_file(&path, &agg).unwrap();

        let mut merged = Aggregator::new();
        merge_shard_file(&path, &mut merged).unwrap();

        let key: crate::aggregator::CompoundKey = (
            ClosingPrimerId("CC".into()),
            vec![(1, TagCode("1.001".into())), (2, TagCode("2.001".into()))],
        );
        let stats = merged.compounds.get(&key).unwrap();
        assert_eq!(stats.raw_count, 1);
        assert_eq!(stats.strand_net, 1);
    }

    #[test]
    fn test_merge_two_shards_sums_counts() {
        let agg_a = sample_aggregator();
        let agg_b = sample_aggregator();
        let dir = tempfile::tempdir().unwrap();
        let path_a = dir.path().join("shard_0.allTags");
        let path_b = dir.path().join("shard_1.allTags");
        write_shard_file(&path_a, &agg_a).unwrap();
        write_shard_file(&path_b, &agg_b).unwrap();

        let mut merged = Aggregator::new();
        merge_shard_file(&path_a, &mut merged).unwrap();
        merge_shard_file(&path_b, &mut merged).unwrap();

        let key: crate::aggregator::CompoundKey = (
            ClosingPrimerId("CC".into()),
            vec![(1, TagCode("1.001".into())), (2, TagCode("2.001".into()))],
        );
        assert_eq!(merged.compounds.get(&key).unwrap().raw_count, 2);
    }

    #[test]
    fn test_merge_counters_sums_fields() {
        let mut a = ClassifierCounters { total: 5, matched: 2, ..Default::default() };
        let b = ClassifierCounters { total: 3, matched: 1, forward: 1, ..Default::default() };
        merge_counters(&mut a, &b);
        assert_eq!(a.total, 8);
        assert_eq!(a.matched, 3);
        assert_eq!(a.forward, 1);
    }
}
