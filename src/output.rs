// src/output.rs
// Output file writers: `tags_<prefix>.allTags/.filtered/.over/.log` plus the
// optional companion files gated by CLI flags. Streams rows straight to disk
// with `BufWriter`, matching helix's `main.rs` `output_file.write_all(...)`
// style rather than reaching for a serialization crate.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};

use crate::aggregator::{Aggregator, CompoundOverSignals, OverRepResult, OverType, StructureDesc};
use crate::classifier::ClassifierCounters;
use crate::inventory::{ClosingPrimerId, Cycle, TagCode, TagInventory};
use crate::umi::{DegenPattern, ErrorCalibrator};
use std::collections::HashMap;

pub const SORT_LIMIT: usize = 100_000;

pub struct CompoundRow {
    pub cp_id: ClosingPrimerId,
    pub codes: Vec<TagCode>,
    pub raw: u64,
    pub dedup: u64,
    pub strand_bias: f64,
    pub raw_norm: f64,
    pub dedup_norm: f64,
    pub expected: bool,
    pub over: Option<CompoundOverSignals>,
}

/// Builds one row per compound. `over` is `None` when over-representation
/// analysis was disabled (`-O`).
pub fn build_rows(aggregator: &Aggregator, inventory: &TagInventory, over: Option<&OverRepResult>) -> Vec<CompoundRow> {
    let mut rows = Vec::with_capacity(aggregator.compounds.len());
    for (key, stats) in &aggregator.compounds {
        let (cp_id, codes) = key;
        let library_size = inventory.library_size(cp_id);
        let matched_cp_reads = aggregator.matched_cp_reads(cp_id).max(1);
        let raw_norm = stats.raw_count as f64 * library_size as f64 / matched_cp_reads as f64;
        let dedup_norm = stats.dedup_count as f64 * library_size as f64 / matched_cp_reads as f64;
        let expected = stats.expected(cp_id, codes, inventory);
        let over_signals = over.map(|o| o.signals_for(key, stats));

        rows.push(CompoundRow {
            cp_id: cp_id.clone(),
            codes: codes.iter().map(|(_, code)| code.clone()).collect(),
            raw: stats.raw_count,
            dedup: stats.dedup_count,
            strand_bias: stats.strand_bias(),
            raw_norm,
            dedup_norm,
            expected,
            over: over_signals,
        });
    }
    rows
}

/// Sorts by `RAW` descending, unless the row count exceeds `SORT_LIMIT` (in
/// which case sorting is silently suppressed per spec.md §6/§7).
pub fn sort_rows(rows: &mut [CompoundRow]) {
    if rows.len() > SORT_LIMIT {
        return;
    }
    rows.sort_by(|a, b| b.raw.cmp(&a.raw));
}

fn row_line(row: &CompoundRow) -> String {
    let tags: Vec<String> = row.codes.iter().map(|c| c.0.clone()).collect();
    let mut fields = tags;
    fields.push(row.cp_id.0.clone());
    fields.push(row.raw.to_string());
    fields.push(row.dedup.to_string());
    fields.push(format!("{:.3}", row.strand_bias));
    fields.push(format!("{:.3}", row.raw_norm));
    fields.push(format!("{:.3}", row.dedup_norm));
    fields.push(if row.expected { "1".to_string() } else { "0".to_string() });

    if let Some(over) = &row.over {
        fields.push(over.sdcount_raw.to_string());
        fields.push(over.sdcount_dedup.to_string());
        fields.push(format!("{:.3}", over.over_raw_lines));
        fields.push(format!("{:.3}", over.over_dedup_lines));
        fields.push(format!("{:.3}", over.over_unique_lines));
        fields.push(format!("{:.3}", over.over_raw_planes));
        fields.push(format!("{:.3}", over.over_dedup_planes));
        fields.push(format!("{:.3}", over.over_unique_planes));
    }

    fields.join("\t")
}

pub fn write_all_tags(path: &Path, rows: &[CompoundRow]) -> Result<()> {
    let file = File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    let mut w = BufWriter::new(file);
    for row in rows {
        writeln!(w, "{}", row_line(row)).with_context(|| format!("failed to write {}", path.display()))?;
    }
    Ok(())
}

/// Restricted to `expected == true` rows; callers write this file only when
/// `missingTags > foundTags` (spec.md §6).
pub fn write_filtered(path: &Path, rows: &[CompoundRow]) -> Result<()> {
    let file = File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    let mut w = BufWriter::new(file);
    for row in rows.iter().filter(|r| r.expected) {
        writeln!(w, "{}", row_line(row)).with_context(|| format!("failed to write {}", path.display()))?;
    }
    Ok(())
}

fn over_type_label(t: OverType) -> &'static str {
    match t {
        OverType::Raw => "raw",
        OverType::Dedup => "dedup",
        OverType::Unique => "unique",
    }
}

fn plane_label(key: &(Cycle, TagCode)) -> String {
    format!("{}:{}", key.0, key.1 .0)
}

pub fn write_over(path: &Path, over: &OverRepResult) -> Result<()> {
    let file = File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    let mut w = BufWriter::new(file);
    let mut entries = over.over_represented();
    entries.sort_by(|a, b| b.sigma_bin.cmp(&a.sigma_bin));

    for entry in &entries {
        let structure_label = match &entry.structure {
            StructureDesc::Plane(k) => format!("plane\t{}", plane_label(k)),
            StructureDesc::Line(k) => format!("line\t{}\t{}", plane_label(&(k.0, k.1.clone())), plane_label(&(k.2, k.3.clone()))),
        };
        writeln!(
            w,
            "{}\t{}\t{}\t{:.3}\t{}",
            entry.cp_id.0,
            structure_label,
            over_type_label(entry.over_type),
            entry.value,
            entry.sigma_bin
        )
        .with_context(|| format!("failed to write {}", path.display()))?;
    }
    Ok(())
}

pub fn write_log(path: &Path, counters: &ClassifierCounters) -> Result<()> {
    let file = File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    let mut w = BufWriter::new(file);
    writeln!(w, "total\t{}", counters.total)?;
    writeln!(w, "shorter\t{}", counters.shorter)?;
    writeln!(w, "reduced\t{}", counters.reduced)?;
    writeln!(w, "longer\t{}", counters.longer)?;
    writeln!(w, "lowQual\t{}", counters.low_qual)?;
    writeln!(w, "invalid\t{}", counters.invalid)?;
    writeln!(w, "openedOnly\t{}", counters.opened_only)?;
    writeln!(w, "opened\t{}", counters.opened)?;
    writeln!(w, "unfound\t{}", counters.unfound)?;
    writeln!(w, "chimera\t{}", counters.chimera)?;
    writeln!(w, "matched\t{}", counters.matched)?;
    writeln!(w, "forward\t{}", counters.forward)?;
    writeln!(w, "reverse\t{}", counters.reverse)?;
    writeln!(w, "valid\t{}", counters.valid())?;
    writeln!(w, "similar\t{}", counters.similar)?;
    writeln!(w, "matchedRecovered\t{}", counters.matched_recovered)?;
    Ok(())
}

/// `-I` companion: count of structurally-invalid reads (malformed FASTQ records).
pub fn write_invalid(path: &Path, counters: &ClassifierCounters) -> Result<()> {
    let file = File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    let mut w = BufWriter::new(file);
    writeln!(w, "invalid\t{}", counters.invalid)?;
    Ok(())
}

/// `-X` companion: count of reads classified as chimeras.
pub fn write_chimeras(path: &Path, counters: &ClassifierCounters) -> Result<()> {
    let file = File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    let mut w = BufWriter::new(file);
    writeln!(w, "chimera\t{}", counters.chimera)?;
    Ok(())
}

/// `-L` companion: coarse tag-string length-distribution buckets relative to
/// the expected total (`shorter`, `reduced`, `longer`).
pub fn write_lengths(path: &Path, counters: &ClassifierCounters) -> Result<()> {
    let file = File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    let mut w = BufWriter::new(file);
    writeln!(w, "shorter\t{}", counters.shorter)?;
    writeln!(w, "reduced\t{}", counters.reduced)?;
    writeln!(w, "longer\t{}", counters.longer)?;
    Ok(())
}

/// `-E` companion: the calibrated per-error-count UMI background rates.
pub fn write_errors(path: &Path, calibrator: &ErrorCalibrator, max_degen_errors: usize) -> Result<()> {
    let file = File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    let mut w = BufWriter::new(file);
    let rates = calibrator.base_error_rates(max_degen_errors.max(1));
    let mut es: Vec<&usize> = rates.keys().collect();
    es.sort();
    for e in es {
        writeln!(w, "{e}\t{:.6}", rates[e])?;
    }
    Ok(())
}

/// `-R` companion: recovery-mode pass counters.
pub fn write_recovery(path: &Path, counters: &ClassifierCounters) -> Result<()> {
    let file = File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    let mut w = BufWriter::new(file);
    writeln!(w, "opened\t{}", counters.opened)?;
    writeln!(w, "openedOnly\t{}", counters.opened_only)?;
    writeln!(w, "matchedRecovered\t{}", counters.matched_recovered)?;
    Ok(())
}

/// `-e` companion: a dump of the loaded tag inventory (per-cycle tag/length counts).
pub fn write_existingtags(path: &Path, inventory: &TagInventory) -> Result<()> {
    let file = File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    let mut w = BufWriter::new(file);
    writeln!(w, "{}", inventory.summary())?;
    Ok(())
}

/// `-c` companion: total matched reads per closing primer.
pub fn write_tagcounts(path: &Path, aggregator: &Aggregator, inventory: &TagInventory) -> Result<()> {
    let file = File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    let mut w = BufWriter::new(file);
    for cp_id in inventory.valid_tag_codes.keys() {
        writeln!(w, "{}\t{}", cp_id.0, aggregator.matched_cp_reads(cp_id))?;
    }
    Ok(())
}

/// `-w` companion: the compiled per-closing-primer degenerate (UMI) pattern.
pub fn write_degen(path: &Path, patterns: &HashMap<ClosingPrimerId, DegenPattern>) -> Result<()> {
    let file = File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    let mut w = BufWriter::new(file);
    for (cp_id, pattern) in patterns {
        writeln!(
            w,
            "{}\t{}\t{}",
            cp_id.0,
            String::from_utf8_lossy(&pattern.static_prefix),
            pattern.n_len
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::{MatchedRead, Orientation, SimilarKind};
    use crate::inventory::{load_inventory, parse_closing_primer_spec, TagFileSelector};
    use crate::matcher::{CpMatch, CycleSpec};

    fn fixture() -> (Aggregator, TagInventory) {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        use std::io::Write as _;
        write!(f, "1.001\tAAA\n2.001\tCCC\n1.002\tTTT\n2.002\tGGG\n").unwrap();
        let sel = TagFileSelector { path: f.path().to_string_lossy().to_string(), libraries: None };
        let cp = parse_closing_primer_spec("CCAGCA");
        let inventory = load_inventory(&[sel], &[cp.clone()], false, &[], &[]).unwrap();

        let cycles = vec![
            CycleSpec { cycle: 1, len: 3, overhang: vec![] },
            CycleSpec { cycle: 2, len: 3, overhang: vec![] },
        ];
        let mut agg = Aggregator::new();
        let patterns = std::collections::HashMap::new();
        let m = MatchedRead {
            cp_match: CpMatch { cp_id: cp.id.clone(), codes: vec![TagCode("1.001".into()), TagCode("2.001".into())] },
            orientation: Orientation::Forward,
            similar: None::<SimilarKind>,
            indel_positions: Vec::new(),
            substitutions: Vec::new(),
            tag_start: 0,
            consumed_len: 6,
            recovered: false,
        };
        agg.record_match(&m, b"x", &cycles, &patterns, false);
        agg.finalize_dedup(1);
        (agg, inventory)
    }

    #[test]
    fn test_build_rows_computes_expected_and_norms() {
        let (agg, inventory) = fixture();
        let rows = build_rows(&agg, &inventory, None);
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert!(row.expected);
        assert_eq!(row.raw, 1);
        assert_eq!(row.dedup, 1);
    }

    #[test]
    fn test_sort_rows_by_raw_descending() {
        let (agg, inventory) = fixture();
        let mut rows = build_rows(&agg, &inventory, None);
        rows.push(CompoundRow {
            cp_id: ClosingPrimerId("CC".into()),
            codes: vec![TagCode("1.002".into()), TagCode("2.002".into())],
            raw: 50,
            dedup: 50,
            strand_bias: 0.0,
            raw_norm: 0.0,
            dedup_norm: 0.0,
            expected: true,
            over: None,
        });
        sort_rows(&mut rows);
        assert_eq!(rows[0].raw, 50);
    }

    #[test]
    fn test_write_all_tags_round_trip_row_count() {
        let (agg, inventory) = fixture();
        let rows = build_rows(&agg, &inventory, None);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tags_test.allTags");
        write_all_tags(&path, &rows).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 1);
        assert!(contents.contains("1.001"));
    }

    #[test]
    fn test_write_filtered_excludes_unexpected() {
        let (agg, inventory) = fixture();
        let mut rows = build_rows(&agg, &inventory, None);
        rows.push(CompoundRow {
            cp_id: ClosingPrimerId("CC".into()),
            codes: vec![TagCode("1.999".into()), TagCode("2.999".into())],
            raw: 1,
            dedup: 1,
            strand_bias: 0.0,
            raw_norm: 0.0,
            dedup_norm: 0.0,
            expected: false,
            over: None,
        });
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tags_test.filtered");
        write_filtered(&path, &rows).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 1);
        assert!(!contents.contains("1.999"));
    }

    #[test]
    fn test_write_tagcounts_lists_every_cp() {
        let (agg, inventory) = fixture();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tags_test.tagcounts");
        write_tagcounts(&path, &agg, &inventory).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("CCAGCA\t1"));
    }

    #[test]
    fn test_write_degen_dumps_pattern() {
        let mut patterns = HashMap::new();
        patterns.insert(
            ClosingPrimerId("CC".into()),
            DegenPattern { static_prefix: b"AGCA".to_vec(), n_len: 4 },
        );
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tags_test.degen");
        write_degen(&path, &patterns).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("CC\tAGCA\t4"));
    }

    #[test]
    fn test_write_log_contains_all_counters() {
        let mut counters = ClassifierCounters::default();
        counters.total = 10;
        counters.matched = 7;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tags_test.log");
        write_log(&path, &counters).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("total\t10"));
        assert!(contents.contains("matched\t7"));
    }
}
