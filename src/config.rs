// src/config.rs
// Optional INI-like config: a tab-separated record file keyed by a glob
// against the input FASTQ filename, pre-populating unset CLI values.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{Context, Result};
use glob::Pattern;

/// One record: `fastqGlob, reverseCycles, tagFile, headPieces, overhangs,
/// closingPrimers, validTags, invalidTags`, tab-separated. Any field left
/// empty means "don't override".
#[derive(Debug, Clone, Default)]
pub struct ConfigRecord {
    pub fastq_glob: String,
    pub reverse_cycles: Option<bool>,
    pub tag_file: Option<String>,
    pub head_pieces: Option<String>,
    pub overhangs: Option<String>,
    pub closing_primers: Option<String>,
    pub valid_tags: Option<String>,
    pub invalid_tags: Option<String>,
}

fn parse_bool_field(s: &str) -> Option<bool> {
    match s.trim() {
        "" => None,
        "0" => Some(false),
        _ => Some(true),
    }
}

fn parse_opt_field(s: &str) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

fn parse_record(line: &str) -> Option<ConfigRecord> {
    let fields: Vec<&str> = line.split('\t').collect();
    if fields.is_empty() || fields[0].trim().is_empty() {
        return None;
    }
    Some(ConfigRecord {
        fastq_glob: fields[0].trim().to_string(),
        reverse_cycles: fields.get(1).and_then(|f| parse_bool_field(f)),
        tag_file: fields.get(2).and_then(|f| parse_opt_field(f)),
        head_pieces: fields.get(3).and_then(|f| parse_opt_field(f)),
        overhangs: fields.get(4).and_then(|f| parse_opt_field(f)),
        closing_primers: fields.get(5).and_then(|f| parse_opt_field(f)),
        valid_tags: fields.get(6).and_then(|f| parse_opt_field(f)),
        invalid_tags: fields.get(7).and_then(|f| parse_opt_field(f)),
    })
}

/// Reads every non-comment, non-blank line of `path` as a `ConfigRecord`.
pub fn load_config(path: &Path) -> Result<Vec<ConfigRecord>> {
    let file = File::open(path).with_context(|| format!("failed to open config {}", path.display()))?;
    let reader = BufReader::new(file);
    let mut records = Vec::new();

    for (lineno, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("I/O error reading config {}", path.display()))?;
        let trimmed = line.trim_start();
        if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with(';') {
            continue;
        }
        let record = parse_record(&line)
            .with_context(|| format!("malformed config line {} in {}: {line:?}", lineno + 1, path.display()))?;
        records.push(record);
    }

    Ok(records)
}

/// Returns the first record whose `fastqGlob` matches `fastq_filename`.
pub fn find_matching_record<'a>(records: &'a [ConfigRecord], fastq_filename: &str) -> Option<&'a ConfigRecord> {
    records.iter().find(|r| {
        Pattern::new(&r.fastq_glob)
            .map(|p| p.matches(fastq_filename))
            .unwrap_or(false)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_record_basic() {
        let rec = parse_record("*.fastq\t1\ttags.txt\tCAGGTCAG\t\tCCAGCA\t\t").unwrap();
        assert_eq!(rec.fastq_glob, "*.fastq");
        assert_eq!(rec.reverse_cycles, Some(true));
        assert_eq!(rec.tag_file.as_deref(), Some("tags.txt"));
        assert_eq!(rec.head_pieces.as_deref(), Some("CAGGTCAG"));
        assert_eq!(rec.overhangs, None);
        assert_eq!(rec.closing_primers.as_deref(), Some("CCAGCA"));
    }

    #[test]
    fn test_load_config_skips_comments_and_blanks() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "# a comment").unwrap();
        writeln!(f).unwrap();
        writeln!(f, "; also a comment").unwrap();
        writeln!(f, "sample_*.fastq\t0\ttags.txt").unwrap();
        let records = load_config(f.path()).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].fastq_glob, "sample_*.fastq");
        assert_eq!(records[0].reverse_cycles, Some(false));
    }

    #[test]
    fn test_find_matching_record_picks_first_match() {
        let records = vec![
            ConfigRecord { fastq_glob: "batchA_*.fastq".into(), ..Default::default() },
            ConfigRecord { fastq_glob: "*.fastq".into(), tag_file: Some("fallback.txt".into()), ..Default::default() },
        ];
        let found = find_matching_record(&records, "batchB_001.fastq").unwrap();
        assert_eq!(found.tag_file.as_deref(), Some("fallback.txt"));
    }

    #[test]
    fn test_find_matching_record_none() {
        let records = vec![ConfigRecord { fastq_glob: "batchA_*.fastq".into(), ..Default::default() }];
        assert!(find_matching_record(&records, "other.fastq").is_none());
    }
}
