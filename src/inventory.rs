// src/inventory.rs
// Tag Inventory: per-cycle tag tables, library memberships, and per-closing-primer
// validity sets. Built once at startup; read-only thereafter.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

use anyhow::{bail, Context, Result};
use flate2::read::MultiGzDecoder;
use regex::Regex;

pub type Cycle = u32;

/// A parsed `<libraryPrefix><cycleNumber>.<index>` identifier, e.g. `"A1.001"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TagCode(pub String);

impl std::fmt::Display for TagCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Extracts the cycle number from a TagCode string via `^(?:\S*?)(\d+)[.\-]\d+`.
pub fn parse_cycle(code: &str) -> Result<Cycle> {
    thread_local! {
        static RE: Regex = Regex::new(r"^(?:\S*?)(\d+)[.\-]\d+").unwrap();
    }
    RE.with(|re| {
        let caps = re
            .captures(code)
            .with_context(|| format!("malformed tag code: {code:?}"))?;
        let digits = &caps[1];
        digits
            .parse::<Cycle>()
            .with_context(|| format!("malformed cycle number in tag code: {code:?}"))
    })
}

/// Identifies a closing primer: an explicit label (if any) plus its non-degenerate
/// prefix (or empty string when it carries no degenerate run).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClosingPrimerId(pub String);

impl ClosingPrimerId {
    pub fn new(label: Option<&str>, static_prefix: &[u8]) -> Self {
        let prefix_str = String::from_utf8_lossy(static_prefix);
        let s = match label {
            Some(l) => format!("{l}{prefix_str}"),
            None => prefix_str.to_string(),
        };
        ClosingPrimerId(s)
    }
}

impl std::fmt::Display for ClosingPrimerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// All tags accepted for one cycle; every tag shares `tag_len`.
#[derive(Debug, Default)]
pub struct CycleInventory {
    pub tag_len: usize,
    pub seq_to_code: HashMap<Vec<u8>, TagCode>,
    pub codes: Vec<TagCode>,
}

impl CycleInventory {
    pub fn lookup(&self, seq: &[u8]) -> Option<&TagCode> {
        self.seq_to_code.get(seq)
    }
}

#[derive(Debug, Default)]
pub struct TagInventory {
    pub cycles: BTreeMap<Cycle, CycleInventory>,
    pub valid_tag_codes: HashMap<ClosingPrimerId, HashSet<TagCode>>,
    pub library_tag_counts: HashMap<ClosingPrimerId, HashMap<Cycle, usize>>,
}

impl TagInventory {
    pub fn cycle_len(&self, cycle: Cycle) -> Option<usize> {
        self.cycles.get(&cycle).map(|c| c.tag_len)
    }

    pub fn is_valid(&self, cp: &ClosingPrimerId, code: &TagCode) -> bool {
        self.valid_tag_codes
            .get(cp)
            .map(|set| set.contains(code))
            .unwrap_or(false)
    }

    /// Product over cycles of the number of valid tags at that cycle for `cp`.
    pub fn library_size(&self, cp: &ClosingPrimerId) -> u64 {
        match self.library_tag_counts.get(cp) {
            Some(per_cycle) => per_cycle.values().map(|&n| n as u64).product(),
            None => 0,
        }
    }

    pub fn summary(&self) -> String {
        let mut lines = Vec::new();
        for (cycle, inv) in &self.cycles {
            lines.push(format!(
                "cycle {cycle}: {} tags, length {}",
                inv.codes.len(),
                inv.tag_len
            ));
        }
        lines.join("\n")
    }
}

/// One closing primer as declared on the CLI, before anchor compilation.
/// Carried here (rather than in `primer`) because the inventory loader needs
/// to match tag-table `CPL` rows against configured closing primers before
/// the primer compiler ever runs.
#[derive(Debug, Clone)]
pub struct ClosingPrimerSpec {
    pub id: ClosingPrimerId,
    pub seq: Vec<u8>,
    pub static_prefix: Vec<u8>,
    pub n_len: usize,
    pub static_tail: Vec<u8>,
}

/// Parses `<label>-<seq>` (label optional) and locates a run of `N` bases,
/// splitting the sequence into `static_prefix N{n_len} static_tail`.
pub fn parse_closing_primer_spec(raw: &str) -> ClosingPrimerSpec {
    let (label, seq_str) = match raw.split_once('-') {
        Some((l, s)) if !l.is_empty() && l.chars().all(|c| c.is_ascii_alphanumeric()) => {
            (Some(l), s)
        }
        _ => (None, raw),
    };
    let seq = seq_str.as_bytes().to_ascii_uppercase();

    let n_start = seq.iter().position(|&b| b == b'N');
    let (static_prefix, n_len, static_tail) = match n_start {
        Some(start) => {
            let n_end = seq[start..]
                .iter()
                .position(|&b| b != b'N')
                .map(|rel| start + rel)
                .unwrap_or(seq.len());
            (
                seq[..start].to_vec(),
                n_end - start,
                seq[n_end..].to_vec(),
            )
        }
        None => (seq.clone(), 0, Vec::new()),
    };

    let id = ClosingPrimerId::new(label, &static_prefix);
    ClosingPrimerSpec {
        id,
        seq,
        static_prefix,
        n_len,
        static_tail,
    }
}

/// Scopes a `-t` tag-file argument's optional `:libA:libB` library restriction.
#[derive(Debug, Clone, Default)]
pub struct TagFileSelector {
    pub path: String,
    pub libraries: Option<HashSet<String>>,
}

pub fn parse_tag_file_arg(arg: &str) -> TagFileSelector {
    let mut parts = arg.split(':');
    let path = parts.next().unwrap_or_default().to_string();
    let libs: Vec<String> = parts.map(|s| s.to_string()).collect();
    TagFileSelector {
        path,
        libraries: if libs.is_empty() {
            None
        } else {
            Some(libs.into_iter().collect())
        },
    }
}

/// A semicolon-separated valid/invalid pattern: `<cp1>;<cp2>;...;<regex>`.
/// Leading fields scope the rule to those closing primers by id; an absent
/// leading field list scopes to all configured closing primers.
#[derive(Debug, Clone)]
pub struct TagPattern {
    pub scopes: Vec<String>,
    pub regex: Regex,
}

pub fn parse_tag_pattern(arg: &str) -> Result<TagPattern> {
    let fields: Vec<&str> = arg.split(';').collect();
    if fields.is_empty() {
        bail!("empty valid/invalid pattern");
    }
    let (scopes, pattern) = fields.split_at(fields.len() - 1);
    let regex = Regex::new(pattern[0]).with_context(|| format!("bad pattern regex: {arg:?}"))?;
    Ok(TagPattern {
        scopes: scopes.iter().map(|s| s.to_string()).collect(),
        regex,
    })
}

fn open_maybe_gzip(path: &Path) -> Result<Box<dyn Read>> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    if path.extension().and_then(|e| e.to_str()) == Some("gz") {
        Ok(Box::new(MultiGzDecoder::new(file)))
    } else {
        Ok(Box::new(file))
    }
}

struct ParsedFile {
    libs: Vec<String>,
    cpl_rows: Vec<(Vec<u8>, Vec<bool>)>,
    tag_rows: Vec<(TagCode, Cycle, Vec<u8>, Vec<bool>)>,
    has_header: bool,
}

fn parse_file(sel: &TagFileSelector, reverse_cycles: bool) -> Result<ParsedFile> {
    let path = Path::new(&sel.path);
    let reader = BufReader::new(open_maybe_gzip(path)?);

    let mut libs: Vec<String> = Vec::new();
    let mut honored: Vec<bool> = Vec::new();
    let mut has_header = false;
    let mut cpl_rows = Vec::new();
    let mut tag_rows = Vec::new();

    for (lineno, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("I/O error reading {}", path.display()))?;
        let line = line.trim_end();
        if line.is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split('\t').collect();

        if let Some(rest) = fields[0].strip_prefix("#ID") {
            let _ = rest;
            libs = fields[2..].iter().map(|s| s.to_string()).collect();
            honored = libs
                .iter()
                .map(|l| sel.libraries.as_ref().map(|set| set.contains(l)).unwrap_or(true))
                .collect();
            has_header = true;
            continue;
        }

        if fields.len() < 2 {
            bail!(
                "malformed tag-table line {} in {}: {:?}",
                lineno + 1,
                path.display(),
                line
            );
        }

        if fields[0] == "CPL" {
            let seq = fields[1].as_bytes().to_ascii_uppercase();
            let membership = parse_membership(&fields[2..], &honored);
            cpl_rows.push((seq, membership));
            continue;
        }

        let code_str = fields[0].to_string();
        let cycle = parse_cycle(&code_str).with_context(|| {
            format!(
                "malformed tag-table line {} in {}: {:?}",
                lineno + 1,
                path.display(),
                line
            )
        })?;
        let mut seq = fields[1].as_bytes().to_ascii_uppercase();
        if reverse_cycles && cycle % 2 == 0 {
            seq = crate::dna::revcomp(&seq);
        }
        let membership = parse_membership(&fields[2..], &honored);
        tag_rows.push((TagCode(code_str), cycle, seq, membership));
    }

    Ok(ParsedFile {
        libs,
        cpl_rows,
        tag_rows,
        has_header,
    })
}

fn parse_membership(fields: &[&str], honored: &[bool]) -> Vec<bool> {
    fields
        .iter()
        .enumerate()
        .map(|(i, f)| {
            let honored_col = honored.get(i).copied().unwrap_or(true);
            honored_col && f.trim() != "0" && !f.trim().is_empty()
        })
        .collect()
}

/// Loads the inventory from one or more tag-table files, resolving library
/// membership against the given configured closing primers, and applying
/// the supplementary CLI valid/invalid pattern rules.
pub fn load_inventory(
    files: &[TagFileSelector],
    closing_primers: &[ClosingPrimerSpec],
    reverse_cycles: bool,
    valid_patterns: &[TagPattern],
    invalid_patterns: &[TagPattern],
) -> Result<TagInventory> {
    let mut cycles: BTreeMap<Cycle, CycleInventory> = BTreeMap::new();
    let mut valid_tag_codes: HashMap<ClosingPrimerId, HashSet<TagCode>> = HashMap::new();
    let mut library_tag_counts: HashMap<ClosingPrimerId, HashMap<Cycle, usize>> = HashMap::new();

    for cp in closing_primers {
        valid_tag_codes.entry(cp.id.clone()).or_default();
        library_tag_counts.entry(cp.id.clone()).or_default();
    }

    for sel in files {
        let parsed = parse_file(sel, reverse_cycles)?;

        // Resolve which closing primers each CPL row's sequence corresponds to,
        // and which library columns are "used" by it.
        let mut cp_used_libs: HashMap<usize, HashSet<usize>> = HashMap::new(); // cp index -> used lib columns
        for (row_idx, cp) in closing_primers.iter().enumerate() {
            for (cpl_seq, membership) in &parsed.cpl_rows {
                let matches = cpl_seq == &cp.static_prefix
                    || cpl_seq == &cp.seq
                    || cpl_seq.starts_with(cp.static_prefix.as_slice())
                    || cp.static_prefix.starts_with(cpl_seq.as_slice());
                if matches {
                    let used = cp_used_libs.entry(row_idx).or_default();
                    for (lib_idx, &on) in membership.iter().enumerate() {
                        if on {
                            used.insert(lib_idx);
                        }
                    }
                }
            }
        }

        for (code, cycle, seq, membership) in &parsed.tag_rows {
            let entry = cycles.entry(*cycle).or_default();
            if entry.tag_len == 0 {
                entry.tag_len = seq.len();
            } else if entry.tag_len != seq.len() {
                bail!(
                    "inconsistent tag length in cycle {}: expected {}, got {} ({})",
                    cycle,
                    entry.tag_len,
                    seq.len(),
                    code
                );
            }
            if !entry.seq_to_code.contains_key(seq) {
                entry.seq_to_code.insert(seq.clone(), code.clone());
                entry.codes.push(code.clone());
            }

            for (row_idx, cp) in closing_primers.iter().enumerate() {
                let accepted = if !parsed.has_header {
                    true
                } else {
                    match cp_used_libs.get(&row_idx) {
                        Some(used_libs) => membership
                            .iter()
                            .enumerate()
                            .any(|(i, &on)| on && used_libs.contains(&i)),
                        None => false,
                    }
                };
                if accepted {
                    valid_tag_codes
                        .entry(cp.id.clone())
                        .or_default()
                        .insert(code.clone());
                }
            }
        }
        let _ = parsed.libs;
    }

    // Supplementary CLI rules: valid (additive) then invalid (subtractive).
    for pat in valid_patterns {
        apply_pattern(&mut valid_tag_codes, &cycles, closing_primers, pat, true);
    }
    for pat in invalid_patterns {
        apply_pattern(&mut valid_tag_codes, &cycles, closing_primers, pat, false);
    }

    // Derive per-cycle library sizes from the final valid sets.
    for cp in closing_primers {
        let set = valid_tag_codes.get(&cp.id).cloned().unwrap_or_default();
        let mut per_cycle: HashMap<Cycle, usize> = HashMap::new();
        for (cycle, inv) in &cycles {
            let n = inv.codes.iter().filter(|c| set.contains(c)).count();
            per_cycle.insert(*cycle, n);
        }
        library_tag_counts.insert(cp.id.clone(), per_cycle);
    }

    Ok(TagInventory {
        cycles,
        valid_tag_codes,
        library_tag_counts,
    })
}

fn apply_pattern(
    valid_tag_codes: &mut HashMap<ClosingPrimerId, HashSet<TagCode>>,
    cycles: &BTreeMap<Cycle, CycleInventory>,
    closing_primers: &[ClosingPrimerSpec],
    pat: &TagPattern,
    additive: bool,
) {
    let targets: Vec<&ClosingPrimerSpec> = if pat.scopes.is_empty() {
        closing_primers.iter().collect()
    } else {
        closing_primers
            .iter()
            .filter(|cp| pat.scopes.iter().any(|s| s == &cp.id.0))
            .collect()
    };

    for cp in targets {
        let set = valid_tag_codes.entry(cp.id.clone()).or_default();
        for inv in cycles.values() {
            for code in &inv.codes {
                if pat.regex.is_match(&code.0) {
                    if additive {
                        set.insert(code.clone());
                    } else {
                        set.remove(code);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(contents: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(f, "{contents}").unwrap();
        f
    }

    #[test]
    fn test_parse_cycle() {
        assert_eq!(parse_cycle("A1.001").unwrap(), 1);
        assert_eq!(parse_cycle("2.014").unwrap(), 2);
        assert_eq!(parse_cycle("lib3-014").unwrap(), 3);
    }

    #[test]
    fn test_parse_closing_primer_spec_with_n_run() {
        let spec = parse_closing_primer_spec("lbl-CCNNNNCA");
        assert_eq!(spec.static_prefix, b"CC");
        assert_eq!(spec.n_len, 4);
        assert_eq!(spec.static_tail, b"CA");
        assert_eq!(spec.id.0, "lblCC");
    }

    #[test]
    fn test_parse_closing_primer_spec_no_n_run() {
        let spec = parse_closing_primer_spec("CCAGCA");
        assert_eq!(spec.static_prefix, b"CCAGCA");
        assert_eq!(spec.n_len, 0);
        assert!(spec.static_tail.is_empty());
        assert_eq!(spec.id.0, "CCAGCA");
    }

    #[test]
    fn test_load_inventory_basic() {
        let file = write_temp("1.001\tAAA\n2.001\tCCC\n");
        let sel = TagFileSelector {
            path: file.path().to_string_lossy().to_string(),
            libraries: None,
        };
        let cp = parse_closing_primer_spec("CCAGCA");
        let inv = load_inventory(&[sel], &[cp.clone()], false, &[], &[]).unwrap();
        assert_eq!(inv.cycle_len(1), Some(3));
        assert_eq!(inv.cycle_len(2), Some(3));
        assert!(inv.is_valid(&cp.id, &TagCode("1.001".into())));
        assert!(inv.is_valid(&cp.id, &TagCode("2.001".into())));
        assert_eq!(inv.library_size(&cp.id), 1);
    }

    #[test]
    fn test_inconsistent_tag_length_fails() {
        let file = write_temp("1.001\tAAA\n1.002\tAAAA\n");
        let sel = TagFileSelector {
            path: file.path().to_string_lossy().to_string(),
            libraries: None,
        };
        let cp = parse_closing_primer_spec("CCAGCA");
        let res = load_inventory(&[sel], &[cp], false, &[], &[]);
        assert!(res.is_err());
    }

    #[test]
    fn test_reverse_cycles_revcomps_even_cycles() {
        let file = write_temp("1.001\tAAA\n2.001\tCCC\n");
        let sel = TagFileSelector {
            path: file.path().to_string_lossy().to_string(),
            libraries: None,
        };
        let cp = parse_closing_primer_spec("CCAGCA");
        let inv = load_inventory(&[sel], &[cp], true, &[], &[]).unwrap();
        // cycle 2 is even: CCC revcomp is GGG
        let c2 = inv.cycles.get(&2).unwrap();
        assert!(c2.seq_to_code.contains_key(b"GGG".as_slice()));
        // cycle 1 is odd: untouched
        let c1 = inv.cycles.get(&1).unwrap();
        assert!(c1.seq_to_code.contains_key(b"AAA".as_slice()));
    }

    #[test]
    fn test_header_restricts_membership() {
        let file = write_temp(
            "#ID\tSEQUENCE\tlibA\tlibB\nCPL\tCC\t1\t0\n1.001\tAAA\t1\t0\n1.002\tTTT\t0\t1\n",
        );
        let sel = TagFileSelector {
            path: file.path().to_string_lossy().to_string(),
            libraries: None,
        };
        let cp = parse_closing_primer_spec("CC");
        let inv = load_inventory(&[sel], &[cp.clone()], false, &[], &[]).unwrap();
        // libA uses this closing primer; libB does not.
        assert!(inv.is_valid(&cp.id, &TagCode("1.001".into())));
        assert!(!inv.is_valid(&cp.id, &TagCode("1.002".into())));
    }

    #[test]
    fn test_valid_invalid_patterns() {
        let file = write_temp("1.001\tAAA\n1.002\tCCC\n");
        let sel = TagFileSelector {
            path: file.path().to_string_lossy().to_string(),
            libraries: None,
        };
        let cp = parse_closing_primer_spec("CC");
        let valid = vec![parse_tag_pattern("1\\.002").unwrap()];
        let invalid = vec![parse_tag_pattern("1\\.001").unwrap()];
        let inv = load_inventory(&[sel], &[cp.clone()], false, &valid, &invalid).unwrap();
        assert!(inv.is_valid(&cp.id, &TagCode("1.002".into())));
        assert!(!inv.is_valid(&cp.id, &TagCode("1.001".into())));
    }
}
