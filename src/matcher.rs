// src/matcher.rs
// Tag Matcher: maps a tag-string to a tuple of tag codes, handling exact
// match, 1-indel at the tag-string level (handled by the classifier, which
// generates per-indel candidates), and 1-substitution per tag.

use crate::inventory::{ClosingPrimerId, Cycle, TagCode, TagInventory};

#[derive(Debug, Clone)]
pub struct CycleSpec {
    pub cycle: Cycle,
    pub len: usize,
    pub overhang: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpMatch {
    pub cp_id: ClosingPrimerId,
    pub codes: Vec<TagCode>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchOutcome {
    Matched {
        cp_match: CpMatch,
        /// "var,<abs_pos>" entries recorded during substitution matching.
        substitutions: Vec<String>,
    },
    Chimera,
    Unfound,
}

pub struct MatchOptions {
    pub similar_search: bool,
    pub chimera_search: bool,
    pub similar_strict: bool,
    /// True when the parent read has already been classified `similar`
    /// (i.e. this candidate came from a 1-indel correction).
    pub read_is_similar: bool,
    /// When set, a substitution match is only accepted if the resulting
    /// TagCode is in the closing primer's valid set.
    pub restrict_similar_to_valid: bool,
}

/// Attempts to match a single candidate tag-string against the cycle
/// layout. Returns `None` if the candidate doesn't fully match any cycle
/// (abandon candidate, try the next one).
pub fn match_candidate(
    tag_string: &[u8],
    cycles: &[CycleSpec],
    cp_id: &ClosingPrimerId,
    inventory: &TagInventory,
    opts: &MatchOptions,
) -> Option<MatchOutcome> {
    if opts.chimera_search {
        return match_chimera(tag_string, cycles, inventory);
    }

    let mut codes = Vec::with_capacity(cycles.len());
    let mut substitutions = Vec::new();
    let mut pos = 0usize;

    for spec in cycles {
        if pos + spec.len > tag_string.len() {
            return None;
        }
        let tag = &tag_string[pos..pos + spec.len];
        let post_end = (pos + spec.len + spec.overhang.len()).min(tag_string.len());
        let post = &tag_string[pos + spec.len..post_end];

        if !opts.chimera_search && !opts.similar_search {
            if post != spec.overhang.as_slice() {
                return None;
            }
        }

        let cycle_inv = inventory.cycles.get(&spec.cycle)?;

        if let Some(code) = cycle_inv.lookup(tag) {
            codes.push(code.clone());
            pos += spec.len + spec.overhang.len();
            continue;
        }

        let allow_substitution = opts.similar_search && !(opts.similar_strict && opts.read_is_similar);
        if allow_substitution {
            if let Some((code, sub_pos)) = try_substitution(tag, cycle_inv) {
                let accept = if opts.restrict_similar_to_valid && opts.read_is_similar {
                    inventory.is_valid(cp_id, &code)
                } else {
                    true
                };
                if accept {
                    substitutions.push(format!("var,{}", pos + sub_pos));
                    codes.push(code);
                    pos += spec.len + spec.overhang.len();
                    continue;
                }
            }
        }

        return None;
    }

    Some(MatchOutcome::Matched {
        cp_match: CpMatch {
            cp_id: cp_id.clone(),
            codes,
        },
        substitutions,
    })
}

fn try_substitution(
    tag: &[u8],
    cycle_inv: &crate::inventory::CycleInventory,
) -> Option<(TagCode, usize)> {
    const BASES: [u8; 4] = [b'A', b'C', b'G', b'T'];
    for i in 0..tag.len() {
        for &b in &BASES {
            if b == tag[i] {
                continue;
            }
            let mut candidate = tag.to_vec();
            candidate[i] = b;
            if let Some(code) = cycle_inv.lookup(&candidate) {
                return Some((code.clone(), i));
            }
        }
    }
    None
}

/// Chimera-search variant: scan every cycle independently at its natural
/// offset; if the natural-offset tag hits the inventory and the same
/// sequence occurs more than once in the tag-string, mark as chimera.
fn match_chimera(
    tag_string: &[u8],
    cycles: &[CycleSpec],
    inventory: &TagInventory,
) -> Option<MatchOutcome> {
    let mut pos = 0usize;
    let mut chimera = false;

    for spec in cycles {
        if pos + spec.len > tag_string.len() {
            break;
        }
        let tag = &tag_string[pos..pos + spec.len];
        if let Some(cycle_inv) = inventory.cycles.get(&spec.cycle) {
            if cycle_inv.lookup(tag).is_some() {
                let occurrences = tag_string
                    .windows(tag.len())
                    .filter(|w| *w == tag)
                    .count();
                if occurrences > 1 {
                    chimera = true;
                }
            }
        }
        pos += spec.len + spec.overhang.len();
    }

    if chimera {
        Some(MatchOutcome::Chimera)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::{load_inventory, parse_closing_primer_spec, TagFileSelector};
    use std::io::Write;

    fn inventory_fixture() -> (TagInventory, ClosingPrimerId) {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(f, "1.001\tAAA\n2.001\tCCC\n").unwrap();
        let sel = TagFileSelector {
            path: f.path().to_string_lossy().to_string(),
            libraries: None,
        };
        let cp = parse_closing_primer_spec("CCAGCA");
        let inv = load_inventory(&[sel], &[cp.clone()], false, &[], &[]).unwrap();
        (inv, cp.id)
    }

    fn cycles() -> Vec<CycleSpec> {
        vec![
            CycleSpec {
                cycle: 1,
                len: 3,
                overhang: vec![],
            },
            CycleSpec {
                cycle: 2,
                len: 3,
                overhang: vec![],
            },
        ]
    }

    #[test]
    fn test_exact_match() {
        let (inv, cp_id) = inventory_fixture();
        let opts = MatchOptions {
            similar_search: false,
            chimera_search: false,
            similar_strict: false,
            read_is_similar: false,
            restrict_similar_to_valid: false,
        };
        let outcome = match_candidate(b"AAACCC", &cycles(), &cp_id, &inv, &opts).unwrap();
        match outcome {
            MatchOutcome::Matched { cp_match, substitutions } => {
                assert_eq!(cp_match.codes, vec![TagCode("1.001".into()), TagCode("2.001".into())]);
                assert!(substitutions.is_empty());
            }
            _ => panic!("expected match"),
        }
    }

    #[test]
    fn test_substitution_match() {
        let (inv, cp_id) = inventory_fixture();
        let opts = MatchOptions {
            similar_search: true,
            chimera_search: false,
            similar_strict: false,
            read_is_similar: false,
            restrict_similar_to_valid: false,
        };
        // Second cycle has one substitution: CCC -> CCT
        let outcome = match_candidate(b"AAACCT", &cycles(), &cp_id, &inv, &opts).unwrap();
        match outcome {
            MatchOutcome::Matched { cp_match, substitutions } => {
                assert_eq!(cp_match.codes, vec![TagCode("1.001".into()), TagCode("2.001".into())]);
                assert_eq!(substitutions.len(), 1);
            }
            _ => panic!("expected match"),
        }
    }

    #[test]
    fn test_no_match_without_similar() {
        let (inv, cp_id) = inventory_fixture();
        let opts = MatchOptions {
            similar_search: false,
            chimera_search: false,
            similar_strict: false,
            read_is_similar: false,
            restrict_similar_to_valid: false,
        };
        assert!(match_candidate(b"AAACCT", &cycles(), &cp_id, &inv, &opts).is_none());
    }

    #[test]
    fn test_chimera_bypasses_valid_restriction() {
        // Chimera search does not apply the valid/invalid restriction at all:
        // it only needs the natural-offset tag to hit the raw inventory.
        let (inv, cp_id) = inventory_fixture();
        let opts = MatchOptions {
            similar_search: true,
            chimera_search: true,
            similar_strict: false,
            read_is_similar: true,
            restrict_similar_to_valid: true,
        };
        // AAA appears twice in the tag-string -> chimera.
        let outcome = match_candidate(b"AAACCCAAA", &cycles(), &cp_id, &inv, &opts).unwrap();
        assert_eq!(outcome, MatchOutcome::Chimera);
    }
}
