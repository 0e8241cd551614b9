// src/classifier.rs
// Read Classifier: the per-read state machine that locates the tag region
// between a head piece and a closing primer, classifies its length against
// the expected tag+overhang total, and hands candidates to the Tag Matcher.

use crate::dna::revcomp;
use crate::inventory::{ClosingPrimerId, TagInventory};
use crate::matcher::{self, CpMatch, CycleSpec, MatchOptions, MatchOutcome};
use crate::primer::{find_anchor_end, find_earliest_3prime, find_near_3prime, find_near_anchor_end, PrimerSet};

const MAX_RECOVERY_PASSES: u32 = 64;
const BASES: [u8; 4] = [b'A', b'C', b'G', b'T'];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Orientation {
    Forward,
    Reverse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimilarKind {
    /// `ℓ == L-1`: a base was inserted to recover the expected length.
    Del,
    /// `ℓ == L+1`: a base was deleted to recover the expected length.
    Ins,
}

#[derive(Debug, Clone)]
pub struct MatchedRead {
    pub cp_match: CpMatch,
    pub orientation: Orientation,
    pub similar: Option<SimilarKind>,
    pub indel_positions: Vec<usize>,
    pub substitutions: Vec<String>,
    /// Absolute offset (in the original read) of the tag-string's first base.
    pub tag_start: usize,
    /// Actual bytes consumed from the read for the tag+overhang region.
    pub consumed_len: usize,
    pub recovered: bool,
}

#[derive(Debug, Clone)]
pub enum ReadOutcome {
    Shorter,
    Reduced,
    Longer,
    LowQual,
    Invalid,
    OpenedOnly,
    Unfound,
    Chimera,
    Matched(Box<MatchedRead>),
}

#[derive(Debug, Default, Clone)]
pub struct ClassifierCounters {
    pub total: u64,
    pub shorter: u64,
    pub reduced: u64,
    pub longer: u64,
    pub low_qual: u64,
    pub invalid: u64,
    pub opened_only: u64,
    /// Superset: any read that found a 5' anchor but no 3' anchor, whatever
    /// its eventual terminal bucket.
    pub opened: u64,
    pub unfound: u64,
    pub chimera: u64,
    pub matched: u64,
    pub forward: u64,
    pub reverse: u64,
    pub similar: u64,
    pub matched_recovered: u64,
}

impl ClassifierCounters {
    pub fn valid(&self) -> u64 {
        self.forward + self.reverse
    }
}

#[derive(Debug, Clone)]
pub struct ClassifyOptions {
    /// Expected tag-string length: sum of cycle lengths and overhangs.
    pub l_total: usize,
    pub anchor_size: usize,
    pub min_primer_len: usize,
    pub left_anchored: bool,
    pub similar_search: bool,
    pub similar_strict: bool,
    pub restrict_similar_to_valid: bool,
    /// 0 disables the quality gate.
    pub min_base_quality: u8,
    pub recovery: bool,
}

pub struct ClassifyResult {
    pub outcome: ReadOutcome,
    /// One entry per successful match; more than one only via recovery.
    pub matches: Vec<MatchedRead>,
}

/// Reads with a structural FASTQ defect (mismatched seq/qual length, or an
/// empty sequence) never enter the state machine at all.
pub fn validate_read(seq: &[u8], qual: Option<&[u8]>) -> bool {
    if seq.is_empty() {
        return false;
    }
    if let Some(q) = qual {
        if q.len() != seq.len() {
            return false;
        }
    }
    true
}

enum NoRegionKind {
    Shorter,
    Opened,
    Unfound,
}

enum RegionOutcome {
    Matched(MatchedRead),
    Chimera,
    Unfound,
    Reduced,
    Longer,
    LowQual,
}

enum PassOutcome {
    NoRegion(NoRegionKind),
    Region {
        anchor_end: usize,
        outcome: RegionOutcome,
        /// Superset signal: a 5' anchor resolved but no 3' anchor did,
        /// independent of `outcome`'s terminal bucket.
        opened: bool,
    },
}

pub fn classify_read(
    seq: &[u8],
    qual: Option<&[u8]>,
    primers: &PrimerSet,
    cycles: &[CycleSpec],
    inventory: &TagInventory,
    opts: &ClassifyOptions,
    counters: &mut ClassifierCounters,
) -> ClassifyResult {
    counters.total += 1;

    let mut matches = Vec::new();
    let mut first_outcome: Option<ReadOutcome> = None;
    let mut offset = 0usize;
    let mut pass = 0u32;

    loop {
        if offset >= seq.len() {
            break;
        }
        let window = &seq[offset..];
        let qwindow = qual.and_then(|q| q.get(offset..));
        let is_recovery_pass = pass > 0;
        let pass_outcome = classify_once(window, qwindow, primers, cycles, inventory, opts, is_recovery_pass);

        match pass_outcome {
            PassOutcome::Region {
                anchor_end,
                outcome: RegionOutcome::Matched(mut m),
                opened,
            } => {
                m.tag_start += offset;
                m.recovered = is_recovery_pass;
                if first_outcome.is_none() {
                    if opened {
                        counters.opened += 1;
                    }
                    counters.matched += 1;
                    match m.orientation {
                        Orientation::Forward => counters.forward += 1,
                        Orientation::Reverse => counters.reverse += 1,
                    }
                    if is_recovery_pass {
                        counters.matched_recovered += 1;
                    }
                    if m.similar.is_some() || !m.substitutions.is_empty() {
                        counters.similar += 1;
                    }
                    first_outcome = Some(ReadOutcome::Matched(Box::new(m.clone())));
                } else if is_recovery_pass {
                    counters.matched_recovered += 1;
                }
                matches.push(m);

                if !opts.recovery {
                    break;
                }
                let step = opts.l_total + opts.anchor_size;
                if step == 0 {
                    break;
                }
                offset += anchor_end + step;
                pass += 1;
                if pass >= MAX_RECOVERY_PASSES {
                    break;
                }
                continue;
            }
            PassOutcome::Region { anchor_end, outcome, opened } => {
                if first_outcome.is_none() {
                    if opened {
                        counters.opened += 1;
                    }
                    first_outcome = Some(match outcome {
                        RegionOutcome::Chimera => {
                            counters.chimera += 1;
                            ReadOutcome::Chimera
                        }
                        RegionOutcome::Unfound => {
                            counters.unfound += 1;
                            ReadOutcome::Unfound
                        }
                        RegionOutcome::Reduced => {
                            counters.reduced += 1;
                            ReadOutcome::Reduced
                        }
                        RegionOutcome::Longer => {
                            counters.longer += 1;
                            ReadOutcome::Longer
                        }
                        RegionOutcome::LowQual => {
                            counters.low_qual += 1;
                            ReadOutcome::LowQual
                        }
                        RegionOutcome::Matched(_) => unreachable!(),
                    });
                }

                if !opts.recovery {
                    break;
                }
                let step = opts.l_total + opts.anchor_size;
                if step == 0 {
                    break;
                }
                offset += anchor_end + step;
                pass += 1;
                if pass >= MAX_RECOVERY_PASSES {
                    break;
                }
                continue;
            }
            PassOutcome::NoRegion(kind) => {
                if first_outcome.is_none() {
                    first_outcome = Some(match kind {
                        NoRegionKind::Shorter => {
                            counters.shorter += 1;
                            ReadOutcome::Shorter
                        }
                        NoRegionKind::Opened => {
                            counters.opened += 1;
                            counters.opened_only += 1;
                            ReadOutcome::OpenedOnly
                        }
                        NoRegionKind::Unfound => {
                            counters.unfound += 1;
                            ReadOutcome::Unfound
                        }
                    });
                }
                break;
            }
        }
    }

    ClassifyResult {
        outcome: first_outcome.unwrap_or(ReadOutcome::Unfound),
        matches,
    }
}

struct Located {
    anchor_end: usize,
    tag_len: usize,
    orientation: Orientation,
    cp_idx: usize,
    /// Set when a 5' anchor resolved but no 3' anchor did — only reachable
    /// here via the `left_anchored` fallback, since any other no-3'-anchor
    /// case returns `Err(NoRegionKind::Opened)` before a `Located` exists.
    opened: bool,
}

fn find_5prime(seq: &[u8], primers: &PrimerSet, fuzzy: bool) -> Option<(usize, Orientation, usize)> {
    for (i, hp) in primers.head_pieces.iter().enumerate() {
        let hit = if fuzzy {
            find_near_anchor_end(seq, &hp.anchor5)
        } else {
            find_anchor_end(seq, &hp.anchor5)
        };
        if let Some(end) = hit {
            return Some((end, Orientation::Forward, i));
        }
    }
    for (i, cp) in primers.closing_primers.iter().enumerate() {
        let hit = if fuzzy {
            find_near_anchor_end(seq, &cp.anchor5_rc)
        } else {
            find_anchor_end(seq, &cp.anchor5_rc)
        };
        if let Some(end) = hit {
            return Some((end, Orientation::Reverse, i));
        }
    }
    None
}

fn find_3prime(
    anchored_suffix: &[u8],
    primers: &PrimerSet,
    orientation: Orientation,
    fuzzy: bool,
    l_total: usize,
) -> Option<(usize, usize)> {
    match orientation {
        Orientation::Forward => {
            let candidates: Vec<&[u8]> = primers.closing_primers.iter().map(|c| c.anchor3.as_slice()).collect();
            if fuzzy {
                find_near_3prime(anchored_suffix, &candidates, l_total)
            } else {
                find_earliest_3prime(anchored_suffix, &candidates)
            }
        }
        Orientation::Reverse => {
            let candidates: Vec<&[u8]> = primers.head_pieces.iter().map(|h| h.anchor3_rc.as_slice()).collect();
            if fuzzy {
                find_near_3prime(anchored_suffix, &candidates, l_total)
            } else {
                find_earliest_3prime(anchored_suffix, &candidates)
            }
        }
    }
}

fn locate_tag_region(seq: &[u8], primers: &PrimerSet, opts: &ClassifyOptions) -> Result<Located, NoRegionKind> {
    for fuzzy in [false, true] {
        if fuzzy && !opts.similar_search {
            break;
        }
        let Some((anchor_end, orientation, anchor_idx)) = find_5prime(seq, primers, fuzzy) else {
            continue;
        };
        let anchored_suffix = &seq[anchor_end..];
        if anchored_suffix.len() < opts.l_total + opts.anchor_size {
            return Err(NoRegionKind::Shorter);
        }

        if let Some((tag_len, cand_idx)) = find_3prime(anchored_suffix, primers, orientation, fuzzy, opts.l_total) {
            let cp_idx = match orientation {
                Orientation::Forward => cand_idx,
                Orientation::Reverse => anchor_idx,
            };
            return Ok(Located {
                anchor_end,
                tag_len,
                orientation,
                cp_idx,
                opened: false,
            });
        }

        if opts.left_anchored {
            let cp_idx = match orientation {
                Orientation::Forward => 0,
                Orientation::Reverse => anchor_idx,
            };
            return Ok(Located {
                anchor_end,
                tag_len: anchored_suffix.len(),
                orientation,
                cp_idx,
                opened: true,
            });
        }

        if !fuzzy && opts.similar_search {
            continue;
        }
        return Err(NoRegionKind::Opened);
    }
    Err(NoRegionKind::Unfound)
}

fn quality_slice(qual: &[u8], start: usize, len: usize) -> Option<&[u8]> {
    qual.get(start..start + len)
}

fn classify_once(
    seq: &[u8],
    qual: Option<&[u8]>,
    primers: &PrimerSet,
    cycles: &[CycleSpec],
    inventory: &TagInventory,
    opts: &ClassifyOptions,
    is_recovery_pass: bool,
) -> PassOutcome {
    if seq.len() < opts.min_primer_len + opts.l_total + opts.anchor_size {
        return PassOutcome::NoRegion(NoRegionKind::Shorter);
    }

    let located = match locate_tag_region(seq, primers, opts) {
        Ok(l) => l,
        Err(NoRegionKind::Shorter) => {
            return PassOutcome::NoRegion(if is_recovery_pass {
                NoRegionKind::Unfound
            } else {
                NoRegionKind::Shorter
            });
        }
        Err(other) => return PassOutcome::NoRegion(other),
    };

    let cp_id: ClosingPrimerId = primers.closing_primers[located.cp_idx].id.clone();
    let anchored_suffix = &seq[located.anchor_end..];
    let tag_len = located.tag_len.min(anchored_suffix.len());
    let raw_tag_string = &anchored_suffix[..tag_len];

    let oriented: Vec<u8> = match located.orientation {
        Orientation::Forward => raw_tag_string.to_vec(),
        Orientation::Reverse => revcomp(raw_tag_string),
    };

    let l = oriented.len();
    let target = opts.l_total;

    let mut candidate_list: Vec<(Vec<u8>, Option<SimilarKind>, Vec<usize>)> = Vec::new();

    if l == target {
        candidate_list.push((oriented.clone(), None, Vec::new()));
    } else if target > 0 && l + 1 == target && opts.similar_search {
        for pos in 0..=l {
            for &b in &BASES {
                let mut v = oriented.clone();
                v.insert(pos, b);
                candidate_list.push((v, Some(SimilarKind::Del), vec![pos]));
            }
        }
    } else if l == target + 1 && opts.similar_search {
        for pos in 0..l {
            let mut v = oriented.clone();
            v.remove(pos);
            candidate_list.push((v, Some(SimilarKind::Ins), vec![pos]));
        }
    } else if l < target {
        return region(located.anchor_end, RegionOutcome::Reduced, located.opened);
    } else {
        let chimera_opts = MatchOptions {
            similar_search: opts.similar_search,
            chimera_search: true,
            similar_strict: false,
            read_is_similar: false,
            restrict_similar_to_valid: false,
        };
        if let Some(MatchOutcome::Chimera) = matcher::match_candidate(&oriented, cycles, &cp_id, inventory, &chimera_opts) {
            return region(located.anchor_end, RegionOutcome::Chimera, located.opened);
        }
        if !opts.left_anchored {
            return region(located.anchor_end, RegionOutcome::Longer, located.opened);
        }
        candidate_list.push((oriented.clone(), None, Vec::new()));
    }

    if let Some(q) = qual {
        if opts.min_base_quality > 0 {
            if let Some(qs) = quality_slice(q, located.anchor_end, tag_len) {
                let threshold = b'!' as u16 + opts.min_base_quality as u16;
                if qs.iter().any(|&c| (c as u16) <= threshold) {
                    return region(located.anchor_end, RegionOutcome::LowQual, located.opened);
                }
            }
        }
    }

    for (candidate, similar_kind, positions) in candidate_list {
        let match_opts = MatchOptions {
            similar_search: opts.similar_search,
            chimera_search: false,
            similar_strict: opts.similar_strict,
            read_is_similar: similar_kind.is_some(),
            restrict_similar_to_valid: opts.restrict_similar_to_valid,
        };
        match matcher::match_candidate(&candidate, cycles, &cp_id, inventory, &match_opts) {
            Some(MatchOutcome::Matched { cp_match, substitutions }) => {
                let matched = MatchedRead {
                    cp_match,
                    orientation: located.orientation,
                    similar: similar_kind,
                    indel_positions: positions,
                    substitutions,
                    tag_start: located.anchor_end,
                    consumed_len: tag_len,
                    recovered: is_recovery_pass,
                };
                return region(located.anchor_end, RegionOutcome::Matched(matched), located.opened);
            }
            Some(MatchOutcome::Chimera) => return region(located.anchor_end, RegionOutcome::Chimera, located.opened),
            _ => continue,
        }
    }

    region(located.anchor_end, RegionOutcome::Unfound, located.opened)
}

fn region(anchor_end: usize, outcome: RegionOutcome, opened: bool) -> PassOutcome {
    PassOutcome::Region { anchor_end, outcome, opened }
}
