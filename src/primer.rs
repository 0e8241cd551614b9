// src/primer.rs
// Primer Compiler: compiles flanking-primer sequences into exact and
// approximate (similar-search) matchers.

use anyhow::{bail, Result};

use crate::dna::revcomp;
use crate::inventory::{ClosingPrimerId, ClosingPrimerSpec};

#[derive(Debug, Clone)]
pub struct HeadPiece {
    pub seq: Vec<u8>,
    /// Last `anchor_size` bases of `seq`: the forward 5' anchor.
    pub anchor5: Vec<u8>,
    /// reverse-complement(anchor5): the reverse-orientation 3' anchor.
    pub anchor3_rc: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct ClosingPrimer {
    pub id: ClosingPrimerId,
    pub seq: Vec<u8>,
    pub static_prefix: Vec<u8>,
    pub static_tail: Vec<u8>,
    pub n_len: usize,
    /// First `anchor_size` bases of `seq`: the forward 3' anchor.
    pub anchor3: Vec<u8>,
    /// reverse-complement(anchor3): the reverse-orientation 5' anchor.
    pub anchor5_rc: Vec<u8>,
}

impl ClosingPrimer {
    pub fn has_umi(&self) -> bool {
        self.n_len > 0
    }
}

#[derive(Debug, Clone)]
pub struct PrimerSet {
    pub head_pieces: Vec<HeadPiece>,
    pub closing_primers: Vec<ClosingPrimer>,
    pub anchor_size: usize,
    pub similar_search: bool,
}

impl PrimerSet {
    pub fn compile(
        head_pieces: &[String],
        closing_primers: &[ClosingPrimerSpec],
        anchor_size: usize,
        similar_search: bool,
    ) -> Result<Self> {
        if head_pieces.is_empty() {
            bail!("at least one head piece must be configured");
        }
        if closing_primers.is_empty() {
            bail!("at least one closing primer must be configured");
        }

        let mut hps = Vec::with_capacity(head_pieces.len());
        for hp in head_pieces {
            let seq = hp.as_bytes().to_ascii_uppercase();
            if anchor_size > seq.len() {
                bail!(
                    "anchor size {} exceeds head piece length {} ({})",
                    anchor_size,
                    seq.len(),
                    hp
                );
            }
            let anchor5 = seq[seq.len() - anchor_size..].to_vec();
            let anchor3_rc = revcomp(&anchor5);
            hps.push(HeadPiece {
                seq,
                anchor5,
                anchor3_rc,
            });
        }

        let mut cps = Vec::with_capacity(closing_primers.len());
        for cp in closing_primers {
            if anchor_size > cp.static_prefix.len() {
                bail!(
                    "anchor size {} exceeds closing primer static-prefix length {} ({})",
                    anchor_size,
                    cp.static_prefix.len(),
                    cp.id
                );
            }
            let anchor3 = cp.seq[..anchor_size].to_vec();
            let anchor5_rc = revcomp(&anchor3);
            cps.push(ClosingPrimer {
                id: cp.id.clone(),
                seq: cp.seq.clone(),
                static_prefix: cp.static_prefix.clone(),
                static_tail: cp.static_tail.clone(),
                n_len: cp.n_len,
                anchor3,
                anchor5_rc,
            });
        }

        Ok(PrimerSet {
            head_pieces: hps,
            closing_primers: cps,
            anchor_size,
            similar_search,
        })
    }

    /// `minPrimerLen`: the shortest primer region the classifier must find
    /// room for before even attempting an anchor search.
    pub fn min_primer_len(&self) -> usize {
        let hp_min = self.head_pieces.iter().map(|h| h.seq.len()).min().unwrap_or(0);
        let cp_min = self
            .closing_primers
            .iter()
            .map(|c| c.static_prefix.len())
            .min()
            .unwrap_or(0);
        hp_min.min(cp_min)
    }
}

/// Locates the earliest occurrence of `needle` in `haystack`, returning the
/// index of the byte immediately after the match.
pub fn find_anchor_end(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| p + needle.len())
}

/// A single-insertion-tolerant search for `anchor` in `haystack`: some one
/// position of the (anchor.len()+1)-wide window may be an arbitrary base not
/// present in `anchor`. Returns the end offset of the matched window.
pub fn find_near_anchor_end(haystack: &[u8], anchor: &[u8]) -> Option<usize> {
    let window_len = anchor.len() + 1;
    if haystack.len() < window_len {
        return None;
    }
    for start in 0..=(haystack.len() - window_len) {
        let window = &haystack[start..start + window_len];
        for skip in 0..window_len {
            let mut candidate = Vec::with_capacity(anchor.len());
            candidate.extend_from_slice(&window[..skip]);
            candidate.extend_from_slice(&window[skip + 1..]);
            if candidate == anchor {
                return Some(start + window_len);
            }
        }
    }
    None
}

/// Finds the earliest 3' anchor match among `candidates` within
/// `anchored_suffix`, returning `(tag_string_len, candidate_index)`.
pub fn find_earliest_3prime(
    anchored_suffix: &[u8],
    candidates: &[&[u8]],
) -> Option<(usize, usize)> {
    let mut best: Option<(usize, usize)> = None;
    for (idx, anchor) in candidates.iter().enumerate() {
        if let Some(pos) = anchored_suffix
            .windows(anchor.len().max(1))
            .position(|w| w == *anchor)
        {
            if anchor.is_empty() {
                continue;
            }
            if best.map(|(p, _)| pos < p).unwrap_or(true) {
                best = Some((pos, idx));
            }
        }
    }
    best
}

/// Near-3' search: checks fixed candidate tag-string lengths `L-1, L, L+1`
/// for an exact (non-fuzzy) 3' anchor match immediately following.
pub fn find_near_3prime(
    anchored_suffix: &[u8],
    candidates: &[&[u8]],
    l_total: usize,
) -> Option<(usize, usize)> {
    let lens: [i64; 3] = [l_total as i64 - 1, l_total as i64, l_total as i64 + 1];
    for &len in &lens {
        if len < 0 {
            continue;
        }
        let len = len as usize;
        for (idx, anchor) in candidates.iter().enumerate() {
            if anchored_suffix.len() >= len + anchor.len()
                && &anchored_suffix[len..len + anchor.len()] == *anchor
            {
                return Some((len, idx));
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::parse_closing_primer_spec;

    fn set() -> PrimerSet {
        PrimerSet::compile(
            &["CAGGTCAG".to_string()],
            &[parse_closing_primer_spec("CCAGCA")],
            5,
            true,
        )
        .unwrap()
    }

    #[test]
    fn test_compile_anchor_sizes() {
        let ps = set();
        assert_eq!(ps.head_pieces[0].anchor5, b"GTCAG");
        assert_eq!(ps.closing_primers[0].anchor3, b"CCAGC");
    }

    #[test]
    fn test_anchor_too_large_is_fatal() {
        let res = PrimerSet::compile(
            &["CAG".to_string()],
            &[parse_closing_primer_spec("CCAGCA")],
            5,
            false,
        );
        assert!(res.is_err());
    }

    #[test]
    fn test_find_anchor_end() {
        assert_eq!(find_anchor_end(b"XXGTCAGYY", b"GTCAG"), Some(7));
        assert_eq!(find_anchor_end(b"XXXX", b"GTCAG"), None);
    }

    #[test]
    fn test_find_near_anchor_end_single_insertion() {
        // anchor GTCAG with an inserted 'Z' after position 2 -> GTZCAG
        assert_eq!(find_near_anchor_end(b"XXGTZCAGYY", b"GTCAG"), Some(8));
    }

    #[test]
    fn test_find_earliest_3prime() {
        let candidates: Vec<&[u8]> = vec![b"CCAGC"];
        assert_eq!(
            find_earliest_3prime(b"AAACCCCCAGCXXX", &candidates),
            Some((6, 0))
        );
    }
}
