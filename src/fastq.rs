// src/fastq.rs
// Ambient FASTQ reader: THE CORE assumes reads arrive as (id, seq, qual)
// quadruples and explicitly leaves FASTQ/gzip decoding out of scope. This is
// the minimal "external collaborator" that produces those quadruples.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Lines, Read};
use std::mem;
use std::path::Path;

use anyhow::{Context, Result};
use flate2::read::MultiGzDecoder;

#[derive(Debug, Clone)]
pub struct FastqRecord {
    pub id: String,
    pub seq: Vec<u8>,
    pub qual: Vec<u8>,
}

/// Opens `path` as a plain or (if `.gz`-suffixed) gzip-transparent `BufRead`.
pub fn open_fastq(path: &Path) -> Result<Box<dyn BufRead>> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    if path.extension().and_then(|e| e.to_str()) == Some("gz") {
        let decoder: Box<dyn Read> = Box::new(MultiGzDecoder::new(file));
        Ok(Box::new(BufReader::new(decoder)))
    } else {
        Ok(Box::new(BufReader::new(file)))
    }
}

/// Batching, memory-bounded FASTQ reader. Reads four-line records (id/seq/+/
/// qual) and yields batches bounded by item count or byte budget so a shard
/// never buffers an unbounded number of reads.
pub struct FastqBatchIterator<R> {
    lines: Lines<R>,
    max_items: usize,
    max_bytes: usize,
    exhausted: bool,
}

impl<R: BufRead> FastqBatchIterator<R> {
    pub fn new(reader: R, max_items: usize, max_bytes: usize) -> Self {
        Self {
            lines: reader.lines(),
            max_items,
            max_bytes,
            exhausted: false,
        }
    }

    fn next_record(&mut self) -> Option<io::Result<FastqRecord>> {
        let id_line = match self.lines.next()? {
            Ok(l) => l,
            Err(e) => return Some(Err(e)),
        };
        let Some(id) = id_line.strip_prefix('@').map(str::to_string) else {
            return Some(Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("FASTQ record id line missing '@': {id_line:?}"),
            )));
        };

        let seq_line = match self.lines.next() {
            Some(Ok(l)) => l,
            Some(Err(e)) => return Some(Err(e)),
            None => return Some(Err(io::Error::new(io::ErrorKind::UnexpectedEof, "truncated FASTQ record (missing seq)"))),
        };

        let plus_line = match self.lines.next() {
            Some(Ok(l)) => l,
            Some(Err(e)) => return Some(Err(e)),
            None => return Some(Err(io::Error::new(io::ErrorKind::UnexpectedEof, "truncated FASTQ record (missing '+')"))),
        };
        if !plus_line.starts_with('+') {
            return Some(Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("expected '+' separator line, got {plus_line:?}"),
            )));
        }

        let qual_line = match self.lines.next() {
            Some(Ok(l)) => l,
            Some(Err(e)) => return Some(Err(e)),
            None => return Some(Err(io::Error::new(io::ErrorKind::UnexpectedEof, "truncated FASTQ record (missing qual)"))),
        };

        Some(Ok(FastqRecord {
            id,
            seq: seq_line.into_bytes(),
            qual: qual_line.into_bytes(),
        }))
    }
}

impl<R: BufRead> Iterator for FastqBatchIterator<R> {
    type Item = io::Result<Vec<FastqRecord>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.exhausted {
            return None;
        }

        let mut batch = Vec::new();
        let mut batch_bytes = 0usize;

        loop {
            if !batch.is_empty() && (batch.len() >= self.max_items || batch_bytes >= self.max_bytes) {
                return Some(Ok(mem::take(&mut batch)));
            }

            match self.next_record() {
                Some(Ok(rec)) => {
                    batch_bytes += rec.id.len() + rec.seq.len() + rec.qual.len() + 48;
                    batch.push(rec);
                }
                Some(Err(e)) => return Some(Err(e)),
                None => {
                    self.exhausted = true;
                    break;
                }
            }
        }

        if batch.is_empty() {
            None
        } else {
            Some(Ok(batch))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_parses_records() {
        let data = "@r1\nACGT\n+\nIIII\n@r2\nTTTT\n+\nIIJJ\n";
        let mut it = FastqBatchIterator::new(Cursor::new(data), 100, 1 << 20);
        let batch = it.next().unwrap().unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].id, "r1");
        assert_eq!(batch[0].seq, b"ACGT");
        assert_eq!(batch[1].qual, b"IIJJ");
        assert!(it.next().is_none());
    }

    #[test]
    fn test_batches_split_by_item_count() {
        let data = "@r1\nAAAA\n+\nIIII\n@r2\nCCCC\n+\nIIII\n@r3\nGGGG\n+\nIIII\n";
        let mut it = FastqBatchIterator::new(Cursor::new(data), 2, 1 << 20);
        let first = it.next().unwrap().unwrap();
        assert_eq!(first.len(), 2);
        let second = it.next().unwrap().unwrap();
        assert_eq!(second.len(), 1);
        assert!(it.next().is_none());
    }

    #[test]
    fn test_truncated_record_errors() {
        let data = "@r1\nAAAA\n+\n";
        let mut it = FastqBatchIterator::new(Cursor::new(data), 100, 1 << 20);
        let err = it.next().unwrap();
        assert!(err.is_err());
    }

    #[test]
    fn test_missing_at_prefix_errors() {
        let data = "r1\nAAAA\n+\nIIII\n";
        let mut it = FastqBatchIterator::new(Cursor::new(data), 100, 1 << 20);
        let err = it.next().unwrap();
        assert!(err.is_err());
    }
}
