// src/cli.rs
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "deltag", author, version, about, long_about = None)]
#[command(propagate_version = true)]
#[command(help_template = "\
{before-help}{name} v{version}
{author-with-newline}{about-with-newline}
{usage-heading}
{usage}

{all-args}{after-help}
")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Set the number of threads for parallel processing.
    ///
    /// - 0: Auto-detect (Use all available cores).
    /// - 1: Sequential (Single-threaded, good for debugging).
    /// - >1: Force specific thread count.
    #[arg(short = 'j', long, global = true, default_value_t = 0, value_name = "THREADS")]
    pub jobs: usize,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Classify a FASTQ stream against a tag inventory and emit compound counts.
    Run {
        /// Input FASTQ file (plain or .gz)
        #[arg(short = 'f', long = "fastq", value_name = "FASTQ_FILE")]
        input: String,

        /// Comma-separated tag-table files; each may carry an optional
        /// `:libA:libB` library restriction suffix. May be left unset when
        /// `--config` supplies a matching record.
        #[arg(short = 't', long = "tags", value_name = "FILES")]
        tag_files: Option<String>,

        /// Comma-separated head pieces (5' flanking primers). May be left
        /// unset when `--config` supplies a matching record.
        #[arg(short = 'h', long = "head-pieces", value_name = "SEQS")]
        head_pieces: Option<String>,

        /// Comma-separated overhangs between consecutive cycles
        #[arg(short = 'o', long = "overhangs", value_name = "SEQS")]
        overhangs: Option<String>,

        /// Comma-separated closing primers; each may carry an optional
        /// `<label>-` prefix. May be left unset when `--config` supplies a
        /// matching record.
        #[arg(short = 'p', long = "closing-primers", value_name = "SEQS")]
        closing_primers: Option<String>,

        /// Anchor size
        #[arg(short = 'a', long, default_value_t = 7, value_name = "N")]
        anchor_size: usize,

        /// Minimum base quality threshold (phred-33, 0 disables the gate)
        #[arg(short = 'q', long, default_value_t = 0, value_name = "PHRED")]
        min_base_quality: u8,

        /// Accept left-anchored-only reads (no 3' anchor required)
        #[arg(short = 'l', long)]
        left_anchored: bool,

        /// Enable similar-search (tolerate one error per cycle)
        #[arg(short = 's', long)]
        similar_search: bool,

        /// Enable strict similar-search (tolerate one error per tag-string total); implies -s
        #[arg(short = 'S', long)]
        similar_strict: bool,

        /// Reverse-complement tags from even cycles during inventory load
        #[arg(short = 'i', long)]
        reverse_cycles: bool,

        /// Disable UMI handling entirely
        #[arg(short = 'N', long = "no-umi")]
        no_umi: bool,

        /// Disable over-representation analysis
        #[arg(short = 'O', long = "no-over")]
        no_over: bool,

        /// Disable UMI error-aware dedup cleanup (exact-duplicate collapse only)
        #[arg(short = 'D', long = "no-umi-cleanup")]
        no_umi_cleanup: bool,

        /// Valid-tag pattern(s): `<cp1>;<cp2>;...;<regex>` (repeatable)
        #[arg(short = 'v', long = "valid", value_name = "PATTERN")]
        valid_patterns: Vec<String>,

        /// Invalid-tag pattern(s), same syntax as -v (repeatable)
        #[arg(short = 'V', long = "invalid", value_name = "PATTERN")]
        invalid_patterns: Vec<String>,

        /// Exclude unexpected compounds (not EXPECTED) from the main output
        #[arg(short = 'W', long = "exclude-unexpected")]
        exclude_unexpected: bool,

        /// Dump the UMI distribution for one compound, e.g. "1.001-2.001"
        #[arg(short = 'd', long = "dump", value_name = "TAG_COMBO")]
        dump_compound: Option<String>,

        /// Enable recovery mode (re-scan a read past a matched tag region)
        #[arg(short = 'r', long)]
        recovery: bool,

        /// Write the recovery companion log
        #[arg(short = 'R', long = "recovery-log")]
        write_recovery: bool,

        /// Stop after N reads
        #[arg(short = 'T', long = "max-reads", value_name = "N")]
        max_reads: Option<u64>,

        /// Shard the input into N parallel workers
        #[arg(short = 'x', long = "shards", default_value_t = 1, value_name = "N")]
        shards: usize,

        /// Write the invalid-reads companion file
        #[arg(short = 'I', long = "write-invalid")]
        write_invalid: bool,

        /// Write the chimeras companion file
        #[arg(short = 'X', long = "write-chimeras")]
        write_chimeras: bool,

        /// Write the tag-string-length-distribution companion file
        #[arg(short = 'L', long = "write-lengths")]
        write_lengths: bool,

        /// Write the UMI base-error-rate companion file
        #[arg(short = 'E', long = "write-errors")]
        write_errors: bool,

        /// Write the per-cpId matched-compound-count companion file
        #[arg(short = 'c', long = "write-tagcounts")]
        write_tagcounts: bool,

        /// Write the existing-tags (inventory summary) companion file
        #[arg(short = 'e', long = "write-existingtags")]
        write_existingtags: bool,

        /// Write the UMI degenerate-pattern companion file
        #[arg(short = 'w', long = "write-degen")]
        write_degen: bool,

        /// Optional INI-like config file pre-populating unset values above
        #[arg(long = "config", value_name = "CONFIG_FILE")]
        config: Option<String>,

        /// Output file prefix (defaults to the FASTQ file's stem)
        #[arg(long = "prefix", value_name = "PREFIX")]
        output_prefix: Option<String>,
    },

    /// Merge previously-written `shard_<i>.allTags` artifacts into final output.
    Reduce {
        /// Shard artifact files to merge
        #[arg(value_name = "SHARD_FILE", required = true)]
        shard_files: Vec<String>,

        /// Comma-separated tag-table files (needed to compute EXPECTED/library size)
        #[arg(short = 't', long = "tags", value_name = "FILES")]
        tag_files: String,

        /// Comma-separated closing primers; each may carry an optional `<label>-` prefix
        #[arg(short = 'p', long = "closing-primers", value_name = "SEQS")]
        closing_primers: String,

        /// Reverse-complement tags from even cycles during inventory load
        #[arg(short = 'i', long)]
        reverse_cycles: bool,

        /// Valid-tag pattern(s), same syntax as `Run`'s `-v`
        #[arg(short = 'v', long = "valid", value_name = "PATTERN")]
        valid_patterns: Vec<String>,

        /// Invalid-tag pattern(s), same syntax as `Run`'s `-V`
        #[arg(short = 'V', long = "invalid", value_name = "PATTERN")]
        invalid_patterns: Vec<String>,

        /// Disable over-representation analysis
        #[arg(short = 'O', long = "no-over")]
        no_over: bool,

        /// Output file prefix
        #[arg(long = "prefix", value_name = "PREFIX")]
        output_prefix: String,
    },
}
