// src/main.rs
// deltag: DNA-Encoded Library tag deconvolution core.
// Entry point for the Command Line Interface.
// Wires the CLI flags to the Tag Inventory / Primer Compiler / Read Classifier
// / Tag Matcher / UMI Extractor / Aggregator / Shard Reducer chain and emits
// the `.allTags` family of output files.

mod cli;

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::Parser;

use deltag::aggregator::Aggregator;
use deltag::classifier::ClassifyOptions;
use deltag::config;
use deltag::fastq::{open_fastq, FastqBatchIterator, FastqRecord};
use deltag::inventory::{
    self, load_inventory, parse_closing_primer_spec, parse_tag_file_arg, parse_tag_pattern,
    ClosingPrimerId, ClosingPrimerSpec, TagInventory,
};
use deltag::matcher::CycleSpec;
use deltag::output;
use deltag::primer::PrimerSet;
use deltag::shard::{self, ShardState};
use deltag::umi::DegenPattern;

use crate::cli::{Cli, Commands};

/// Default `maxDegenErrors` for the UMI dedup sweep (spec.md §4.5); `-D`
/// forces this to 0, disabling error-tolerant collapsing while exact
/// duplicates still collapse via the underlying multiset.
const DEFAULT_MAX_DEGEN_ERRORS: usize = 1;

/// Batch sizing for the FASTQ reader: bounded by item count or byte budget,
/// same split the teacher's `DnaBatchIterator` callers use.
const BATCH_MAX_ITEMS: usize = 5000;
const BATCH_MAX_BYTES: usize = deltag::STREAMING_CHUNK_SIZE;

fn main() -> Result<()> {
    let cli = Cli::parse();

    rayon::ThreadPoolBuilder::new()
        .num_threads(cli.jobs)
        .build_global()
        .map_err(|e| anyhow::anyhow!("Failed to configure thread pool: {}", e))?;

    let num_threads = rayon::current_num_threads();
    if num_threads == 1 {
        println!("[i] Mode: SEQUENTIAL (Single-threaded)");
    } else {
        println!("[i] Mode: PARALLEL ({} threads active)", num_threads);
    }

    match &cli.command {
        Commands::Run { .. } => run(&cli.command),
        Commands::Reduce { .. } => reduce(&cli.command),
    }
}

/// Splits cycle overhangs (comma-separated) across the inventory's cycles in
/// order; the final cycle never carries a trailing overhang.
fn build_cycles(inventory: &TagInventory, overhangs_raw: &str) -> Vec<CycleSpec> {
    let overhangs: Vec<Vec<u8>> = if overhangs_raw.is_empty() {
        Vec::new()
    } else {
        overhangs_raw.split(',').map(|s| s.as_bytes().to_ascii_uppercase()).collect()
    };

    let n = inventory.cycles.len();
    inventory
        .cycles
        .iter()
        .enumerate()
        .map(|(i, (&cycle, inv))| CycleSpec {
            cycle,
            len: inv.tag_len,
            overhang: if i + 1 < n {
                overhangs.get(i).cloned().unwrap_or_default()
            } else {
                Vec::new()
            },
        })
        .collect()
}

fn build_degen_patterns(closing_primers: &[ClosingPrimerSpec]) -> HashMap<ClosingPrimerId, DegenPattern> {
    closing_primers
        .iter()
        .filter(|cp| cp.n_len > 0)
        .map(|cp| {
            (
                cp.id.clone(),
                DegenPattern {
                    static_prefix: cp.static_prefix.clone(),
                    n_len: cp.n_len,
                },
            )
        })
        .collect()
}

fn parse_patterns(raw: &[String]) -> Result<Vec<inventory::TagPattern>> {
    raw.iter().map(|s| parse_tag_pattern(s)).collect()
}

/// Returns `(foundTags, missingTags)`: distinct TagCodes actually observed in
/// at least one matched compound versus distinct valid TagCodes never seen.
fn tag_coverage(aggregator: &Aggregator, inventory: &TagInventory) -> (usize, usize) {
    let mut found = HashSet::new();
    for (_, codes) in aggregator.compounds.keys() {
        for (_, code) in codes {
            found.insert(code.clone());
        }
    }
    let mut all_valid = HashSet::new();
    for set in inventory.valid_tag_codes.values() {
        all_valid.extend(set.iter().cloned());
    }
    let missing = all_valid.difference(&found).count();
    (found.len(), missing)
}

fn default_prefix(input: &str) -> String {
    Path::new(input)
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "output".to_string())
}

fn run(command: &Commands) -> Result<()> {
    let Commands::Run {
        input,
        tag_files,
        head_pieces,
        overhangs,
        closing_primers,
        anchor_size,
        min_base_quality,
        left_anchored,
        similar_search,
        similar_strict,
        reverse_cycles,
        no_umi,
        no_over,
        no_umi_cleanup,
        valid_patterns,
        invalid_patterns,
        exclude_unexpected,
        dump_compound,
        recovery,
        write_recovery,
        max_reads,
        shards,
        write_invalid,
        write_chimeras,
        write_lengths,
        write_errors,
        write_tagcounts,
        write_existingtags,
        write_degen,
        config: config_path,
        output_prefix,
    } = command
    else {
        unreachable!("run() only called for Commands::Run")
    };

    // Pre-populate unset values from the optional glob-keyed config file.
    let mut tag_files = tag_files.clone();
    let mut head_pieces = head_pieces.clone();
    let mut overhangs = overhangs.clone();
    let mut closing_primers = closing_primers.clone();
    let mut reverse_cycles = *reverse_cycles;
    let mut valid_patterns = valid_patterns.clone();
    let mut invalid_patterns = invalid_patterns.clone();

    if let Some(cfg_path) = config_path {
        let records = config::load_config(Path::new(cfg_path))?;
        let fastq_name = Path::new(input).file_name().map(|s| s.to_string_lossy().to_string()).unwrap_or_default();
        if let Some(rec) = config::find_matching_record(&records, &fastq_name) {
            if tag_files.is_none() {
                tag_files = rec.tag_file.clone();
            }
            if head_pieces.is_none() {
                head_pieces = rec.head_pieces.clone();
            }
            if overhangs.is_none() {
                overhangs = rec.overhangs.clone();
            }
            if closing_primers.is_none() {
                closing_primers = rec.closing_primers.clone();
            }
            if !reverse_cycles {
                reverse_cycles = rec.reverse_cycles.unwrap_or(false);
            }
            if valid_patterns.is_empty() {
                if let Some(p) = &rec.valid_tags {
                    valid_patterns.push(p.clone());
                }
            }
            if invalid_patterns.is_empty() {
                if let Some(p) = &rec.invalid_tags {
                    invalid_patterns.push(p.clone());
                }
            }
        }
    }

    let tag_files = tag_files.context("no -t/--tags given and no matching --config record")?;
    let head_pieces = head_pieces.context("no -h/--head-pieces given and no matching --config record")?;
    let closing_primers = closing_primers.context("no -p/--closing-primers given and no matching --config record")?;
    let overhangs = overhangs.unwrap_or_default();

    let selectors: Vec<_> = tag_files.split(',').map(parse_tag_file_arg).collect();
    let cp_specs: Vec<ClosingPrimerSpec> = closing_primers.split(',').map(parse_closing_primer_spec).collect();
    let head_piece_seqs: Vec<String> = head_pieces.split(',').map(|s| s.to_string()).collect();
    let valid_pats = parse_patterns(&valid_patterns)?;
    let invalid_pats = parse_patterns(&invalid_patterns)?;

    println!("[*] Loading tag inventory from {tag_files}...");
    let inventory = load_inventory(&selectors, &cp_specs, reverse_cycles, &valid_pats, &invalid_pats)
        .context("failed to load tag inventory")?;
    println!("{}", inventory.summary());

    let umi_enabled = !no_umi;
    let effective_similar_search = *similar_search || *similar_strict;
    let primers = PrimerSet::compile(&head_piece_seqs, &cp_specs, *anchor_size, effective_similar_search)
        .context("failed to compile primer set")?;

    let cycles = build_cycles(&inventory, &overhangs);
    let l_total: usize = cycles.iter().map(|c| c.len + c.overhang.len()).sum();
    let degen_patterns = build_degen_patterns(&cp_specs);

    let classify_opts = ClassifyOptions {
        l_total,
        anchor_size: *anchor_size,
        min_primer_len: primers.min_primer_len(),
        left_anchored: *left_anchored,
        similar_search: effective_similar_search,
        similar_strict: *similar_strict,
        restrict_similar_to_valid: *exclude_unexpected,
        min_base_quality: *min_base_quality,
        recovery: *recovery,
    };

    println!("[*] Classifying reads from {input}...");
    let reader = open_fastq(Path::new(input))?;
    let batches = FastqBatchIterator::new(reader, BATCH_MAX_ITEMS, BATCH_MAX_BYTES);

    let mut state = ShardState::default();
    let mut reads_seen = 0u64;
    let mut parallel_batches: Vec<Vec<FastqRecord>> = Vec::new();

    for batch_result in batches {
        let mut batch = batch_result.context("I/O error while reading FASTQ")?;
        if let Some(max) = max_reads {
            let remaining = max.saturating_sub(reads_seen);
            if remaining == 0 {
                break;
            }
            if (batch.len() as u64) > remaining {
                batch.truncate(remaining as usize);
            }
        }
        reads_seen += batch.len() as u64;

        if *shards > 1 {
            parallel_batches.push(batch);
        } else {
            let batch_state = shard::process_batch(&batch, &primers, &cycles, &inventory, &classify_opts, &degen_patterns, umi_enabled);
            state.merge(batch_state);
        }

        if max_reads.map(|m| reads_seen >= m).unwrap_or(false) {
            break;
        }
    }

    if *shards > 1 && !parallel_batches.is_empty() {
        println!("[i] Sharding {} batches across the worker pool", parallel_batches.len());
        let parallel_state = shard::run_parallel(parallel_batches, &primers, &cycles, &inventory, &classify_opts, &degen_patterns, umi_enabled);
        state.merge(parallel_state);
    }

    println!("[i] Reads processed: {} (matched {})", state.counters.total, state.counters.matched);

    let max_degen_errors = if *no_umi_cleanup { 0 } else { DEFAULT_MAX_DEGEN_ERRORS };
    state.aggregator.finalize_dedup(max_degen_errors);

    if let Some(combo) = dump_compound {
        dump_compound_umis(&state.aggregator, combo);
    }

    let over = if *no_over { None } else { Some(state.aggregator.analyze_over_representation()) };

    let mut rows = output::build_rows(&state.aggregator, &inventory, over.as_ref());
    if *exclude_unexpected {
        rows.retain(|r| r.expected);
    }
    output::sort_rows(&mut rows);

    let prefix = output_prefix.clone().unwrap_or_else(|| default_prefix(input));
    write_outputs(
        &prefix,
        &rows,
        &state,
        &inventory,
        over.as_ref(),
        &degen_patterns,
        OutputFlags {
            write_invalid: *write_invalid,
            write_chimeras: *write_chimeras,
            write_lengths: *write_lengths,
            write_errors: *write_errors,
            write_recovery: *write_recovery,
            write_tagcounts: *write_tagcounts,
            write_existingtags: *write_existingtags,
            write_degen: *write_degen,
            no_over: *no_over,
            max_degen_errors,
        },
    )?;

    println!("[OK] Wrote output for prefix '{prefix}'.");
    Ok(())
}

fn dump_compound_umis(aggregator: &Aggregator, combo: &str) {
    let codes: Vec<&str> = combo.split('-').collect();
    for (key, stats) in &aggregator.compounds {
        let (_, key_codes) = key;
        let key_strs: Vec<&str> = key_codes.iter().map(|(_, c)| c.0.as_str()).collect();
        if key_strs == codes {
            println!("[dump] {combo}: raw={} dedup={} umis={:?}", stats.raw_count, stats.dedup_count, stats.umi_multiset);
        }
    }
}

struct OutputFlags {
    write_invalid: bool,
    write_chimeras: bool,
    write_lengths: bool,
    write_errors: bool,
    write_recovery: bool,
    write_tagcounts: bool,
    write_existingtags: bool,
    write_degen: bool,
    no_over: bool,
    max_degen_errors: usize,
}

fn write_outputs(
    prefix: &str,
    rows: &[output::CompoundRow],
    state: &ShardState,
    inventory: &TagInventory,
    over: Option<&deltag::aggregator::OverRepResult>,
    degen_patterns: &HashMap<ClosingPrimerId, DegenPattern>,
    flags: OutputFlags,
) -> Result<()> {
    let path = |suffix: &str| PathBuf::from(format!("tags_{prefix}.{suffix}"));

    output::write_all_tags(&path("allTags"), rows)?;

    let (found, missing) = tag_coverage(&state.aggregator, inventory);
    if missing > found {
        output::write_filtered(&path("filtered"), rows)?;
    }

    if !flags.no_over {
        if let Some(over) = over {
            output::write_over(&path("over"), over)?;
        }
    }

    output::write_log(&path("log"), &state.counters)?;

    if flags.write_invalid {
        output::write_invalid(&path("invalid"), &state.counters)?;
    }
    if flags.write_chimeras {
        output::write_chimeras(&path("chimeras"), &state.counters)?;
    }
    if flags.write_lengths {
        output::write_lengths(&path("lengths"), &state.counters)?;
    }
    if flags.write_errors {
        output::write_errors(&path("errors"), &state.aggregator.calibrator, flags.max_degen_errors)?;
    }
    if flags.write_recovery {
        output::write_recovery(&path("recovery"), &state.counters)?;
    }
    if flags.write_tagcounts {
        output::write_tagcounts(&path("tagcounts"), &state.aggregator, inventory)?;
    }
    if flags.write_existingtags {
        output::write_existingtags(&path("existingtags"), inventory)?;
    }
    if flags.write_degen {
        output::write_degen(&path("degen"), degen_patterns)?;
    }

    Ok(())
}

fn reduce(command: &Commands) -> Result<()> {
    let Commands::Reduce {
        shard_files,
        tag_files,
        closing_primers,
        reverse_cycles,
        valid_patterns,
        invalid_patterns,
        no_over,
        output_prefix,
    } = command
    else {
        unreachable!("reduce() only called for Commands::Reduce")
    };

    if shard_files.is_empty() {
        bail!("at least one shard file must be given");
    }

    let selectors: Vec<_> = tag_files.split(',').map(parse_tag_file_arg).collect();
    let cp_specs: Vec<ClosingPrimerSpec> = closing_primers.split(',').map(parse_closing_primer_spec).collect();
    let valid_pats = parse_patterns(valid_patterns)?;
    let invalid_pats = parse_patterns(invalid_patterns)?;

    let inventory = load_inventory(&selectors, &cp_specs, *reverse_cycles, &valid_pats, &invalid_pats)
        .context("failed to load tag inventory")?;

    let mut aggregator = Aggregator::new();
    for shard_path in shard_files {
        println!("[*] Merging shard {shard_path}...");
        shard::merge_shard_file(Path::new(shard_path), &mut aggregator)
            .with_context(|| format!("failed to merge shard file {shard_path}"))?;
    }

    // The external shard artifact format doesn't persist ErrorCalibrator
    // observations, so base_error_rates here is computed from no data and
    // error-tolerant UMI collapsing never triggers for a Reduce-only run;
    // exact-duplicate collapsing via the multiset still applies.
    aggregator.finalize_dedup(DEFAULT_MAX_DEGEN_ERRORS);

    let over = if *no_over { None } else { Some(aggregator.analyze_over_representation()) };
    let mut rows = output::build_rows(&aggregator, &inventory, over.as_ref());
    output::sort_rows(&mut rows);

    let path = |suffix: &str| PathBuf::from(format!("tags_{output_prefix}.{suffix}"));
    output::write_all_tags(&path("allTags"), &rows)?;

    let (found, missing) = tag_coverage(&aggregator, &inventory);
    if missing > found {
        output::write_filtered(&path("filtered"), &rows)?;
    }
    if !no_over {
        if let Some(over) = &over {
            output::write_over(&path("over"), over)?;
        }
    }

    println!("[OK] Merged {} shard(s) into prefix '{output_prefix}'.", shard_files.len());
    Ok(())
}
