//! Sweep a JSON Lines file into a JSON array of per-document summaries.
//!
//! Run with:
//! ```bash
//! cargo run --example jsonl_sweep -- readings.jsonl [config.json] [--restart]
//! ```
//!
//! Kill it partway through and run again with `--restart`: every partition
//! resumes from its checkpoint under `progress/` and keeps appending to
//! `output.json`.

use anyhow::{Context, Result, bail};
use ironsweep::collection::jsonl::JsonlCollection;
use ironsweep::logging::init_error_log;
use ironsweep::{Collection, Document, Runner, ScanConfig, TransformContext};
use serde::Serialize;
use std::env::args;
use tracing::Level;

#[derive(Serialize)]
struct Summary {
    id: String,
    partition: usize,
    fields: usize,
}

fn summarize(ctx: &TransformContext, doc: &Document) -> Result<Option<Summary>> {
    let Some(fields) = doc.as_object() else {
        bail!("document {} is not an object", ctx.absolute_index);
    };
    let Some(id) = fields.get("id") else {
        return Ok(None);
    };
    Ok(Some(Summary {
        id: id.to_string(),
        partition: ctx.partition,
        fields: fields.len(),
    }))
}

fn main() -> Result<()> {
    let mut positional = args().skip(1).filter(|a| !a.starts_with("--"));
    let input = positional
        .next()
        .context("usage: jsonl_sweep <input.jsonl> [config.json] [--restart]")?;
    let mut config = match positional.next() {
        Some(path) => ScanConfig::from_json_file(path)?,
        None => ScanConfig::default(),
    };
    if args().any(|a| a == "--restart") {
        config.restart = true;
    }

    init_error_log(&config.error_log, Level::INFO)?;
    let collection = JsonlCollection::open(&input)?;
    config.collection = collection.name().to_string();

    println!(
        "Sweeping {} with {} workers (restart: {})",
        input, config.workers, config.restart
    );
    let runner = Runner::new(config);
    let report = runner.run(&collection, &summarize)?;

    for p in &report.partitions {
        println!(
            "  partition {:>2}: {}/{} processed, {} records, {} retries, done {}",
            p.partition,
            p.processed,
            p.expected,
            p.records_emitted,
            p.retries(),
            p.completed_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    println!(
        "Wrote {} records to {}",
        report.records_written,
        report.output_path.display()
    );
    runner.metrics().print();
    Ok(())
}
