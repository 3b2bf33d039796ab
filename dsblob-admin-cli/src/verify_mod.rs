//! Verify dataset version integrity

use anyhow::{anyhow, Result};
use dsblob_core::{CancellationToken, Engine, IntegrityReport, StorageError};

use crate::report::print_json;

/// Verify every blob referenced by `version`
///
/// Prints the offending hashes and fails if any blob is missing, corrupted
/// or unreadable.
pub async fn verify_version(
    engine: &Engine,
    version: &str,
    quiet: bool,
    json: bool,
    cancel: &CancellationToken,
) -> Result<()> {
    if !quiet && !json {
        println!("Verifying dataset version: {}", version);
        println!("  Mode: {}", engine.mode().as_str());
        println!();
    }

    let outcome = engine
        .ingestion()
        .verify_dataset_integrity(version, cancel)
        .await;
    let report = match outcome {
        Ok(report) => report,
        Err(StorageError::Integrity(report)) => {
            let report = *report;
            if json {
                print_json(&report)?;
            } else {
                print_problems(&report, quiet);
                print_summary(&report);
            }
            return Err(anyhow!(
                "Dataset version {} failed verification: {} bad blob(s)",
                version,
                report.bad_hashes().len()
            ));
        }
        Err(e) => return Err(e.into()),
    };

    if json {
        print_json(&report)?;
    } else {
        print_summary(&report);
        if !quiet {
            println!("\n✓ Dataset version is intact");
        }
    }
    Ok(())
}

fn print_problems(report: &IntegrityReport, quiet: bool) {
    if quiet {
        return;
    }
    for hash in &report.missing {
        eprintln!("  ERROR: {} missing", hash);
    }
    for failure in &report.corrupted {
        eprintln!("  ERROR: {} corrupted: {}", failure.hash, failure.error);
    }
    for failure in &report.unavailable {
        eprintln!("  ERROR: {} unavailable: {}", failure.hash, failure.error);
    }
}

fn print_summary(report: &IntegrityReport) {
    println!("\nVerification:");
    println!("  Blobs referenced: {}", report.total);
    println!("  Blobs checked:    {}", report.checked);
    println!("  Missing:          {}", report.missing.len());
    println!("  Corrupted:        {}", report.corrupted.len());
    println!("  Unavailable:      {}", report.unavailable.len());
}
