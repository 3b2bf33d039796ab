//! Text and JSON rendering for command results

use anyhow::Result;
use dsblob_core::{GcRunRecord, GcSkipReason, Stats, TieringPlan, TrashEntry};
use serde::Serialize;

pub fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

pub fn print_stats(stats: &Stats) {
    println!("Backend:       {}", stats.backend);
    println!("Blobs:         {}", stats.total_blobs);
    println!("Size:          {}", human_bytes(stats.total_size));
    match stats.compression_ratio() {
        Some(ratio) => println!(
            "Stored:        {} (ratio {:.2})",
            human_bytes(stats.total_size_compressed),
            ratio
        ),
        None => println!("Stored:        (compression disabled)"),
    }
    println!("Hot tier:      {}", human_bytes(stats.hot_bytes));
    println!("Cold tier:     {}", human_bytes(stats.cold_bytes));
    println!("Trashed blobs: {}", stats.trashed_blobs);
    println!(
        "Encryption:    {}",
        if stats.encrypted { "enabled" } else { "disabled" }
    );
    if let (Some(oldest), Some(newest)) = (stats.oldest_blob, stats.newest_blob) {
        println!("Oldest blob:   {}", oldest.to_rfc3339());
        println!("Newest blob:   {}", newest.to_rfc3339());
    }
}

pub fn print_gc(record: &GcRunRecord) {
    match &record.skipped {
        Some(GcSkipReason::BelowHighWater {
            hot_bytes,
            high_water,
        }) => {
            println!(
                "Skipped: hot tier at {} is below the {} high-water mark (use --force)",
                human_bytes(*hot_bytes),
                human_bytes(*high_water)
            );
            return;
        }
        Some(GcSkipReason::AlreadyRunning) => {
            println!("Skipped: another collection is running");
            return;
        }
        None => {}
    }

    if record.dry_run {
        println!("Dry run, nothing was moved");
    }
    println!("  Scanned:      {}", record.scanned);
    println!("  Referenced:   {}", record.referenced);
    println!("  Orphaned:     {}", record.orphaned);
    println!("  Too young:    {}", record.too_young);
    if record.dry_run {
        for hash in &record.orphans {
            println!("    {}", hash);
        }
    } else {
        println!(
            "  Trashed:      {} ({})",
            record.trashed,
            human_bytes(record.bytes_trashed)
        );
    }
    if record.permanently_deleted > 0 {
        println!(
            "  Deleted:      {} ({} freed)",
            record.permanently_deleted,
            human_bytes(record.bytes_freed)
        );
    }
    for failure in &record.failures {
        eprintln!("  ERROR: {}: {}", failure.hash, failure.error);
    }
    if record.cancelled {
        println!("Cancelled before completion");
    }
}

pub fn print_trash(entries: &[TrashEntry]) {
    if entries.is_empty() {
        println!("Trash is empty");
        return;
    }
    for entry in entries {
        println!(
            "{}  {:>10}  {}  deleted {}",
            entry.record.hash,
            human_bytes(entry.record.size),
            entry.record.tier.as_str(),
            entry.deleted_at.to_rfc3339()
        );
    }
}

pub fn print_plan(plan: &TieringPlan) {
    println!(
        "Hot tier: {} now, {} after {} moves",
        human_bytes(plan.hot_bytes_before),
        human_bytes(plan.hot_bytes_after),
        plan.moves.len()
    );
    for mv in &plan.moves {
        println!(
            "  {:?} {} ({:?}, {})",
            mv.action,
            mv.hash,
            mv.reason,
            human_bytes(mv.stored_size)
        );
    }
}
