use std::io::{self, Write};

use serde::Serialize;

use crate::domain::WorkUnit;
use crate::manifest::Manifest;
use crate::processor::{UnitOutcome, UnitReport};
use crate::scheduler::AdvanceResult;

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Human,
    Json,
}

#[derive(Debug, Clone, Serialize)]
pub struct FetchResult {
    pub year: i32,
    pub reports: Vec<UnitReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusEntry {
    pub unit: WorkUnit,
    pub done: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusResult {
    pub start: i32,
    pub end: i32,
    pub done: usize,
    pub pending: usize,
    pub units: Vec<StatusEntry>,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_fetch(result: &FetchResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_backfill(result: &AdvanceResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_status(result: &StatusResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_manifest(result: &Manifest) -> io::Result<()> {
        Self::print_json(result)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

pub struct HumanOutput;

impl HumanOutput {
    pub fn print_reports(reports: &[UnitReport]) {
        for report in reports {
            let outcome = match report.outcome {
                UnitOutcome::AlreadyDone => "already done",
                UnitOutcome::ClaimedElsewhere => "claimed elsewhere",
                UnitOutcome::Completed => "completed",
                UnitOutcome::Failed => "failed",
            };
            println!("{:<10} {outcome}", report.unit.to_string());
            for key in &report.curated {
                println!("           {key}");
            }
            if let Some(error) = &report.error {
                println!("           {error}");
            }
        }
    }

    pub fn print_backfill(result: &AdvanceResult) {
        Self::print_reports(&result.reports);
        if result.processed == 0 {
            println!("{}..={}: already complete", result.start, result.end);
        } else {
            println!(
                "{}..={}: advanced {} unit(s), {} completed, {} failed",
                result.start, result.end, result.processed, result.completed, result.failed
            );
        }
    }

    pub fn print_status(result: &StatusResult) {
        for entry in &result.units {
            let state = if entry.done { "done" } else { "pending" };
            println!("{:<10} {state}", entry.unit.to_string());
        }
        println!("{} done, {} pending", result.done, result.pending);
    }

    pub fn print_manifest(manifest: &Manifest) {
        for year in &manifest.years {
            println!(
                "{}: {} rows across {} airports",
                year.year,
                year.total_rows,
                year.airports.len()
            );
        }
        println!("manifest generated {}", manifest.generated_at);
    }
}
