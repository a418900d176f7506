use std::io::{self, Write};

use serde::Serialize;

use crate::app::{AdminReport, PluginReport, SceneProcessReport, StageReport};
use crate::discovery::{DiscoveryReport, PurgeReport};
use crate::store::{CatalogSummary, ImportResult};
use crate::usage::UsageEntry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Json,
    Text,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_discovery(report: &DiscoveryReport) -> io::Result<()> {
        Self::print_json(report)
    }

    pub fn print_purge(report: &PurgeReport) -> io::Result<()> {
        Self::print_json(report)
    }

    pub fn print_stages(reports: &[StageReport]) -> io::Result<()> {
        Self::print_json(&reports)
    }

    pub fn print_scene(report: &SceneProcessReport) -> io::Result<()> {
        Self::print_json(report)
    }

    pub fn print_summary(summary: &[CatalogSummary]) -> io::Result<()> {
        Self::print_json(&summary)
    }

    pub fn print_plugin_report(report: &PluginReport) -> io::Result<()> {
        Self::print_json(report)
    }

    pub fn print_admin(report: &AdminReport) -> io::Result<()> {
        Self::print_json(report)
    }

    pub fn print_import(result: &ImportResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_usage(entries: &[UsageEntry]) -> io::Result<()> {
        Self::print_json(&entries)
    }

    pub fn print_value<T: Serialize>(value: &T) -> io::Result<()> {
        Self::print_json(value)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

/// Plain-text rendering for the reports an operator reads most.
pub struct TextOutput;

impl TextOutput {
    pub fn print_stages(reports: &[StageReport]) -> io::Result<()> {
        let mut stdout = io::stdout();
        for r in reports {
            writeln!(
                stdout,
                "{:<10} {:<10} attempted={} succeeded={} failed={} skipped={}",
                r.provider, r.stage, r.batch.attempted, r.batch.succeeded, r.batch.failed, r.batch.skipped
            )?;
        }
        Ok(())
    }

    pub fn print_summary(summaries: &[CatalogSummary]) -> io::Result<()> {
        let mut stdout = io::stdout();
        writeln!(
            stdout,
            "{:<12} {:>7} {:>8} {:>10} {:>9} {:>8} {:>8} {:>8}",
            "provider", "total", "pending", "downloaded", "ard_ready", "analyzed", "invalid", "archived"
        )?;
        for s in summaries {
            writeln!(
                stdout,
                "{:<12} {:>7} {:>8} {:>10} {:>9} {:>8} {:>8} {:>8}",
                s.provider, s.total, s.pending, s.downloaded, s.ard_ready, s.analyzed, s.invalid, s.archived
            )?;
        }
        Ok(())
    }
}
