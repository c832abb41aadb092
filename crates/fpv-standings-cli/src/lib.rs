//! Command surface for the season classification.
//!
//! - [`run_cli`] executes a parsed [`Cli`].
//! - [`run_classify`] runs a full season pass and returns its report.
//! - [`CsvStandingsSink`] writes the final table.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use fpv_standings_core::{
    parse_roster, rank_by_points, run_season, summarize_event, ClassificationRules,
    PilotSeasonRecord, PositionScope, SeasonRegistry, SeasonReport, SkippedEvent, StandingsError,
    StandingsSink, TieBreakSource,
};
use fpv_standings_store_sqlite::{DirectoryEventSource, SqliteEventStore};
use serde::Serialize;
use time::format_description::well_known::Rfc3339;
use time::{OffsetDateTime, UtcOffset};
use tracing::info;
use tracing_subscriber::EnvFilter;

const REPORT_CONTRACT_VERSION: &str = "standings.v1";

#[derive(Debug, Parser)]
#[command(name = "standings")]
#[command(about = "FPV league season standings")]
pub struct Cli {
    /// Log per-heat placings and lap counts.
    #[arg(long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Classify the season from a folder of event databases.
    Classify(ClassifyArgs),
    /// Print one event's statistics as JSON.
    Event(EventArgs),
    /// Print the default classification rules as JSON.
    Rules,
}

#[derive(Debug, Args)]
pub struct ClassifyArgs {
    #[arg(long, default_value = "./pilots.txt")]
    roster: PathBuf,
    #[arg(long, default_value = "./in_databases")]
    events: PathBuf,
    #[arg(long, default_value = "./classification.csv")]
    output: PathBuf,
    #[arg(long)]
    rules: Option<PathBuf>,
    #[arg(long)]
    position_scope: Option<PositionScopeArg>,
    /// Fixes the final coin-flip values so reruns produce the same table.
    #[arg(long)]
    seed: Option<u64>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct EventArgs {
    #[arg(long)]
    db: PathBuf,
    #[arg(long)]
    rules: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum PositionScopeArg {
    PerHeat,
    Class,
}

/// Installs the stderr log subscriber. `RUST_LOG` wins over `verbose`.
pub fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

/// Executes the parsed top-level command.
///
/// # Errors
/// Returns an error when inputs cannot be read, an event fails
/// classification, or the output cannot be written.
pub fn run_cli(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Classify(args) => {
            let json = args.json;
            let report = run_classify(&args)?;
            if json {
                let payload = build_standings_json_payload(&report, now_utc())?;
                println!("{}", serde_json::to_string_pretty(&payload)?);
            } else {
                print_points_listing(&rank_by_points(&report.standings));
                print_standings_table(&report.standings);
            }
            Ok(())
        }
        Command::Event(args) => {
            let rules = load_rules(args.rules.as_deref())?;
            let store = SqliteEventStore::open(&args.db)?;
            store.check_schema()?;
            let records = store.load()?;
            let summary = summarize_event(&records, &rules)
                .map_err(|err| anyhow!("failed to summarize {}: {err}", store.event()))?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }
        Command::Rules => {
            println!(
                "{}",
                serde_json::to_string_pretty(&ClassificationRules::v1())?
            );
            Ok(())
        }
    }
}

/// Runs the season pass and writes the CSV classification.
///
/// # Errors
/// Returns an error when the roster, rules or event folder cannot be read,
/// when any event fails (nothing is written in that case) or when the CSV
/// cannot be written.
pub fn run_classify(args: &ClassifyArgs) -> Result<SeasonReport> {
    let mut rules = load_rules(args.rules.as_deref())?;
    if let Some(scope) = args.position_scope {
        rules.position_scope = map_position_scope(scope);
    }

    let roster_text = fs::read_to_string(&args.roster)
        .with_context(|| format!("failed to read roster {}", args.roster.display()))?;
    let nicks = parse_roster(&roster_text).map_err(|err| anyhow!("invalid roster: {err}"))?;
    let tie_break = args
        .seed
        .map_or(TieBreakSource::Entropy, TieBreakSource::Seeded);
    let mut registry = SeasonRegistry::from_roster(&nicks, tie_break)
        .map_err(|err| anyhow!("invalid roster: {err}"))?;
    info!(pilots = registry.len(), roster = %args.roster.display(), "loaded roster");

    let mut source = DirectoryEventSource::scan(&args.events)?;
    let mut sink = CsvStandingsSink::new(&args.output);
    let report = run_season(&mut registry, &mut source, &rules, &mut sink)
        .map_err(|err| anyhow!("classification aborted: {err}"))?;

    info!(
        processed = report.processed.len(),
        skipped = report.skipped.len(),
        output = %args.output.display(),
        "classification written"
    );
    Ok(report)
}

/// Reads rules from a JSON file, or the defaults when no file is given.
///
/// # Errors
/// Returns an error when the file is unreadable or holds invalid rules.
pub fn load_rules(path: Option<&Path>) -> Result<ClassificationRules> {
    let Some(path) = path else {
        return Ok(ClassificationRules::v1());
    };
    let body = fs::read_to_string(path)
        .with_context(|| format!("failed to read rules {}", path.display()))?;
    let value: serde_json::Value = serde_json::from_str(&body)
        .with_context(|| format!("rules file must be valid JSON: {}", path.display()))?;
    ClassificationRules::from_json(&value).map_err(|err| anyhow!("{}: {err}", path.display()))
}

fn map_position_scope(value: PositionScopeArg) -> PositionScope {
    match value {
        PositionScopeArg::PerHeat => PositionScope::PerHeat,
        PositionScopeArg::Class => PositionScope::Class,
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
struct StandingsRow<'a> {
    nick: &'a str,
    points: u32,
    won_races: u32,
    consecutive_3_fastest_laps: u32,
    position_accumulator: u32,
    completed_laps: u32,
    fastest_race: u32,
    fastest_laps: u32,
    tie_break_random: f64,
}

impl<'a> From<&'a PilotSeasonRecord> for StandingsRow<'a> {
    fn from(record: &'a PilotSeasonRecord) -> Self {
        Self {
            nick: &record.nick,
            points: record.points,
            won_races: record.won_races,
            consecutive_3_fastest_laps: record.fastest_3lap_windows,
            position_accumulator: record.position_accumulator,
            completed_laps: record.completed_laps,
            fastest_race: record.fastest_race_count,
            fastest_laps: record.fastest_lap_count,
            tie_break_random: record.tie_break_random,
        }
    }
}

/// Writes the classification as CSV, one row per pilot in standings order.
#[derive(Debug, Clone)]
pub struct CsvStandingsSink {
    path: PathBuf,
}

impl CsvStandingsSink {
    #[must_use]
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    fn write(&self, standings: &[PilotSeasonRecord]) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let mut writer = csv::Writer::from_path(&self.path)
            .with_context(|| format!("failed to create {}", self.path.display()))?;
        for record in standings {
            writer
                .serialize(StandingsRow::from(record))
                .with_context(|| format!("failed to write row for {}", record.nick))?;
        }
        writer.flush().context("failed to flush classification")?;
        Ok(())
    }
}

impl StandingsSink for CsvStandingsSink {
    fn publish(&mut self, standings: &[PilotSeasonRecord]) -> Result<(), StandingsError> {
        self.write(standings)
            .map_err(|err| StandingsError::Sink(format!("{err:#}")))
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StandingsJsonPayload {
    contract_version: String,
    generated_at: String,
    events_processed: Vec<String>,
    events_skipped: Vec<SkippedEvent>,
    standings: Vec<PilotSeasonRecord>,
}

fn build_standings_json_payload(
    report: &SeasonReport,
    generated_at: OffsetDateTime,
) -> Result<StandingsJsonPayload> {
    Ok(StandingsJsonPayload {
        contract_version: REPORT_CONTRACT_VERSION.to_string(),
        generated_at: format_rfc3339(generated_at)?,
        events_processed: report
            .processed
            .iter()
            .map(|summary| summary.event.clone())
            .collect(),
        events_skipped: report.skipped.clone(),
        standings: report.standings.clone(),
    })
}

fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

fn format_rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn print_points_listing(records: &[PilotSeasonRecord]) {
    println!("Before tie-breakers:");
    for record in records {
        println!("  {:<24} {:>4}", record.nick, record.points);
    }
    println!();
}

fn print_standings_table(records: &[PilotSeasonRecord]) {
    println!(
        "{:<4} {:<24} {:>6} {:>4} {:>6} {:>8} {:>6} {:>6} {:>6} {:>8}",
        "pos", "nick", "points", "wins", "3-lap", "pos_sum", "laps", "f_race", "f_lap", "coin"
    );
    println!("{}", "-".repeat(92));
    for (index, record) in records.iter().enumerate() {
        println!(
            "{:<4} {:<24} {:>6} {:>4} {:>6} {:>8} {:>6} {:>6} {:>6} {:>8.4}",
            index + 1,
            record.nick,
            record.points,
            record.won_races,
            record.fastest_3lap_windows,
            record.position_accumulator,
            record.completed_laps,
            record.fastest_race_count,
            record.fastest_lap_count,
            record.tie_break_random
        );
    }
}
