//! Season classification engine for an FPV racing league.
//!
//! Per-event lap data flows in through an [`EventSource`], is reduced to an
//! [`EventSummary`] by [`summarize_event`], folded into a [`SeasonRegistry`]
//! and finally ordered by [`rank_standings`] before being handed to a
//! [`StandingsSink`]. [`run_season`] drives the whole pass.

use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};
use ulid::Ulid;

pub const RANK_POINTS_V1: [u32; 30] = [
    25, 20, 18, 16, 15, 14, 13, 12, 11, 10, 9, 8, 7, 6, 5, 4, 3, 2, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1,
    1,
];

pub const STAGE_RACE_POINTS: &str = "race points";
pub const STAGE_FASTEST_LAP: &str = "fastest lap";
pub const STAGE_FASTEST_RACE: &str = "fastest race";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum StandingsError {
    #[error("event {event}: pilot {nick:?} is not in the season roster")]
    MissingRosterEntry { event: String, nick: String },
    #[error("event {event}: pilot id {pilot_id} has no entry in the pilot table")]
    UnknownPilotId { event: String, pilot_id: PilotId },
    #[error("event {event}: stage {stage:?} produced no rows")]
    EmptyResultSet { event: String, stage: String },
    #[error("event {event}: position {position} exceeds the {table_len}-entry points table")]
    PositionOutOfTable {
        event: String,
        position: usize,
        table_len: usize,
    },
    #[error("validation error: {0}")]
    Validation(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("event source error: {0}")]
    Source(String),
    #[error("standings sink error: {0}")]
    Sink(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct PilotId(pub i64);

impl Display for PilotId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One saved race run. Lap-level statistics treat it as the heat identity.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct RaceId(pub i64);

impl Display for RaceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PilotEntry {
    pub id: PilotId,
    pub callsign: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RaceClass {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RaceMeta {
    pub race_id: RaceId,
    pub heat_id: i64,
    pub class_id: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RaceParticipant {
    pub race_id: RaceId,
    pub pilot_id: PilotId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LapSample {
    pub pilot_id: PilotId,
    pub race_id: RaceId,
    pub lap_time_ms: Option<f64>,
    pub lap_time_formatted: Option<String>,
    pub stamp: f64,
    pub deleted: bool,
}

impl LapSample {
    /// A missing lap time contributes nothing.
    #[must_use]
    pub fn duration_ms(&self) -> f64 {
        self.lap_time_ms.unwrap_or(0.0)
    }
}

/// Everything one event database contributes to the season.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EventRecords {
    pub event: String,
    pub pilots: Vec<PilotEntry>,
    pub classes: Vec<RaceClass>,
    pub races: Vec<RaceMeta>,
    pub participants: Vec<RaceParticipant>,
    pub laps: Vec<LapSample>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum PositionScope {
    PerHeat,
    Class,
}

impl PositionScope {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PerHeat => "per_heat",
            Self::Class => "class",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "per_heat" => Some(Self::PerHeat),
            "class" => Some(Self::Class),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClassificationRules {
    pub ruleset_version: u32,
    pub rank_points: Vec<u32>,
    pub window_laps: usize,
    pub position_scope: PositionScope,
}

impl ClassificationRules {
    #[must_use]
    pub fn v1() -> Self {
        Self {
            ruleset_version: 1,
            rank_points: RANK_POINTS_V1.to_vec(),
            window_laps: 3,
            position_scope: PositionScope::PerHeat,
        }
    }

    /// Validates the points table and window size.
    ///
    /// # Errors
    /// Returns [`StandingsError::Configuration`] when the ruleset version is
    /// zero, the points table is empty or increasing, or the window is empty.
    pub fn validate(&self) -> Result<(), StandingsError> {
        if self.ruleset_version == 0 {
            return Err(StandingsError::Configuration(
                "ruleset_version MUST be >= 1".to_string(),
            ));
        }

        if self.rank_points.is_empty() {
            return Err(StandingsError::Configuration(
                "rank_points MUST contain at least one entry".to_string(),
            ));
        }

        if self.rank_points.windows(2).any(|pair| pair[1] > pair[0]) {
            return Err(StandingsError::Configuration(
                "rank_points MUST be non-increasing".to_string(),
            ));
        }

        if self.window_laps == 0 {
            return Err(StandingsError::Configuration(
                "window_laps MUST be >= 1".to_string(),
            ));
        }

        Ok(())
    }

    /// Points for a 1-based finishing position.
    ///
    /// # Errors
    /// Returns [`StandingsError::PositionOutOfTable`] for positions past the
    /// end of the table (and for position 0).
    pub fn points_for(&self, event: &str, position: usize) -> Result<u32, StandingsError> {
        position
            .checked_sub(1)
            .and_then(|index| self.rank_points.get(index))
            .copied()
            .ok_or_else(|| StandingsError::PositionOutOfTable {
                event: event.to_string(),
                position,
                table_len: self.rank_points.len(),
            })
    }

    /// Decodes and validates rules from JSON.
    ///
    /// # Errors
    /// Returns [`StandingsError::Configuration`] when decoding fails or the
    /// decoded rules are invalid.
    pub fn from_json(value: &Value) -> Result<Self, StandingsError> {
        let rules: Self = serde_json::from_value(value.clone()).map_err(|err| {
            StandingsError::Configuration(format!("invalid rules JSON payload: {err}"))
        })?;
        rules.validate()?;
        Ok(rules)
    }
}

/// `f64` ordered with `total_cmp`, usable inside sort keys.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FloatKey(pub f64);

impl PartialEq for FloatKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for FloatKey {}

impl PartialOrd for FloatKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FloatKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

/// Lap count and summed time for one pilot, the unit both heat ranking and
/// the fastest-race award order by.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct RaceTotals {
    pub pilot_id: PilotId,
    pub lap_count: usize,
    pub total_ms: f64,
}

/// Orders pilots best-first: more laps, then less time. Exact ties keep their
/// input order.
#[must_use]
pub fn rank_heat(mut entries: Vec<RaceTotals>) -> Vec<RaceTotals> {
    entries.sort_by_key(|entry| (Reverse(entry.lap_count), FloatKey(entry.total_ms)));
    entries
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct WindowHit {
    pub total_ms: f64,
    /// Index of the window's first lap, counted after the start-line pass.
    pub offset: usize,
}

/// Finds the fastest run of `window_laps` consecutive laps.
///
/// `durations` is one pilot's run in sequence order, start-line pass first.
/// The pass is dropped before windowing; runs too short for a full window
/// have no candidate.
#[must_use]
pub fn fastest_window(durations: &[f64], window_laps: usize) -> Option<WindowHit> {
    if window_laps == 0 || durations.len() < 2 {
        return None;
    }

    let racing_laps = &durations[1..];
    if racing_laps.len() < window_laps {
        return None;
    }

    racing_laps
        .windows(window_laps)
        .map(|window| window.iter().sum::<f64>())
        .enumerate()
        .min_by_key(|(offset, total)| (FloatKey(*total), *offset))
        .map(|(offset, total_ms)| WindowHit { total_ms, offset })
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HeatPlacing {
    pub position: usize,
    pub pilot_id: PilotId,
    pub nick: String,
    pub lap_count: usize,
    pub total_ms: f64,
    pub points: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HeatResult {
    pub heat_id: i64,
    pub race_id: RaceId,
    pub placings: Vec<HeatPlacing>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LapCount {
    pub pilot_id: PilotId,
    pub nick: String,
    pub completed_laps: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FastestLap {
    pub pilot_id: PilotId,
    pub nick: String,
    pub race_id: RaceId,
    pub lap_time_ms: f64,
    pub lap_time_formatted: Option<String>,
    pub stamp: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FastestRace {
    pub pilot_id: PilotId,
    pub nick: String,
    pub lap_count: usize,
    pub total_ms: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FastestWindow {
    pub pilot_id: PilotId,
    pub nick: String,
    pub race_id: RaceId,
    pub total_ms: f64,
    pub first_stamp: f64,
}

/// Per-event outcome, computed without touching the season registry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventSummary {
    pub event: String,
    pub points_class: RaceClass,
    pub heats: Vec<HeatResult>,
    pub completed_laps: Vec<LapCount>,
    pub fastest_lap: FastestLap,
    pub fastest_race: FastestRace,
    /// Each pilot's best window in the event, best first.
    pub window_bests: Vec<FastestWindow>,
    pub fastest_window: Option<FastestWindow>,
}

/// Non-deleted laps keyed by run, each run sorted by sequence marker.
type Runs<'a> = BTreeMap<(RaceId, PilotId), Vec<&'a LapSample>>;

fn group_runs(laps: &[LapSample]) -> Runs<'_> {
    let mut runs: Runs<'_> = BTreeMap::new();
    for lap in laps.iter().filter(|lap| !lap.deleted) {
        runs.entry((lap.race_id, lap.pilot_id)).or_default().push(lap);
    }
    for run in runs.values_mut() {
        run.sort_by(|lhs, rhs| lhs.stamp.total_cmp(&rhs.stamp));
    }
    runs
}

struct PilotDirectory<'a> {
    event: &'a str,
    callsigns: BTreeMap<PilotId, &'a str>,
}

impl<'a> PilotDirectory<'a> {
    fn new(records: &'a EventRecords) -> Self {
        Self {
            event: &records.event,
            callsigns: records
                .pilots
                .iter()
                .map(|pilot| (pilot.id, pilot.callsign.as_str()))
                .collect(),
        }
    }

    fn nick(&self, pilot_id: PilotId) -> Result<String, StandingsError> {
        self.callsigns
            .get(&pilot_id)
            .map(|nick| (*nick).to_string())
            .ok_or_else(|| StandingsError::UnknownPilotId {
                event: self.event.to_string(),
                pilot_id,
            })
    }
}

/// Computes every per-event statistic in the fixed stage order: race points,
/// completed laps, fastest lap, fastest race, fastest lap window.
///
/// # Errors
/// Returns [`StandingsError::EmptyResultSet`] when the event has no race
/// class, no countable lap or no lap at all,
/// [`StandingsError::UnknownPilotId`] for laps or participants that do not
/// resolve to a pilot, and [`StandingsError::PositionOutOfTable`] when a
/// placing runs past the points table.
pub fn summarize_event(
    records: &EventRecords,
    rules: &ClassificationRules,
) -> Result<EventSummary, StandingsError> {
    let directory = PilotDirectory::new(records);
    let runs = group_runs(&records.laps);

    let (points_class, heats) = compute_race_points(records, &directory, rules)?;
    let completed_laps = compute_completed_laps(&runs, &directory)?;
    let fastest_lap = compute_fastest_lap(&runs, &directory)?;
    let fastest_race = compute_fastest_race(&runs, &directory)?;
    let window_bests = compute_window_bests(&runs, &directory, rules.window_laps)?;
    let fastest_window = window_bests.first().cloned();

    Ok(EventSummary {
        event: records.event.clone(),
        points_class,
        heats,
        completed_laps,
        fastest_lap,
        fastest_race,
        window_bests,
        fastest_window,
    })
}

fn compute_race_points(
    records: &EventRecords,
    directory: &PilotDirectory<'_>,
    rules: &ClassificationRules,
) -> Result<(RaceClass, Vec<HeatResult>), StandingsError> {
    let points_class = records
        .classes
        .iter()
        .max_by_key(|class| class.id)
        .cloned()
        .ok_or_else(|| StandingsError::EmptyResultSet {
            event: records.event.clone(),
            stage: STAGE_RACE_POINTS.to_string(),
        })?;

    // Highest heat first; a heat recorded more than once counts its first race.
    let mut heat_races: BTreeMap<Reverse<i64>, RaceId> = BTreeMap::new();
    for meta in records
        .races
        .iter()
        .filter(|meta| meta.class_id == points_class.id)
    {
        heat_races
            .entry(Reverse(meta.heat_id))
            .and_modify(|race_id| *race_id = (*race_id).min(meta.race_id))
            .or_insert(meta.race_id);
    }

    let mut position = 0_usize;
    let mut heats = Vec::with_capacity(heat_races.len());
    for (Reverse(heat_id), race_id) in heat_races {
        if rules.position_scope == PositionScope::PerHeat {
            position = 0;
        }

        // Repeated participation rows place a pilot once, at the first row.
        let mut entered = BTreeSet::new();
        let totals = records
            .participants
            .iter()
            .filter(|participant| {
                participant.race_id == race_id && entered.insert(participant.pilot_id)
            })
            .map(|participant| {
                let (lap_count, total_ms) = records
                    .laps
                    .iter()
                    .filter(|lap| {
                        !lap.deleted
                            && lap.race_id == race_id
                            && lap.pilot_id == participant.pilot_id
                    })
                    .fold((0_usize, 0.0_f64), |(count, total), lap| {
                        (count + 1, total + lap.duration_ms())
                    });
                RaceTotals {
                    pilot_id: participant.pilot_id,
                    lap_count,
                    total_ms,
                }
            })
            .collect::<Vec<_>>();

        let mut placings = Vec::with_capacity(totals.len());
        for entry in rank_heat(totals) {
            position += 1;
            placings.push(HeatPlacing {
                position,
                pilot_id: entry.pilot_id,
                nick: directory.nick(entry.pilot_id)?,
                lap_count: entry.lap_count,
                total_ms: entry.total_ms,
                points: rules.points_for(&records.event, position)?,
            });
        }

        heats.push(HeatResult {
            heat_id,
            race_id,
            placings,
        });
    }

    Ok((points_class, heats))
}

fn compute_completed_laps(
    runs: &Runs<'_>,
    directory: &PilotDirectory<'_>,
) -> Result<Vec<LapCount>, StandingsError> {
    let mut per_pilot: BTreeMap<PilotId, usize> = BTreeMap::new();
    for ((_, pilot_id), run) in runs {
        let counted = run.len().saturating_sub(1);
        if counted > 0 {
            *per_pilot.entry(*pilot_id).or_default() += counted;
        }
    }

    let mut counts = per_pilot
        .into_iter()
        .map(|(pilot_id, completed_laps)| -> Result<LapCount, StandingsError> {
            Ok(LapCount {
                pilot_id,
                nick: directory.nick(pilot_id)?,
                completed_laps,
            })
        })
        .collect::<Result<Vec<_>, StandingsError>>()?;
    counts.sort_by_key(|count| Reverse(count.completed_laps));
    Ok(counts)
}

fn compute_fastest_lap(
    runs: &Runs<'_>,
    directory: &PilotDirectory<'_>,
) -> Result<FastestLap, StandingsError> {
    let best = runs
        .values()
        .flat_map(|run| run.iter().skip(1))
        .min_by_key(|lap| {
            (
                FloatKey(lap.duration_ms()),
                lap.race_id,
                FloatKey(lap.stamp),
                lap.pilot_id,
            )
        })
        .ok_or_else(|| StandingsError::EmptyResultSet {
            event: directory.event.to_string(),
            stage: STAGE_FASTEST_LAP.to_string(),
        })?;

    Ok(FastestLap {
        pilot_id: best.pilot_id,
        nick: directory.nick(best.pilot_id)?,
        race_id: best.race_id,
        lap_time_ms: best.duration_ms(),
        lap_time_formatted: best.lap_time_formatted.clone(),
        stamp: best.stamp,
    })
}

fn compute_fastest_race(
    runs: &Runs<'_>,
    directory: &PilotDirectory<'_>,
) -> Result<FastestRace, StandingsError> {
    let mut per_pilot: BTreeMap<PilotId, RaceTotals> = BTreeMap::new();
    for ((_, pilot_id), run) in runs {
        let totals = per_pilot.entry(*pilot_id).or_insert(RaceTotals {
            pilot_id: *pilot_id,
            lap_count: 0,
            total_ms: 0.0,
        });
        totals.lap_count += run.len();
        totals.total_ms += run.iter().map(|lap| lap.duration_ms()).sum::<f64>();
    }

    let best = rank_heat(per_pilot.into_values().collect())
        .into_iter()
        .next()
        .ok_or_else(|| StandingsError::EmptyResultSet {
            event: directory.event.to_string(),
            stage: STAGE_FASTEST_RACE.to_string(),
        })?;

    Ok(FastestRace {
        pilot_id: best.pilot_id,
        nick: directory.nick(best.pilot_id)?,
        lap_count: best.lap_count,
        total_ms: best.total_ms,
    })
}

fn window_order(window: &FastestWindow) -> (FloatKey, RaceId, FloatKey, PilotId) {
    (
        FloatKey(window.total_ms),
        window.race_id,
        FloatKey(window.first_stamp),
        window.pilot_id,
    )
}

fn compute_window_bests(
    runs: &Runs<'_>,
    directory: &PilotDirectory<'_>,
    window_laps: usize,
) -> Result<Vec<FastestWindow>, StandingsError> {
    let mut per_pilot: BTreeMap<PilotId, FastestWindow> = BTreeMap::new();
    for ((race_id, pilot_id), run) in runs {
        let durations = run.iter().map(|lap| lap.duration_ms()).collect::<Vec<_>>();
        let Some(hit) = fastest_window(&durations, window_laps) else {
            continue;
        };

        let candidate = FastestWindow {
            pilot_id: *pilot_id,
            nick: directory.nick(*pilot_id)?,
            race_id: *race_id,
            total_ms: hit.total_ms,
            first_stamp: run[hit.offset + 1].stamp,
        };

        let improves = per_pilot
            .get(pilot_id)
            .map_or(true, |current| window_order(&candidate) < window_order(current));
        if improves {
            per_pilot.insert(*pilot_id, candidate);
        }
    }

    let mut bests = per_pilot.into_values().collect::<Vec<_>>();
    bests.sort_by_key(window_order);
    Ok(bests)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PilotSeasonRecord {
    pub nick: String,
    pub points: u32,
    pub won_races: u32,
    pub fastest_3lap_windows: u32,
    pub position_accumulator: u32,
    /// Lap count from the most recent event the pilot completed laps in.
    pub completed_laps: u32,
    pub fastest_race_count: u32,
    pub fastest_lap_count: u32,
    pub tie_break_random: f64,
}

impl PilotSeasonRecord {
    #[must_use]
    pub fn new(nick: &str, tie_break_random: f64) -> Self {
        Self {
            nick: nick.to_string(),
            points: 0,
            won_races: 0,
            fastest_3lap_windows: 0,
            position_accumulator: 0,
            completed_laps: 0,
            fastest_race_count: 0,
            fastest_lap_count: 0,
            tie_break_random,
        }
    }
}

/// Where the final tie-break values come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TieBreakSource {
    Entropy,
    Seeded(u64),
}

impl TieBreakSource {
    /// Draws a value in `[0, 1)`.
    #[must_use]
    pub fn draw(self, nick: &str) -> f64 {
        match self {
            Self::Entropy => {
                // 80 random bits per ULID; keep the top 53.
                let random = Ulid::new().random();
                #[allow(clippy::cast_possible_truncation)]
                let bits = (random >> 27) as u64;
                unit_interval(bits)
            }
            Self::Seeded(seed) => unit_interval(fnv1a(&format!("{seed}:{nick}")) >> 11),
        }
    }
}

fn fnv1a(input: &str) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in input.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash
}

#[allow(clippy::cast_precision_loss)]
fn unit_interval(bits53: u64) -> f64 {
    (bits53 & ((1_u64 << 53) - 1)) as f64 / (1_u64 << 53) as f64
}

/// Parses a newline-delimited roster, one display name per line.
///
/// # Errors
/// Returns [`StandingsError::Validation`] when a name is listed twice.
pub fn parse_roster(text: &str) -> Result<Vec<String>, StandingsError> {
    let mut nicks: Vec<String> = Vec::new();
    for line in text.lines() {
        let nick = line.trim_end();
        if nick.trim().is_empty() {
            continue;
        }
        if nicks.iter().any(|existing| existing == nick) {
            return Err(StandingsError::Validation(format!(
                "roster lists pilot {nick:?} more than once"
            )));
        }
        nicks.push(nick.to_string());
    }
    Ok(nicks)
}

/// Season-long totals for every rostered pilot, in roster order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SeasonRegistry {
    records: Vec<PilotSeasonRecord>,
    index: BTreeMap<String, usize>,
}

impl SeasonRegistry {
    /// Seeds one record per roster name, drawing each tie-break value once.
    ///
    /// # Errors
    /// Returns [`StandingsError::Validation`] for empty or duplicate names.
    pub fn from_roster<I, S>(nicks: I, tie_break: TieBreakSource) -> Result<Self, StandingsError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut registry = Self::default();
        for nick in nicks {
            let nick = nick.as_ref();
            if nick.trim().is_empty() {
                return Err(StandingsError::Validation(
                    "roster entries MUST be non-empty".to_string(),
                ));
            }
            if registry.index.contains_key(nick) {
                return Err(StandingsError::Validation(format!(
                    "roster lists pilot {nick:?} more than once"
                )));
            }
            registry
                .index
                .insert(nick.to_string(), registry.records.len());
            registry
                .records
                .push(PilotSeasonRecord::new(nick, tie_break.draw(nick)));
        }
        Ok(registry)
    }

    #[must_use]
    pub fn get(&self, nick: &str) -> Option<&PilotSeasonRecord> {
        self.index.get(nick).map(|slot| &self.records[*slot])
    }

    #[must_use]
    pub fn records(&self) -> &[PilotSeasonRecord] {
        &self.records
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn slot(&self, event: &str, nick: &str) -> Result<usize, StandingsError> {
        self.index
            .get(nick)
            .copied()
            .ok_or_else(|| StandingsError::MissingRosterEntry {
                event: event.to_string(),
                nick: nick.to_string(),
            })
    }

    /// Folds one event into the season totals. Either every update applies
    /// or none does.
    ///
    /// # Errors
    /// Returns [`StandingsError::MissingRosterEntry`] when the event names a
    /// pilot outside the roster.
    pub fn apply_event(&mut self, summary: &EventSummary) -> Result<(), StandingsError> {
        let event = summary.event.as_str();
        let referenced = summary
            .heats
            .iter()
            .flat_map(|heat| heat.placings.iter().map(|placing| placing.nick.as_str()))
            .chain(summary.completed_laps.iter().map(|count| count.nick.as_str()))
            .chain([
                summary.fastest_lap.nick.as_str(),
                summary.fastest_race.nick.as_str(),
            ])
            .chain(summary.fastest_window.iter().map(|window| window.nick.as_str()));
        for nick in referenced {
            self.slot(event, nick)?;
        }

        for placing in summary.heats.iter().flat_map(|heat| &heat.placings) {
            let slot = self.slot(event, &placing.nick)?;
            let record = &mut self.records[slot];
            if placing.position == 1 {
                record.won_races += 1;
            }
            record.position_accumulator += to_count(placing.position);
            record.points += placing.points;
        }

        for count in &summary.completed_laps {
            let slot = self.slot(event, &count.nick)?;
            self.records[slot].completed_laps = to_count(count.completed_laps);
        }

        let slot = self.slot(event, &summary.fastest_lap.nick)?;
        self.records[slot].fastest_lap_count += 1;

        let slot = self.slot(event, &summary.fastest_race.nick)?;
        self.records[slot].fastest_race_count += 1;

        if let Some(window) = &summary.fastest_window {
            let slot = self.slot(event, &window.nick)?;
            self.records[slot].fastest_3lap_windows += 1;
        }

        Ok(())
    }
}

fn to_count(value: usize) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

type StandingsKey = (
    Reverse<u32>,
    Reverse<u32>,
    Reverse<u32>,
    u32,
    Reverse<u32>,
    Reverse<u32>,
    Reverse<u32>,
    FloatKey,
);

fn standings_key(record: &PilotSeasonRecord) -> StandingsKey {
    (
        Reverse(record.points),
        Reverse(record.won_races),
        Reverse(record.fastest_3lap_windows),
        record.position_accumulator,
        Reverse(record.completed_laps),
        Reverse(record.fastest_race_count),
        Reverse(record.fastest_lap_count),
        FloatKey(record.tie_break_random),
    )
}

/// Final season order: points, wins, fastest windows, lower position sum,
/// completed laps, fastest races, fastest laps, then the tie-break value.
#[must_use]
pub fn standings_order(lhs: &PilotSeasonRecord, rhs: &PilotSeasonRecord) -> Ordering {
    standings_key(lhs).cmp(&standings_key(rhs))
}

#[must_use]
pub fn rank_standings(records: &[PilotSeasonRecord]) -> Vec<PilotSeasonRecord> {
    let mut ranked = records.to_vec();
    ranked.sort_by_key(standings_key);
    ranked
}

/// Points-only order, ties left in roster order.
#[must_use]
pub fn rank_by_points(records: &[PilotSeasonRecord]) -> Vec<PilotSeasonRecord> {
    let mut ranked = records.to_vec();
    ranked.sort_by_key(|record| Reverse(record.points));
    ranked
}

enum NaturalChunk<'a> {
    Text(&'a str),
    Number(&'a str),
}

fn natural_chunks(value: &str) -> Vec<NaturalChunk<'_>> {
    let mut chunks = Vec::new();
    let mut start = 0;
    let mut in_number = None;
    for (index, ch) in value.char_indices() {
        let is_digit = ch.is_ascii_digit();
        match in_number {
            Some(previous) if previous != is_digit => {
                let part = &value[start..index];
                chunks.push(if previous {
                    NaturalChunk::Number(part)
                } else {
                    NaturalChunk::Text(part)
                });
                start = index;
            }
            _ => {}
        }
        in_number = Some(is_digit);
    }
    if let Some(previous) = in_number {
        let part = &value[start..];
        chunks.push(if previous {
            NaturalChunk::Number(part)
        } else {
            NaturalChunk::Text(part)
        });
    }
    chunks
}

fn compare_numeric(lhs: &str, rhs: &str) -> Ordering {
    let lhs_trimmed = lhs.trim_start_matches('0');
    let rhs_trimmed = rhs.trim_start_matches('0');
    lhs_trimmed
        .len()
        .cmp(&rhs_trimmed.len())
        .then_with(|| lhs_trimmed.cmp(rhs_trimmed))
        .then_with(|| lhs.len().cmp(&rhs.len()))
}

/// Orders strings with embedded numbers by value, so `race2` sorts before
/// `race10`. Text runs compare case-insensitively; the raw strings settle
/// anything left so the order is total.
#[must_use]
pub fn natural_cmp(lhs: &str, rhs: &str) -> Ordering {
    let lhs_chunks = natural_chunks(lhs);
    let rhs_chunks = natural_chunks(rhs);

    for (left, right) in lhs_chunks.iter().zip(&rhs_chunks) {
        let ordering = match (left, right) {
            (NaturalChunk::Number(a), NaturalChunk::Number(b)) => compare_numeric(a, b),
            (NaturalChunk::Text(a), NaturalChunk::Text(b)) => {
                a.to_lowercase().cmp(&b.to_lowercase())
            }
            (NaturalChunk::Number(_), NaturalChunk::Text(_)) => Ordering::Less,
            (NaturalChunk::Text(_), NaturalChunk::Number(_)) => Ordering::Greater,
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }

    lhs_chunks
        .len()
        .cmp(&rhs_chunks.len())
        .then_with(|| lhs.cmp(rhs))
}

#[derive(Debug, Clone, PartialEq)]
pub enum SourcedEvent {
    Loaded(EventRecords),
    /// The input could not be read as an event database.
    Skipped { event: String, reason: String },
}

/// Supplies event record sets one at a time, in processing order.
pub trait EventSource {
    /// Returns the next event, or `None` once the season is exhausted.
    ///
    /// # Errors
    /// Returns [`StandingsError::Source`] when the source itself fails.
    fn next_event(&mut self) -> Result<Option<SourcedEvent>, StandingsError>;
}

/// Receives the final classification.
pub trait StandingsSink {
    /// # Errors
    /// Returns [`StandingsError::Sink`] when the standings cannot be persisted.
    fn publish(&mut self, standings: &[PilotSeasonRecord]) -> Result<(), StandingsError>;
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryEventSource {
    pending: VecDeque<SourcedEvent>,
}

impl MemoryEventSource {
    #[must_use]
    pub fn new(events: Vec<EventRecords>) -> Self {
        Self {
            pending: events.into_iter().map(SourcedEvent::Loaded).collect(),
        }
    }

    #[must_use]
    pub fn with_items(items: Vec<SourcedEvent>) -> Self {
        Self {
            pending: items.into(),
        }
    }
}

impl EventSource for MemoryEventSource {
    fn next_event(&mut self) -> Result<Option<SourcedEvent>, StandingsError> {
        Ok(self.pending.pop_front())
    }
}

impl StandingsSink for Vec<PilotSeasonRecord> {
    fn publish(&mut self, standings: &[PilotSeasonRecord]) -> Result<(), StandingsError> {
        self.clear();
        self.extend_from_slice(standings);
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SkippedEvent {
    pub event: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SeasonReport {
    pub processed: Vec<EventSummary>,
    pub skipped: Vec<SkippedEvent>,
    pub standings: Vec<PilotSeasonRecord>,
}

/// Processes every event in source order, then ranks and publishes the
/// standings. Nothing reaches the sink if any event fails.
///
/// # Errors
/// Returns the first source, event or sink error; skipped inputs are recorded
/// in the report instead.
pub fn run_season<S, K>(
    registry: &mut SeasonRegistry,
    source: &mut S,
    rules: &ClassificationRules,
    sink: &mut K,
) -> Result<SeasonReport, StandingsError>
where
    S: EventSource + ?Sized,
    K: StandingsSink + ?Sized,
{
    rules.validate()?;

    let mut processed = Vec::new();
    let mut skipped = Vec::new();
    while let Some(item) = source.next_event()? {
        match item {
            SourcedEvent::Loaded(records) => {
                let summary = summarize_event(&records, rules)?;
                trace_summary(&summary);
                registry.apply_event(&summary)?;
                processed.push(summary);
            }
            SourcedEvent::Skipped { event, reason } => {
                info!(event = %event, %reason, "skipping event");
                skipped.push(SkippedEvent { event, reason });
            }
        }
    }

    let standings = rank_standings(registry.records());
    sink.publish(&standings)?;

    Ok(SeasonReport {
        processed,
        skipped,
        standings,
    })
}

fn trace_summary(summary: &EventSummary) {
    info!(
        event = %summary.event,
        class = %summary.points_class.name,
        class_id = summary.points_class.id,
        "last race class"
    );
    for heat in &summary.heats {
        debug!(heat_id = heat.heat_id, race_id = %heat.race_id, "heat result");
        for placing in &heat.placings {
            debug!(
                position = placing.position,
                nick = %placing.nick,
                pilot_id = %placing.pilot_id,
                laps = placing.lap_count,
                points = placing.points,
                "placing"
            );
        }
    }
    for count in &summary.completed_laps {
        debug!(nick = %count.nick, laps = count.completed_laps, "completed laps");
    }
    info!(
        nick = %summary.fastest_lap.nick,
        race_id = %summary.fastest_lap.race_id,
        lap_ms = summary.fastest_lap.lap_time_ms,
        "fastest lap"
    );
    info!(
        nick = %summary.fastest_race.nick,
        laps = summary.fastest_race.lap_count,
        total_s = summary.fastest_race.total_ms / 1000.0,
        "fastest race"
    );
    match &summary.fastest_window {
        Some(window) => info!(
            nick = %window.nick,
            race_id = %window.race_id,
            total_ms = window.total_ms,
            "fastest consecutive laps"
        ),
        None => info!("no pilot completed enough laps for a consecutive window"),
    }
}
