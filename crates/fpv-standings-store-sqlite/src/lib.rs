#![allow(clippy::missing_errors_doc)]

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use fpv_standings_core::{
    natural_cmp, EventRecords, EventSource, LapSample, PilotEntry, PilotId, RaceClass, RaceId,
    RaceMeta, RaceParticipant, SourcedEvent, StandingsError,
};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use tracing::{debug, info, warn};

const DATABASE_EXTENSIONS: [&str; 4] = ["db", "sqlite", "sqlite3", "db3"];

const REQUIRED_COLUMNS: [(&str, &[&str]); 5] = [
    ("pilot", &["id", "callsign", "name"]),
    ("race_class", &["id", "name"]),
    ("saved_race_meta", &["id", "heat_id", "class_id"]),
    ("saved_pilot_race", &["id", "race_id", "pilot_id"]),
    (
        "saved_race_lap",
        &[
            "id",
            "race_id",
            "pilot_id",
            "lap_time_stamp",
            "lap_time",
            "lap_time_formatted",
            "deleted",
        ],
    ),
];

const SCHEMA_EVENT_V1: &str = r"
CREATE TABLE IF NOT EXISTS pilot (
  id INTEGER PRIMARY KEY,
  callsign TEXT NOT NULL,
  name TEXT NOT NULL DEFAULT ''
);

CREATE TABLE IF NOT EXISTS race_class (
  id INTEGER PRIMARY KEY,
  name TEXT
);

CREATE TABLE IF NOT EXISTS saved_race_meta (
  id INTEGER PRIMARY KEY,
  round_id INTEGER NOT NULL DEFAULT 1,
  heat_id INTEGER NOT NULL,
  class_id INTEGER
);

CREATE TABLE IF NOT EXISTS saved_pilot_race (
  id INTEGER PRIMARY KEY,
  race_id INTEGER NOT NULL,
  node_index INTEGER NOT NULL DEFAULT 0,
  pilot_id INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS saved_race_lap (
  id INTEGER PRIMARY KEY,
  race_id INTEGER NOT NULL,
  pilotrace_id INTEGER,
  pilot_id INTEGER NOT NULL,
  lap_time_stamp REAL NOT NULL,
  lap_time REAL,
  lap_time_formatted TEXT,
  deleted INTEGER NOT NULL DEFAULT 0
);
";

/// Read-only view over one event database.
pub struct SqliteEventStore {
    event: String,
    conn: Connection,
}

impl SqliteEventStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch("PRAGMA busy_timeout = 5000;")
            .context("failed to configure sqlite pragmas")?;

        Ok(Self {
            event: event_name(path),
            conn,
        })
    }

    #[must_use]
    pub fn from_connection(event: &str, conn: Connection) -> Self {
        Self {
            event: event.to_string(),
            conn,
        }
    }

    #[must_use]
    pub fn event(&self) -> &str {
        &self.event
    }

    /// Fails when any table or column the classification reads is missing.
    pub fn check_schema(&self) -> Result<()> {
        for (table_name, columns) in REQUIRED_COLUMNS {
            if !table_exists(&self.conn, table_name)? {
                return Err(anyhow!(
                    "event schema check failed: expected table {table_name}"
                ));
            }
            ensure_table_has_columns(&self.conn, table_name, columns)?;
        }
        Ok(())
    }

    pub fn load(&self) -> Result<EventRecords> {
        Ok(EventRecords {
            event: self.event.clone(),
            pilots: self.list_pilots()?,
            classes: self.list_classes()?,
            races: self.list_races()?,
            participants: self.list_participants()?,
            laps: self.list_laps()?,
        })
    }

    pub fn list_pilots(&self) -> Result<Vec<PilotEntry>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, callsign, name FROM pilot ORDER BY id ASC")?;
        let rows = stmt.query_map([], |row| {
            Ok(PilotEntry {
                id: PilotId(row.get(0)?),
                callsign: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                name: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
            })
        })?;
        collect_rows(rows).context("failed to read pilot table")
    }

    pub fn list_classes(&self) -> Result<Vec<RaceClass>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name FROM race_class ORDER BY id ASC")?;
        let rows = stmt.query_map([], |row| {
            Ok(RaceClass {
                id: row.get(0)?,
                name: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
            })
        })?;
        collect_rows(rows).context("failed to read race_class table")
    }

    pub fn list_races(&self) -> Result<Vec<RaceMeta>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, heat_id, class_id FROM saved_race_meta ORDER BY id ASC")?;
        let rows = stmt.query_map([], |row| {
            Ok(RaceMeta {
                race_id: RaceId(row.get(0)?),
                heat_id: row.get(1)?,
                class_id: row.get::<_, Option<i64>>(2)?.unwrap_or(0),
            })
        })?;
        collect_rows(rows).context("failed to read saved_race_meta table")
    }

    pub fn list_participants(&self) -> Result<Vec<RaceParticipant>> {
        let mut stmt = self
            .conn
            .prepare("SELECT race_id, pilot_id FROM saved_pilot_race ORDER BY id ASC")?;
        let rows = stmt.query_map([], |row| {
            Ok(RaceParticipant {
                race_id: RaceId(row.get(0)?),
                pilot_id: PilotId(row.get(1)?),
            })
        })?;
        collect_rows(rows).context("failed to read saved_pilot_race table")
    }

    pub fn list_laps(&self) -> Result<Vec<LapSample>> {
        let mut stmt = self.conn.prepare(
            "SELECT pilot_id, race_id, lap_time, lap_time_formatted, lap_time_stamp, deleted
             FROM saved_race_lap
             ORDER BY id ASC",
        )?;
        let rows = stmt.query_map([], parse_lap_row)?;
        collect_rows(rows).context("failed to read saved_race_lap table")
    }
}

fn parse_lap_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<LapSample> {
    let deleted: Option<i64> = row.get(5)?;
    Ok(LapSample {
        pilot_id: PilotId(row.get(0)?),
        race_id: RaceId(row.get(1)?),
        lap_time_ms: row.get(2)?,
        lap_time_formatted: row.get(3)?,
        stamp: row.get::<_, Option<f64>>(4)?.unwrap_or(0.0),
        // Only an explicit 0 marks a live lap.
        deleted: deleted != Some(0),
    })
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT 1
             FROM sqlite_master
             WHERE type = 'table' AND name = ?1
             LIMIT 1",
            params![table_name],
            |_| Ok(()),
        )
        .optional()
        .context("failed to query sqlite_master")?
        .is_some();

    Ok(exists)
}

fn ensure_table_has_columns(conn: &Connection, table_name: &str, columns: &[&str]) -> Result<()> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table_name})"))
        .with_context(|| format!("failed to inspect table_info for {table_name}"))?;
    let mut rows = stmt.query([])?;

    let mut available = Vec::new();
    while let Some(row) = rows.next()? {
        available.push(row.get::<_, String>(1)?);
    }

    for required in columns {
        if !available.iter().any(|candidate| candidate == required) {
            return Err(anyhow!(
                "event schema check failed: missing column {table_name}.{required}"
            ));
        }
    }

    Ok(())
}

#[must_use]
pub fn event_name(path: &Path) -> String {
    path.file_name().map_or_else(
        || path.display().to_string(),
        |name| name.to_string_lossy().into_owned(),
    )
}

#[must_use]
pub fn looks_like_database(file_name: &str) -> bool {
    Path::new(file_name)
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            DATABASE_EXTENSIONS
                .iter()
                .any(|candidate| ext.eq_ignore_ascii_case(candidate))
        })
}

/// Event databases from one folder, yielded in natural file-name order.
#[derive(Debug, Clone, Default)]
pub struct DirectoryEventSource {
    pending: VecDeque<PathBuf>,
}

impl DirectoryEventSource {
    pub fn scan(dir: &Path) -> Result<Self> {
        let entries = std::fs::read_dir(dir)
            .with_context(|| format!("failed to list event folder {}", dir.display()))?;

        let mut paths = Vec::new();
        for entry in entries {
            let entry = entry.with_context(|| format!("failed to read {}", dir.display()))?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let name = event_name(&path);
            if looks_like_database(&name) {
                paths.push(path);
            } else {
                debug!(file = %name, "ignoring non-database file");
            }
        }

        paths.sort_by(|lhs, rhs| natural_cmp(&event_name(lhs), &event_name(rhs)));
        info!(folder = %dir.display(), events = paths.len(), "found event databases");

        Ok(Self {
            pending: paths.into(),
        })
    }

    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        self.pending.iter().map(PathBuf::as_path)
    }
}

impl EventSource for DirectoryEventSource {
    fn next_event(&mut self) -> Result<Option<SourcedEvent>, StandingsError> {
        let Some(path) = self.pending.pop_front() else {
            return Ok(None);
        };
        let event = event_name(&path);

        let opened = SqliteEventStore::open(&path)
            .and_then(|store| store.check_schema().map(|()| store));
        let store = match opened {
            Ok(store) => store,
            Err(err) => {
                let reason = format!("{err:#}");
                warn!(event = %event, %reason, "not a usable event database");
                return Ok(Some(SourcedEvent::Skipped { event, reason }));
            }
        };

        let records = store
            .load()
            .map_err(|err| StandingsError::Source(format!("{event}: {err:#}")))?;
        info!(
            event = %event,
            path = %path.display(),
            pilots = records.pilots.len(),
            laps = records.laps.len(),
            "loaded event database"
        );
        Ok(Some(SourcedEvent::Loaded(records)))
    }
}

/// Creates the event tables on an empty database, for fixtures and tooling.
pub fn seed_event_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA_EVENT_V1)
        .context("failed to create event schema")
}
