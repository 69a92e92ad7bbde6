use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

use crate::classify::AlertStatus;

const DAY_NAMES: [&str; 7] = [
    "Sunday",
    "Monday",
    "Tuesday",
    "Wednesday",
    "Thursday",
    "Friday",
    "Saturday",
];

/// Sample handed to a store; the store assigns `id` and the derived columns.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewCrowdSample {
    pub place_id: String,
    pub place_name: String,
    pub count: u32,
    pub status: AlertStatus,
    /// Milliseconds since the Unix epoch.
    pub captured_at: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrowdSample {
    pub id: i64,
    pub place_id: String,
    pub place_name: String,
    pub count: u32,
    pub status: AlertStatus,
    pub captured_at: i64,
    /// `YYYY-MM-DD` (UTC) of `captured_at`.
    pub date: String,
    /// `Monday`..`Sunday` (UTC) of `captured_at`.
    pub day_of_week: String,
}

pub trait SampleStore: Send {
    fn insert(&mut self, sample: &NewCrowdSample) -> Result<CrowdSample>;

    /// All samples, oldest first.
    fn list(&mut self) -> Result<Vec<CrowdSample>>;
}

pub struct SqliteSampleStore {
    conn: Connection,
}

impl SqliteSampleStore {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)
            .with_context(|| format!("failed to open sample database {}", db_path))?;
        let mut store = Self { conn };
        store.ensure_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let mut store = Self {
            conn: Connection::open_in_memory()?,
        };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&mut self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS crowd_samples (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              place_id TEXT NOT NULL,
              place_name TEXT NOT NULL,
              count INTEGER NOT NULL,
              status TEXT NOT NULL CHECK (status IN ('Green', 'Yellow', 'Red')),
              captured_at INTEGER NOT NULL,
              date TEXT GENERATED ALWAYS AS (date(captured_at / 1000, 'unixepoch')) VIRTUAL,
              day_of_week TEXT GENERATED ALWAYS AS (
                CASE strftime('%w', captured_at / 1000, 'unixepoch')
                  WHEN '0' THEN 'Sunday'
                  WHEN '1' THEN 'Monday'
                  WHEN '2' THEN 'Tuesday'
                  WHEN '3' THEN 'Wednesday'
                  WHEN '4' THEN 'Thursday'
                  WHEN '5' THEN 'Friday'
                  ELSE 'Saturday'
                END
              ) VIRTUAL
            );

            CREATE INDEX IF NOT EXISTS idx_samples_captured ON crowd_samples(captured_at);
            "#,
        )?;
        Ok(())
    }

    fn read_row(row: &rusqlite::Row<'_>) -> Result<CrowdSample> {
        let status: String = row.get(4)?;
        Ok(CrowdSample {
            id: row.get(0)?,
            place_id: row.get(1)?,
            place_name: row.get(2)?,
            count: row.get(3)?,
            status: AlertStatus::parse(&status)
                .ok_or_else(|| anyhow!("corrupt sample: unknown status '{}'", status))?,
            captured_at: row.get(5)?,
            date: row.get(6)?,
            day_of_week: row.get(7)?,
        })
    }
}

const SELECT_COLUMNS: &str =
    "SELECT id, place_id, place_name, count, status, captured_at, date, day_of_week FROM crowd_samples";

impl SampleStore for SqliteSampleStore {
    fn insert(&mut self, sample: &NewCrowdSample) -> Result<CrowdSample> {
        self.conn.execute(
            r#"
            INSERT INTO crowd_samples(place_id, place_name, count, status, captured_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                sample.place_id,
                sample.place_name,
                sample.count,
                sample.status.as_str(),
                sample.captured_at
            ],
        )?;
        let id = self.conn.last_insert_rowid();

        let mut stmt = self
            .conn
            .prepare(&format!("{} WHERE id = ?1", SELECT_COLUMNS))?;
        let mut rows = stmt.query(params![id])?;
        let row = rows
            .next()?
            .ok_or_else(|| anyhow!("sample {} missing after insert", id))?;
        Self::read_row(row)
    }

    fn list(&mut self) -> Result<Vec<CrowdSample>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{} ORDER BY captured_at ASC, id ASC", SELECT_COLUMNS))?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(Self::read_row(row)?);
        }
        Ok(out)
    }
}

#[derive(Clone, Debug, Default)]
pub struct InMemorySampleStore {
    samples: Vec<CrowdSample>,
}

impl InMemorySampleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

impl SampleStore for InMemorySampleStore {
    fn insert(&mut self, sample: &NewCrowdSample) -> Result<CrowdSample> {
        let (date, day_of_week) = utc_date_parts(sample.captured_at);
        let stored = CrowdSample {
            id: self.samples.len() as i64 + 1,
            place_id: sample.place_id.clone(),
            place_name: sample.place_name.clone(),
            count: sample.count,
            status: sample.status,
            captured_at: sample.captured_at,
            date,
            day_of_week,
        };
        self.samples.push(stored.clone());
        Ok(stored)
    }

    fn list(&mut self) -> Result<Vec<CrowdSample>> {
        let mut out = self.samples.clone();
        out.sort_by_key(|s| (s.captured_at, s.id));
        Ok(out)
    }
}

/// UTC calendar date and weekday name for a millisecond timestamp.
pub fn utc_date_parts(captured_at_ms: i64) -> (String, String) {
    let days = captured_at_ms.div_euclid(1000).div_euclid(86_400);
    // 1970-01-01 was a Thursday.
    let weekday = (days + 4).rem_euclid(7) as usize;

    // Days-to-civil conversion over 400-year eras.
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = doy - (153 * mp + 2) / 5 + 1;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = yoe + era * 400 + i64::from(month <= 2);

    (
        format!("{:04}-{:02}-{:02}", year, month, day),
        DAY_NAMES[weekday].to_string(),
    )
}
