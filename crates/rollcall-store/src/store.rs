//! SQLite store front-ends.
//!
//! `ops` holds the row-level operations against a raw connection;
//! [`Store`] exposes them synchronously and [`AsyncStore`] through
//! tokio-rusqlite's connection actor. The attendance upsert keys on
//! (student_id, date), so marking twice on one day rewrites the
//! existing record instead of growing a duplicate.

use crate::types::{
    AttendanceEntry, AttendanceRecord, AttendanceStats, AttendanceStatus, Student,
};
use chrono::{NaiveDate, NaiveTime};
use rollcall_core::FeatureVector;
use std::path::Path;
use thiserror::Error;

const DATE_FMT: &str = "%Y-%m-%d";
const TIME_FMT: &str = "%H:%M:%S";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("student name must not be empty")]
    EmptyName,
    #[error("unknown student: {0}")]
    UnknownStudent(String),
    #[error("invalid attendance status: {0}")]
    InvalidStatus(String),
    #[error("failed to encode feature vector: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("database connection lost: {0}")]
    Connection(String),
}

impl StoreError {
    /// Wrap for transport through a tokio-rusqlite `call` closure.
    fn into_call_error(self) -> tokio_rusqlite::Error {
        tokio_rusqlite::Error::Other(Box::new(self))
    }
}

impl From<tokio_rusqlite::Error> for StoreError {
    fn from(e: tokio_rusqlite::Error) -> Self {
        match e {
            tokio_rusqlite::Error::Rusqlite(e) => StoreError::Sqlite(e),
            tokio_rusqlite::Error::Other(boxed) => match boxed.downcast::<StoreError>() {
                Ok(inner) => *inner,
                Err(other) => StoreError::Connection(other.to_string()),
            },
            other => StoreError::Connection(other.to_string()),
        }
    }
}

/// Row-level operations shared by both front-ends.
mod ops {
    use super::*;
    use chrono::{DateTime, Utc};
    use rusqlite::{params, types::Type, Connection, OptionalExtension, Row};
    use uuid::Uuid;

    const SCHEMA: &str = "
        CREATE TABLE IF NOT EXISTS students (
            id         TEXT PRIMARY KEY,
            name       TEXT NOT NULL,
            photo_path TEXT,
            features   TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS attendance (
            id         TEXT PRIMARY KEY,
            student_id TEXT NOT NULL REFERENCES students(id),
            date       TEXT NOT NULL,
            time       TEXT NOT NULL,
            status     TEXT NOT NULL,
            created_at TEXT NOT NULL,
            UNIQUE (student_id, date)
        );
        CREATE INDEX IF NOT EXISTS idx_attendance_date ON attendance(date);
    ";

    pub fn init(conn: &Connection) -> Result<(), StoreError> {
        conn.pragma_update(None, "foreign_keys", true)?;
        conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    fn parse_utc(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
        let text: String = row.get(idx)?;
        DateTime::parse_from_rfc3339(&text)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    }

    fn parse_date(row: &Row<'_>, idx: usize) -> rusqlite::Result<NaiveDate> {
        let text: String = row.get(idx)?;
        NaiveDate::parse_from_str(&text, DATE_FMT)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    }

    fn parse_time(row: &Row<'_>, idx: usize) -> rusqlite::Result<NaiveTime> {
        let text: String = row.get(idx)?;
        NaiveTime::parse_from_str(&text, TIME_FMT)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    }

    fn parse_status(row: &Row<'_>, idx: usize) -> rusqlite::Result<AttendanceStatus> {
        let text: String = row.get(idx)?;
        AttendanceStatus::parse(&text).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                idx,
                Type::Text,
                format!("unknown status {text:?}").into(),
            )
        })
    }

    /// Stored vectors from older extractor versions may fail to parse;
    /// they are unusable for matching either way, so they degrade to
    /// "not enrolled" instead of poisoning every list call.
    fn parse_features(raw: Option<String>) -> Option<FeatureVector> {
        let raw = raw?;
        match serde_json::from_str(&raw) {
            Ok(v) => Some(v),
            Err(e) => {
                tracing::warn!(error = %e, "discarding unparseable stored feature vector");
                None
            }
        }
    }

    fn student_from_row(row: &Row<'_>) -> rusqlite::Result<Student> {
        Ok(Student {
            id: row.get(0)?,
            name: row.get(1)?,
            photo_path: row.get(2)?,
            features: parse_features(row.get(3)?),
            created_at: parse_utc(row, 4)?,
            updated_at: parse_utc(row, 5)?,
        })
    }

    pub fn create_student(
        conn: &Connection,
        name: &str,
        photo_path: Option<String>,
        features: Option<FeatureVector>,
    ) -> Result<Student, StoreError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(StoreError::EmptyName);
        }

        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let features_json = features.as_ref().map(serde_json::to_string).transpose()?;

        conn.execute(
            "INSERT INTO students (id, name, photo_path, features, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                id,
                name,
                photo_path,
                features_json,
                now.to_rfc3339(),
                now.to_rfc3339()
            ],
        )?;

        tracing::info!(student = %id, name, has_features = features.is_some(), "student registered");

        Ok(Student {
            id,
            name: name.to_string(),
            photo_path,
            features,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn list_students(conn: &Connection) -> Result<Vec<Student>, StoreError> {
        let mut stmt = conn.prepare(
            "SELECT id, name, photo_path, features, created_at, updated_at
             FROM students ORDER BY name ASC",
        )?;
        let students = stmt
            .query_map([], student_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(students)
    }

    pub fn get_student(conn: &Connection, id: &str) -> Result<Option<Student>, StoreError> {
        let mut stmt = conn.prepare(
            "SELECT id, name, photo_path, features, created_at, updated_at
             FROM students WHERE id = ?1",
        )?;
        Ok(stmt.query_row([id], student_from_row).optional()?)
    }

    pub fn mark_attendance(
        conn: &Connection,
        student_id: &str,
        status: AttendanceStatus,
        date: NaiveDate,
        time: NaiveTime,
    ) -> Result<AttendanceRecord, StoreError> {
        if get_student(conn, student_id)?.is_none() {
            return Err(StoreError::UnknownStudent(student_id.to_string()));
        }

        let now = Utc::now();
        conn.execute(
            "INSERT INTO attendance (id, student_id, date, time, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT (student_id, date)
             DO UPDATE SET status = excluded.status, time = excluded.time",
            params![
                Uuid::new_v4().to_string(),
                student_id,
                date.format(DATE_FMT).to_string(),
                time.format(TIME_FMT).to_string(),
                status.as_str(),
                now.to_rfc3339()
            ],
        )?;

        tracing::info!(student = student_id, %status, %date, "attendance marked");

        // Read the surviving row back; on conflict the original id and
        // created_at are kept.
        let record = conn.query_row(
            "SELECT id, student_id, date, time, status, created_at
             FROM attendance WHERE student_id = ?1 AND date = ?2",
            params![student_id, date.format(DATE_FMT).to_string()],
            |row| {
                Ok(AttendanceRecord {
                    id: row.get(0)?,
                    student_id: row.get(1)?,
                    date: parse_date(row, 2)?,
                    time: parse_time(row, 3)?,
                    status: parse_status(row, 4)?,
                    created_at: parse_utc(row, 5)?,
                })
            },
        )?;
        Ok(record)
    }

    fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<AttendanceEntry> {
        Ok(AttendanceEntry {
            record: AttendanceRecord {
                id: row.get(0)?,
                student_id: row.get(1)?,
                date: parse_date(row, 2)?,
                time: parse_time(row, 3)?,
                status: parse_status(row, 4)?,
                created_at: parse_utc(row, 5)?,
            },
            student_name: row.get(6)?,
            student_photo: row.get(7)?,
        })
    }

    pub fn list_attendance(
        conn: &Connection,
        date: Option<NaiveDate>,
    ) -> Result<Vec<AttendanceEntry>, StoreError> {
        let base = "SELECT a.id, a.student_id, a.date, a.time, a.status, a.created_at,
                           s.name, s.photo_path
                    FROM attendance a JOIN students s ON s.id = a.student_id";

        let entries = match date {
            Some(d) => {
                let mut stmt =
                    conn.prepare(&format!("{base} WHERE a.date = ?1 ORDER BY a.created_at DESC"))?;
                let rows = stmt
                    .query_map([d.format(DATE_FMT).to_string()], entry_from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            }
            None => {
                let mut stmt = conn.prepare(&format!("{base} ORDER BY a.created_at DESC"))?;
                let rows = stmt
                    .query_map([], entry_from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            }
        };
        Ok(entries)
    }

    pub fn attendance_between(
        conn: &Connection,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<AttendanceEntry>, StoreError> {
        let mut stmt = conn.prepare(
            "SELECT a.id, a.student_id, a.date, a.time, a.status, a.created_at,
                    s.name, s.photo_path
             FROM attendance a JOIN students s ON s.id = a.student_id
             WHERE a.date >= ?1 AND a.date <= ?2
             ORDER BY a.date DESC, a.time ASC",
        )?;
        let entries = stmt
            .query_map(
                params![
                    start.format(DATE_FMT).to_string(),
                    end.format(DATE_FMT).to_string()
                ],
                entry_from_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }

    pub fn stats_for(conn: &Connection, today: NaiveDate) -> Result<AttendanceStats, StoreError> {
        let total_students: u32 =
            conn.query_row("SELECT COUNT(*) FROM students", [], |row| row.get(0))?;

        let mut stmt = conn.prepare(
            "SELECT status, COUNT(*) FROM attendance WHERE date = ?1 GROUP BY status",
        )?;
        let mut present = 0u32;
        let mut absent = 0u32;
        let mut late = 0u32;
        let counts = stmt.query_map([today.format(DATE_FMT).to_string()], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, u32>(1)?))
        })?;
        for row in counts {
            let (status, count) = row?;
            match AttendanceStatus::parse(&status) {
                Some(AttendanceStatus::Present) => present = count,
                Some(AttendanceStatus::Absent) => absent = count,
                Some(AttendanceStatus::Late) => late = count,
                None => tracing::warn!(status, "ignoring unknown status in stats"),
            }
        }

        let attendance_rate = if total_students == 0 {
            0
        } else {
            ((present + late) as f64 / total_students as f64 * 100.0).round() as u32
        };

        Ok(AttendanceStats {
            total_students,
            present_today: present,
            absent_today: absent,
            late_today: late,
            attendance_rate,
        })
    }
}

/// Synchronous store over a single SQLite connection.
pub struct Store {
    conn: rusqlite::Connection,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Connection(format!("create {}: {e}", parent.display())))?;
        }
        let conn = rusqlite::Connection::open(path)?;
        ops::init(&conn)?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = rusqlite::Connection::open_in_memory()?;
        ops::init(&conn)?;
        Ok(Self { conn })
    }

    pub fn create_student(
        &self,
        name: &str,
        photo_path: Option<String>,
        features: Option<FeatureVector>,
    ) -> Result<Student, StoreError> {
        ops::create_student(&self.conn, name, photo_path, features)
    }

    pub fn list_students(&self) -> Result<Vec<Student>, StoreError> {
        ops::list_students(&self.conn)
    }

    pub fn get_student(&self, id: &str) -> Result<Option<Student>, StoreError> {
        ops::get_student(&self.conn, id)
    }

    pub fn mark_attendance(
        &self,
        student_id: &str,
        status: AttendanceStatus,
        date: NaiveDate,
        time: NaiveTime,
    ) -> Result<AttendanceRecord, StoreError> {
        ops::mark_attendance(&self.conn, student_id, status, date, time)
    }

    pub fn list_attendance(
        &self,
        date: Option<NaiveDate>,
    ) -> Result<Vec<AttendanceEntry>, StoreError> {
        ops::list_attendance(&self.conn, date)
    }

    pub fn attendance_between(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<AttendanceEntry>, StoreError> {
        ops::attendance_between(&self.conn, start, end)
    }

    pub fn stats_for(&self, today: NaiveDate) -> Result<AttendanceStats, StoreError> {
        ops::stats_for(&self.conn, today)
    }
}

/// Async store for the daemon; every call hops through the
/// tokio-rusqlite connection actor.
#[derive(Clone)]
pub struct AsyncStore {
    conn: tokio_rusqlite::Connection,
}

impl AsyncStore {
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Connection(format!("create {}: {e}", parent.display())))?;
        }
        let conn = tokio_rusqlite::Connection::open(path.to_path_buf()).await?;
        conn.call(|conn| ops::init(conn).map_err(StoreError::into_call_error))
            .await?;
        Ok(Self { conn })
    }

    pub async fn create_student(
        &self,
        name: String,
        photo_path: Option<String>,
        features: Option<FeatureVector>,
    ) -> Result<Student, StoreError> {
        Ok(self
            .conn
            .call(move |conn| {
                ops::create_student(conn, &name, photo_path, features)
                    .map_err(StoreError::into_call_error)
            })
            .await?)
    }

    pub async fn list_students(&self) -> Result<Vec<Student>, StoreError> {
        Ok(self
            .conn
            .call(|conn| ops::list_students(conn).map_err(StoreError::into_call_error))
            .await?)
    }

    pub async fn get_student(&self, id: String) -> Result<Option<Student>, StoreError> {
        Ok(self
            .conn
            .call(move |conn| ops::get_student(conn, &id).map_err(StoreError::into_call_error))
            .await?)
    }

    pub async fn mark_attendance(
        &self,
        student_id: String,
        status: AttendanceStatus,
        date: NaiveDate,
        time: NaiveTime,
    ) -> Result<AttendanceRecord, StoreError> {
        Ok(self
            .conn
            .call(move |conn| {
                ops::mark_attendance(conn, &student_id, status, date, time)
                    .map_err(StoreError::into_call_error)
            })
            .await?)
    }

    pub async fn list_attendance(
        &self,
        date: Option<NaiveDate>,
    ) -> Result<Vec<AttendanceEntry>, StoreError> {
        Ok(self
            .conn
            .call(move |conn| ops::list_attendance(conn, date).map_err(StoreError::into_call_error))
            .await?)
    }

    pub async fn attendance_between(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<AttendanceEntry>, StoreError> {
        Ok(self
            .conn
            .call(move |conn| {
                ops::attendance_between(conn, start, end).map_err(StoreError::into_call_error)
            })
            .await?)
    }

    pub async fn stats_for(&self, today: NaiveDate) -> Result<AttendanceStats, StoreError> {
        Ok(self
            .conn
            .call(move |conn| ops::stats_for(conn, today).map_err(StoreError::into_call_error))
            .await?)
    }
}
