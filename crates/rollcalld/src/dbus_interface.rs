//! D-Bus interface for the Rollcall attendance daemon.
//!
//! Bus name: org.rollcall.Rollcall1
//! Object path: /org/rollcall/Rollcall1
//!
//! Payloads are JSON strings. Every internal failure collapses into a
//! single user-visible `fdo::Error`; recognition misses are a regular
//! (unmatched) result, since manual marking always remains available.

use crate::config::Config;
use crate::engine::{EngineHandle, RecognitionOutcome};
use chrono::{Local, NaiveDate};
use rollcall_core::{FeatureExtractor, FeatureVector, PixelSliceExtractor};
use rollcall_store::{AsyncStore, AttendanceStatus, StoreError};
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;
use zbus::fdo;
use zbus::interface;

pub struct RollcallService {
    engine: EngineHandle,
    store: AsyncStore,
    config: Arc<Config>,
}

impl RollcallService {
    pub fn new(engine: EngineHandle, store: AsyncStore, config: Arc<Config>) -> Self {
        Self {
            engine,
            store,
            config,
        }
    }
}

/// Collapse any failure into one user-visible notification.
fn failure(e: impl std::fmt::Display) -> fdo::Error {
    let msg = e.to_string();
    tracing::warn!(error = %msg, "request failed");
    fdo::Error::Failed(msg)
}

fn to_json<T: serde::Serialize>(value: &T) -> fdo::Result<String> {
    serde_json::to_string(value).map_err(failure)
}

fn parse_date(s: &str) -> fdo::Result<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|e| fdo::Error::InvalidArgs(format!("bad date {s:?}: {e}")))
}

/// Decode the photo, extract whole-image features, and persist a PNG
/// copy under the photo dir. A failed extraction degrades to "no
/// features": the student still registers and can be marked manually.
fn process_photo(
    bytes: Vec<u8>,
    photo_dir: PathBuf,
) -> Result<(String, Option<FeatureVector>), String> {
    let image = image::load_from_memory(&bytes)
        .map_err(|e| format!("cannot decode photo: {e}"))?
        .to_rgba8();

    let features = match PixelSliceExtractor.extract(&image, None) {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::warn!(error = %e, "feature extraction failed; registering without features");
            None
        }
    };

    let path = photo_dir.join(format!("{}.png", Uuid::new_v4()));
    image
        .save(&path)
        .map_err(|e| format!("cannot save photo: {e}"))?;

    Ok((path.to_string_lossy().into_owned(), features))
}

fn outcome_json(outcome: &RecognitionOutcome) -> String {
    match outcome {
        RecognitionOutcome::Resolved {
            student_id,
            name,
            similarity,
        } => serde_json::json!({
            "matched": true,
            "student_id": student_id,
            "name": name,
            "similarity": similarity,
        })
        .to_string(),
        RecognitionOutcome::Unresolved => serde_json::json!({ "matched": false }).to_string(),
    }
}

#[interface(name = "org.rollcall.Rollcall1")]
impl RollcallService {
    /// Register a student, optionally with a photo file. Pass an empty
    /// photo path to register without one.
    async fn register_student(&self, name: &str, photo_path: &str) -> fdo::Result<String> {
        tracing::info!(name, photo = photo_path, "register_student requested");

        let (saved_photo, features) = if photo_path.is_empty() {
            (None, None)
        } else {
            let bytes = tokio::fs::read(photo_path)
                .await
                .map_err(|e| failure(format!("cannot read {photo_path}: {e}")))?;
            let photo_dir = self.config.photo_dir.clone();
            let (path, features) = tokio::task::spawn_blocking(move || process_photo(bytes, photo_dir))
                .await
                .map_err(failure)?
                .map_err(failure)?;
            (Some(path), features)
        };

        let student = self
            .store
            .create_student(name.to_string(), saved_photo, features)
            .await
            .map_err(failure)?;
        to_json(&student)
    }

    /// Register a student from a camera snapshot. The camera is
    /// released once the photo is taken.
    async fn register_student_from_camera(&self, name: &str) -> fdo::Result<String> {
        tracing::info!(name, "register_student_from_camera requested");

        let frame = self.engine.snapshot().await.map_err(failure)?;
        let photo_dir = self.config.photo_dir.clone();
        let (path, features) = tokio::task::spawn_blocking(move || {
            let image = image::RgbaImage::from_raw(frame.width, frame.height, frame.data)
                .ok_or_else(|| "captured frame is not a valid image".to_string())?;

            let features = match PixelSliceExtractor.extract(&image, None) {
                Ok(v) => Some(v),
                Err(e) => {
                    tracing::warn!(error = %e, "feature extraction failed; registering without features");
                    None
                }
            };

            let file = photo_dir.join(format!("{}.png", Uuid::new_v4()));
            image
                .save(&file)
                .map_err(|e| format!("cannot save photo: {e}"))?;
            Ok::<_, String>((file.to_string_lossy().into_owned(), features))
        })
        .await
        .map_err(failure)?
        .map_err(failure)?;

        let student = self
            .store
            .create_student(name.to_string(), Some(path), features)
            .await
            .map_err(failure)?;
        to_json(&student)
    }

    /// Open the camera for a recognition session.
    async fn start_capture(&self) -> fdo::Result<()> {
        self.engine.start_capture().await.map_err(failure)
    }

    /// Recognize one frame against the enrolled students. Returns
    /// `{"matched": true, ...}` or `{"matched": false}`; on a miss the
    /// camera stays on for another try.
    async fn recognize(&self) -> fdo::Result<String> {
        let enrolled = self
            .store
            .list_students()
            .await
            .map_err(failure)?
            .iter()
            .map(|s| s.to_enrollment())
            .collect();

        let outcome = self.engine.recognize(enrolled).await.map_err(failure)?;
        Ok(outcome_json(&outcome))
    }

    /// Release the camera and return to idle.
    async fn cancel_capture(&self) -> fdo::Result<()> {
        self.engine.cancel_capture().await.map_err(failure)
    }

    /// Mark attendance for today; marking twice on one day overwrites
    /// the earlier record.
    async fn mark_attendance(&self, student_id: &str, status: &str) -> fdo::Result<String> {
        let status = AttendanceStatus::parse(status)
            .ok_or_else(|| StoreError::InvalidStatus(status.to_string()))
            .map_err(failure)?;

        let now = Local::now();
        let record = self
            .store
            .mark_attendance(
                student_id.to_string(),
                status,
                now.date_naive(),
                now.time(),
            )
            .await
            .map_err(failure)?;
        to_json(&record)
    }

    /// List enrolled students, name ascending.
    async fn list_students(&self) -> fdo::Result<String> {
        let students = self.store.list_students().await.map_err(failure)?;
        to_json(&students)
    }

    /// List attendance records joined with student display fields.
    /// Pass an empty date for all records, or YYYY-MM-DD to filter.
    async fn list_attendance(&self, date: &str) -> fdo::Result<String> {
        let filter = if date.is_empty() {
            None
        } else {
            Some(parse_date(date)?)
        };
        let entries = self.store.list_attendance(filter).await.map_err(failure)?;
        to_json(&entries)
    }

    /// Today's aggregate stats.
    async fn get_stats(&self) -> fdo::Result<String> {
        let stats = self
            .store
            .stats_for(Local::now().date_naive())
            .await
            .map_err(failure)?;
        to_json(&stats)
    }

    /// Export attendance in [start, end] as CSV text.
    async fn export_attendance(&self, start_date: &str, end_date: &str) -> fdo::Result<String> {
        let start = parse_date(start_date)?;
        let end = parse_date(end_date)?;
        let entries = self
            .store
            .attendance_between(start, end)
            .await
            .map_err(failure)?;
        Ok(rollcall_store::to_csv(&entries))
    }

    /// Return daemon status information.
    async fn status(&self) -> fdo::Result<String> {
        let engine = self.engine.status().await.map_err(failure)?;
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "capture": if engine.capturing { "capturing" } else { "idle" },
            "detector": engine.detector,
            "camera_device": self.config.camera_device,
            "db_path": self.config.db_path.display().to_string(),
        })
        .to_string())
    }
}
