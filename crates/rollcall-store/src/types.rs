use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use rollcall_core::{Enrollment, FeatureVector};
use serde::{Deserialize, Serialize};
use std::fmt;

/// An enrolled student.
///
/// Created on registration, mutated only by re-registration, never
/// deleted. `photo_path` points at the re-encoded photo under the
/// configured photo directory; `features` is the reference vector
/// extracted from that photo, absent when extraction failed or no
/// photo was given.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Student {
    pub id: String,
    pub name: String,
    pub photo_path: Option<String>,
    pub features: Option<FeatureVector>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Student {
    /// Project into the matcher's view of this student.
    pub fn to_enrollment(&self) -> Enrollment {
        Enrollment {
            student_id: self.id.clone(),
            name: self.name.clone(),
            features: self.features.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttendanceStatus {
    Present,
    Absent,
    Late,
}

impl AttendanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttendanceStatus::Present => "present",
            AttendanceStatus::Absent => "absent",
            AttendanceStatus::Late => "late",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "present" => Some(AttendanceStatus::Present),
            "absent" => Some(AttendanceStatus::Absent),
            "late" => Some(AttendanceStatus::Late),
            _ => None,
        }
    }
}

impl fmt::Display for AttendanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One attendance mark. At most one record exists per (student, date);
/// a later mark on the same day overwrites status and time in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub id: String,
    pub student_id: String,
    pub date: NaiveDate,
    pub time: NaiveTime,
    pub status: AttendanceStatus,
    pub created_at: DateTime<Utc>,
}

/// Attendance record joined with the student's display fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttendanceEntry {
    #[serde(flatten)]
    pub record: AttendanceRecord,
    pub student_name: String,
    pub student_photo: Option<String>,
}

/// Derived daily aggregate; never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttendanceStats {
    pub total_students: u32,
    pub present_today: u32,
    pub absent_today: u32,
    pub late_today: u32,
    /// round((present + late) / total * 100); 0 when no students.
    pub attendance_rate: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip() {
        for status in [
            AttendanceStatus::Present,
            AttendanceStatus::Absent,
            AttendanceStatus::Late,
        ] {
            assert_eq!(AttendanceStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(AttendanceStatus::parse("tardy"), None);
    }

    #[test]
    fn test_status_serde_is_lowercase() {
        assert_eq!(
            serde_json::to_string(&AttendanceStatus::Present).unwrap(),
            "\"present\""
        );
        let parsed: AttendanceStatus = serde_json::from_str("\"late\"").unwrap();
        assert_eq!(parsed, AttendanceStatus::Late);
    }

    #[test]
    fn test_to_enrollment_keeps_missing_features() {
        let student = Student {
            id: "s1".into(),
            name: "Alice".into(),
            photo_path: None,
            features: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let e = student.to_enrollment();
        assert_eq!(e.student_id, "s1");
        assert!(e.features.is_none());
    }
}
