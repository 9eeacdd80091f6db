//! Trajectory recording: one append-only ndjson file per task.

pub mod recorder;
pub mod scan;

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};

use crate::task::{Outcome, Step};

pub use recorder::{TrajectoryHandle, TrajectoryRecorder};

/// Directory grouping for trajectory files, by UTC date.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Grouping {
    Daily,
    Weekly,
    Monthly,
    None,
}

impl Grouping {
    /// Directory name for a timestamp, or `None` for flat layout.
    pub fn dir_for(&self, at: DateTime<Utc>) -> Option<String> {
        match self {
            Grouping::Daily => Some(at.format("%Y-%m-%d").to_string()),
            Grouping::Weekly => {
                let week = at.iso_week();
                Some(format!("{}-W{:02}", week.year(), week.week()))
            }
            Grouping::Monthly => Some(at.format("%Y-%m").to_string()),
            Grouping::None => None,
        }
    }
}

impl std::str::FromStr for Grouping {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "daily" => Ok(Grouping::Daily),
            "weekly" => Ok(Grouping::Weekly),
            "monthly" => Ok(Grouping::Monthly),
            "none" => Ok(Grouping::None),
            other => Err(format!(
                "unknown grouping '{other}' (daily, weekly, monthly, none)"
            )),
        }
    }
}

/// One line of a trajectory file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TrajectoryRecord {
    Step(Step),
    Outcome(Outcome),
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_grouping_dir_names() {
        let at = Utc.with_ymd_and_hms(2026, 8, 1, 12, 0, 0).unwrap();
        assert_eq!(Grouping::Daily.dir_for(at).unwrap(), "2026-08-01");
        assert_eq!(Grouping::Monthly.dir_for(at).unwrap(), "2026-08");
        assert_eq!(Grouping::Weekly.dir_for(at).unwrap(), "2026-W31");
        assert_eq!(Grouping::None.dir_for(at), None);
    }

    #[test]
    fn test_grouping_parse() {
        assert_eq!("daily".parse::<Grouping>().unwrap(), Grouping::Daily);
        assert_eq!("NONE".parse::<Grouping>().unwrap(), Grouping::None);
        assert!("hourly".parse::<Grouping>().is_err());
    }

    #[test]
    fn test_record_wire_shape() {
        let record = TrajectoryRecord::Step(Step::think(1, "hm"));
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["type"], "step");
        assert_eq!(json["kind"], "think");

        let parsed: TrajectoryRecord = serde_json::from_value(json).unwrap();
        assert!(matches!(parsed, TrajectoryRecord::Step(_)));
    }
}
