//! Generational slot rotation.
//!
//! Planning is pure: [`RotationPlan::for_date`] decides from the calendar
//! date and the enabled frequencies which long-period slots a run refreshes.
//! [`rotate`] then applies the daily rotation followed by the planned
//! promotions to a single storage target.
//!
//! Daily rotation, every run:
//! 1. delete `48h`
//! 2. copy `24h -> 48h` if `24h` exists
//! 3. delete `24h`
//! 4. upload the new artifact into `24h`
//!
//! Promotions copy from the `24h` slot written in step 4, never from the
//! pre-rotation one.

use crate::executor::manifest::{SlotEntry, TargetManifest};
use crate::storage::StorageBackend;
use crate::utils::{Result, RunLog};
use crate::workspace::Artifact;
use chrono::{Datelike, NaiveDate, Weekday};
use serde::{Deserialize, Serialize};

/// Weekly promotions happen on the first day of the week.
pub const WEEKLY_ROLLOVER: Weekday = Weekday::Sun;

/// A fixed, overwritable retention position inside a storage target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Slot {
    Day,
    TwoDays,
    Week,
    Month,
    Year,
}

impl Slot {
    /// Object / file name of the slot inside a target's namespace.
    pub const fn name(self) -> &'static str {
        match self {
            Slot::Day => "backup-1day-old",
            Slot::TwoDays => "backup-2days-old",
            Slot::Week => "backup-week",
            Slot::Month => "backup-month",
            Slot::Year => "backup-year",
        }
    }
}

impl std::fmt::Display for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Optional long-period retention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    #[serde(alias = "Week")]
    Week,
    #[serde(alias = "Month")]
    Month,
    #[serde(alias = "Year")]
    Year,
}

impl Frequency {
    pub const fn slot(self) -> Slot {
        match self {
            Frequency::Week => Slot::Week,
            Frequency::Month => Slot::Month,
            Frequency::Year => Slot::Year,
        }
    }

    /// Whether `date` is this frequency's rollover day.
    pub fn is_due(self, date: NaiveDate) -> bool {
        match self {
            Frequency::Week => date.weekday() == WEEKLY_ROLLOVER,
            Frequency::Month => is_last_day_of_month(date),
            Frequency::Year => date.month() == 12 && date.day() == 31,
        }
    }
}

pub fn is_last_day_of_month(date: NaiveDate) -> bool {
    date.succ_opt()
        .map(|next| next.month() != date.month())
        .unwrap_or(true)
}

/// Slots a run refreshes on top of the daily rotation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationPlan {
    pub date: NaiveDate,
    pub promotions: Vec<Slot>,
}

impl RotationPlan {
    /// Promotions are evaluated in week, month, year order regardless of how
    /// the frequencies were listed.
    pub fn for_date(date: NaiveDate, enabled: &[Frequency]) -> Self {
        let promotions = [Frequency::Week, Frequency::Month, Frequency::Year]
            .into_iter()
            .filter(|f| enabled.contains(f) && f.is_due(date))
            .map(Frequency::slot)
            .collect();

        Self { date, promotions }
    }

    /// Every slot the run writes this run's artifact into.
    pub fn refreshed_slots(&self) -> Vec<Slot> {
        std::iter::once(Slot::Day)
            .chain(self.promotions.iter().copied())
            .collect()
    }
}

/// Apply the daily rotation and the planned promotions to one target.
///
/// Entries are pushed into `record` as each slot is written, so a failure
/// part way through leaves the slots already written in the manifest.
pub async fn rotate(
    backend: &dyn StorageBackend,
    artifact: &Artifact,
    encrypted: bool,
    plan: &RotationPlan,
    log: &RunLog,
    record: &mut TargetManifest,
) -> Result<()> {
    let target = backend.describe();

    log.msg(format!("{}: moving old backups", target));
    backend.delete_slot(Slot::TwoDays.name()).await?;
    if backend.slot_exists(Slot::Day.name()).await? {
        backend
            .copy_from_slot(Slot::Day.name(), Slot::TwoDays.name())
            .await?;
        log.msg(format!("{}: {} moved to {}", target, Slot::Day, Slot::TwoDays));
    }
    backend.delete_slot(Slot::Day.name()).await?;
    log.msg(format!("{}: moving old backups done", target));

    let uploaded = backend.upload(&artifact.path, Slot::Day.name()).await?;
    record.entries.push(SlotEntry {
        slot: Slot::Day,
        slot_name: Slot::Day.name().to_string(),
        artifact_name: artifact.name(),
        size_bytes: uploaded.size,
        encrypted,
    });

    for slot in &plan.promotions {
        log.msg(format!("{}: copying latest backup into {}", target, slot));
        backend.delete_slot(slot.name()).await?;
        let copied = backend.copy_from_slot(Slot::Day.name(), slot.name()).await?;
        record.entries.push(SlotEntry {
            slot: *slot,
            slot_name: slot.name().to_string(),
            artifact_name: artifact.name(),
            size_bytes: copied.size,
            encrypted,
        });
        log.msg(format!("{}: copying latest backup into {} done", target, slot));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::{MemoryBackend, Op};
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn artifact_with(temp_dir: &TempDir, content: &[u8]) -> Artifact {
        let path = temp_dir.path().join("backup-2026-10-18_03-00-00.tar.zst");
        std::fs::write(&path, content).unwrap();
        Artifact {
            path,
            produced_by: "archiver",
            transient: true,
        }
    }

    #[test]
    fn test_last_day_of_month() {
        assert!(is_last_day_of_month(date("2026-01-31")));
        assert!(is_last_day_of_month(date("2026-02-28")));
        assert!(!is_last_day_of_month(date("2028-02-28")));
        assert!(is_last_day_of_month(date("2028-02-29")));
        assert!(is_last_day_of_month(date("2026-12-31")));
        assert!(!is_last_day_of_month(date("2026-10-18")));
    }

    #[test]
    fn test_plan_week_not_rollover_day() {
        // 2026-10-20 is a Tuesday.
        let plan = RotationPlan::for_date(date("2026-10-20"), &[Frequency::Week]);
        assert!(plan.promotions.is_empty());
        assert_eq!(plan.refreshed_slots(), vec![Slot::Day]);
    }

    #[test]
    fn test_plan_week_on_sunday() {
        let plan = RotationPlan::for_date(date("2026-10-18"), &[Frequency::Week]);
        assert_eq!(plan.promotions, vec![Slot::Week]);
    }

    #[test]
    fn test_plan_disabled_frequencies_never_fire() {
        // Sunday, last day of the year.
        let plan = RotationPlan::for_date(date("2028-12-31"), &[]);
        assert!(plan.promotions.is_empty());
    }

    #[test]
    fn test_plan_month_only_on_last_day() {
        let enabled = [Frequency::Month];
        assert!(RotationPlan::for_date(date("2026-02-27"), &enabled)
            .promotions
            .is_empty());
        assert_eq!(
            RotationPlan::for_date(date("2026-02-28"), &enabled).promotions,
            vec![Slot::Month]
        );
    }

    #[test]
    fn test_plan_all_promotions_on_sunday_new_years_eve() {
        let plan = RotationPlan::for_date(
            date("2028-12-31"),
            &[Frequency::Year, Frequency::Week, Frequency::Month],
        );
        assert_eq!(plan.promotions, vec![Slot::Week, Slot::Month, Slot::Year]);
    }

    #[test]
    fn test_frequency_deserializes_both_spellings() {
        #[derive(Deserialize)]
        struct Wrapper {
            frequency: Vec<Frequency>,
        }
        let parsed: Wrapper = toml::from_str(r#"frequency = ["Week", "month", "year"]"#).unwrap();
        assert_eq!(
            parsed.frequency,
            vec![Frequency::Week, Frequency::Month, Frequency::Year]
        );
    }

    #[tokio::test]
    async fn test_daily_rotation_order() {
        let temp_dir = TempDir::new().unwrap();
        let backend = MemoryBackend::new("mem");
        backend.seed(Slot::Day.name(), b"yesterday");
        backend.seed(Slot::TwoDays.name(), b"two days ago");

        let artifact = artifact_with(&temp_dir, b"today");
        let plan = RotationPlan::for_date(date("2026-10-20"), &[Frequency::Week]);
        let mut record = TargetManifest::new("mem");

        rotate(&backend, &artifact, false, &plan, &RunLog::new(), &mut record)
            .await
            .unwrap();

        assert_eq!(
            backend.ops(),
            vec![
                Op::Delete(Slot::TwoDays.name().to_string()),
                Op::Exists(Slot::Day.name().to_string()),
                Op::Copy(Slot::Day.name().to_string(), Slot::TwoDays.name().to_string()),
                Op::Delete(Slot::Day.name().to_string()),
                Op::Upload(Slot::Day.name().to_string()),
            ]
        );
        assert_eq!(backend.get(Slot::TwoDays.name()).unwrap(), b"yesterday");
        assert_eq!(backend.get(Slot::Day.name()).unwrap(), b"today");
        assert!(backend.get(Slot::Week.name()).is_none());

        assert_eq!(record.entries.len(), 1);
        assert_eq!(record.entries[0].slot, Slot::Day);
        assert_eq!(record.entries[0].size_bytes, 5);
        assert!(!record.entries[0].encrypted);
    }

    #[tokio::test]
    async fn test_first_run_skips_copy() {
        let temp_dir = TempDir::new().unwrap();
        let backend = MemoryBackend::new("mem");
        let artifact = artifact_with(&temp_dir, b"first");
        let plan = RotationPlan::for_date(date("2026-10-20"), &[]);
        let mut record = TargetManifest::new("mem");

        rotate(&backend, &artifact, false, &plan, &RunLog::new(), &mut record)
            .await
            .unwrap();

        assert!(!backend.ops().iter().any(|op| matches!(op, Op::Copy(..))));
        assert!(backend.get(Slot::TwoDays.name()).is_none());
        assert_eq!(backend.get(Slot::Day.name()).unwrap(), b"first");
    }

    #[tokio::test]
    async fn test_weekly_promotion_copies_fresh_artifact() {
        let temp_dir = TempDir::new().unwrap();
        let backend = MemoryBackend::new("mem");
        backend.seed(Slot::Day.name(), b"stale");
        backend.seed(Slot::Week.name(), b"last week");

        let artifact = artifact_with(&temp_dir, b"fresh");
        let plan = RotationPlan::for_date(date("2026-10-18"), &[Frequency::Week]);
        let mut record = TargetManifest::new("mem");

        rotate(&backend, &artifact, true, &plan, &RunLog::new(), &mut record)
            .await
            .unwrap();

        let ops = backend.ops();
        let upload = ops
            .iter()
            .position(|op| *op == Op::Upload(Slot::Day.name().to_string()))
            .unwrap();
        let delete_week = ops
            .iter()
            .position(|op| *op == Op::Delete(Slot::Week.name().to_string()))
            .unwrap();
        let copy_week = ops
            .iter()
            .position(|op| {
                *op == Op::Copy(Slot::Day.name().to_string(), Slot::Week.name().to_string())
            })
            .unwrap();
        assert!(upload < delete_week && delete_week < copy_week);

        assert_eq!(backend.get(Slot::Week.name()).unwrap(), b"fresh");
        assert_eq!(backend.get(Slot::TwoDays.name()).unwrap(), b"stale");
        assert_eq!(record.entries.len(), 2);
        assert!(record.entries.iter().all(|e| e.encrypted));
    }

    #[tokio::test]
    async fn test_all_slots_refreshed_from_same_run() {
        let temp_dir = TempDir::new().unwrap();
        let backend = MemoryBackend::new("mem");
        backend.seed(Slot::Day.name(), b"yesterday");
        for slot in [Slot::Week, Slot::Month, Slot::Year] {
            backend.seed(slot.name(), b"old");
        }

        let artifact = artifact_with(&temp_dir, b"new year");
        let plan = RotationPlan::for_date(
            date("2028-12-31"),
            &[Frequency::Week, Frequency::Month, Frequency::Year],
        );
        let mut record = TargetManifest::new("mem");

        rotate(&backend, &artifact, false, &plan, &RunLog::new(), &mut record)
            .await
            .unwrap();

        for slot in [Slot::Day, Slot::Week, Slot::Month, Slot::Year] {
            assert_eq!(backend.get(slot.name()).unwrap(), b"new year", "{slot}");
        }
        assert_eq!(backend.get(Slot::TwoDays.name()).unwrap(), b"yesterday");

        let slots: Vec<Slot> = record.entries.iter().map(|e| e.slot).collect();
        assert_eq!(slots, vec![Slot::Day, Slot::Week, Slot::Month, Slot::Year]);
        assert!(record
            .entries
            .iter()
            .all(|e| e.artifact_name == "backup-2026-10-18_03-00-00.tar.zst"));
    }

    #[tokio::test]
    async fn test_failed_upload_keeps_earlier_entries_out() {
        let backend = MemoryBackend::new("mem");
        let artifact = Artifact {
            path: PathBuf::from("/nonexistent/backup.tar.zst"),
            produced_by: "archiver",
            transient: true,
        };
        let plan = RotationPlan::for_date(date("2026-10-18"), &[Frequency::Week]);
        let mut record = TargetManifest::new("mem");

        let result = rotate(&backend, &artifact, false, &plan, &RunLog::new(), &mut record).await;
        assert!(result.is_err());
        assert!(record.entries.is_empty());
    }
}
