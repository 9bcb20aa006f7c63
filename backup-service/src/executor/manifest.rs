//! Run manifest types.
//!
//! A manifest records, per storage target, every slot that now holds this
//! run's artifact. It is filled in as slots are written and returned with the
//! run report, complete or partial.

use crate::rotation::Slot;
use serde::Serialize;

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct RunManifest {
    pub targets: Vec<TargetManifest>,
}

impl RunManifest {
    /// Total number of slot entries across all targets.
    pub fn entry_count(&self) -> usize {
        self.targets.iter().map(|t| t.entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entry_count() == 0
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct TargetManifest {
    pub target: String,
    pub entries: Vec<SlotEntry>,
}

impl TargetManifest {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            entries: Vec::new(),
        }
    }
}

/// One slot written during the run.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SlotEntry {
    pub slot: Slot,
    pub slot_name: String,
    pub artifact_name: String,
    pub size_bytes: u64,
    pub encrypted: bool,
}
