pub mod scheduler;


pub use scheduler::TriggerScheduler;

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use crate::config::{CancelPreviousModeKind, TriggerConfig};
use crate::core::store::TriggerRecord;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerKind {
    /// Six-field cron expression (seconds first).
    Schedule { cron: String },
    Event {
        source: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filter: Option<EventFilter>,
    },
}

impl TriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerKind::Schedule { .. } => "schedule",
            TriggerKind::Event { .. } => "event",
        }
    }
}

/// Fires only when the value at `pointer` (RFC 6901) in the event payload equals `equals`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventFilter {
    pub pointer: String,
    pub equals: Value,
}

impl EventFilter {
    pub fn matches(&self, payload: &Value) -> bool {
        payload.pointer(&self.pointer) == Some(&self.equals)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverlapPolicy {
    /// Drop the fire while a previous run of the trigger is still active.
    Skip,
    /// Enqueue anyway; runs of the trigger execute one after another.
    Queue,
    /// Cancel active runs of the trigger, then enqueue.
    CancelPrevious,
}

impl OverlapPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            OverlapPolicy::Skip => "skip",
            OverlapPolicy::Queue => "queue",
            OverlapPolicy::CancelPrevious => "cancel_previous",
        }
    }

    pub fn from_status(value: &str) -> Option<Self> {
        match value {
            "skip" => Some(OverlapPolicy::Skip),
            "queue" => Some(OverlapPolicy::Queue),
            "cancel_previous" | "cancel-previous" => Some(OverlapPolicy::CancelPrevious),
            _ => None,
        }
    }
}

/// How `cancel_previous` waits for the runs it cancels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelPreviousMode {
    Immediate,
    AwaitTermination { timeout: Duration },
}

impl From<&TriggerConfig> for CancelPreviousMode {
    fn from(cfg: &TriggerConfig) -> Self {
        match cfg.cancel_previous_mode {
            CancelPreviousModeKind::Immediate => CancelPreviousMode::Immediate,
            CancelPreviousModeKind::AwaitTermination => CancelPreviousMode::AwaitTermination {
                timeout: Duration::from_secs(cfg.cancel_previous_timeout_secs),
            },
        }
    }
}

/// Input for registering a trigger.
#[derive(Debug, Clone, Deserialize)]
pub struct NewTrigger {
    pub name: String,
    pub kind: TriggerKind,
    pub version_id: String,
    #[serde(default = "default_overlap")]
    pub overlap: OverlapPolicy,
    #[serde(default)]
    pub input: Value,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_overlap() -> OverlapPolicy {
    OverlapPolicy::Skip
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Trigger {
    pub trigger_id: String,
    pub name: String,
    pub kind: TriggerKind,
    pub version_id: String,
    pub overlap: OverlapPolicy,
    pub input: Value,
    pub enabled: bool,
    pub created_at: i64,
}

impl Trigger {
    pub fn to_record(&self) -> Result<TriggerRecord> {
        Ok(TriggerRecord {
            trigger_id: self.trigger_id.clone(),
            name: self.name.clone(),
            kind_json: serde_json::to_string(&self.kind)?,
            version_id: self.version_id.clone(),
            overlap: self.overlap.as_str().to_string(),
            input_json: serde_json::to_string(&self.input)?,
            enabled: self.enabled,
            created_at: self.created_at,
        })
    }

    pub fn from_record(rec: TriggerRecord) -> Result<Self> {
        let overlap = OverlapPolicy::from_status(&rec.overlap)
            .ok_or_else(|| anyhow!("trigger {} has unknown overlap policy '{}'", rec.trigger_id, rec.overlap))?;
        Ok(Self {
            kind: serde_json::from_str(&rec.kind_json)?,
            input: serde_json::from_str(&rec.input_json)?,
            trigger_id: rec.trigger_id,
            name: rec.name,
            version_id: rec.version_id,
            overlap,
            enabled: rec.enabled,
            created_at: rec.created_at,
        })
    }
}

/// What one evaluation of a trigger did. Recorded as a fire row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FireOutcome {
    Enqueued { run_id: String },
    Dropped { reason: String },
    CancelledPrevious { run_id: String, cancelled: Vec<String> },
}

impl FireOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            FireOutcome::Enqueued { .. } => "enqueued",
            FireOutcome::Dropped { .. } => "dropped",
            FireOutcome::CancelledPrevious { .. } => "cancelled_previous",
        }
    }

    pub fn run_id(&self) -> Option<&str> {
        match self {
            FireOutcome::Enqueued { run_id } | FireOutcome::CancelledPrevious { run_id, .. } => {
                Some(run_id)
            }
            FireOutcome::Dropped { .. } => None,
        }
    }
}
