use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionRecord {
    pub version_id: String,
    pub agent_id: String,
    pub config_json: String,
    pub created_at: i64,
}

#[derive(Debug, Clone)]
pub struct NewRun {
    pub run_id: String,
    pub version_id: String,
    pub input_json: String,
    pub trigger_id: Option<String>,
    pub trigger_json: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunCounters {
    pub turns: u32,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub tokens_estimated: bool,
    pub cost_usd: f64,
    pub elapsed_ms: u64,
}

impl RunCounters {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub version_id: String,
    pub status: String,
    pub input_json: String,
    pub trigger_id: Option<String>,
    pub trigger_json: Option<String>,
    pub final_output: Option<String>,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
    pub counters: RunCounters,
    pub cancel_requested: bool,
    pub created_at: i64,
    pub updated_at: i64,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnRecord {
    pub run_id: String,
    pub turn_index: u32,
    pub turn_json: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEventRecord {
    pub id: i64,
    pub run_id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: String,
    pub run_id: String,
    pub state: String,
    pub attempts: u32,
    pub max_attempts: u32,
    pub available_at: i64,
    pub visible_until: Option<i64>,
    pub worker_id: Option<String>,
    pub last_error: Option<String>,
    pub error_class: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerRecord {
    pub trigger_id: String,
    pub name: String,
    pub kind_json: String,
    pub version_id: String,
    pub overlap: String,
    pub input_json: String,
    pub enabled: bool,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FireRecord {
    pub id: i64,
    pub trigger_id: String,
    pub run_id: Option<String>,
    pub outcome: String,
    pub detail: Option<String>,
    pub fired_at: i64,
}
