use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    Idle,
    AwaitingModel,
    Dispatching,
    AwaitingToolResults,
    Completed,
    Failed,
    Cancelled,
}

impl LoopState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoopState::Idle => "idle",
            LoopState::AwaitingModel => "awaiting_model",
            LoopState::Dispatching => "dispatching",
            LoopState::AwaitingToolResults => "awaiting_tool_results",
            LoopState::Completed => "completed",
            LoopState::Failed => "failed",
            LoopState::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            LoopState::Completed | LoopState::Failed | LoopState::Cancelled
        )
    }
}

pub fn can_transition(from: LoopState, to: LoopState) -> bool {
    match from {
        LoopState::Idle => matches!(
            to,
            LoopState::AwaitingModel | LoopState::Failed | LoopState::Cancelled
        ),
        LoopState::AwaitingModel => matches!(
            to,
            LoopState::Dispatching | LoopState::Completed | LoopState::Failed | LoopState::Cancelled
        ),
        LoopState::Dispatching => {
            matches!(to, LoopState::AwaitingToolResults | LoopState::Cancelled)
        }
        LoopState::AwaitingToolResults => matches!(
            to,
            LoopState::AwaitingModel
                | LoopState::Completed
                | LoopState::Failed
                | LoopState::Cancelled
        ),
        LoopState::Completed | LoopState::Failed | LoopState::Cancelled => false,
    }
}

/// Current loop state of one run, rejecting illegal moves.
#[derive(Debug)]
pub struct StateTracker {
    run_id: String,
    state: LoopState,
}

impl StateTracker {
    pub fn new(run_id: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            state: LoopState::Idle,
        }
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn advance(&mut self, to: LoopState) -> bool {
        if !can_transition(self.state, to) {
            warn!(
                "Run [{}]: illegal loop transition {} -> {}",
                self.run_id,
                self.state.as_str(),
                to.as_str()
            );
            return false;
        }
        debug!(
            "Run [{}]: {} -> {}",
            self.run_id,
            self.state.as_str(),
            to.as_str()
        );
        self.state = to;
        true
    }
}
