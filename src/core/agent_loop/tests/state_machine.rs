use crate::core::agent_loop::{LoopState, StateTracker, can_transition};

#[test]
fn round_trip_through_tool_dispatch_is_allowed() {
    let path = [
        (LoopState::Idle, LoopState::AwaitingModel),
        (LoopState::AwaitingModel, LoopState::Dispatching),
        (LoopState::Dispatching, LoopState::AwaitingToolResults),
        (LoopState::AwaitingToolResults, LoopState::AwaitingModel),
        (LoopState::AwaitingModel, LoopState::Completed),
    ];
    for (from, to) in path {
        assert!(
            can_transition(from, to),
            "expected transition {:?} -> {:?} to be allowed",
            from,
            to
        );
    }
}

#[test]
fn cancellation_is_allowed_from_every_active_state() {
    let active = [
        LoopState::Idle,
        LoopState::AwaitingModel,
        LoopState::Dispatching,
        LoopState::AwaitingToolResults,
    ];
    for from in active {
        assert!(
            can_transition(from, LoopState::Cancelled),
            "expected cancel from {:?}",
            from
        );
    }
}

#[test]
fn dispatch_cannot_be_skipped_or_completed_mid_round() {
    assert!(!can_transition(LoopState::Idle, LoopState::Dispatching));
    assert!(!can_transition(LoopState::Dispatching, LoopState::Completed));
    assert!(!can_transition(LoopState::Dispatching, LoopState::AwaitingModel));
}

#[test]
fn terminal_states_are_final() {
    for from in [LoopState::Completed, LoopState::Failed, LoopState::Cancelled] {
        assert!(from.is_terminal());
        for to in [
            LoopState::Idle,
            LoopState::AwaitingModel,
            LoopState::Completed,
            LoopState::Failed,
            LoopState::Cancelled,
        ] {
            assert!(!can_transition(from, to), "{:?} -> {:?}", from, to);
        }
    }
}

#[test]
fn tracker_rejects_illegal_moves() {
    let mut tracker = StateTracker::new("run");
    assert!(!tracker.advance(LoopState::AwaitingToolResults));
    assert_eq!(tracker.state(), LoopState::Idle);
    assert!(tracker.advance(LoopState::AwaitingModel));
    assert!(tracker.advance(LoopState::Failed));
    assert!(!tracker.advance(LoopState::AwaitingModel));
}
