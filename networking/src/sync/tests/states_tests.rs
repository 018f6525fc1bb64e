use crate::sync::SyncState;
use rstest::rstest;

#[test]
fn test_default_state_is_idle() {
    assert_eq!(SyncState::default(), SyncState::Idle);
}

#[rstest]
#[case(SyncState::Idle, SyncState::Downloading)]
#[case(SyncState::Idle, SyncState::AwaitingTip)]
#[case(SyncState::Downloading, SyncState::Committing)]
#[case(SyncState::Committing, SyncState::Downloading)]
#[case(SyncState::Committing, SyncState::AwaitingTip)]
#[case(SyncState::AwaitingTip, SyncState::Verifying)]
#[case(SyncState::Verifying, SyncState::Reconciling)]
#[case(SyncState::Reconciling, SyncState::Committing)]
#[case(SyncState::Committing, SyncState::Reconciling)]
#[case(SyncState::Faulted, SyncState::AwaitingTip)]
fn test_valid_transitions(#[case] from: SyncState, #[case] to: SyncState) {
    assert!(from.can_transition_to(to), "{from} -> {to}");
}

#[rstest]
#[case(SyncState::Idle, SyncState::Committing)]
#[case(SyncState::AwaitingTip, SyncState::Committing)]
#[case(SyncState::Downloading, SyncState::Reconciling)]
#[case(SyncState::Faulted, SyncState::Downloading)]
#[case(SyncState::Faulted, SyncState::Faulted)]
#[case(SyncState::Stopped, SyncState::AwaitingTip)]
#[case(SyncState::Stopped, SyncState::Stopped)]
fn test_invalid_transitions(#[case] from: SyncState, #[case] to: SyncState) {
    assert!(!from.can_transition_to(to), "{from} -> {to}");
}

#[test]
fn test_every_live_state_can_fault_and_stop() {
    let live = [
        SyncState::Idle,
        SyncState::AwaitingTip,
        SyncState::Downloading,
        SyncState::Verifying,
        SyncState::Reconciling,
        SyncState::Committing,
    ];
    for state in live {
        assert!(state.can_transition_to(SyncState::Faulted), "{state}");
        assert!(state.can_transition_to(SyncState::Stopped), "{state}");
    }
    assert!(SyncState::Faulted.can_transition_to(SyncState::Stopped));
}

#[test]
fn test_state_codes_are_distinct() {
    let states = [
        SyncState::Idle,
        SyncState::AwaitingTip,
        SyncState::Downloading,
        SyncState::Verifying,
        SyncState::Reconciling,
        SyncState::Committing,
        SyncState::Faulted,
        SyncState::Stopped,
    ];
    let codes: std::collections::HashSet<i64> = states.iter().map(SyncState::code).collect();
    assert_eq!(codes.len(), states.len());
    assert_eq!(SyncState::AwaitingTip.to_string(), "AWAITING_TIP");
}
