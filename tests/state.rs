use std::time::Duration;

use rbcp_daq::state::{RunStage, RunState};

#[tokio::test]
async fn transitions_are_monotonic() {
    let state = RunState::new();
    assert_eq!(state.current(), RunStage::NotStarted);

    assert!(state.transit(RunStage::Starting));
    assert!(state.transit(RunStage::Running));
    assert_eq!(state.current(), RunStage::Running);

    // moving backward is a silent no-op
    assert!(!state.transit(RunStage::Starting));
    assert!(!state.transit(RunStage::Running));
    assert_eq!(state.current(), RunStage::Running);

    assert!(state.transit(RunStage::Stopped));
    assert!(!state.transit(RunStage::Stopping));
    assert_eq!(state.current(), RunStage::Stopped);
}

#[tokio::test]
async fn wait_returns_immediately_when_already_reached() {
    let state = RunState::new();
    state.transit(RunStage::Running);
    assert!(state.wait(RunStage::Running, Some(Duration::ZERO)).await);
    assert!(state.wait(RunStage::Starting, Some(Duration::ZERO)).await);
}

#[tokio::test]
async fn wait_times_out_when_stage_is_not_reached() {
    let state = RunState::new();
    assert!(!state.wait(RunStage::Running, Some(Duration::from_millis(50))).await);
}

#[tokio::test]
async fn wait_wakes_on_transition() {
    let state = RunState::new();
    let waiter = state.clone();
    let task = tokio::spawn(async move { waiter.wait(RunStage::Running, None).await });

    tokio::time::sleep(Duration::from_millis(20)).await;
    state.transit(RunStage::Running);
    assert!(task.await.expect("waiter task"));
}

#[tokio::test]
async fn wait_is_satisfied_by_a_later_stage() {
    let state = RunState::new();
    let waiter = state.clone();
    let task = tokio::spawn(async move { waiter.wait(RunStage::Running, None).await });

    tokio::time::sleep(Duration::from_millis(20)).await;
    // jumping straight past the awaited stage still satisfies the wait
    state.transit(RunStage::Stopped);
    assert!(task.await.expect("waiter task"));
}

#[tokio::test]
async fn concurrent_transitions_settle_on_the_highest_stage() {
    let state = RunState::new();
    let mut tasks = Vec::new();
    for stage in [RunStage::Starting, RunStage::Running, RunStage::Stopping, RunStage::Stopped] {
        let state = state.clone();
        tasks.push(tokio::spawn(async move { state.transit(stage) }));
    }
    for task in tasks {
        task.await.expect("transit task");
    }
    assert_eq!(state.current(), RunStage::Stopped);
}
