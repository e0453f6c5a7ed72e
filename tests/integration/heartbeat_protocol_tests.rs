//! Heartbeat state machine tests: one heartbeat in, one response out,
//! across every reported state and the work/sibling conditions that
//! influence the answer.

use std::sync::Arc;

use serde_json::json;

use save_orchestrator::models::agent::AgentState;
use save_orchestrator::models::heartbeat::{AgentInitConfig, AgentRunConfig, HeartbeatResponse};

use super::test_helpers::{heartbeat, test_app_state, FakeBackend, FakeRunner};

const EXEC: &str = "e1";

fn fixture() -> (Arc<FakeBackend>, Arc<FakeRunner>) {
    (FakeBackend::new(), FakeRunner::new())
}

#[tokio::test]
async fn starting_agent_receives_init_config_when_ready() {
    let (backend, runner) = fixture();
    backend.set_agent(EXEC, "a", AgentState::Starting);
    backend.set_init_config("a");
    let state = test_app_state(&backend, &runner);

    let response = state
        .heartbeats
        .handle(heartbeat(EXEC, "a", AgentState::Starting))
        .await;

    assert!(matches!(response, HeartbeatResponse::InitResponse { .. }));
}

#[tokio::test]
async fn starting_agent_waits_without_init_config() {
    let (backend, runner) = fixture();
    let state = test_app_state(&backend, &runner);

    let response = state
        .heartbeats
        .handle(heartbeat(EXEC, "a", AgentState::Starting))
        .await;

    assert_eq!(response, HeartbeatResponse::WaitResponse);
}

#[tokio::test]
async fn idle_agent_receives_next_batch() {
    let (backend, runner) = fixture();
    backend.enqueue_batches(2);
    let state = test_app_state(&backend, &runner);

    let response = state
        .heartbeats
        .handle(heartbeat(EXEC, "a", AgentState::Idle))
        .await;

    assert!(matches!(response, HeartbeatResponse::NewJobResponse { .. }));
    assert_eq!(backend.queued_batches(), 1);
}

#[tokio::test]
async fn each_batch_is_handed_out_once() {
    let (backend, runner) = fixture();
    backend.enqueue_batches(3);
    backend.set_agent(EXEC, "a", AgentState::Idle);
    backend.set_agent(EXEC, "b", AgentState::Busy);
    let state = test_app_state(&backend, &runner);

    let mut jobs = 0;
    for agent in ["a", "b", "a", "b"] {
        let response = state
            .heartbeats
            .handle(heartbeat(EXEC, agent, AgentState::Idle))
            .await;
        if matches!(response, HeartbeatResponse::NewJobResponse { .. }) {
            jobs += 1;
        }
    }

    assert_eq!(jobs, 3);
    assert_eq!(backend.queued_batches(), 0);
}

#[tokio::test]
async fn idle_agent_without_work_terminates_when_siblings_are_done() {
    let (backend, runner) = fixture();
    backend.set_agent(EXEC, "a", AgentState::Idle);
    backend.set_agent(EXEC, "b", AgentState::Finished);
    let state = test_app_state(&backend, &runner);

    let response = state
        .heartbeats
        .handle(heartbeat(EXEC, "a", AgentState::Idle))
        .await;

    assert_eq!(response, HeartbeatResponse::TerminateResponse);
    assert!(state.liveness.is_terminating("a"));
}

#[tokio::test]
async fn idle_agent_waits_for_starting_sibling() {
    let (backend, runner) = fixture();
    backend.set_agent(EXEC, "a", AgentState::Idle);
    backend.set_agent(EXEC, "b", AgentState::Starting);
    let state = test_app_state(&backend, &runner);

    let response = state
        .heartbeats
        .handle(heartbeat(EXEC, "a", AgentState::Idle))
        .await;

    assert_eq!(response, HeartbeatResponse::WaitResponse);
    assert!(!state.liveness.is_terminating("a"));
}

#[tokio::test]
async fn siblings_of_other_executions_are_ignored() {
    let (backend, runner) = fixture();
    backend.set_agent(EXEC, "a", AgentState::Idle);
    backend.set_agent("e2", "x", AgentState::Busy);
    let state = test_app_state(&backend, &runner);

    let response = state
        .heartbeats
        .handle(heartbeat(EXEC, "a", AgentState::Idle))
        .await;

    assert_eq!(response, HeartbeatResponse::TerminateResponse);
}

#[tokio::test]
async fn finished_with_saved_results_behaves_like_idle() {
    let (backend, runner) = fixture();
    backend.enqueue_batches(1);
    let state = test_app_state(&backend, &runner);

    let response = state
        .heartbeats
        .handle(heartbeat(EXEC, "a", AgentState::Finished))
        .await;

    assert!(matches!(response, HeartbeatResponse::NewJobResponse { .. }));
    assert!(backend.failed_marks().is_empty());
}

#[tokio::test]
async fn finished_with_saved_results_and_no_work_terminates() {
    let (backend, runner) = fixture();
    backend.set_agent(EXEC, "a", AgentState::Finished);
    let state = test_app_state(&backend, &runner);

    let response = state
        .heartbeats
        .handle(heartbeat(EXEC, "a", AgentState::Finished))
        .await;

    assert_eq!(response, HeartbeatResponse::TerminateResponse);
}

#[tokio::test]
async fn finished_with_unsaved_results_fails_tests_and_waits() {
    let (backend, runner) = fixture();
    backend.enqueue_batches(1);
    backend.set_unsaved("a");
    let state = test_app_state(&backend, &runner);

    let response = state
        .heartbeats
        .handle(heartbeat(EXEC, "a", AgentState::Finished))
        .await;

    assert_eq!(response, HeartbeatResponse::WaitResponse);
    assert_eq!(backend.failed_marks(), vec![vec!["a".to_owned()]]);
    assert_eq!(backend.queued_batches(), 1, "no new batch for unsaved results");
}

#[tokio::test]
async fn busy_agent_continues() {
    let (backend, runner) = fixture();
    backend.enqueue_batches(1);
    let state = test_app_state(&backend, &runner);

    let response = state
        .heartbeats
        .handle(heartbeat(EXEC, "a", AgentState::Busy))
        .await;

    assert_eq!(response, HeartbeatResponse::ContinueResponse);
    assert_eq!(backend.queued_batches(), 1);
}

#[tokio::test]
async fn failure_states_wait_without_termination() {
    for reported in [
        AgentState::BackendFailure,
        AgentState::BackendUnreachable,
        AgentState::CliFailed,
    ] {
        let (backend, runner) = fixture();
        backend.enqueue_batches(1);
        let state = test_app_state(&backend, &runner);

        let response = state
            .heartbeats
            .handle(heartbeat(EXEC, "a", reported))
            .await;

        assert_eq!(response, HeartbeatResponse::WaitResponse, "{reported:?}");
        assert!(!state.liveness.is_crashed("a"));
        assert_eq!(backend.queued_batches(), 1);
    }
}

#[tokio::test]
async fn orchestrator_only_states_are_treated_as_crashed() {
    for reported in AgentState::ALL
        .into_iter()
        .filter(|state| state.is_orchestrator_only())
    {
        let (backend, runner) = fixture();
        let state = test_app_state(&backend, &runner);

        let response = state
            .heartbeats
            .handle(heartbeat(EXEC, "a", reported))
            .await;

        assert_eq!(response, HeartbeatResponse::WaitResponse, "{reported:?}");
        assert!(state.liveness.is_crashed("a"), "{reported:?}");
    }
}

/// Conditions one heartbeat is answered under.
#[derive(Debug, Clone, Copy)]
struct Case {
    reported: AgentState,
    work_queued: bool,
    sibling_busy: bool,
    results_saved: bool,
}

/// Observable outcome of one heartbeat.
#[derive(Debug, PartialEq)]
struct Outcome {
    response: HeartbeatResponse,
    batch_consumed: bool,
    tests_failed: bool,
    terminating: bool,
    crashed: bool,
}

fn expected(case: Case) -> Outcome {
    let mut outcome = Outcome {
        response: HeartbeatResponse::WaitResponse,
        batch_consumed: false,
        tests_failed: false,
        terminating: false,
        crashed: false,
    };
    let asks_for_work = match case.reported {
        AgentState::Idle => true,
        AgentState::Finished => case.results_saved,
        _ => false,
    };
    if asks_for_work {
        if case.work_queued {
            outcome.response = HeartbeatResponse::NewJobResponse {
                config: AgentRunConfig(json!({ "batch": 0 })),
            };
            outcome.batch_consumed = true;
        } else if !case.sibling_busy {
            outcome.response = HeartbeatResponse::TerminateResponse;
            outcome.terminating = true;
        }
        return outcome;
    }
    match case.reported {
        AgentState::Starting => {
            outcome.response = HeartbeatResponse::InitResponse {
                config: AgentInitConfig(json!({ "agent": "a" })),
            };
        }
        AgentState::Finished => outcome.tests_failed = true,
        AgentState::Busy => outcome.response = HeartbeatResponse::ContinueResponse,
        AgentState::Crashed | AgentState::Terminated | AgentState::StoppedByOrch => {
            outcome.crashed = true;
        }
        AgentState::Idle
        | AgentState::BackendFailure
        | AgentState::BackendUnreachable
        | AgentState::CliFailed => {}
    }
    outcome
}

async fn observe(case: Case) -> Outcome {
    let (backend, runner) = fixture();
    backend.set_agent(EXEC, "a", case.reported);
    let sibling = if case.sibling_busy {
        AgentState::Busy
    } else {
        AgentState::Idle
    };
    backend.set_agent(EXEC, "b", sibling);
    backend.set_init_config("a");
    if case.work_queued {
        backend.enqueue_batches(1);
    }
    if !case.results_saved {
        backend.set_unsaved("a");
    }
    let state = test_app_state(&backend, &runner);

    let response = state
        .heartbeats
        .handle(heartbeat(EXEC, "a", case.reported))
        .await;

    let failed_marks = backend.failed_marks();
    assert!(
        failed_marks.is_empty() || failed_marks == vec![vec!["a".to_owned()]],
        "{case:?}: unexpected failed marks {failed_marks:?}"
    );
    let remaining = usize::from(case.work_queued);
    Outcome {
        response,
        batch_consumed: backend.queued_batches() < remaining,
        tests_failed: !failed_marks.is_empty(),
        terminating: state.liveness.is_terminating("a"),
        crashed: state.liveness.is_crashed("a"),
    }
}

#[tokio::test]
async fn every_state_and_condition_yields_the_expected_response() {
    for reported in AgentState::ALL {
        for work_queued in [false, true] {
            for sibling_busy in [false, true] {
                let saved_variants: &[bool] = if reported == AgentState::Finished {
                    &[true, false]
                } else {
                    &[true]
                };
                for &results_saved in saved_variants {
                    let case = Case {
                        reported,
                        work_queued,
                        sibling_busy,
                        results_saved,
                    };
                    assert_eq!(observe(case).await, expected(case), "{case:?}");
                }
            }
        }
    }
}

#[tokio::test]
async fn heartbeat_persists_state_and_refreshes_liveness() {
    let (backend, runner) = fixture();
    backend.set_agent(EXEC, "a", AgentState::Starting);
    let state = test_app_state(&backend, &runner);

    state
        .heartbeats
        .handle(heartbeat(EXEC, "a", AgentState::Busy))
        .await;

    assert_eq!(backend.agent_state("a"), Some(AgentState::Busy));
    assert_eq!(state.liveness.execution_id_of("a").as_deref(), Some(EXEC));
}

#[tokio::test]
async fn persistence_failure_degrades_to_continue_but_keeps_liveness() {
    let (backend, runner) = fixture();
    backend.enqueue_batches(1);
    backend.fail_status_updates();
    let state = test_app_state(&backend, &runner);

    let response = state
        .heartbeats
        .handle(heartbeat(EXEC, "a", AgentState::Idle))
        .await;

    assert_eq!(response, HeartbeatResponse::ContinueResponse);
    assert_eq!(backend.queued_batches(), 1, "no batch handed out on failure");
    assert!(state.liveness.contains_any_by_execution_id(EXEC));
}

#[tokio::test]
async fn queue_failure_degrades_to_continue() {
    let (backend, runner) = fixture();
    backend.fail_queue();
    let state = test_app_state(&backend, &runner);

    let response = state
        .heartbeats
        .handle(heartbeat(EXEC, "a", AgentState::Idle))
        .await;

    assert_eq!(response, HeartbeatResponse::ContinueResponse);
}

#[tokio::test]
async fn agent_cannot_move_to_another_execution() {
    let (backend, runner) = fixture();
    backend.enqueue_batches(1);
    let state = test_app_state(&backend, &runner);
    state
        .heartbeats
        .handle(heartbeat(EXEC, "a", AgentState::Busy))
        .await;

    let response = state
        .heartbeats
        .handle(heartbeat("e2", "a", AgentState::Idle))
        .await;

    assert_eq!(response, HeartbeatResponse::ContinueResponse);
    assert_eq!(state.liveness.execution_id_of("a").as_deref(), Some(EXEC));
    assert_eq!(backend.queued_batches(), 1);
}
