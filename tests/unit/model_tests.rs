//! Wire-format and helper tests for the domain models.

use chrono::{TimeZone, Utc};
use serde_json::json;

use save_orchestrator::config::GlobalConfig;
use save_orchestrator::models::agent::{AgentState, AgentStatus};
use save_orchestrator::models::container::{volume_name, ContainerRunConfiguration};
use save_orchestrator::models::execution::{ExecutionStatus, InitializeAgentsRequest};
use save_orchestrator::models::heartbeat::{
    AgentInitConfig, AgentRunConfig, Heartbeat, HeartbeatResponse,
};

fn config() -> GlobalConfig {
    GlobalConfig::from_toml_str(
        r#"
[backend]
url = "http://backend:5800"

[agent]
default_image = "save/agent:1"
run_command = "./save-agent"
orchestrator_url = "http://orchestrator:5100"
memory_limit = "2g"
"#,
    )
    .expect("valid config")
}

#[test]
fn agent_state_uses_screaming_snake_case() {
    assert_eq!(
        serde_json::to_value(AgentState::BackendUnreachable).expect("serialize"),
        json!("BACKEND_UNREACHABLE")
    );
    assert_eq!(
        serde_json::from_value::<AgentState>(json!("STOPPED_BY_ORCH")).expect("deserialize"),
        AgentState::StoppedByOrch
    );
    assert!(serde_json::from_value::<AgentState>(json!("SLEEPING")).is_err());
}

#[test]
fn only_starting_and_busy_block_termination() {
    let blocking: Vec<AgentState> = AgentState::ALL
        .into_iter()
        .filter(|state| state.blocks_termination())
        .collect();
    assert_eq!(blocking, vec![AgentState::Starting, AgentState::Busy]);
}

#[test]
fn orchestrator_only_states() {
    let only: Vec<AgentState> = AgentState::ALL
        .into_iter()
        .filter(|state| state.is_orchestrator_only())
        .collect();
    assert_eq!(
        only,
        vec![
            AgentState::Crashed,
            AgentState::Terminated,
            AgentState::StoppedByOrch
        ]
    );
}

#[test]
fn heartbeat_deserializes_camel_case() {
    let heartbeat: Heartbeat = serde_json::from_value(json!({
        "agentId": "c1",
        "state": "IDLE",
        "executionProgress": { "executionId": "e1", "percentCompletion": 40 },
        "timestamp": "2026-01-02T03:04:05Z"
    }))
    .expect("deserialize");

    assert_eq!(heartbeat.agent_id, "c1");
    assert_eq!(heartbeat.state, AgentState::Idle);
    assert_eq!(heartbeat.execution_progress.execution_id, "e1");
    assert_eq!(heartbeat.execution_progress.percent_completion, 40);
    assert_eq!(
        heartbeat.timestamp,
        Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap()
    );
}

#[test]
fn heartbeat_response_is_tagged_by_type() {
    let init = HeartbeatResponse::InitResponse {
        config: AgentInitConfig(json!({ "saveCliUrl": "http://files/save" })),
    };
    assert_eq!(
        serde_json::to_value(&init).expect("serialize"),
        json!({ "type": "InitResponse", "config": { "saveCliUrl": "http://files/save" } })
    );
    assert_eq!(
        serde_json::to_value(HeartbeatResponse::TerminateResponse).expect("serialize"),
        json!({ "type": "TerminateResponse" })
    );

    let job: HeartbeatResponse = serde_json::from_value(json!({
        "type": "NewJobResponse",
        "config": { "tests": ["a", "b"] }
    }))
    .expect("deserialize");
    assert_eq!(
        job,
        HeartbeatResponse::NewJobResponse {
            config: AgentRunConfig(json!({ "tests": ["a", "b"] }))
        }
    );
}

#[test]
fn response_kinds_are_distinct() {
    let kinds = [
        HeartbeatResponse::InitResponse {
            config: AgentInitConfig(json!({})),
        }
        .kind(),
        HeartbeatResponse::NewJobResponse {
            config: AgentRunConfig(json!({})),
        }
        .kind(),
        HeartbeatResponse::ContinueResponse.kind(),
        HeartbeatResponse::WaitResponse.kind(),
        HeartbeatResponse::TerminateResponse.kind(),
    ];
    let unique: std::collections::HashSet<_> = kinds.iter().collect();
    assert_eq!(unique.len(), kinds.len());
}

#[test]
fn agent_status_round_trips_backend_shape() {
    let status: AgentStatus = serde_json::from_value(json!({
        "containerId": "c1",
        "state": "BUSY",
        "time": "2026-01-02T03:04:05Z"
    }))
    .expect("deserialize");
    assert_eq!(status.container_id, "c1");
    assert_eq!(status.state, AgentState::Busy);
}

#[test]
fn execution_status_wire_names() {
    assert_eq!(
        serde_json::to_value(ExecutionStatus::Finished).expect("serialize"),
        json!("FINISHED")
    );
    assert_eq!(
        serde_json::to_value(ExecutionStatus::Error).expect("serialize"),
        json!("ERROR")
    );
}

#[test]
fn initialize_request_defaults_optional_fields() {
    let request: InitializeAgentsRequest =
        serde_json::from_value(json!({ "executionId": "e1", "replicas": 2 }))
            .expect("deserialize");
    assert_eq!(request.sdk, "");
    assert!(request.organization.is_none());
    assert!(request.project.is_none());
}

#[test]
fn default_sdk_selects_configured_image() {
    let config = config();
    let request = InitializeAgentsRequest {
        execution_id: "e1".into(),
        sdk: "default".into(),
        replicas: 1,
        organization: Some("org".into()),
        project: None,
    };

    let run = ContainerRunConfiguration::for_request(&request, &config.agent, &config.docker);

    assert_eq!(run.image, "save/agent:1");
    assert_eq!(run.run_command, "./save-agent");
    assert_eq!(run.resources.memory.as_deref(), Some("2g"));
    assert!(run.resources.cpu.is_none());
    assert_eq!(run.volume.name, volume_name("e1"));
    assert_eq!(run.volume.mount_path, config.docker.volume_mount_path);
    assert_eq!(run.env.get("SAVE_EXECUTION_ID").map(String::as_str), Some("e1"));
    assert_eq!(
        run.env.get("SAVE_ORCHESTRATOR_URL").map(String::as_str),
        Some("http://orchestrator:5100")
    );
    assert_eq!(run.env.get("SAVE_ORGANIZATION").map(String::as_str), Some("org"));
    assert!(!run.env.contains_key("SAVE_PROJECT"));
}

#[test]
fn explicit_sdk_is_used_as_image() {
    let config = config();
    let request = InitializeAgentsRequest {
        execution_id: "e1".into(),
        sdk: "eclipse-temurin:17".into(),
        replicas: 1,
        organization: None,
        project: None,
    };

    let run = ContainerRunConfiguration::for_request(&request, &config.agent, &config.docker);
    assert_eq!(run.image, "eclipse-temurin:17");
}

#[test]
fn volume_name_is_scoped_to_execution() {
    assert_eq!(volume_name("42"), "save-execution-42");
}
