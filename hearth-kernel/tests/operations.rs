mod common;

use common::{add_node, start_kernel};
use hearth_devkit::{wait_until, MockAgent};
use hearth_kernel::backups::{self, AUTO_PAYLOAD};
use hearth_kernel::commands::CommandError;
use hearth_kernel::config::KernelConfig;
use hearth_kernel::models::BackupKind;
use hearth_kernel::operations::{self, CreateInstanceRequest, InstanceAction, OperationError};
use hearth_kernel::KernelState;
use hearth_protocol::{CommandAck, CommandKind, InstanceStatus};
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(2);

async fn create(state: &KernelState, node_id: &str) -> String {
    operations::create_instance(
        state,
        CreateInstanceRequest {
            node_id: node_id.to_string(),
            name: "Asgard".into(),
            world_name: None,
            password: "hunter22".into(),
            image: None,
        },
    )
    .await
    .unwrap()
    .instance
    .id
}

#[tokio::test]
async fn create_instance_dispatches_create_with_instance_id() {
    let (state, addr) = start_kernel(KernelConfig::default()).await;
    let node = add_node(&state, "alpha");
    let mut agent = MockAgent::connect_registered(addr, &node.token, "alpha").await.unwrap();
    assert!(wait_until(WAIT, || state.nodes.is_connected(&node.token)).await);

    let id = create(&state, &node.id).await;

    let cmd = agent.expect_command(WAIT).await.unwrap();
    assert_eq!(cmd.kind, CommandKind::Create);
    assert_eq!(cmd.command_id, id);
    assert_eq!(cmd.config.instance_id, id);
    assert_eq!(cmd.config.world_name, "Asgard");
    assert!(cmd.config.rcon_configured());
}

#[tokio::test]
async fn start_sets_transitional_status() {
    let (state, addr) = start_kernel(KernelConfig::default()).await;
    let node = add_node(&state, "alpha");
    let mut agent = MockAgent::connect_registered(addr, &node.token, "alpha").await.unwrap();
    assert!(wait_until(WAIT, || state.nodes.is_connected(&node.token)).await);
    let id = create(&state, &node.id).await;
    agent.expect_command(WAIT).await.unwrap();

    let view = operations::instance_action(&state, &id, InstanceAction::Start).await.unwrap();
    assert_eq!(view.status, InstanceStatus::Starting);
    assert_eq!(agent.expect_command(WAIT).await.unwrap().kind, CommandKind::Start);
}

#[tokio::test]
async fn rcon_round_trip_trims_output() {
    let (state, addr) = start_kernel(KernelConfig::default()).await;
    let node = add_node(&state, "alpha");
    let id = create(&state, &node.id).await;
    let agent = MockAgent::connect_registered(addr, &node.token, "alpha").await.unwrap();
    assert!(wait_until(WAIT, || state.nodes.is_connected(&node.token)).await);

    let responder = agent.spawn_responder(|cmd| match cmd.kind {
        CommandKind::Rcon => Some(CommandAck::ok(&cmd.command_id, format!("  ran {}\n", cmd.payload))),
        _ => None,
    });

    let output = operations::rcon(&state, &id, "save").await.unwrap();
    assert_eq!(output, "ran save");

    let ops = state.store.list_operations(1);
    assert_eq!(ops[0].action, "rcon");
    assert!(ops[0].success);
    responder.abort();
}

#[tokio::test]
async fn rcon_failure_is_reported_as_rejection() {
    let (state, addr) = start_kernel(KernelConfig::default()).await;
    let node = add_node(&state, "alpha");
    let id = create(&state, &node.id).await;
    let agent = MockAgent::connect_registered(addr, &node.token, "alpha").await.unwrap();
    assert!(wait_until(WAIT, || state.nodes.is_connected(&node.token)).await);

    let responder =
        agent.spawn_responder(|cmd| Some(CommandAck::failed(&cmd.command_id, "rcon auth failed: bad password")));

    let err = operations::rcon(&state, &id, "info").await.unwrap_err();
    match err {
        OperationError::Command(CommandError::Rejected(msg)) => assert!(msg.contains("auth failed")),
        other => panic!("unexpected error: {other}"),
    }
    responder.abort();
}

#[tokio::test]
async fn manual_backup_records_archive() {
    let (state, addr) = start_kernel(KernelConfig::default()).await;
    let node = add_node(&state, "alpha");
    let id = create(&state, &node.id).await;
    let agent = MockAgent::connect_registered(addr, &node.token, "alpha").await.unwrap();
    assert!(wait_until(WAIT, || state.nodes.is_connected(&node.token)).await);

    let responder = agent.spawn_responder(|cmd| match cmd.kind {
        CommandKind::Backup => Some(CommandAck::ok(
            &cmd.command_id,
            format!("/data/backups/{}-20240101-120000.tar.gz|4096", cmd.config.instance_id),
        )),
        _ => None,
    });

    let record = backups::create_backup(&state, &id, "before update", BackupKind::Manual, WAIT)
        .await
        .unwrap();
    assert_eq!(record.size_bytes, 4096);
    assert_eq!(record.note, "before update");
    assert_eq!(state.store.list_backups(&id).len(), 1);

    responder.abort();
}

#[tokio::test]
async fn auto_backup_pass_covers_running_instances() {
    let (state, addr) = start_kernel(KernelConfig::default()).await;
    let node = add_node(&state, "alpha");
    let running = create(&state, &node.id).await;
    let idle = create(&state, &node.id).await;
    state.store.set_instance_status(&running, InstanceStatus::Running).unwrap();
    state.store.set_instance_status(&idle, InstanceStatus::Stopped).unwrap();

    let agent = MockAgent::connect_registered(addr, &node.token, "alpha").await.unwrap();
    assert!(wait_until(WAIT, || state.nodes.is_connected(&node.token)).await);
    let responder = agent.spawn_responder(|cmd| {
        assert_eq!(cmd.payload, AUTO_PAYLOAD);
        assert!(cmd.command_id.starts_with("auto-"));
        Some(CommandAck::ok(&cmd.command_id, "/data/backups/auto.tar.gz|1"))
    });

    assert_eq!(backups::run_auto_backups(&state).await, 1);
    let records = state.store.list_backups(&running);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].kind, BackupKind::Auto);
    assert!(state.store.list_backups(&idle).is_empty());
    responder.abort();
}
