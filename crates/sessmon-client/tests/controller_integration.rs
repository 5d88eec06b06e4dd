//! Integration tests for the streaming session controller.
//!
//! These drive a real controller actor through a scripted transport and
//! observe it only through `SessionHandle`.
//!
//! Tests CAN use `.unwrap()` and `.expect()` - this is allowed.
//! We test the panic-free behavior of production code through assertions.

mod support;

use std::time::Duration;

use sessmon_client::{
    ClientConfig, ClientError, CommandAction, CommandOutcome, ConnectionState, SessionController,
    RECONNECT_EXHAUSTED,
};
use sessmon_core::{SessionStatus, StepStatus};
use sessmon_protocol::OutboundCommand;
use tokio::time::{sleep, timeout};

use support::{test_config, wait_until, ScriptedTransport, WAIT};

fn step_statuses(snapshot: &sessmon_client::SessionSnapshot) -> Vec<StepStatus> {
    snapshot.session.steps.iter().map(|s| s.status).collect()
}

// ============================================================================
// Analysis Flow
// ============================================================================

#[tokio::test]
async fn test_analysis_happy_path() {
    let transport = ScriptedTransport::new();
    let feed = transport.accept();
    let controller = SessionController::new(test_config(), transport.clone());
    let handle = controller.open("analysis-1").await.unwrap();

    wait_until(&handle, |s| s.connection == ConnectionState::Connected).await;

    feed.data(r#"{"type":"mode","totalSteps":3,"mode":"full"}"#);
    for n in 1..=3 {
        feed.data(&format!(r#"{{"step":{n},"status":"running"}}"#));
        feed.data(&format!(r#"{{"step":{n},"status":"complete"}}"#));
    }
    feed.data(r#"{"type":"result","report":{"validationStatus":"ready"}}"#);

    let done = wait_until(&handle, |s| s.connection == ConnectionState::Finished).await;
    assert_eq!(done.session.status, SessionStatus::Completed);
    assert_eq!(done.session.validation_status.as_deref(), Some("ready"));
    assert_eq!(step_statuses(&done), vec![StepStatus::Completed; 3]);
    assert_eq!(done.session.mode.as_deref(), Some("full"));
}

#[tokio::test]
async fn test_malformed_frame_does_not_stop_stream() {
    let transport = ScriptedTransport::new();
    let feed = transport.accept();
    let controller = SessionController::new(test_config(), transport.clone());
    let handle = controller.open("analysis-2").await.unwrap();

    feed.data(r#"{"type":"mode","totalSteps":2,"mode":"quick"}"#);
    feed.data("{not json");
    feed.data(r#"{"step":1,"status":"running"}"#);

    let snapshot = wait_until(&handle, |s| {
        s.session.steps.first().map(|st| st.status) == Some(StepStatus::Running)
    })
    .await;
    assert_eq!(snapshot.connection, ConnectionState::Connected);
    assert_eq!(snapshot.session.status, SessionStatus::Running);
}

// ============================================================================
// Reconnection
// ============================================================================

#[tokio::test]
async fn test_reconnect_keeps_state_then_applies_snapshot() {
    let transport = ScriptedTransport::new();
    let first = transport.accept();
    let second = transport.accept();
    let controller = SessionController::new(test_config(), transport.clone());
    let handle = controller.open("exec-1").await.unwrap();

    first.data(r#"{"type":"step_start","step":{"id":"s1","name":"Plan"}}"#);
    first.data(r#"{"type":"step_complete"}"#);
    wait_until(&handle, |s| step_statuses(s) == vec![StepStatus::Completed]).await;

    // Server goes away mid-run.
    drop(first);

    let reconnected = wait_until(&handle, |s| {
        s.connection == ConnectionState::Connected && transport.opens().len() == 2
    })
    .await;
    // Nothing was lost while reconnecting.
    assert_eq!(step_statuses(&reconnected), vec![StepStatus::Completed]);

    second.data(
        r#"{"type":"state","data":{"id":"exec-1","status":"running","steps":[
            {"id":"s1","name":"Plan","status":"completed"},
            {"id":"s2","name":"Code","status":"running"}
        ],"currentStep":"s2"}}"#,
    );
    let snapshot = wait_until(&handle, |s| s.session.steps.len() == 2).await;
    assert_eq!(
        step_statuses(&snapshot),
        vec![StepStatus::Completed, StepStatus::Running]
    );
    assert_eq!(snapshot.session.current_step_id.as_deref(), Some("s2"));
}

#[tokio::test]
async fn test_read_error_marks_state_stale() {
    let transport = ScriptedTransport::new();
    let first = transport.accept();
    let controller = SessionController::new(
        ClientConfig {
            retry_initial_delay: Duration::from_millis(300),
            ..test_config()
        },
        transport.clone(),
    );
    let handle = controller.open("exec-2").await.unwrap();

    first.data(r#"{"type":"output","content":"hello"}"#);
    wait_until(&handle, |s| s.session.output.len() == 1).await;

    first.fail("connection reset");
    let stale = wait_until(&handle, |s| s.is_stale()).await;
    assert_eq!(stale.connection, ConnectionState::Reconnecting { attempt: 1 });
    assert_eq!(stale.session.output.len(), 1);
}

#[tokio::test]
async fn test_last_event_id_sent_on_reconnect() {
    let transport = ScriptedTransport::new();
    let first = transport.accept();
    let _second = transport.accept();
    let controller = SessionController::new(test_config(), transport.clone());
    let handle = controller.open("exec-3").await.unwrap();

    first.data_with_id(r#"{"type":"output","content":"one"}"#, "41");
    wait_until(&handle, |s| s.session.output.len() == 1).await;
    drop(first);

    wait_until(&handle, |_| transport.opens().len() == 2).await;
    assert_eq!(transport.opens(), vec![None, Some("41".to_string())]);
}

#[tokio::test]
async fn test_reconnect_exhaustion_fails_session() {
    let transport = ScriptedTransport::new();
    transport.refuse();
    let controller = SessionController::new(test_config(), transport.clone());
    let handle = controller.open("exec-4").await.unwrap();

    let failed = wait_until(&handle, |s| {
        matches!(s.connection, ConnectionState::Failed { .. })
    })
    .await;
    assert_eq!(failed.session.status, SessionStatus::Error);
    assert_eq!(failed.session.error.as_deref(), Some(RECONNECT_EXHAUSTED));
    assert_eq!(transport.opens().len(), 3);

    // The actor keeps serving queries after failing.
    let err = handle.pause().await.unwrap_err();
    assert!(matches!(err, ClientError::SessionEnded { .. }));
}

#[tokio::test]
async fn test_streams_that_close_immediately_exhaust_attempts() {
    let transport = ScriptedTransport::new();
    for _ in 0..3 {
        // Accepted, then hung up before any frame.
        drop(transport.accept());
    }
    let _unused = transport.accept();
    let controller = SessionController::new(test_config(), transport.clone());
    let handle = controller.open("exec-14").await.unwrap();

    let failed = wait_until(&handle, |s| {
        matches!(s.connection, ConnectionState::Failed { .. })
    })
    .await;
    assert_eq!(failed.session.error.as_deref(), Some(RECONNECT_EXHAUSTED));
    assert_eq!(transport.opens().len(), 3);
}

#[tokio::test]
async fn test_idle_stream_triggers_reconnect() {
    let transport = ScriptedTransport::new();
    let _silent = transport.accept();
    let _next = transport.accept();
    let controller = SessionController::new(
        ClientConfig {
            idle_timeout: Some(Duration::from_millis(50)),
            ..test_config()
        },
        transport.clone(),
    );
    let _handle = controller.open("exec-5").await.unwrap();

    timeout(WAIT, async {
        while transport.opens().len() < 2 {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

// ============================================================================
// Commands
// ============================================================================

#[tokio::test]
async fn test_approval_round_trip() {
    let transport = ScriptedTransport::new();
    let feed = transport.accept();
    let controller = SessionController::new(test_config(), transport.clone());
    let handle = controller.open("exec-6").await.unwrap();

    feed.data(r#"{"type":"step_start","step":{"id":"s1","name":"Deploy"}}"#);
    feed.data(r#"{"type":"approval_required","request":{"id":"a1","type":"confirmation","title":"Push to prod?","description":"git push"}}"#);
    let waiting = wait_until(&handle, |s| s.session.status == SessionStatus::WaitingApproval).await;
    assert_eq!(waiting.session.pending_approval.as_ref().map(|a| a.id.as_str()), Some("a1"));

    let issuer = handle.clone();
    let approve = tokio::spawn(async move { issuer.approve(Some("go".to_string())).await });

    // Optimistic view before the backend answers.
    let optimistic = wait_until(&handle, |s| !s.intents.is_empty()).await;
    assert_eq!(optimistic.session.status, SessionStatus::Running);
    assert!(optimistic.session.pending_approval.is_none());
    assert_eq!(optimistic.intents.first().unwrap().action, CommandAction::Approve);

    feed.data(r#"{"type":"approval_response","approved":true,"response":"go"}"#);
    let outcome = timeout(WAIT, approve).await.unwrap().unwrap().unwrap();
    assert_eq!(outcome, CommandOutcome::Acknowledged);

    let settled = handle.snapshot();
    assert!(settled.intents.is_empty());
    assert_eq!(settled.session.status, SessionStatus::Running);
    assert!(settled.session.pending_approval.is_none());
    assert_eq!(
        transport.sent(),
        vec![OutboundCommand::approval(true, Some("go".to_string()))]
    );
}

#[tokio::test]
async fn test_status_change_overrides_pending_approval() {
    let transport = ScriptedTransport::new();
    let feed = transport.accept();
    let controller = SessionController::new(test_config(), transport.clone());
    let handle = controller.open("exec-15").await.unwrap();

    feed.data(r#"{"type":"approval_required","request":{"id":"a1","title":"Delete branch?"}}"#);
    wait_until(&handle, |s| s.session.status == SessionStatus::WaitingApproval).await;

    let issuer = handle.clone();
    let approve = tokio::spawn(async move { issuer.approve(None).await });
    wait_until(&handle, |s| !s.intents.is_empty()).await;

    // Backend pauses instead of answering the approval.
    feed.data(r#"{"type":"status_change","status":"paused"}"#);
    let outcome = timeout(WAIT, approve).await.unwrap().unwrap().unwrap();
    assert_eq!(outcome, CommandOutcome::Acknowledged);
    let paused = wait_until(&handle, |s| s.session.status == SessionStatus::Paused).await;
    assert!(paused.intents.is_empty());

    feed.data(r#"{"type":"approval_required","request":{"id":"a2","title":"Force push?"}}"#);
    let waiting = wait_until(&handle, |s| {
        s.session.pending_approval.as_ref().map(|a| a.id.as_str()) == Some("a2")
    })
    .await;
    assert_eq!(waiting.session.status, SessionStatus::WaitingApproval);
    assert!(waiting.intents.is_empty());
}

#[tokio::test]
async fn test_server_wins_over_optimistic_pause() {
    let transport = ScriptedTransport::new();
    let feed = transport.accept();
    let controller = SessionController::new(test_config(), transport.clone());
    let handle = controller.open("exec-7").await.unwrap();

    feed.data(r#"{"type":"status_change","status":"running"}"#);
    wait_until(&handle, |s| s.session.status == SessionStatus::Running).await;

    let issuer = handle.clone();
    let pause = tokio::spawn(async move { issuer.pause().await });
    wait_until(&handle, |s| s.session.status == SessionStatus::Paused).await;

    // Backend refuses to pause.
    feed.data(r#"{"type":"status_change","status":"running"}"#);
    let outcome = timeout(WAIT, pause).await.unwrap().unwrap().unwrap();
    assert_eq!(outcome, CommandOutcome::Acknowledged);
    assert_eq!(handle.snapshot().session.status, SessionStatus::Running);
}

#[tokio::test]
async fn test_unconfirmed_command_keeps_overlay_until_rollback() {
    let transport = ScriptedTransport::new();
    let feed = transport.accept();
    let controller = SessionController::new(
        ClientConfig {
            command_ack_timeout: Duration::from_millis(100),
            ..test_config()
        },
        transport.clone(),
    );
    let handle = controller.open("exec-8").await.unwrap();

    feed.data(r#"{"type":"status_change","status":"running"}"#);
    wait_until(&handle, |s| s.session.status == SessionStatus::Running).await;

    let outcome = handle.pause().await.unwrap();
    assert_eq!(outcome, CommandOutcome::Unconfirmed);

    let expired = wait_until(&handle, |s| s.intents.first().is_some_and(|i| i.expired)).await;
    assert_eq!(expired.session.status, SessionStatus::Paused);

    assert_eq!(handle.rollback_unconfirmed().await.unwrap(), 1);
    let rolled_back = wait_until(&handle, |s| s.intents.is_empty()).await;
    assert_eq!(rolled_back.session.status, SessionStatus::Running);
}

#[tokio::test]
async fn test_failed_command_leaves_intent_in_place() {
    let transport = ScriptedTransport::new();
    let feed = transport.accept();
    transport.fail_sends(true);
    let controller = SessionController::new(test_config(), transport.clone());
    let handle = controller.open("exec-9").await.unwrap();

    feed.data(r#"{"type":"status_change","status":"running"}"#);
    wait_until(&handle, |s| s.session.status == SessionStatus::Running).await;

    let err = handle.stop().await.unwrap_err();
    assert!(matches!(err, ClientError::CommandFailed { ref action, .. } if action == "stop"));

    let snapshot = wait_until(&handle, |s| s.intents.first().is_some_and(|i| i.expired)).await;
    assert_eq!(snapshot.session.status, SessionStatus::Stopped);
}

#[tokio::test]
async fn test_command_on_terminal_session_is_rejected() {
    let transport = ScriptedTransport::new();
    let feed = transport.accept();
    let controller = SessionController::new(test_config(), transport.clone());
    let handle = controller.open("exec-10").await.unwrap();

    feed.data(r#"{"type":"complete","result":{"ok":true}}"#);
    wait_until(&handle, |s| s.connection == ConnectionState::Finished).await;

    let err = handle.resume().await.unwrap_err();
    assert!(matches!(err, ClientError::SessionEnded { ref status } if status == "completed"));
    assert!(transport.sent().is_empty());
}

// ============================================================================
// Open / Close
// ============================================================================

#[tokio::test]
async fn test_open_is_idempotent_per_session() {
    let transport = ScriptedTransport::new();
    let _feed = transport.accept();
    let controller = SessionController::new(test_config(), transport.clone());

    let first = controller.open("exec-11").await.unwrap();
    let second = controller.open("exec-11").await.unwrap();
    assert_eq!(first.session_id(), second.session_id());

    wait_until(&first, |s| s.connection == ConnectionState::Connected).await;
    assert_eq!(transport.opens().len(), 1);

    let err = controller.open("other").await.unwrap_err();
    assert!(matches!(err, ClientError::AlreadyOpen { .. }));

    controller.close().await;
    controller.close().await;
    assert!(first.is_closed());
    assert!(controller.current().await.is_none());

    let _feed = transport.accept();
    assert!(controller.open("other").await.is_ok());
}

#[tokio::test]
async fn test_close_before_connect_publishes_nothing() {
    let transport = ScriptedTransport::new();
    let feed = transport.accept();
    let controller = SessionController::new(test_config(), transport.clone());
    let handle = controller.open("exec-12").await.unwrap();

    handle.close();
    handle.close();
    let revision = handle.snapshot().revision;

    feed.data(r#"{"type":"output","content":"late"}"#);
    sleep(Duration::from_millis(50)).await;

    let snapshot = handle.snapshot();
    assert_eq!(snapshot.revision, revision);
    assert!(snapshot.session.output.is_empty());

    let closed = timeout(WAIT, handle.wait_for(|_| false)).await.unwrap();
    assert!(matches!(closed, Err(ClientError::Closed)));
    assert!(matches!(handle.pause().await, Err(ClientError::Closed)));
}

#[tokio::test]
async fn test_revisions_strictly_increase() {
    let transport = ScriptedTransport::new();
    let feed = transport.accept();
    let controller = SessionController::new(test_config(), transport.clone());
    let handle = controller.open("exec-13").await.unwrap();
    let mut updates = handle.subscribe();

    for n in 0..5 {
        feed.data(&format!(r#"{{"type":"output","content":"line {n}"}}"#));
    }

    let mut last = updates.borrow_and_update().revision;
    loop {
        timeout(WAIT, updates.changed()).await.unwrap().unwrap();
        let snapshot = updates.borrow_and_update().clone();
        assert!(snapshot.revision > last);
        last = snapshot.revision;
        if snapshot.session.output.len() == 5 {
            break;
        }
    }
}
