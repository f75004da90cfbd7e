//! Engine-level integration tests: response correlation, exclusivity,
//! check-in handling, and event fan-out against in-memory storage and a
//! recording transport.

mod common;

use std::sync::Arc;

use praxis::chrono::Utc;
use praxis::mdm::{CheckinMessage, TokenUpdate};
use praxis::storage::{EventSubscription, EventSubscriptionStorage, InMemStorage, Storage};
use praxis::workflow::{Config, EventFlag, Exclusivity};
use praxis::{Engine, EngineError};

use common::{ack, ids, MockEnqueuer, TestWorkflow};

type TestEngine = Engine<InMemStorage, MockEnqueuer>;

struct Fixture {
    storage: Arc<InMemStorage>,
    enqueuer: Arc<MockEnqueuer>,
    engine: Arc<TestEngine>,
}

fn fixture(multi: bool) -> Fixture {
    let storage = Arc::new(InMemStorage::new());
    let enqueuer = Arc::new(MockEnqueuer::new(multi));
    let engine = Arc::new(
        Engine::new(storage.clone(), enqueuer.clone()).with_event_storage(storage.clone()),
    );
    Fixture {
        storage,
        enqueuer,
        engine,
    }
}

fn workflow(fx: &Fixture, wf: TestWorkflow) -> Arc<TestWorkflow> {
    let wf = Arc::new(wf);
    wf.set_enqueuer(fx.engine.clone());
    fx.engine.register_workflow(wf.clone());
    wf
}

#[tokio::test]
async fn unknown_workflow_and_empty_ids() {
    let fx = fixture(true);
    let err = fx
        .engine
        .start_workflow("test.nope", b"", &ids(&["A"]), None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NoSuchWorkflow(_)));

    workflow(&fx, TestWorkflow::new("test.wf"));
    let err = fx
        .engine
        .start_workflow("test.wf", b"", &[], None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NoIds));
}

/// Single-command single-id happy path: one transport enqueue, one step
/// completion with the response payload, rows erased.
#[tokio::test]
async fn single_command_happy_path() {
    let fx = fixture(true);
    let wf = workflow(
        &fx,
        TestWorkflow::new("test.wf").with_command("U1", "DeviceInformation"),
    );

    fx.engine
        .start_workflow("test.wf", b"start-ctx", &ids(&["A"]), None, None)
        .await
        .unwrap();

    // the start context reached the workflow
    {
        let starts = wf.starts.lock().unwrap();
        assert_eq!(starts.len(), 1);
        assert_eq!(starts[0].ids, ids(&["A"]));
        assert_eq!(starts[0].context.as_deref(), Some("start-ctx"));
    }

    // one raw command went to the transport for A
    {
        let enqueues = fx.enqueuer.enqueues.lock().unwrap();
        assert_eq!(enqueues.len(), 1);
        assert_eq!(enqueues[0].0, ids(&["A"]));
        assert!(!enqueues[0].1.is_empty());
    }

    fx.engine
        .mdm_command_response_event("A", "U1", &ack("U1", "Acknowledged"), None)
        .await
        .unwrap();

    {
        let completions = wf.completions.lock().unwrap();
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].id, "A");
        assert_eq!(completions[0].step_name, "main");
        assert_eq!(
            completions[0].results,
            vec![("U1".to_string(), "Acknowledged".to_string())]
        );
    }

    // rows are gone
    assert_eq!(
        fx.storage
            .retrieve_command_request_type("A", "U1")
            .await
            .unwrap(),
        None
    );
}

/// Responses for uuids the engine never enqueued are silently ignored.
#[tokio::test]
async fn untracked_response_is_ignored() {
    let fx = fixture(true);
    let wf = workflow(&fx, TestWorkflow::new("test.wf").with_command("U1", "DeviceLock"));

    fx.engine
        .start_workflow("test.wf", b"", &ids(&["A"]), None, None)
        .await
        .unwrap();

    fx.engine
        .mdm_command_response_event("A", "U-other", &ack("U-other", "Acknowledged"), None)
        .await
        .unwrap();
    assert_eq!(wf.completion_count(), 0);
}

/// NotNow leaves the step pending; a later Acknowledged completes it.
#[tokio::test]
async fn not_now_defers_completion() {
    let fx = fixture(true);
    let wf = workflow(&fx, TestWorkflow::new("test.wf").with_command("U1", "DeviceLock"));

    fx.engine
        .start_workflow("test.wf", b"", &ids(&["A"]), None, None)
        .await
        .unwrap();

    fx.engine
        .mdm_command_response_event("A", "U1", &ack("U1", "NotNow"), None)
        .await
        .unwrap();
    assert_eq!(wf.completion_count(), 0);
    assert!(fx
        .storage
        .retrieve_command_request_type("A", "U1")
        .await
        .unwrap()
        .is_some());

    fx.engine
        .mdm_command_response_event("A", "U1", &ack("U1", "Acknowledged"), None)
        .await
        .unwrap();
    assert_eq!(wf.completion_count(), 1);
}

/// Multi-command step: completion fires only after the last response,
/// with both results present.
#[tokio::test]
async fn multi_command_completion_ordering() {
    let fx = fixture(true);
    let wf = workflow(
        &fx,
        TestWorkflow::new("test.wf")
            .with_command("U1", "DeviceInformation")
            .with_command("U2", "SecurityInfo"),
    );

    fx.engine
        .start_workflow("test.wf", b"", &ids(&["A"]), None, None)
        .await
        .unwrap();
    assert_eq!(fx.enqueuer.enqueue_count(), 2);

    fx.engine
        .mdm_command_response_event("A", "U1", &ack("U1", "Acknowledged"), None)
        .await
        .unwrap();
    assert_eq!(wf.completion_count(), 0);

    fx.engine
        .mdm_command_response_event("A", "U2", &ack("U2", "Acknowledged"), None)
        .await
        .unwrap();

    let completions = wf.completions.lock().unwrap();
    assert_eq!(completions.len(), 1);
    let mut uuids: Vec<_> = completions[0]
        .results
        .iter()
        .map(|(uuid, status)| {
            assert_eq!(status, "Acknowledged");
            uuid.clone()
        })
        .collect();
    uuids.sort();
    assert_eq!(uuids, vec!["U1".to_string(), "U2".to_string()]);
}

/// Exclusivity: a second start on overlapping ids shrinks to the
/// non-running subset; all-running fails with AlreadyRunning.
#[tokio::test]
async fn exclusive_workflow_shrinks_overlapping_start() {
    let fx = fixture(true);
    let wf = workflow(&fx, TestWorkflow::new("test.wf").with_command("U1", "DeviceLock"));

    fx.engine
        .start_workflow("test.wf", b"", &ids(&["A", "B"]), None, None)
        .await
        .unwrap();

    // B is still outstanding; only C starts
    fx.engine
        .start_workflow("test.wf", b"", &ids(&["B", "C"]), None, None)
        .await
        .unwrap();
    {
        let starts = wf.starts.lock().unwrap();
        assert_eq!(starts.len(), 2);
        assert_eq!(starts[1].ids, ids(&["C"]));
    }

    // every id running: hard failure
    let err = fx
        .engine
        .start_workflow("test.wf", b"", &ids(&["A", "B"]), None, None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::AlreadyRunning { running: 2, total: 2 }
    ));
}

/// MultipleSimultaneous workflows skip the exclusivity check.
#[tokio::test]
async fn multiple_simultaneous_allows_restart() {
    let fx = fixture(true);
    let wf = workflow(
        &fx,
        TestWorkflow::new("test.wf").with_config(Config {
            exclusivity: Exclusivity::MultipleSimultaneous,
            ..Config::default()
        }),
    );

    fx.engine
        .start_workflow("test.wf", b"", &ids(&["A"]), None, None)
        .await
        .unwrap();
    fx.engine
        .start_workflow("test.wf", b"", &ids(&["A"]), None, None)
        .await
        .unwrap();
    assert_eq!(wf.start_count(), 2);
}

/// Without multi-command transport support the start fans out per id.
#[tokio::test]
async fn single_target_transport_fans_out_per_id() {
    let fx = fixture(false);
    let wf = workflow(&fx, TestWorkflow::new("test.wf"));

    fx.engine
        .start_workflow("test.wf", b"", &ids(&["A", "B"]), None, None)
        .await
        .unwrap();

    let starts = wf.starts.lock().unwrap();
    assert_eq!(starts.len(), 2);
    assert_eq!(starts[0].ids, ids(&["A"]));
    assert_eq!(starts[1].ids, ids(&["B"]));
}

/// Event subscription fan-out: a TokenUpdate check-in starts the
/// subscribed workflow once for the id.
#[tokio::test]
async fn token_update_subscription_starts_workflow() {
    let fx = fixture(true);
    let wf = workflow(&fx, TestWorkflow::new("test.wf"));

    fx.storage
        .store_event_subscription(
            "s1",
            &EventSubscription {
                event: "TokenUpdate".to_string(),
                workflow: "test.wf".to_string(),
                context: "sub-ctx".to_string(),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    fx.engine
        .mdm_checkin_event(
            "A",
            CheckinMessage::TokenUpdate(TokenUpdate::default()),
            None,
        )
        .await
        .unwrap();

    let starts = wf.starts.lock().unwrap();
    assert_eq!(starts.len(), 1);
    assert_eq!(starts[0].ids, ids(&["A"]));
    assert_eq!(starts[0].event, Some(EventFlag::TOKEN_UPDATE));
    assert_eq!(starts[0].context.as_deref(), Some("sub-ctx"));
}

/// Workflow-config event fan-out: subscribed flag fires the Event
/// callback exactly once per enrollment id.
#[tokio::test]
async fn workflow_config_event_dispatch() {
    let fx = fixture(true);
    let wf = workflow(
        &fx,
        TestWorkflow::new("test.wf").with_config(Config {
            events: EventFlag::TOKEN_UPDATE,
            ..Config::default()
        }),
    );

    fx.engine
        .mdm_checkin_event(
            "A",
            CheckinMessage::TokenUpdateEnrolling {
                token_update: TokenUpdate::default(),
                enrolling: false,
            },
            None,
        )
        .await
        .unwrap();

    let events = wf.events.lock().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0], (EventFlag::TOKEN_UPDATE, "A".to_string()));
}

/// TokenUpdateEnrolling with enrolling=true also dispatches Enrollment.
#[tokio::test]
async fn enrolling_token_update_dispatches_enrollment() {
    let fx = fixture(true);
    let wf = workflow(
        &fx,
        TestWorkflow::new("test.wf").with_config(Config {
            events: EventFlag::TOKEN_UPDATE | EventFlag::ENROLLMENT,
            ..Config::default()
        }),
    );

    fx.engine
        .mdm_checkin_event(
            "A",
            CheckinMessage::TokenUpdateEnrolling {
                token_update: TokenUpdate::default(),
                enrolling: true,
            },
            None,
        )
        .await
        .unwrap();
    assert_eq!(wf.event_count(), 2);

    // a bare TokenUpdate is ambiguous and dispatches both as well
    fx.engine
        .mdm_checkin_event(
            "B",
            CheckinMessage::TokenUpdate(TokenUpdate::default()),
            None,
        )
        .await
        .unwrap();
    assert_eq!(wf.event_count(), 4);
}

/// Authenticate abandons outstanding steps and workflow status so the
/// device can re-enroll into fresh workflows.
#[tokio::test]
async fn authenticate_cancels_outstanding_steps() {
    let fx = fixture(true);
    workflow(&fx, TestWorkflow::new("test.wf").with_command("U1", "DeviceLock"));

    fx.engine
        .start_workflow("test.wf", b"", &ids(&["A"]), None, None)
        .await
        .unwrap();
    assert!(fx
        .storage
        .retrieve_command_request_type("A", "U1")
        .await
        .unwrap()
        .is_some());

    fx.engine
        .mdm_checkin_event(
            "A",
            CheckinMessage::Authenticate(praxis::mdm::Authenticate::default()),
            None,
        )
        .await
        .unwrap();

    assert_eq!(
        fx.storage
            .retrieve_command_request_type("A", "U1")
            .await
            .unwrap(),
        None
    );
    assert_eq!(
        fx.storage
            .retrieve_workflow_started("A", "test.wf")
            .await
            .unwrap(),
        None
    );

    // exclusivity no longer blocks a fresh start
    fx.engine
        .start_workflow("test.wf", b"", &ids(&["A"]), None, None)
        .await
        .unwrap();
}

/// IdleNotStartedSince: an Idle starts the subscribed workflow only when
/// it has not run within the subscription's window.
#[tokio::test]
async fn idle_not_started_since_starts_workflow() {
    let fx = fixture(true);
    let wf = workflow(&fx, TestWorkflow::new("test.wf"));

    fx.storage
        .store_event_subscription(
            "idle1",
            &EventSubscription {
                event: "IdleNotStartedSince".to_string(),
                workflow: "test.wf".to_string(),
                event_context: "3600".to_string(),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    // never started: due immediately
    fx.engine
        .mdm_idle_event("A", b"", None, Utc::now())
        .await
        .unwrap();
    assert_eq!(wf.start_count(), 1);
    assert_eq!(
        wf.starts.lock().unwrap()[0].event,
        Some(EventFlag::IDLE_NOT_STARTED_SINCE)
    );

    // just started: within the window, not due
    fx.engine
        .mdm_idle_event("A", b"", None, Utc::now())
        .await
        .unwrap();
    assert_eq!(wf.start_count(), 1);
}

/// All-command-response subscribers see responses to other workflows'
/// commands of the request types they asked for.
#[tokio::test]
async fn all_command_response_subscription() {
    let fx = fixture(true);
    workflow(
        &fx,
        TestWorkflow::new("test.sender").with_command("U1", "DeviceInformation"),
    );
    let observer = workflow(
        &fx,
        TestWorkflow::new("test.observer").with_config(Config {
            all_command_response_request_types: vec!["DeviceInformation".to_string()],
            ..Config::default()
        }),
    );

    fx.engine
        .start_workflow("test.sender", b"", &ids(&["A"]), None, None)
        .await
        .unwrap();
    fx.engine
        .mdm_command_response_event("A", "U1", &ack("U1", "Acknowledged"), None)
        .await
        .unwrap();

    let events = observer.events.lock().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0], (EventFlag::ALL_COMMAND_RESPONSE, "A".to_string()));
}
