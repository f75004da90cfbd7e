//! Storage conformance suite.
//!
//! One generic suite exercises the full backend contract (step
//! lifecycle, duplicate rejection, NotNow handling, cancellation,
//! delayed release, timeouts, re-push marking, exclusivity lookups,
//! workflow status, and event subscriptions) and runs against every
//! bundled backend.

mod common;

use praxis::chrono::{Duration, Utc};
use praxis::storage::{
    AllStorage, DiskStorage, EventSubscription, InMemStorage, StepCommandRaw, StepCommandResult,
    StepContext, StepEnqueueing, StepEnqueuingWithConfig, StorageError,
};
use praxis::workflow::EventFlag;

use common::{ack, ids};

fn step(
    workflow: &str,
    instance: &str,
    enr_ids: &[&str],
    commands: &[(&str, &str)],
) -> StepEnqueuingWithConfig {
    StepEnqueuingWithConfig {
        step: StepEnqueueing {
            context: StepContext {
                workflow_name: workflow.to_string(),
                instance_id: instance.to_string(),
                ..Default::default()
            },
            ids: ids(enr_ids),
            commands: commands
                .iter()
                .map(|(uuid, req_type)| StepCommandRaw {
                    command_uuid: uuid.to_string(),
                    request_type: req_type.to_string(),
                    command: format!("<plist>{uuid}</plist>").into_bytes(),
                })
                .collect(),
        },
        not_until: None,
        timeout: None,
    }
}

fn response(uuid: &str, req_type: &str, status: &str) -> StepCommandResult {
    StepCommandResult {
        command_uuid: uuid.to_string(),
        request_type: req_type.to_string(),
        result_report: ack(uuid, status),
        completed: status != "NotNow" && !status.is_empty(),
    }
}

/// Property: a step storing N commands across K ids emits exactly K step
/// results with N command results each, and afterwards no rows remain.
async fn multi_id_multi_command_lifecycle<S: AllStorage>(storage: &S) {
    let s = step(
        "test.multi",
        "inst-multi",
        &["MA", "MB"],
        &[("M-U1", "DeviceInformation"), ("M-U2", "SecurityInfo")],
    );
    storage.store_step(&s, Utc::now()).await.unwrap();

    assert_eq!(
        storage
            .retrieve_command_request_type("MA", "M-U1")
            .await
            .unwrap()
            .as_deref(),
        Some("DeviceInformation")
    );

    let mut emitted = 0;
    for id in ["MA", "MB"] {
        // first command: step incomplete
        let r = storage
            .store_command_response_and_retrieve_completed_step(
                id,
                &response("M-U1", "DeviceInformation", "Acknowledged"),
            )
            .await
            .unwrap();
        assert!(r.is_none(), "step completed early for {id}");

        // second command: step complete for this id
        let r = storage
            .store_command_response_and_retrieve_completed_step(
                id,
                &response("M-U2", "SecurityInfo", "Acknowledged"),
            )
            .await
            .unwrap()
            .unwrap_or_else(|| panic!("no step result for {id}"));
        emitted += 1;

        assert_eq!(r.ids, ids(&[id]));
        assert_eq!(r.context.workflow_name, "test.multi");
        assert_eq!(r.context.instance_id, "inst-multi");
        assert_eq!(r.commands.len(), 2, "want both command results for {id}");
        for cmd in &r.commands {
            assert!(cmd.completed);
            assert!(!cmd.result_report.is_empty());
        }
    }
    assert_eq!(emitted, 2);

    // all rows gone
    for id in ["MA", "MB"] {
        for uuid in ["M-U1", "M-U2"] {
            assert_eq!(
                storage.retrieve_command_request_type(id, uuid).await.unwrap(),
                None
            );
        }
    }

    // a duplicate response for an erased row is an error
    let err = storage
        .store_command_response_and_retrieve_completed_step(
            "MB",
            &response("M-U2", "SecurityInfo", "Acknowledged"),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::CommandNotFound(_)));
}

/// Scenario: a step reusing one uuid across commands fails at enqueue
/// time and persists nothing.
async fn duplicate_uuid_rejected<S: AllStorage>(storage: &S) {
    let s = step(
        "test.dup",
        "inst-dup",
        &["DA", "DB"],
        &[("D-U", "DeviceInformation"), ("D-U", "SecurityInfo")],
    );
    let err = storage.store_step(&s, Utc::now()).await.unwrap_err();
    assert!(matches!(err, StorageError::DuplicateCommand { .. }));
    assert_eq!(
        storage.retrieve_command_request_type("DA", "D-U").await.unwrap(),
        None,
        "rejected step must not persist rows"
    );

    // duplicates against already-stored rows fail too
    let first = step("test.dup", "inst-dup2", &["DA"], &[("D-U2", "DeviceLock")]);
    storage.store_step(&first, Utc::now()).await.unwrap();
    let second = step("test.dup", "inst-dup3", &["DA"], &[("D-U2", "DeviceLock")]);
    let err = storage.store_step(&second, Utc::now()).await.unwrap_err();
    assert!(matches!(err, StorageError::DuplicateCommand { .. }));

    storage.cancel_steps("DA", None).await.unwrap();
}

/// Scenario: NotNow does not complete the step and keeps it tracked.
async fn not_now_keeps_step_pending<S: AllStorage>(storage: &S) {
    let s = step("test.notnow", "inst-nn", &["NA"], &[("N-U1", "DeviceLock")]);
    storage.store_step(&s, Utc::now()).await.unwrap();

    let r = storage
        .store_command_response_and_retrieve_completed_step(
            "NA",
            &response("N-U1", "DeviceLock", "NotNow"),
        )
        .await
        .unwrap();
    assert!(r.is_none());

    assert_eq!(
        storage
            .retrieve_command_request_type("NA", "N-U1")
            .await
            .unwrap()
            .as_deref(),
        Some("DeviceLock")
    );

    // a later terminal response completes it
    let r = storage
        .store_command_response_and_retrieve_completed_step(
            "NA",
            &response("N-U1", "DeviceLock", "Acknowledged"),
        )
        .await
        .unwrap();
    assert!(r.is_some());
}

/// Property: after cancellation, retrievals for the id return nothing.
async fn cancel_erases_rows<S: AllStorage>(storage: &S) {
    let s = step("test.cancel", "inst-c", &["CA"], &[("C-U1", "DeviceLock")]);
    storage.store_step(&s, Utc::now()).await.unwrap();

    storage.cancel_steps("CA", None).await.unwrap();

    assert_eq!(
        storage.retrieve_command_request_type("CA", "C-U1").await.unwrap(),
        None
    );
    let outstanding = storage
        .retrieve_outstanding_workflow_status("test.cancel", &ids(&["CA"]))
        .await
        .unwrap();
    assert!(outstanding.is_empty());

    // cancel restricted to a different workflow leaves rows alone
    let s = step("test.cancel", "inst-c2", &["CB"], &[("C-U2", "DeviceLock")]);
    storage.store_step(&s, Utc::now()).await.unwrap();
    storage
        .cancel_steps("CB", Some("test.other"))
        .await
        .unwrap();
    assert!(storage
        .retrieve_command_request_type("CB", "C-U2")
        .await
        .unwrap()
        .is_some());
    storage
        .cancel_steps("CB", Some("test.cancel"))
        .await
        .unwrap();
    assert!(storage
        .retrieve_command_request_type("CB", "C-U2")
        .await
        .unwrap()
        .is_none());
}

/// Scenario: delayed step release happens exactly once and primes the
/// re-push clock; re-push marking is idempotent.
async fn delayed_release_and_repush<S: AllStorage>(storage: &S) {
    let mut s = step("test.delay", "inst-d", &["DLA"], &[("DL-U1", "DeviceLock")]);
    s.not_until = Some(Utc::now() - Duration::seconds(60));
    storage.store_step(&s, Utc::now()).await.unwrap();

    // no last_push yet: not eligible for re-push while delayed
    let repush = storage
        .retrieve_and_mark_repushed(Utc::now() + Duration::seconds(1), Utc::now())
        .await
        .unwrap();
    assert!(
        !repush.contains(&"DLA".to_string()),
        "delayed command must not be re-pushed"
    );

    // a delayed step without a timeout is release-only, never timed out
    assert!(storage.retrieve_timed_out_steps().await.unwrap().is_empty());

    let released = storage.retrieve_steps_to_enqueue(Utc::now()).await.unwrap();
    assert_eq!(released.len(), 1);
    let released_step = &released[0];
    assert_eq!(released_step.ids, ids(&["DLA"]));
    assert_eq!(released_step.commands.len(), 1);
    assert_eq!(released_step.commands[0].command_uuid, "DL-U1");
    assert!(
        !released_step.commands[0].command.is_empty(),
        "raw command bytes must survive until release"
    );

    // released exactly once
    let released = storage.retrieve_steps_to_enqueue(Utc::now()).await.unwrap();
    assert!(released.is_empty());

    // the release set last_push; the step is now re-push eligible
    let future = Utc::now() + Duration::seconds(1);
    let repush = storage
        .retrieve_and_mark_repushed(future, future)
        .await
        .unwrap();
    assert_eq!(repush, ids(&["DLA"]));

    // marking is idempotent for the same horizon
    let repush = storage
        .retrieve_and_mark_repushed(future, future)
        .await
        .unwrap();
    assert!(repush.is_empty());

    storage.cancel_steps("DLA", None).await.unwrap();
}

/// Scenario: a timed-out step yields one result per id that still has
/// rows; completion beforehand removes that id from the output.
async fn timeout_emits_per_id_results<S: AllStorage>(storage: &S) {
    let mut s = step(
        "test.timeout",
        "inst-t",
        &["TA", "TB", "TC"],
        &[("T-U1", "DeviceLock")],
    );
    s.timeout = Some(Utc::now() - Duration::seconds(60));
    storage.store_step(&s, Utc::now()).await.unwrap();

    // TA completes before the worker notices the timeout
    let r = storage
        .store_command_response_and_retrieve_completed_step(
            "TA",
            &response("T-U1", "DeviceLock", "Acknowledged"),
        )
        .await
        .unwrap();
    assert!(r.is_some());

    let mut timed_out = storage.retrieve_timed_out_steps().await.unwrap();
    timed_out.sort_by(|a, b| a.ids.cmp(&b.ids));
    let timed_out_ids: Vec<_> = timed_out.iter().map(|r| r.ids.clone()).collect();
    assert_eq!(timed_out_ids, vec![ids(&["TB"]), ids(&["TC"])]);
    for r in &timed_out {
        assert_eq!(r.context.workflow_name, "test.timeout");
        assert_eq!(r.commands.len(), 1);
        assert!(!r.commands[0].completed);
    }

    // everything is gone afterwards
    assert!(storage.retrieve_timed_out_steps().await.unwrap().is_empty());
    for id in ["TA", "TB", "TC"] {
        assert_eq!(
            storage.retrieve_command_request_type(id, "T-U1").await.unwrap(),
            None
        );
    }
}

/// Exclusivity lookups report only ids with incomplete steps.
async fn outstanding_tracks_incomplete_ids<S: AllStorage>(storage: &S) {
    let s = step(
        "test.outstanding",
        "inst-o",
        &["OA", "OB"],
        &[("O-U1", "DeviceLock")],
    );
    storage.store_step(&s, Utc::now()).await.unwrap();

    let outstanding = storage
        .retrieve_outstanding_workflow_status("test.outstanding", &ids(&["OA", "OB", "OC"]))
        .await
        .unwrap();
    assert_eq!(outstanding, ids(&["OA", "OB"]));

    // another workflow's steps don't count
    let outstanding = storage
        .retrieve_outstanding_workflow_status("test.unrelated", &ids(&["OA", "OB"]))
        .await
        .unwrap();
    assert!(outstanding.is_empty());

    // OA completes; only OB remains outstanding
    storage
        .store_command_response_and_retrieve_completed_step(
            "OA",
            &response("O-U1", "DeviceLock", "Acknowledged"),
        )
        .await
        .unwrap();
    let outstanding = storage
        .retrieve_outstanding_workflow_status("test.outstanding", &ids(&["OA", "OB", "OC"]))
        .await
        .unwrap();
    assert_eq!(outstanding, ids(&["OB"]));

    storage.cancel_steps("OB", None).await.unwrap();
}

/// Workflow status rows round-trip with second precision and clear per
/// id.
async fn workflow_status_round_trip<S: AllStorage>(storage: &S) {
    assert_eq!(
        storage
            .retrieve_workflow_started("WA", "test.status")
            .await
            .unwrap(),
        None
    );

    let started = Utc::now() - Duration::seconds(90);
    storage
        .record_workflow_started(&ids(&["WA", "WB"]), "test.status", started)
        .await
        .unwrap();

    let got = storage
        .retrieve_workflow_started("WA", "test.status")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(got.timestamp(), started.timestamp());

    storage.clear_workflow_status("WA").await.unwrap();
    assert_eq!(
        storage
            .retrieve_workflow_started("WA", "test.status")
            .await
            .unwrap(),
        None
    );
    assert!(storage
        .retrieve_workflow_started("WB", "test.status")
        .await
        .unwrap()
        .is_some());
}

/// Event subscriptions store, query by event, overwrite, and delete.
async fn event_subscriptions<S: AllStorage>(storage: &S) {
    let sub = EventSubscription {
        event: "TokenUpdate".to_string(),
        workflow: "test.events".to_string(),
        context: "ctx".to_string(),
        ..Default::default()
    };
    storage.store_event_subscription("es1", &sub).await.unwrap();

    let by_name = storage
        .retrieve_event_subscriptions(&["es1".to_string()])
        .await
        .unwrap();
    assert_eq!(by_name.get("es1"), Some(&sub));

    let by_event = storage
        .retrieve_event_subscriptions_by_event(EventFlag::TOKEN_UPDATE)
        .await
        .unwrap();
    assert!(by_event.contains(&sub));
    assert!(storage
        .retrieve_event_subscriptions_by_event(EventFlag::CHECK_OUT)
        .await
        .unwrap()
        .is_empty());

    // invalid subscriptions are rejected
    let invalid = EventSubscription {
        event: "NotAnEvent".to_string(),
        workflow: "test.events".to_string(),
        ..Default::default()
    };
    assert!(storage
        .store_event_subscription("es2", &invalid)
        .await
        .is_err());

    // overwrite replaces in place
    let replaced = EventSubscription {
        event: "IdleNotStartedSince".to_string(),
        workflow: "test.events2".to_string(),
        event_context: "86400".to_string(),
        ..Default::default()
    };
    storage
        .store_event_subscription("es1", &replaced)
        .await
        .unwrap();
    let by_event = storage
        .retrieve_event_subscriptions_by_event(EventFlag::TOKEN_UPDATE)
        .await
        .unwrap();
    assert!(!by_event.contains(&sub));

    storage.delete_event_subscription("es1").await.unwrap();
    let by_name = storage
        .retrieve_event_subscriptions(&["es1".to_string()])
        .await
        .unwrap();
    assert!(by_name.is_empty());
}

async fn exercise<S: AllStorage>(storage: &S) {
    multi_id_multi_command_lifecycle(storage).await;
    duplicate_uuid_rejected(storage).await;
    not_now_keeps_step_pending(storage).await;
    cancel_erases_rows(storage).await;
    delayed_release_and_repush(storage).await;
    timeout_emits_per_id_results(storage).await;
    outstanding_tracks_incomplete_ids(storage).await;
    workflow_status_round_trip(storage).await;
    event_subscriptions(storage).await;
}

#[tokio::test]
async fn inmem_backend() {
    exercise(&InMemStorage::new()).await;
}

#[tokio::test]
async fn disk_backend() {
    let dir = tempfile::tempdir().unwrap();
    let storage = DiskStorage::open(dir.path()).await.unwrap();
    exercise(&storage).await;
}

#[cfg(feature = "sqlite")]
#[tokio::test]
async fn sqlite_backend() {
    let storage = praxis::SqliteStorage::in_memory().unwrap();
    exercise(&storage).await;
}
