//! Lifecycle harness tests driving the manager and engine end to end.
//!
//! Process execution is scripted: each test queues the outcomes the runner
//! returns and then checks the persisted records, the emitted events and the
//! requests the engine built.

use std::sync::{Arc, Barrier};
use std::thread;

use serde_json::{Value, json};

use runhost::core::types::{ChangeKind, CollectionKey, Status};
use runhost::io::runner::LaunchError;
use runhost::io::store::{Embed, Selection};
use runhost::lifecycle::LifecycleError;
use runhost::test_support::{GatedRunner, ScriptedRunner, exited, memory_manager, sample_spec};

fn echo() -> CollectionKey {
    CollectionKey::executable("echo")
}

fn env_value<'a>(env: &'a [(String, String)], key: &str) -> Option<&'a str> {
    env.iter()
        .find(|(name, _)| name == key)
        .map(|(_, value)| value.as_str())
}

/// A second create with the same explicit id conflicts and leaves the first record untouched.
#[test]
fn duplicate_id_conflicts() {
    let (manager, _) = memory_manager(sample_spec(), Arc::new(ScriptedRunner::default()), 1024);
    manager
        .create(
            &echo(),
            json!({ "id": "dup", "status": "prepare", "parameters": { "message": "first" } }),
        )
        .expect("first create");

    let err = manager
        .create(
            &echo(),
            json!({ "id": "dup", "status": "prepare", "parameters": { "message": "second" } }),
        )
        .expect_err("second create");
    assert!(matches!(err, LifecycleError::Conflict(_)));

    let stored = manager.read(&echo(), "dup", &Embed::default()).expect("read");
    assert_eq!(stored.parameters.get("message"), Some(&json!("first")));
}

/// Updates are refused once an instance left `prepare`; the record stays as it was.
#[test]
fn update_after_prepare_is_rejected() {
    let runner = Arc::new(ScriptedRunner::new(vec![Ok(exited(0, "done", ""))]));
    let (manager, _) = memory_manager(sample_spec(), runner, 1024);
    let accepted = manager
        .create(&echo(), json!({ "id": "u1", "parameters": { "message": "hi" } }))
        .expect("create");
    let finished = accepted
        .invocation
        .expect("invocation")
        .wait()
        .expect("wait")
        .expect("persisted");

    let err = manager
        .update(&echo(), "u1", json!({ "parameters": { "message": "changed" } }))
        .expect_err("update");
    assert!(matches!(err, LifecycleError::Validation(_)));
    assert!(err.to_string().contains("prepare"));

    let stored = manager.read(&echo(), "u1", &Embed::default()).expect("read");
    assert_eq!(stored, finished);
}

/// prepare -> prepare edits, then prepare -> running starts exactly one invocation.
#[test]
fn prepare_edit_then_start() {
    let runner = Arc::new(ScriptedRunner::new(vec![Ok(exited(0, "ok", ""))]));
    let (manager, observer) = memory_manager(sample_spec(), runner.clone(), 1024);
    manager
        .create(&echo(), json!({ "id": "p", "status": "prepare", "label": "draft" }))
        .expect("create");

    let edited = manager
        .update(
            &echo(),
            "p",
            json!({ "status": "prepare", "parameters": { "message": "hello" }, "label": null }),
        )
        .expect("edit");
    assert_eq!(edited.instance.status, Status::Prepare);
    assert!(edited.invocation.is_none());
    assert!(!edited.instance.extra.contains_key("label"));

    let started = manager
        .update(&echo(), "p", json!({ "status": "running" }))
        .expect("start");
    assert_eq!(started.instance.status, Status::Running);
    let done = started
        .invocation
        .expect("invocation")
        .wait()
        .expect("wait")
        .expect("persisted");
    assert_eq!(done.status, Status::Finished);
    assert_eq!(runner.requests().len(), 1);

    let kinds: Vec<ChangeKind> = observer.events().iter().map(|event| event.kind).collect();
    assert_eq!(
        kinds,
        vec![
            ChangeKind::Created,
            ChangeKind::Updated,
            ChangeKind::Updated,
            ChangeKind::Finished
        ]
    );
}

/// Exit 0 with stdout `ok` and no mappings keeps raw output as results.
#[test]
fn successful_run_records_raw_output() {
    let runner = Arc::new(ScriptedRunner::new(vec![Ok(exited(0, "ok", "note"))]));
    let (manager, _) = memory_manager(sample_spec(), runner.clone(), 1024);
    let accepted = manager
        .create(&echo(), json!({ "parameters": { "message": "hi" } }))
        .expect("create");
    assert!(accepted.instance.results.is_empty());

    let done = accepted
        .invocation
        .expect("invocation")
        .wait()
        .expect("wait")
        .expect("persisted");
    assert_eq!(done.status, Status::Finished);
    assert_eq!(done.results.get("stdout"), Some(&json!("ok")));
    assert_eq!(done.results.get("stderr"), Some(&json!("note")));
    assert!(done.finished.is_some());
    assert!(done.failed.is_none());
    assert!(done.error.is_none());

    let requests = runner.requests();
    let env = &requests[0].env;
    assert_eq!(requests[0].argv, vec!["./echo.sh".to_string()]);
    let parameters: Value =
        serde_json::from_str(env_value(env, "PARAMETERS").expect("PARAMETERS")).expect("json");
    assert_eq!(parameters, json!({ "message": "hi" }));
    assert_eq!(env_value(env, "PORT"), Some("3001"));
    assert!(env_value(env, "APISPEC").is_some());
    assert!(env_value(env, "EXECUTABLE").is_none());
}

/// Non-zero exit records the error detail and keeps raw output.
#[test]
fn failing_run_records_error() {
    let runner = Arc::new(ScriptedRunner::new(vec![Ok(exited(3, "partial", "bad input"))]));
    let (manager, observer) = memory_manager(sample_spec(), runner, 1024);
    let done = manager
        .create(&echo(), json!({ "parameters": { "message": "hi" } }))
        .expect("create")
        .invocation
        .expect("invocation")
        .wait()
        .expect("wait")
        .expect("persisted");

    assert_eq!(done.status, Status::Error);
    assert!(done.failed.is_some());
    assert!(done.finished.is_none());
    let detail = done.error.expect("error detail");
    assert_eq!(detail.exit_code, Some(3));
    assert_eq!(detail.stderr.as_deref(), Some("bad input"));
    assert_eq!(done.results.get("stdout"), Some(&json!("partial")));
    assert_eq!(
        observer.events().last().map(|event| event.kind),
        Some(ChangeKind::Failed)
    );
}

#[test]
fn launch_failure_records_error() {
    let runner = Arc::new(ScriptedRunner::new(vec![Err(LaunchError {
        program: "./echo.sh".to_string(),
        reason: "No such file or directory".to_string(),
    })]));
    let (manager, _) = memory_manager(sample_spec(), runner, 1024);
    let done = manager
        .create(&echo(), json!({ "parameters": { "message": "hi" } }))
        .expect("create")
        .invocation
        .expect("invocation")
        .wait()
        .expect("wait")
        .expect("persisted");
    assert_eq!(done.status, Status::Error);
    let message = done.error.expect("error").message;
    assert!(message.contains("No such file or directory"), "{message}");
}

/// A structured stdout mapping parses the object and drops the claimed placeholder.
#[test]
fn structured_mapping_through_invoker() {
    let runner = Arc::new(ScriptedRunner::new(vec![
        Ok(exited(0, r#"{"a":1}"#, "")),
        Ok(exited(0, "{not json", "")),
    ]));
    let (manager, _) = memory_manager(sample_spec(), runner.clone(), 1024);
    let wrapped = CollectionKey::executable("wrapped");

    let done = manager
        .create(&wrapped, json!({}))
        .expect("create")
        .invocation
        .expect("invocation")
        .wait()
        .expect("wait")
        .expect("persisted");
    assert_eq!(done.status, Status::Finished);
    assert_eq!(done.results.get("report"), Some(&json!({ "a": 1 })));
    assert!(!done.results.contains_key("stdout"));
    assert_eq!(done.results.get("stderr"), Some(&json!("")));

    let requests = runner.requests();
    assert_eq!(requests[0].argv, vec!["./invoke.sh".to_string()]);
    assert!(requests[0].workdir.ends_with("invoker"));
    let executable: Value = serde_json::from_str(
        env_value(&requests[0].env, "EXECUTABLE").expect("EXECUTABLE"),
    )
    .expect("json");
    assert_eq!(executable.get("name"), Some(&json!("wrapped")));

    let malformed = manager
        .create(&wrapped, json!({}))
        .expect("create")
        .invocation
        .expect("invocation")
        .wait()
        .expect("wait")
        .expect("persisted");
    assert_eq!(malformed.status, Status::Error);
    assert!(malformed.finished.is_none());
    assert!(malformed.error.expect("error").message.contains("report"));
}

/// Invoker collections run the embedded executable through the invoker.
#[test]
fn invoker_collection_passes_embedded_executable() {
    let runner = Arc::new(ScriptedRunner::new(vec![Ok(exited(0, r#"{"b":2}"#, ""))]));
    let (manager, _) = memory_manager(sample_spec(), runner.clone(), 1024);
    let done = manager
        .create(&CollectionKey::invoker("shell"), json!({ "executable": "wrapped" }))
        .expect("create")
        .invocation
        .expect("invocation")
        .wait()
        .expect("wait")
        .expect("persisted");
    assert_eq!(done.status, Status::Finished);
    assert_eq!(done.results.get("report"), Some(&json!({ "b": 2 })));
    assert!(env_value(&runner.requests()[0].env, "EXECUTABLE").is_some());
}

/// Delete works at any status and a later read is not found.
#[test]
fn delete_at_any_status() {
    let runner = Arc::new(ScriptedRunner::new(vec![Ok(exited(1, "", "x"))]));
    let (manager, _) = memory_manager(sample_spec(), runner, 1024);
    manager
        .create(&echo(), json!({ "id": "prep", "status": "prepare" }))
        .expect("prepare");
    manager
        .create(&echo(), json!({ "id": "done", "status": "finished" }))
        .expect("finished");
    manager
        .create(&echo(), json!({ "id": "err", "parameters": { "message": "m" } }))
        .expect("running")
        .invocation
        .expect("invocation")
        .wait()
        .expect("wait");

    for id in ["prep", "done", "err"] {
        assert!(manager.remove(&echo(), id).expect("remove"));
        assert!(matches!(
            manager.read(&echo(), id, &Embed::default()),
            Err(LifecycleError::NotFound(_))
        ));
    }
}

/// Status filter returns only matching instances, ordered by creation.
#[test]
fn list_filters_by_status() {
    let runner = Arc::new(ScriptedRunner::new(vec![Ok(exited(2, "", ""))]));
    let (manager, _) = memory_manager(sample_spec(), runner, 1024);
    manager
        .create(&echo(), json!({ "id": "a", "status": "prepare" }))
        .expect("a");
    manager
        .create(&echo(), json!({ "id": "b", "status": "finished" }))
        .expect("b");
    manager
        .create(&echo(), json!({ "id": "c", "parameters": { "message": "m" } }))
        .expect("c")
        .invocation
        .expect("invocation")
        .wait()
        .expect("wait");
    manager
        .create(&echo(), json!({ "id": "d", "status": "error" }))
        .expect("d");

    let errors: Vec<String> = manager
        .list(&echo(), Some(Status::Error))
        .expect("list")
        .into_iter()
        .map(|instance| instance.id)
        .collect();
    assert_eq!(errors.len(), 2);
    assert!(errors.contains(&"c".to_string()));
    assert!(errors.contains(&"d".to_string()));
    assert_eq!(manager.list(&echo(), None).expect("all").len(), 4);
}

/// Filters hold for instances of mixed status created from many threads at once.
#[test]
fn concurrent_mixed_creates_list_by_status() {
    let outcomes = (0..4).map(|_| Ok(exited(0, "ok", ""))).collect();
    let (manager, _) = memory_manager(sample_spec(), Arc::new(ScriptedRunner::new(outcomes)), 1024);
    let barrier = Barrier::new(12);

    let invocations: Vec<_> = thread::scope(|scope| {
        let workers: Vec<_> = (0..12)
            .map(|n| {
                let manager = &manager;
                let barrier = &barrier;
                scope.spawn(move || {
                    let request = match n % 3 {
                        0 => json!({ "id": format!("p{n}"), "status": "prepare" }),
                        1 => json!({ "id": format!("e{n}"), "status": "error" }),
                        _ => json!({ "id": format!("r{n}"), "parameters": { "message": "m" } }),
                    };
                    barrier.wait();
                    manager.create(&echo(), request).expect("create").invocation
                })
            })
            .collect();
        workers
            .into_iter()
            .map(|worker| worker.join().expect("join"))
            .collect()
    });
    for invocation in invocations.into_iter().flatten() {
        invocation.wait().expect("wait");
    }

    let ids = |status| -> Vec<String> {
        manager
            .list(&echo(), Some(status))
            .expect("list")
            .into_iter()
            .map(|instance| instance.id)
            .collect()
    };
    let errors = ids(Status::Error);
    assert_eq!(errors.len(), 4);
    assert!(errors.iter().all(|id| id.starts_with('e')));
    let finished = ids(Status::Finished);
    assert_eq!(finished.len(), 4);
    assert!(finished.iter().all(|id| id.starts_with('r')));
    assert_eq!(ids(Status::Prepare).len(), 4);
    assert_eq!(manager.list(&echo(), None).expect("all").len(), 12);
}

/// Racing creates of one explicit id: exactly one wins, the rest conflict.
#[test]
fn concurrent_creates_of_one_id_conflict() {
    let (manager, _) = memory_manager(sample_spec(), Arc::new(ScriptedRunner::default()), 1024);
    let barrier = Barrier::new(8);

    let results: Vec<_> = thread::scope(|scope| {
        let workers: Vec<_> = (0..8)
            .map(|n| {
                let manager = &manager;
                let barrier = &barrier;
                scope.spawn(move || {
                    barrier.wait();
                    manager.create(
                        &echo(),
                        json!({ "id": "contended", "status": "prepare", "writer": n }),
                    )
                })
            })
            .collect();
        workers
            .into_iter()
            .map(|worker| worker.join().expect("join"))
            .collect()
    });

    let winners: Vec<_> = results.iter().filter_map(|result| result.as_ref().ok()).collect();
    assert_eq!(winners.len(), 1);
    assert_eq!(
        results
            .iter()
            .filter(|result| matches!(result, Err(LifecycleError::Conflict(_))))
            .count(),
        7
    );
    let stored = manager
        .read(&echo(), "contended", &Embed::default())
        .expect("read");
    assert_eq!(stored.extra.get("writer"), winners[0].instance.extra.get("writer"));
}

/// Removing an instance mid-invocation discards the late terminal write.
#[test]
fn removal_during_invocation_discards_outcome() {
    let (runner, gate) = GatedRunner::new();
    let (manager, observer) = memory_manager(sample_spec(), Arc::new(runner), 1024);
    let accepted = manager
        .create(&echo(), json!({ "id": "orphan", "parameters": { "message": "m" } }))
        .expect("create");
    gate.wait_started();

    assert!(manager.remove(&echo(), "orphan").expect("remove"));
    gate.release(exited(0, "late", ""));
    let outcome = accepted
        .invocation
        .expect("invocation")
        .wait()
        .expect("wait");

    assert!(outcome.is_none());
    assert!(matches!(
        manager.read(&echo(), "orphan", &Embed::default()),
        Err(LifecycleError::NotFound(_))
    ));
    assert!(
        observer
            .events()
            .iter()
            .all(|event| event.kind != ChangeKind::Finished)
    );
}

/// Recreating a removed id while its old run is in flight never receives the old outcome.
#[test]
fn recreated_instance_ignores_stale_outcome() {
    let (runner, gate) = GatedRunner::new();
    let (manager, _) = memory_manager(sample_spec(), Arc::new(runner), 1024);
    let first = manager
        .create(&echo(), json!({ "id": "again", "parameters": { "message": "m" } }))
        .expect("create");
    gate.wait_started();
    manager.remove(&echo(), "again").expect("remove");

    let second = manager
        .create(&echo(), json!({ "id": "again", "status": "prepare" }))
        .expect("recreate");
    assert_eq!(second.instance.status, Status::Prepare);

    gate.release(exited(0, "stale", ""));
    assert!(
        first
            .invocation
            .expect("invocation")
            .wait()
            .expect("wait")
            .is_none()
    );
    let current = manager
        .read(&echo(), "again", &Embed::default())
        .expect("read");
    assert_eq!(current.status, Status::Prepare);
    assert!(current.results.is_empty());
}

/// A run requested for a recreated id waits for the old run, then executes normally.
#[test]
fn recreated_running_instance_runs_after_old_invocation() {
    let (runner, gate) = GatedRunner::new();
    let (manager, _) = memory_manager(sample_spec(), Arc::new(runner), 1024);
    let first = manager
        .create(&echo(), json!({ "id": "x", "parameters": { "message": "old" } }))
        .expect("create");
    gate.wait_started();
    manager.remove(&echo(), "x").expect("remove");

    let second = manager
        .create(&echo(), json!({ "id": "x", "parameters": { "message": "new" } }))
        .expect("recreate");
    assert_eq!(second.instance.status, Status::Running);
    let second_run = second.invocation.expect("second invocation queued");

    gate.release(exited(0, "stale", ""));
    assert!(
        first
            .invocation
            .expect("invocation")
            .wait()
            .expect("wait")
            .is_none()
    );

    gate.wait_started();
    gate.release(exited(0, "fresh", ""));
    let done = second_run.wait().expect("wait").expect("persisted");
    assert_eq!(done.status, Status::Finished);
    assert_eq!(done.results.get("stdout"), Some(&json!("fresh")));
    assert_eq!(done.created, second.instance.created);
}

/// Values above the inline limit are stored out-of-band and embedded on request.
#[test]
fn large_values_move_out_of_band() {
    let big = "x".repeat(256);
    let runner = Arc::new(ScriptedRunner::new(vec![Ok(exited(0, &big, ""))]));
    let (manager, _) = memory_manager(sample_spec(), runner.clone(), 64);
    let done = manager
        .create(&echo(), json!({ "id": "big", "parameters": { "message": big } }))
        .expect("create")
        .invocation
        .expect("invocation")
        .wait()
        .expect("wait")
        .expect("persisted");

    assert_eq!(done.parameters_stored, vec!["message".to_string()]);
    assert_eq!(done.results_stored, vec!["stdout".to_string()]);
    assert!(!done.results.contains_key("stdout"));

    let parameters: Value = serde_json::from_str(
        runner.requests()[0]
            .env
            .iter()
            .find(|(name, _)| name == "PARAMETERS")
            .map(|(_, value)| value.as_str())
            .expect("PARAMETERS"),
    )
    .expect("json");
    assert_eq!(parameters.get("message"), Some(&json!(big)));

    let embedded = manager
        .read(
            &echo(),
            "big",
            &Embed {
                parameters: Selection::None,
                results: Selection::Names(vec!["stdout".to_string()]),
            },
        )
        .expect("read");
    assert_eq!(embedded.results.get("stdout"), Some(&json!(big)));
    assert!(!embedded.parameters.contains_key("message"));

    let body = manager.get_result(&echo(), "big", "stdout").expect("result");
    assert_eq!(body.body, big);
    assert_eq!(
        manager.get_parameter(&echo(), "big", "message").expect("param"),
        json!(big)
    );
}
