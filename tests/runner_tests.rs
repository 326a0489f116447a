#![allow(clippy::unwrap_used, clippy::expect_used)]
//! Worker loops running on `may` coroutines, fed from the test thread

mod common;

use brrtworker::echo::EchoHandler;
use brrtworker::runner::spawn_worker;
use brrtworker::{ExitReason, Resume, WireRequest, WorkerConfig, WorkerContext};
use common::test_runtime::setup_may_runtime;
use common::workers::test_config;
use serde_json::json;
use std::sync::Arc;

fn echo_config() -> WorkerConfig {
    let mut config = test_config();
    config.name = "echo-test".to_string();
    config.env.insert("GREETING".to_string(), "hello".to_string());
    config
}

fn spawn_echo(config: WorkerConfig) -> brrtworker::runner::WorkerHandle {
    setup_may_runtime();
    let context = Arc::new(WorkerContext::from_config(&config).unwrap());
    unsafe { spawn_worker(config, context, EchoHandler) }.unwrap()
}

#[test]
fn test_spawned_worker_serves_and_shuts_down() {
    let handle = spawn_echo(echo_config());

    let first = handle
        .submit(WireRequest::new("POST", "/items").body("payload"))
        .unwrap()
        .wait()
        .unwrap();
    let second = handle
        .submit(WireRequest::new("GET", "/items?page=2"))
        .unwrap()
        .wait()
        .unwrap();

    let first = first.json().unwrap();
    assert_eq!(first["method"], "POST");
    assert_eq!(first["body"], "payload");
    assert_eq!(first["hits"], 1);
    assert_eq!(first["greeting"], "hello");
    assert_eq!(second.json().unwrap()["hits"], 2);
    assert_eq!(second.header("x-echo-hits"), Some("2"));

    handle.shutdown();
    assert_eq!(handle.join(), ExitReason::Shutdown);
}

#[test]
fn test_echo_env_updates_persist() {
    let handle = spawn_echo(echo_config());

    let snapshot = handle
        .submit(
            WireRequest::new("POST", "/env")
                .body(r#"{"set": {"GREETING": "bonjour", "MODE": "fast"}, "unset": ["MODE"]}"#),
        )
        .unwrap()
        .wait()
        .unwrap()
        .json()
        .unwrap();
    assert_eq!(snapshot["GREETING"], "bonjour");
    assert!(snapshot.get("MODE").is_none());
    assert_eq!(snapshot["BRRTW_WORKER"], "1");

    let reply = handle
        .submit(WireRequest::new("GET", "/"))
        .unwrap()
        .wait()
        .unwrap();
    assert_eq!(reply.json().unwrap()["greeting"], "bonjour");

    handle.shutdown();
    handle.join();
}

#[test]
fn test_echo_suspend_and_status_override() {
    let handle = spawn_echo(echo_config());

    let resumed = handle
        .submit(WireRequest::new("GET", "/wait?suspend"))
        .unwrap()
        .wait_with(|_| Resume::Value(json!("approved")))
        .unwrap();
    assert_eq!(resumed.checkpoints, vec![json!({ "checkpoint": "/wait?suspend" })]);
    assert_eq!(resumed.json().unwrap()["resumed"], "approved");

    let teapot = handle
        .submit(WireRequest::new("GET", "/").header("X-Echo-Status", "418"))
        .unwrap()
        .wait()
        .unwrap();
    assert_eq!(teapot.status, 418);

    let bad = handle
        .submit(WireRequest::new("GET", "/").header("X-Echo-Status", "teapot"))
        .unwrap()
        .wait()
        .unwrap();
    assert_eq!(bad.status, 400);

    handle.shutdown();
    assert_eq!(handle.join(), ExitReason::Shutdown);
}

#[test]
fn test_spawned_worker_stops_at_max_requests() {
    let config = WorkerConfig {
        max_requests: 1,
        ..echo_config()
    };
    let handle = spawn_echo(config);

    let served = handle.submit(WireRequest::new("GET", "/")).unwrap().wait();
    assert!(served.is_ok());
    assert_eq!(handle.join(), ExitReason::MaxRequestsReached);
}

#[test]
fn test_submitters_on_other_threads() {
    let handle = spawn_echo(echo_config());

    let threads: Vec<_> = (0..4)
        .map(|i| {
            let units = handle.units().clone();
            std::thread::spawn(move || {
                units
                    .submit(WireRequest::new("GET", format!("/t/{i}")))
                    .unwrap()
                    .wait()
                    .unwrap()
                    .status
            })
        })
        .collect();
    for t in threads {
        assert_eq!(t.join().unwrap(), 200);
    }

    let context = Arc::clone(handle.context());
    handle.shutdown();
    assert_eq!(handle.join(), ExitReason::Shutdown);
    assert_eq!(context.stats().get_requests_served(), 4);
}

#[test]
fn test_zero_stack_size_rejected() {
    setup_may_runtime();
    let config = WorkerConfig {
        stack_size: 0,
        ..echo_config()
    };
    let context = Arc::new(WorkerContext::from_config(&config).unwrap());
    let err = unsafe { spawn_worker(config, context, EchoHandler) }.unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);
}

#[test]
fn test_handle_shutdown_reaches_suspended_request() {
    let handle = spawn_echo(echo_config());
    let context = Arc::clone(handle.context());

    let pending = handle.submit(WireRequest::new("GET", "/hold?suspend")).unwrap();
    assert!(matches!(
        pending.next_event(),
        Some(brrtworker::ResponseEvent::Suspended(_))
    ));

    handle.shutdown();
    assert_eq!(handle.join(), ExitReason::Shutdown);
    assert_eq!(pending.next_event(), None);
    assert_eq!(context.stats().get_cancellations(), 1);
}
