#![allow(clippy::unwrap_used, clippy::expect_used)]
//! Tests for suspend/resume through the dispatch loop
//!
//! A suspended request keeps its unit, its staged response and its registered
//! resources until the collaborator resumes or cancels it. Resume values are
//! queued on the pending response before the worker runs, so the whole exchange
//! fits on one thread.

mod common;

use brrtworker::error::ResponseError;
use brrtworker::{
    handler_fn, ExitReason, HandlerError, HeaderMode, Outcome, ResponseEvent, Resume, WireRequest,
    WorkerConfig,
};
use common::resources::Counted;
use common::workers::{new_worker, new_worker_with, test_config};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[test]
fn test_resume_value_reaches_continuation() {
    let (mut worker, units) = new_worker();
    let pending = units.submit(WireRequest::new("GET", "/order")).unwrap();
    pending.resume(json!({ "approved": true }));

    let mut handler = handler_fn(|scope| {
        scope.set_header("X-Stage", "before", HeaderMode::Append).unwrap();
        Outcome::suspend(json!({ "need": "approval" }), |scope, value| {
            scope.set_header("X-Stage", "after", HeaderMode::Append).unwrap();
            scope.write_json(&json!({ "resumed_with": value }));
            Outcome::Complete
        })
    });
    assert!(worker.handle_request(&mut handler));

    let response = pending.wait().unwrap();
    assert_eq!(response.checkpoints, vec![json!({ "need": "approval" })]);
    assert_eq!(response.header_all("x-stage"), vec!["before", "after"]);
    assert_eq!(
        response.json().unwrap(),
        json!({ "resumed_with": { "approved": true } })
    );
    assert_eq!(worker.context().stats().get_suspensions(), 1);
}

#[test]
fn test_multiple_suspend_cycles() {
    let (mut worker, units) = new_worker();
    let pending = units.submit(WireRequest::new("GET", "/steps")).unwrap();
    pending.resume(json!(1));
    pending.resume(json!(2));
    pending.resume(json!(3));

    fn step(scope: &mut brrtworker::RequestScope<'_>, total: u64) -> Outcome {
        if total >= 6 {
            scope.write(total.to_string());
            return Outcome::Complete;
        }
        Outcome::suspend(json!({ "total": total }), move |scope, value| {
            step(scope, total + value.as_u64().unwrap_or(0))
        })
    }

    let mut handler = handler_fn(|scope| step(scope, 0));
    assert!(worker.handle_request(&mut handler));

    let response = pending.wait().unwrap();
    assert_eq!(response.body_text(), "6");
    assert_eq!(
        response.checkpoints,
        vec![json!({ "total": 0 }), json!({ "total": 1 }), json!({ "total": 3 })]
    );
    assert_eq!(worker.context().stats().get_suspensions(), 3);
}

#[test]
fn test_upload_released_once_across_suspension() {
    let (mut worker, units) = new_worker();
    let pending = units
        .submit(WireRequest::new("POST", "/upload").body("file contents"))
        .unwrap();
    pending.resume(json!("go"));

    let seen: Arc<Mutex<Option<PathBuf>>> = Arc::new(Mutex::new(None));
    let seen_in_handler = Arc::clone(&seen);
    let mut handler = handler_fn(move |scope| {
        let body = scope.body().to_vec();
        let path = scope.create_upload_file(&body).unwrap();
        *seen_in_handler.lock().unwrap() = Some(path.clone());
        Outcome::suspend(json!("uploaded"), move |scope, _value| {
            // still present while the request is alive
            let contents = std::fs::read(&path).unwrap();
            scope.write(contents);
            Outcome::Complete
        })
    });
    assert!(worker.handle_request(&mut handler));

    let response = pending.wait().unwrap();
    assert_eq!(response.body_text(), "file contents");
    let path = seen.lock().unwrap().clone().unwrap();
    assert!(!path.exists());
    assert_eq!(worker.context().stats().get_resources_released(), 1);
}

#[test]
fn test_resource_registered_twice_released_once() {
    let (mut worker, units) = new_worker();
    let pending = units.submit(WireRequest::new("GET", "/")).unwrap();
    pending.resume(Value::Null);

    let releases = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&releases);
    let mut handler = handler_fn(move |scope| {
        assert!(scope.register_resource(Counted::boxed("db", &counter)));
        let again = Arc::clone(&counter);
        Outcome::suspend(Value::Null, move |scope, _| {
            // same key from the continuation is a duplicate
            assert!(!scope.register_resource(Counted::boxed("db", &again)));
            assert_eq!(again.load(Ordering::SeqCst), 0);
            Outcome::Complete
        })
    });
    assert!(worker.handle_request(&mut handler));

    pending.wait().unwrap();
    assert_eq!(releases.load(Ordering::SeqCst), 1);
}

#[test]
fn test_cancel_runs_finalizer_and_drops_response() {
    let (mut worker, units) = new_worker();
    let cancelled = units.submit(WireRequest::new("GET", "/slow")).unwrap();
    let next = units.submit(WireRequest::new("GET", "/fast")).unwrap();
    cancelled.cancel();

    let releases = Arc::new(AtomicUsize::new(0));
    let continued = Arc::new(AtomicUsize::new(0));
    let (counter, ran) = (Arc::clone(&releases), Arc::clone(&continued));
    let mut handler = handler_fn(move |scope| {
        if scope.path() == "/fast" {
            scope.write("fast");
            return Outcome::Complete;
        }
        scope.register_resource(Counted::boxed("lock", &counter));
        let ran = Arc::clone(&ran);
        Outcome::suspend(json!("waiting"), move |_scope, _| {
            ran.fetch_add(1, Ordering::SeqCst);
            Outcome::Complete
        })
    });

    assert!(worker.handle_request(&mut handler));
    assert!(worker.handle_request(&mut handler));

    assert_eq!(
        cancelled.wait().unwrap_err(),
        ResponseError::ConnectionLost {
            head_received: false
        }
    );
    assert_eq!(next.wait().unwrap().body_text(), "fast");
    assert_eq!(releases.load(Ordering::SeqCst), 1);
    assert_eq!(continued.load(Ordering::SeqCst), 0);
    assert_eq!(worker.context().stats().get_cancellations(), 1);
    assert_eq!(worker.context().stats().get_requests_served(), 2);
}

#[test]
fn test_dropped_pending_response_cancels_suspension() {
    let (mut worker, units) = new_worker();
    let pending = units.submit(WireRequest::new("GET", "/")).unwrap();
    drop(pending);

    let releases = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&releases);
    let mut handler = handler_fn(move |scope| {
        scope.register_resource(Counted::boxed("socket", &counter));
        Outcome::suspend(Value::Null, |_scope, _| Outcome::Complete)
    });

    assert!(worker.handle_request(&mut handler));
    assert_eq!(releases.load(Ordering::SeqCst), 1);
    assert_eq!(worker.context().stats().get_cancellations(), 1);
}

#[test]
fn test_continuation_error_renders_failure() {
    let (mut worker, units) = new_worker();
    let pending = units.submit(WireRequest::new("GET", "/")).unwrap();
    pending.resume(json!("denied"));

    let mut handler = handler_fn(|scope| {
        scope.write("partial");
        Outcome::suspend(json!("ask"), |_scope, value| {
            if value == json!("denied") {
                return Outcome::Fail(HandlerError::with_status(403, "not allowed"));
            }
            Outcome::Complete
        })
    });
    assert!(worker.handle_request(&mut handler));

    let response = pending.wait().unwrap();
    assert_eq!(response.status, 403);
    assert_eq!(response.json().unwrap()["error"], "Forbidden");
}

#[test]
fn test_continuation_panic_becomes_500() {
    let (mut worker, units) = new_worker();
    let pending = units.submit(WireRequest::new("GET", "/")).unwrap();
    let next = units.submit(WireRequest::new("GET", "/next")).unwrap();
    pending.resume(Value::Null);

    let mut handler = handler_fn(|scope| {
        if scope.path() == "/next" {
            return Outcome::Complete;
        }
        Outcome::suspend(Value::Null, |_scope, _| panic!("continuation exploded"))
    });
    assert!(worker.handle_request(&mut handler));
    assert!(worker.handle_request(&mut handler));

    assert_eq!(pending.wait().unwrap().status, 500);
    assert_eq!(next.wait().unwrap().status, 200);
    assert_eq!(worker.context().stats().get_handler_panics(), 1);
}

#[test]
fn test_finish_before_suspend_keeps_response() {
    let (mut worker, units) = new_worker();
    let pending = units.submit(WireRequest::new("GET", "/")).unwrap();
    pending.resume(Value::Null);

    let mut handler = handler_fn(|scope| {
        scope.write("early");
        scope.finish_request();
        Outcome::suspend(json!("background"), |scope, _| {
            scope.cache_put("background", json!("done"), None);
            Outcome::Complete
        })
    });
    assert!(worker.handle_request(&mut handler));

    // the end marker precedes the suspension, so wait() never sees the checkpoint
    let response = pending.wait().unwrap();
    assert_eq!(response.body_text(), "early");
    assert!(response.checkpoints.is_empty());
    assert_eq!(
        worker.context().cache().get("background"),
        Some(json!("done"))
    );
}

#[test]
fn test_cancel_after_finish_counts_as_completed() {
    let (mut worker, units) = new_worker_with(WorkerConfig {
        max_consecutive_failures: 2,
        ..test_config()
    });
    let failing = units.submit(WireRequest::new("GET", "/fail")).unwrap();
    let finished = units.submit(WireRequest::new("GET", "/finish")).unwrap();
    let failing_again = units.submit(WireRequest::new("GET", "/fail")).unwrap();
    finished.cancel();

    let releases = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&releases);
    let mut handler = handler_fn(move |scope| {
        if scope.path() == "/fail" {
            return Outcome::Fail(HandlerError::request("boom"));
        }
        scope.register_resource(Counted::boxed("job", &counter));
        scope.write("done");
        scope.finish_request();
        Outcome::suspend(json!("background"), |_scope, _| Outcome::Complete)
    });

    assert!(worker.handle_request(&mut handler));
    assert!(worker.handle_request(&mut handler));
    // the finished request reset the failure streak, so one more failure is tolerated
    assert!(worker.handle_request(&mut handler));

    assert_eq!(failing.wait().unwrap().status, 500);
    assert_eq!(finished.wait().unwrap().body_text(), "done");
    assert_eq!(failing_again.wait().unwrap().status, 500);
    assert_eq!(releases.load(Ordering::SeqCst), 1);
    assert_eq!(worker.context().stats().get_cancellations(), 0);
    assert_eq!(worker.context().stats().get_handler_failures(), 2);
    assert!(worker.exit_reason().is_none());
}

#[test]
fn test_shutdown_cancels_suspended_request() {
    let (mut worker, units) = new_worker();
    let context = Arc::clone(worker.context());
    let pending = units.submit(WireRequest::new("GET", "/parked")).unwrap();

    let releases = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&releases);
    let serving = std::thread::spawn(move || {
        worker.run(&mut handler_fn(move |scope| {
            scope.register_resource(Counted::boxed("lease", &counter));
            Outcome::suspend(Value::Null, |scope, _| {
                scope.write("never");
                Outcome::Complete
            })
        }))
    });

    assert_eq!(pending.next_event(), Some(ResponseEvent::Suspended(Value::Null)));
    context.request_shutdown();
    units.shutdown();

    assert_eq!(serving.join().unwrap(), ExitReason::Shutdown);
    assert_eq!(releases.load(Ordering::SeqCst), 1);
    assert_eq!(pending.next_event(), None);
    assert_eq!(context.stats().get_cancellations(), 1);
}

#[test]
fn test_worker_thread_answers_suspensions_live() {
    let (mut worker, units) = new_worker();
    let pending = units.submit(WireRequest::new("GET", "/live")).unwrap();
    units.shutdown();

    let serving = std::thread::spawn(move || {
        worker.run(&mut handler_fn(|_scope| {
            Outcome::suspend(json!({ "question": 1 }), |_scope, answer| {
                Outcome::suspend(json!({ "question": 2 }), move |scope, second| {
                    scope.write_json(&json!([answer, second]));
                    Outcome::Complete
                })
            })
        }))
    });

    let mut asked = 0;
    let response = pending
        .wait_with(|question| {
            asked += 1;
            Resume::Value(json!(question["question"].as_u64().unwrap() * 10))
        })
        .unwrap();
    assert_eq!(asked, 2);
    assert_eq!(response.json().unwrap(), json!([10, 20]));
    assert_eq!(serving.join().unwrap(), ExitReason::Shutdown);
}
