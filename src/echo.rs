//! Demo handler used by the `stdio` CLI.
//!
//! Echoes the request back as JSON and exercises the worker-lifetime stores:
//!
//! - `cache["echo:hits"]` counts requests served by this worker
//! - `GREETING` from environment persistence is included in every reply
//! - `POST /env` with `{"set": {"K": "V"}, "unset": ["K"]}` mutates the environment
//! - `?suspend` yields once and echoes the resume value
//! - `X-Echo-Status: <code>` overrides the response status

use crate::dispatcher::{Handler, RequestScope};
use crate::error::HandlerError;
use crate::headers::HeaderMode;
use crate::suspend::Outcome;
use serde_json::{json, Value};

const HITS_KEY: &str = "echo:hits";

#[derive(Debug, Default, Clone, Copy)]
pub struct EchoHandler;

impl EchoHandler {
    fn reply(scope: &mut RequestScope<'_>, resumed: Option<Value>) -> Result<(), HandlerError> {
        if let Some(code) = scope.request_headers().get("x-echo-status") {
            let code = code
                .trim()
                .parse::<u16>()
                .map_err(|_| HandlerError::with_status(400, format!("bad X-Echo-Status {code:?}")))?;
            scope.set_status(code)?;
        }

        let hits = scope
            .cache_get(HITS_KEY)
            .and_then(|v| v.as_u64())
            .unwrap_or(0)
            + 1;
        scope.cache_put(HITS_KEY, json!(hits), None);

        let mut body = json!({
            "worker": scope.worker().id().to_string(),
            "request_id": scope.request_id().to_string(),
            "seq": scope.sequence(),
            "method": scope.method(),
            "uri": scope.uri(),
            "headers": scope.request_headers().to_json(),
            "body": String::from_utf8_lossy(scope.body()),
            "hits": hits,
            "greeting": scope.env().get("GREETING"),
        });
        if let Some(value) = resumed {
            body["resumed"] = value;
        }

        scope.set_header("X-Echo-Hits", &hits.to_string(), HeaderMode::Replace)?;
        scope.write_json(&body);
        Ok(())
    }

    fn apply_env(scope: &mut RequestScope<'_>) -> Result<(), HandlerError> {
        let Some(update) = scope.body_json() else {
            return Err(HandlerError::with_status(400, "expected a JSON body"));
        };
        if let Some(set) = update.get("set").and_then(Value::as_object) {
            for (name, value) in set {
                let value = value.as_str().map_or_else(|| value.to_string(), str::to_string);
                scope.env().set(name, &value)?;
            }
        }
        if let Some(unset) = update.get("unset").and_then(Value::as_array) {
            for name in unset.iter().filter_map(Value::as_str) {
                scope.env().unset(name);
            }
        }
        let snapshot = json!(scope.env().snapshot());
        scope.write_json(&snapshot);
        Ok(())
    }
}

impl Handler for EchoHandler {
    fn invoke(&mut self, scope: &mut RequestScope<'_>) -> Outcome {
        if scope.method() == "POST" && scope.path() == "/env" {
            return Self::apply_env(scope).into();
        }
        let wants_suspend = scope
            .query()
            .is_some_and(|q| q.split('&').any(|p| p == "suspend"));
        if wants_suspend {
            return Outcome::suspend(json!({ "checkpoint": scope.uri() }), |scope, value| {
                EchoHandler::reply(scope, Some(value)).into()
            });
        }
        Self::reply(scope, None).into()
    }
}
