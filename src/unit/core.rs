use crate::error::{ResponseError, SubmitError};
use crate::suspend::Resume;
use may::sync::mpsc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::mpsc::RecvTimeoutError;
use std::time::Duration;
use tracing::debug;

/// Wire data for one request as the collaborator presents it.
///
/// Header lines are raw `Name: value` strings; lines without a colon are
/// dropped during capture rather than failing the request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WireRequest {
    pub method: String,
    pub uri: String,
    #[serde(rename = "headers")]
    pub header_lines: Vec<String>,
    #[serde(with = "body_text")]
    pub body: Vec<u8>,
    pub remote_addr: Option<String>,
}

impl WireRequest {
    pub fn new(method: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            uri: uri.into(),
            ..Self::default()
        }
    }

    /// Append a raw header line.
    #[must_use]
    pub fn header_line(mut self, line: impl Into<String>) -> Self {
        self.header_lines.push(line.into());
        self
    }

    #[must_use]
    pub fn header(self, name: &str, value: &str) -> Self {
        self.header_line(format!("{name}: {value}"))
    }

    #[must_use]
    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }
}

/// Bodies travel as UTF-8 text in JSON (lossy for binary payloads).
mod body_text {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&String::from_utf8_lossy(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        Ok(String::deserialize(deserializer)?.into_bytes())
    }
}

/// One step of a response as the worker produces it.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseEvent {
    /// 1xx interim response; more heads follow.
    Informational {
        status: u16,
        headers: Vec<(String, String)>,
    },
    /// Final status line and headers. Sent at most once.
    Head {
        status: u16,
        headers: Vec<(String, String)>,
    },
    Body(Vec<u8>),
    /// Handler suspended; the collaborator must answer with a [`Resume`].
    Suspended(Value),
    /// Response complete. A response that ends without this was aborted.
    End,
}

pub(crate) enum Admission {
    Unit(RequestUnit),
    Shutdown,
}

/// One pending request, owned by the dispatch loop for exactly one handler invocation.
pub struct RequestUnit {
    pub(crate) request: WireRequest,
    pub(crate) responder: Responder,
}

impl std::fmt::Debug for RequestUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestUnit")
            .field("method", &self.request.method)
            .field("uri", &self.request.uri)
            .finish()
    }
}

/// Worker-side end of a unit's response channel.
pub(crate) struct Responder {
    events: mpsc::Sender<ResponseEvent>,
    resumes: mpsc::Receiver<Resume>,
}

impl Responder {
    /// Returns `false` once the collaborator stopped listening.
    pub(crate) fn send(&self, event: ResponseEvent) -> bool {
        self.events.send(event).is_ok()
    }

    /// Wait up to `timeout` for the collaborator to answer a suspension.
    pub(crate) fn recv_resume_timeout(&self, timeout: Duration) -> Result<Resume, RecvTimeoutError> {
        self.resumes.recv_timeout(timeout)
    }
}

/// Collaborator handle for feeding one worker.
#[derive(Clone)]
pub struct UnitSender {
    tx: mpsc::Sender<Admission>,
}

impl std::fmt::Debug for UnitSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitSender").finish_non_exhaustive()
    }
}

impl UnitSender {
    /// Queue a request for the worker.
    pub fn submit(&self, request: WireRequest) -> Result<PendingResponse, SubmitError> {
        let (event_tx, event_rx) = mpsc::channel();
        let (resume_tx, resume_rx) = mpsc::channel();
        let unit = RequestUnit {
            request,
            responder: Responder {
                events: event_tx,
                resumes: resume_rx,
            },
        };
        self.tx
            .send(Admission::Unit(unit))
            .map_err(|_| SubmitError)?;
        Ok(PendingResponse {
            events: event_rx,
            resumes: resume_tx,
        })
    }

    /// Tell the worker to stop once it reaches this point in the queue.
    pub fn shutdown(&self) {
        if self.tx.send(Admission::Shutdown).is_err() {
            debug!("Shutdown sent to a worker that already stopped");
        }
    }
}

pub(crate) struct UnitReceiver {
    rx: mpsc::Receiver<Admission>,
}

impl UnitReceiver {
    /// Blocks until something is queued. `None` once every sender is gone.
    pub(crate) fn recv(&self) -> Option<Admission> {
        self.rx.recv().ok()
    }

    /// Drop everything still queued; each abandoned unit's caller sees a lost
    /// connection. Returns how many requests were abandoned.
    pub(crate) fn drain(&self) -> usize {
        let mut abandoned = 0;
        while let Ok(admission) = self.rx.try_recv() {
            if matches!(admission, Admission::Unit(_)) {
                abandoned += 1;
            }
        }
        abandoned
    }
}

pub(crate) fn channel() -> (UnitSender, UnitReceiver) {
    let (tx, rx) = mpsc::channel();
    (UnitSender { tx }, UnitReceiver { rx })
}

/// Collaborator-side view of one submitted request.
pub struct PendingResponse {
    events: mpsc::Receiver<ResponseEvent>,
    resumes: mpsc::Sender<Resume>,
}

impl std::fmt::Debug for PendingResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingResponse").finish_non_exhaustive()
    }
}

impl PendingResponse {
    /// Next event, or `None` once the worker dropped the response.
    pub fn next_event(&self) -> Option<ResponseEvent> {
        self.events.recv().ok()
    }

    /// Resume a suspended handler. Values may be queued before the suspension happens.
    pub fn resume(&self, value: Value) -> bool {
        self.resumes.send(Resume::Value(value)).is_ok()
    }

    pub fn cancel(&self) -> bool {
        self.resumes.send(Resume::Cancel).is_ok()
    }

    /// Collect the whole response, resuming every suspension with `null`.
    pub fn wait(self) -> Result<CompletedResponse, ResponseError> {
        self.wait_with(|_| Resume::Value(Value::Null))
    }

    /// Collect the whole response, answering each suspension with `on_suspend`.
    pub fn wait_with<F>(self, mut on_suspend: F) -> Result<CompletedResponse, ResponseError>
    where
        F: FnMut(&Value) -> Resume,
    {
        let mut head: Option<(u16, Vec<(String, String)>)> = None;
        let mut body = Vec::new();
        let mut informational = Vec::new();
        let mut checkpoints = Vec::new();

        loop {
            let Some(event) = self.next_event() else {
                return Err(ResponseError::ConnectionLost {
                    head_received: head.is_some(),
                });
            };
            match event {
                ResponseEvent::Informational { status, headers } => {
                    informational.push((status, headers));
                }
                ResponseEvent::Head { status, headers } => head = Some((status, headers)),
                ResponseEvent::Body(chunk) => body.extend_from_slice(&chunk),
                ResponseEvent::Suspended(value) => {
                    let answer = on_suspend(&value);
                    checkpoints.push(value);
                    // worker may already be gone; the next recv reports that
                    let _ = self.resumes.send(answer);
                }
                ResponseEvent::End => {
                    let Some((status, headers)) = head else {
                        return Err(ResponseError::ConnectionLost {
                            head_received: false,
                        });
                    };
                    return Ok(CompletedResponse {
                        status,
                        headers,
                        body,
                        informational,
                        checkpoints,
                    });
                }
            }
        }
    }
}

/// A response that reached its end marker.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    /// Interim 1xx heads, in order
    pub informational: Vec<(u16, Vec<(String, String)>)>,
    /// Values yielded by each suspension, in order
    pub checkpoints: Vec<Value>,
}

impl CompletedResponse {
    /// First header with this name (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn header_all(&self, name: &str) -> Vec<&str> {
        self.headers
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Body parsed as JSON, if it is JSON.
    pub fn json(&self) -> Option<Value> {
        serde_json::from_slice(&self.body).ok()
    }
}
