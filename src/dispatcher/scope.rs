use crate::cache::ScopedCache;
use crate::context::WorkerContext;
use crate::environ::EnvStore;
use crate::error::HeaderError;
use crate::finalizer::{Deferred, Finalizer, OwnedHandle, Resource, UploadTempFile};
use crate::headers::{HeaderExchange, HeaderMode, IncomingHeaders};
use crate::ids::RequestId;
use crate::unit::{Responder, ResponseEvent, WireRequest};
use serde_json::Value;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// How far the response has travelled to the collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseState {
    /// Nothing sent; headers and status are still mutable.
    Pending,
    /// Head sent, body chunks go out as written.
    Streaming,
    /// End marker sent; further output is discarded.
    Sent,
}

/// Everything one request owns. Created right before the handler runs and
/// dropped right after the finalizer; nothing in here survives into the next request.
pub(crate) struct RequestContext {
    id: RequestId,
    seq: u64,
    method: String,
    uri: String,
    body: Vec<u8>,
    remote_addr: Option<String>,
    exchange: HeaderExchange,
    out: Vec<u8>,
    state: ResponseState,
    finished_early: bool,
    finalizer: Finalizer,
    responder: Responder,
    upload_dir: Option<PathBuf>,
    client_gone: bool,
}

impl RequestContext {
    pub(crate) fn new(
        request: WireRequest,
        responder: Responder,
        seq: u64,
        default_headers: &[(String, String)],
        upload_dir: Option<PathBuf>,
    ) -> Self {
        let incoming = IncomingHeaders::capture(&request.header_lines);
        let id = RequestId::from_header_or_new(incoming.get("x-request-id"));
        if incoming.rejected() > 0 {
            debug!(
                request_id = %id,
                rejected = incoming.rejected(),
                "Skipped malformed request header lines"
            );
        }

        let mut exchange = HeaderExchange::new(incoming);
        for (name, value) in default_headers {
            if let Err(e) = exchange.set_outgoing(name, value, HeaderMode::Append) {
                warn!(request_id = %id, error = %e, "Skipping invalid default header");
            }
        }

        Self {
            id,
            seq,
            method: request.method,
            uri: request.uri,
            body: request.body,
            remote_addr: request.remote_addr,
            exchange,
            out: Vec::new(),
            state: ResponseState::Pending,
            finished_early: false,
            finalizer: Finalizer::new(id),
            responder,
            upload_dir,
            client_gone: false,
        }
    }

    pub(crate) fn id(&self) -> RequestId {
        self.id
    }

    pub(crate) fn state(&self) -> ResponseState {
        self.state
    }

    pub(crate) fn status(&self) -> u16 {
        self.exchange.status()
    }

    pub(crate) fn finished_early(&self) -> bool {
        self.finished_early
    }

    pub(crate) fn response_headers(&self) -> Vec<(String, String)> {
        self.exchange.response_headers()
    }

    pub(crate) fn finalizer_mut(&mut self) -> &mut Finalizer {
        &mut self.finalizer
    }

    pub(crate) fn responder(&self) -> &Responder {
        &self.responder
    }

    fn send(&mut self, event: ResponseEvent) {
        if self.client_gone {
            return;
        }
        if !self.responder.send(event) {
            debug!(request_id = %self.id, "Collaborator stopped listening for this response");
            self.client_gone = true;
        }
    }

    pub(crate) fn notify_suspended(&mut self, yielded: Value) {
        self.send(ResponseEvent::Suspended(yielded));
    }

    /// Send the frozen head followed by whatever body is buffered.
    fn start_streaming(&mut self) {
        let head = self.exchange.emit();
        self.send(ResponseEvent::Head {
            status: head.status,
            headers: head.header_pairs(),
        });
        if !self.out.is_empty() {
            let chunk = std::mem::take(&mut self.out);
            self.send(ResponseEvent::Body(chunk));
        }
        self.state = ResponseState::Streaming;
    }

    fn write(&mut self, bytes: &[u8]) -> bool {
        match self.state {
            ResponseState::Pending => {
                self.out.extend_from_slice(bytes);
                true
            }
            ResponseState::Streaming => {
                if !bytes.is_empty() {
                    self.send(ResponseEvent::Body(bytes.to_vec()));
                }
                true
            }
            ResponseState::Sent => {
                debug!(request_id = %self.id, bytes = bytes.len(), "Discarding output written after finish");
                false
            }
        }
    }

    fn flush(&mut self) {
        if self.state == ResponseState::Pending {
            self.start_streaming();
        }
    }

    /// Send whatever is left and the end marker. Returns `false` if already sent.
    pub(crate) fn complete(&mut self) -> bool {
        match self.state {
            ResponseState::Sent => false,
            ResponseState::Pending => {
                self.start_streaming();
                self.send(ResponseEvent::End);
                self.state = ResponseState::Sent;
                true
            }
            ResponseState::Streaming => {
                self.send(ResponseEvent::End);
                self.state = ResponseState::Sent;
                true
            }
        }
    }

    /// Replace the pending response with a generic error. Returns `false` when
    /// the head already left, in which case the response can only be aborted.
    pub(crate) fn fail(&mut self, status: u16) -> bool {
        if self.state != ResponseState::Pending || !self.exchange.reset_for_error(status) {
            return false;
        }
        let reason = http::StatusCode::from_u16(status)
            .ok()
            .and_then(|s| s.canonical_reason())
            .unwrap_or("Error");
        self.out = serde_json::to_vec(&serde_json::json!({
            "error": reason,
            "status": status,
            "request_id": self.id.to_string(),
        }))
        .unwrap_or_default();
        self.complete()
    }

    fn finish_request(&mut self) -> bool {
        if self.state == ResponseState::Sent {
            return false;
        }
        self.complete();
        self.finished_early = true;
        true
    }
}

/// A handler's view of the request it is serving and of its worker.
///
/// Exists only for the duration of one handler call (or one continuation
/// call); a fresh scope is built for each re-entry.
pub struct RequestScope<'a> {
    ctx: &'a mut RequestContext,
    worker: &'a WorkerContext,
}

impl<'a> RequestScope<'a> {
    pub(crate) fn new(ctx: &'a mut RequestContext, worker: &'a WorkerContext) -> Self {
        Self { ctx, worker }
    }

    // Request side

    pub fn request_id(&self) -> RequestId {
        self.ctx.id
    }

    /// 1-based position of this request in the worker's lifetime.
    pub fn sequence(&self) -> u64 {
        self.ctx.seq
    }

    pub fn method(&self) -> &str {
        &self.ctx.method
    }

    pub fn uri(&self) -> &str {
        &self.ctx.uri
    }

    /// Path part of the URI (query string stripped).
    pub fn path(&self) -> &str {
        self.ctx
            .uri
            .split_once('?')
            .map_or(self.ctx.uri.as_str(), |(path, _)| path)
    }

    pub fn query(&self) -> Option<&str> {
        self.ctx.uri.split_once('?').map(|(_, q)| q)
    }

    pub fn body(&self) -> &[u8] {
        &self.ctx.body
    }

    /// Body parsed as JSON; `None` when empty or not JSON.
    pub fn body_json(&self) -> Option<Value> {
        if self.ctx.body.is_empty() {
            return None;
        }
        serde_json::from_slice(&self.ctx.body).ok()
    }

    pub fn remote_addr(&self) -> Option<&str> {
        self.ctx.remote_addr.as_deref()
    }

    /// Read-only view of the incoming headers.
    pub fn request_headers(&self) -> &IncomingHeaders {
        self.ctx.exchange.incoming()
    }

    // Response side

    /// Stage a response header. `Ok(false)` once the head has been sent.
    pub fn set_header(&mut self, name: &str, value: &str, mode: HeaderMode) -> Result<bool, HeaderError> {
        self.ctx.exchange.set_outgoing(name, value, mode)
    }

    pub fn remove_header(&mut self, name: &str) -> bool {
        self.ctx.exchange.remove_outgoing(name)
    }

    /// Override the final status (last call before the head is sent wins).
    pub fn set_status(&mut self, code: u16) -> Result<bool, HeaderError> {
        self.ctx.exchange.set_status(code)
    }

    pub fn status(&self) -> u16 {
        self.ctx.exchange.status()
    }

    /// Snapshot of the headers staged so far.
    pub fn response_headers(&self) -> Vec<(String, String)> {
        self.ctx.exchange.response_headers()
    }

    pub fn response_state(&self) -> ResponseState {
        self.ctx.state
    }

    /// Append body bytes. Returns `false` (and drops them) after `finish_request`.
    pub fn write(&mut self, bytes: impl AsRef<[u8]>) -> bool {
        self.ctx.write(bytes.as_ref())
    }

    /// Write `value` as the body and stage `Content-Type: application/json`.
    pub fn write_json(&mut self, value: &Value) -> bool {
        // ignored once the head is out, same as any other header
        let _ = self
            .ctx
            .exchange
            .set_outgoing("Content-Type", "application/json", HeaderMode::Replace);
        match serde_json::to_vec(value) {
            Ok(bytes) => self.ctx.write(&bytes),
            Err(e) => {
                warn!(request_id = %self.ctx.id, error = %e, "Failed to serialize JSON body");
                false
            }
        }
    }

    /// Send the head and buffered body now; later writes stream. Header and
    /// status changes after this are ignored.
    pub fn flush(&mut self) {
        self.ctx.flush();
    }

    /// Send a 1xx interim response with the headers staged so far.
    pub fn send_informational(&mut self, code: u16) -> Result<(), HeaderError> {
        if self.ctx.state != ResponseState::Pending {
            return Err(HeaderError::InvalidStatus(code));
        }
        let head = self.ctx.exchange.informational_head(code)?;
        self.ctx.send(ResponseEvent::Informational {
            status: head.status,
            headers: head.header_pairs(),
        });
        Ok(())
    }

    /// Complete the response now; the handler may keep running non-output logic.
    ///
    /// Returns `true` the first time and `false` on every later call.
    pub fn finish_request(&mut self) -> bool {
        let finished = self.ctx.finish_request();
        if finished {
            self.worker.stats().record_early_finish();
            debug!(request_id = %self.ctx.id, status = self.ctx.status(), "Request finished early");
        }
        finished
    }

    pub fn is_finished(&self) -> bool {
        self.ctx.state == ResponseState::Sent
    }

    // Worker-lifetime stores

    pub fn cache(&self) -> &ScopedCache {
        self.worker.cache()
    }

    /// Store a value for every later request on this worker. `ttl_secs = None` never expires.
    pub fn cache_put(&self, key: &str, value: Value, ttl_secs: Option<u64>) {
        self.worker
            .cache()
            .put(key, value, ttl_secs.map(Duration::from_secs));
    }

    pub fn cache_get(&self, key: &str) -> Option<Value> {
        self.worker.cache().get(key)
    }

    pub fn cache_forget(&self, key: &str) -> bool {
        self.worker.cache().forget(key)
    }

    pub fn env(&self) -> &EnvStore {
        self.worker.env()
    }

    pub fn worker(&self) -> &WorkerContext {
        self.worker
    }

    // Resources

    /// Track a resource for release when the request ends.
    pub fn register_resource(&mut self, resource: Box<dyn Resource>) -> bool {
        self.ctx.finalizer.register(resource)
    }

    /// Write `contents` to a fresh upload temp file owned by this request.
    ///
    /// The file is deleted when the request ends.
    pub fn create_upload_file(&mut self, contents: &[u8]) -> io::Result<PathBuf> {
        let upload = UploadTempFile::create_in(self.ctx.upload_dir.as_deref(), contents)?;
        let path = upload.path().to_path_buf();
        self.ctx.finalizer.register(Box::new(upload));
        Ok(path)
    }

    /// Keep `handle` open until the request ends, then drop it.
    pub fn hold<T: Send + 'static>(&mut self, key: impl Into<String>, handle: T) -> bool {
        self.ctx
            .finalizer
            .register(Box::new(OwnedHandle::new(key, handle)))
    }

    /// Run `action` when the request ends.
    pub fn defer<F>(&mut self, key: impl Into<String>, action: F) -> bool
    where
        F: FnOnce() -> io::Result<()> + Send + 'static,
    {
        self.ctx.finalizer.register(Box::new(Deferred::new(key, action)))
    }

    /// Directory upload files go to, if configured.
    pub fn upload_dir(&self) -> Option<&Path> {
        self.ctx.upload_dir.as_deref()
    }
}
