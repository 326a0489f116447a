use crate::error::HeaderError;
use http::{HeaderName, HeaderValue, StatusCode};
use serde_json::{Map, Value};
use smallvec::SmallVec;
use std::sync::Arc;
use tracing::debug;

/// Maximum inline headers before heap allocation
/// Most responses stage ≤16 headers (JSF: no heap in hot path)
pub const MAX_INLINE_HEADERS: usize = 16;

/// Stack-allocated header storage for staged response headers
///
/// Header names use `Arc<str>` since the same few names (Content-Type,
/// Cache-Control, Set-Cookie) are staged on nearly every request.
pub type HeaderVec = SmallVec<[(Arc<str>, String); MAX_INLINE_HEADERS]>;

/// Canonical `Title-Case` spelling of a header name.
#[must_use]
pub fn canonical_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper = true;
    for ch in name.chars() {
        if upper {
            out.extend(ch.to_uppercase());
        } else {
            out.extend(ch.to_lowercase());
        }
        upper = ch == '-';
    }
    out
}

fn is_valid_name(name: &str) -> bool {
    HeaderName::from_bytes(name.as_bytes()).is_ok()
}

fn is_valid_value(value: &str) -> bool {
    HeaderValue::from_bytes(value.as_bytes()).is_ok()
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct IncomingField {
    name: Arc<str>,
    values: SmallVec<[String; 1]>,
}

/// Caller-facing view of the request headers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IncomingHeaders {
    fields: Vec<IncomingField>,
    rejected: usize,
}

impl IncomingHeaders {
    /// Capture raw `Name: value` lines as delivered by the transport.
    pub fn capture<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut headers = Self::default();
        for line in lines {
            let line = line.as_ref();
            match line.split_once(':') {
                Some((name, value)) => headers.push(name.trim_end(), value),
                None => {
                    debug!(line = %line, "Skipping header line without name/value split");
                    headers.rejected += 1;
                }
            }
        }
        headers
    }

    /// Capture already-split `(name, value)` pairs.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut headers = Self::default();
        for (name, value) in pairs {
            headers.push(name.as_ref(), value.as_ref());
        }
        headers
    }

    fn push(&mut self, name: &str, value: &str) {
        if name.is_empty() || !is_valid_name(name) {
            debug!(name = %name, "Skipping header with invalid name");
            self.rejected += 1;
            return;
        }
        let value = value.trim().to_string();
        match self
            .fields
            .iter_mut()
            .find(|f| f.name.eq_ignore_ascii_case(name))
        {
            Some(field) => field.values.push(value),
            None => {
                let mut values = SmallVec::new();
                values.push(value);
                self.fields.push(IncomingField {
                    name: Arc::from(canonical_name(name)),
                    values,
                });
            }
        }
    }

    /// First value of the named header (case-insensitive).
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.get_all(name).first().map(String::as_str)
    }

    /// Every value of the named header, in arrival order.
    #[must_use]
    pub fn get_all(&self, name: &str) -> &[String] {
        self.fields
            .iter()
            .find(|f| f.name.eq_ignore_ascii_case(name))
            .map(|f| f.values.as_slice())
            .unwrap_or(&[])
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        !self.get_all(name).is_empty()
    }

    /// Number of distinct header names.
    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Lines skipped during capture.
    #[must_use]
    pub fn rejected(&self) -> usize {
        self.rejected
    }

    /// `(canonical name, values)` in first-seen order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.fields
            .iter()
            .map(|f| (f.name.as_ref(), f.values.as_slice()))
    }

    /// Mapping of name to a string, or to a list when the header repeated.
    #[must_use]
    pub fn to_json(&self) -> Value {
        let mut map = Map::with_capacity(self.fields.len());
        for field in &self.fields {
            let value = if field.values.len() == 1 {
                Value::String(field.values[0].clone())
            } else {
                Value::Array(field.values.iter().cloned().map(Value::String).collect())
            };
            map.insert(field.name.to_string(), value);
        }
        Value::Object(map)
    }
}

/// How [`HeaderExchange::set_outgoing`] treats an already-staged name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderMode {
    /// Keep existing lines and add another.
    Append,
    /// Drop existing lines with the same name, then add.
    Replace,
}

/// Status and headers as they went (or will go) on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmittedHead {
    /// HTTP status code
    pub status: u16,
    /// Headers in staging order
    pub headers: HeaderVec,
}

impl EmittedHead {
    /// Owned `(name, value)` pairs, handy for serialization and assertions.
    #[must_use]
    pub fn header_pairs(&self) -> Vec<(String, String)> {
        self.headers
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }
}

/// Request-scoped header/status state.
#[derive(Debug, Clone)]
pub struct HeaderExchange {
    incoming: IncomingHeaders,
    outgoing: HeaderVec,
    status: u16,
    emitted: Option<EmittedHead>,
}

impl HeaderExchange {
    #[must_use]
    pub fn new(incoming: IncomingHeaders) -> Self {
        Self {
            incoming,
            outgoing: HeaderVec::new(),
            status: 200,
            emitted: None,
        }
    }

    #[must_use]
    pub fn incoming(&self) -> &IncomingHeaders {
        &self.incoming
    }

    /// Stage a response header.
    ///
    /// Returns `Ok(false)` without staging anything once the head has been emitted.
    pub fn set_outgoing(
        &mut self,
        name: &str,
        value: &str,
        mode: HeaderMode,
    ) -> Result<bool, HeaderError> {
        if self.emitted.is_some() {
            debug!(header = %name, "Ignoring header staged after emission");
            return Ok(false);
        }
        if name.is_empty() || !is_valid_name(name) {
            return Err(HeaderError::InvalidName(name.to_string()));
        }
        if !is_valid_value(value) {
            return Err(HeaderError::InvalidValue {
                name: name.to_string(),
            });
        }
        if mode == HeaderMode::Replace {
            self.outgoing.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
        }
        self.outgoing.push((Arc::from(name), value.to_string()));
        Ok(true)
    }

    /// Drop every staged line with this name. Returns whether anything was removed.
    pub fn remove_outgoing(&mut self, name: &str) -> bool {
        if self.emitted.is_some() {
            return false;
        }
        let before = self.outgoing.len();
        self.outgoing.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
        before != self.outgoing.len()
    }

    /// Override the final status.
    ///
    /// Accepts 200..=999; 1xx codes go through [`Self::informational_head`].
    pub fn set_status(&mut self, code: u16) -> Result<bool, HeaderError> {
        if self.emitted.is_some() {
            debug!(status = code, "Ignoring status set after emission");
            return Ok(false);
        }
        if code < 200 || StatusCode::from_u16(code).is_err() {
            return Err(HeaderError::InvalidStatus(code));
        }
        self.status = code;
        Ok(true)
    }

    #[must_use]
    pub fn status(&self) -> u16 {
        self.emitted.as_ref().map_or(self.status, |h| h.status)
    }

    /// First staged value for `name`.
    #[must_use]
    pub fn get_outgoing(&self, name: &str) -> Option<&str> {
        self.outgoing
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Snapshot of the staged headers, in staging order.
    #[must_use]
    pub fn response_headers(&self) -> Vec<(String, String)> {
        self.outgoing
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[must_use]
    pub fn is_emitted(&self) -> bool {
        self.emitted.is_some()
    }

    /// Freeze and return the head. Idempotent.
    pub fn emit(&mut self) -> EmittedHead {
        if let Some(head) = &self.emitted {
            return head.clone();
        }
        let head = EmittedHead {
            status: self.status,
            headers: self.outgoing.clone(),
        };
        self.emitted = Some(head.clone());
        head
    }

    /// Interim 1xx head carrying the currently staged headers. Does not freeze.
    pub fn informational_head(&self, code: u16) -> Result<EmittedHead, HeaderError> {
        if !(100..=199).contains(&code) {
            return Err(HeaderError::InvalidStatus(code));
        }
        Ok(EmittedHead {
            status: code,
            headers: self.outgoing.clone(),
        })
    }

    /// Replace the staged head with a generic error response.
    ///
    /// Only meaningful before emission; returns `false` when the head already left.
    pub(crate) fn reset_for_error(&mut self, status: u16) -> bool {
        if self.emitted.is_some() {
            return false;
        }
        self.outgoing.clear();
        self.outgoing.push((
            Arc::from("content-type"),
            "application/json".to_string(),
        ));
        self.status = status;
        true
    }
}
