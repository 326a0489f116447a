//! # Header Exchange Module
//!
//! Captures the request headers presented by the external caller and buffers the
//! response headers and status a handler stages until they are emitted.
//!
//! ## Incoming policy
//!
//! - Names are matched case-insensitively and presented in canonical
//!   `Title-Case` form (`content-type` -> `Content-Type`), independent of the
//!   casing the transport used.
//! - Repeated headers are kept as an ordered list of values under one name; they
//!   are never collapsed. [`IncomingHeaders::get`] returns the first value.
//! - A line without a `name: value` split, or whose name is not a valid HTTP token,
//!   is skipped and counted in [`IncomingHeaders::rejected`]. The request goes on.
//!
//! ## Outgoing policy
//!
//! - [`HeaderMode::Append`] adds another line even if the name is already staged.
//! - [`HeaderMode::Replace`] drops every staged line with that name (case-insensitive)
//!   and appends the new one at the end.
//! - Insertion order is preserved in [`HeaderExchange::response_headers`].
//! - Status defaults to 200; the last [`HeaderExchange::set_status`] before emission wins.
//!
//! ## Emission
//!
//! [`HeaderExchange::emit`] freezes the exchange and returns the head. Calling it
//! again returns the identical head. After emission, header and status setters are
//! silently ignored and report `Ok(false)`: a head cannot be un-sent.

mod core;

pub use core::{
    canonical_name, EmittedHead, HeaderExchange, HeaderMode, HeaderVec, IncomingHeaders,
    MAX_INLINE_HEADERS,
};
