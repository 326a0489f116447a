//! # Collaborator Boundary
//!
//! The external collaborator (HTTP front end, test harness, the `stdio` CLI)
//! talks to a worker through two `may` channels:
//!
//! - a **unit channel** carrying admissions: each [`UnitSender::submit`] turns a
//!   [`WireRequest`] into a [`RequestUnit`] for the dispatch loop, and
//!   [`UnitSender::shutdown`] asks the loop to stop
//! - a **per-unit response channel** carrying [`ResponseEvent`]s back, plus a
//!   resume channel for answering suspensions
//!
//! A response is only well-formed if it ends with [`ResponseEvent::End`]. When
//! the worker aborts a response (handler failure after streaming started,
//! cancelled suspension, process teardown) the event sender is dropped without
//! `End`, and [`PendingResponse::wait`] reports
//! [`ResponseError::ConnectionLost`](crate::error::ResponseError::ConnectionLost)
//! instead of a truncated success.

mod core;

pub(crate) use core::{channel, Admission, Responder, UnitReceiver};
pub use core::{CompletedResponse, PendingResponse, RequestUnit, ResponseEvent, UnitSender, WireRequest};
