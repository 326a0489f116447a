//! # CLI Module
//!
//! Command-line entry points for the `brrtworker` binary.
//!
//! ## Commands
//!
//! ### `stdio`
//!
//! Runs one worker with the demo [`EchoHandler`](crate::echo::EchoHandler) and
//! acts as its collaborator: every stdin line is a JSON request, every response
//! event is written to stdout as a JSON line.
//!
//! ```bash
//! echo '{"method":"GET","uri":"/hello","headers":["X-Trace: 1"]}' | brrtworker stdio
//! ```
//!
//! ```text
//! {"request":1,"event":"head","status":200,"headers":[["Content-Type","application/json"],...]}
//! {"request":1,"event":"body","data":"{...}"}
//! {"request":1,"event":"end"}
//! ```
//!
//! Suspensions are answered with `null`. When the worker stops (max requests,
//! worker-fatal error, SIGTERM/SIGINT) the command stops reading stdin.
//!
//! ### `config`
//!
//! Prints the effective configuration (file plus `BRRTW_*` overrides) as YAML.

mod commands;


pub use commands::{event_json, run_cli, serve_lines, Cli, Commands};
