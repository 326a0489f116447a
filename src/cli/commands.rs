use crate::config::WorkerConfig;
use crate::context::WorkerContext;
use crate::echo::EchoHandler;
use crate::logging::{init_logging_with_config, LogConfig, LogFormat};
use crate::runner::{spawn_worker, WorkerHandle};
use crate::unit::{ResponseEvent, UnitSender, WireRequest};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use may::sync::mpsc;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Command-line interface for brrtworker
#[derive(Parser, Debug)]
#[command(name = "brrtworker")]
#[command(about = "Persistent request worker", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Serve JSON request lines from stdin with the echo handler
    Stdio {
        /// YAML worker configuration
        #[arg(short, long, env = "BRRTW_CONFIG")]
        config: Option<PathBuf>,

        /// Stop after this many requests (overrides the config)
        #[arg(long)]
        max_requests: Option<u64>,

        /// Log level (overrides BRRTW_LOG_LEVEL)
        #[arg(long)]
        log_level: Option<String>,

        /// Human-readable logs on stderr
        #[arg(long, default_value_t = false)]
        pretty: bool,
    },
    /// Print the effective worker configuration as YAML
    Config {
        /// YAML worker configuration
        #[arg(short, long, env = "BRRTW_CONFIG")]
        config: Option<PathBuf>,
    },
}

/// How often the serving loop re-checks the shutdown flag while input is idle.
const INPUT_POLL_INTERVAL: Duration = Duration::from_millis(50);

fn load_config(path: Option<&PathBuf>) -> Result<WorkerConfig> {
    match path {
        Some(path) => WorkerConfig::from_yaml_file(path)
            .with_context(|| format!("loading worker config from {}", path.display())),
        None => WorkerConfig::from_env().context("loading worker config from BRRTW_* variables"),
    }
}

/// One response event as a JSON line on stdout.
pub fn event_json(request: usize, event: &ResponseEvent) -> Value {
    match event {
        ResponseEvent::Informational { status, headers } => json!({
            "request": request,
            "event": "informational",
            "status": status,
            "headers": headers,
        }),
        ResponseEvent::Head { status, headers } => json!({
            "request": request,
            "event": "head",
            "status": status,
            "headers": headers,
        }),
        ResponseEvent::Body(bytes) => json!({
            "request": request,
            "event": "body",
            "data": String::from_utf8_lossy(bytes),
        }),
        ResponseEvent::Suspended(value) => json!({
            "request": request,
            "event": "suspended",
            "value": value,
        }),
        ResponseEvent::End => json!({ "request": request, "event": "end" }),
    }
}

fn emit_line(out: &mut impl Write, value: &Value) -> Result<()> {
    serde_json::to_writer(&mut *out, value).context("writing event")?;
    out.write_all(b"\n").context("writing event")?;
    out.flush().context("flushing stdout")
}

/// Submit one request and stream its events; suspensions are resumed with `null`.
fn serve_line(units: &UnitSender, request: usize, line: &str, out: &mut impl Write) -> Result<()> {
    let wire: WireRequest = match serde_json::from_str(line) {
        Ok(wire) => wire,
        Err(e) => {
            warn!(request = request, error = %e, "Skipping unparseable request line");
            return emit_line(out, &json!({ "request": request, "event": "error", "error": e.to_string() }));
        }
    };
    let pending = units.submit(wire).context("worker stopped accepting requests")?;

    loop {
        let Some(event) = pending.next_event() else {
            return emit_line(out, &json!({ "request": request, "event": "connection_lost" }));
        };
        emit_line(out, &event_json(request, &event))?;
        match event {
            ResponseEvent::Suspended(_) => {
                pending.resume(Value::Null);
            }
            ResponseEvent::End => return Ok(()),
            _ => {}
        }
    }
}

/// Serve request lines from `input` until it ends, the worker stops taking
/// requests, or shutdown is requested.
///
/// Lines are read on a separate thread so a shutdown is noticed even while
/// `input` has nothing to offer.
pub fn serve_lines<R, W>(handle: &WorkerHandle, input: R, out: &mut W) -> Result<()>
where
    R: BufRead + Send + 'static,
    W: Write,
{
    let (tx, lines) = mpsc::channel::<io::Result<String>>();
    std::thread::Builder::new()
        .name("brrtworker-stdin".into())
        .spawn(move || {
            for line in input.lines() {
                if tx.send(line).is_err() {
                    break;
                }
            }
        })
        .context("spawning input thread")?;

    let mut index = 0;
    loop {
        let line = match lines.recv_timeout(INPUT_POLL_INTERVAL) {
            Ok(line) => line.context("reading request lines")?,
            Err(RecvTimeoutError::Timeout) => {
                if handle.context().is_shutting_down() {
                    info!("Shutdown requested - no longer reading requests");
                    return Ok(());
                }
                continue;
            }
            Err(RecvTimeoutError::Disconnected) => return Ok(()),
        };
        index += 1;
        if line.trim().is_empty() {
            continue;
        }
        if handle.context().is_shutting_down() {
            return Ok(());
        }
        if let Err(e) = serve_line(handle.units(), index, &line, out) {
            // worker stopped (max requests, fatal, shutdown); stop reading
            warn!(error = %e, "Worker no longer serving");
            return Ok(());
        }
    }
}

#[cfg(unix)]
fn install_signal_handlers(handle: &WorkerHandle) -> Result<()> {
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGTERM, SIGINT]).context("registering signal handlers")?;
    let context = Arc::clone(handle.context());
    let units = handle.units().clone();
    std::thread::Builder::new()
        .name("brrtworker-signals".into())
        .spawn(move || {
            if let Some(signal) = signals.forever().next() {
                info!(signal = signal, "Signal received - shutting down worker");
                context.request_shutdown();
                units.shutdown();
            }
        })
        .context("spawning signal thread")?;
    Ok(())
}

#[cfg(not(unix))]
fn install_signal_handlers(_handle: &WorkerHandle) -> Result<()> {
    Ok(())
}

fn run_stdio(
    config: Option<&PathBuf>,
    max_requests: Option<u64>,
    log_level: Option<&str>,
    pretty: bool,
) -> Result<()> {
    let mut log_config = LogConfig::from_env();
    if let Some(level) = log_level {
        log_config.log_level = level.to_string();
    }
    if pretty {
        log_config.format = LogFormat::Pretty;
    }
    let _log_guard = init_logging_with_config(&log_config)?;

    let mut config = load_config(config)?;
    if let Some(max) = max_requests {
        config.max_requests = max;
    }
    let context = Arc::new(WorkerContext::from_config(&config).context("building worker context")?);

    // SAFETY: the echo handler does no blocking I/O and only touches worker-owned state.
    let handle = unsafe { spawn_worker(config, context, EchoHandler) }
        .context("spawning worker coroutine")?;
    install_signal_handlers(&handle)?;

    let stdout = io::stdout();
    let mut out = stdout.lock();
    serve_lines(&handle, io::BufReader::new(io::stdin()), &mut out)?;

    handle.shutdown();
    let reason = handle.join();
    info!(reason = %reason, "Worker exited");
    Ok(())
}

/// Parse arguments and run the selected command.
pub fn run_cli(cli: Cli) -> Result<()> {
    match &cli.command {
        Commands::Stdio {
            config,
            max_requests,
            log_level,
            pretty,
        } => run_stdio(config.as_ref(), *max_requests, log_level.as_deref(), *pretty),
        Commands::Config { config } => {
            let config = load_config(config.as_ref())?;
            print!("{}", config.to_yaml()?);
            Ok(())
        }
    }
}
