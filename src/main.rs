//! dvr-feeder: pull a live H.264 stream from a HiEasy DVR to stdout.
//!
//! Designed to be piped into an RTSP publisher or the segment muxer:
//!
//! ```text
//! DVR_HOST=192.168.1.x dvr-feeder --channel 0 | \
//!   ffmpeg -fflags +genpts -r 25 -f h264 -i pipe:0 -c copy -f rtsp rtsp://localhost:8554/ch0
//! ```
//!
//! Stdout carries only the H.264 byte stream; all logging goes to stderr.
//! Exit code 0 means the stdout reader went away or a signal asked us to
//! stop; exit code 1 means the reconnect budget ran out.

use std::io::{self, Write};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock};
use std::thread;
use std::time::Duration;

use clap::Parser;
use hieasy_dvr::{DvrSession, HashOracle, HelperHashOracle, SessionConfig};

/// Global flag for signal-triggered shutdown (Arc for the ctrlc handler).
static SHUTDOWN: LazyLock<Arc<AtomicBool>> =
    LazyLock::new(|| Arc::new(AtomicBool::new(false)));

/// Reconnect attempts before giving up.
const MAX_RETRIES: u32 = 5;
/// First reconnect delay in seconds; doubles per attempt.
const RETRY_BASE_SECS: u64 = 3;
/// Reconnect delay ceiling in seconds.
const RETRY_CAP_SECS: u64 = 30;

/// DVR H.264 stream feeder.
#[derive(Parser, Debug)]
#[command(name = "dvr-feeder", version, about = "DVR H.264 stream feeder")]
struct Args {
    /// Camera channel (0-based; 0-3 on a 4-channel DVR)
    #[arg(short, long, default_value_t = 0)]
    channel: u32,

    /// Stream type (1=main, 2=sub)
    #[arg(short = 's', long, default_value_t = 1)]
    stream_type: u32,

    /// DVR address (or set DVR_HOST)
    #[arg(long)]
    host: Option<String>,

    /// Command port (or DVR_CMD_PORT; default 5050)
    #[arg(long)]
    cmd_port: Option<u16>,

    /// Media port (or DVR_MEDIA_PORT; default 6050)
    #[arg(long)]
    media_port: Option<u16>,

    /// Username (or DVR_USERNAME; default admin)
    #[arg(long)]
    username: Option<String>,

    /// Password (or DVR_PASSWORD; default 123456)
    #[arg(long)]
    password: Option<String>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Reconnect delay for attempt `n` (1-based): `min(3 * 2^(n-1), 30)`.
fn backoff_delay(attempt: u32) -> Duration {
    let shift = attempt.saturating_sub(1).min(16);
    let secs = RETRY_BASE_SECS.saturating_mul(1u64 << shift);
    Duration::from_secs(secs.min(RETRY_CAP_SECS))
}

fn session_config(args: &Args) -> Option<SessionConfig> {
    let host = args.host.clone().or_else(|| std::env::var("DVR_HOST").ok())?;
    let mut config = SessionConfig::new(host);
    config.cmd_port = args.cmd_port.unwrap_or_else(|| env_or("DVR_CMD_PORT", 5050));
    config.media_port = args.media_port.unwrap_or_else(|| env_or("DVR_MEDIA_PORT", 6050));
    config.username = args
        .username
        .clone()
        .or_else(|| std::env::var("DVR_USERNAME").ok())
        .unwrap_or_else(|| "admin".into());
    config.password = args
        .password
        .clone()
        .or_else(|| std::env::var("DVR_PASSWORD").ok())
        .unwrap_or_else(|| "123456".into());
    Some(config)
}

/// Why the frame pump stopped.
enum Pump {
    /// Stdout reader went away (or a signal landed); exit cleanly.
    Done,
    /// The device stopped sending; reconnect.
    StreamEnded,
}

fn pump(session: &mut DvrSession, channel: u32) -> Pump {
    let frames = match session.stream() {
        Ok(frames) => frames,
        Err(e) => {
            log::error!("stream unavailable: {e}");
            return Pump::StreamEnded;
        }
    };

    let stdout = io::stdout();
    let mut out = stdout.lock();
    for (_codec, h264) in frames {
        if SHUTDOWN.load(Ordering::SeqCst) {
            return Pump::Done;
        }
        if let Err(e) = out.write_all(&h264).and_then(|()| out.flush()) {
            if e.kind() == io::ErrorKind::BrokenPipe {
                log::info!("stdout pipe broken; reader disconnected");
            } else {
                log::error!("stdout write failed: {e}");
            }
            return Pump::Done;
        }
    }
    log::warn!("stream ended for channel {channel}");
    Pump::StreamEnded
}

fn run(config: SessionConfig, channel: u32, stream_type: u32) -> i32 {
    let oracle: Arc<dyn HashOracle> = match HelperHashOracle::from_env() {
        Ok(oracle) => Arc::new(oracle),
        Err(e) => {
            log::error!("{e}");
            return 1;
        }
    };

    let mut retry_count: u32 = 0;
    loop {
        if SHUTDOWN.load(Ordering::SeqCst) {
            return 0;
        }

        let mut session = DvrSession::new(config.clone(), Arc::clone(&oracle));
        match session.connect(channel, stream_type) {
            Ok(()) => {
                log::info!("streaming channel {channel} to stdout...");
                retry_count = 0;
                let outcome = pump(&mut session, channel);
                session.disconnect();
                if matches!(outcome, Pump::Done) {
                    return 0;
                }
                // StreamEnded: reconnect immediately.
            }
            Err(e) => {
                session.disconnect();
                retry_count += 1;
                if retry_count > MAX_RETRIES {
                    log::error!("giving up after {MAX_RETRIES} retries: {e}");
                    return 1;
                }
                let delay = backoff_delay(retry_count);
                log::warn!(
                    "connection error (attempt {retry_count}/{MAX_RETRIES}): {e}; retrying in {}s",
                    delay.as_secs()
                );
                thread::sleep(delay);
            }
        }
    }
}

fn main() {
    let args = Args::parse();

    // Stdout is the H.264 payload, so the log writer must stay on stderr
    // (env_logger's default).
    env_logger::Builder::from_env(
        env_logger::Env::default()
            .default_filter_or(if args.verbose { "debug" } else { "info" }),
    )
    .init();

    let Some(config) = session_config(&args) else {
        eprintln!("error: DVR host is required: use --host or set DVR_HOST");
        std::process::exit(2);
    };

    let shutdown = Arc::clone(&SHUTDOWN);
    if let Err(e) = ctrlc::set_handler(move || {
        log::info!("signal received, disconnecting...");
        shutdown.store(true, Ordering::SeqCst);
    }) {
        log::warn!("could not install signal handler: {e}");
    }

    std::process::exit(run(config, args.channel, args.stream_type));
}
