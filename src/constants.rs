//! Timing and size constants for the DVR session runtime and recorder.
//!
//! Grouped by domain. Protocol-level reply deadlines come from observed
//! firmware behavior; everything else balances responsiveness against the
//! device's tolerance for chatty clients.

use std::time::Duration;

// ============================================================================
// Connections
// ============================================================================

/// TCP connect timeout for both the command and media sockets.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Read timeout for inline command reads (login, media handshake reply).
pub const COMMAND_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Read timeout on the short-lived config session. The firmware is slow to
/// assemble large config replies, so this is longer than the command path.
pub const CONFIG_READ_TIMEOUT: Duration = Duration::from_secs(15);

/// Keepalive: idle time before the first probe.
pub const KEEPALIVE_IDLE: Duration = Duration::from_secs(15);

/// Keepalive: interval between probes.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);

/// Keepalive: probes before the peer is declared dead (~30 s worst case
/// together with the idle/interval settings).
pub const KEEPALIVE_RETRIES: u32 = 3;

// ============================================================================
// Command channel
// ============================================================================

/// Per-iteration read timeout of the background reader. Timeouts are not
/// errors; they just let the reader observe the shutdown flag.
pub const READER_POLL_TIMEOUT: Duration = Duration::from_secs(2);

/// Polling interval while waiting for a tagged reply.
pub const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Upper bound on queued command messages. When exceeded the oldest half
/// is discarded.
pub const QUEUE_CAP: usize = 200;

/// Queued messages older than this are dropped during pruning.
pub const QUEUE_ENTRY_TTL: Duration = Duration::from_secs(60);

/// Largest body length the codec will accept from a header.
pub const MAX_BODY_LEN: u32 = 16 * 1024 * 1024;

// ============================================================================
// Session state machine
// ============================================================================

/// Deadline for the `RealStreamCreateReply`.
pub const CREATE_REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// Deadline for the `RealStreamStartReply`.
pub const START_REPLY_TIMEOUT: Duration = Duration::from_secs(3);

/// Gap between the graceful teardown commands (stop, destroy, logout).
pub const TEARDOWN_GAP: Duration = Duration::from_millis(200);

// ============================================================================
// Heartbeat / liveness
// ============================================================================

/// Heartbeat servicing tick.
pub const HEARTBEAT_TICK: Duration = Duration::from_secs(1);

/// Maximum silence after the first heartbeat before the session is
/// declared dead. The device emits heartbeats every 5-15 s and drops
/// clients that stop acknowledging, so the budget leaves jitter margin.
pub const HEARTBEAT_MISS_BUDGET: Duration = Duration::from_secs(45);

// ============================================================================
// Media channel
// ============================================================================

/// Read timeout on the media socket.
pub const MEDIA_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Consecutive media read timeouts before the stream is declared over.
pub const MEDIA_MAX_TIMEOUTS: u32 = 3;

/// Media socket read chunk size.
pub const MEDIA_READ_CHUNK: usize = 64 * 1024;

// ============================================================================
// Recording supervisor
// ============================================================================

/// Recorder monitor tick while a pipeline is running.
pub const MONITOR_INTERVAL: Duration = Duration::from_secs(10);

/// Sleep while a channel is outside its schedule window.
pub const SCHEDULE_WAIT: Duration = Duration::from_secs(30);

/// Sleep after a failed disk-space recheck.
pub const DISK_LOW_WAIT: Duration = Duration::from_secs(60);

/// Pause between recording pipeline restarts.
pub const RESTART_PAUSE: Duration = Duration::from_secs(2);

/// Pause after a per-channel error before retrying.
pub const ERROR_RETRY_WAIT: Duration = Duration::from_secs(10);

/// Grace given to the feeder after SIGTERM before SIGKILL.
pub const FEEDER_GRACE: Duration = Duration::from_secs(5);

/// Grace given to the muxer to finalize the open segment.
pub const MUXER_GRACE: Duration = Duration::from_secs(15);

// ============================================================================
// Upload queue / cleanup
// ============================================================================

/// Interval between upload discovery passes.
pub const UPLOAD_INTERVAL: Duration = Duration::from_secs(15);

/// A segment is considered closed once its mtime is at least this old.
pub const SEGMENT_SETTLE: Duration = Duration::from_secs(60);

/// Upload attempts per file before it is skipped until restart.
pub const MAX_UPLOAD_RETRIES: u32 = 3;

/// Interval between retention/cleanup passes.
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(300);

/// HTTP timeout for Drive metadata calls.
pub const HTTP_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP timeout for segment content uploads and shell upload commands.
pub const UPLOAD_TIMEOUT: Duration = Duration::from_secs(300);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heartbeat_budget_exceeds_device_interval() {
        // The device emits heartbeats at most every 15 s; three missed
        // beats must still fit inside the budget.
        assert!(HEARTBEAT_MISS_BUDGET >= Duration::from_secs(45));
    }

    #[test]
    fn test_keepalive_detection_window() {
        let worst = KEEPALIVE_IDLE + KEEPALIVE_INTERVAL * KEEPALIVE_RETRIES;
        assert!(worst <= Duration::from_secs(30));
    }
}
