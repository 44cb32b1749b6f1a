//! DVR session runtime: command channel, connect state machine, heartbeat.
//!
//! A [`DvrSession`] owns both device connections. `connect()` runs the
//! login/create/handshake/start sequence inline, then two background
//! threads service the command socket for the life of the session:
//!
//! - **reader**: loops on `read_message` with a short timeout and feeds a
//!   bounded message queue; clean EOF or an I/O error marks the session
//!   dead and ends the thread.
//! - **heartbeat**: once a second answers any queued `HeartBeatNotice`
//!   (echoing its transaction id) and declares the session dead after 45 s
//!   of silence following the first notice.
//!
//! All command-socket writes funnel through one mutex so each header+body
//! pair reaches the wire atomically. The queue mutex is never held across
//! a send.
//!
//! A session is single-use: once dead or disconnected it cannot be
//! revived; callers reconnect with a fresh session object.

use std::collections::VecDeque;
use std::io::{self, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use socket2::{SockRef, TcpKeepalive};

use crate::auth::{self, HashOracle};
use crate::constants::{
    COMMAND_READ_TIMEOUT, CONNECT_TIMEOUT, CREATE_REPLY_TIMEOUT, HEARTBEAT_MISS_BUDGET,
    HEARTBEAT_TICK, KEEPALIVE_IDLE, KEEPALIVE_INTERVAL, KEEPALIVE_RETRIES, QUEUE_CAP,
    QUEUE_ENTRY_TTL, READER_POLL_TIMEOUT, START_REPLY_TIMEOUT, TEARDOWN_GAP, WAIT_POLL_INTERVAL,
};
use crate::error::{SessionError, SessionResult};
use crate::media::MediaStream;
use crate::protocol::{
    frame_command, is_timeout, make_command_body, parse_body, read_message, xml_attr,
    FrameHeader, ID_HEARTBEAT_REPLY, ID_LOGOUT, ID_STREAM_CREATE, ID_STREAM_DESTROY,
    ID_STREAM_START, ID_STREAM_STOP,
};

/// Connection parameters for a DVR session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Device address.
    pub host: String,
    /// Command (XML control) port.
    pub cmd_port: u16,
    /// Media (framed H.264) port.
    pub media_port: u16,
    /// Login user.
    pub username: String,
    /// Login password, fed to the hash oracle.
    pub password: String,
}

impl SessionConfig {
    /// Config for `host` with the factory-default ports and credentials.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            cmd_port: 5050,
            media_port: 6050,
            username: "admin".into(),
            password: "123456".into(),
        }
    }
}

/// Where the session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Nothing connected yet (also the post-disconnect resting state).
    Idle,
    /// Command socket opening / logging in.
    Connecting,
    /// Login accepted; background threads running.
    Authenticated,
    /// `RealStreamCreate` sent, reply pending.
    AwaitingCreateReply,
    /// Media session id extracted.
    StreamCreated,
    /// Media socket handshaken.
    MediaOpen,
    /// Frames may be pulled.
    Streaming,
    /// `disconnect()` in progress.
    TearingDown,
    /// Fatal loss; the session object is spent.
    Dead,
}

/// One message received on the command channel.
#[derive(Debug, Clone)]
struct QueuedMessage {
    received_at: Instant,
    header: FrameHeader,
    body: String,
}

/// State shared with the background threads.
#[derive(Debug)]
struct Shared {
    alive: AtomicBool,
    dead: AtomicBool,
    disconnecting: AtomicBool,
    queue: Mutex<VecDeque<QueuedMessage>>,
    writer: Mutex<Option<TcpStream>>,
    last_heartbeat: Mutex<Option<Instant>>,
}

/// Lock a mutex, riding through poisoning (a panicked peer thread must
/// not take the session down with it).
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl Shared {
    fn new() -> Self {
        Self {
            alive: AtomicBool::new(false),
            dead: AtomicBool::new(false),
            disconnecting: AtomicBool::new(false),
            queue: Mutex::new(VecDeque::new()),
            writer: Mutex::new(None),
            last_heartbeat: Mutex::new(None),
        }
    }

    /// Write one frame to the command socket. The mutex guarantees a
    /// single writer at any instant.
    fn send(&self, frame: &[u8]) -> io::Result<()> {
        let mut guard = lock(&self.writer);
        match guard.as_mut() {
            Some(sock) => sock.write_all(frame),
            None => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "command socket closed",
            )),
        }
    }

    /// Enqueue a received message, enforcing the queue bounds: above the
    /// cap the oldest half goes, and stale entries are pruned with it.
    fn push_message(&self, msg: QueuedMessage) {
        let mut queue = lock(&self.queue);
        queue.push_back(msg);
        if queue.len() > QUEUE_CAP {
            let drop_count = queue.len() / 2;
            queue.drain(..drop_count);
            queue.retain(|m| m.received_at.elapsed() <= QUEUE_ENTRY_TTL);
        }
    }

    /// Remove and return the first queued message matching `pred`.
    fn take_matching<F>(&self, pred: F) -> Option<QueuedMessage>
    where
        F: Fn(&QueuedMessage) -> bool,
    {
        let mut queue = lock(&self.queue);
        let idx = queue.iter().position(|m| pred(m))?;
        queue.remove(idx)
    }

    /// Wait until a message whose body contains `tag` arrives, scanning in
    /// arrival order. Returns immediately with `None` once the session is
    /// dead.
    fn wait_for(&self, tag: &str, timeout: Duration) -> Option<QueuedMessage> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.dead.load(Ordering::SeqCst) {
                return None;
            }
            if let Some(msg) = self.take_matching(|m| m.body.contains(tag)) {
                return Some(msg);
            }
            if Instant::now() >= deadline {
                return None;
            }
            thread::sleep(WAIT_POLL_INTERVAL);
        }
    }
}

/// Client session against one HiEasy DVR.
pub struct DvrSession {
    config: SessionConfig,
    oracle: Arc<dyn HashOracle>,
    shared: Arc<Shared>,
    cmd_sock: Option<TcpStream>,
    media: Option<MediaStream>,
    media_shutdown: Option<TcpStream>,
    media_session: Option<u32>,
    reader: Option<JoinHandle<()>>,
    heartbeat: Option<JoinHandle<()>>,
    state: SessionState,
}

impl std::fmt::Debug for DvrSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DvrSession")
            .field("host", &self.config.host)
            .field("state", &self.state())
            .field("media_session", &self.media_session)
            .finish_non_exhaustive()
    }
}

impl DvrSession {
    /// New, unconnected session.
    pub fn new(config: SessionConfig, oracle: Arc<dyn HashOracle>) -> Self {
        Self {
            config,
            oracle,
            shared: Arc::new(Shared::new()),
            cmd_sock: None,
            media: None,
            media_shutdown: None,
            media_session: None,
            reader: None,
            heartbeat: None,
            state: SessionState::Idle,
        }
    }

    /// Current lifecycle state; a dead flag from any background path wins.
    pub fn state(&self) -> SessionState {
        if self.shared.dead.load(Ordering::SeqCst) {
            SessionState::Dead
        } else {
            self.state
        }
    }

    /// True once any failure path has declared the session lost.
    pub fn is_dead(&self) -> bool {
        self.shared.dead.load(Ordering::SeqCst)
    }

    /// Device-issued media session id, once the stream is created.
    pub fn media_session(&self) -> Option<u32> {
        self.media_session
    }

    /// Full connection sequence: login, stream create, media handshake,
    /// stream start.
    ///
    /// `channel` selects the camera input (0-based); `stream_type` is
    /// 1 = main, 2 = sub. There is no retry here -- the outer supervisor
    /// owns backoff policy.
    pub fn connect(&mut self, channel: u32, stream_type: u32) -> SessionResult<()> {
        if self.shared.disconnecting.load(Ordering::SeqCst) || self.is_dead() {
            return Err(SessionError::Protocol(
                "session is spent; create a new one to reconnect".into(),
            ));
        }
        if self.state != SessionState::Idle {
            return Err(SessionError::Protocol(format!(
                "connect() called in state {:?}",
                self.state
            )));
        }

        log::info!(
            "connecting to {}:{} ...",
            self.config.host,
            self.config.cmd_port
        );
        self.state = SessionState::Connecting;

        let mut cmd_sock = match connect_stream(&self.config.host, self.config.cmd_port) {
            Ok(sock) => sock,
            Err(e) => {
                self.state = SessionState::Idle;
                return Err(e);
            }
        };

        // Login runs inline; the reader must not race the handshake.
        if let Err(e) = auth::login(
            &mut cmd_sock,
            &self.config.username,
            &self.config.password,
            self.oracle.as_ref(),
        ) {
            self.state = SessionState::Idle;
            return Err(e);
        }

        let writer = cmd_sock.try_clone().map_err(SessionError::Transport)?;
        let reader_sock = cmd_sock.try_clone().map_err(SessionError::Transport)?;
        *lock(&self.shared.writer) = Some(writer);
        self.cmd_sock = Some(cmd_sock);
        self.shared.alive.store(true, Ordering::SeqCst);

        let shared = Arc::clone(&self.shared);
        self.reader = Some(
            thread::Builder::new()
                .name("dvr-reader".into())
                .spawn(move || reader_loop(reader_sock, shared))
                .map_err(SessionError::Transport)?,
        );
        let shared = Arc::clone(&self.shared);
        self.heartbeat = Some(
            thread::Builder::new()
                .name("dvr-heartbeat".into())
                .spawn(move || heartbeat_loop(shared))
                .map_err(SessionError::Transport)?,
        );
        self.state = SessionState::Authenticated;

        // Stream create.
        let body = make_command_body(
            ID_STREAM_CREATE,
            &format!(
                r#"<RealStreamCreateRequest Channel="{channel}" Mode="{stream_type}" Type="1" />"#
            ),
        );
        self.shared.send(&frame_command(&body, None))?;
        self.state = SessionState::AwaitingCreateReply;

        let reply = self
            .shared
            .wait_for("RealStreamCreateReply", CREATE_REPLY_TIMEOUT)
            .ok_or_else(|| {
                SessionError::Protocol("no RealStreamCreateReply from device".into())
            })?;
        let session_id: u32 = xml_attr(&reply.body, "MediaSession")
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| {
                SessionError::Protocol(format!(
                    "no MediaSession in reply: {}",
                    &reply.body[..reply.body.len().min(200)]
                ))
            })?;
        self.media_session = Some(session_id);
        self.state = SessionState::StreamCreated;
        log::info!("media session: {session_id}");

        // Media connect + handshake.
        let media_sock = connect_stream(&self.config.host, self.config.media_port)?;
        let media = MediaStream::handshake(media_sock, session_id)?;
        self.media_shutdown = media.try_clone_socket().ok();
        self.media = Some(media);
        self.state = SessionState::MediaOpen;

        // Stream start. The firmware occasionally swallows the reply while
        // still starting the stream, so a missing reply is not fatal.
        let body = make_command_body(
            ID_STREAM_START,
            &format!(r#"<RealStreamStartRequest MediaSession="{session_id}" />"#),
        );
        self.shared.send(&frame_command(&body, None))?;
        if self
            .shared
            .wait_for("RealStreamStartReply", START_REPLY_TIMEOUT)
            .is_none()
        {
            log::warn!("no RealStreamStartReply within {START_REPLY_TIMEOUT:?}; proceeding");
        }

        self.state = SessionState::Streaming;
        log::info!("stream started on channel {channel}");
        Ok(())
    }

    /// The demuxed media frames, as a finite iterator that ends when the
    /// device stops sending, the session dies, or `disconnect()` runs.
    ///
    /// May be called once per session.
    pub fn stream(&mut self) -> SessionResult<Frames> {
        if self.state != SessionState::Streaming {
            return Err(SessionError::Protocol(
                "not streaming -- call connect() first".into(),
            ));
        }
        let media = self.media.take().ok_or_else(|| {
            SessionError::Protocol("stream() may only be called once per session".into())
        })?;
        Ok(Frames {
            media,
            shared: Arc::clone(&self.shared),
        })
    }

    /// Gracefully disconnect. Idempotent and safe to call while the
    /// background threads or a frame iterator are still running.
    pub fn disconnect(&mut self) {
        if self.shared.disconnecting.swap(true, Ordering::SeqCst) {
            return;
        }
        self.state = SessionState::TearingDown;
        self.shared.alive.store(false, Ordering::SeqCst);

        // Graceful teardown only makes sense while the peer is believed
        // reachable; each step is best-effort.
        if !self.shared.dead.load(Ordering::SeqCst) {
            if let Some(session_id) = self.media_session {
                let stop = make_command_body(
                    ID_STREAM_STOP,
                    &format!(r#"<RealStreamStopRequest MediaSession="{session_id}" />"#),
                );
                let _ = self.shared.send(&frame_command(&stop, None));
                thread::sleep(TEARDOWN_GAP);

                let destroy = make_command_body(
                    ID_STREAM_DESTROY,
                    &format!(r#"<RealStreamDestroyRequest MediaSession="{session_id}" />"#),
                );
                let _ = self.shared.send(&frame_command(&destroy, None));
                thread::sleep(TEARDOWN_GAP);

                let logout = make_command_body(
                    ID_LOGOUT,
                    &format!(r#"<Logout UserName="{}" />"#, self.config.username),
                );
                let _ = self.shared.send(&frame_command(&logout, None));
            }
        }

        // Close both sockets; this unblocks any in-flight reads.
        *lock(&self.shared.writer) = None;
        if let Some(sock) = self.cmd_sock.take() {
            let _ = sock.shutdown(Shutdown::Both);
        }
        if let Some(sock) = self.media_shutdown.take() {
            let _ = sock.shutdown(Shutdown::Both);
        }
        self.media = None;
        self.media_session = None;

        if let Some(handle) = self.reader.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.heartbeat.take() {
            let _ = handle.join();
        }

        self.state = SessionState::Idle;
        log::info!("disconnected from {}", self.config.host);
    }
}

impl Drop for DvrSession {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Finite iterator over `(codec, h264)` frames from the media channel.
pub struct Frames {
    media: MediaStream,
    shared: Arc<Shared>,
}

impl Iterator for Frames {
    type Item = (u32, Vec<u8>);

    fn next(&mut self) -> Option<Self::Item> {
        if !self.shared.alive.load(Ordering::SeqCst) || self.shared.dead.load(Ordering::SeqCst) {
            return None;
        }
        self.media.next_frame()
    }
}

impl std::fmt::Debug for Frames {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frames").finish_non_exhaustive()
    }
}

/// Open a TCP connection with the session's keepalive policy applied.
pub(crate) fn connect_stream(host: &str, port: u16) -> SessionResult<TcpStream> {
    let addr = (host, port)
        .to_socket_addrs()
        .map_err(SessionError::Transport)?
        .next()
        .ok_or_else(|| SessionError::Protocol(format!("no address for {host}:{port}")))?;
    let stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)?;
    stream.set_read_timeout(Some(COMMAND_READ_TIMEOUT))?;
    set_keepalive(&stream)?;
    Ok(stream)
}

fn set_keepalive(stream: &TcpStream) -> io::Result<()> {
    let keepalive = TcpKeepalive::new().with_time(KEEPALIVE_IDLE);
    #[cfg(not(windows))]
    let keepalive = keepalive
        .with_interval(KEEPALIVE_INTERVAL)
        .with_retries(KEEPALIVE_RETRIES);
    SockRef::from(stream).set_tcp_keepalive(&keepalive)
}

fn reader_loop(mut sock: TcpStream, shared: Arc<Shared>) {
    loop {
        if !shared.alive.load(Ordering::SeqCst) {
            break;
        }
        match read_message(&mut sock, READER_POLL_TIMEOUT) {
            Ok(Some((header, body))) => {
                shared.push_message(QueuedMessage {
                    received_at: Instant::now(),
                    header,
                    body: parse_body(&body),
                });
            }
            Ok(None) => {
                if shared.alive.load(Ordering::SeqCst) {
                    log::warn!("command socket closed by device");
                    shared.dead.store(true, Ordering::SeqCst);
                }
                break;
            }
            Err(e) if is_timeout(&e) => continue,
            Err(e) => {
                if shared.alive.load(Ordering::SeqCst) {
                    log::error!("command socket error: {e}");
                    shared.dead.store(true, Ordering::SeqCst);
                }
                break;
            }
        }
    }
}

/// True when the silence since the last heartbeat exceeds the budget.
/// The timer only arms once the first heartbeat has been seen.
fn heartbeat_expired(last: Option<Instant>, budget: Duration) -> bool {
    last.is_some_and(|t| t.elapsed() > budget)
}

fn heartbeat_loop(shared: Arc<Shared>) {
    loop {
        if !shared.alive.load(Ordering::SeqCst) || shared.dead.load(Ordering::SeqCst) {
            break;
        }

        let notice = shared
            .take_matching(|m| m.body.contains("HeartBeatNotice") && !m.body.contains("Reply"));
        if let Some(notice) = notice {
            *lock(&shared.last_heartbeat) = Some(Instant::now());
            let body = make_command_body(
                ID_HEARTBEAT_REPLY,
                r#"<HeartBeatNoticeReply CmdReply="0" NetDataFlow="0" NetHistoryDataFlow="0" />"#,
            );
            // The reply carries the notice's transaction id, not a fresh one.
            let frame = frame_command(&body, Some(notice.header.txn()));
            if let Err(e) = shared.send(&frame) {
                if shared.alive.load(Ordering::SeqCst) {
                    log::error!("heartbeat reply failed: {e}");
                    shared.dead.store(true, Ordering::SeqCst);
                }
                break;
            }
            log::debug!("heartbeat acknowledged (txn {})", notice.header.txn());
        }

        let last = *lock(&shared.last_heartbeat);
        if heartbeat_expired(last, HEARTBEAT_MISS_BUDGET) {
            log::error!("device heartbeat silent past budget; declaring session dead");
            shared.dead.store(true, Ordering::SeqCst);
            break;
        }

        thread::sleep(HEARTBEAT_TICK);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::testing::{FakeOracle, UnavailableOracle};
    use crate::protocol::{
        ID_LOGIN_GET_FLAG_REPLY, ID_STREAM_CREATE_REPLY, ID_STREAM_START_REPLY,
        ID_USER_LOGIN_REPLY, HEADER_SIZE,
    };
    use std::io::Read;
    use std::net::TcpListener;

    fn msg(header_txn: u32, body: &str) -> QueuedMessage {
        QueuedMessage {
            received_at: Instant::now(),
            header: FrameHeader::parse(&crate::protocol::pack_command_header(0, Some(header_txn))),
            body: body.to_string(),
        }
    }

    #[test]
    fn test_wait_for_returns_matches_in_arrival_order() {
        let shared = Shared::new();
        shared.push_message(msg(1, r#"<ReplyA Seq="first" />"#));
        shared.push_message(msg(2, r#"<ReplyB />"#));
        shared.push_message(msg(3, r#"<ReplyA Seq="second" />"#));

        let first = shared.wait_for("ReplyA", Duration::from_millis(200)).unwrap();
        assert!(first.body.contains("first"));
        let second = shared.wait_for("ReplyA", Duration::from_millis(200)).unwrap();
        assert!(second.body.contains("second"));

        // The non-matching message stays behind.
        let rest = shared.wait_for("ReplyB", Duration::from_millis(200)).unwrap();
        assert!(rest.body.contains("ReplyB"));
    }

    #[test]
    fn test_wait_for_times_out_and_returns_on_dead() {
        let shared = Shared::new();
        let start = Instant::now();
        assert!(shared.wait_for("Nothing", Duration::from_millis(150)).is_none());
        assert!(start.elapsed() >= Duration::from_millis(150));

        shared.dead.store(true, Ordering::SeqCst);
        let start = Instant::now();
        assert!(shared.wait_for("Nothing", Duration::from_secs(5)).is_none());
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_queue_drops_oldest_half_over_cap() {
        let shared = Shared::new();
        for i in 0..(QUEUE_CAP + 1) {
            shared.push_message(msg(i as u32, &format!("<M N=\"{i}\" />")));
        }
        let queue = lock(&shared.queue);
        assert!(queue.len() <= QUEUE_CAP / 2 + 1);
        // Newest entry survived.
        assert!(queue.iter().any(|m| m.body.contains(&format!("N=\"{QUEUE_CAP}\""))));
        // Oldest entry did not.
        assert!(!queue.iter().any(|m| m.body.contains("N=\"0\"")));
    }

    #[test]
    fn test_heartbeat_expiry_arms_after_first_beat() {
        assert!(!heartbeat_expired(None, Duration::from_millis(1)));
        let past = Instant::now() - Duration::from_secs(2);
        assert!(heartbeat_expired(Some(past), Duration::from_secs(1)));
        assert!(!heartbeat_expired(Some(Instant::now()), Duration::from_secs(1)));
    }

    // ------------------------------------------------------------------
    // Loopback fake-device tests
    // ------------------------------------------------------------------

    struct FakeDevice {
        cmd: TcpListener,
        media: TcpListener,
    }

    impl FakeDevice {
        fn bind() -> Self {
            Self {
                cmd: TcpListener::bind("127.0.0.1:0").unwrap(),
                media: TcpListener::bind("127.0.0.1:0").unwrap(),
            }
        }

        fn session_config(&self) -> SessionConfig {
            let mut config = SessionConfig::new("127.0.0.1");
            config.cmd_port = self.cmd.local_addr().unwrap().port();
            config.media_port = self.media.local_addr().unwrap().port();
            config
        }
    }

    fn reply(conn: &mut TcpStream, cmd_id: u32, inner: &str) {
        let body = make_command_body(cmd_id, inner);
        conn.write_all(&frame_command(&body, Some(1))).unwrap();
    }

    fn read_cmd(conn: &mut TcpStream) -> Option<(FrameHeader, String)> {
        let (header, body) = read_message(conn, Duration::from_secs(5)).unwrap()?;
        Some((header, parse_body(&body)))
    }

    /// Device half of the happy-path handshake, up through stream start.
    /// Returns the accepted command and media connections.
    fn run_handshake(device: &FakeDevice) -> (TcpStream, TcpStream) {
        let (mut cmd, _) = device.cmd.accept().unwrap();

        let (_, body) = read_cmd(&mut cmd).unwrap();
        assert!(body.contains("LoginGetFlag"));
        reply(&mut cmd, ID_LOGIN_GET_FLAG_REPLY, r#"<LoginGetFlagReply LoginFlag="ABC123" />"#);

        let (_, body) = read_cmd(&mut cmd).unwrap();
        assert!(body.contains("UserLogin"));
        // FakeOracle hash is "{nonce}:{username}".
        assert!(body.contains(r#"LoginFlag="ABC123:admin""#));
        reply(&mut cmd, ID_USER_LOGIN_REPLY, r#"<UserLoginReply CmdReply="0" />"#);

        let (_, body) = read_cmd(&mut cmd).unwrap();
        assert!(body.contains(r#"<RealStreamCreateRequest Channel="0" Mode="1" Type="1" />"#));
        reply(
            &mut cmd,
            ID_STREAM_CREATE_REPLY,
            r#"<RealStreamCreateReply CmdReply="0" MediaSession="42" />"#,
        );

        let (mut media, _) = device.media.accept().unwrap();
        let mut handshake = [0u8; HEADER_SIZE];
        media.read_exact(&mut handshake).unwrap();
        let header = FrameHeader::parse(&handshake);
        assert_eq!(header.magic(), crate::protocol::MEDIA_MAGIC);
        assert_eq!(header.media_session(), 42);
        media.write_all(&[0u8; HEADER_SIZE]).unwrap();

        let (_, body) = read_cmd(&mut cmd).unwrap();
        assert!(body.contains(r#"<RealStreamStartRequest MediaSession="42" />"#));
        reply(&mut cmd, ID_STREAM_START_REPLY, r#"<RealStreamStartReply CmdReply="0" />"#);

        (cmd, media)
    }

    #[test]
    fn test_connect_happy_path_and_graceful_disconnect() {
        let device = FakeDevice::bind();
        let config = device.session_config();

        let device_side = thread::spawn(move || {
            let (mut cmd, media) = run_handshake(&device);

            // Teardown: stop, destroy, logout, in order, then EOF.
            let mut seen = Vec::new();
            while let Some((_, body)) = read_cmd(&mut cmd) {
                if let Some(id) = xml_attr(&body, "ID").and_then(|v| v.parse::<u32>().ok()) {
                    seen.push(id);
                }
            }
            drop(media);
            seen
        });

        let mut session = DvrSession::new(config, Arc::new(FakeOracle));
        session.connect(0, 1).unwrap();
        assert_eq!(session.state(), SessionState::Streaming);
        assert_eq!(session.media_session(), Some(42));

        session.disconnect();
        assert_eq!(session.state(), SessionState::Idle);
        // Second disconnect is a no-op.
        session.disconnect();

        let seen = device_side.join().unwrap();
        assert_eq!(seen, vec![ID_STREAM_STOP, ID_STREAM_DESTROY, ID_LOGOUT]);
    }

    #[test]
    fn test_heartbeat_auto_reply_echoes_txn() {
        let device = FakeDevice::bind();
        let config = device.session_config();

        let device_side = thread::spawn(move || {
            let (mut cmd, _media) = run_handshake(&device);

            // Unsolicited heartbeat with a distinctive transaction id.
            let body = make_command_body(
                crate::protocol::ID_HEARTBEAT,
                r#"<HeartBeatNotice NetDataFlow="0" />"#,
            );
            cmd.write_all(&frame_command(&body, Some(999))).unwrap();

            // The auto-reply must arrive within ~1.1 s carrying txn 999.
            let started = Instant::now();
            let (header, body) = read_cmd(&mut cmd).unwrap();
            assert!(started.elapsed() < Duration::from_millis(1500));
            assert_eq!(header.txn(), 999);
            assert!(body.contains(
                r#"<HeartBeatNoticeReply CmdReply="0" NetDataFlow="0" NetHistoryDataFlow="0" />"#
            ));
        });

        let mut session = DvrSession::new(config, Arc::new(FakeOracle));
        session.connect(0, 1).unwrap();
        device_side.join().unwrap();
        session.disconnect();
    }

    #[test]
    fn test_login_rejection_is_auth_error() {
        let device = FakeDevice::bind();
        let config = device.session_config();

        let device_side = thread::spawn(move || {
            let (mut cmd, _) = device.cmd.accept().unwrap();
            let _ = read_cmd(&mut cmd);
            reply(&mut cmd, ID_LOGIN_GET_FLAG_REPLY, r#"<LoginGetFlagReply LoginFlag="N" />"#);
            let _ = read_cmd(&mut cmd);
            reply(&mut cmd, ID_USER_LOGIN_REPLY, r#"<UserLoginReply CmdReply="7" />"#);
        });

        let mut session = DvrSession::new(config, Arc::new(FakeOracle));
        let err = session.connect(0, 1).unwrap_err();
        assert!(matches!(err, SessionError::Auth(_)));
        device_side.join().unwrap();
    }

    #[test]
    fn test_unavailable_oracle_fails_before_user_login() {
        let device = FakeDevice::bind();
        let config = device.session_config();

        let device_side = thread::spawn(move || {
            let (mut cmd, _) = device.cmd.accept().unwrap();
            let _ = read_cmd(&mut cmd);
            reply(&mut cmd, ID_LOGIN_GET_FLAG_REPLY, r#"<LoginGetFlagReply LoginFlag="N" />"#);
            // No UserLogin should follow; the socket just drains to EOF.
            read_cmd(&mut cmd)
        });

        let mut session = DvrSession::new(config, Arc::new(UnavailableOracle));
        let err = session.connect(0, 1).unwrap_err();
        assert!(matches!(err, SessionError::Auth(_)));
        drop(session); // closes the socket so the device side sees EOF
        assert!(device_side.join().unwrap().is_none());
    }

    #[test]
    fn test_stream_may_only_be_taken_once() {
        let device = FakeDevice::bind();
        let config = device.session_config();

        let device_side = thread::spawn(move || {
            let handles = run_handshake(&device);
            thread::sleep(Duration::from_millis(300));
            drop(handles);
        });

        let mut session = DvrSession::new(config, Arc::new(FakeOracle));
        session.connect(0, 1).unwrap();
        let _frames = session.stream().unwrap();
        assert!(session.stream().is_err());
        session.disconnect();
        device_side.join().unwrap();
    }
}
