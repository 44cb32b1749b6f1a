//! Wire codec for the HiEasy DVR framed TCP protocol.
//!
//! Both device channels frame every message with a 36-byte header of nine
//! big-endian `u32` fields:
//!
//! ```text
//! [magic][version][txn][rsvd][body_len][class][0][0][0]        command
//! [magic][version][4  ][0   ][3       ][0    ][0][0][session]  media handshake
//! ```
//!
//! Command bodies are null-terminated XML documents; the trailing NUL is
//! part of the payload and counted in `body_len`. On the media channel the
//! header's fourth field is the payload length of a data frame instead.

use std::io::{self, Read};
use std::net::TcpStream;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use regex::Regex;

use crate::constants::MAX_BODY_LEN;

/// Header size shared by both channels.
pub const HEADER_SIZE: usize = 36;

/// Magic for the command channel.
pub const CMD_MAGIC: u32 = 0x0501_1154;

/// Magic for the media channel.
pub const MEDIA_MAGIC: u32 = 0x0501_1150;

/// Protocol version carried in every header.
pub const VERSION: u32 = 0x0000_1001;

/// Command-channel class field (header field 5).
const CMD_CLASS: u32 = 3;

/// `GetCfg` configuration read.
pub const ID_GET_CFG: u32 = 14;
/// `UserLogin` request.
pub const ID_USER_LOGIN: u32 = 24;
/// `UserLogin` reply.
pub const ID_USER_LOGIN_REPLY: u32 = 25;
/// `LoginGetFlag` nonce request.
pub const ID_LOGIN_GET_FLAG: u32 = 26;
/// `LoginGetFlag` reply.
pub const ID_LOGIN_GET_FLAG_REPLY: u32 = 27;
/// `Logout` request.
pub const ID_LOGOUT: u32 = 28;
/// `Logout` reply.
pub const ID_LOGOUT_REPLY: u32 = 29;
/// Unsolicited `HeartBeatNotice` from the device.
pub const ID_HEARTBEAT: u32 = 78;
/// `HeartBeatNoticeReply` sent by the client.
pub const ID_HEARTBEAT_REPLY: u32 = 79;
/// `RealStreamCreate` request.
pub const ID_STREAM_CREATE: u32 = 136;
/// `RealStreamCreate` reply (carries the `MediaSession` id).
pub const ID_STREAM_CREATE_REPLY: u32 = 137;
/// `RealStreamStart` request.
pub const ID_STREAM_START: u32 = 138;
/// `RealStreamStart` reply.
pub const ID_STREAM_START_REPLY: u32 = 139;
/// `RealStreamStop` request.
pub const ID_STREAM_STOP: u32 = 140;
/// `RealStreamStop` reply.
pub const ID_STREAM_STOP_REPLY: u32 = 141;
/// `RealStreamDestroy` request.
pub const ID_STREAM_DESTROY: u32 = 142;
/// `RealStreamDestroy` reply.
pub const ID_STREAM_DESTROY_REPLY: u32 = 143;

/// Process-wide transaction counter. Incremented before use so the first
/// allocated id is `0x10001`; wraparound simply continues at the low end.
static TXN: AtomicU32 = AtomicU32::new(0x10000);

/// Allocate the next transaction id.
pub fn next_txn() -> u32 {
    TXN.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
}

/// A parsed 36-byte frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    fields: [u32; 9],
}

impl FrameHeader {
    /// Parse a raw 36-byte header.
    pub fn parse(buf: &[u8; HEADER_SIZE]) -> Self {
        let mut fields = [0u32; 9];
        for (i, field) in fields.iter_mut().enumerate() {
            let off = i * 4;
            *field = u32::from_be_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]]);
        }
        Self { fields }
    }

    fn encode(fields: [u32; 9]) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        for (i, field) in fields.iter().enumerate() {
            buf[i * 4..i * 4 + 4].copy_from_slice(&field.to_be_bytes());
        }
        buf
    }

    /// Channel magic (field 0).
    pub fn magic(&self) -> u32 {
        self.fields[0]
    }

    /// Transaction id (field 2).
    pub fn txn(&self) -> u32 {
        self.fields[2]
    }

    /// Media data-frame payload length (field 3).
    pub fn payload_len(&self) -> u32 {
        self.fields[3]
    }

    /// Command body length (field 4).
    pub fn body_len(&self) -> u32 {
        self.fields[4]
    }

    /// Media session id (field 8, media handshake only).
    pub fn media_session(&self) -> u32 {
        self.fields[8]
    }
}

/// Build a 36-byte command header. A fresh transaction id is allocated
/// unless `txn` pins one (heartbeat replies echo the notice's id).
pub fn pack_command_header(body_len: u32, txn: Option<u32>) -> [u8; HEADER_SIZE] {
    let txn = txn.unwrap_or_else(next_txn);
    FrameHeader::encode([CMD_MAGIC, VERSION, txn, 0, body_len, CMD_CLASS, 0, 0, 0])
}

/// Build the 36-byte media handshake carrying the device-issued session id.
pub fn pack_media_handshake(session_id: u32) -> [u8; HEADER_SIZE] {
    FrameHeader::encode([MEDIA_MAGIC, VERSION, 4, 0, 3, 0, 0, 0, session_id])
}

/// Build a null-terminated XML command body.
pub fn make_command_body(cmd_id: u32, inner: &str) -> Vec<u8> {
    let xml = format!(
        "<?xml version=\"1.0\" encoding=\"GB2312\" standalone=\"yes\" ?>\n\
         <Command ID=\"{cmd_id}\">\n    {inner}\n</Command>\n"
    );
    let mut body = xml.into_bytes();
    body.push(0);
    body
}

/// Frame a command body into a single header+body byte sequence ready for
/// one atomic write.
pub fn frame_command(body: &[u8], txn: Option<u32>) -> Vec<u8> {
    let header = pack_command_header(body.len() as u32, txn);
    let mut frame = Vec::with_capacity(HEADER_SIZE + body.len());
    frame.extend_from_slice(&header);
    frame.extend_from_slice(body);
    frame
}

/// Decode a command body to text, stripping the trailing NUL.
pub fn parse_body(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    text.trim_end_matches('\0').to_string()
}

/// Extract a flat XML attribute value. The device's replies are short,
/// predictable fragments, so a direct pattern grab is sufficient here.
pub fn xml_attr(xml: &str, name: &str) -> Option<String> {
    let re = Regex::new(&format!(r#"{name}="([^"]*)""#)).ok()?;
    re.captures(xml).map(|c| c[1].to_string())
}

/// True if `err` is a read timeout rather than a hard failure.
pub fn is_timeout(err: &io::Error) -> bool {
    matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

/// Read one complete message from a command socket.
///
/// Returns `Ok(None)` on an orderly EOF (including a short read inside the
/// header). A short read mid-body yields the partial body; the caller
/// should treat the session as inconsistent. Timeouts propagate as errors
/// without closing the socket so callers can distinguish "no traffic this
/// interval" from hard failure via [`is_timeout`].
pub fn read_message(
    stream: &mut TcpStream,
    timeout: Duration,
) -> io::Result<Option<(FrameHeader, Vec<u8>)>> {
    stream.set_read_timeout(Some(timeout))?;

    let mut raw = [0u8; HEADER_SIZE];
    if !read_full(stream, &mut raw)? {
        return Ok(None);
    }
    let header = FrameHeader::parse(&raw);

    let body_len = header.body_len();
    if body_len > MAX_BODY_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("body length {body_len} exceeds limit {MAX_BODY_LEN}"),
        ));
    }

    let mut body = vec![0u8; body_len as usize];
    let mut filled = 0;
    while filled < body.len() {
        match stream.read(&mut body[filled..]) {
            Ok(0) => {
                body.truncate(filled);
                break;
            }
            Ok(n) => filled += n,
            Err(e) => return Err(e),
        }
    }
    Ok(Some((header, body)))
}

/// Fill `buf` completely. Returns `Ok(false)` if the peer closed before
/// the buffer was full.
fn read_full(stream: &mut TcpStream, buf: &mut [u8]) -> io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match stream.read(&mut buf[filled..]) {
            Ok(0) => return Ok(false),
            Ok(n) => filled += n,
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::TcpListener;

    #[test]
    fn test_command_header_layout() {
        let raw = pack_command_header(128, Some(0x2000));
        let header = FrameHeader::parse(&raw);
        assert_eq!(header.magic(), CMD_MAGIC);
        assert_eq!(header.fields[1], VERSION);
        assert_eq!(header.txn(), 0x2000);
        assert_eq!(header.body_len(), 128);
        assert_eq!(header.fields[5], 3);
    }

    #[test]
    fn test_media_handshake_layout() {
        let raw = pack_media_handshake(42);
        let header = FrameHeader::parse(&raw);
        assert_eq!(header.magic(), MEDIA_MAGIC);
        assert_eq!(header.fields[2], 4);
        assert_eq!(header.fields[4], 3);
        assert_eq!(header.media_session(), 42);
        // last u32 on the wire is the session id
        assert_eq!(&raw[32..36], &42u32.to_be_bytes());
    }

    #[test]
    fn test_txn_is_strictly_increasing() {
        let a = pack_command_header(0, None);
        let b = pack_command_header(0, None);
        assert!(FrameHeader::parse(&b).txn() > FrameHeader::parse(&a).txn());
    }

    #[test]
    fn test_body_is_null_terminated() {
        let body = make_command_body(26, r#"<LoginGetFlag UserName="admin" />"#);
        assert_eq!(body.last(), Some(&0u8));
        let text = parse_body(&body);
        assert!(text.contains(r#"<Command ID="26">"#));
        assert!(text.contains("LoginGetFlag"));
        assert!(!text.ends_with('\0'));
        assert!(text.starts_with("<?xml"));
    }

    #[test]
    fn test_framing_round_trip() {
        let body = make_command_body(136, r#"<RealStreamCreateRequest Channel="0" />"#);
        let frame = frame_command(&body, None);

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let sender = std::thread::spawn(move || {
            let mut conn = TcpStream::connect(addr).unwrap();
            conn.write_all(&frame).unwrap();
        });

        let (mut conn, _) = listener.accept().unwrap();
        let (header, got) = read_message(&mut conn, Duration::from_secs(5))
            .unwrap()
            .unwrap();
        sender.join().unwrap();

        assert_eq!(header.magic(), CMD_MAGIC);
        assert_eq!(header.body_len() as usize, got.len());
        let text = parse_body(&got);
        assert!(text.contains(r#"<Command ID="136">"#));
        assert!(text.contains("RealStreamCreateRequest"));
    }

    #[test]
    fn test_read_message_clean_eof() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let closer = std::thread::spawn(move || {
            let conn = TcpStream::connect(addr).unwrap();
            drop(conn);
        });
        let (mut conn, _) = listener.accept().unwrap();
        let result = read_message(&mut conn, Duration::from_secs(5)).unwrap();
        closer.join().unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_read_message_timeout_is_distinguishable() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let _held = TcpStream::connect(addr).unwrap();
        let (mut conn, _) = listener.accept().unwrap();
        let err = read_message(&mut conn, Duration::from_millis(50)).unwrap_err();
        assert!(is_timeout(&err));
    }

    #[test]
    fn test_xml_attr() {
        let xml = r#"<LoginGetFlagReply CmdReply="0" LoginFlag="ABC123" />"#;
        assert_eq!(xml_attr(xml, "LoginFlag").as_deref(), Some("ABC123"));
        assert_eq!(xml_attr(xml, "CmdReply").as_deref(), Some("0"));
        assert!(xml_attr(xml, "MediaSession").is_none());
    }
}
