//! Wire framing for the device protocol.
//!
//! Every command and notification travels as a delimited frame: a start byte,
//! an escaped body (flags, addressing, device/command ids, sequence number,
//! optional error code, payload, checksum) and an end byte. Three byte values
//! are reserved for framing and are escaped inside the body.

use crate::error::{Error, Result};
use tracing::warn;

/// Start-of-packet delimiter.
pub const SOP: u8 = 0x8D;
/// End-of-packet delimiter.
pub const EOP: u8 = 0xD8;
/// Escape marker.
pub const ESC: u8 = 0xAB;

const ESC_SOP: u8 = 0x05;
const ESC_EOP: u8 = 0x50;
const ESC_ESC: u8 = 0x23;

/// Flag bits carried in the first body byte.
pub mod flags {
    /// The packet is a response to a previously sent command.
    pub const IS_RESPONSE: u8 = 0x01;
    /// The receiver must answer with a response packet.
    pub const REQUESTS_RESPONSE: u8 = 0x02;
    /// The packet counts as activity for the inactivity timeout.
    pub const IS_ACTIVITY: u8 = 0x08;
    /// A target address byte follows the flags.
    pub const HAS_TARGET: u8 = 0x10;
    /// A source address byte follows the target.
    pub const HAS_SOURCE: u8 = 0x20;
}

/// Identifies the kind of an asynchronous inbound payload: which device
/// subsystem and command a notification belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NotificationKey {
    pub device: u8,
    pub command: u8,
}

impl NotificationKey {
    pub const fn new(device: u8, command: u8) -> Self {
        Self { device, command }
    }
}

/// A decoded protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub flags: u8,
    pub target: Option<u8>,
    pub source: Option<u8>,
    pub did: u8,
    pub cid: u8,
    pub seq: u8,
    /// Device error code; present on responses only.
    pub err: Option<u8>,
    pub data: Vec<u8>,
}

impl Packet {
    /// Builds an outbound command frame that requests a response.
    pub fn request(did: u8, cid: u8, seq: u8, data: Vec<u8>) -> Self {
        Self {
            flags: flags::REQUESTS_RESPONSE | flags::IS_ACTIVITY,
            target: None,
            source: None,
            did,
            cid,
            seq,
            err: None,
            data,
        }
    }

    pub fn is_response(&self) -> bool {
        self.flags & flags::IS_RESPONSE != 0
    }

    pub fn key(&self) -> NotificationKey {
        NotificationKey::new(self.did, self.cid)
    }

    /// Serializes the packet into a delimited, escaped frame.
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(self.data.len() + 8);
        body.push(self.flags);
        if let Some(target) = self.target {
            body.push(target);
        }
        if let Some(source) = self.source {
            body.push(source);
        }
        body.push(self.did);
        body.push(self.cid);
        body.push(self.seq);
        if let Some(err) = self.err {
            body.push(err);
        }
        body.extend_from_slice(&self.data);
        body.push(checksum(&body));

        let mut frame = Vec::with_capacity(body.len() + 2);
        frame.push(SOP);
        for byte in body {
            match byte {
                SOP => frame.extend_from_slice(&[ESC, ESC_SOP]),
                EOP => frame.extend_from_slice(&[ESC, ESC_EOP]),
                ESC => frame.extend_from_slice(&[ESC, ESC_ESC]),
                other => frame.push(other),
            }
        }
        frame.push(EOP);
        frame
    }

    /// Decodes an unescaped body (everything between SOP and EOP).
    fn decode_body(body: &[u8]) -> Result<Self> {
        if body.len() < 5 {
            return Err(Error::BadPacket("frame too short"));
        }
        let (payload, chk) = body.split_at(body.len() - 1);
        if checksum(payload) != chk[0] {
            return Err(Error::BadPacket("checksum mismatch"));
        }

        let mut at = 0;
        let flags = take(payload, &mut at)?;
        let target = if flags & flags::HAS_TARGET != 0 {
            Some(take(payload, &mut at)?)
        } else {
            None
        };
        let source = if flags & flags::HAS_SOURCE != 0 {
            Some(take(payload, &mut at)?)
        } else {
            None
        };
        let did = take(payload, &mut at)?;
        let cid = take(payload, &mut at)?;
        let seq = take(payload, &mut at)?;
        let err = if flags & flags::IS_RESPONSE != 0 {
            Some(take(payload, &mut at)?)
        } else {
            None
        };
        let data = payload[at..].to_vec();

        Ok(Self {
            flags,
            target,
            source,
            did,
            cid,
            seq,
            err,
            data,
        })
    }
}

fn take(payload: &[u8], at: &mut usize) -> Result<u8> {
    let byte = *payload.get(*at).ok_or(Error::BadPacket("truncated header"))?;
    *at += 1;
    Ok(byte)
}

/// Additive body checksum: the complement of the byte sum.
fn checksum(body: &[u8]) -> u8 {
    !body.iter().fold(0u8, |sum, b| sum.wrapping_add(*b))
}

/// Reassembles frames from a stream of notification chunks.
///
/// Notifications may arrive split or coalesced; the collector accumulates
/// bytes until an end delimiter and unescapes the body before decoding.
/// Malformed frames are dropped with a warning and do not poison the stream.
#[derive(Debug, Default)]
pub struct PacketCollector {
    buf: Vec<u8>,
}

impl PacketCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds raw bytes, invoking `out` for every complete frame.
    pub fn feed(&mut self, bytes: &[u8], mut out: impl FnMut(Packet)) {
        for &byte in bytes {
            match byte {
                SOP => self.buf.clear(),
                EOP => {
                    match unescape(&self.buf).and_then(|body| Packet::decode_body(&body)) {
                        Ok(packet) => out(packet),
                        Err(e) => warn!("dropping malformed frame: {e}"),
                    }
                    self.buf.clear();
                }
                other => self.buf.push(other),
            }
        }
    }
}

fn unescape(raw: &[u8]) -> Result<Vec<u8>> {
    let mut body = Vec::with_capacity(raw.len());
    let mut bytes = raw.iter();
    while let Some(&byte) = bytes.next() {
        if byte != ESC {
            body.push(byte);
            continue;
        }
        match bytes.next() {
            Some(&ESC_SOP) => body.push(SOP),
            Some(&ESC_EOP) => body.push(EOP),
            Some(&ESC_ESC) => body.push(ESC),
            _ => return Err(Error::BadPacket("bad escape sequence")),
        }
    }
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect_one(frame: &[u8]) -> Option<Packet> {
        let mut collector = PacketCollector::new();
        let mut got = None;
        collector.feed(frame, |p| got = Some(p));
        got
    }

    #[test]
    fn round_trip() {
        let packet = Packet::request(0x16, 0x07, 42, vec![0x80, 0x00, 0x5A, 0x00]);
        let decoded = collect_one(&packet.encode()).expect("frame decodes");
        assert_eq!(decoded, packet);
    }

    #[test]
    fn reserved_bytes_are_escaped() {
        let packet = Packet::request(0x16, 0x07, 1, vec![SOP, EOP, ESC]);
        let frame = packet.encode();
        // Delimiters appear exactly once each in the framed output.
        assert_eq!(frame.iter().filter(|&&b| b == SOP).count(), 1);
        assert_eq!(frame.iter().filter(|&&b| b == EOP).count(), 1);
        assert_eq!(collect_one(&frame).expect("frame decodes"), packet);
    }

    #[test]
    fn checksum_mismatch_is_dropped() {
        let mut frame = Packet::request(0x13, 0x0D, 0, vec![]).encode();
        let tampered = frame.len() - 3;
        frame[tampered] ^= 0xFF;
        assert!(collect_one(&frame).is_none());
    }

    #[test]
    fn split_delivery_reassembles() {
        let packet = Packet::request(0x18, 0x02, 7, vec![1, 2, 3, 4]);
        let frame = packet.encode();
        let mut collector = PacketCollector::new();
        let mut got = Vec::new();
        let (head, tail) = frame.split_at(frame.len() / 2);
        collector.feed(head, |p| got.push(p));
        assert!(got.is_empty());
        collector.feed(tail, |p| got.push(p));
        assert_eq!(got, vec![packet]);
    }

    #[test]
    fn response_carries_error_code() {
        let response = Packet {
            flags: flags::IS_RESPONSE,
            target: None,
            source: None,
            did: 0x16,
            cid: 0x07,
            seq: 9,
            err: Some(0x02),
            data: vec![],
        };
        let decoded = collect_one(&response.encode()).expect("frame decodes");
        assert!(decoded.is_response());
        assert_eq!(decoded.err, Some(0x02));
    }
}
