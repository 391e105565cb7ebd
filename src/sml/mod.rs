use log::warn;
use std::io::Read;
use thiserror::Error;

pub mod parser;

// SML transport layer constants
const START_SEQUENCE: [u8; 8] = [0x1B, 0x1B, 0x1B, 0x1B, 0x01, 0x01, 0x01, 0x01];
const END_ESCAPE: [u8; 5] = [0x1B, 0x1B, 0x1B, 0x1B, 0x1A];
// escape + 0x1A + padding count + CRC16
const END_TRAILER_LEN: usize = 8;
// Cap on buffered bytes while hunting for a frame boundary
const MAX_PENDING: usize = 64 * 1024;

#[derive(Error, Debug)]
pub enum SmlError {
    #[error("stream error: {0}")]
    Io(#[from] std::io::Error),
    #[error("stream ended")]
    StreamEnded,
    #[error("invalid SML frame: {0}")]
    Frame(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum SmlValue {
    Bool(bool),
    Int(i64),
    UInt(u64),
    Bytes(Vec<u8>),
}

/// One decoded entry of a GetListResponse value list.
#[derive(Debug, Clone, PartialEq)]
pub struct ListEntry {
    pub obis: Vec<u8>,
    pub value: SmlValue,
    pub scaler: Option<i8>,
    pub unit: Option<u8>,
}

impl ListEntry {
    /// Numeric value with the transmitted scaler applied.
    pub fn float(&self) -> f64 {
        let raw = match &self.value {
            SmlValue::Bool(b) => {
                if *b { 1.0 } else { 0.0 }
            }
            SmlValue::Int(i) => *i as f64,
            SmlValue::UInt(u) => *u as f64,
            SmlValue::Bytes(_) => 0.0,
        };

        match self.scaler {
            Some(s) => raw * 10f64.powi(s as i32),
            None => raw,
        }
    }

    /// Human readable OBIS code, e.g. "1-0:1.8.0". The storage byte is only
    /// appended when a meter transmits something other than 0xFF there.
    pub fn object_name(&self) -> String {
        if self.obis.len() == 6 {
            let o = &self.obis;
            if o[5] == 0xFF {
                return format!("{}-{}:{}.{}.{}", o[0], o[1], o[2], o[3], o[4]);
            }
            return format!("{}-{}:{}.{}.{}.{}", o[0], o[1], o[2], o[3], o[4], o[5]);
        }

        // Fallback: format as hex
        return hex::encode(&self.obis);
    }

    /// Registered patterns come from config as five dotted groups; on the wire
    /// the code carries a sixth storage byte which is ignored for matching.
    pub fn matches(&self, pattern: &[u8]) -> bool {
        if self.obis == pattern {
            return true;
        }
        return self.obis.len() == 6 && pattern.len() == 5 && &self.obis[..5] == pattern;
    }
}

pub type ObisCallback = Box<dyn Fn(&ListEntry) + Send>;

/// Callback-driven SML stream decoder. Register one callback per OBIS code of
/// interest, then feed it a byte stream with `read`.
pub struct SmlDecoder {
    callbacks: Vec<(Vec<u8>, ObisCallback)>,
}

impl SmlDecoder {
    pub fn new() -> Self {
        return SmlDecoder { callbacks: Vec::new() };
    }

    pub fn register<F>(&mut self, obis: Vec<u8>, callback: F)
    where
        F: Fn(&ListEntry) + Send + 'static,
    {
        self.callbacks.push((obis, Box::new(callback)));
    }

    /// Consumes the stream until it ends or the underlying read fails; both
    /// surface as an error. Malformed frames are skipped and the scan resyncs
    /// on the next start sequence.
    pub fn read<R: Read>(&self, mut reader: R) -> Result<(), SmlError> {
        let mut pending: Vec<u8> = Vec::new();
        let mut chunk = [0u8; 512];

        loop {
            let n = reader.read(&mut chunk)?;
            if n == 0 {
                return Err(SmlError::StreamEnded);
            }

            pending.extend_from_slice(&chunk[..n]);
            self.drain_frames(&mut pending);

            if pending.len() > MAX_PENDING {
                warn!("Discarding {} buffered bytes without a frame boundary", pending.len());
                let keep_from = pending.len() - START_SEQUENCE.len();
                pending.drain(..keep_from);
            }
        }
    }

    fn drain_frames(&self, pending: &mut Vec<u8>) {
        loop {
            let start = match find(pending, &START_SEQUENCE) {
                Some(pos) => pos,
                None => return,
            };
            if start > 0 {
                pending.drain(..start);
            }

            let end = match find(&pending[START_SEQUENCE.len()..], &END_ESCAPE) {
                Some(pos) => START_SEQUENCE.len() + pos,
                None => return,
            };
            if pending.len() < end + END_TRAILER_LEN {
                // Trailer still incomplete
                return;
            }

            match parser::parse_frame(&pending[START_SEQUENCE.len()..end]) {
                Ok(entries) => self.dispatch(&entries),
                Err(e) => warn!("Skipping malformed SML frame: {e}"),
            }

            pending.drain(..end + END_TRAILER_LEN);
        }
    }

    fn dispatch(&self, entries: &[ListEntry]) {
        for entry in entries {
            for (pattern, callback) in self.callbacks.iter() {
                if entry.matches(pattern) {
                    callback(entry);
                }
            }
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|window| window == needle)
}

#[cfg(test)]
pub(crate) mod testframe {
    //! Builders for wire-format SML frames used by the decoder tests.

    use super::{END_ESCAPE, START_SEQUENCE};

    pub fn tl(ty: u8, len: usize) -> u8 {
        (ty << 4) | (len as u8)
    }

    pub fn absent() -> Vec<u8> {
        vec![0x01]
    }

    pub fn octet(bytes: &[u8]) -> Vec<u8> {
        let mut out = vec![tl(0, bytes.len() + 1)];
        out.extend_from_slice(bytes);
        out
    }

    pub fn uint8(v: u8) -> Vec<u8> {
        vec![tl(6, 2), v]
    }

    pub fn uint16(v: u16) -> Vec<u8> {
        let mut out = vec![tl(6, 3)];
        out.extend_from_slice(&v.to_be_bytes());
        out
    }

    pub fn uint32(v: u32) -> Vec<u8> {
        let mut out = vec![tl(6, 5)];
        out.extend_from_slice(&v.to_be_bytes());
        out
    }

    pub fn int8(v: i8) -> Vec<u8> {
        vec![tl(5, 2), v as u8]
    }

    pub fn entry(obis: &[u8], unit: u8, scaler: i8, value: u32) -> Vec<u8> {
        let mut out = vec![tl(7, 7)];
        out.extend(octet(obis));
        out.extend(absent()); // status
        out.extend(absent()); // val time
        out.extend(uint8(unit));
        out.extend(int8(scaler));
        out.extend(uint32(value));
        out.extend(absent()); // value signature
        out
    }

    pub fn get_list_response(entries: &[Vec<u8>]) -> Vec<u8> {
        let mut out = vec![tl(7, 7)];
        out.extend(absent()); // client id
        out.extend(octet(b"serial01")); // server id
        out.extend(absent()); // list name
        out.extend(absent()); // act sensor time
        out.push(tl(7, entries.len()));
        for entry in entries {
            out.extend(entry);
        }
        out.extend(absent()); // list signature
        out.extend(absent()); // act gateway time
        out
    }

    pub fn message(msg_type: u16, body: Vec<u8>) -> Vec<u8> {
        let mut out = vec![tl(7, 6)];
        out.extend(octet(b"tx1")); // transaction id
        out.extend(uint8(0)); // group no
        out.extend(uint8(0)); // abort on error
        out.push(tl(7, 2));
        out.extend(uint16(msg_type));
        out.extend(body);
        out.extend(uint16(0xAABB)); // crc
        out.push(0x00); // end of message
        out
    }

    pub fn wire(content: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&START_SEQUENCE);
        out.extend_from_slice(content);
        out.extend_from_slice(&END_ESCAPE);
        out.push(0x00); // padding count
        out.extend_from_slice(&[0x12, 0x34]); // crc16
        out
    }

    pub fn single_entry_wire(obis: &[u8], unit: u8, scaler: i8, value: u32) -> Vec<u8> {
        let glr = get_list_response(&[entry(obis, unit, scaler, value)]);
        wire(&message(super::parser::SML_GET_LIST_RESPONSE, glr))
    }
}
