//! # Packet Framing
//!
//! The one binary contract every component shares: a packet is a
//! length-prefixed header followed by an opaque body.
//!
//! ```text
//! ┌──────────────┬──────────────┬────────────┐
//! │ u16 BE len   │ header bytes │ body bytes │
//! └──────────────┴──────────────┴────────────┘
//! ```
//!
//! - `len == 0`: no header at all.
//! - `len == 1`: the single header byte is a CSID, used to frame
//!   handshake cryptograms.
//! - `len > 1`: UTF-8 JSON of one object whose values are strings,
//!   integers, booleans, or nested arrays/objects. Key order is
//!   preserved on re-encode.
//!
//! Decoding is bounded: headers larger than [`MAX_HEADER_SIZE`] and
//! frames larger than [`MAX_PACKET_SIZE`] are rejected before any JSON
//! parsing happens.

use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// Upper bound on a whole wire frame.
pub const MAX_PACKET_SIZE: usize = 64 * 1024;

/// Upper bound on the JSON header portion.
pub const MAX_HEADER_SIZE: usize = 16 * 1024;

/// Insertion-ordered JSON object header with typed accessors.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Header(Map<String, Value>);

impl Header {
    pub fn new() -> Self {
        Header(Map::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        self.0.get(key).and_then(Value::as_i64)
    }

    pub fn get_uint(&self, key: &str) -> Option<u64> {
        self.0.get(key).and_then(Value::as_u64)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.0.get(key).and_then(Value::as_bool)
    }

    /// Integer list accessor, used by the `miss` channel header.
    pub fn get_uint_list(&self, key: &str) -> Option<Vec<u64>> {
        let values = self.0.get(key)?.as_array()?;
        values.iter().map(Value::as_u64).collect()
    }

    /// String list accessor, used by the `see` seek header.
    pub fn get_str_list(&self, key: &str) -> Option<Vec<String>> {
        let values = self.0.get(key)?.as_array()?;
        values
            .iter()
            .map(|v| v.as_str().map(str::to_owned))
            .collect()
    }

    pub fn set<V: Into<Value>>(&mut self, key: &str, value: V) {
        self.0.insert(key.to_owned(), value.into());
    }

    pub fn set_object(&mut self, key: &str, value: Map<String, Value>) {
        self.0.insert(key.to_owned(), Value::Object(value));
    }

    pub fn get_object(&self, key: &str) -> Option<&Map<String, Value>> {
        self.0.get(key).and_then(Value::as_object)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }
}

impl From<Map<String, Value>> for Header {
    fn from(map: Map<String, Value>) -> Self {
        Header(map)
    }
}

/// Logical unit exchanged inside channels and on the handshake path.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Packet {
    pub header: Header,
    /// Present when the wire header was a bare CSID byte.
    pub csid: Option<u8>,
    pub body: Vec<u8>,
}

impl Packet {
    pub fn new() -> Self {
        Packet::default()
    }

    pub fn with_body(body: Vec<u8>) -> Self {
        Packet {
            header: Header::new(),
            csid: None,
            body,
        }
    }

    /// Handshake frame: single-byte CSID header plus cryptogram body.
    pub fn handshake(csid: u8, body: Vec<u8>) -> Self {
        Packet {
            header: Header::new(),
            csid: Some(csid),
            body,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        if let Some(csid) = self.csid {
            let mut out = Vec::with_capacity(3 + self.body.len());
            out.extend_from_slice(&1u16.to_be_bytes());
            out.push(csid);
            out.extend_from_slice(&self.body);
            return Ok(out);
        }

        let header_bytes = if self.header.is_empty() {
            Vec::new()
        } else {
            serde_json::to_vec(self.header.as_map())
                .map_err(|e| Error::InvalidPacket(format!("header encode: {e}")))?
        };
        if header_bytes.len() > MAX_HEADER_SIZE {
            return Err(Error::InvalidPacket(format!(
                "header too large: {} bytes",
                header_bytes.len()
            )));
        }

        let mut out = Vec::with_capacity(2 + header_bytes.len() + self.body.len());
        out.extend_from_slice(&(header_bytes.len() as u16).to_be_bytes());
        out.extend_from_slice(&header_bytes);
        out.extend_from_slice(&self.body);
        if out.len() > MAX_PACKET_SIZE {
            return Err(Error::InvalidPacket(format!("packet too large: {} bytes", out.len())));
        }
        Ok(out)
    }

    pub fn decode(data: &[u8]) -> Result<Packet> {
        if data.len() > MAX_PACKET_SIZE {
            return Err(Error::InvalidPacket(format!("packet too large: {} bytes", data.len())));
        }
        if data.len() < 2 {
            return Err(Error::InvalidPacket("truncated length prefix".into()));
        }

        let header_len = u16::from_be_bytes([data[0], data[1]]) as usize;
        if data.len() < 2 + header_len {
            return Err(Error::InvalidPacket(format!(
                "header length {} exceeds frame of {} bytes",
                header_len,
                data.len()
            )));
        }
        let header_bytes = &data[2..2 + header_len];
        let body = data[2 + header_len..].to_vec();

        match header_len {
            0 => Ok(Packet {
                header: Header::new(),
                csid: None,
                body,
            }),
            1 => Ok(Packet {
                header: Header::new(),
                csid: Some(header_bytes[0]),
                body,
            }),
            n if n > MAX_HEADER_SIZE => {
                Err(Error::InvalidPacket(format!("header too large: {n} bytes")))
            }
            _ => {
                let value: Value = serde_json::from_slice(header_bytes)
                    .map_err(|e| Error::InvalidPacket(format!("header parse: {e}")))?;
                match value {
                    Value::Object(map) => Ok(Packet {
                        header: Header::from(map),
                        csid: None,
                        body,
                    }),
                    other => Err(Error::InvalidPacket(format!(
                        "header is not an object: {other}"
                    ))),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_headerless() {
        let pkt = Packet::with_body(b"raw payload".to_vec());
        let decoded = Packet::decode(&pkt.encode().unwrap()).unwrap();
        assert_eq!(decoded, pkt);
    }

    #[test]
    fn round_trip_csid_frame() {
        let pkt = Packet::handshake(0x3a, vec![1, 2, 3, 4]);
        let wire = pkt.encode().unwrap();
        assert_eq!(&wire[..3], &[0, 1, 0x3a]);
        let decoded = Packet::decode(&wire).unwrap();
        assert_eq!(decoded.csid, Some(0x3a));
        assert_eq!(decoded.body, vec![1, 2, 3, 4]);
    }

    #[test]
    fn round_trip_json_header() {
        let mut pkt = Packet::with_body(b"body".to_vec());
        pkt.header.set("type", "line");
        pkt.header.set("seq", 7);
        pkt.header.set("end", true);
        pkt.header.set("miss", vec![2u64, 4u64]);

        let decoded = Packet::decode(&pkt.encode().unwrap()).unwrap();
        assert_eq!(decoded.header.get_str("type"), Some("line"));
        assert_eq!(decoded.header.get_uint("seq"), Some(7));
        assert_eq!(decoded.header.get_bool("end"), Some(true));
        assert_eq!(decoded.header.get_uint_list("miss"), Some(vec![2, 4]));
        assert_eq!(decoded.body, b"body");
    }

    #[test]
    fn header_key_order_preserved() {
        let mut pkt = Packet::new();
        pkt.header.set("zeta", 1);
        pkt.header.set("alpha", 2);
        let wire = pkt.encode().unwrap();
        let json = std::str::from_utf8(&wire[2..]).unwrap();
        assert!(json.find("zeta").unwrap() < json.find("alpha").unwrap());
    }

    #[test]
    fn rejects_truncated_and_malformed() {
        assert!(Packet::decode(&[]).is_err());
        assert!(Packet::decode(&[0]).is_err());
        // Header length points past the end of the frame.
        assert!(Packet::decode(&[0, 9, b'{', b'}']).is_err());
        // Header is valid JSON but not an object.
        let mut wire = Vec::new();
        wire.extend_from_slice(&4u16.to_be_bytes());
        wire.extend_from_slice(b"[12]");
        assert!(Packet::decode(&wire).is_err());
    }

    #[test]
    fn zero_length_header_has_no_header() {
        let wire = [0u8, 0, 0xde, 0xad];
        let pkt = Packet::decode(&wire).unwrap();
        assert!(pkt.header.is_empty());
        assert_eq!(pkt.csid, None);
        assert_eq!(pkt.body, vec![0xde, 0xad]);
    }
}
