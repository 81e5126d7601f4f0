//! # Hashnames
//!
//! A hashname is the 32-byte self-certifying identifier of an endpoint:
//! the SHA-256 digest of the endpoint's sorted CSID/fingerprint pairs.
//! Nothing outside the key material binds a name to an endpoint, so a
//! hashname can be verified against the keys it claims to represent.
//!
//! Hashnames double as coordinates in the XOR metric space used by the
//! peer table and the seek protocol.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::cipherset::Parts;
use crate::error::{Error, Result};

/// 256-bit self-certifying endpoint identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Hashname([u8; 32]);

impl Hashname {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Hashname(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Derive the hashname from a parts set: SHA-256 over each
    /// `csid-hex || fingerprint` pair in ascending CSID order.
    pub fn from_parts(parts: &Parts) -> Result<Hashname> {
        if parts.is_empty() {
            return Err(Error::InvalidParts("empty parts set".into()));
        }
        let mut hasher = Sha256::new();
        for (csid, fingerprint) in parts.iter() {
            hasher.update(hex::encode([*csid]).as_bytes());
            hasher.update(fingerprint.as_bytes());
        }
        Ok(Hashname(hasher.finalize().into()))
    }

    /// Byte-wise XOR distance to another hashname.
    pub fn xor_distance(&self, other: &Hashname) -> [u8; 32] {
        let mut dist = [0u8; 32];
        for (i, byte) in dist.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        dist
    }

    /// Abbreviated form for logs.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

/// Lexicographic comparison of two XOR distances.
pub fn distance_cmp(a: &[u8; 32], b: &[u8; 32]) -> std::cmp::Ordering {
    a.cmp(b)
}

impl fmt::Display for Hashname {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Hashname {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hashname({})", self.short())
    }
}

impl FromStr for Hashname {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = hex::decode(s)
            .map_err(|_| Error::InvalidParts(format!("hashname is not hex: {s:?}")))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::InvalidParts("hashname must be 32 bytes".into()))?;
        Ok(Hashname(bytes))
    }
}

impl TryFrom<String> for Hashname {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<Hashname> for String {
    fn from(h: Hashname) -> String {
        h.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make(seed: u8) -> Hashname {
        Hashname::from_bytes([seed; 32])
    }

    #[test]
    fn hex_round_trip() {
        let h = make(0xab);
        let parsed: Hashname = h.to_string().parse().unwrap();
        assert_eq!(h, parsed);
    }

    #[test]
    fn rejects_bad_hex() {
        assert!("zz".parse::<Hashname>().is_err());
        assert!("abcd".parse::<Hashname>().is_err());
    }

    #[test]
    fn xor_distance_symmetric() {
        let a = make(1);
        let b = make(7);
        assert_eq!(a.xor_distance(&b), b.xor_distance(&a));
        assert_eq!(a.xor_distance(&a), [0u8; 32]);
    }

    #[test]
    fn parts_derivation_is_order_independent() {
        let mut p1 = Parts::new();
        p1.insert(0x3a, "aa".repeat(32));
        p1.insert(0x1a, "bb".repeat(32));

        let mut p2 = Parts::new();
        p2.insert(0x1a, "bb".repeat(32));
        p2.insert(0x3a, "aa".repeat(32));

        assert_eq!(
            Hashname::from_parts(&p1).unwrap(),
            Hashname::from_parts(&p2).unwrap()
        );
    }

    #[test]
    fn empty_parts_rejected() {
        assert!(Hashname::from_parts(&Parts::new()).is_err());
    }
}
