//! # Cipher Sets
//!
//! Key material is organized per cipher-set id (CSID): a one-byte label
//! for a family of handshake and session primitives. Endpoints publish
//! one public key per CSID they support; negotiation selects the highest
//! CSID present on both sides.
//!
//! Keys are opaque byte blobs to everything outside this module. The
//! in-crate cipher set (CSID `0x3a`) is X25519 agreement with
//! ChaCha20-Poly1305 sealing and SHA-256 derivation:
//!
//! - **Open cryptogram**: `eph-pub(32) || nonce(12) || sealed(inner)`,
//!   sealed under SHA-256 of the ephemeral/static agreement. The inner
//!   packet body carries the sender's static public key and a static-
//!   static authenticator, so a forged open fails before any state is
//!   touched.
//! - **Line keys**: directional SHA-256 derivations of the ephemeral
//!   agreement, bound to both ephemeral publics.
//! - **Tokens**: the 16-byte session ids each side uses to label line
//!   packets, derived from the ephemeral publics so both sides can
//!   compute both tokens without extra round trips.

use std::collections::BTreeMap;
use std::fmt;

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key as AeadKey, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::de::{self, Deserializer, MapAccess, Visitor};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::{Error, Result};
use crate::packet::Packet;

/// One-byte cipher-set identifier.
pub type Csid = u8;

/// The cipher set implemented in this crate.
pub const CSID_3A: Csid = 0x3a;

/// 16-byte session id labelling line packets.
pub type Token = [u8; 16];

const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

/// Opaque public (and optionally private) key for one CSID.
#[derive(Clone, PartialEq, Eq)]
pub struct Key {
    public: Vec<u8>,
    secret: Option<Vec<u8>>,
}

impl Key {
    pub fn from_public(public: Vec<u8>) -> Self {
        Key { public, secret: None }
    }

    pub fn from_pair(public: Vec<u8>, secret: Vec<u8>) -> Self {
        Key {
            public,
            secret: Some(secret),
        }
    }

    /// Generate a fresh CSID 3a static keypair.
    pub fn generate_cs3a() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Key {
            public: public.as_bytes().to_vec(),
            secret: Some(secret.to_bytes().to_vec()),
        }
    }

    pub fn public(&self) -> &[u8] {
        &self.public
    }

    pub fn secret(&self) -> Option<&[u8]> {
        self.secret.as_deref()
    }

    pub fn can_open(&self) -> bool {
        self.secret.is_some()
    }

    /// Hex SHA-256 of the public key; the CSID's entry in a parts set.
    pub fn fingerprint(&self) -> String {
        hex::encode(Sha256::digest(&self.public))
    }

    fn public_array(&self) -> Result<[u8; KEY_LEN]> {
        self.public
            .as_slice()
            .try_into()
            .map_err(|_| Error::InvalidKeys(format!("key must be {KEY_LEN} bytes")))
    }

    fn secret_array(&self) -> Result<[u8; KEY_LEN]> {
        self.secret
            .as_deref()
            .ok_or_else(|| Error::InvalidKeys("key has no private part".into()))?
            .try_into()
            .map_err(|_| Error::InvalidKeys(format!("secret must be {KEY_LEN} bytes")))
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Key({}{})",
            hex::encode(&self.public[..self.public.len().min(4)]),
            if self.secret.is_some() { ", private" } else { "" }
        )
    }
}

/// Public keys per CSID.
#[derive(Clone, Default, Debug, PartialEq)]
pub struct Keys(BTreeMap<Csid, Key>);

impl Keys {
    pub fn new() -> Self {
        Keys(BTreeMap::new())
    }

    pub fn insert(&mut self, csid: Csid, key: Key) {
        self.0.insert(csid, key);
    }

    pub fn get(&self, csid: Csid) -> Option<&Key> {
        self.0.get(&csid)
    }

    pub fn contains(&self, csid: Csid) -> bool {
        self.0.contains_key(&csid)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Csid, &Key)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Fingerprint every key into a parts set.
    pub fn to_parts(&self) -> Parts {
        let mut parts = Parts::new();
        for (csid, key) in &self.0 {
            parts.insert(*csid, key.fingerprint());
        }
        parts
    }

    /// Merge keys from `other` for CSIDs this set lacks.
    pub fn merge(&mut self, other: &Keys) {
        for (csid, key) in &other.0 {
            self.0.entry(*csid).or_insert_with(|| key.clone());
        }
    }
}

impl FromIterator<(Csid, Key)> for Keys {
    fn from_iter<T: IntoIterator<Item = (Csid, Key)>>(iter: T) -> Self {
        Keys(iter.into_iter().collect())
    }
}

impl Serialize for Keys {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (csid, key) in &self.0 {
            map.serialize_entry(&hex::encode([*csid]), &hex::encode(key.public()))?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Keys {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct KeysVisitor;

        impl<'de> Visitor<'de> for KeysVisitor {
            type Value = Keys;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of hex CSID to hex public key")
            }

            fn visit_map<A: MapAccess<'de>>(
                self,
                mut access: A,
            ) -> std::result::Result<Keys, A::Error> {
                let mut keys = Keys::new();
                while let Some((csid_hex, key_hex)) = access.next_entry::<String, String>()? {
                    let csid = parse_csid(&csid_hex).map_err(de::Error::custom)?;
                    let public =
                        hex::decode(&key_hex).map_err(|_| de::Error::custom("key is not hex"))?;
                    if public.is_empty() {
                        return Err(de::Error::custom("empty key"));
                    }
                    keys.insert(csid, Key::from_public(public));
                }
                Ok(keys)
            }
        }

        deserializer.deserialize_map(KeysVisitor)
    }
}

/// Public/private keypairs per CSID, supplied by the caller at startup.
#[derive(Clone, Default)]
pub struct PrivateKeys(BTreeMap<Csid, Key>);

impl PrivateKeys {
    pub fn new() -> Self {
        PrivateKeys(BTreeMap::new())
    }

    /// A fresh identity carrying only the in-crate cipher set.
    pub fn generate() -> Self {
        let mut keys = PrivateKeys::new();
        keys.insert(CSID_3A, Key::generate_cs3a());
        keys
    }

    pub fn insert(&mut self, csid: Csid, key: Key) {
        self.0.insert(csid, key);
    }

    pub fn get(&self, csid: Csid) -> Option<&Key> {
        self.0.get(&csid)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The public halves, as advertised to other endpoints.
    pub fn public_keys(&self) -> Keys {
        self.0
            .iter()
            .map(|(csid, key)| (*csid, Key::from_public(key.public().to_vec())))
            .collect()
    }
}

impl fmt::Debug for PrivateKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.0.keys()).finish()
    }
}

/// Fingerprints per CSID; the input to hashname derivation.
#[derive(Clone, Default, Debug, PartialEq, Eq)]
pub struct Parts(BTreeMap<Csid, String>);

impl Parts {
    pub fn new() -> Self {
        Parts(BTreeMap::new())
    }

    pub fn insert(&mut self, csid: Csid, fingerprint: String) {
        self.0.insert(csid, fingerprint);
    }

    pub fn get(&self, csid: Csid) -> Option<&str> {
        self.0.get(&csid).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Csid, &String)> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Parse a parts object from a packet header value.
    pub fn from_header(map: &serde_json::Map<String, serde_json::Value>) -> Result<Parts> {
        if map.is_empty() {
            return Err(Error::InvalidParts("empty parts object".into()));
        }
        let mut parts = Parts::new();
        for (csid_hex, value) in map {
            let csid =
                parse_csid(csid_hex).map_err(|e| Error::InvalidParts(e.to_string()))?;
            let fingerprint = value
                .as_str()
                .ok_or_else(|| Error::InvalidParts("fingerprint is not a string".into()))?;
            if fingerprint.len() != 64 || hex::decode(fingerprint).is_err() {
                return Err(Error::InvalidParts(format!(
                    "fingerprint for {csid_hex} is not 32 hex bytes"
                )));
            }
            parts.insert(csid, fingerprint.to_owned());
        }
        Ok(parts)
    }

    /// Render as a JSON object for embedding in a packet header.
    pub fn to_header(&self) -> serde_json::Map<String, serde_json::Value> {
        let mut map = serde_json::Map::new();
        for (csid, fingerprint) in &self.0 {
            map.insert(hex::encode([*csid]), fingerprint.clone().into());
        }
        map
    }
}

fn parse_csid(s: &str) -> Result<Csid> {
    if s.len() != 2 {
        return Err(Error::InvalidKeys(format!("CSID must be 2 hex chars: {s:?}")));
    }
    let bytes = hex::decode(s).map_err(|_| Error::InvalidKeys(format!("CSID is not hex: {s:?}")))?;
    Ok(bytes[0])
}

/// Pick the highest CSID present in both key sets.
pub fn select_csid(a: &Keys, b: &Keys) -> Option<Csid> {
    a.iter()
        .filter(|(csid, _)| b.contains(**csid))
        .map(|(csid, _)| *csid)
        .max()
}

/// Derive the session token for an ephemeral public key.
pub fn derive_token(eph_public: &[u8; KEY_LEN]) -> Token {
    let mut hasher = Sha256::new();
    hasher.update(b"token");
    hasher.update(eph_public);
    let digest = hasher.finalize();
    let mut token = [0u8; 16];
    token.copy_from_slice(&digest[..16]);
    token
}

/// A decoded inbound open cryptogram.
#[derive(Debug)]
pub struct OpenEnvelope {
    pub csid: Csid,
    pub sender_ephemeral: [u8; KEY_LEN],
    pub sender_key: Key,
    pub inner: Packet,
}

/// Our half of a line handshake: one ephemeral keypair and its token.
pub struct LineHalf {
    secret: StaticSecret,
    public: [u8; KEY_LEN],
    token: Token,
}

impl LineHalf {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret).to_bytes();
        let token = derive_token(&public);
        LineHalf {
            secret,
            public,
            token,
        }
    }

    pub fn public(&self) -> &[u8; KEY_LEN] {
        &self.public
    }

    /// The token the remote side will use to address us.
    pub fn token(&self) -> Token {
        self.token
    }

    /// Seal an open cryptogram for `remote_static`, authenticated by
    /// `local_static`.
    pub fn seal_open(
        &self,
        local_static: &Key,
        remote_static: &Key,
        mut inner: Packet,
    ) -> Result<Vec<u8>> {
        let remote_pub = PublicKey::from(remote_static.public_array()?);
        let local_secret = StaticSecret::from(local_static.secret_array()?);

        let mut body = Vec::with_capacity(KEY_LEN * 2);
        body.extend_from_slice(local_static.public());
        body.extend_from_slice(&open_auth(
            local_secret.diffie_hellman(&remote_pub).as_bytes(),
            &self.public,
        ));
        inner.body = body;

        let seal_key = open_key(self.secret.diffie_hellman(&remote_pub).as_bytes());
        let cipher = ChaCha20Poly1305::new(AeadKey::from_slice(&seal_key));
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let sealed = cipher
            .encrypt(Nonce::from_slice(&nonce), inner.encode()?.as_slice())
            .map_err(|_| Error::InvalidPacket("open seal failed".into()))?;

        let mut out = Vec::with_capacity(KEY_LEN + NONCE_LEN + sealed.len());
        out.extend_from_slice(&self.public);
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    /// Derive directional line keys from the remote ephemeral public.
    pub fn derive(&self, remote_ephemeral: &[u8; KEY_LEN]) -> LineKeys {
        let shared = self
            .secret
            .diffie_hellman(&PublicKey::from(*remote_ephemeral));

        LineKeys {
            enc: line_key(shared.as_bytes(), &self.public, remote_ephemeral),
            dec: line_key(shared.as_bytes(), remote_ephemeral, &self.public),
            local_token: self.token,
            remote_token: derive_token(remote_ephemeral),
        }
    }
}

impl fmt::Debug for LineHalf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LineHalf(token={})", hex::encode(self.token))
    }
}

/// Decode and authenticate an inbound open cryptogram.
pub fn open_open(csid: Csid, local_static: &Key, body: &[u8]) -> Result<OpenEnvelope> {
    if csid != CSID_3A {
        return Err(Error::InvalidKeys(format!("unsupported CSID {csid:#04x}")));
    }
    if body.len() < KEY_LEN + NONCE_LEN + 1 {
        return Err(Error::InvalidPacket("open cryptogram truncated".into()));
    }

    let mut sender_ephemeral = [0u8; KEY_LEN];
    sender_ephemeral.copy_from_slice(&body[..KEY_LEN]);
    let nonce = &body[KEY_LEN..KEY_LEN + NONCE_LEN];
    let sealed = &body[KEY_LEN + NONCE_LEN..];

    let local_secret = StaticSecret::from(local_static.secret_array()?);
    let seal_key = open_key(
        local_secret
            .diffie_hellman(&PublicKey::from(sender_ephemeral))
            .as_bytes(),
    );
    let cipher = ChaCha20Poly1305::new(AeadKey::from_slice(&seal_key));
    let inner_bytes = cipher
        .decrypt(Nonce::from_slice(nonce), sealed)
        .map_err(|_| Error::InvalidPacket("open unseal failed".into()))?;
    let mut inner = Packet::decode(&inner_bytes)?;

    if inner.body.len() != KEY_LEN * 2 {
        return Err(Error::InvalidPacket("open inner body malformed".into()));
    }
    let mut sender_public = [0u8; KEY_LEN];
    sender_public.copy_from_slice(&inner.body[..KEY_LEN]);
    let auth = &inner.body[KEY_LEN..];

    let expected = open_auth(
        local_secret
            .diffie_hellman(&PublicKey::from(sender_public))
            .as_bytes(),
        &sender_ephemeral,
    );
    if auth != expected {
        return Err(Error::InvalidPacket("open authenticator mismatch".into()));
    }

    inner.body.clear();
    Ok(OpenEnvelope {
        csid,
        sender_ephemeral,
        sender_key: Key::from_public(sender_public.to_vec()),
        inner,
    })
}

/// Directional AEAD keys for an established line.
#[derive(Clone)]
pub struct LineKeys {
    enc: [u8; KEY_LEN],
    dec: [u8; KEY_LEN],
    pub local_token: Token,
    pub remote_token: Token,
}

impl LineKeys {
    /// Seal a channel packet body: `nonce(12) || ciphertext`.
    pub fn encrypt(&self, plain: &[u8]) -> Result<Vec<u8>> {
        let cipher = ChaCha20Poly1305::new(AeadKey::from_slice(&self.enc));
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let sealed = cipher
            .encrypt(Nonce::from_slice(&nonce), plain)
            .map_err(|_| Error::InvalidPacket("line seal failed".into()))?;
        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < NONCE_LEN + 1 {
            return Err(Error::InvalidPacket("line body truncated".into()));
        }
        let cipher = ChaCha20Poly1305::new(AeadKey::from_slice(&self.dec));
        cipher
            .decrypt(Nonce::from_slice(&data[..NONCE_LEN]), &data[NONCE_LEN..])
            .map_err(|_| Error::InvalidPacket("line unseal failed".into()))
    }
}

impl fmt::Debug for LineKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "LineKeys(local={}, remote={})",
            hex::encode(self.local_token),
            hex::encode(self.remote_token)
        )
    }
}

fn open_key(shared: &[u8; KEY_LEN]) -> [u8; KEY_LEN] {
    let mut hasher = Sha256::new();
    hasher.update(b"open");
    hasher.update(shared);
    hasher.finalize().into()
}

fn open_auth(static_shared: &[u8; KEY_LEN], ephemeral: &[u8; KEY_LEN]) -> [u8; KEY_LEN] {
    let mut hasher = Sha256::new();
    hasher.update(b"auth");
    hasher.update(static_shared);
    hasher.update(ephemeral);
    hasher.finalize().into()
}

fn line_key(
    shared: &[u8; KEY_LEN],
    sender: &[u8; KEY_LEN],
    receiver: &[u8; KEY_LEN],
) -> [u8; KEY_LEN] {
    let mut hasher = Sha256::new();
    hasher.update(b"line");
    hasher.update(shared);
    hasher.update(sender);
    hasher.update(receiver);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opaque_keys(csids: &[Csid]) -> Keys {
        csids
            .iter()
            .map(|csid| (*csid, Key::from_public(vec![*csid; 32])))
            .collect()
    }

    #[test]
    fn csid_negotiation_picks_highest_common() {
        let a = opaque_keys(&[0x1a, 0x2a, 0x3a]);
        let b = opaque_keys(&[0x2a, 0x3a]);
        assert_eq!(select_csid(&a, &b), Some(0x3a));
        assert_eq!(select_csid(&b, &a), Some(0x3a));
    }

    #[test]
    fn csid_negotiation_fails_without_overlap() {
        let a = opaque_keys(&[0x1a]);
        let b = opaque_keys(&[0x2a]);
        assert_eq!(select_csid(&a, &b), None);
    }

    #[test]
    fn keys_json_round_trip() {
        let keys = opaque_keys(&[0x1a, 0x3a]);
        let json = serde_json::to_string(&keys).unwrap();
        assert!(json.contains("\"1a\""));
        assert!(json.contains("\"3a\""));
        let back: Keys = serde_json::from_str(&json).unwrap();
        assert_eq!(back, keys);
    }

    #[test]
    fn keys_json_rejects_bad_csid() {
        assert!(serde_json::from_str::<Keys>(r#"{"3aa":"0011"}"#).is_err());
        assert!(serde_json::from_str::<Keys>(r#"{"zz":"0011"}"#).is_err());
    }

    #[test]
    fn parts_header_round_trip() {
        let keys = PrivateKeys::generate().public_keys();
        let parts = keys.to_parts();
        let back = Parts::from_header(&parts.to_header()).unwrap();
        assert_eq!(back, parts);
    }

    #[test]
    fn open_round_trip_and_authentication() {
        let a_static = Key::generate_cs3a();
        let b_static = Key::generate_cs3a();
        let a_public = Key::from_public(a_static.public().to_vec());
        let b_public = Key::from_public(b_static.public().to_vec());

        let half = LineHalf::generate();
        let mut inner = Packet::new();
        inner.header.set("type", "open");
        inner.header.set("at", 12345);

        let body = half.seal_open(&a_static, &b_public, inner).unwrap();
        let envelope = open_open(CSID_3A, &b_static, &body).unwrap();

        assert_eq!(envelope.sender_ephemeral, *half.public());
        assert_eq!(envelope.sender_key.public(), a_public.public());
        assert_eq!(envelope.inner.header.get_str("type"), Some("open"));

        // A cryptogram sealed for B must not open with an unrelated key.
        let mallory = Key::generate_cs3a();
        assert!(open_open(CSID_3A, &mallory, &body).is_err());
    }

    #[test]
    fn line_keys_are_complementary() {
        let a = LineHalf::generate();
        let b = LineHalf::generate();

        let a_keys = a.derive(b.public());
        let b_keys = b.derive(a.public());

        assert_eq!(a_keys.local_token, b_keys.remote_token);
        assert_eq!(a_keys.remote_token, b_keys.local_token);

        let sealed = a_keys.encrypt(b"channel payload").unwrap();
        assert_eq!(b_keys.decrypt(&sealed).unwrap(), b"channel payload");

        // Tampering is detected.
        let mut corrupt = sealed.clone();
        let last = corrupt.len() - 1;
        corrupt[last] ^= 0x01;
        assert!(b_keys.decrypt(&corrupt).is_err());
    }

    #[test]
    fn tokens_derive_from_ephemeral_publics() {
        let half = LineHalf::generate();
        assert_eq!(half.token(), derive_token(half.public()));
    }
}
