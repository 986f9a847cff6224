//! Content hashing for the snapshot store.
//!
//! Every blob, manifest, and file state is identified by a single 256-bit
//! digest of its raw bytes, rendered as lowercase hex. There is exactly
//! one algorithm in use (no thread-local algorithm switch): the store's
//! self-verification guarantee depends on hash and content never
//! disagreeing about which algorithm produced them.

use std::fmt::Display;
use std::io;
use std::str::FromStr;

use ring::digest::{Context, Digest, SHA256};
use serde::{Deserialize, Serialize};

pub const CONTENT_HASH_HEX_LEN: usize = 64;

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    /// Hash a complete in-memory buffer.
    pub fn of_bytes(data: &[u8]) -> ContentHash {
        let digest = ring::digest::digest(&SHA256, data);
        ContentHash::from_digest(digest)
    }

    /// Hash a stream incrementally without buffering the whole input.
    pub fn of_reader(mut reader: impl io::Read) -> io::Result<ContentHash> {
        let mut ctx = Context::new(&SHA256);
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            ctx.update(&buf[..n]);
        }
        Ok(ContentHash::from_digest(ctx.finish()))
    }

    fn from_digest(digest: Digest) -> ContentHash {
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(digest.as_ref());
        ContentHash(bytes)
    }

    /// Verify that `data` hashes to this value; used on the read path of
    /// the content store to detect bit-rot.
    pub fn verify(&self, data: &[u8]) -> bool {
        ContentHash::of_bytes(data) == *self
    }

    /// First two hex characters, used for the content store's fan-out
    /// directory prefix.
    pub fn fan_out_prefix(&self) -> String {
        hex::encode(&self.0[..1])
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ContentHash({})", self.to_hex())
    }
}

impl Display for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl FromStr for ContentHash {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != CONTENT_HASH_HEX_LEN {
            return Err(format!(
                "invalid content hash length: got {}, expected {CONTENT_HASH_HEX_LEN}",
                s.len()
            ));
        }
        let bytes = hex::decode(s).map_err(|e| e.to_string())?;
        let mut out = [0u8; 32];
        out.copy_from_slice(&bytes);
        Ok(ContentHash(out))
    }
}

impl Serialize for ContentHash {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        ContentHash::from_str(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashes_known_value() {
        let h = ContentHash::of_bytes(b"Hello, world!");
        assert_eq!(
            h.to_hex(),
            "315f5bdb76d078c43b8ac0064e4a0164612b1fce77c869345bfc94c75894edd3"
        );
    }

    #[test]
    fn reader_matches_bytes() {
        let data = b"the quick brown fox jumps over the lazy dog";
        let from_bytes = ContentHash::of_bytes(data);
        let from_reader = ContentHash::of_reader(std::io::Cursor::new(data)).unwrap();
        assert_eq!(from_bytes, from_reader);
    }

    #[test]
    fn round_trips_through_hex() {
        let h = ContentHash::of_bytes(b"round trip");
        let parsed: ContentHash = h.to_hex().parse().unwrap();
        assert_eq!(h, parsed);
    }

    #[test]
    fn rejects_wrong_length() {
        assert!("deadbeef".parse::<ContentHash>().is_err());
    }

    #[test]
    fn verify_detects_tamper() {
        let h = ContentHash::of_bytes(b"original");
        assert!(h.verify(b"original"));
        assert!(!h.verify(b"tampered"));
    }

    #[test]
    fn fan_out_prefix_is_two_hex_chars() {
        let h = ContentHash::of_bytes(b"x");
        assert_eq!(h.fan_out_prefix().len(), 2);
    }
}
