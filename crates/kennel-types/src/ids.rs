//! File and contract identifiers.
//!
//! A [`Fid`] is `bech32("jklf", SHA-256(file bytes))`. Identical files collapse
//! to the same FID. A [`Cid`] is `bech32("jklc", SHA-256(owner ‖ sender ‖ fid))`
//! where the three components are concatenated as ASCII strings, so one file
//! may back many contracts.

use std::fmt;
use std::str::FromStr;

use bech32::{Bech32, Hrp};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{Result, TypesError, CID_PREFIX, FID_PREFIX};

const FID_HRP: Hrp = Hrp::parse_unchecked(FID_PREFIX);
const CID_HRP: Hrp = Hrp::parse_unchecked(CID_PREFIX);

fn encode(hrp: Hrp, digest: &[u8; 32]) -> Result<String> {
    bech32::encode::<Bech32>(hrp, digest).map_err(|e| TypesError::Bech32(e.to_string()))
}

fn decode(expected: &'static str, s: &str) -> Result<[u8; 32]> {
    let (hrp, data) = bech32::decode(s).map_err(|e| TypesError::Bech32(e.to_string()))?;
    if hrp.as_str() != expected {
        return Err(TypesError::WrongPrefix {
            expected,
            actual: hrp.to_string(),
        });
    }
    let len = data.len();
    data.try_into().map_err(|_| TypesError::DigestLength(len))
}

/// Content-addressed file identifier.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Fid(String);

impl Fid {
    /// Encode a SHA-256 digest of file contents as a FID.
    pub fn from_digest(digest: &[u8; 32]) -> Result<Self> {
        encode(FID_HRP, digest).map(Self)
    }

    /// Hash `data` and return its FID.
    pub fn for_bytes(data: &[u8]) -> Result<Self> {
        Self::from_digest(&Sha256::digest(data).into())
    }

    /// Parse and validate a bech32 FID string.
    pub fn parse(s: &str) -> Result<Self> {
        decode(FID_PREFIX, s)?;
        Ok(Self(s.to_string()))
    }

    /// The 32-byte SHA-256 digest this FID encodes.
    pub fn digest(&self) -> Result<[u8; 32]> {
        decode(FID_PREFIX, &self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Contract identifier.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Cid(String);

impl Cid {
    /// Derive the CID of the contract `owner` holds on `fid`, sent by `sender`.
    ///
    /// On upload the owner is the uploading account and the sender is this
    /// provider's address.
    pub fn derive(owner: &str, sender: &str, fid: &Fid) -> Result<Self> {
        let mut hasher = Sha256::new();
        hasher.update(owner.as_bytes());
        hasher.update(sender.as_bytes());
        hasher.update(fid.as_str().as_bytes());
        encode(CID_HRP, &hasher.finalize().into()).map(Self)
    }

    /// Parse and validate a bech32 CID string.
    pub fn parse(s: &str) -> Result<Self> {
        decode(CID_PREFIX, s)?;
        Ok(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

macro_rules! string_id_impls {
    ($ty:ty) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $ty {
            type Err = TypesError;

            fn from_str(s: &str) -> Result<Self> {
                Self::parse(s)
            }
        }

        impl TryFrom<String> for $ty {
            type Error = TypesError;

            fn try_from(s: String) -> Result<Self> {
                Self::parse(&s)
            }
        }

        impl From<$ty> for String {
            fn from(id: $ty) -> String {
                id.0
            }
        }

        impl AsRef<str> for $ty {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id_impls!(Fid);
string_id_impls!(Cid);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fid_has_prefix_and_roundtrips_digest() {
        let fid = Fid::for_bytes(b"hello, world\n").expect("fid");
        assert!(fid.as_str().starts_with("jklf1"));
        let digest: [u8; 32] = Sha256::digest(b"hello, world\n").into();
        assert_eq!(fid.digest().expect("digest"), digest);
    }

    #[test]
    fn test_identical_content_same_fid() {
        let a = Fid::for_bytes(b"same bytes").expect("fid");
        let b = Fid::for_bytes(b"same bytes").expect("fid");
        let c = Fid::for_bytes(b"other bytes").expect("fid");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_cid_depends_on_owner() {
        let fid = Fid::for_bytes(b"file").expect("fid");
        let a = Cid::derive("jkl1alice", "jkl1provider", &fid).expect("cid");
        let b = Cid::derive("jkl1bob", "jkl1provider", &fid).expect("cid");
        assert!(a.as_str().starts_with("jklc1"));
        assert_ne!(a, b);
        assert_eq!(a, Cid::derive("jkl1alice", "jkl1provider", &fid).expect("cid"));
    }

    #[test]
    fn test_cid_digest_is_concatenation() {
        let fid = Fid::for_bytes(b"file").expect("fid");
        let cid = Cid::derive("owner", "sender", &fid).expect("cid");
        let expected: [u8; 32] =
            Sha256::digest(format!("ownersender{fid}").as_bytes()).into();
        assert_eq!(decode(CID_PREFIX, cid.as_str()).expect("decode"), expected);
    }

    #[test]
    fn test_parse_rejects_wrong_prefix() {
        let fid = Fid::for_bytes(b"x").expect("fid");
        let err = Cid::parse(fid.as_str()).expect_err("fid is not a cid");
        assert!(matches!(err, TypesError::WrongPrefix { .. }));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(Fid::parse("not-bech32").is_err());
        assert!(Fid::parse("").is_err());
    }

    #[test]
    fn test_serde_is_plain_string() {
        let fid = Fid::for_bytes(b"serde").expect("fid");
        let json = serde_json::to_string(&fid).expect("serialize");
        assert_eq!(json, format!("\"{fid}\""));
        let back: Fid = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, fid);
        assert!(serde_json::from_str::<Fid>("\"jklc1bogus\"").is_err());
    }
}
