//! NIP-19 bech32 identities carried in subdomain labels.

use std::fmt;

use bech32::{Bech32, Hrp};

const NPUB_HRP: Hrp = Hrp::parse_unchecked("npub");
const NPROFILE_HRP: Hrp = Hrp::parse_unchecked("nprofile");

const TLV_SPECIAL: u8 = 0;
const TLV_RELAY: u8 = 1;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("bech32 decoding failed: {0}")]
    Bech32(String),
    #[error("unexpected prefix '{found}', expected '{expected}'")]
    WrongPrefix { expected: String, found: String },
    #[error("public key must be 32 bytes, got {0}")]
    KeyLength(usize),
    #[error("truncated TLV entry at offset {0}")]
    TruncatedTlv(usize),
    #[error("relay URL is not valid UTF-8")]
    RelayEncoding,
    #[error("profile pointer has no public key")]
    MissingKey,
}

/// A 32-byte x-only public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey([u8; 32]);

impl PublicKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, IdentityError> {
        let key: [u8; 32] = bytes
            .try_into()
            .map_err(|_| IdentityError::KeyLength(bytes.len()))?;
        Ok(Self(key))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Canonical `npub1…` encoding of this key.
    pub fn to_npub(&self) -> Result<String, IdentityError> {
        bech32::encode::<Bech32>(NPUB_HRP, &self.0)
            .map_err(|err| IdentityError::Bech32(err.to_string()))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PublicKey").field(&self.to_hex()).finish()
    }
}

/// Public key plus relay hints decoded from an `nprofile1…` string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfilePointer {
    pub public_key: PublicKey,
    pub relays: Vec<String>,
}

fn decode_with_prefix(encoded: &str, expected: Hrp) -> Result<Vec<u8>, IdentityError> {
    let (hrp, data) =
        bech32::decode(encoded).map_err(|err| IdentityError::Bech32(err.to_string()))?;
    if hrp != expected {
        return Err(IdentityError::WrongPrefix {
            expected: expected.to_string(),
            found: hrp.to_string(),
        });
    }
    Ok(data)
}

pub fn decode_npub(encoded: &str) -> Result<PublicKey, IdentityError> {
    let data = decode_with_prefix(encoded, NPUB_HRP)?;
    PublicKey::from_bytes(&data)
}

pub fn decode_nprofile(encoded: &str) -> Result<ProfilePointer, IdentityError> {
    let data = decode_with_prefix(encoded, NPROFILE_HRP)?;

    let mut public_key = None;
    let mut relays = Vec::new();
    let mut offset = 0;
    while offset < data.len() {
        if offset + 2 > data.len() {
            return Err(IdentityError::TruncatedTlv(offset));
        }
        let kind = data[offset];
        let len = data[offset + 1] as usize;
        let start = offset + 2;
        let end = start + len;
        if end > data.len() {
            return Err(IdentityError::TruncatedTlv(offset));
        }
        let value = &data[start..end];
        match kind {
            TLV_SPECIAL => public_key = Some(PublicKey::from_bytes(value)?),
            TLV_RELAY => {
                let relay =
                    std::str::from_utf8(value).map_err(|_| IdentityError::RelayEncoding)?;
                relays.push(relay.to_string());
            }
            // Unknown TLV types are reserved for future use.
            _ => {}
        }
        offset = end;
    }

    Ok(ProfilePointer {
        public_key: public_key.ok_or(IdentityError::MissingKey)?,
        relays,
    })
}
