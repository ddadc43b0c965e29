use serde::{Deserialize, Serialize};

pub const CHA_CHA_NONCE_LENGTH_BYTES: usize = 12;
pub const AES_GCM_NONCE_LENGTH_BYTES: usize = 12;
pub const AEAD_TAG_LENGTH_BYTES: usize = 16;
pub const X25519_PUBLIC_KEY_LENGTH: usize = 32;

/// Key length of the strong (AES-GCM) tier of a session key
#[derive(
    Copy,
    Clone,
    Debug,
    Default,
    Eq,
    PartialEq,
    Hash,
    Serialize,
    Deserialize,
    strum::EnumString,
    strum::EnumIter,
    strum::Display,
)]
#[repr(u8)]
pub enum StrongKeyLength {
    #[strum(ascii_case_insensitive)]
    Aes128 = 0,
    #[default]
    #[strum(ascii_case_insensitive)]
    Aes256 = 1,
}

impl StrongKeyLength {
    pub const fn bytes(&self) -> usize {
        match self {
            Self::Aes128 => 16,
            Self::Aes256 => 32,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Aes128),
            1 => Some(Self::Aes256),
            _ => None,
        }
    }
}

/// Length of the random material backing the weak (fast) tier of a session key. The material is
/// folded into a ChaCha20-Poly1305 key, so longer material does not lengthen the cipher key; it
/// only widens the secret both sides derive from
#[derive(
    Copy,
    Clone,
    Debug,
    Default,
    Eq,
    PartialEq,
    Hash,
    Serialize,
    Deserialize,
    strum::EnumString,
    strum::EnumIter,
    strum::Display,
)]
#[repr(u8)]
pub enum WeakKeyLength {
    Bits128 = 0,
    Bits256 = 1,
    #[default]
    Bits512 = 2,
}

impl WeakKeyLength {
    pub const fn bytes(&self) -> usize {
        match self {
            Self::Bits128 => 16,
            Self::Bits256 => 32,
            Self::Bits512 => 64,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Bits128),
            1 => Some(Self::Bits256),
            2 => Some(Self::Bits512),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use strum::IntoEnumIterator;

    #[test]
    fn key_lengths_round_trip_through_their_tags() {
        for len in StrongKeyLength::iter() {
            assert_eq!(StrongKeyLength::from_u8(len as u8), Some(len));
        }
        for len in WeakKeyLength::iter() {
            assert_eq!(WeakKeyLength::from_u8(len as u8), Some(len));
        }
        assert_eq!(StrongKeyLength::from_u8(9), None);
    }

    #[test]
    fn strong_key_length_parses_case_insensitive() {
        assert_eq!(
            StrongKeyLength::from_str("aes128").unwrap(),
            StrongKeyLength::Aes128
        );
        assert_eq!(StrongKeyLength::Aes256.bytes(), 32);
    }
}
