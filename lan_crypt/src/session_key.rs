use crate::misc::CryptError;
use lan_types::crypto::{StrongKeyLength, WeakKeyLength};
use rand::RngCore;
use std::fmt::{Debug, Formatter};
use zeroize::Zeroizing;

/// The two-tier symmetric key of one link. Material is wiped from memory on drop
#[derive(Clone)]
pub struct SessionKey {
    strong: Zeroizing<Vec<u8>>,
    weak: Zeroizing<Vec<u8>>,
}

impl SessionKey {
    /// Fills both tiers with fresh random material
    pub fn generate(strong_len: StrongKeyLength, weak_len: WeakKeyLength) -> Self {
        let mut rng = rand::thread_rng();
        let mut strong = Zeroizing::new(vec![0u8; strong_len.bytes()]);
        let mut weak = Zeroizing::new(vec![0u8; weak_len.bytes()]);
        rng.fill_bytes(strong.as_mut_slice());
        rng.fill_bytes(weak.as_mut_slice());
        Self { strong, weak }
    }

    pub fn from_parts(strong: &[u8], weak: &[u8]) -> Result<Self, CryptError> {
        Self::strong_len_of(strong.len())?;
        Self::weak_len_of(weak.len())?;
        Ok(Self {
            strong: Zeroizing::new(strong.to_vec()),
            weak: Zeroizing::new(weak.to_vec()),
        })
    }

    pub fn strong_material(&self) -> &[u8] {
        &self.strong
    }

    pub fn weak_material(&self) -> &[u8] {
        &self.weak
    }

    pub fn strong_key_length(&self) -> StrongKeyLength {
        // lengths are validated on construction
        Self::strong_len_of(self.strong.len()).unwrap_or_default()
    }

    pub fn weak_key_length(&self) -> WeakKeyLength {
        Self::weak_len_of(self.weak.len()).unwrap_or_default()
    }

    /// `[strong len][strong][weak len][weak]`
    pub fn to_bytes(&self) -> Zeroizing<Vec<u8>> {
        let mut out = Zeroizing::new(Vec::with_capacity(2 + self.strong.len() + self.weak.len()));
        out.push(self.strong.len() as u8);
        out.extend_from_slice(&self.strong);
        out.push(self.weak.len() as u8);
        out.extend_from_slice(&self.weak);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptError> {
        let (strong_len, rest) = bytes
            .split_first()
            .ok_or(CryptError::BadKeyLength(0))?;
        let strong_len = *strong_len as usize;
        if rest.len() < strong_len + 1 {
            return Err(CryptError::BadKeyLength(rest.len()));
        }

        let (strong, rest) = rest.split_at(strong_len);
        let (weak_len, weak) = rest
            .split_first()
            .ok_or(CryptError::BadKeyLength(0))?;
        if weak.len() != *weak_len as usize {
            return Err(CryptError::BadKeyLength(weak.len()));
        }

        Self::from_parts(strong, weak)
    }

    fn strong_len_of(len: usize) -> Result<StrongKeyLength, CryptError> {
        match len {
            16 => Ok(StrongKeyLength::Aes128),
            32 => Ok(StrongKeyLength::Aes256),
            n => Err(CryptError::BadKeyLength(n)),
        }
    }

    fn weak_len_of(len: usize) -> Result<WeakKeyLength, CryptError> {
        match len {
            16 => Ok(WeakKeyLength::Bits128),
            32 => Ok(WeakKeyLength::Bits256),
            64 => Ok(WeakKeyLength::Bits512),
            n => Err(CryptError::BadKeyLength(n)),
        }
    }
}

impl Debug for SessionKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "SessionKey({}, {})",
            self.strong_key_length(),
            self.weak_key_length()
        )
    }
}

impl PartialEq for SessionKey {
    fn eq(&self, other: &Self) -> bool {
        self.strong.as_slice() == other.strong.as_slice()
            && self.weak.as_slice() == other.weak.as_slice()
    }
}

impl Eq for SessionKey {}
