use crate::misc::CryptError;
use crate::session_key::SessionKey;
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes128Gcm, Aes256Gcm};
use chacha20poly1305::ChaCha20Poly1305;
use lan_types::crypto::StrongKeyLength;
use lan_types::proto::EncryptMode;
use sha3::{Digest, Sha3_256};

const WEAK_KEY_LABEL: &[u8] = b"lan-weak-tier-v1";

/// Which end of a link this node is. The role tag is mixed into every nonce so that the two
/// directions of a link never share a nonce under the same key
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Role {
    /// The side that opened the socket and generated the session key
    Initiator,
    /// The side that accepted the socket
    Acceptor,
}

impl Role {
    const fn tag(self) -> u8 {
        match self {
            Role::Initiator => 0x49,
            Role::Acceptor => 0x41,
        }
    }

    const fn remote(self) -> Role {
        match self {
            Role::Initiator => Role::Acceptor,
            Role::Acceptor => Role::Initiator,
        }
    }
}

/// Sequence numbers of the two directions of a link
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct CryptoCounters {
    /// The counter the next outbound frame will be sealed with
    pub encrypt: u64,
    /// The counter the next inbound frame must carry
    pub decrypt: u64,
}

enum StrongCipher {
    Aes128(Box<Aes128Gcm>),
    Aes256(Box<Aes256Gcm>),
}

/// Seals and opens the frames of one link
pub struct SessionCrypto {
    strong: StrongCipher,
    weak: Box<ChaCha20Poly1305>,
    role: Role,
    counters: CryptoCounters,
}

impl SessionCrypto {
    pub fn new(key: &SessionKey, role: Role) -> Result<Self, CryptError> {
        let strong = match key.strong_key_length() {
            StrongKeyLength::Aes128 => StrongCipher::Aes128(Box::new(
                Aes128Gcm::new_from_slice(key.strong_material())
                    .map_err(|_| CryptError::BadKeyLength(key.strong_material().len()))?,
            )),
            StrongKeyLength::Aes256 => StrongCipher::Aes256(Box::new(
                Aes256Gcm::new_from_slice(key.strong_material())
                    .map_err(|_| CryptError::BadKeyLength(key.strong_material().len()))?,
            )),
        };

        let mut hasher = Sha3_256::new();
        hasher.update(WEAK_KEY_LABEL);
        hasher.update(key.weak_material());
        let weak_key = zeroize::Zeroizing::new(<[u8; 32]>::from(hasher.finalize()));
        let weak = ChaCha20Poly1305::new_from_slice(weak_key.as_slice())
            .map_err(|_| CryptError::BadKeyLength(weak_key.len()))?;

        Ok(Self {
            strong,
            weak: Box::new(weak),
            role,
            counters: CryptoCounters::default(),
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn counters(&self) -> CryptoCounters {
        self.counters
    }

    /// Seals `plaintext` with the next outbound counter, returning the counter used. The caller
    /// must transmit frames in the order they were sealed
    pub fn encrypt(
        &mut self,
        mode: EncryptMode,
        plaintext: &[u8],
    ) -> Result<(u64, Vec<u8>), CryptError> {
        let counter = self.counters.encrypt;
        let nonce = nonce_for(self.role, counter);
        let ciphertext = match mode {
            EncryptMode::None => return Err(CryptError::BadEncryptMode),
            EncryptMode::Secure => match &self.strong {
                StrongCipher::Aes128(cipher) => cipher.encrypt(GenericArray::from_slice(&nonce), plaintext),
                StrongCipher::Aes256(cipher) => cipher.encrypt(GenericArray::from_slice(&nonce), plaintext),
            },
            EncryptMode::Fast => self.weak.encrypt(GenericArray::from_slice(&nonce), plaintext),
        }
        .map_err(|err| CryptError::Encrypt(err.to_string()))?;

        self.counters.encrypt = counter.wrapping_add(1);
        Ok((counter, ciphertext))
    }

    /// Opens a frame sealed by the remote end. `counter` must be exactly the next expected
    /// inbound counter
    pub fn decrypt(
        &mut self,
        mode: EncryptMode,
        counter: u64,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CryptError> {
        if counter != self.counters.decrypt {
            return Err(CryptError::CounterMismatch {
                expected: self.counters.decrypt,
                received: counter,
            });
        }

        let nonce = nonce_for(self.role.remote(), counter);
        let plaintext = match mode {
            EncryptMode::None => return Err(CryptError::BadEncryptMode),
            EncryptMode::Secure => match &self.strong {
                StrongCipher::Aes128(cipher) => cipher.decrypt(GenericArray::from_slice(&nonce), ciphertext),
                StrongCipher::Aes256(cipher) => cipher.decrypt(GenericArray::from_slice(&nonce), ciphertext),
            },
            EncryptMode::Fast => self.weak.decrypt(GenericArray::from_slice(&nonce), ciphertext),
        }
        .map_err(|err| CryptError::Decrypt(err.to_string()))?;

        self.counters.decrypt = counter.wrapping_add(1);
        Ok(plaintext)
    }
}

fn nonce_for(role: Role, counter: u64) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[0] = role.tag();
    nonce[4..].copy_from_slice(&counter.to_le_bytes());
    nonce
}
