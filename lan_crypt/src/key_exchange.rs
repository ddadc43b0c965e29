use crate::misc::CryptError;
use crate::session_key::SessionKey;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use lan_types::crypto::{AES_GCM_NONCE_LENGTH_BYTES, X25519_PUBLIC_KEY_LENGTH};
use rand::RngCore;
use sha3::{Digest, Sha3_256};
use x25519_dalek::{PublicKey, SharedSecret, StaticSecret};

const WRAP_KEY_LABEL: &[u8] = b"lan-session-key-wrap-v1";

/// The long-lived key pair of an accepting node. Its public half is sent in the connection hint
pub struct KeyExchangeSecret {
    secret: StaticSecret,
    public: PublicKey,
}

impl KeyExchangeSecret {
    pub fn generate() -> Self {
        let mut secret_bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut secret_bytes);
        let secret = StaticSecret::from(secret_bytes);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn public_key(&self) -> [u8; X25519_PUBLIC_KEY_LENGTH] {
        self.public.to_bytes()
    }

    /// Opens a key produced by [`wrap_session_key`] for this node's public key
    pub fn unwrap_session_key(&self, wrapped: &[u8]) -> Result<SessionKey, CryptError> {
        let header = X25519_PUBLIC_KEY_LENGTH + AES_GCM_NONCE_LENGTH_BYTES;
        if wrapped.len() <= header {
            return Err(CryptError::KeyExchange(format!(
                "Wrapped session key too short ({} bytes)",
                wrapped.len()
            )));
        }

        let mut ephemeral_public = [0u8; X25519_PUBLIC_KEY_LENGTH];
        ephemeral_public.copy_from_slice(&wrapped[..X25519_PUBLIC_KEY_LENGTH]);
        let nonce = Nonce::from_slice(&wrapped[X25519_PUBLIC_KEY_LENGTH..header]);
        let ciphertext = &wrapped[header..];

        let shared = self
            .secret
            .diffie_hellman(&PublicKey::from(ephemeral_public));
        let cipher = wrap_cipher(&shared)?;
        let plaintext = zeroize::Zeroizing::new(
            cipher
                .decrypt(nonce, ciphertext)
                .map_err(|err| CryptError::KeyExchange(err.to_string()))?,
        );

        SessionKey::from_bytes(&plaintext)
    }
}

/// Seals `key` for the holder of `recipient_public`. The output is
/// `ephemeral public key (32) || nonce (12) || ciphertext + tag`
pub fn wrap_session_key(
    recipient_public: &[u8; X25519_PUBLIC_KEY_LENGTH],
    key: &SessionKey,
) -> Result<Vec<u8>, CryptError> {
    let mut rng = rand::thread_rng();
    let mut ephemeral_bytes = [0u8; 32];
    rng.fill_bytes(&mut ephemeral_bytes);
    let ephemeral_secret = StaticSecret::from(ephemeral_bytes);
    let ephemeral_public = PublicKey::from(&ephemeral_secret);

    let shared = ephemeral_secret.diffie_hellman(&PublicKey::from(*recipient_public));
    let cipher = wrap_cipher(&shared)?;

    let mut nonce_bytes = [0u8; AES_GCM_NONCE_LENGTH_BYTES];
    rng.fill_bytes(&mut nonce_bytes);
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), key.to_bytes().as_slice())
        .map_err(|err| CryptError::KeyExchange(err.to_string()))?;

    let mut out = Vec::with_capacity(X25519_PUBLIC_KEY_LENGTH + nonce_bytes.len() + ciphertext.len());
    out.extend_from_slice(ephemeral_public.as_bytes());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

fn wrap_cipher(shared: &SharedSecret) -> Result<Aes256Gcm, CryptError> {
    let mut hasher = Sha3_256::new();
    hasher.update(WRAP_KEY_LABEL);
    hasher.update(shared.as_bytes());
    let wrap_key = zeroize::Zeroizing::new(<[u8; 32]>::from(hasher.finalize()));
    Aes256Gcm::new_from_slice(wrap_key.as_slice())
        .map_err(|err| CryptError::KeyExchange(err.to_string()))
}
