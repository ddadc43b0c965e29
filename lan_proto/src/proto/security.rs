//! The envelopes a message may travel in.
//!
//! Outbound, a message is optionally compressed and then optionally encrypted:
//! `Compressed { original_len: u32, zstd bytes }` then `Encrypted { mode: u8, counter: u64,
//! ciphertext }`. Inbound, envelopes are peeled until a plain message type remains.
use crate::constants::MAX_ENVELOPE_DEPTH;
use crate::error::NetworkError;
use crate::proto::message::{split_message_type, Message, MessageReader, MessageType};
use bytes::Bytes;
use lan_crypt::session_crypto::SessionCrypto;
use lan_types::errors::ErrorType;
use lan_types::proto::{CompressMode, EncryptMode, MessageReliability};

const ZSTD_LEVEL: i32 = 3;

/// Per-send delivery options
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct SendOptions {
    pub reliability: MessageReliability,
    pub encrypt: EncryptMode,
    pub compress: CompressMode,
}

impl SendOptions {
    pub const RELIABLE: SendOptions = SendOptions {
        reliability: MessageReliability::Reliable,
        encrypt: EncryptMode::None,
        compress: CompressMode::None,
    };

    pub const UNRELIABLE: SendOptions = SendOptions {
        reliability: MessageReliability::Unreliable,
        encrypt: EncryptMode::None,
        compress: CompressMode::None,
    };

    /// Reliable and sealed with the strong cipher. Engine traffic uses this
    pub const SECURE: SendOptions = SendOptions {
        reliability: MessageReliability::Reliable,
        encrypt: EncryptMode::Secure,
        compress: CompressMode::None,
    };

    pub const fn with_encryption(mut self, encrypt: EncryptMode) -> Self {
        self.encrypt = encrypt;
        self
    }

    pub const fn with_compression(mut self, compress: CompressMode) -> Self {
        self.compress = compress;
        self
    }

    pub const fn with_reliability(mut self, reliability: MessageReliability) -> Self {
        self.reliability = reliability;
        self
    }
}

/// A message with every envelope removed
#[derive(Debug)]
pub struct Unsealed {
    pub message_type: MessageType,
    pub reader: MessageReader,
    /// The strongest envelope the message arrived in
    pub encrypt_mode: EncryptMode,
    pub compressed: bool,
}

/// Wraps `message` according to `options`. Compression is skipped when it does not shrink the
/// message. Encryption requires `crypto`
pub(crate) fn seal(
    message: &Message,
    options: SendOptions,
    crypto: Option<&mut SessionCrypto>,
) -> Result<Bytes, NetworkError> {
    let mut current = Bytes::copy_from_slice(message.as_bytes());

    if options.compress == CompressMode::Zstd {
        let compressed = zstd::bulk::compress(&current, ZSTD_LEVEL)
            .map_err(|err| NetworkError::Generic(format!("Compression failed: {err}")))?;
        // type byte + u32 length
        if compressed.len() + 5 < current.len() {
            let mut envelope = Message::new(MessageType::Compressed);
            envelope
                .write(&(current.len() as u32))
                .write_raw(&compressed);
            current = envelope.freeze();
        }
    }

    if options.encrypt != EncryptMode::None {
        let crypto = crypto.ok_or_else(|| {
            NetworkError::Crypt(
                ErrorType::EncryptFail,
                "No session key is installed on this link".to_string(),
            )
        })?;
        let (counter, ciphertext) = crypto.encrypt(options.encrypt, &current)?;
        let mut envelope = Message::new(MessageType::Encrypted);
        envelope
            .write(&options.encrypt)
            .write(&counter)
            .write_raw(&ciphertext);
        current = envelope.freeze();
    }

    Ok(current)
}

/// Peels envelopes off `encoded`. Decompressed output is bounded by `max_message_length`
pub(crate) fn unseal(
    encoded: Bytes,
    mut crypto: Option<&mut SessionCrypto>,
    max_message_length: usize,
) -> Result<Unsealed, NetworkError> {
    let mut current = encoded;
    let mut encrypt_mode = EncryptMode::None;
    let mut compressed = false;

    for _ in 0..=MAX_ENVELOPE_DEPTH {
        let (message_type, mut reader) = split_message_type(current)?;
        match message_type {
            MessageType::Encrypted => {
                let mode: EncryptMode = reader.read()?;
                let counter: u64 = reader.read()?;
                let ciphertext = reader.read_rest();
                let crypto = crypto.as_deref_mut().ok_or_else(|| {
                    NetworkError::Crypt(
                        ErrorType::DecryptFail,
                        "Encrypted message on a link without a session key".to_string(),
                    )
                })?;
                current = Bytes::from(crypto.decrypt(mode, counter, &ciphertext)?);
                if mode == EncryptMode::Secure || encrypt_mode == EncryptMode::None {
                    encrypt_mode = mode;
                }
            }

            MessageType::Compressed => {
                let original_len = reader.read::<u32>()? as usize;
                if original_len == 0 || original_len > max_message_length {
                    return Err(NetworkError::MessageTooLong {
                        length: original_len,
                        max: max_message_length,
                    });
                }
                let decompressed = zstd::bulk::decompress(reader.remaining_slice(), original_len)
                    .map_err(|_| NetworkError::InvalidPacket("Bad compressed payload"))?;
                if decompressed.len() != original_len {
                    return Err(NetworkError::InvalidPacket("Decompressed length mismatch"));
                }
                current = Bytes::from(decompressed);
                compressed = true;
            }

            message_type => {
                return Ok(Unsealed {
                    message_type,
                    reader,
                    encrypt_mode,
                    compressed,
                })
            }
        }
    }

    Err(NetworkError::InvalidPacket("Envelopes nested too deeply"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use lan_crypt::session_crypto::Role;
    use lan_crypt::session_key::SessionKey;
    use lan_types::crypto::{StrongKeyLength, WeakKeyLength};
    use rstest::rstest;

    fn pair() -> (SessionCrypto, SessionCrypto) {
        let key = SessionKey::generate(StrongKeyLength::Aes256, WeakKeyLength::Bits256);
        (
            SessionCrypto::new(&key, Role::Initiator).unwrap(),
            SessionCrypto::new(&key, Role::Acceptor).unwrap(),
        )
    }

    #[rstest]
    #[case(EncryptMode::None, CompressMode::None)]
    #[case(EncryptMode::Secure, CompressMode::None)]
    #[case(EncryptMode::Fast, CompressMode::Zstd)]
    #[case(EncryptMode::Secure, CompressMode::Zstd)]
    fn sealed_messages_open_with_their_flags(
        #[case] encrypt: EncryptMode,
        #[case] compress: CompressMode,
    ) {
        let (mut local, mut remote) = pair();
        let message = Message::user(&[7u8; 512]);
        let options = SendOptions::RELIABLE
            .with_encryption(encrypt)
            .with_compression(compress);

        let sealed = seal(&message, options, Some(&mut local)).unwrap();
        let unsealed = unseal(sealed, Some(&mut remote), 4096).unwrap();
        assert_eq!(unsealed.message_type, MessageType::UserMessage);
        assert_eq!(unsealed.reader.remaining_slice(), &[7u8; 512][..]);
        assert_eq!(unsealed.encrypt_mode, encrypt);
        assert_eq!(unsealed.compressed, compress == CompressMode::Zstd);
    }

    #[test]
    fn replayed_frame_is_a_counter_mismatch() {
        let (mut local, mut remote) = pair();
        let sealed = seal(&Message::user(b"once"), SendOptions::SECURE, Some(&mut local)).unwrap();
        unseal(sealed.clone(), Some(&mut remote), 4096).unwrap();
        let err = unseal(sealed, Some(&mut remote), 4096).unwrap_err();
        assert_eq!(err.error_type(), ErrorType::CryptoCounterMismatch);
    }

    #[test]
    fn encryption_without_key_fails() {
        let err = seal(&Message::user(b"x"), SendOptions::SECURE, None).unwrap_err();
        assert_eq!(err.error_type(), ErrorType::EncryptFail);
    }

    #[test]
    fn decompression_is_bounded() {
        let message = Message::user(&[0u8; 2048]);
        let options = SendOptions::RELIABLE.with_compression(CompressMode::Zstd);
        let sealed = seal(&message, options, None).unwrap();
        assert!(sealed.len() < message.len());
        assert!(matches!(
            unseal(sealed, None, 1024),
            Err(NetworkError::MessageTooLong { .. })
        ));
    }
}
