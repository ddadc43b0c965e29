//! Session security for the LAN RPC engine.
//!
//! The accepting side of every link owns a [`KeyExchangeSecret`] and publishes its public half.
//! The connecting side generates a random [`SessionKey`] (a strong AES-GCM tier plus weak key
//! material for a fast ChaCha20-Poly1305 tier), wraps it for the acceptor and sends it. Both
//! ends then build a [`SessionCrypto`], which carries one monotonically increasing counter per
//! direction; a frame that arrives out of counter order is rejected.
#![forbid(unsafe_code)]

pub mod prelude {
    pub use crate::key_exchange::{wrap_session_key, KeyExchangeSecret};
    pub use crate::misc::CryptError;
    pub use crate::session_crypto::{CryptoCounters, Role, SessionCrypto};
    pub use crate::session_key::SessionKey;
}

pub mod key_exchange;
pub mod misc;
pub mod session_crypto;
pub mod session_key;

pub use prelude::*;
