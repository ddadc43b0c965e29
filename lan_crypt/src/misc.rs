use std::fmt::{Display, Formatter};

/// Default Error type for this crate
pub enum CryptError<T = String> {
    /// Encrypt Error
    Encrypt(T),
    /// Decrypt Error
    Decrypt(T),
    /// The wrapped session key could not be produced or opened
    KeyExchange(T),
    /// A frame was sealed with a counter other than the one expected next
    CounterMismatch { expected: u64, received: u64 },
    /// Key material of an unsupported length
    BadKeyLength(usize),
    /// A cipher tier was requested that does not exist (e.g., encrypting with no encryption)
    BadEncryptMode,
}

impl<T> CryptError<T> {
    /// Use for converting to different types
    pub fn into_string(self) -> String
    where
        T: Into<String>,
    {
        match self {
            CryptError::Encrypt(s) | CryptError::Decrypt(s) | CryptError::KeyExchange(s) => {
                s.into()
            }
            CryptError::CounterMismatch { expected, received } => {
                format!("[CryptError] Counter mismatch. Expected {expected}, received {received}")
            }
            CryptError::BadKeyLength(len) => format!("[CryptError] Bad key length: {len}"),
            CryptError::BadEncryptMode => "[CryptError] Bad encryption mode".to_string(),
        }
    }

    pub fn as_str(&self) -> &str
    where
        T: AsRef<str>,
    {
        match self {
            CryptError::Encrypt(s) | CryptError::Decrypt(s) | CryptError::KeyExchange(s) => {
                s.as_ref()
            }
            CryptError::CounterMismatch { .. } => "[CryptError] Counter mismatch",
            CryptError::BadKeyLength(_) => "[CryptError] Bad key length",
            CryptError::BadEncryptMode => "[CryptError] Bad encryption mode",
        }
    }

    pub fn is_counter_mismatch(&self) -> bool {
        matches!(self, CryptError::CounterMismatch { .. })
    }
}

impl<T: AsRef<str>> std::fmt::Debug for CryptError<T> {
    fn fmt(&self, f: &mut Formatter) -> Result<(), std::fmt::Error> {
        match self {
            CryptError::CounterMismatch { expected, received } => write!(
                f,
                "[CryptError] Counter mismatch. Expected {expected}, received {received}"
            ),
            CryptError::BadKeyLength(len) => write!(f, "[CryptError] Bad key length: {len}"),
            _ => write!(f, "{}", self.as_str()),
        }
    }
}

impl<T: AsRef<str>> Display for CryptError<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

impl<T: AsRef<str>> std::error::Error for CryptError<T> {}
