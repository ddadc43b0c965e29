pub mod prelude {
    pub use crate::crypto::*;
    pub use crate::errors::{ErrorCategory, ErrorType};
    pub use crate::proto::*;
}

pub mod crypto;
pub mod errors;
pub mod proto;
