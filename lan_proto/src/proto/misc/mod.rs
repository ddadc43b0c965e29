pub mod use_count;

use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Display, Formatter};

/// Identifies one connection instance. Unlike a [`HostId`](lan_types::proto::HostId), a ticket
/// is never reused, so a reconnect always gets a fresh one
#[derive(Copy, Clone, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct Ticket(pub u128);

impl Ticket {
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().as_u128())
    }
}

impl Debug for Ticket {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Ticket({})", self.0)
    }
}

impl Display for Ticket {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u128> for Ticket {
    fn from(value: u128) -> Self {
        Self(value)
    }
}
