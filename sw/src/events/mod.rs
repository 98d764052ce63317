//! Event system: the `swarm.*` vocabulary and the broadcast bus

mod bus;
mod types;

pub use bus::{DEFAULT_CHANNEL_CAPACITY, EventBus};
pub use types::SwarmEvent;
