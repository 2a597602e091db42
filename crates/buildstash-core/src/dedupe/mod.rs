//! Request deduplication layers
//!
//! Two independent mechanisms keyed by `"<cmd>:<hex-action-id>"`:
//!
//! - [`SingleFlight`] collapses concurrent identical calls inside one
//!   process into a single execution whose result all waiters share.
//! - [`FsLock`] serializes executions for the same key across sibling
//!   processes with advisory filesystem locks. It provides mutual exclusion
//!   only; each caller that acquires the lock runs the operation itself.

mod fs_lock;
mod single_flight;

pub use fs_lock::FsLock;
pub use single_flight::SingleFlight;

/// Dedup key for a command against an action ID.
#[must_use]
pub fn flight_key(command: &str, action_id: &[u8]) -> String {
    format!("{command}:{}", hex::encode(action_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_separate_commands_for_the_same_action() {
        let id = [0xde, 0xad];
        assert_eq!(flight_key("get", &id), "get:dead");
        assert_eq!(flight_key("put", &id), "put:dead");
        assert_ne!(flight_key("get", &id), flight_key("put", &id));
    }
}
