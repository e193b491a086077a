//! Ready store (per room, §3, §4.5): per-user {isReady, manuallyInitiated}.
//!
//! Grounded directly on the Go original's `mngr/ready/ready.go` `ReadyManager`.

use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReadyState {
    pub is_ready: bool,
    pub manually_initiated: bool,
}

impl Default for ReadyState {
    fn default() -> Self {
        Self {
            is_ready: false,
            manually_initiated: false,
        }
    }
}

#[derive(Debug, Default)]
pub struct ReadyStore {
    states: HashMap<String, ReadyState>,
}

impl ReadyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last-writer-wins: calling this twice with the same arguments leaves a
    /// single effective entry (§8 idempotence law).
    pub fn set_user_ready_state(&mut self, username: &str, is_ready: bool, manually_initiated: bool) {
        self.states.insert(
            username.to_string(),
            ReadyState {
                is_ready,
                manually_initiated,
            },
        );
    }

    pub fn get_user_ready_state(&self, username: &str) -> Option<ReadyState> {
        self.states.get(username).copied()
    }

    pub fn remove_user(&mut self, username: &str) {
        self.states.remove(username);
    }

    pub fn all(&self) -> &HashMap<String, ReadyState> {
        &self.states
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_false_false_on_first_read() {
        let store = ReadyStore::new();
        assert!(store.get_user_ready_state("alice").is_none());
    }

    #[test]
    fn repeated_identical_set_is_a_single_effective_update() {
        let mut store = ReadyStore::new();
        store.set_user_ready_state("alice", true, true);
        store.set_user_ready_state("alice", true, true);
        assert_eq!(
            store.get_user_ready_state("alice"),
            Some(ReadyState {
                is_ready: true,
                manually_initiated: true
            })
        );
    }

    #[test]
    fn removal_clears_the_entry() {
        let mut store = ReadyStore::new();
        store.set_user_ready_state("alice", true, false);
        store.remove_user("alice");
        assert!(store.get_user_ready_state("alice").is_none());
    }
}
