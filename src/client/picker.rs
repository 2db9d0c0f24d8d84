//! Per-call connection selection.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::error::{Error, Result};

/// Partitions ready connections into a leader and followers and picks one
/// per call: writes (and any call while no follower is ready) go to the
/// leader, reads rotate over the followers.
///
/// The rotation counter is process-wide and atomic; the follower count is
/// re-read under the read lock on every pick, so a reconfiguration that
/// shrinks the list cannot over-index.
pub struct Picker<T> {
    state: RwLock<PickerState<T>>,
    curr: AtomicU64,
}

struct PickerState<T> {
    leader: Option<T>,
    followers: Vec<T>,
}

impl<T: Clone> Picker<T> {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(PickerState {
                leader: None,
                followers: Vec::new(),
            }),
            curr: AtomicU64::new(0),
        }
    }

    /// Replaces the ready set. `conns` pairs each connection with its
    /// `is_leader` attribute from the resolver.
    pub fn rebuild(&self, conns: Vec<(T, bool)>) {
        let mut leader = None;
        let mut followers = Vec::new();
        for (conn, is_leader) in conns {
            if is_leader {
                leader = Some(conn);
            } else {
                followers.push(conn);
            }
        }
        *self.state.write() = PickerState { leader, followers };
    }

    /// Picks a connection for the full method name of an outbound call.
    pub fn pick(&self, method: &str) -> Result<T> {
        let state = self.state.read();

        let picked = if method.contains("Set") || state.followers.is_empty() {
            state.leader.clone()
        } else if method.contains("Get") {
            let turn = self.curr.fetch_add(1, Ordering::Relaxed);
            let idx = (turn % state.followers.len() as u64) as usize;
            state.followers.get(idx).cloned()
        } else {
            None
        };

        picked.ok_or(Error::NoSubConnAvailable)
    }
}

impl<T: Clone> Default for Picker<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SET_METHOD: &str = "/cachet.cache.Cache/Set";
    const GET_METHOD: &str = "/cachet.cache.Cache/Get";

    fn ready_picker() -> Picker<&'static str> {
        let picker = Picker::new();
        picker.rebuild(vec![("leader", true), ("follower-1", false), ("follower-2", false)]);
        picker
    }

    #[test]
    fn unbuilt_picker_has_no_subconn() {
        let picker: Picker<&str> = Picker::new();
        for method in [SET_METHOD, GET_METHOD] {
            assert!(matches!(
                picker.pick(method),
                Err(Error::NoSubConnAvailable)
            ));
        }
    }

    #[test]
    fn writes_always_go_to_the_leader() {
        let picker = ready_picker();
        for _ in 0..10 {
            assert_eq!(picker.pick(SET_METHOD).unwrap(), "leader");
        }
    }

    #[test]
    fn reads_cycle_through_followers() {
        let picker = ready_picker();
        for turn in 0..10 {
            let expected = if turn % 2 == 0 { "follower-1" } else { "follower-2" };
            assert_eq!(picker.pick(GET_METHOD).unwrap(), expected);
        }
    }

    #[test]
    fn reads_fall_back_to_the_leader_without_followers() {
        let picker = Picker::new();
        picker.rebuild(vec![("leader", true)]);
        assert_eq!(picker.pick(GET_METHOD).unwrap(), "leader");
    }

    #[test]
    fn leaderless_set_is_unavailable() {
        let picker = Picker::new();
        picker.rebuild(vec![("follower-1", false)]);
        assert!(matches!(
            picker.pick(SET_METHOD),
            Err(Error::NoSubConnAvailable)
        ));
    }
}
