//! Presence reconciliation.
//!
//! The server tracks who is connected to a room topic and pushes a full
//! `presence_state` on join followed by incremental `presence_diff`s. A
//! [`PresenceReconciler`] folds those into its own state and hands back the
//! reconciled [`Membership`]; the room session only ever sees that output.
//!
//! [`PhoenixPresence`] is the default reconciler. Each presence key (the
//! player's identity) owns a list of metas, one per connection, identified by
//! `phx_ref`. A key stays present while it has at least one meta.

use tracing::debug;

use crate::protocol::{PresenceDiff, PresenceEntry, PresenceMap};
use crate::room::{Member, Membership};

/// Turns raw presence payloads into a membership mapping.
pub trait PresenceReconciler: Send + 'static {
    /// Replace the tracked state with a full snapshot.
    fn reconcile_snapshot(&mut self, snapshot: PresenceMap) -> Membership;

    /// Apply joins, then leaves, to the tracked state.
    fn reconcile_diff(&mut self, diff: PresenceDiff) -> Membership;
}

/// Default [`PresenceReconciler`] following Phoenix presence semantics.
#[derive(Debug, Clone, Default)]
pub struct PhoenixPresence {
    state: PresenceMap,
}

impl PhoenixPresence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw tracked state.
    pub fn state(&self) -> &PresenceMap {
        &self.state
    }

    /// Current membership, one member per key.
    pub fn membership(&self) -> Membership {
        self.state
            .iter()
            .map(|(identity, entry)| {
                let is_owner = entry.metas.iter().any(|meta| meta.is_owner);
                (identity.clone(), Member::new(identity.clone(), is_owner))
            })
            .collect()
    }

    fn join(&mut self, key: String, joined: PresenceEntry) {
        let entry = self.state.entry(key).or_default();
        entry
            .metas
            .retain(|meta| !joined.metas.iter().any(|j| j.phx_ref == meta.phx_ref));
        entry.metas.extend(joined.metas);
    }

    fn leave(&mut self, key: &str, left: &PresenceEntry) {
        let Some(entry) = self.state.get_mut(key) else {
            debug!(key, "presence leave for unknown key");
            return;
        };
        entry
            .metas
            .retain(|meta| !left.metas.iter().any(|l| l.phx_ref == meta.phx_ref));
        if entry.metas.is_empty() {
            self.state.remove(key);
        }
    }
}

impl PresenceReconciler for PhoenixPresence {
    fn reconcile_snapshot(&mut self, snapshot: PresenceMap) -> Membership {
        let joined = snapshot
            .keys()
            .filter(|k| !self.state.contains_key(*k))
            .count();
        let left = self
            .state
            .keys()
            .filter(|k| !snapshot.contains_key(*k))
            .count();
        debug!(joined, left, total = snapshot.len(), "presence snapshot");
        self.state = snapshot;
        self.membership()
    }

    fn reconcile_diff(&mut self, diff: PresenceDiff) -> Membership {
        debug!(
            joins = diff.joins.len(),
            leaves = diff.leaves.len(),
            "presence diff"
        );
        for (key, entry) in diff.joins {
            self.join(key, entry);
        }
        for (key, entry) in &diff.leaves {
            self.leave(key, entry);
        }
        self.membership()
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::protocol::PresenceMeta;

    fn entry(refs: &[&str], is_owner: bool) -> PresenceEntry {
        PresenceEntry {
            metas: refs.iter().map(|r| PresenceMeta::new(*r, is_owner)).collect(),
        }
    }

    fn map(items: &[(&str, &str)]) -> PresenceMap {
        items
            .iter()
            .map(|(k, r)| ((*k).to_string(), entry(&[*r], *k == "alice")))
            .collect()
    }

    fn names(membership: &Membership) -> Vec<&str> {
        membership.keys().map(String::as_str).collect()
    }

    #[test]
    fn snapshot_replaces_state() {
        let mut presence = PhoenixPresence::new();
        presence.reconcile_snapshot(map(&[("alice", "a1"), ("bob", "b1")]));
        let m = presence.reconcile_snapshot(map(&[("bob", "b1"), ("carol", "c1")]));
        assert_eq!(names(&m), vec!["bob", "carol"]);
    }

    #[test]
    fn owner_flag_comes_from_metas() {
        let mut presence = PhoenixPresence::new();
        let m = presence.reconcile_snapshot(map(&[("alice", "a1"), ("bob", "b1")]));
        assert!(m["alice"].is_owner);
        assert!(!m["bob"].is_owner);
    }

    #[test]
    fn diff_adds_joins_and_removes_leaves() {
        let mut presence = PhoenixPresence::new();
        presence.reconcile_snapshot(map(&[("alice", "a1"), ("bob", "b1")]));
        let m = presence.reconcile_diff(PresenceDiff {
            joins: map(&[("carol", "c1")]),
            leaves: map(&[("bob", "b1")]),
        });
        assert_eq!(names(&m), vec!["alice", "carol"]);
    }

    #[test]
    fn key_with_remaining_connection_stays_present() {
        let mut presence = PhoenixPresence::new();
        presence.reconcile_snapshot(map(&[("bob", "b1")]));
        presence.reconcile_diff(PresenceDiff {
            joins: map(&[("bob", "b2")]),
            leaves: PresenceMap::new(),
        });
        assert_eq!(presence.state()["bob"].metas.len(), 2);

        let m = presence.reconcile_diff(PresenceDiff {
            joins: PresenceMap::new(),
            leaves: map(&[("bob", "b1")]),
        });
        assert_eq!(names(&m), vec!["bob"]);
        assert_eq!(presence.state()["bob"].metas[0].phx_ref, "b2");
    }

    #[test]
    fn rejoin_with_same_ref_does_not_duplicate_meta() {
        let mut presence = PhoenixPresence::new();
        presence.reconcile_snapshot(map(&[("bob", "b1")]));
        presence.reconcile_diff(PresenceDiff {
            joins: map(&[("bob", "b1")]),
            leaves: PresenceMap::new(),
        });
        assert_eq!(presence.state()["bob"].metas.len(), 1);
    }

    #[test]
    fn leave_for_unknown_key_is_ignored() {
        let mut presence = PhoenixPresence::new();
        presence.reconcile_snapshot(map(&[("alice", "a1")]));
        let m = presence.reconcile_diff(PresenceDiff {
            joins: PresenceMap::new(),
            leaves: map(&[("ghost", "g1")]),
        });
        assert_eq!(names(&m), vec!["alice"]);
    }

    #[test]
    fn join_and_leave_of_same_key_in_one_diff() {
        // Joins are applied before leaves, so a reconnect (new ref joins,
        // old ref leaves) keeps the key present.
        let mut presence = PhoenixPresence::new();
        presence.reconcile_snapshot(map(&[("bob", "b1")]));
        let m = presence.reconcile_diff(PresenceDiff {
            joins: map(&[("bob", "b2")]),
            leaves: map(&[("bob", "b1")]),
        });
        assert_eq!(names(&m), vec!["bob"]);
        assert_eq!(presence.state()["bob"].metas.len(), 1);
    }

    #[test]
    fn membership_matches_snapshot_plus_diffs_in_order() {
        let mut presence = PhoenixPresence::new();
        presence.reconcile_snapshot(map(&[("alice", "a1")]));
        for (join, leave) in [("bob", "alice"), ("carol", "bob"), ("alice", "carol")] {
            let leave_ref = format!("{}1", &leave[..1]);
            let join_ref = format!("{}1", &join[..1]);
            presence.reconcile_diff(PresenceDiff {
                joins: map(&[(join, join_ref.as_str())]),
                leaves: map(&[(leave, leave_ref.as_str())]),
            });
        }
        assert_eq!(names(&presence.membership()), vec!["alice"]);
    }
}
