//! CRDT-backed document replica.
//!
//! The sync engine only sees the [`Replica`] trait: merge foreign bytes,
//! serialize full state, mutate locally, and publish change notifications.
//! [`YrsReplica`] is the production implementation on top of `yrs`, which
//! speaks the same v1 update encoding as Yjs peers.
//!
//! ```text
//! local edit ──► insert/delete ──► ReplicaChange { origin: Local }  ──► broadcaster
//! network    ──► apply         ──► ReplicaChange { origin: Remote } ──► (suppressed)
//! ```
//!
//! Reference: Shapiro et al., "Conflict-free Replicated Data Types" (2011)

use tokio::sync::mpsc;
use yrs::updates::decoder::Decode;
use yrs::{
    Doc, GetString, OffsetKind, Options, ReadTxn, StateVector, Text, TextRef, Transact, Update,
};

/// Name of the root text type shared by every client of a session.
pub const TEXT_ROOT: &str = "content";

/// Where a replica mutation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Produced by this client's own edit.
    Local,
    /// Merged from bytes received over the network.
    Remote,
}

/// Change notification: the minimal delta plus its origin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaChange {
    pub delta: Vec<u8>,
    pub origin: Origin,
}

pub type ChangeReceiver = mpsc::UnboundedReceiver<ReplicaChange>;

/// Replica errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReplicaError {
    #[error("Malformed update bytes: {0}")]
    Decode(String),
    #[error("Update rejected by CRDT engine: {0}")]
    Apply(String),
    #[error("Range {index}..{end} out of bounds for text of length {len}")]
    OutOfRange { index: usize, end: usize, len: usize },
}

/// Fan-out of change notifications to any number of subscribers.
///
/// Dropped receivers are pruned on the next emit.
#[derive(Debug, Default)]
pub struct ChangeFeed {
    subscribers: Vec<mpsc::UnboundedSender<ReplicaChange>>,
}

impl ChangeFeed {
    /// Add a subscriber; it sees every change emitted from now on.
    pub fn subscribe(&mut self) -> ChangeReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.push(tx);
        rx
    }

    /// Deliver `change` to every live subscriber.
    pub fn emit(&mut self, change: ReplicaChange) {
        self.subscribers.retain(|tx| tx.send(change.clone()).is_ok());
    }

    /// Live subscribers as of the last emit.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

/// Capability the sync engine needs from a CRDT document.
///
/// Positions are counted in `char`s of the visible text.
pub trait Replica {
    /// Merge update bytes. Must be commutative and idempotent.
    fn apply(&mut self, update: &[u8], origin: Origin) -> Result<(), ReplicaError>;

    /// Serialize the whole document, suitable for seeding a new joiner.
    fn encode_full_state(&self) -> Vec<u8>;

    /// Plain-text projection.
    fn text(&self) -> String;

    /// Length of the visible text in chars.
    fn char_len(&self) -> usize {
        self.text().chars().count()
    }

    /// Insert `chunk` before the char at `index`.
    fn insert(&mut self, index: usize, chunk: &str) -> Result<(), ReplicaError>;

    /// Remove `len` chars starting at `index`.
    fn delete(&mut self, index: usize, len: usize) -> Result<(), ReplicaError>;

    /// Register for change notifications.
    fn subscribe(&mut self) -> ChangeReceiver;

    /// Replace the visible text with `new_text` using one range delete and
    /// one positional insert over the differing middle section, so that
    /// concurrent edits elsewhere in the document survive the merge.
    fn replace_text(&mut self, new_text: &str) -> Result<(), ReplicaError> {
        let Some(splice) = Splice::between(&self.text(), new_text) else {
            return Ok(());
        };
        if splice.delete_len > 0 {
            self.delete(splice.index, splice.delete_len)?;
        }
        if !splice.insert.is_empty() {
            self.insert(splice.index, &splice.insert)?;
        }
        Ok(())
    }
}

/// Minimal edit turning one string into another.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Splice {
    pub index: usize,
    pub delete_len: usize,
    pub insert: String,
}

impl Splice {
    /// Common-prefix/common-suffix diff, in chars. `None` if equal.
    pub fn between(old: &str, new: &str) -> Option<Splice> {
        if old == new {
            return None;
        }
        let old: Vec<char> = old.chars().collect();
        let new: Vec<char> = new.chars().collect();

        let prefix = old.iter().zip(&new).take_while(|(a, b)| a == b).count();
        let max_suffix = old.len().min(new.len()) - prefix;
        let suffix = old
            .iter()
            .rev()
            .zip(new.iter().rev())
            .take(max_suffix)
            .take_while(|(a, b)| a == b)
            .count();

        Some(Splice {
            index: prefix,
            delete_len: old.len() - prefix - suffix,
            insert: new[prefix..new.len() - suffix].iter().collect(),
        })
    }
}

/// Byte offset of the `char_index`-th char, or `None` past the end.
fn byte_offset(text: &str, char_index: usize) -> Option<usize> {
    if char_index == 0 {
        return Some(0);
    }
    text.char_indices()
        .map(|(offset, _)| offset)
        .chain(std::iter::once(text.len()))
        .nth(char_index)
}

/// `yrs`-backed replica holding a single root text.
pub struct YrsReplica {
    doc: Doc,
    text: TextRef,
    feed: ChangeFeed,
}

impl YrsReplica {
    /// Empty document.
    pub fn new() -> Self {
        let doc = Doc::with_options(Options {
            offset_kind: OffsetKind::Bytes,
            ..Options::default()
        });
        let text = doc.get_or_insert_text(TEXT_ROOT);
        Self {
            doc,
            text,
            feed: ChangeFeed::default(),
        }
    }

    /// Rebuild a replica from [`Replica::encode_full_state`] output.
    pub fn from_full_state(state: &[u8]) -> Result<Self, ReplicaError> {
        let mut replica = Self::new();
        replica.apply(state, Origin::Remote)?;
        Ok(replica)
    }

    fn out_of_range(&self, current: &str, index: usize, end: usize) -> ReplicaError {
        ReplicaError::OutOfRange {
            index,
            end,
            len: current.chars().count(),
        }
    }
}

impl Default for YrsReplica {
    fn default() -> Self {
        Self::new()
    }
}

impl Replica for YrsReplica {
    fn apply(&mut self, update: &[u8], origin: Origin) -> Result<(), ReplicaError> {
        let update = Update::decode_v1(update).map_err(|e| ReplicaError::Decode(e.to_string()))?;

        let delta = {
            let mut txn = self.doc.transact_mut();
            let before_sv = txn.state_vector();
            let before_text = self.text.get_string(&txn);

            txn.apply_update(update)
                .map_err(|e| ReplicaError::Apply(e.to_string()))?;

            // Deletions leave the state vector untouched, so compare the
            // projection too.
            let changed =
                txn.state_vector() != before_sv || self.text.get_string(&txn) != before_text;
            changed.then(|| txn.encode_diff_v1(&before_sv))
        };

        if let Some(delta) = delta {
            self.feed.emit(ReplicaChange { delta, origin });
        }
        Ok(())
    }

    fn encode_full_state(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    fn text(&self) -> String {
        let txn = self.doc.transact();
        self.text.get_string(&txn)
    }

    fn insert(&mut self, index: usize, chunk: &str) -> Result<(), ReplicaError> {
        if chunk.is_empty() {
            return Ok(());
        }
        let delta = {
            let mut txn = self.doc.transact_mut();
            let current = self.text.get_string(&txn);
            let offset = byte_offset(&current, index)
                .ok_or_else(|| self.out_of_range(&current, index, index))?;
            self.text.insert(&mut txn, offset as u32, chunk);
            txn.encode_update_v1()
        };
        self.feed.emit(ReplicaChange {
            delta,
            origin: Origin::Local,
        });
        Ok(())
    }

    fn delete(&mut self, index: usize, len: usize) -> Result<(), ReplicaError> {
        if len == 0 {
            return Ok(());
        }
        let end = index.saturating_add(len);
        let delta = {
            let mut txn = self.doc.transact_mut();
            let current = self.text.get_string(&txn);
            let start = byte_offset(&current, index);
            let stop = byte_offset(&current, end);
            let (start_byte, end_byte) = match (start, stop) {
                (Some(start), Some(stop)) => (start, stop),
                _ => return Err(self.out_of_range(&current, index, end)),
            };
            self.text
                .remove_range(&mut txn, start_byte as u32, (end_byte - start_byte) as u32);
            txn.encode_update_v1()
        };
        self.feed.emit(ReplicaChange {
            delta,
            origin: Origin::Local,
        });
        Ok(())
    }

    fn subscribe(&mut self) -> ChangeReceiver {
        self.feed.subscribe()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn drain(rx: &mut ChangeReceiver) -> Vec<ReplicaChange> {
        let mut out = Vec::new();
        while let Ok(change) = rx.try_recv() {
            out.push(change);
        }
        out
    }

    /// Replica seeded from `base` plus the deltas its local edits produce.
    fn fork_and_edit(
        base: &[u8],
        edits: impl FnOnce(&mut YrsReplica),
    ) -> (YrsReplica, Vec<Vec<u8>>) {
        let mut replica = YrsReplica::from_full_state(base).unwrap();
        let mut rx = replica.subscribe();
        edits(&mut replica);
        let deltas = drain(&mut rx).into_iter().map(|c| c.delta).collect();
        (replica, deltas)
    }

    #[test]
    fn test_new_replica_is_empty() {
        let replica = YrsReplica::new();
        assert_eq!(replica.text(), "");
    }

    #[test]
    fn test_local_insert_emits_local_change() {
        let mut replica = YrsReplica::new();
        let mut rx = replica.subscribe();

        replica.insert(0, "Hello").unwrap();

        let changes = drain(&mut rx);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].origin, Origin::Local);
        assert!(!changes[0].delta.is_empty());
        assert_eq!(replica.text(), "Hello");
    }

    #[test]
    fn test_remote_apply_emits_remote_change() {
        let mut source = YrsReplica::new();
        let mut source_rx = source.subscribe();
        source.insert(0, "abc").unwrap();
        let delta = drain(&mut source_rx).remove(0).delta;

        let mut target = YrsReplica::new();
        let mut rx = target.subscribe();
        target.apply(&delta, Origin::Remote).unwrap();

        let changes = drain(&mut rx);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].origin, Origin::Remote);
        assert_eq!(target.text(), "abc");
    }

    #[test]
    fn test_reapplying_known_update_is_silent() {
        let mut source = YrsReplica::new();
        source.insert(0, "abc").unwrap();
        let state = source.encode_full_state();

        let mut target = YrsReplica::new();
        target.apply(&state, Origin::Remote).unwrap();
        let mut rx = target.subscribe();
        target.apply(&state, Origin::Remote).unwrap();

        assert!(drain(&mut rx).is_empty());
        assert_eq!(target.text(), "abc");
    }

    #[test]
    fn test_remote_delete_is_reported() {
        let mut a = YrsReplica::new();
        a.insert(0, "abcdef").unwrap();
        let mut b = YrsReplica::from_full_state(&a.encode_full_state()).unwrap();

        let mut a_rx = a.subscribe();
        a.delete(1, 3).unwrap();
        let delta = drain(&mut a_rx).remove(0).delta;

        let mut b_rx = b.subscribe();
        b.apply(&delta, Origin::Remote).unwrap();
        assert_eq!(b.text(), "aef");
        assert_eq!(drain(&mut b_rx).len(), 1);
    }

    #[test]
    fn test_garbage_update_rejected() {
        let mut replica = YrsReplica::new();
        replica.insert(0, "keep").unwrap();
        let err = replica.apply(&[0xFF; 5], Origin::Remote).unwrap_err();
        assert!(matches!(err, ReplicaError::Decode(_)));
        assert_eq!(replica.text(), "keep");
    }

    #[test]
    fn test_out_of_range_insert_rejected() {
        let mut replica = YrsReplica::new();
        replica.insert(0, "ab").unwrap();
        assert_eq!(
            replica.insert(5, "x"),
            Err(ReplicaError::OutOfRange {
                index: 5,
                end: 5,
                len: 2
            })
        );
        assert!(replica.delete(1, 2).is_err());
        assert_eq!(replica.text(), "ab");
    }

    #[test]
    fn test_char_indices_with_multibyte_text() {
        let mut replica = YrsReplica::new();
        replica.insert(0, "héllo").unwrap();
        replica.insert(2, "✓").unwrap();
        assert_eq!(replica.text(), "hé✓llo");
        assert_eq!(replica.char_len(), 6);
        replica.delete(1, 2).unwrap();
        assert_eq!(replica.text(), "hllo");
        assert_eq!(replica.char_len(), 4);
    }

    #[test]
    fn test_full_state_roundtrip() {
        let mut source = YrsReplica::new();
        source.insert(0, "Hello world").unwrap();
        source.delete(5, 6).unwrap();
        source.insert(5, ", there").unwrap();

        let copy = YrsReplica::from_full_state(&source.encode_full_state()).unwrap();
        assert_eq!(copy.text(), source.text());
        assert_eq!(copy.text(), "Hello, there");
    }

    #[test]
    fn test_empty_full_state_roundtrip() {
        let empty = YrsReplica::new();
        let copy = YrsReplica::from_full_state(&empty.encode_full_state()).unwrap();
        assert_eq!(copy.text(), "");
    }

    #[test]
    fn test_concurrent_inserts_interleave_not_overwrite() {
        let mut base = YrsReplica::new();
        base.insert(0, "The fox").unwrap();
        let seed = base.encode_full_state();

        let (mut a, a_deltas) = fork_and_edit(&seed, |r| r.replace_text("The quick fox").unwrap());
        let (mut b, b_deltas) = fork_and_edit(&seed, |r| r.replace_text("The fox jumps").unwrap());

        for d in &b_deltas {
            a.apply(d, Origin::Remote).unwrap();
        }
        for d in &a_deltas {
            b.apply(d, Origin::Remote).unwrap();
        }
        assert_eq!(a.text(), b.text());
        assert_eq!(a.text(), "The quick fox jumps");
    }

    #[test]
    fn test_replace_text_is_minimal_splice() {
        let mut replica = YrsReplica::new();
        replica.insert(0, "abcdef").unwrap();
        let mut rx = replica.subscribe();

        replica.replace_text("abXYef").unwrap();
        assert_eq!(replica.text(), "abXYef");
        // One delete plus one insert.
        assert_eq!(drain(&mut rx).len(), 2);

        replica.replace_text("abXYef").unwrap();
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_splice_between() {
        assert_eq!(Splice::between("same", "same"), None);
        assert_eq!(
            Splice::between("abc", "abXc"),
            Some(Splice {
                index: 2,
                delete_len: 0,
                insert: "X".into()
            })
        );
        assert_eq!(
            Splice::between("aaa", "aa"),
            Some(Splice {
                index: 2,
                delete_len: 1,
                insert: String::new()
            })
        );
        assert_eq!(
            Splice::between("", "new"),
            Some(Splice {
                index: 0,
                delete_len: 0,
                insert: "new".into()
            })
        );
    }

    #[test]
    fn test_byte_offset() {
        assert_eq!(byte_offset("", 0), Some(0));
        assert_eq!(byte_offset("", 1), None);
        assert_eq!(byte_offset("aé", 2), Some(3));
        assert_eq!(byte_offset("aé", 3), None);
    }

    #[test]
    fn test_change_feed_prunes_dropped_subscribers() {
        let mut feed = ChangeFeed::default();
        let rx = feed.subscribe();
        let _kept = feed.subscribe();
        drop(rx);
        feed.emit(ReplicaChange {
            delta: vec![1],
            origin: Origin::Local,
        });
        assert_eq!(feed.subscriber_count(), 1);
    }

    #[derive(Debug, Clone)]
    enum Edit {
        Insert(usize, String),
        Delete(usize, usize),
    }

    fn edit_strategy() -> impl Strategy<Value = Edit> {
        prop_oneof![
            (0usize..32, "[a-z ]{1,6}").prop_map(|(i, s)| Edit::Insert(i, s)),
            (0usize..32, 1usize..4).prop_map(|(i, n)| Edit::Delete(i, n)),
        ]
    }

    fn run_edits(replica: &mut YrsReplica, edits: &[Edit]) {
        for edit in edits {
            let len = replica.char_len();
            match edit {
                Edit::Insert(i, s) => replica.insert(i % (len + 1), s).unwrap(),
                Edit::Delete(i, n) if len > 0 => {
                    let start = i % len;
                    replica.delete(start, (*n).min(len - start)).unwrap();
                }
                Edit::Delete(..) => {}
            }
        }
    }

    proptest! {
        #[test]
        fn prop_merge_is_commutative(
            base in "[a-z]{0,12}",
            left in prop::collection::vec(edit_strategy(), 1..8),
            right in prop::collection::vec(edit_strategy(), 1..8),
        ) {
            let mut origin = YrsReplica::new();
            origin.insert(0, &base).unwrap();
            let seed = origin.encode_full_state();

            let (_, u1) = fork_and_edit(&seed, |r| run_edits(r, &left));
            let (_, u2) = fork_and_edit(&seed, |r| run_edits(r, &right));

            let mut first = YrsReplica::from_full_state(&seed).unwrap();
            for u in u1.iter().chain(&u2) {
                first.apply(u, Origin::Remote).unwrap();
            }
            let mut second = YrsReplica::from_full_state(&seed).unwrap();
            for u in u2.iter().chain(&u1) {
                second.apply(u, Origin::Remote).unwrap();
            }
            prop_assert_eq!(first.text(), second.text());
        }

        #[test]
        fn prop_merge_is_idempotent(
            base in "[a-z]{0,12}",
            edits in prop::collection::vec(edit_strategy(), 1..8),
        ) {
            let mut origin = YrsReplica::new();
            origin.insert(0, &base).unwrap();
            let seed = origin.encode_full_state();
            let (edited, updates) = fork_and_edit(&seed, |r| run_edits(r, &edits));

            let mut once = YrsReplica::from_full_state(&seed).unwrap();
            for u in &updates {
                once.apply(u, Origin::Remote).unwrap();
            }
            let mut twice = YrsReplica::from_full_state(&seed).unwrap();
            for u in updates.iter().chain(&updates) {
                twice.apply(u, Origin::Remote).unwrap();
            }
            prop_assert_eq!(once.text(), edited.text());
            prop_assert_eq!(twice.text(), once.text());
        }
    }
}
