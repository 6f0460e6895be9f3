use std::path::Path;
use std::sync::Arc;

use log::{debug, trace, warn};
use parking_lot::Mutex;

use crate::checkpoint::CheckpointStore;
use crate::entry::EpochEntry;
use crate::error::CheckpointError;
use crate::proposal::{AppendProposal, FlushOutcome};
use crate::{LogEndOffsetSource, UNDEFINED_EPOCH, UNDEFINED_OFFSET};

/// The sorted-by-epoch history of a single partition, plus the machinery to
/// query, extend, and truncate it.
///
/// All public operations take a single exclusive lock for their duration,
/// including the checkpoint write on mutating paths: the in-memory history
/// and the on-disk checkpoint are kept consistent by construction rather
/// than by a reader/writer split. Queries (`latest_epoch`, `end_offset_for`,
/// `entries`) therefore only ever wait on lock acquisition, never on I/O.
pub struct EpochCache {
    inner: Mutex<Inner>,
}

struct Inner {
    /// Committed history, sorted by strictly increasing epoch.
    entries: Vec<EpochEntry>,
    checkpoint: CheckpointStore,
    log_end_offset: Arc<dyn LogEndOffsetSource>,
    proposal: AppendProposal,
}

impl std::fmt::Debug for EpochCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("EpochCache")
            .field("checkpoint", &inner.checkpoint.path())
            .field("entries", &inner.entries.len())
            .finish()
    }
}

impl EpochCache {
    /// Construct a cache for one partition, loading any persisted history
    /// from `checkpoint_path`.
    ///
    /// Fails if the checkpoint exists but is corrupt, or if it cannot be
    /// read. A partition whose epoch history cannot be loaded cannot safely
    /// participate in replication, so this is treated as fatal to
    /// construction rather than started with an assumed-empty history.
    pub fn new(
        checkpoint_path: impl AsRef<Path>,
        log_end_offset: Arc<dyn LogEndOffsetSource>,
    ) -> Result<Self, CheckpointError> {
        let checkpoint = CheckpointStore::new(checkpoint_path.as_ref());
        let entries = checkpoint.read()?;
        debug!(
            "loaded {} epoch entries from {}",
            entries.len(),
            checkpoint.path().display()
        );
        Ok(Self {
            inner: Mutex::new(Inner {
                entries,
                checkpoint,
                log_end_offset,
                proposal: AppendProposal::new(),
            }),
        })
    }

    /// Append `(epoch, start_offset)` to the history if doing so preserves
    /// monotonicity, then persist. A rejected assignment is a silent no-op,
    /// matching Kafka's original semantics: a later message carrying an
    /// earlier epoch, a repeat of the current epoch, or an offset regression
    /// must not rewrite history.
    pub fn assign(&self, epoch: i32, start_offset: i64) -> Result<(), CheckpointError> {
        let mut inner = self.inner.lock();
        if inner.assign(epoch, start_offset) {
            inner.persist()?;
        }
        Ok(())
    }

    /// Epoch of the most recent entry, or [`UNDEFINED_EPOCH`] if the history
    /// is empty.
    pub fn latest_epoch(&self) -> i32 {
        self.inner.lock().latest_epoch()
    }

    /// The offset marking the end of data for `requested_epoch`.
    ///
    /// Returns [`UNDEFINED_OFFSET`] for a request below the earliest
    /// recorded epoch, above the latest epoch, or against an empty history;
    /// returns the live log-end offset for the latest epoch (it is still
    /// open-ended); otherwise returns the start offset of the smallest
    /// recorded epoch strictly greater than `requested_epoch`, which also
    /// resolves queries for epochs that never produced a record of their
    /// own.
    pub fn end_offset_for(&self, requested_epoch: i32) -> i64 {
        self.inner.lock().end_offset_for(requested_epoch)
    }

    /// The stored entry for `epoch`, if the cache recorded one exactly.
    ///
    /// Distinct from [`Self::end_offset_for`], which resolves gap and
    /// latest-epoch queries; this is a direct lookup for diagnostics.
    pub fn epoch_entry_for(&self, epoch: i32) -> Option<EpochEntry> {
        self.inner.lock().epoch_entry_for(epoch)
    }

    /// Truncate from the head: drop history below `offset`, retaining the
    /// one entry that straddles it with its start offset advanced to
    /// `offset`. No-op if `offset == UNDEFINED_OFFSET`, the history is
    /// empty, or `offset` does not exceed the earliest recorded offset.
    pub fn clear_earliest(&self, offset: i64) -> Result<(), CheckpointError> {
        let mut inner = self.inner.lock();
        if inner.clear_earliest(offset) {
            inner.persist()?;
        }
        Ok(())
    }

    /// Truncate from the tail: drop every entry whose start offset is
    /// `>= offset`. No-op if `offset == UNDEFINED_OFFSET` or the history is
    /// empty.
    pub fn clear_latest(&self, offset: i64) -> Result<(), CheckpointError> {
        let mut inner = self.inner.lock();
        if inner.clear_latest(offset) {
            inner.persist()?;
        }
        Ok(())
    }

    /// Remove all entries and persist an empty history.
    pub fn clear(&self) -> Result<(), CheckpointError> {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.proposal = AppendProposal::new();
        inner.persist()
    }

    /// A stable snapshot of the current history. Mutating the cache does not
    /// affect a previously returned snapshot.
    pub fn entries(&self) -> Vec<EpochEntry> {
        self.inner.lock().entries.clone()
    }

    /// Whether the history currently holds no entries.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    /// Record that leadership changed to epoch `e`. Ignored if `e` is not
    /// strictly greater than [`Self::latest_epoch`].
    pub fn propose_leader_epoch_change(&self, e: i32) {
        let mut inner = self.inner.lock();
        let latest = inner.latest_epoch();
        inner.proposal.propose(e, latest);
    }

    /// The epoch the log append path should stamp on the next record.
    pub fn epoch_for_leader_message_append(&self) -> i32 {
        let inner = self.inner.lock();
        inner.proposal.epoch_for_append(inner.latest_epoch())
    }

    /// If a leader-epoch proposal is pending, bind it to the current
    /// log-end offset and commit it to history, then clear the proposal.
    ///
    /// A rejected flush (the bound offset would violate monotonicity by the
    /// time of flush) is not surfaced as an error: the proposal is cleared
    /// either way, since the epoch stamp has already been applied to any
    /// records appended under it.
    pub fn maybe_flush_uncommitted_epochs(&self) -> Result<(), CheckpointError> {
        let mut guard = self.inner.lock();
        let leo = guard.log_end_offset.log_end_offset();

        // Destructure into disjoint field borrows so the closure passed to
        // `proposal.maybe_flush` can mutate `entries` independently of the
        // `proposal.maybe_flush` call itself borrowing `proposal`.
        let Inner { entries, proposal, .. } = &mut *guard;
        let outcome = proposal.maybe_flush(leo, |e, o| Inner::try_assign(entries, e, o));

        match outcome {
            FlushOutcome::Committed(_) => guard.persist()?,
            FlushOutcome::Rejected => trace!("discarded a pending leader epoch proposal rejected at flush"),
            FlushOutcome::NoProposal => trace!("no pending leader epoch proposal to flush"),
        }
        Ok(())
    }
}

impl Inner {
    fn latest_epoch(&self) -> i32 {
        self.entries.last().map(|e| e.epoch).unwrap_or(UNDEFINED_EPOCH)
    }

    fn epoch_entry_for(&self, epoch: i32) -> Option<EpochEntry> {
        self.entries.iter().find(|e| e.epoch == epoch).copied()
    }

    /// Shared implementation of the `assign` monotonicity policy described
    /// in the module docs, usable both from `EpochCache::assign` and from
    /// the proposal flush path (which cannot re-enter `self.assign` while
    /// already holding the lock).
    fn try_assign(entries: &mut Vec<EpochEntry>, epoch: i32, start_offset: i64) -> bool {
        match entries.last() {
            None => {
                entries.push(EpochEntry::new(epoch, start_offset));
                true
            }
            Some(last) => {
                if epoch < last.epoch {
                    trace!("ignoring assign({epoch}, {start_offset}): epoch precedes latest {}", last.epoch);
                    false
                } else if epoch == last.epoch {
                    trace!("ignoring assign({epoch}, {start_offset}): epoch already recorded");
                    false
                } else if start_offset < last.start_offset {
                    trace!(
                        "ignoring assign({epoch}, {start_offset}): offset precedes latest start offset {}",
                        last.start_offset
                    );
                    false
                } else {
                    debug!("assigned epoch {epoch} starting at offset {start_offset}");
                    entries.push(EpochEntry::new(epoch, start_offset));
                    true
                }
            }
        }
    }

    fn assign(&mut self, epoch: i32, start_offset: i64) -> bool {
        Self::try_assign(&mut self.entries, epoch, start_offset)
    }

    fn end_offset_for(&self, requested_epoch: i32) -> i64 {
        if requested_epoch == UNDEFINED_EPOCH {
            return UNDEFINED_OFFSET;
        }
        let Some(front) = self.entries.first() else {
            return UNDEFINED_OFFSET;
        };
        if requested_epoch < front.epoch {
            return UNDEFINED_OFFSET;
        }
        let latest_epoch = self.latest_epoch();
        if requested_epoch == latest_epoch {
            return self.log_end_offset.log_end_offset();
        }
        if requested_epoch > latest_epoch {
            return UNDEFINED_OFFSET;
        }
        // requested_epoch is covered by history but not the latest entry:
        // find the smallest recorded epoch strictly greater than it and
        // return its start offset. This also resolves epochs never directly
        // recorded (gaps), which produced no records and therefore end
        // where the following recorded epoch begins.
        let idx = self.entries.partition_point(|e| e.epoch <= requested_epoch);
        self.entries[idx].start_offset
    }

    fn clear_earliest(&mut self, offset: i64) -> bool {
        if offset == UNDEFINED_OFFSET || self.entries.is_empty() {
            return false;
        }
        if offset <= self.entries[0].start_offset {
            return false;
        }
        let k = self
            .entries
            .iter()
            .rposition(|e| e.start_offset <= offset)
            .expect("offset exceeds front.start_offset, so at least one entry qualifies");
        self.entries.drain(0..k);
        if self.entries[0].start_offset < offset {
            debug!(
                "clear_earliest({offset}): advancing retained epoch {} start offset from {} to {offset}",
                self.entries[0].epoch, self.entries[0].start_offset
            );
            self.entries[0].start_offset = offset;
        }
        true
    }

    fn clear_latest(&mut self, offset: i64) -> bool {
        if offset == UNDEFINED_OFFSET || self.entries.is_empty() {
            return false;
        }
        let before = self.entries.len();
        self.entries.retain(|e| e.start_offset < offset);
        if self.entries.len() != before {
            debug!(
                "clear_latest({offset}): dropped {} entries",
                before - self.entries.len()
            );
            true
        } else {
            false
        }
    }

    fn persist(&self) -> Result<(), CheckpointError> {
        self.checkpoint.write(&self.entries).inspect_err(|e| {
            warn!("failed to persist epoch checkpoint: {e}");
        })
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn leo(offset: i64) -> Arc<dyn LogEndOffsetSource> {
        Arc::new(move || offset)
    }

    fn cache_at(dir: &std::path::Path, leo_offset: i64) -> EpochCache {
        EpochCache::new(dir.join("leader-epoch-checkpoint"), leo(leo_offset)).unwrap()
    }

    #[test]
    fn empty_cache_boundaries() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_at(dir.path(), 0);
        assert_eq!(cache.latest_epoch(), UNDEFINED_EPOCH);
        assert_eq!(cache.end_offset_for(5), UNDEFINED_OFFSET);
        assert_eq!(cache.end_offset_for(UNDEFINED_EPOCH), UNDEFINED_OFFSET);
        cache.clear_earliest(10).unwrap();
        cache.clear_latest(10).unwrap();
        assert!(cache.is_empty());
    }

    #[test]
    fn scenario_follower_ascending_epochs() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_at(dir.path(), 7);
        cache.assign(0, 0).unwrap();
        cache.assign(0, 1).unwrap();
        cache.assign(0, 2).unwrap();
        cache.assign(1, 3).unwrap();
        cache.assign(1, 4).unwrap();
        cache.assign(2, 6).unwrap();

        assert_eq!(cache.end_offset_for(0), 3);
        assert_eq!(cache.end_offset_for(1), 6);
        assert_eq!(cache.end_offset_for(2), 7);
        assert_eq!(cache.latest_epoch(), 2);
    }

    #[test]
    fn scenario_epoch_regression_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_at(dir.path(), 0);
        cache.assign(1, 5).unwrap();
        cache.assign(2, 6).unwrap();
        cache.assign(1, 7).unwrap();

        assert_eq!(
            cache.entries(),
            vec![EpochEntry::new(1, 5), EpochEntry::new(2, 6)]
        );
        assert_eq!(cache.latest_epoch(), 2);
    }

    #[test]
    fn scenario_offset_regression_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_at(dir.path(), 0);
        cache.assign(2, 6).unwrap();
        cache.assign(3, 5).unwrap();

        assert_eq!(cache.entries(), vec![EpochEntry::new(2, 6)]);
    }

    #[test]
    fn scenario_clear_latest_on_boundary_is_inclusive() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_at(dir.path(), 0);
        cache.assign(2, 6).unwrap();
        cache.assign(3, 8).unwrap();
        cache.assign(4, 11).unwrap();

        cache.clear_latest(8).unwrap();
        assert_eq!(cache.entries(), vec![EpochEntry::new(2, 6)]);
    }

    #[test]
    fn scenario_clear_earliest_between_boundaries_rewrites_head() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_at(dir.path(), 0);
        cache.assign(2, 6).unwrap();
        cache.assign(3, 8).unwrap();
        cache.assign(4, 11).unwrap();

        cache.clear_earliest(9).unwrap();
        assert_eq!(
            cache.entries(),
            vec![EpochEntry::new(3, 9), EpochEntry::new(4, 11)]
        );
    }

    #[test]
    fn scenario_clear_earliest_beyond_last_advances_last() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_at(dir.path(), 0);
        cache.assign(2, 6).unwrap();
        cache.assign(3, 8).unwrap();
        cache.assign(4, 11).unwrap();

        cache.clear_earliest(15).unwrap();
        assert_eq!(cache.entries(), vec![EpochEntry::new(4, 15)]);
    }

    #[test]
    fn scenario_proposal_flow() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_at(dir.path(), 5);

        cache.propose_leader_epoch_change(2);
        assert_eq!(cache.latest_epoch(), UNDEFINED_EPOCH);
        assert_eq!(cache.epoch_for_leader_message_append(), 2);

        cache.maybe_flush_uncommitted_epochs().unwrap();
        assert_eq!(cache.latest_epoch(), 2);
        assert_eq!(cache.end_offset_for(2), 5);
    }

    #[test]
    fn scenario_persistence_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("leader-epoch-checkpoint");

        {
            let cache = EpochCache::new(&path, leo(0)).unwrap();
            cache.assign(2, 6).unwrap();
        }

        let cache_b = EpochCache::new(&path, leo(0)).unwrap();
        assert_eq!(cache_b.entries(), vec![EpochEntry::new(2, 6)]);
    }

    #[test]
    fn clear_earliest_noop_on_sentinel_and_empty_and_below_front() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_at(dir.path(), 0);
        cache.clear_earliest(UNDEFINED_OFFSET).unwrap();
        assert!(cache.is_empty());

        cache.assign(2, 6).unwrap();
        cache.clear_earliest(6).unwrap();
        assert_eq!(cache.entries(), vec![EpochEntry::new(2, 6)]);
        cache.clear_earliest(3).unwrap();
        assert_eq!(cache.entries(), vec![EpochEntry::new(2, 6)]);
    }

    #[test]
    fn clear_latest_noop_on_sentinel_and_empty() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_at(dir.path(), 0);
        cache.clear_latest(UNDEFINED_OFFSET).unwrap();
        assert!(cache.is_empty());

        cache.assign(2, 6).unwrap();
        cache.clear_latest(UNDEFINED_OFFSET).unwrap();
        assert_eq!(cache.entries(), vec![EpochEntry::new(2, 6)]);
    }

    #[test]
    fn clear_resets_to_undefined() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_at(dir.path(), 0);
        cache.assign(2, 6).unwrap();
        cache.assign(3, 8).unwrap();
        cache.clear().unwrap();

        assert_eq!(cache.latest_epoch(), UNDEFINED_EPOCH);
        assert_eq!(cache.end_offset_for(2), UNDEFINED_OFFSET);
        assert_eq!(cache.end_offset_for(3), UNDEFINED_OFFSET);
        assert!(cache.is_empty());
    }

    #[test]
    fn assign_idempotent_for_same_epoch() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_at(dir.path(), 0);
        cache.assign(2, 6).unwrap();
        cache.assign(2, 100).unwrap();
        assert_eq!(cache.entries(), vec![EpochEntry::new(2, 6)]);
    }

    #[test]
    fn gap_epoch_resolves_to_next_recorded_start_offset() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_at(dir.path(), 20);
        cache.assign(1, 0).unwrap();
        cache.assign(5, 10).unwrap();
        cache.assign(9, 15).unwrap();

        // epoch 3 was never recorded: it sits between 1 and 5.
        assert_eq!(cache.end_offset_for(3), 10);
    }

    #[test]
    fn query_below_earliest_epoch_is_undefined() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_at(dir.path(), 0);
        cache.assign(5, 0).unwrap();
        assert_eq!(cache.end_offset_for(1), UNDEFINED_OFFSET);
    }

    #[test]
    fn epoch_entry_for_exact_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_at(dir.path(), 0);
        cache.assign(2, 6).unwrap();
        assert_eq!(cache.epoch_entry_for(2), Some(EpochEntry::new(2, 6)));
        assert_eq!(cache.epoch_entry_for(3), None);
    }

    #[test]
    fn proposal_flush_rejected_when_offset_regresses() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_at(dir.path(), 3);
        cache.assign(1, 5).unwrap();

        // Leadership moves to epoch 2, but by the time we flush, the
        // log-end offset (3) is behind the already-recorded start offset (5).
        cache.propose_leader_epoch_change(2);
        cache.maybe_flush_uncommitted_epochs().unwrap();

        assert_eq!(cache.latest_epoch(), 1);
        assert_eq!(cache.epoch_for_leader_message_append(), 1);
    }
}
