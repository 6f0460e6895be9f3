use log::{debug, trace};

use crate::entry::EpochEntry;
use crate::UNDEFINED_EPOCH;

/// Leader-side two-phase binding of a new epoch to its start offset.
///
/// A replica that becomes leader for epoch `e` must stamp outgoing records
/// with `e` immediately, but the offset at which `e` actually starts is not
/// known until the first message is appended. [`State`] tracks that pending
/// assignment so it is visible to the log's append path without being
/// visible to the committed history (and therefore to followers) until
/// [`AppendProposal::maybe_flush`] binds it to a real offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    NoProposal,
    Proposed(i32),
}

/// Result of [`AppendProposal::maybe_flush`], distinguishing "nothing was
/// pending" from "a pending proposal was rejected" so callers can log each
/// case accurately instead of treating both as a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// No proposal was pending; nothing to do.
    NoProposal,
    /// A proposal was pending but `assign` rejected it; it was discarded.
    Rejected,
    /// A proposal was pending and `assign` accepted it.
    Committed(EpochEntry),
}

/// Owns the pending-epoch state machine for one [`crate::EpochCache`].
///
/// Deliberately not a second collection of uncommitted entries: there is at
/// most one proposal outstanding at a time, so a two-state enum is all the
/// invariant needs.
#[derive(Debug, Default)]
pub struct AppendProposal {
    state: State,
}

impl Default for State {
    fn default() -> Self {
        State::NoProposal
    }
}

impl AppendProposal {
    pub fn new() -> Self {
        Self {
            state: State::NoProposal,
        }
    }

    /// Record that leadership changed to epoch `e`, given the current
    /// latest committed epoch.
    ///
    /// Ignored if `e` is not strictly greater than `latest_epoch` — epochs
    /// never go backwards, even as proposals. A later call simply overwrites
    /// an earlier, still-unflushed proposal.
    pub fn propose(&mut self, e: i32, latest_epoch: i32) {
        if e > latest_epoch {
            debug!("proposing leader epoch {e} (latest committed {latest_epoch})");
            self.state = State::Proposed(e);
        } else {
            trace!("ignoring leader epoch proposal {e}: not greater than latest committed {latest_epoch}");
        }
    }

    /// The epoch that should be stamped on a record appended to the log
    /// right now.
    ///
    /// Returns the pending proposal if one exists, otherwise `latest_epoch`.
    /// Does not commit the proposal: calling this repeatedly has no
    /// observable effect.
    pub fn epoch_for_append(&self, latest_epoch: i32) -> i32 {
        match self.state {
            State::Proposed(e) => e,
            State::NoProposal => latest_epoch,
        }
    }

    /// If a proposal is pending, materialize it as `(e, log_end_offset)` and
    /// hand it to `assign`, then clear the proposal regardless of whether
    /// `assign` accepted it.
    ///
    /// A rejected flush (the proposed epoch is no longer monotonically
    /// greater by the time of flush, or `log_end_offset` would violate
    /// offset monotonicity) is not surfaced as an error: the epoch stamp
    /// has already been applied to any appended records, so there is
    /// nothing further to do with the proposal once it is consumed. The
    /// distinction between "nothing was pending" and "a pending proposal was
    /// discarded" is still reported via [`FlushOutcome`], so callers can log
    /// the discard accurately instead of conflating it with the no-op case.
    pub fn maybe_flush(&mut self, log_end_offset: i64, assign: impl FnOnce(i32, i64) -> bool) -> FlushOutcome {
        let e = match self.state {
            State::Proposed(e) => e,
            State::NoProposal => return FlushOutcome::NoProposal,
        };
        self.state = State::NoProposal;
        if assign(e, log_end_offset) {
            debug!("flushed proposed epoch {e} at offset {log_end_offset}");
            FlushOutcome::Committed(EpochEntry::new(e, log_end_offset))
        } else {
            debug!("discarding proposed epoch {e} at offset {log_end_offset}: rejected by assign");
            FlushOutcome::Rejected
        }
    }

    /// Epoch currently pending flush, if any.
    pub fn pending(&self) -> Option<i32> {
        match self.state {
            State::Proposed(e) => Some(e),
            State::NoProposal => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn propose_rejects_non_increasing() {
        let mut p = AppendProposal::new();
        p.propose(2, 2);
        assert_eq!(p.pending(), None);
        p.propose(1, 2);
        assert_eq!(p.pending(), None);
    }

    #[test]
    fn propose_accepts_strictly_greater() {
        let mut p = AppendProposal::new();
        p.propose(2, UNDEFINED_EPOCH);
        assert_eq!(p.pending(), Some(2));
    }

    #[test]
    fn later_proposal_overwrites_earlier() {
        let mut p = AppendProposal::new();
        p.propose(2, UNDEFINED_EPOCH);
        p.propose(3, UNDEFINED_EPOCH);
        assert_eq!(p.pending(), Some(3));
    }

    #[test]
    fn epoch_for_append_prefers_pending() {
        let mut p = AppendProposal::new();
        assert_eq!(p.epoch_for_append(5), 5);
        p.propose(6, 5);
        assert_eq!(p.epoch_for_append(5), 6);
    }

    #[test]
    fn flush_clears_state_even_when_rejected() {
        let mut p = AppendProposal::new();
        p.propose(2, UNDEFINED_EPOCH);
        let flushed = p.maybe_flush(5, |_, _| false);
        assert_eq!(flushed, FlushOutcome::Rejected);
        assert_eq!(p.pending(), None);
    }

    #[test]
    fn flush_binds_start_offset_to_log_end_offset() {
        let mut p = AppendProposal::new();
        p.propose(2, UNDEFINED_EPOCH);
        let flushed = p.maybe_flush(5, |_, _| true);
        assert_eq!(flushed, FlushOutcome::Committed(EpochEntry::new(2, 5)));
    }

    #[test]
    fn flush_with_no_proposal_is_noop() {
        let mut p = AppendProposal::new();
        assert_eq!(p.maybe_flush(5, |_, _| true), FlushOutcome::NoProposal);
    }
}
