//! Per-entity reconciliation states and the transition algebra the
//! scheduler relies on.
//!
//! The interesting state is [`EntityState::UpgradingInvalidated`]: an
//! upgrade RPC for the entity is in flight and cannot be cancelled, but a
//! definition change or feedback resend has made its eventual result
//! untrustworthy. The mark makes the reply continuation discard the
//! replacement and re-enter `Unloaded` for a fresh pass.

use serde::{Deserialize, Serialize};

/// Reconciliation state of one tracked entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityState {
    /// Needs a pass: never emitted, or invalidated since the last one.
    Unloaded,
    /// An upgrade RPC naming this entity is in flight.
    Upgrading,
    /// Upgrade in flight, but its result was invalidated mid-flight.
    UpgradingInvalidated,
    /// The module has the current snapshot; nothing to do until an
    /// invalidation or replacement arrives.
    Ready,
    /// `forget` was called; the record is removed on the next drain.
    PendingDelete,
}

impl EntityState {
    /// Whether the next drain must remove this record.
    #[must_use]
    pub const fn is_pending_delete(self) -> bool {
        matches!(self, Self::PendingDelete)
    }

    /// Whether an upgrade RPC naming the entity is currently in flight.
    #[must_use]
    pub const fn upgrade_in_flight(self) -> bool {
        matches!(self, Self::Upgrading | Self::UpgradingInvalidated)
    }

    /// State after a definition-change or feedback-resend invalidation.
    ///
    /// `Ready` re-enters the pipeline; an in-flight upgrade is marked so
    /// its reply gets discarded. Everything else already has a pass
    /// coming and stays put.
    #[must_use]
    pub const fn after_invalidation(self) -> Self {
        match self {
            Self::Ready => Self::Unloaded,
            Self::Upgrading => Self::UpgradingInvalidated,
            other => other,
        }
    }

    /// State after the upgrade RPC carrying this entity failed.
    ///
    /// `Upgrading` pretends the upgrade succeeded rather than retrying
    /// forever; a module that permanently rejects an upgrade must not
    /// wedge the pipeline. `UpgradingInvalidated` was going to re-run
    /// anyway and retries from scratch.
    #[must_use]
    pub const fn after_upgrade_failure(self) -> Self {
        match self {
            Self::Upgrading => Self::Ready,
            Self::UpgradingInvalidated => Self::Unloaded,
            other => other,
        }
    }
}
