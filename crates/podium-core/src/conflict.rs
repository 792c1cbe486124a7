//! Deterministic precedence rules for out-of-order updates.
//!
//! Both resolvers are pure: the same pair of inputs produces the same
//! resolution on every replica, in any arrival order. Each returns a
//! classification, a decision, and a reason so an outcome can be explained
//! rather than just obeyed.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::protocol::{SourceId, StateUpdateEnvelope};

/// Provenance of the last applied `state-update`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvelopeConflictCursor {
    pub source_id: SourceId,
    pub seq: u64,
    pub sent_at: f64,
}

impl EnvelopeConflictCursor {
    pub fn new(source_id: SourceId, seq: u64, sent_at: f64) -> Self {
        Self {
            source_id,
            seq,
            sent_at,
        }
    }
}

impl From<&StateUpdateEnvelope> for EnvelopeConflictCursor {
    fn from(envelope: &StateUpdateEnvelope) -> Self {
        Self::new(envelope.source_id().clone(), envelope.seq(), envelope.sent_at())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictClassification {
    Bootstrap,
    SameSource,
    CrossSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictDecision {
    Accept,
    Ignore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictReason {
    NoCurrentCursor,
    SameSourceHigherSeq,
    SameSourceLowerSeq,
    SameSourceNewerSentAt,
    SameSourceOlderSentAt,
    SameSourceDuplicate,
    NewerSentAt,
    OlderSentAt,
    EqualSentAtHigherSeq,
    EqualSentAtLowerSeq,
    SourceIdPrecedence,
}

impl ConflictReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictReason::NoCurrentCursor => "no-current-cursor",
            ConflictReason::SameSourceHigherSeq => "same-source-higher-seq",
            ConflictReason::SameSourceLowerSeq => "same-source-lower-seq",
            ConflictReason::SameSourceNewerSentAt => "same-source-newer-sent-at",
            ConflictReason::SameSourceOlderSentAt => "same-source-older-sent-at",
            ConflictReason::SameSourceDuplicate => "same-source-duplicate",
            ConflictReason::NewerSentAt => "newer-sent-at",
            ConflictReason::OlderSentAt => "older-sent-at",
            ConflictReason::EqualSentAtHigherSeq => "equal-sent-at-higher-seq",
            ConflictReason::EqualSentAtLowerSeq => "equal-sent-at-lower-seq",
            ConflictReason::SourceIdPrecedence => "source-id-precedence",
        }
    }
}

impl fmt::Display for ConflictReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EnvelopeConflictResolution {
    pub classification: ConflictClassification,
    pub decision: ConflictDecision,
    pub reason: ConflictReason,
}

impl EnvelopeConflictResolution {
    fn new(
        classification: ConflictClassification,
        decision: ConflictDecision,
        reason: ConflictReason,
    ) -> Self {
        Self {
            classification,
            decision,
            reason,
        }
    }

    pub fn is_accept(&self) -> bool {
        self.decision == ConflictDecision::Accept
    }
}

/// Decide whether `incoming` supersedes `current`.
///
/// Same source: `seq` first, then `sentAt`. Different sources: `sentAt` first
/// (independent counters are not comparable), then `seq`, then the source id
/// itself so the order is total.
pub fn resolve_envelope_conflict(
    current: Option<&EnvelopeConflictCursor>,
    incoming: &EnvelopeConflictCursor,
) -> EnvelopeConflictResolution {
    use ConflictClassification::*;
    use ConflictDecision::*;
    use ConflictReason::*;

    let Some(current) = current else {
        return EnvelopeConflictResolution::new(Bootstrap, Accept, NoCurrentCursor);
    };

    if current.source_id == incoming.source_id {
        let (decision, reason) = match incoming.seq.cmp(&current.seq) {
            Ordering::Greater => (Accept, SameSourceHigherSeq),
            Ordering::Less => (Ignore, SameSourceLowerSeq),
            Ordering::Equal => match incoming.sent_at.total_cmp(&current.sent_at) {
                Ordering::Greater => (Accept, SameSourceNewerSentAt),
                Ordering::Less => (Ignore, SameSourceOlderSentAt),
                Ordering::Equal => (Ignore, SameSourceDuplicate),
            },
        };
        return EnvelopeConflictResolution::new(SameSource, decision, reason);
    }

    let (decision, reason) = match incoming.sent_at.total_cmp(&current.sent_at) {
        Ordering::Greater => (Accept, NewerSentAt),
        Ordering::Less => (Ignore, OlderSentAt),
        Ordering::Equal => match incoming.seq.cmp(&current.seq) {
            Ordering::Greater => (Accept, EqualSentAtHigherSeq),
            Ordering::Less => (Ignore, EqualSentAtLowerSeq),
            Ordering::Equal => {
                if incoming.source_id > current.source_id {
                    (Accept, SourceIdPrecedence)
                } else {
                    (Ignore, SourceIdPrecedence)
                }
            }
        },
    };
    EnvelopeConflictResolution::new(CrossSource, decision, reason)
}

// --- Approval queue ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueEntryStatus {
    Pending,
    Approved,
    Rejected,
}

impl QueueEntryStatus {
    /// Settled states outrank pending ones; a rejection is final.
    pub fn rank(self) -> u8 {
        match self {
            QueueEntryStatus::Pending => 0,
            QueueEntryStatus::Approved => 1,
            QueueEntryStatus::Rejected => 2,
        }
    }
}

/// One entry of the tool approval queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueConflictEntry {
    pub id: String,
    /// Epoch milliseconds.
    pub created_at: i64,
    pub status: QueueEntryStatus,
    pub tool_id: String,
    pub adapter_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueConflictClassification {
    CreatedAt,
    Status,
    ToolId,
    AdapterId,
    Duplicate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueConflictDecision {
    TakeIncoming,
    KeepCurrent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueConflictReason {
    NewerCreatedAt,
    OlderCreatedAt,
    HigherStatusRank,
    LowerStatusRank,
    ToolIdPrecedence,
    AdapterIdPrecedence,
    DuplicateEntry,
}

impl QueueConflictReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueConflictReason::NewerCreatedAt => "newer-created-at",
            QueueConflictReason::OlderCreatedAt => "older-created-at",
            QueueConflictReason::HigherStatusRank => "higher-status-rank",
            QueueConflictReason::LowerStatusRank => "lower-status-rank",
            QueueConflictReason::ToolIdPrecedence => "tool-id-precedence",
            QueueConflictReason::AdapterIdPrecedence => "adapter-id-precedence",
            QueueConflictReason::DuplicateEntry => "duplicate-entry",
        }
    }
}

impl fmt::Display for QueueConflictReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueConflictResolution {
    pub classification: QueueConflictClassification,
    pub decision: QueueConflictDecision,
    pub reason: QueueConflictReason,
}

impl QueueConflictResolution {
    pub fn takes_incoming(&self) -> bool {
        self.decision == QueueConflictDecision::TakeIncoming
    }
}

/// Decide which of two versions of the same queue entry wins.
///
/// `createdAt`, then status rank, then `toolId`, then `adapterId`; a full tie
/// keeps the current entry.
pub fn resolve_queue_entry_conflict(
    current: &QueueConflictEntry,
    incoming: &QueueConflictEntry,
) -> QueueConflictResolution {
    use QueueConflictClassification as C;
    use QueueConflictDecision::*;
    use QueueConflictReason as R;

    let (classification, decision, reason) = match incoming.created_at.cmp(&current.created_at) {
        Ordering::Greater => (C::CreatedAt, TakeIncoming, R::NewerCreatedAt),
        Ordering::Less => (C::CreatedAt, KeepCurrent, R::OlderCreatedAt),
        Ordering::Equal => match incoming.status.rank().cmp(&current.status.rank()) {
            Ordering::Greater => (C::Status, TakeIncoming, R::HigherStatusRank),
            Ordering::Less => (C::Status, KeepCurrent, R::LowerStatusRank),
            Ordering::Equal => match incoming.tool_id.cmp(&current.tool_id) {
                Ordering::Greater => (C::ToolId, TakeIncoming, R::ToolIdPrecedence),
                Ordering::Less => (C::ToolId, KeepCurrent, R::ToolIdPrecedence),
                Ordering::Equal => match incoming.adapter_id.cmp(&current.adapter_id) {
                    Ordering::Greater => (C::AdapterId, TakeIncoming, R::AdapterIdPrecedence),
                    Ordering::Less => (C::AdapterId, KeepCurrent, R::AdapterIdPrecedence),
                    Ordering::Equal => (C::Duplicate, KeepCurrent, R::DuplicateEntry),
                },
            },
        },
    };

    QueueConflictResolution {
        classification,
        decision,
        reason,
    }
}

/// Fold two queue snapshots into one, resolving id collisions with
/// [`resolve_queue_entry_conflict`]. Output is ordered by `(createdAt, id)`.
pub fn merge_queue_entries(
    current: &[QueueConflictEntry],
    incoming: &[QueueConflictEntry],
) -> Vec<QueueConflictEntry> {
    let mut by_id: BTreeMap<&str, &QueueConflictEntry> = BTreeMap::new();

    for entry in current.iter().chain(incoming) {
        let keep_existing = by_id.get(entry.id.as_str()).is_some_and(|existing| {
            !resolve_queue_entry_conflict(existing, entry).takes_incoming()
        });
        if !keep_existing {
            by_id.insert(entry.id.as_str(), entry);
        }
    }

    let mut merged: Vec<QueueConflictEntry> = by_id.into_values().cloned().collect();
    merged.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    merged
}
