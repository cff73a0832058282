//! Escrow classes and the drain work queue

use std::{collections::HashSet, fmt};

use serde::{Deserialize, Serialize};

use crate::error::KelError;
use crate::store::KelStore;
use crate::types::{EventKey, SignedKeyEvent};

/// Holding areas for events that cannot yet be accepted or rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscrowClass {
    /// Signatures verify but the signing threshold is not met yet
    Pending,
    /// The immediate predecessor has not been accepted yet
    OutOfOrder,
    /// Conflicts with an accepted event; held for adjudication, never promoted
    LikelyDuplicitous,
}

impl EscrowClass {
    pub const ALL: [EscrowClass; 3] = [Self::Pending, Self::OutOfOrder, Self::LikelyDuplicitous];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::OutOfOrder => "out_of_order",
            Self::LikelyDuplicitous => "likely_duplicitous",
        }
    }

    /// Whether entries of this class are re-attempted when the log advances.
    pub fn is_promotable(&self) -> bool {
        !matches!(self, Self::LikelyDuplicitous)
    }
}

impl fmt::Display for EscrowClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Work queue for draining the promotable escrows of one prefix.
///
/// Every `(class, key, frontier)` triple is handed out at most once, so an entry
/// that keeps failing is retried only after the log has advanced, and the total
/// number of attempts never exceeds the configured limit.
pub(crate) struct DrainQueue {
    attempted: HashSet<(EscrowClass, EventKey, u64)>,
    remaining: usize,
}

impl DrainQueue {
    pub fn new(limit: usize) -> Self {
        Self {
            attempted: HashSet::new(),
            remaining: limit,
        }
    }

    /// The next escrowed message worth re-attempting when the log's next sequence
    /// number is `frontier`, lowest sequence first.
    pub fn next<S: KelStore + ?Sized>(
        &mut self,
        store: &S,
        prefix: &str,
        frontier: u64,
    ) -> Result<Option<(EscrowClass, SignedKeyEvent)>, KelError> {
        if self.remaining == 0 {
            return Ok(None);
        }

        let mut candidates = Vec::new();
        for class in EscrowClass::ALL.into_iter().filter(|c| c.is_promotable()) {
            for message in store.escrowed(class, prefix)? {
                // Still unreachable: nothing has changed for it.
                if class == EscrowClass::OutOfOrder && message.event.sn > frontier {
                    continue;
                }
                candidates.push((message.event_key()?, class, message));
            }
        }
        candidates.sort_by(|(a, a_class, _), (b, b_class, _)| {
            (a.sn, a_class, a).cmp(&(b.sn, b_class, b))
        });

        for (key, class, message) in candidates {
            if self.attempted.insert((class, key, frontier)) {
                self.remaining -= 1;
                return Ok(Some((class, message)));
            }
        }
        Ok(None)
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining == 0
    }
}
