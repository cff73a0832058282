//! Key state projection
//!
//! Key state is never persisted. It is folded from the establishment events of a
//! KEL in ascending sequence order, and the most recent event overall is tracked
//! alongside the most recent establishment event.

use serde::{Deserialize, Serialize};

use crate::codec::{Digest, PublicKey};
use crate::error::KelError;
use crate::store::KelStore;
use crate::types::{EventKind, KeyEvent, Threshold};

/// Sequence number, digest and kind of a logged event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventLocation {
    pub sn: u64,
    pub digest: Digest,
    pub kind: EventKind,
}

impl EventLocation {
    pub fn of(event: &KeyEvent) -> Result<Self, KelError> {
        Ok(Self {
            sn: event.sn,
            digest: event.digest()?,
            kind: event.kind,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyState {
    pub prefix: String,
    pub keys: Vec<PublicKey>,
    pub threshold: Option<Threshold>,
    /// Commitment the next establishment event must reveal keys for
    pub next: Option<Digest>,
    pub witness_threshold: u64,
    pub witnesses: Vec<String>,
    pub delegator: Option<String>,
    pub last_event: Option<EventLocation>,
    pub last_establishment: Option<EventLocation>,
}

impl KeyState {
    /// Projects the current key state of `prefix` from the store.
    ///
    /// Returns an empty state when no establishment event has been logged yet.
    pub fn project<S: KelStore + ?Sized>(store: &S, prefix: &str) -> Result<Self, KelError> {
        let mut state = Self::default();
        store.stream_establishment(prefix, &mut |message| {
            state.apply_establishment(&message.event)
        })?;
        if state.is_empty() {
            return Ok(state);
        }
        if let Some(current) = store.current_event(prefix)? {
            state.record_event(&current.event)?;
        }
        Ok(state)
    }

    /// Projects the key state that was in force for the event at `sn`, including
    /// that event itself when it is an establishment event.
    pub fn project_at<S: KelStore + ?Sized>(
        store: &S,
        prefix: &str,
        sn: u64,
    ) -> Result<Self, KelError> {
        let mut state = Self::default();
        store.stream_establishment(prefix, &mut |message| {
            if message.event.sn <= sn {
                state.apply_establishment(&message.event)?;
            }
            Ok(())
        })?;
        if state.is_empty() {
            return Ok(state);
        }
        if let Some(event) = store.event_at(prefix, sn)? {
            state.record_event(&event.event)?;
        }
        Ok(state)
    }

    /// Self-referential state of an inception event, used to verify its own signatures.
    pub fn from_inception(event: &KeyEvent) -> Result<Self, KelError> {
        if !event.is_inception() {
            return Err(KelError::InvalidKeyEvent(format!(
                "{} event cannot seed key state",
                event.kind
            )));
        }
        let mut state = Self::default();
        state.apply_establishment(event)?;
        Ok(state)
    }

    pub fn is_empty(&self) -> bool {
        self.last_establishment.is_none()
    }

    /// Non-transferable (or abandoned) identifiers have no next commitment.
    pub fn is_transferable(&self) -> bool {
        self.next.is_some()
    }

    /// The sequence number the next appended event must carry.
    pub fn next_sn(&self) -> u64 {
        self.last_event.as_ref().map(|l| l.sn + 1).unwrap_or(0)
    }

    pub fn apply(&mut self, event: &KeyEvent) -> Result<(), KelError> {
        if event.is_establishment() {
            self.apply_establishment(event)
        } else {
            self.record_event(event)
        }
    }

    /// Folds one establishment event into the state.
    pub fn apply_establishment(&mut self, event: &KeyEvent) -> Result<(), KelError> {
        if !event.is_establishment() {
            return Err(KelError::Internal(format!(
                "{} event folded as establishment",
                event.kind
            )));
        }
        if self.is_empty() {
            self.prefix = event.prefix.clone();
        }

        self.keys = event.keys.clone();
        self.threshold = event.threshold.clone();
        self.next = event.next.clone();

        match &event.witnesses {
            Some(witnesses) => self.witnesses = witnesses.clone(),
            None => {
                self.witnesses.retain(|w| !event.witness_cuts.contains(w));
                for witness in &event.witness_adds {
                    if !self.witnesses.contains(witness) {
                        self.witnesses.push(witness.clone());
                    }
                }
            }
        }
        if let Some(threshold) = event.witness_threshold {
            self.witness_threshold = threshold;
        }
        if event.delegator.is_some() {
            self.delegator = event.delegator.clone();
        }

        let location = EventLocation::of(event)?;
        self.last_establishment = Some(location.clone());
        self.last_event = Some(location);
        Ok(())
    }

    fn record_event(&mut self, event: &KeyEvent) -> Result<(), KelError> {
        self.last_event = Some(EventLocation::of(event)?);
        Ok(())
    }
}
