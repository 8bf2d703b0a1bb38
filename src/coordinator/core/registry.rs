//! The participant registry: the single authoritative mapping from participant id to participant
//! record.

use std::collections::{hash_map, HashMap};
use thiserror::Error;
use tokio::time::Instant;

use crate::common::client::ParticipantId;

/// The state a participant reports about itself. This is what the participant claims to be
/// doing, not what the coordinator is doing (see [`CoordinatorPhase`]).
///
/// [`CoordinatorPhase`]: crate::coordinator::core::CoordinatorPhase
#[derive(Eq, PartialEq, Hash, Debug, Copy, Clone, derive_more::Display)]
pub enum ParticipantState {
    Standby,
    Ready,
    Round,
    Training,
    Finished,
}

/// A participant that rendezvoused with the coordinator.
#[derive(Debug, Clone, PartialEq)]
pub struct Participant {
    pub id: ParticipantId,
    /// The last state reported by the participant.
    pub local_state: ParticipantState,
    /// The last round number reported by the participant.
    pub reported_round: u32,
    /// The last time the coordinator heard from the participant.
    pub last_heartbeat_at: Instant,
    /// The round the participant is currently invited into, if any.
    pub selected_for_round: Option<u32>,
}

impl Participant {
    fn new(id: ParticipantId, now: Instant) -> Self {
        Self {
            id,
            local_state: ParticipantState::Standby,
            reported_round: 0,
            last_heartbeat_at: now,
            selected_for_round: None,
        }
    }

    /// Refresh the liveness timestamp.
    pub fn touch(&mut self, now: Instant) {
        self.last_heartbeat_at = now;
    }

    /// Record a heartbeat.
    pub fn record_heartbeat(&mut self, state: ParticipantState, round: u32, now: Instant) {
        self.local_state = state;
        self.reported_round = round;
        self.touch(now);
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("registry is full ({0} participants)")]
    Full(usize),
    #[error("participant {0} is already registered")]
    AlreadyRegistered(ParticipantId),
}

/// A store for all the participants the coordinator is tracking.
#[derive(Debug)]
pub struct Registry {
    participants: HashMap<ParticipantId, Participant>,
    /// Maximal number of registered participants
    capacity: usize,
}

impl Registry {
    pub fn new(capacity: usize) -> Self {
        Self {
            participants: HashMap::new(),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.participants.len() >= self.capacity
    }

    pub fn contains(&self, id: &ParticipantId) -> bool {
        self.participants.contains_key(id)
    }

    pub fn get(&self, id: &ParticipantId) -> Option<&Participant> {
        self.participants.get(id)
    }

    pub fn get_mut(&mut self, id: &ParticipantId) -> Option<&mut Participant> {
        self.participants.get_mut(id)
    }

    /// Register a new participant.
    ///
    /// # Errors
    /// Fails if the registry is full or if the participant is already registered. In both cases
    /// the registry is left untouched.
    pub fn insert(&mut self, id: ParticipantId, now: Instant) -> Result<(), RegistryError> {
        if self.is_full() {
            return Err(RegistryError::Full(self.capacity));
        }
        match self.participants.entry(id) {
            hash_map::Entry::Occupied(_) => Err(RegistryError::AlreadyRegistered(id)),
            hash_map::Entry::Vacant(entry) => {
                entry.insert(Participant::new(id, now));
                Ok(())
            }
        }
    }

    pub fn remove(&mut self, id: &ParticipantId) -> Option<Participant> {
        self.participants.remove(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Participant> {
        self.participants.values()
    }

    /// Clear the round invitation of every participant.
    pub fn clear_selection(&mut self) {
        for participant in self.participants.values_mut() {
            participant.selected_for_round = None;
        }
    }

    /// Remove every participant for which `predicate` returns `true`, and return their ids.
    pub fn remove_where<F>(&mut self, mut predicate: F) -> Vec<ParticipantId>
    where
        F: FnMut(&Participant) -> bool,
    {
        let removed: Vec<ParticipantId> = self
            .participants
            .values()
            .filter(|participant| predicate(participant))
            .map(|participant| participant.id)
            .collect();
        for id in removed.iter() {
            self.participants.remove(id);
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_insert_is_unique() {
        let now = Instant::now();
        let mut registry = Registry::new(10);
        let id = ParticipantId::new();

        assert_eq!(registry.insert(id, now), Ok(()));
        assert_eq!(
            registry.insert(id, now),
            Err(RegistryError::AlreadyRegistered(id))
        );
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_capacity() {
        let now = Instant::now();
        let mut registry = Registry::new(2);
        registry.insert(ParticipantId::new(), now).unwrap();
        registry.insert(ParticipantId::new(), now).unwrap();
        assert!(registry.is_full());
        assert_eq!(
            registry.insert(ParticipantId::new(), now),
            Err(RegistryError::Full(2))
        );
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_record_heartbeat() {
        let now = Instant::now();
        let later = now + Duration::from_secs(3);
        let mut registry = Registry::new(10);
        let id = ParticipantId::new();
        registry.insert(id, now).unwrap();

        registry
            .get_mut(&id)
            .unwrap()
            .record_heartbeat(ParticipantState::Training, 4, later);
        let participant = registry.get(&id).unwrap();
        assert_eq!(participant.local_state, ParticipantState::Training);
        assert_eq!(participant.reported_round, 4);
        assert_eq!(participant.last_heartbeat_at, later);
    }

    #[test]
    fn test_remove_where() {
        let now = Instant::now();
        let mut registry = Registry::new(10);
        let (a, b) = (ParticipantId::new(), ParticipantId::new());
        registry.insert(a, now).unwrap();
        registry.insert(b, now).unwrap();
        registry.get_mut(&b).unwrap().touch(now + Duration::from_secs(5));

        let removed = registry.remove_where(|p| p.last_heartbeat_at == now);
        assert_eq!(removed, vec![a]);
        assert!(!registry.contains(&a));
        assert!(registry.contains(&b));
    }
}
