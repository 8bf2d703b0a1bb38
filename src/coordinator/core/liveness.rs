//! The liveness monitor: expires participants whose heartbeats stopped arriving.

use std::time::Duration;
use tokio::time::Instant;

use crate::{
    common::client::ParticipantId,
    coordinator::core::registry::{Participant, Registry},
};

/// Decides whether participants are alive, based on the time of their last heartbeat.
///
/// The monitor is consulted lazily (when selecting participants, when a participant sends a
/// heartbeat) and periodically, by the coordinator service, to sweep the registry.
#[derive(Debug, Clone, Copy)]
pub struct LivenessMonitor {
    timeout: Duration,
}

impl LivenessMonitor {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Whether the participant sent a heartbeat within the timeout.
    pub fn is_alive(&self, participant: &Participant, now: Instant) -> bool {
        now.saturating_duration_since(participant.last_heartbeat_at) <= self.timeout
    }

    /// Ids of the registered participants that are alive at `now`.
    pub fn live_participants(&self, registry: &Registry, now: Instant) -> Vec<ParticipantId> {
        registry
            .iter()
            .filter(|participant| self.is_alive(participant, now))
            .map(|participant| participant.id)
            .collect()
    }

    /// Remove the dead participants from the registry and return their ids.
    pub fn expire(&self, registry: &mut Registry, now: Instant) -> Vec<ParticipantId> {
        let expired = registry.remove_where(|participant| !self.is_alive(participant, now));
        for id in expired.iter() {
            info!("participant {} expired: no heartbeat for {:?}", id, self.timeout);
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expire() {
        let start = Instant::now();
        let monitor = LivenessMonitor::new(Duration::from_secs(10));
        let mut registry = Registry::new(10);
        let (quiet, chatty) = (ParticipantId::new(), ParticipantId::new());
        registry.insert(quiet, start).unwrap();
        registry.insert(chatty, start).unwrap();

        let now = start + Duration::from_secs(8);
        registry.get_mut(&chatty).unwrap().touch(now);
        assert!(monitor.expire(&mut registry, now).is_empty());

        // exactly at the timeout the participant is still alive
        let now = start + Duration::from_secs(10);
        assert!(monitor.expire(&mut registry, now).is_empty());

        let now = start + Duration::from_secs(11);
        assert_eq!(monitor.live_participants(&registry, now), vec![chatty]);
        assert_eq!(monitor.expire(&mut registry, now), vec![quiet]);
        assert_eq!(registry.len(), 1);
    }
}
