//! The round selector: chooses which participants are invited into a round.

use rand::seq::IteratorRandom;

use crate::common::client::ParticipantId;

/// A type that picks the participants of a round among the live candidates.
#[cfg_attr(test, mockall::automock)]
pub trait Selector {
    /// Pick `count` participants among `candidates`. Implementations may return fewer
    /// participants if there are not enough candidates. Returned ids that are not candidates are
    /// ignored by the coordinator.
    fn select(&mut self, count: usize, candidates: Vec<ParticipantId>) -> Vec<ParticipantId>;
}

/// Draws a uniformly random subset of the candidates, without replacement.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomSelector;

impl Selector for RandomSelector {
    fn select(&mut self, count: usize, candidates: Vec<ParticipantId>) -> Vec<ParticipantId> {
        candidates
            .into_iter()
            .choose_multiple(&mut rand::thread_rng(), count)
    }
}

/// The number of participants to select among `live` candidates: `max(1, round(fraction *
/// live))`, bounded by the number of candidates.
pub fn selection_size(fraction: f64, live: usize) -> usize {
    if live == 0 {
        return 0;
    }
    let count = (fraction * live as f64).round() as usize;
    count.max(1).min(live)
}
