//! The record of an active round.

use std::collections::{HashMap, HashSet};
use tokio::time::Instant;

use crate::{
    common::client::ParticipantId,
    coordinator::models::{EndTrainingRequest, History, Metrics, ThetaUpdate},
};

/// The data a participant submitted at the end of its training.
#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    pub update: ThetaUpdate,
    pub history: History,
    pub metrics: Metrics,
}

impl From<EndTrainingRequest> for Submission {
    fn from(request: EndTrainingRequest) -> Self {
        let EndTrainingRequest {
            theta_update,
            history,
            metrics,
        } = request;
        Self {
            update: theta_update,
            history,
            metrics,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum SubmitError {
    NotSelected,
    NotStarted,
    Duplicate,
}

/// A round in progress.
#[derive(Debug)]
pub struct Round {
    /// Round number.
    pub number: u32,
    /// Cumulative number of epochs of the previous rounds.
    pub epoch_base: u32,
    /// The time after which the round closes with whatever was submitted.
    pub deadline: Instant,
    selected: HashSet<ParticipantId>,
    /// Selected participants that fetched the model of this round.
    started: HashSet<ParticipantId>,
    submitted: HashMap<ParticipantId, Submission>,
}

impl Round {
    pub fn new(
        number: u32,
        selected: HashSet<ParticipantId>,
        epoch_base: u32,
        deadline: Instant,
    ) -> Self {
        Self {
            number,
            epoch_base,
            deadline,
            selected,
            started: HashSet::new(),
            submitted: HashMap::new(),
        }
    }

    pub fn selected(&self) -> &HashSet<ParticipantId> {
        &self.selected
    }

    pub fn is_selected(&self, id: &ParticipantId) -> bool {
        self.selected.contains(id)
    }

    pub fn has_submitted(&self, id: &ParticipantId) -> bool {
        self.submitted.contains_key(id)
    }

    pub fn has_started(&self, id: &ParticipantId) -> bool {
        self.started.contains(id)
    }

    /// Record that a selected participant fetched the model of this round.
    pub fn start(&mut self, id: ParticipantId) -> Result<(), SubmitError> {
        if !self.is_selected(&id) {
            return Err(SubmitError::NotSelected);
        }
        if self.has_submitted(&id) {
            return Err(SubmitError::Duplicate);
        }
        self.started.insert(id);
        Ok(())
    }

    /// Whether the participant was selected and has not submitted yet.
    pub fn is_expected(&self, id: &ParticipantId) -> bool {
        self.is_selected(id) && !self.has_submitted(id)
    }

    /// Store a submission. Only participants that fetched the model of this round may submit,
    /// and the first submission of a participant is never overwritten.
    pub fn submit(&mut self, id: ParticipantId, submission: Submission) -> Result<(), SubmitError> {
        if !self.is_selected(&id) {
            return Err(SubmitError::NotSelected);
        }
        if !self.has_started(&id) {
            return Err(SubmitError::NotStarted);
        }
        if self.has_submitted(&id) {
            return Err(SubmitError::Duplicate);
        }
        self.submitted.insert(id, submission);
        Ok(())
    }

    pub fn submission(&self, id: &ParticipantId) -> Option<&Submission> {
        self.submitted.get(id)
    }

    /// Whether every selected participant that is still alive submitted its update.
    pub fn is_complete<F>(&self, is_alive: F) -> bool
    where
        F: Fn(&ParticipantId) -> bool,
    {
        self.selected
            .iter()
            .all(|id| self.has_submitted(id) || !is_alive(id))
    }

    pub fn is_past_deadline(&self, now: Instant) -> bool {
        now >= self.deadline
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use std::time::Duration;

    fn submission(num_examples: u64) -> Submission {
        Submission {
            update: ThetaUpdate {
                theta_prime: vec![array![1.0].into_dyn()],
                num_examples,
            },
            history: History::new(),
            metrics: Metrics::default(),
        }
    }

    #[test]
    fn test_duplicate_is_rejected() {
        let (a, b) = (ParticipantId::new(), ParticipantId::new());
        let mut round = Round::new(0, vec![a].into_iter().collect(), 0, Instant::now());

        round.start(a).unwrap();
        assert_eq!(round.submit(a, submission(10)), Ok(()));
        assert_eq!(round.submit(a, submission(99)), Err(SubmitError::Duplicate));
        assert_eq!(round.submission(&a).unwrap().update.num_examples, 10);
        assert_eq!(round.submit(b, submission(1)), Err(SubmitError::NotSelected));
        assert!(!round.has_submitted(&b));
        assert_eq!(round.start(a), Err(SubmitError::Duplicate));
        assert_eq!(round.start(b), Err(SubmitError::NotSelected));
    }

    #[test]
    fn test_submit_requires_start() {
        let a = ParticipantId::new();
        let mut round = Round::new(1, vec![a].into_iter().collect(), 0, Instant::now());

        assert_eq!(round.submit(a, submission(5)), Err(SubmitError::NotStarted));
        assert!(!round.has_submitted(&a));
        assert!(round.is_expected(&a));

        round.start(a).unwrap();
        assert!(round.has_started(&a));
        assert_eq!(round.submit(a, submission(5)), Ok(()));
    }

    #[test]
    fn test_is_complete() {
        let (a, b) = (ParticipantId::new(), ParticipantId::new());
        let mut round = Round::new(3, vec![a, b].into_iter().collect(), 6, Instant::now());
        assert!(!round.is_complete(|_| true));
        assert!(round.is_expected(&a));

        round.start(a).unwrap();
        round.start(b).unwrap();
        round.submit(a, submission(1)).unwrap();
        assert!(!round.is_expected(&a));
        assert!(!round.is_complete(|_| true));
        // a dead participant does not hold the round back
        assert!(round.is_complete(|id| *id != b));

        round.submit(b, submission(1)).unwrap();
        assert!(round.is_complete(|_| true));
    }

    #[test]
    fn test_deadline() {
        let now = Instant::now();
        let round = Round::new(0, HashSet::new(), 0, now + Duration::from_secs(5));
        assert!(!round.is_past_deadline(now));
        assert!(round.is_past_deadline(now + Duration::from_secs(5)));
    }
}
