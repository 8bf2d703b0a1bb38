//! The coordinator state machine.
//!
//! [`Protocol`] owns the coordinator phase, the round counter, the global model, the active round
//! and the participant registry. It is purely synchronous: every method takes the current time
//! and mutates the state in place. The [`Service`] drives it from a single task, which makes
//! every state transition mutually exclusive with every other.
//!
//! Phase transitions and round results are emitted as [`Event`]s that the service publishes.
//!
//! [`Service`]: crate::coordinator::core::Service

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::Arc,
};

use derive_more::Display;
use displaydoc::Display as DisplayDoc;
use thiserror::Error;
use tokio::time::Instant;

use crate::{
    common::{client::ParticipantId, model::Model},
    coordinator::{
        core::{
            aggregator::Aggregator,
            liveness::LivenessMonitor,
            registry::{ParticipantState, Registry},
            round::{Round, SubmitError, Submission},
            selector::{selection_size, Selector},
        },
        models::{EndTrainingRequest, History, Metrics, RendezvousResponse},
        settings::FederatedLearningSettings,
    },
};

/// The global phase of the coordinator.
#[derive(Eq, PartialEq, Hash, Debug, Copy, Clone, Display)]
pub enum CoordinatorPhase {
    /// Fewer than the minimum number of participants rendezvoused.
    Standby,
    /// Waiting to start the next round.
    Ready,
    /// A round is active.
    Round,
    /// All the rounds are done.
    Finished,
}

/// Errors returned to a participant whose request was refused.
#[derive(Debug, DisplayDoc, Error, Clone, PartialEq, Eq)]
pub enum RequestError {
    /// participant {0} is not registered
    UnknownParticipant(ParticipantId),
    /// no round is active
    NoActiveRound,
    /// participant {0} is not selected for round {1}
    NotSelected(ParticipantId, u32),
    /// participant {0} did not start training in round {1}
    NotStarted(ParticipantId, u32),
    /// participant {0} already submitted an update for round {1}
    DuplicateUpdate(ParticipantId, u32),
    /// the training is finished
    TrainingFinished,
    /// invalid update: {0}
    InvalidUpdate(String),
    /// internal error: {0}
    Internal(&'static str),
}

fn submit_error(error: SubmitError, id: ParticipantId, round: u32) -> RequestError {
    match error {
        SubmitError::NotSelected => RequestError::NotSelected(id, round),
        SubmitError::NotStarted => RequestError::NotStarted(id, round),
        SubmitError::Duplicate => RequestError::DuplicateUpdate(id, round),
    }
}

/// What triggered the closure of a round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ClosedBy {
    /// Every live selected participant submitted its update.
    Complete,
    /// The round deadline elapsed.
    Deadline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RoundOutcome {
    /// The global model was replaced by the aggregated updates.
    Aggregated,
    /// No update could be aggregated: the global model is unchanged.
    NoProgress,
}

/// Summary of a closed round.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoundReport {
    pub round: u32,
    pub selected: Vec<ParticipantId>,
    /// Participants whose updates went into the new global model.
    pub contributors: Vec<ParticipantId>,
    /// Participants whose updates could not be aggregated.
    pub discarded: Vec<ParticipantId>,
    /// Selected participants that were dead when the round closed.
    pub dropped: Vec<ParticipantId>,
    pub num_examples: u64,
    pub outcome: RoundOutcome,
    pub closed_by: ClosedBy,
    pub histories: HashMap<ParticipantId, History>,
    pub metrics: HashMap<ParticipantId, Metrics>,
    /// Element-wise sum of the per class counts of the contributors.
    pub class_counts: Vec<u64>,
}

/// Events emitted by the state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// The coordinator entered a new phase.
    PhaseChanged(CoordinatorPhase, u32),
    /// A round started with the given participants.
    RoundStarted(u32, Vec<ParticipantId>),
    /// The global model was replaced.
    ModelUpdated(Arc<Model>),
    /// A round closed.
    RoundClosed(RoundReport),
}

/// The payload handed out to a participant that starts training.
#[derive(Debug, Clone, PartialEq)]
pub struct StartTraining {
    pub theta: Arc<Model>,
    pub epochs: u32,
    pub epoch_base: u32,
}

/// The state machine.
pub struct Protocol<S, A> {
    settings: FederatedLearningSettings,
    phase: CoordinatorPhase,
    /// Number of the current round, which is also the number of closed rounds.
    round_number: u32,
    /// Cumulative number of epochs of the closed rounds.
    epoch_base: u32,
    theta: Arc<Model>,
    round: Option<Round>,
    registry: Registry,
    liveness: LivenessMonitor,
    selector: S,
    aggregator: A,
    /// Events emitted by the state machine
    events: VecDeque<Event>,
}

impl<S, A> Protocol<S, A>
where
    S: Selector,
    A: Aggregator,
{
    pub fn new(
        settings: FederatedLearningSettings,
        theta: Model,
        selector: S,
        aggregator: A,
    ) -> Self {
        Self {
            registry: Registry::new(settings.max_clients as usize),
            liveness: LivenessMonitor::new(settings.heartbeat_timeout()),
            settings,
            phase: CoordinatorPhase::Standby,
            round_number: 0,
            epoch_base: 0,
            theta: Arc::new(theta),
            round: None,
            selector,
            aggregator,
            events: VecDeque::new(),
        }
    }

    pub fn phase(&self) -> CoordinatorPhase {
        self.phase
    }

    pub fn round_number(&self) -> u32 {
        self.round_number
    }

    pub fn epoch_base(&self) -> u32 {
        self.epoch_base
    }

    pub fn theta(&self) -> Arc<Model> {
        self.theta.clone()
    }

    pub fn round(&self) -> Option<&Round> {
        self.round.as_ref()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Retrieve the next event
    pub fn next_event(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    /// Handle a rendezvous request.
    ///
    /// Registered participants are always accepted again. New participants are accepted while
    /// no round is active and the registry is not full. Once the coordinator finished, every
    /// participant is accepted but none is registered.
    pub fn rendezvous(&mut self, id: ParticipantId, now: Instant) -> RendezvousResponse {
        if self.phase == CoordinatorPhase::Finished {
            debug!("rendezvous of {} after the training finished", id);
            return RendezvousResponse::Accept;
        }

        if self.registry.contains(&id) {
            if self.refresh(&id, now).is_ok() {
                debug!("participant {} is already registered", id);
                return RendezvousResponse::Accept;
            }
            // `refresh` removed the participant, which may have been the last one the round was
            // waiting for
            self.maybe_close_round(now);
        }

        if self.phase == CoordinatorPhase::Round {
            debug!("rendezvous of {} during round {}: later", id, self.round_number);
            return RendezvousResponse::Later;
        }

        if let Err(e) = self.registry.insert(id, now) {
            warn!("rejecting rendezvous of {}: {}", id, e);
            return RendezvousResponse::Later;
        }
        info!(
            "participant {} registered ({} participants)",
            id,
            self.registry.len()
        );
        self.maybe_start_round(now);
        RendezvousResponse::Accept
    }

    /// Handle a rendezvous of a participant that already has an id. Only registered
    /// participants are accepted again: ids are assigned by the coordinator.
    ///
    /// # Errors
    /// Fails if the participant is not registered, or expired in the meantime.
    pub fn rejoin(
        &mut self,
        id: ParticipantId,
        now: Instant,
    ) -> Result<RendezvousResponse, RequestError> {
        if self.phase == CoordinatorPhase::Finished {
            return Ok(RendezvousResponse::Accept);
        }
        if let Err(e) = self.refresh(&id, now) {
            self.maybe_close_round(now);
            return Err(e);
        }
        debug!("participant {} is already registered", id);
        Ok(RendezvousResponse::Accept)
    }

    /// Handle a heartbeat. The reply is the phase the participant should observe and the current
    /// round number: during a round, only the selected participants that did not submit their
    /// update yet observe [`CoordinatorPhase::Round`], the others observe
    /// [`CoordinatorPhase::Ready`].
    pub fn heartbeat(
        &mut self,
        id: ParticipantId,
        state: ParticipantState,
        round: u32,
        now: Instant,
    ) -> Result<(CoordinatorPhase, u32), RequestError> {
        if self.phase == CoordinatorPhase::Finished {
            return Ok((CoordinatorPhase::Finished, self.round_number));
        }

        if let Err(e) = self.refresh(&id, now) {
            self.maybe_close_round(now);
            return Err(e);
        }
        if let Some(participant) = self.registry.get_mut(&id) {
            participant.record_heartbeat(state, round, now);
        }
        trace!("heartbeat of {} ({}, round {})", id, state, round);

        let phase = match (self.phase, self.round.as_ref()) {
            (CoordinatorPhase::Round, Some(round)) if round.is_expected(&id) => {
                CoordinatorPhase::Round
            }
            (CoordinatorPhase::Round, _) => CoordinatorPhase::Ready,
            (phase, _) => phase,
        };
        Ok((phase, self.round_number))
    }

    /// Handle a start training request.
    ///
    /// # Errors
    /// Fails if the participant is not selected for the active round or already submitted its
    /// update.
    pub fn start_training(
        &mut self,
        id: ParticipantId,
        now: Instant,
    ) -> Result<StartTraining, RequestError> {
        self.check_request(&id, now)?;
        let round = self.round.as_mut().ok_or(RequestError::NoActiveRound)?;
        let number = round.number;
        round.start(id).map_err(|e| submit_error(e, id, number))?;
        let epoch_base = round.epoch_base;

        if let Some(participant) = self.registry.get_mut(&id) {
            participant.local_state = ParticipantState::Training;
        }
        debug!("participant {} starts training", id);
        Ok(StartTraining {
            theta: self.theta.clone(),
            epochs: self.settings.epochs,
            epoch_base,
        })
    }

    /// Handle an end training request. Only updates of participants that started training in
    /// the active round are accepted, so an update trained on the model of an earlier round is
    /// refused. The first update of a participant is kept, any other update for the same round
    /// is rejected. The round closes as soon as every live selected participant submitted.
    pub fn end_training(
        &mut self,
        id: ParticipantId,
        request: EndTrainingRequest,
        now: Instant,
    ) -> Result<(), RequestError> {
        self.check_request(&id, now)?;
        let round = self.round.as_mut().ok_or(RequestError::NoActiveRound)?;
        let number = round.number;
        if round.is_expected(&id)
            && round.has_started(&id)
            && request.theta_update.num_examples == 0
        {
            return Err(RequestError::InvalidUpdate(
                "the update was trained on zero examples".into(),
            ));
        }
        round
            .submit(id, Submission::from(request))
            .map_err(|e| submit_error(e, id, number))?;

        if let Some(participant) = self.registry.get_mut(&id) {
            participant.local_state = ParticipantState::Ready;
        }
        info!("participant {} submitted its update for round {}", id, number);
        self.maybe_close_round(now);
        Ok(())
    }

    /// Expire the dead participants, close the active round if its deadline elapsed, and start a
    /// new round if possible.
    ///
    /// A round that closes during the tick is not followed by a new round before the next tick,
    /// so that waiting participants get a chance to rendezvous in between.
    pub fn tick(&mut self, now: Instant) {
        if self.phase == CoordinatorPhase::Finished {
            return;
        }
        let waiting = self.round.is_none();
        self.liveness.expire(&mut self.registry, now);

        let past_deadline = self
            .round
            .as_ref()
            .map(|round| round.is_past_deadline(now))
            .unwrap_or(false);
        if past_deadline {
            self.close_round(ClosedBy::Deadline, now);
        } else {
            self.maybe_close_round(now);
        }
        if waiting {
            self.maybe_start_round(now);
        }
    }
}

impl<S, A> Protocol<S, A>
where
    S: Selector,
    A: Aggregator,
{
    /// Refresh the liveness of a registered participant. A participant that is already dead is
    /// removed instead.
    fn refresh(&mut self, id: &ParticipantId, now: Instant) -> Result<(), RequestError> {
        let participant = self
            .registry
            .get_mut(id)
            .ok_or(RequestError::UnknownParticipant(*id))?;
        if !self.liveness.is_alive(participant, now) {
            self.registry.remove(id);
            info!("participant {} expired: no heartbeat for {:?}", id, self.liveness.timeout());
            return Err(RequestError::UnknownParticipant(*id));
        }
        participant.touch(now);
        Ok(())
    }

    /// Common checks for the start and end training requests.
    fn check_request(&mut self, id: &ParticipantId, now: Instant) -> Result<(), RequestError> {
        if self.phase == CoordinatorPhase::Finished {
            return Err(RequestError::TrainingFinished);
        }
        if let Err(e) = self.refresh(id, now) {
            self.maybe_close_round(now);
            return Err(e);
        }
        Ok(())
    }

    fn set_phase(&mut self, phase: CoordinatorPhase) {
        if self.phase != phase {
            info!("phase: {} -> {}", self.phase, phase);
            self.phase = phase;
            self.events
                .push_back(Event::PhaseChanged(phase, self.round_number));
        }
    }

    fn maybe_start_round(&mut self, now: Instant) {
        if self.phase == CoordinatorPhase::Standby
            && self.registry.len() >= self.settings.min_clients as usize
        {
            self.set_phase(CoordinatorPhase::Ready);
        }
        if self.phase != CoordinatorPhase::Ready {
            return;
        }

        self.liveness.expire(&mut self.registry, now);
        let candidates = self.liveness.live_participants(&self.registry, now);
        if candidates.len() < self.settings.min_clients as usize {
            debug!(
                "waiting for participants: {}/{} live",
                candidates.len(),
                self.settings.min_clients
            );
            return;
        }

        let count = selection_size(self.settings.participants_ratio, candidates.len());
        let eligible: HashSet<ParticipantId> = candidates.iter().copied().collect();
        let selected: HashSet<ParticipantId> = self
            .selector
            .select(count, candidates)
            .into_iter()
            .filter(|id| eligible.contains(id))
            .collect();
        if selected.is_empty() {
            warn!("the selector did not select any participant");
            return;
        }

        let number = self.round_number;
        for id in selected.iter() {
            if let Some(participant) = self.registry.get_mut(id) {
                participant.selected_for_round = Some(number);
            }
        }
        info!(
            "starting round {}: {} participants selected out of {}",
            number,
            selected.len(),
            eligible.len()
        );
        self.events
            .push_back(Event::RoundStarted(number, selected.iter().copied().collect()));
        self.round = Some(Round::new(
            number,
            selected,
            self.epoch_base,
            now + self.settings.round_timeout(),
        ));
        self.set_phase(CoordinatorPhase::Round);
    }

    fn is_alive(&self, id: &ParticipantId, now: Instant) -> bool {
        self.registry
            .get(id)
            .map(|participant| self.liveness.is_alive(participant, now))
            .unwrap_or(false)
    }

    fn maybe_close_round(&mut self, now: Instant) {
        let complete = match self.round {
            Some(ref round) => round.is_complete(|id| self.is_alive(id, now)),
            None => false,
        };
        if complete {
            self.close_round(ClosedBy::Complete, now);
        }
    }

    /// Aggregate the updates of the live participants, replace the global model and move to the
    /// next round.
    fn close_round(&mut self, closed_by: ClosedBy, now: Instant) {
        let round = match self.round.take() {
            Some(round) => round,
            None => return,
        };

        let (live, dropped): (Vec<ParticipantId>, Vec<ParticipantId>) = round
            .selected()
            .iter()
            .copied()
            .partition(|id| self.is_alive(id, now));
        let submissions: Vec<(ParticipantId, &Submission)> = live
            .iter()
            .filter_map(|id| round.submission(id).map(|submission| (*id, submission)))
            .collect();
        let updates: Vec<_> = submissions
            .iter()
            .map(|(id, submission)| (*id, &submission.update))
            .collect();

        let aggregation = self.aggregator.aggregate(&self.theta, &updates);
        let outcome = match aggregation.model {
            Some(model) => {
                self.theta = Arc::new(model);
                self.events.push_back(Event::ModelUpdated(self.theta.clone()));
                RoundOutcome::Aggregated
            }
            None => {
                warn!("round {} made no progress: no update to aggregate", round.number);
                RoundOutcome::NoProgress
            }
        };

        let mut class_counts: Vec<u64> = Vec::new();
        for id in aggregation.contributors.iter() {
            if let Some(submission) = round.submission(id) {
                let counts = &submission.metrics.per_class_counts;
                if class_counts.len() < counts.len() {
                    class_counts.resize(counts.len(), 0);
                }
                for (total, count) in class_counts.iter_mut().zip(counts) {
                    *total += count;
                }
            }
        }

        let report = RoundReport {
            round: round.number,
            selected: round.selected().iter().copied().collect(),
            contributors: aggregation.contributors,
            discarded: aggregation.discarded,
            dropped,
            num_examples: aggregation.num_examples,
            outcome,
            closed_by,
            histories: submissions
                .iter()
                .map(|(id, submission)| (*id, submission.history.clone()))
                .collect(),
            metrics: submissions
                .iter()
                .map(|(id, submission)| (*id, submission.metrics.clone()))
                .collect(),
            class_counts,
        };
        info!(
            "round {} closed ({:?}, {:?}): {} contributors, {} examples",
            report.round,
            report.closed_by,
            report.outcome,
            report.contributors.len(),
            report.num_examples
        );
        self.events.push_back(Event::RoundClosed(report));

        self.registry.clear_selection();
        self.round_number += 1;
        self.epoch_base += self.settings.epochs;
        if self.round_number >= self.settings.rounds {
            info!("training complete after {} rounds", self.round_number);
            self.set_phase(CoordinatorPhase::Finished);
        } else {
            self.set_phase(CoordinatorPhase::Ready);
        }
    }
}
