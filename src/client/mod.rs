//! The participant side of the protocol.
//!
//! A [`Participant`] drives an [`ApiClient`] through the protocol: it rendezvous with the
//! coordinator, polls it with heartbeats, and whenever it observes that it has been selected for a
//! round, fetches the global model, trains it with its [`Trainer`] and submits the result.

#[cfg(feature = "reqwest-client")]
mod http;
#[cfg(feature = "reqwest-client")]
pub use self::http::{HttpApiClient, HttpApiClientError};

use std::{error::Error, sync::Arc, time::Duration};

use thiserror::Error;
use tokio::time;
use tracing_futures::Instrument;

use crate::{
    common::{client::ParticipantId, model::Model},
    coordinator::{
        core::{RequestError, ServiceHandle},
        models::{
            EndTrainingReply,
            EndTrainingRequest,
            HeartbeatReply,
            HeartbeatRequest,
            History,
            Metrics,
            RendezvousReply,
            RendezvousResponse,
            StartTrainingReply,
            State,
            ThetaUpdate,
        },
    },
};

/// An error returned by an [`ApiClient`].
pub trait ApiError: Error + Send + Sync + 'static {
    /// Whether the coordinator refused the request because it does not know the participant.
    fn is_unknown_participant(&self) -> bool;
}

/// An interface that API clients implement
#[async_trait]
pub trait ApiClient: Send {
    type Error: ApiError;

    /// Rendezvous with the coordinator, as a new participant if `id` is `None`.
    async fn rendezvous(
        &mut self,
        id: Option<ParticipantId>,
    ) -> Result<RendezvousReply, Self::Error>;

    /// Send a heartbeat.
    async fn heartbeat(
        &mut self,
        id: ParticipantId,
        request: HeartbeatRequest,
    ) -> Result<HeartbeatReply, Self::Error>;

    /// Fetch the global model to train on.
    async fn start_training(&mut self, id: ParticipantId)
        -> Result<StartTrainingReply, Self::Error>;

    /// Submit the result of the local training.
    async fn end_training(
        &mut self,
        id: ParticipantId,
        request: EndTrainingRequest,
    ) -> Result<EndTrainingReply, Self::Error>;
}

impl ApiError for RequestError {
    fn is_unknown_participant(&self) -> bool {
        matches!(self, RequestError::UnknownParticipant(_))
    }
}

#[async_trait]
impl ApiClient for ServiceHandle {
    type Error = RequestError;

    async fn rendezvous(
        &mut self,
        id: Option<ParticipantId>,
    ) -> Result<RendezvousReply, Self::Error> {
        let (response, id) = ServiceHandle::rendezvous(self, id).await?;
        Ok(RendezvousReply { response, id })
    }

    async fn heartbeat(
        &mut self,
        id: ParticipantId,
        request: HeartbeatRequest,
    ) -> Result<HeartbeatReply, Self::Error> {
        let (phase, round) =
            ServiceHandle::heartbeat(self, id, request.state.into(), request.round).await?;
        Ok(HeartbeatReply {
            state: phase.into(),
            round,
        })
    }

    async fn start_training(
        &mut self,
        id: ParticipantId,
    ) -> Result<StartTrainingReply, Self::Error> {
        let task = ServiceHandle::start_training(self, id).await?;
        Ok(StartTrainingReply {
            theta: task.theta,
            epochs: task.epochs,
            epoch_base: task.epoch_base,
        })
    }

    async fn end_training(
        &mut self,
        id: ParticipantId,
        request: EndTrainingRequest,
    ) -> Result<EndTrainingReply, Self::Error> {
        ServiceHandle::end_training(self, id, request).await?;
        Ok(EndTrainingReply {})
    }
}

/// What a participant has to train.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingTask {
    /// The global model.
    pub theta: Arc<Model>,
    /// Number of local epochs to run.
    pub epochs: u32,
    /// Number of epochs already run in the previous rounds.
    pub epoch_base: u32,
}

/// The result of a local training.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingResult {
    pub theta_prime: Model,
    pub num_examples: u64,
    pub history: History,
    pub metrics: Metrics,
}

/// The local training procedure of a participant.
#[async_trait]
pub trait Trainer: Send {
    type Error: Error + Send + Sync + 'static;

    async fn train(&mut self, task: TrainingTask) -> Result<TrainingResult, Self::Error>;
}

#[derive(Debug, Error)]
/// Errors that stop a participant.
pub enum ParticipantError {
    #[error("request to the coordinator failed: {0}")]
    Api(Box<dyn Error + Send + Sync>),
    #[error("local training failed: {0}")]
    Training(Box<dyn Error + Send + Sync>),
    #[error("the coordinator accepted the participant without assigning an id")]
    MissingId,
}

/// Timing settings of a participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParticipantSettings {
    /// Time between two heartbeats.
    pub heartbeat_interval: Duration,
    /// Time to wait before retrying a rendezvous answered with `LATER`.
    pub rendezvous_retry: Duration,
}

impl Default for ParticipantSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(1),
            rendezvous_retry: Duration::from_secs(1),
        }
    }
}

/// A participant in the training.
pub struct Participant<C, T> {
    client: C,
    trainer: T,
    settings: ParticipantSettings,
    id: Option<ParticipantId>,
    /// The local state reported in heartbeats.
    state: State,
    /// The last round number the coordinator reported.
    round: u32,
    rounds_trained: u32,
}

impl<C, T> Participant<C, T>
where
    C: ApiClient,
    T: Trainer,
{
    pub fn new(client: C, trainer: T, settings: ParticipantSettings) -> Self {
        Self {
            client,
            trainer,
            settings,
            id: None,
            state: State::Standby,
            round: 0,
            rounds_trained: 0,
        }
    }

    /// Take part in the training until the coordinator finishes.
    ///
    /// # Returns
    /// The number of rounds to which the participant contributed an update.
    ///
    /// # Errors
    /// Fails if the coordinator cannot be reached or if the local training fails. Refused
    /// training requests are logged and do not stop the participant.
    pub async fn run(mut self) -> Result<u32, ParticipantError> {
        let id = self.rendezvous().await?;
        let span = info_span!("participant", participant = %id);
        self.poll(id).instrument(span).await
    }

    /// Send heartbeats until the coordinator finishes, and train whenever selected.
    async fn poll(&mut self, mut id: ParticipantId) -> Result<u32, ParticipantError> {
        loop {
            let request = HeartbeatRequest {
                state: self.state,
                round: self.round,
            };
            let reply = match self.client.heartbeat(id, request).await {
                Ok(reply) => reply,
                Err(e) if e.is_unknown_participant() => {
                    warn!("the coordinator forgot about us: rendezvous again");
                    self.id = None;
                    id = self.rendezvous().await?;
                    continue;
                }
                Err(e) => return Err(ParticipantError::Api(Box::new(e))),
            };
            trace!("heartbeat reply: {:?}", reply);
            self.round = reply.round;

            match reply.state {
                State::Finished => {
                    info!("training finished after {} rounds", self.rounds_trained);
                    self.state = State::Finished;
                    return Ok(self.rounds_trained);
                }
                State::Round => self.train_round(id).await?,
                State::Standby | State::Ready | State::Training => {
                    time::sleep(self.settings.heartbeat_interval).await
                }
            }
        }
    }

    async fn rendezvous(&mut self) -> Result<ParticipantId, ParticipantError> {
        loop {
            let reply = match self.client.rendezvous(self.id).await {
                Ok(reply) => reply,
                Err(e) if self.id.is_some() && e.is_unknown_participant() => {
                    debug!("our id expired: rendezvous as a new participant");
                    self.id = None;
                    continue;
                }
                Err(e) => return Err(ParticipantError::Api(Box::new(e))),
            };
            match reply.response {
                RendezvousResponse::Accept => {
                    let id = reply.id.ok_or(ParticipantError::MissingId)?;
                    info!("rendezvous accepted, participant id: {}", id);
                    self.id = Some(id);
                    self.state = State::Ready;
                    return Ok(id);
                }
                RendezvousResponse::Later => {
                    debug!("rendezvous: later");
                    time::sleep(self.settings.rendezvous_retry).await;
                }
            }
        }
    }

    /// Fetch the global model, train it while keeping on sending heartbeats, and submit the
    /// result.
    async fn train_round(&mut self, id: ParticipantId) -> Result<(), ParticipantError> {
        let reply = match self.client.start_training(id).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!("start training refused: {}", e);
                return Ok(());
            }
        };
        info!("selected for round {}: training", self.round);
        let task = TrainingTask {
            theta: reply.theta,
            epochs: reply.epochs,
            epoch_base: reply.epoch_base,
        };

        self.state = State::Training;
        let result = {
            let Self {
                client,
                trainer,
                settings,
                round,
                ..
            } = self;
            let mut training = trainer.train(task);
            let mut heartbeats = time::interval(settings.heartbeat_interval);
            loop {
                tokio::select! {
                    result = &mut training => break result,
                    _ = heartbeats.tick() => {
                        let request = HeartbeatRequest {
                            state: State::Training,
                            round: *round,
                        };
                        if let Err(e) = client.heartbeat(id, request).await {
                            warn!("heartbeat during training failed: {}", e);
                        }
                    }
                }
            }
        };
        self.state = State::Ready;
        let result = result.map_err(|e| ParticipantError::Training(Box::new(e)))?;

        let request = EndTrainingRequest {
            theta_update: ThetaUpdate {
                theta_prime: result.theta_prime,
                num_examples: result.num_examples,
            },
            history: result.history,
            metrics: result.metrics,
        };
        match self.client.end_training(id, request).await {
            Ok(_) => {
                self.rounds_trained += 1;
                info!("update for round {} submitted", self.round);
            }
            Err(e) => warn!("end training refused: {}", e),
        }
        Ok(())
    }
}
