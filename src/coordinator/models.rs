//! Messages exchanged between the coordinator and the participants.
//!
//! Field names follow the coordinator wire protocol. The [`State`] enum is shared on the wire by
//! the coordinator phase and the participant's self-reported state; internally these are kept
//! apart as [`CoordinatorPhase`] and [`ParticipantState`].

use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::{collections::HashMap, sync::Arc};

use crate::{
    common::{client::ParticipantId, model::Model},
    coordinator::core::{CoordinatorPhase, ParticipantState},
};

/// Wire representation of a coordinator phase or of a participant state.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, IntoPrimitive, TryFromPrimitive,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(i32)]
pub enum State {
    Standby = 0,
    Round = 1,
    Finished = 2,
    Ready = 3,
    Training = 4,
}

/// Response to a rendezvous request.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, IntoPrimitive, TryFromPrimitive,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(i32)]
pub enum RendezvousResponse {
    /// The participant is registered.
    Accept = 0,
    /// The coordinator cannot take the participant now: retry later.
    Later = 1,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RendezvousReply {
    pub response: RendezvousResponse,
    /// The identifier to use in all subsequent requests. Only set when the participant is
    /// accepted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<ParticipantId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub state: State,
    pub round: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatReply {
    pub state: State,
    pub round: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartTrainingReply {
    pub theta: Arc<Model>,
    pub epochs: u32,
    pub epoch_base: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThetaUpdate {
    pub theta_prime: Model,
    pub num_examples: u64,
}

/// Per-epoch values of each metric reported by a participant's trainer.
pub type History = HashMap<String, Vec<f64>>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metrics {
    /// Identifier chosen by the participant, typically the index of its data partition.
    pub id: u32,
    /// Number of training examples per class.
    pub per_class_counts: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndTrainingRequest {
    pub theta_update: ThetaUpdate,
    #[serde(default)]
    pub history: History,
    #[serde(default)]
    pub metrics: Metrics,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndTrainingReply {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReply {
    pub error: String,
}

impl From<CoordinatorPhase> for State {
    fn from(phase: CoordinatorPhase) -> Self {
        match phase {
            CoordinatorPhase::Standby => State::Standby,
            CoordinatorPhase::Ready => State::Ready,
            CoordinatorPhase::Round => State::Round,
            CoordinatorPhase::Finished => State::Finished,
        }
    }
}

impl From<ParticipantState> for State {
    fn from(state: ParticipantState) -> Self {
        match state {
            ParticipantState::Standby => State::Standby,
            ParticipantState::Ready => State::Ready,
            ParticipantState::Round => State::Round,
            ParticipantState::Training => State::Training,
            ParticipantState::Finished => State::Finished,
        }
    }
}

impl From<State> for ParticipantState {
    fn from(state: State) -> Self {
        match state {
            State::Standby => ParticipantState::Standby,
            State::Ready => ParticipantState::Ready,
            State::Round => ParticipantState::Round,
            State::Training => ParticipantState::Training,
            State::Finished => ParticipantState::Finished,
        }
    }
}
