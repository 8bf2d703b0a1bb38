//! The coordinator core: the state machine and the components it drives.

pub mod aggregator;
pub mod events;
pub mod liveness;
pub mod protocol;
pub mod registry;
pub mod requests;
pub mod round;
pub mod selector;
pub mod service;

pub use self::{
    aggregator::{Aggregation, Aggregator, FederatedAverage},
    events::{Event, EventListener, EventPublisher, EventSubscriber},
    protocol::{
        ClosedBy,
        CoordinatorPhase,
        Protocol,
        RequestError,
        RoundOutcome,
        RoundReport,
        StartTraining,
    },
    registry::ParticipantState,
    requests::ServiceHandle,
    selector::{RandomSelector, Selector},
    service::{spawn, Service},
};
