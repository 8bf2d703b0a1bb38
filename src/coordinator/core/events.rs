//! This module provides the `Event`, [`EventPublisher`] and [`EventSubscriber`] types, through
//! which the coordinator service publishes snapshots of its state.
//!
//! Readers never go through the service: they read the latest snapshot of a watch channel.

use std::sync::Arc;

use tokio::sync::watch;

use crate::{
    common::model::Model,
    coordinator::core::protocol::{CoordinatorPhase, RoundReport},
};

/// An event emitted by the coordinator.
#[derive(Debug, Clone, PartialEq)]
pub struct Event<E> {
    /// The round during which this event was emitted.
    pub round: u32,
    /// The event itself
    pub event: E,
}

/// A convenience type to emit any coordinator event.
#[derive(Debug)]
pub struct EventPublisher {
    round: u32,
    phase_tx: EventBroadcaster<CoordinatorPhase>,
    model_tx: EventBroadcaster<Arc<Model>>,
    reports_tx: EventBroadcaster<Arc<Vec<RoundReport>>>,
}

/// The `EventSubscriber` hands out `EventListener`s for any coordinator event.
#[derive(Debug, Clone)]
pub struct EventSubscriber {
    phase_rx: EventListener<CoordinatorPhase>,
    model_rx: EventListener<Arc<Model>>,
    reports_rx: EventListener<Arc<Vec<RoundReport>>>,
}

impl EventPublisher {
    /// Initialize a new event publisher with the given initial events.
    pub fn init(round: u32, phase: CoordinatorPhase, model: Arc<Model>) -> (Self, EventSubscriber) {
        let (phase_tx, phase_rx) = watch::channel(Event {
            round,
            event: phase,
        });
        let (model_tx, model_rx) = watch::channel(Event {
            round,
            event: model,
        });
        let (reports_tx, reports_rx) = watch::channel(Event {
            round,
            event: Arc::new(Vec::new()),
        });

        let publisher = EventPublisher {
            round,
            phase_tx: phase_tx.into(),
            model_tx: model_tx.into(),
            reports_tx: reports_tx.into(),
        };
        let subscriber = EventSubscriber {
            phase_rx: phase_rx.into(),
            model_rx: model_rx.into(),
            reports_rx: reports_rx.into(),
        };
        (publisher, subscriber)
    }

    /// Set the round that is attached to the events the publisher broadcasts.
    pub fn set_round(&mut self, round: u32) {
        self.round = round;
    }

    fn event<T>(&self, event: T) -> Event<T> {
        Event {
            round: self.round,
            event,
        }
    }

    /// Emit a phase event
    pub fn broadcast_phase(&mut self, phase: CoordinatorPhase) {
        self.phase_tx.broadcast(self.event(phase));
    }

    /// Emit a model event
    pub fn broadcast_model(&mut self, model: Arc<Model>) {
        self.model_tx.broadcast(self.event(model));
    }

    /// Append a round report to the published reports.
    pub fn broadcast_report(&mut self, report: RoundReport) {
        let round = self.round;
        self.reports_tx.0.send_modify(|latest| {
            latest.round = round;
            Arc::make_mut(&mut latest.event).push(report);
        });
    }
}

impl EventSubscriber {
    /// Get a listener for new phase events
    pub fn phase_listener(&self) -> EventListener<CoordinatorPhase> {
        self.phase_rx.clone()
    }

    /// Get a listener for new model events
    pub fn model_listener(&self) -> EventListener<Arc<Model>> {
        self.model_rx.clone()
    }

    /// Get a listener for the reports of the closed rounds
    pub fn reports_listener(&self) -> EventListener<Arc<Vec<RoundReport>>> {
        self.reports_rx.clone()
    }
}

/// A listener for coordinator events. It can be used to either retrieve the latest `Event<E>`
/// emitted by the coordinator (with `EventListener::get_latest`) or to wait for the next one
/// (with `EventListener::changed`).
#[derive(Debug, Clone)]
pub struct EventListener<E>(watch::Receiver<Event<E>>);

impl<E> From<watch::Receiver<Event<E>>> for EventListener<E> {
    fn from(receiver: watch::Receiver<Event<E>>) -> Self {
        EventListener(receiver)
    }
}

impl<E> EventListener<E>
where
    E: Clone,
{
    pub fn get_latest(&self) -> Event<E> {
        self.0.borrow().clone()
    }

    /// Wait for a new event. Returns `None` once the publisher is gone.
    pub async fn changed(&mut self) -> Option<Event<E>> {
        self.0.changed().await.ok()?;
        Some(self.0.borrow_and_update().clone())
    }
}

/// A channel to send `Event<E>` to all the `EventListener<E>`.
#[derive(Debug)]
pub struct EventBroadcaster<E>(watch::Sender<Event<E>>);

impl<E> EventBroadcaster<E> {
    /// Send `event` to all the `EventListener<E>`
    fn broadcast(&self, event: Event<E>) {
        // the value is stored even when nobody listens
        self.0.send_replace(event);
    }
}

impl<E> From<watch::Sender<Event<E>>> for EventBroadcaster<E> {
    fn from(sender: watch::Sender<Event<E>>) -> Self {
        Self(sender)
    }
}
