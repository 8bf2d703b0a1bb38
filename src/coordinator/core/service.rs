//! The coordinator service: the task that owns the [`Protocol`] and serializes every request and
//! timer tick.

use std::time::Duration;

use tokio::time::{self, Instant, MissedTickBehavior};

use crate::{
    common::model::Model,
    coordinator::{
        core::{
            aggregator::Aggregator,
            events::{EventPublisher, EventSubscriber},
            protocol::{Event, Protocol},
            requests::{Request, RequestReceiver, ResponseSender, ServiceHandle},
            selector::Selector,
        },
        settings::FederatedLearningSettings,
    },
};

/// The coordinator service. It processes one request or one tick at a time, so that the state
/// transitions of the [`Protocol`] never interleave.
pub struct Service<S, A> {
    protocol: Protocol<S, A>,
    requests: RequestReceiver,
    events: EventPublisher,
    tick_interval: Duration,
}

impl<S, A> Service<S, A>
where
    S: Selector,
    A: Aggregator,
{
    /// Create a new service, the handle through which requests are sent to it, and the
    /// subscriber through which its state can be observed.
    pub fn new(
        settings: FederatedLearningSettings,
        model: Model,
        selector: S,
        aggregator: A,
    ) -> (Self, ServiceHandle, EventSubscriber) {
        let tick_interval = settings.liveness_check_interval();
        let protocol = Protocol::new(settings, model, selector, aggregator);
        let (events, subscriber) = EventPublisher::init(
            protocol.round_number(),
            protocol.phase(),
            protocol.theta(),
        );
        let (requests, handle) = RequestReceiver::new();

        let service = Self {
            protocol,
            requests,
            events,
            tick_interval,
        };
        (service, handle, subscriber)
    }

    /// Run the service until every [`ServiceHandle`] is dropped.
    pub async fn run(mut self) {
        let mut ticks = time::interval(self.tick_interval);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                request = self.requests.recv() => match request {
                    Some((request, span)) => {
                        let _enter = span.enter();
                        self.handle_request(request);
                    }
                    None => {
                        info!("all the service handles were dropped: shutting down");
                        return;
                    }
                },
                _ = ticks.tick() => {
                    trace!("tick");
                    self.protocol.tick(Instant::now());
                    self.publish_events();
                }
            }
        }
    }

    /// Handle a request. The events it triggered are published before the response is sent, so
    /// that the requester observes them.
    fn handle_request(&mut self, request: Request) {
        let now = Instant::now();
        match request {
            Request::Rendezvous { id, resp_tx } => {
                let response = self.protocol.rendezvous(id, now);
                debug!("rendezvous: {:?}", response);
                self.respond(resp_tx, response);
            }
            Request::Rejoin { id, resp_tx } => {
                let response = self.protocol.rejoin(id, now);
                debug!("rendezvous: {:?}", response);
                self.respond(resp_tx, response);
            }
            Request::Heartbeat {
                id,
                state,
                round,
                resp_tx,
            } => {
                let response = self.protocol.heartbeat(id, state, round, now);
                self.respond(resp_tx, response);
            }
            Request::StartTraining { id, resp_tx } => {
                let response = self.protocol.start_training(id, now);
                if let Err(ref e) = response {
                    warn!("start training rejected: {}", e);
                }
                self.respond(resp_tx, response);
            }
            Request::EndTraining {
                id,
                request,
                resp_tx,
            } => {
                let response = self.protocol.end_training(id, request, now);
                if let Err(ref e) = response {
                    warn!("end training rejected: {}", e);
                }
                self.respond(resp_tx, response);
            }
        }
    }

    fn respond<R>(&mut self, resp_tx: ResponseSender<R>, response: R) {
        self.publish_events();
        if resp_tx.send(response).is_err() {
            warn!("failed to send response: the requester is gone");
        }
    }

    /// Publish the pending protocol events.
    fn publish_events(&mut self) {
        while let Some(event) = self.protocol.next_event() {
            match event {
                Event::PhaseChanged(phase, round) => {
                    self.events.set_round(round);
                    self.events.broadcast_phase(phase);
                }
                Event::RoundStarted(round, selected) => {
                    debug!("round {} started with {:?}", round, selected);
                }
                Event::ModelUpdated(model) => self.events.broadcast_model(model),
                Event::RoundClosed(report) => self.events.broadcast_report(report),
            }
        }
    }
}

/// Spawn a coordinator service with the default selector and aggregator.
pub fn spawn(
    settings: FederatedLearningSettings,
    model: Model,
) -> (tokio::task::JoinHandle<()>, ServiceHandle, EventSubscriber) {
    let (service, handle, subscriber) = Service::new(
        settings,
        model,
        super::selector::RandomSelector,
        super::aggregator::FederatedAverage,
    );
    (tokio::spawn(service.run()), handle, subscriber)
}
