//! This module provides the `Request`, [`ServiceHandle`] and [`RequestReceiver`] types, through
//! which the RPC gateway talks to the coordinator service.

use derive_more::From;
use tokio::sync::{mpsc, oneshot};
use tracing::Span;

use crate::{
    common::client::ParticipantId,
    coordinator::{
        core::{
            protocol::{CoordinatorPhase, RequestError, StartTraining},
            registry::ParticipantState,
        },
        models::{EndTrainingRequest, RendezvousResponse},
    },
};

/// A channel for the service to send the response to a [`Request`].
pub type ResponseSender<R> = oneshot::Sender<R>;

/// A request to the coordinator service.
#[derive(Debug)]
pub enum Request {
    /// Rendezvous of a new participant, under an id drawn by the handle.
    Rendezvous {
        id: ParticipantId,
        resp_tx: ResponseSender<RendezvousResponse>,
    },
    /// Rendezvous of a participant that was assigned an id before.
    Rejoin {
        id: ParticipantId,
        resp_tx: ResponseSender<Result<RendezvousResponse, RequestError>>,
    },
    Heartbeat {
        id: ParticipantId,
        state: ParticipantState,
        round: u32,
        resp_tx: ResponseSender<Result<(CoordinatorPhase, u32), RequestError>>,
    },
    StartTraining {
        id: ParticipantId,
        resp_tx: ResponseSender<Result<StartTraining, RequestError>>,
    },
    EndTraining {
        id: ParticipantId,
        request: EndTrainingRequest,
        resp_tx: ResponseSender<Result<(), RequestError>>,
    },
}

/// A handle to send requests to the coordinator [`Service`].
///
/// [`Service`]: crate::coordinator::core::Service
#[derive(Clone, From, Debug)]
pub struct ServiceHandle(mpsc::UnboundedSender<(Request, Span)>);

impl ServiceHandle {
    async fn request<R, F>(&self, span: Span, make_request: F) -> Result<R, RequestError>
    where
        F: FnOnce(ResponseSender<R>) -> Request,
    {
        let (resp_tx, resp_rx) = oneshot::channel::<R>();
        self.0.send((make_request(resp_tx), span)).map_err(|_| {
            RequestError::Internal(
                "failed to send request to the coordinator: the coordinator is shutting down",
            )
        })?;
        resp_rx
            .await
            .map_err(|_| RequestError::Internal("failed to receive response from the coordinator"))
    }

    /// Rendezvous with the coordinator. A participant without an id is assigned a new one. A
    /// participant with an id must still be registered.
    ///
    /// # Returns
    /// The response and, if the participant is accepted, the id it must use from now on.
    ///
    /// # Errors
    /// Fails with [`RequestError::UnknownParticipant`] if the given id is not registered.
    pub async fn rendezvous(
        &self,
        id: Option<ParticipantId>,
    ) -> Result<(RendezvousResponse, Option<ParticipantId>), RequestError> {
        let (response, id) = match id {
            Some(id) => {
                let span = debug_span!("rendezvous", participant = %id);
                let response = self
                    .request(span, |resp_tx| Request::Rejoin { id, resp_tx })
                    .await??;
                (response, id)
            }
            None => {
                let id = ParticipantId::new();
                let span = debug_span!("rendezvous", participant = %id);
                let response = self
                    .request(span, |resp_tx| Request::Rendezvous { id, resp_tx })
                    .await?;
                (response, id)
            }
        };
        match response {
            RendezvousResponse::Accept => Ok((response, Some(id))),
            RendezvousResponse::Later => Ok((response, None)),
        }
    }

    /// Send a heartbeat.
    ///
    /// # Returns
    /// The phase the participant observes and the current round number.
    pub async fn heartbeat(
        &self,
        id: ParticipantId,
        state: ParticipantState,
        round: u32,
    ) -> Result<(CoordinatorPhase, u32), RequestError> {
        let span = trace_span!("heartbeat", participant = %id);
        self.request(span, |resp_tx| Request::Heartbeat {
            id,
            state,
            round,
            resp_tx,
        })
        .await?
    }

    /// Fetch the global model to train on.
    pub async fn start_training(&self, id: ParticipantId) -> Result<StartTraining, RequestError> {
        let span = debug_span!("start_training", participant = %id);
        self.request(span, |resp_tx| Request::StartTraining { id, resp_tx })
            .await?
    }

    /// Submit the result of the local training.
    pub async fn end_training(
        &self,
        id: ParticipantId,
        request: EndTrainingRequest,
    ) -> Result<(), RequestError> {
        let span = debug_span!("end_training", participant = %id);
        self.request(span, |resp_tx| Request::EndTraining {
            id,
            request,
            resp_tx,
        })
        .await?
    }

    #[cfg(test)]
    pub fn is_closed(&self) -> bool {
        self.0.is_closed()
    }
}

/// The receiver half of the `Request` channel that is used by the [`Service`] to receive
/// requests.
///
/// [`Service`]: crate::coordinator::core::Service
#[derive(From, Debug)]
pub struct RequestReceiver(mpsc::UnboundedReceiver<(Request, Span)>);

impl RequestReceiver {
    /// Creates a new `Request` channel and returns the [`RequestReceiver`] as well as the
    /// [`ServiceHandle`] half.
    pub fn new() -> (Self, ServiceHandle) {
        let (tx, rx) = mpsc::unbounded_channel::<(Request, Span)>();
        (RequestReceiver::from(rx), ServiceHandle::from(tx))
    }

    /// Receives the next request. Returns `None` once every handle is dropped.
    pub async fn recv(&mut self) -> Option<(Request, Span)> {
        self.0.recv().await
    }
}
