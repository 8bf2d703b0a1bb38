use reqwest::{Client, ClientBuilder, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::{
    client::{ApiClient, ApiError},
    common::client::ParticipantId,
    coordinator::models::{
        EndTrainingReply,
        EndTrainingRequest,
        ErrorReply,
        HeartbeatReply,
        HeartbeatRequest,
        RendezvousReply,
        StartTrainingReply,
    },
};

#[derive(Debug)]
/// A client that communicates with the coordinator's API via HTTP.
pub struct HttpApiClient {
    /// HTTP client
    client: Client,
    /// Coordinator URL
    address: String,
}

impl HttpApiClient {
    /// Creates a new HTTP client for the coordinator at `address`, for instance
    /// `http://127.0.0.1:8081`.
    pub fn new<S>(address: S) -> Result<Self, HttpApiClientError>
    where
        S: Into<String>,
    {
        let client = ClientBuilder::new().build()?;
        Ok(Self {
            client,
            address: address.into().trim_end_matches('/').to_string(),
        })
    }

    fn post(&self, path: &str) -> RequestBuilder {
        self.client.post(format!("{}/{}", self.address, path))
    }

    async fn send<R>(request: RequestBuilder) -> Result<R, HttpApiClientError>
    where
        R: DeserializeOwned,
    {
        let resp = request.send().await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp.json().await?);
        }
        let message = match resp.json::<ErrorReply>().await {
            Ok(reply) => reply.error,
            Err(_) => String::new(),
        };
        Err(HttpApiClientError::Refused { status, message })
    }
}

/// Error returned by an [`HttpApiClient`]
#[derive(Debug, Error)]
pub enum HttpApiClientError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("request refused by the coordinator ({status}): {message}")]
    Refused { status: StatusCode, message: String },
}

impl ApiError for HttpApiClientError {
    fn is_unknown_participant(&self) -> bool {
        matches!(
            self,
            HttpApiClientError::Refused {
                status: StatusCode::NOT_FOUND,
                ..
            }
        )
    }
}

#[async_trait]
impl ApiClient for HttpApiClient {
    type Error = HttpApiClientError;

    async fn rendezvous(
        &mut self,
        id: Option<ParticipantId>,
    ) -> Result<RendezvousReply, Self::Error> {
        let path = match id {
            Some(id) => format!("rendezvous/{}", id),
            None => "rendezvous".to_string(),
        };
        Self::send(self.post(&path)).await
    }

    async fn heartbeat(
        &mut self,
        id: ParticipantId,
        request: HeartbeatRequest,
    ) -> Result<HeartbeatReply, Self::Error> {
        Self::send(self.post(&format!("heartbeat/{}", id)).json(&request)).await
    }

    async fn start_training(
        &mut self,
        id: ParticipantId,
    ) -> Result<StartTrainingReply, Self::Error> {
        Self::send(self.post(&format!("start_training/{}", id))).await
    }

    async fn end_training(
        &mut self,
        id: ParticipantId,
        request: EndTrainingRequest,
    ) -> Result<EndTrainingReply, Self::Error> {
        Self::send(self.post(&format!("end_training/{}", id)).json(&request)).await
    }
}
