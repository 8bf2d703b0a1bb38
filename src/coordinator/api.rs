//! The RPC gateway: an HTTP/JSON API exposing the four participant operations, and read-only
//! views of the coordinator state.

use std::{convert::Infallible, future::Future, net::SocketAddr};

use thiserror::Error;
use tracing_futures::Instrument;
use warp::{
    http::StatusCode,
    reply::{self, Reply},
    Filter,
};

use crate::{
    common::client::ParticipantId,
    coordinator::{
        core::{EventSubscriber, RequestError, ServiceHandle},
        models::{
            EndTrainingReply,
            EndTrainingRequest,
            ErrorReply,
            HeartbeatReply,
            HeartbeatRequest,
            RendezvousReply,
            StartTrainingReply,
        },
        settings::ApiSettings,
    },
};

#[derive(Debug, Error)]
/// Errors of the HTTP server.
pub enum ApiError {
    #[error("failed to bind the HTTP server: {0}")]
    Bind(#[from] warp::Error),
}

/// Starts an HTTP server at the configured address and runs it until `shutdown` resolves.
///
/// # Errors
/// Fails if the server cannot be bound to the configured address.
pub async fn serve<F>(
    api_settings: ApiSettings,
    handle: ServiceHandle,
    subscriber: EventSubscriber,
    shutdown: F,
) -> Result<(), ApiError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let (addr, server) = bind(api_settings.bind_address, handle, subscriber, shutdown)?;
    info!("HTTP API listening on {}", addr);
    server.await;
    Ok(())
}

/// Binds an HTTP server to `addr`, and returns the bound address together with the server
/// future.
///
/// # Errors
/// Fails if the server cannot be bound to `addr`.
pub fn bind<F>(
    addr: SocketAddr,
    handle: ServiceHandle,
    subscriber: EventSubscriber,
    shutdown: F,
) -> Result<(SocketAddr, impl Future<Output = ()>), ApiError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let (addr, server) =
        warp::serve(routes(handle, subscriber)).try_bind_with_graceful_shutdown(addr, shutdown)?;
    Ok((addr, server.instrument(info_span!("api", %addr))))
}

/// The API routes.
pub fn routes(
    handle: ServiceHandle,
    subscriber: EventSubscriber,
) -> impl Filter<Extract = impl Reply, Error = Infallible> + Clone {
    let rendezvous = warp::path!("rendezvous")
        .map(|| None)
        .or(warp::path!("rendezvous" / ParticipantId).map(Some))
        .unify()
        .and(warp::post())
        .and(with_handle(handle.clone()))
        .and_then(handle_rendezvous);

    let heartbeat = warp::path!("heartbeat" / ParticipantId)
        .and(warp::post())
        .and(warp::body::json())
        .and(with_handle(handle.clone()))
        .and_then(handle_heartbeat);

    let start_training = warp::path!("start_training" / ParticipantId)
        .and(warp::post())
        .and(with_handle(handle.clone()))
        .and_then(handle_start_training);

    let end_training = warp::path!("end_training" / ParticipantId)
        .and(warp::post())
        .and(warp::body::json())
        .and(with_handle(handle))
        .and_then(handle_end_training);

    let state = warp::path!("state")
        .and(warp::get())
        .and(with_subscriber(subscriber.clone()))
        .map(|subscriber: EventSubscriber| {
            let latest = subscriber.phase_listener().get_latest();
            reply::json(&HeartbeatReply {
                state: latest.event.into(),
                round: latest.round,
            })
        });

    let model = warp::path!("model")
        .and(warp::get())
        .and(with_subscriber(subscriber.clone()))
        .map(|subscriber: EventSubscriber| {
            reply::json(&subscriber.model_listener().get_latest().event)
        });

    let results = warp::path!("results")
        .and(warp::get())
        .and(with_subscriber(subscriber))
        .map(|subscriber: EventSubscriber| {
            reply::json(&subscriber.reports_listener().get_latest().event)
        });

    rendezvous
        .or(heartbeat)
        .or(start_training)
        .or(end_training)
        .or(state)
        .or(model)
        .or(results)
        .recover(handle_reject)
        .with(warp::log("http"))
}

/// Handles and responds to a rendezvous request.
async fn handle_rendezvous(
    id: Option<ParticipantId>,
    handle: ServiceHandle,
) -> Result<reply::Response, Infallible> {
    Ok(match handle.rendezvous(id).await {
        Ok((response, id)) => reply::json(&RendezvousReply { response, id }).into_response(),
        Err(e) => error_reply(e),
    })
}

/// Handles and responds to a heartbeat.
async fn handle_heartbeat(
    id: ParticipantId,
    request: HeartbeatRequest,
    handle: ServiceHandle,
) -> Result<reply::Response, Infallible> {
    Ok(
        match handle
            .heartbeat(id, request.state.into(), request.round)
            .await
        {
            Ok((phase, round)) => reply::json(&HeartbeatReply {
                state: phase.into(),
                round,
            })
            .into_response(),
            Err(e) => error_reply(e),
        },
    )
}

/// Handles and responds to a start training request.
async fn handle_start_training(
    id: ParticipantId,
    handle: ServiceHandle,
) -> Result<reply::Response, Infallible> {
    Ok(match handle.start_training(id).await {
        Ok(task) => reply::json(&StartTrainingReply {
            theta: task.theta,
            epochs: task.epochs,
            epoch_base: task.epoch_base,
        })
        .into_response(),
        Err(e) => error_reply(e),
    })
}

/// Handles and responds to an end training request.
async fn handle_end_training(
    id: ParticipantId,
    request: EndTrainingRequest,
    handle: ServiceHandle,
) -> Result<reply::Response, Infallible> {
    Ok(match handle.end_training(id, request).await {
        Ok(()) => reply::json(&EndTrainingReply {}).into_response(),
        Err(e) => error_reply(e),
    })
}

/// The status code corresponding to a refused request.
fn status_code(error: &RequestError) -> StatusCode {
    match error {
        RequestError::UnknownParticipant(_) => StatusCode::NOT_FOUND,
        RequestError::NoActiveRound
        | RequestError::NotSelected(..)
        | RequestError::NotStarted(..)
        | RequestError::DuplicateUpdate(..)
        | RequestError::TrainingFinished => StatusCode::CONFLICT,
        RequestError::InvalidUpdate(_) => StatusCode::BAD_REQUEST,
        RequestError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_reply(error: RequestError) -> reply::Response {
    let code = status_code(&error);
    if code == StatusCode::INTERNAL_SERVER_ERROR {
        error!("failed to handle request: {}", error);
    } else {
        debug!("request refused: {}", error);
    }
    reply::with_status(
        reply::json(&ErrorReply {
            error: error.to_string(),
        }),
        code,
    )
    .into_response()
}

/// Converts a service handle into a `warp` filter.
fn with_handle(
    handle: ServiceHandle,
) -> impl Filter<Extract = (ServiceHandle,), Error = Infallible> + Clone {
    warp::any().map(move || handle.clone())
}

/// Converts an event subscriber into a `warp` filter.
fn with_subscriber(
    subscriber: EventSubscriber,
) -> impl Filter<Extract = (EventSubscriber,), Error = Infallible> + Clone {
    warp::any().map(move || subscriber.clone())
}

/// Handles `warp` rejections of bad requests.
async fn handle_reject(err: warp::Rejection) -> Result<reply::Response, Infallible> {
    let (code, message) = if err.is_not_found() {
        (StatusCode::NOT_FOUND, "not found".to_string())
    } else if let Some(e) = err.find::<warp::filters::body::BodyDeserializeError>() {
        (StatusCode::BAD_REQUEST, e.to_string())
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        (StatusCode::METHOD_NOT_ALLOWED, "method not allowed".to_string())
    } else if err.find::<warp::reject::UnsupportedMediaType>().is_some() {
        (
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            "unsupported media type".to_string(),
        )
    } else {
        error!("unhandled rejection: {:?}", err);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal error".to_string(),
        )
    };
    Ok(reply::with_status(reply::json(&ErrorReply { error: message }), code).into_response())
}
