//! HTTP transport.
//!
//! Publish is a plain request/response; subscribe is a full-duplex stream on
//! one request. The client writes JSON-encoded string commands (`"INIT"`,
//! `"ACK"`, `"NACK"`, `"BACK"`, `"DACK <seconds>"`) into the request body and
//! reads one JSON object per delivered message from the response body. The
//! exchange is lock-step: each command resolves the previous delivery and
//! pulls the next one.

use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use miniqueue_broker::{Broker, Consumer, ConsumerError};
use miniqueue_store::Value;

#[derive(Clone)]
pub struct AppState {
    pub broker: Arc<Broker>,
    pub metrics: Option<PrometheusHandle>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/publish/:topic", post(publish))
        .route("/subscribe/:topic", post(subscribe))
        .route("/metrics", get(render_metrics))
        .route("/:topic", delete(purge))
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}

async fn publish(
    State(state): State<AppState>,
    Path(topic): Path<String>,
    body: Bytes,
) -> Response {
    if topic.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "invalid topic value");
    }
    tracing::info!(topic, "publishing to topic");
    metrics::counter!("miniqueue_publish_total").increment(1);
    match state.broker.publish(&topic, Value::new(body)).await {
        Ok(()) => StatusCode::CREATED.into_response(),
        Err(err) => {
            tracing::error!(topic, error = %err, "publish failed");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "error publishing to broker",
            )
        }
    }
}

async fn purge(State(state): State<AppState>, Path(topic): Path<String>) -> Response {
    tracing::info!(topic, "purging topic");
    match state.broker.purge(&topic).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(err) => {
            tracing::error!(topic, error = %err, "purge failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "error purging topic")
        }
    }
}

async fn render_metrics(State(state): State<AppState>) -> Response {
    match state.metrics {
        Some(handle) => handle.render().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn subscribe(
    State(state): State<AppState>,
    Path(topic): Path<String>,
    body: Body,
) -> Response {
    if topic.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "invalid topic value");
    }
    tracing::info!(topic, "subscribing to topic");
    let consumer = state.broker.subscribe(&topic).await;
    let (responses_tx, responses_rx) = mpsc::channel::<Result<String, Infallible>>(16);
    tokio::spawn(run_subscribe_session(
        Arc::clone(&state.broker),
        consumer,
        body.into_data_stream(),
        responses_tx,
    ));

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/x-ndjson")
        .body(Body::from_stream(ReceiverStream::new(responses_rx)))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// One line of the subscribe response stream.
#[derive(Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubscribeResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg: Option<String>,
    #[serde(rename = "dackCount", default, skip_serializing_if = "Option::is_none")]
    pub dack_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

enum SessionCommand {
    Init,
    Ack,
    Nack,
    Back,
    Dack(u32),
}

fn parse_session_command(line: &str) -> Result<SessionCommand, &'static str> {
    // Commands arrive JSON-encoded from well-behaved clients; fall back to
    // the raw line so hand-driven sessions (curl) work too.
    let text = serde_json::from_str::<String>(line).unwrap_or_else(|_| line.to_string());
    let mut words = text.split_whitespace();
    match words.next().unwrap_or_default() {
        "INIT" => Ok(SessionCommand::Init),
        "ACK" => Ok(SessionCommand::Ack),
        "NACK" => Ok(SessionCommand::Nack),
        "BACK" => Ok(SessionCommand::Back),
        "DACK" => {
            let arg = words.next().ok_or("too few arguments")?;
            let seconds = arg
                .parse::<u32>()
                .ok()
                .filter(|seconds| *seconds > 0)
                .ok_or("invalid DACK duration argument")?;
            Ok(SessionCommand::Dack(seconds))
        }
        _ => Err("unrecognised command received"),
    }
}

/// Drive one subscribe connection: read commands from the request body,
/// write deliveries into the response channel. Ends when the client closes
/// either direction; an unresolved delivery is nacked on the way out.
pub async fn run_subscribe_session<S, E>(
    broker: Arc<Broker>,
    mut consumer: Consumer,
    mut commands: S,
    responses: mpsc::Sender<Result<String, Infallible>>,
) where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: std::fmt::Display,
{
    let topic = consumer.topic().to_string();
    let cancel = CancellationToken::new();
    let mut buf = BytesMut::new();

    loop {
        let line = tokio::select! {
            line = next_line(&mut commands, &mut buf) => match line {
                Some(Ok(line)) => line,
                Some(Err(err)) => {
                    tracing::debug!(topic, error = %err, "subscribe request stream failed");
                    break;
                }
                None => {
                    tracing::debug!(topic, "subscribe request stream ended");
                    break;
                }
            },
            _ = responses.closed() => break,
        };

        let command = match parse_session_command(&line) {
            Ok(command) => command,
            Err(message) => {
                tracing::warn!(topic, line, message, "bad subscribe command");
                if respond_error(&responses, message).await.is_err() {
                    break;
                }
                continue;
            }
        };

        // Every command except INIT resolves the outstanding delivery first.
        let resolved = match command {
            SessionCommand::Init => Ok(()),
            SessionCommand::Ack => consumer.ack(),
            SessionCommand::Nack => consumer.nack().await,
            SessionCommand::Back => consumer.back().await,
            SessionCommand::Dack(seconds) => consumer.dack(seconds),
        };
        if let Err(err) = resolved {
            if respond_error(&responses, &err.to_string()).await.is_err() {
                break;
            }
            continue;
        }

        let value = tokio::select! {
            value = consumer.next(&cancel) => match value {
                Ok(value) => value,
                Err(err @ ConsumerError::OutstandingMessage) => {
                    if respond_error(&responses, &err.to_string()).await.is_err() {
                        break;
                    }
                    continue;
                }
                Err(err) => {
                    tracing::error!(topic, error = %err, "getting next value failed");
                    let _ = respond_error(&responses, "error getting next value for consumer").await;
                    break;
                }
            },
            _ = responses.closed() => break,
        };

        metrics::counter!("miniqueue_delivered_total").increment(1);
        let response = SubscribeResponse {
            msg: Some(String::from_utf8_lossy(&value.raw).into_owned()),
            dack_count: Some(value.dack_count),
            error: None,
        };
        if respond(&responses, &response).await.is_err() {
            break;
        }
    }

    // Client is gone: return any outstanding message, then deregister.
    if consumer.has_outstanding() {
        if let Err(err) = consumer.nack().await {
            tracing::warn!(topic, error = %err, "nack on disconnect failed");
        }
    }
    if let Err(err) = broker.unsubscribe(&topic, consumer.id()).await {
        tracing::warn!(topic, error = %err, "unsubscribe on disconnect failed");
    }
}

/// Pull the next newline-terminated line out of the body stream. Returns
/// `None` once the stream ends and the buffer is drained.
async fn next_line<S, E>(commands: &mut S, buf: &mut BytesMut) -> Option<Result<String, E>>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
{
    loop {
        if let Some(pos) = buf.iter().position(|&b| b == b'\n') {
            let line = buf.split_to(pos + 1);
            let text = String::from_utf8_lossy(&line[..pos]).trim().to_string();
            if text.is_empty() {
                continue;
            }
            return Some(Ok(text));
        }
        match commands.next().await {
            Some(Ok(chunk)) => buf.extend_from_slice(&chunk),
            Some(Err(err)) => return Some(Err(err)),
            None => {
                let text = String::from_utf8_lossy(buf).trim().to_string();
                buf.clear();
                if text.is_empty() {
                    return None;
                }
                return Some(Ok(text));
            }
        }
    }
}

async fn respond(
    responses: &mpsc::Sender<Result<String, Infallible>>,
    response: &SubscribeResponse,
) -> Result<(), ()> {
    let mut line = serde_json::to_string(response).map_err(|_| ())?;
    line.push('\n');
    responses.send(Ok(line)).await.map_err(|_| ())
}

async fn respond_error(
    responses: &mpsc::Sender<Result<String, Infallible>>,
    message: &str,
) -> Result<(), ()> {
    respond(
        responses,
        &SubscribeResponse {
            error: Some(message.to_string()),
            ..Default::default()
        },
    )
    .await
}
