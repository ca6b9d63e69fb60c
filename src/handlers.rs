use std::{convert::Infallible, time::Instant};

use axum::{
    extract::State,
    http::header::CONTENT_TYPE,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use futures_util::StreamExt;
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

use crate::{
    errors::AppError,
    models::{BackendId, ChatReply, ChatRequest, DeltaEvent, DoneEvent},
    normalize::{NormalizedResponse, ResponseEvent},
    state::AppState,
};

pub async fn healthz() -> &'static str {
    "ok"
}

pub async fn metrics(State(state): State<AppState>) -> Response {
    state.metrics.observe_availability(&state.tracker.snapshot());
    match state.metrics.render() {
        Ok(body) => (
            [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(error) => AppError::Internal(format!("metrics render failed: {error}")).into_response(),
    }
}

pub async fn api_status(State(state): State<AppState>) -> Response {
    Json(state.probe.check_once().await).into_response()
}

pub async fn chat(State(state): State<AppState>, Json(request): Json<ChatRequest>) -> Response {
    let started = Instant::now();
    let stream = request.stream;
    let _inflight = state.metrics.inflight_guard();

    let response = match process_chat(state.clone(), request).await {
        Ok(response) => response,
        Err(error) => error.into_response(),
    };

    state.metrics.observe_request(
        "/chat",
        "POST",
        stream,
        response.status().as_u16(),
        started.elapsed(),
    );

    response
}

async fn process_chat(state: AppState, request: ChatRequest) -> Result<Response, AppError> {
    request.validate().map_err(AppError::BadRequest)?;

    let request_id = format!("chat_{}", Uuid::new_v4());
    let span = info_span!("chat", request_id = %request_id);
    info!(
        parent: &span,
        turns = request.messages.len(),
        stream = request.stream,
        "chat request accepted"
    );

    let answer = state
        .controller
        .respond(&request.messages)
        .instrument(span.clone())
        .await;

    if request.stream {
        Ok(stream_reply(answer, span))
    } else {
        one_shot_reply(answer).instrument(span).await
    }
}

async fn one_shot_reply(answer: NormalizedResponse) -> Result<Response, AppError> {
    let backend = backend_label(answer.served_by());
    let reply = answer.collect_text().await;
    info!(backend, chars = reply.len(), "reply assembled");

    Ok(Json(ChatReply { reply, backend }).into_response())
}

fn stream_reply(mut answer: NormalizedResponse, span: tracing::Span) -> Response {
    let backend = backend_label(answer.served_by());

    let outbound = async_stream::stream! {
        while let Some(event) = answer.next().await {
            match event {
                ResponseEvent::Delta(delta) => {
                    yield Ok::<Event, Infallible>(json_event(&DeltaEvent { text: &delta }));
                }
                ResponseEvent::Done(full) => {
                    info!(parent: &span, backend, chars = full.len(), "stream finished");
                    yield Ok::<Event, Infallible>(json_event(&DoneEvent { done: true, backend }));
                }
            }
        }

        yield Ok::<Event, Infallible>(Event::default().data("[DONE]"));
    };

    Sse::new(outbound)
        .keep_alive(KeepAlive::new().interval(std::time::Duration::from_secs(10)))
        .into_response()
}

fn backend_label(backend: Option<BackendId>) -> &'static str {
    backend.map(BackendId::as_str).unwrap_or("unavailable")
}

fn json_event<T: serde::Serialize>(payload: &T) -> Event {
    match serde_json::to_string(payload) {
        Ok(serialized) => Event::default().data(serialized),
        Err(error) => {
            let fallback = serde_json::json!({
                "error": {
                    "message": format!("serialization error: {error}"),
                    "type": "server_error"
                }
            });
            Event::default().data(fallback.to_string())
        }
    }
}
