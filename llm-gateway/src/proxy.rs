//! The HTTP/WS boundary (ambient, adjacent to the control plane's scope):
//! wires the router, the session manager, and the policy engine to a
//! single forwarding handler. The reverse-proxy transport itself — HTTP/2,
//! connection pooling tuning, chunked streaming copy loops — is out of
//! scope; this module only implements the touch points .2-§4.4
//! name: route selection before the upstream call, metering around it, and
//! a kill-signal race so an in-flight call is abandoned the instant the
//! session is killed.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::post;
use axum::Router as AxumRouter;

use crate::error::GatewayError;
use crate::extract::{extract_tool_calls, extract_usage};
use crate::http::{map_gateway_error, HttpError};
use crate::policy::{ContentTarget, SessionMetrics};
use crate::router::RouteOutcome;
use crate::session::Direction;
use crate::state::GatewayState;

const BACKEND_HEADER: &str = "x-llm-gateway-backend";

pub fn make_router(state: GatewayState) -> AxumRouter {
    AxumRouter::new().route("/v1/chat/completions", post(forward)).with_state(state)
}

fn route_outcome_to_error(outcome: RouteOutcome) -> GatewayError {
    match outcome {
        RouteOutcome::ModelBlocked => GatewayError::ModelBlocked,
        RouteOutcome::ModelNotAllowed => GatewayError::ModelNotAllowed,
    }
}

fn client_address(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .unwrap_or("unknown")
        .to_owned()
}

/// Forwards a single chat-completion request: select a backend, meter the
/// request body against the session, race the upstream call against the
/// session's kill signal, then meter and policy-evaluate the response.
async fn forward(State(state): State<GatewayState>, headers: HeaderMap, body: axum::body::Bytes) -> Result<impl IntoResponse, HttpError> {
    let header_backend = headers.get(BACKEND_HEADER).and_then(|v| v.to_str().ok());

    let backend = state
        .router
        .select(&crate::router::RouteRequest { header_backend, path: "/v1/chat/completions", body: &body })
        .map_err(route_outcome_to_error)
        .map_err(map_gateway_error)?
        .clone();

    let client_address = client_address(&headers);
    let session = state
        .manager
        .get_or_create_by_client(client_address, backend.name.clone())
        .await
        .map_err(map_gateway_error)?;

    session.record_request(&backend.name).await;
    session.add_bytes(Direction::In, body.len() as u64).await;

    let request_result = state.policy.evaluate_content(&session.id().await, &body, ContentTarget::Request);
    if request_result.should_terminate {
        session.terminate().await;
        return Err(HttpError::forbidden().msg("request terminated by policy"));
    }
    if request_result.should_block {
        return Err(HttpError::forbidden().msg("request blocked by policy"));
    }

    let kill = session.kill_signal().await;
    let upstream_call = forward_to_backend(&backend.url, &body);

    let response_body = tokio::select! {
        result = upstream_call => result.map_err(HttpError::bad_gateway().err())?,
        () = kill.wait() => {
            return Err(HttpError::forbidden().msg("session was killed"));
        }
    };

    session.add_bytes(Direction::Out, response_body.len() as u64).await;
    session.add_tokens(extract_usage(&response_body)).await;

    for call in extract_tool_calls(&response_body, &session.id().await) {
        session.record_tool_call(call.tool_name, call.tool_type, call.request_id).await;
    }

    let response_result = state.policy.evaluate_content(&session.id().await, &response_body, ContentTarget::Response);

    state.policy.capture_request(&session.id().await, &body, &response_body);

    if response_result.should_terminate {
        session.terminate().await;
        return Err(HttpError::forbidden().msg("response terminated by policy"));
    }
    if response_result.should_block {
        return Err(HttpError::forbidden().msg("response blocked by policy"));
    }

    let snapshot = session.snapshot().await;
    let metrics = SessionMetrics {
        bytes_in: snapshot.data.bytes_in,
        bytes_out: snapshot.data.bytes_out,
        request_count: snapshot.data.request_count,
        duration_secs: snapshot.data.duration(time::OffsetDateTime::now_utc()).as_seconds_f64(),
        idle_time_secs: 0.0,
        requests_per_minute: snapshot.data.requests_per_minute(time::OffsetDateTime::now_utc()),
    };
    state.policy.evaluate(&snapshot.data.id, &metrics);

    Ok((StatusCode::OK, response_body))
}

/// The one point this crate actually touches the network for — a plain
/// non-streaming forward. Full chunked/SSE streaming is out of scope.
async fn forward_to_backend(url: &str, body: &[u8]) -> anyhow::Result<Vec<u8>> {
    let client = reqwest::Client::new();
    let response = client.post(url).body(body.to_vec()).send().await?;
    let bytes = response.bytes().await?;
    Ok(bytes.to_vec())
}
