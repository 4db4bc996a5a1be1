//! HTTP face of a [`MemoryRendezvous`] store.
//!
//! ```text
//! POST   /signal/check                  -> {"caller": bool}
//! POST   /signal/offer | /signal/answer -> 204
//! GET    /signal/offer | /signal/answer -> 200 description | 204
//! POST   /signal/candidates/{is_caller} -> 204
//! GET    /signal/candidates/{is_caller} -> 200 [candidate] | 204
//! DELETE /signal                        -> 204, store emptied
//! ```
//!
//! The candidate path carries the requester's own role; a GET drains the
//! candidates the other role posted.

use std::net::SocketAddr;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use pollrtc::{Candidate, MemoryRendezvous, Role, SessionDescription};
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

pub fn router(store: MemoryRendezvous) -> Router {
    Router::new()
        .route("/signal", axum::routing::delete(reset))
        .route("/signal/check", post(check))
        .route("/signal/offer", get(get_offer).post(post_offer))
        .route("/signal/answer", get(get_answer).post(post_answer))
        .route(
            "/signal/candidates/:is_caller",
            get(get_candidates).post(post_candidate),
        )
        .with_state(store)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Serves `store` on an already bound listener until the task is dropped.
pub async fn serve(listener: TcpListener, store: MemoryRendezvous) -> std::io::Result<()> {
    let addr = listener.local_addr()?;
    info!(%addr, "rendezvous store listening");
    axum::serve(listener, router(store)).await
}

/// Binds `addr` and serves a fresh store.
pub async fn bind_and_serve(addr: SocketAddr) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    serve(listener, MemoryRendezvous::new()).await?;
    Ok(())
}

fn role_from_tag(tag: &str) -> Result<Role, StatusCode> {
    match tag {
        "true" => Ok(Role::Caller),
        "false" => Ok(Role::Receiver),
        _ => Err(StatusCode::BAD_REQUEST),
    }
}

fn description_response(description: Option<SessionDescription>) -> Response {
    match description {
        Some(description) => Json(description).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

async fn check(State(store): State<MemoryRendezvous>) -> Json<serde_json::Value> {
    let caller = store.claim_caller();
    debug!(caller, "role check");
    Json(json!({ "caller": caller }))
}

async fn post_offer(
    State(store): State<MemoryRendezvous>,
    Json(offer): Json<SessionDescription>,
) -> StatusCode {
    debug!(len = offer.sdp.len(), "stored offer");
    store.store_offer(offer);
    StatusCode::NO_CONTENT
}

async fn get_offer(State(store): State<MemoryRendezvous>) -> Response {
    description_response(store.offer())
}

async fn post_answer(
    State(store): State<MemoryRendezvous>,
    Json(answer): Json<SessionDescription>,
) -> StatusCode {
    debug!(len = answer.sdp.len(), "stored answer");
    store.store_answer(answer);
    StatusCode::NO_CONTENT
}

async fn get_answer(State(store): State<MemoryRendezvous>) -> Response {
    description_response(store.answer())
}

async fn post_candidate(
    State(store): State<MemoryRendezvous>,
    Path(is_caller): Path<String>,
    Json(candidate): Json<Candidate>,
) -> Result<StatusCode, StatusCode> {
    let role = role_from_tag(&is_caller)?;
    store
        .push_candidate(role, candidate)
        .map_err(|_| StatusCode::BAD_REQUEST)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn get_candidates(
    State(store): State<MemoryRendezvous>,
    Path(is_caller): Path<String>,
) -> Result<Response, StatusCode> {
    let role = role_from_tag(&is_caller)?;
    let candidates = store
        .take_candidates_for(role)
        .map_err(|_| StatusCode::BAD_REQUEST)?;
    if candidates.is_empty() {
        return Ok(StatusCode::NO_CONTENT.into_response());
    }
    debug!(count = candidates.len(), %role, "delivering candidates");
    Ok(Json(candidates).into_response())
}

async fn reset(State(store): State<MemoryRendezvous>) -> StatusCode {
    store.reset();
    info!("rendezvous store reset");
    StatusCode::NO_CONTENT
}
