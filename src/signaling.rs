//! HTTP transport for negotiation messages.
//!
//! | route             | body                                   | reply                  |
//! |-------------------|----------------------------------------|------------------------|
//! | `POST /offer`     | `{"sdp": "..."}`                       | `{"type":"answer",..}` |
//! | `POST /candidate` | `{"candidate","sdpMid","sdpMLineIndex"}` | 204                  |
//! | `PATCH /session`  | `application/trickle-ice-sdpfrag`      | 204                    |
//! | `DELETE /session` |                                        | 204                    |

use std::future::Future;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Request, State};
use axum::routing::{patch, post};
use axum::{Json, Router};
use http::{header, HeaderMap, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, info_span, Level};

use crate::error::{AppError, NegotiationError};
use crate::negotiate::candidate::parse_sdpfrag;
use crate::negotiate::Negotiator;

const SDPFRAG: &str = "application/trickle-ice-sdpfrag";

#[derive(Clone)]
struct SignalingState {
    negotiator: Arc<Negotiator>,
}

#[derive(Debug, Deserialize)]
struct OfferRequest {
    sdp: String,
    #[serde(rename = "type", default)]
    kind: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct AnswerResponse {
    #[serde(rename = "type")]
    pub kind: String,
    pub sdp: String,
}

#[derive(Debug, Deserialize)]
struct CandidateRequest {
    candidate: String,
    #[serde(rename = "sdpMid", default)]
    sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    sdp_mline_index: Option<u16>,
}

pub fn router(negotiator: Arc<Negotiator>, cors: bool) -> Router {
    Router::new()
        .route("/offer", post(offer))
        .route("/candidate", post(candidate))
        .route("/session", patch(trickle).delete(hangup))
        .with_state(SignalingState { negotiator })
        .layer(if cors {
            CorsLayer::permissive()
        } else {
            CorsLayer::new()
        })
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &Request<_>| {
                    info_span!(
                        "http_request",
                        uri = ?request.uri(),
                        method = ?request.method(),
                    )
                })
                .on_response(tower_http::trace::DefaultOnResponse::new().level(Level::INFO))
                .on_failure(tower_http::trace::DefaultOnFailure::new().level(Level::INFO)),
        )
}

/// Serves `app` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, app: Router, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    info!("signaling listening on {}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    info!("signaling stopped");
    Ok(())
}

async fn offer(
    State(state): State<SignalingState>,
    body: Bytes,
) -> Result<Json<AnswerResponse>, AppError> {
    let req: OfferRequest = serde_json::from_slice(&body).map_err(AppError::bad_request)?;
    match req.kind.as_deref() {
        None | Some("offer") => {}
        Some(other) => return Err(AppError::bad_request(format!("expected an offer, got {}", other))),
    }
    let sdp = state.negotiator.handle_offer(&req.sdp).await?;
    Ok(Json(AnswerResponse {
        kind: "answer".to_string(),
        sdp,
    }))
}

async fn candidate(
    State(state): State<SignalingState>,
    body: Bytes,
) -> Result<StatusCode, AppError> {
    let req: CandidateRequest = serde_json::from_slice(&body).map_err(AppError::bad_request)?;
    let mid = req.sdp_mid.unwrap_or_else(|| "0".to_string());
    state
        .negotiator
        .add_ice_candidate(&mid, req.sdp_mline_index.unwrap_or(0), &req.candidate)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn trickle(
    State(state): State<SignalingState>,
    headers: HeaderMap,
    body: String,
) -> Result<StatusCode, AppError> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .ok_or_else(|| AppError::bad_request("Content-Type is required"))?;
    if content_type.to_str().map_err(AppError::bad_request)? != SDPFRAG {
        return Err(AppError::bad_request(format!("Content-Type must be {}", SDPFRAG)));
    }
    let candidates = parse_sdpfrag(&body)?;
    debug!("trickle: {} candidates", candidates.len());
    for candidate in candidates {
        match state.negotiator.add_parsed_candidate(candidate).await {
            Ok(()) | Err(NegotiationError::Rejected(_)) => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn hangup(State(state): State<SignalingState>) -> StatusCode {
    state.negotiator.close().await;
    StatusCode::NO_CONTENT
}
