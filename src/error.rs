use std::io;

use axum::response::{IntoResponse, Response};
use http::StatusCode;
use thiserror::Error;

use crate::frame::PixelFormat;

/// Failure to start a stream session. Nothing acquired during the attempt
/// outlives the error.
#[derive(Debug, Error)]
pub enum OpenError {
    #[error("source unreachable: {0}")]
    SourceUnreachable(String),
    #[error("invalid source descriptor: {0}")]
    InvalidDescriptor(String),
    #[error("source has no video stream")]
    NoVideoStream,
    #[error("no decoder available for codec {0}")]
    UnsupportedCodec(String),
    #[error("decoder init failed: {0}")]
    DecoderInit(String),
}

impl From<io::Error> for OpenError {
    fn from(e: io::Error) -> Self {
        OpenError::SourceUnreachable(e.to_string())
    }
}

/// Failure of a running stream session.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("cannot build pixel conversion for {width}x{height} {format}")]
    ConversionInitFailed {
        width: i32,
        height: i32,
        format: PixelFormat,
    },
    #[error("source read failed: {0}")]
    Read(String),
    #[error("decoder failed: {0}")]
    Decoder(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NegotiationError {
    #[error("malformed offer: {0}")]
    MalformedOffer(String),
    #[error("{step} failed: {message}")]
    StepFailed {
        step: &'static str,
        message: String,
    },
    #[error("negotiation timed out")]
    Timeout,
    #[error("malformed candidate: {0}")]
    MalformedCandidate(String),
    #[error("candidate rejected: {0}")]
    Rejected(String),
    #[error("no active connection")]
    NoActiveConnection,
    #[error("a connection is already active")]
    AlreadyActive,
    #[error("negotiation engine went away")]
    EngineGone,
}

/// Container backend failure. Handled inside the persistence engine.
#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("container backend unavailable: {0}")]
    Unavailable(String),
    #[error("unsupported geometry {width}x{height}")]
    Geometry { width: u32, height: u32 },
    #[error("frame encode failed: {0}")]
    Encode(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    Conflict(String),
    Timeout(String),
    InternalServerError(anyhow::Error),
}

impl AppError {
    pub fn bad_request<T>(t: T) -> Self
    where
        T: ToString,
    {
        AppError::BadRequest(t.to_string())
    }
}

impl From<NegotiationError> for AppError {
    fn from(err: NegotiationError) -> Self {
        match err {
            NegotiationError::MalformedOffer(_)
            | NegotiationError::MalformedCandidate(_)
            | NegotiationError::Rejected(_) => AppError::BadRequest(err.to_string()),
            NegotiationError::AlreadyActive | NegotiationError::NoActiveConnection => {
                AppError::Conflict(err.to_string())
            }
            NegotiationError::Timeout => AppError::Timeout(err.to_string()),
            NegotiationError::StepFailed { .. } | NegotiationError::EngineGone => {
                AppError::InternalServerError(err.into())
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::BadRequest(err) => (StatusCode::BAD_REQUEST, err).into_response(),
            AppError::Conflict(err) => (StatusCode::CONFLICT, err).into_response(),
            AppError::Timeout(err) => (StatusCode::GATEWAY_TIMEOUT, err).into_response(),
            AppError::InternalServerError(err) => {
                (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
            }
        }
    }
}
