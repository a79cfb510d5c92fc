use std::io;

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, TelemetryError>;

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("invalid value for field: {0}")]
    InvalidField(&'static str),
    #[error("invalid JSON payload: {0}")]
    InvalidJson(String),
    #[error("payload exceeds {0} bytes")]
    PayloadTooLarge(usize),
    #[error("invalid request signature")]
    InvalidSignature,
    #[error("invalid pagination cursor")]
    InvalidCursor,
    #[error("invalid day range: {0}")]
    InvalidDayRange(String),
    #[error("invalid query parameter: {0}")]
    InvalidQuery(String),
    #[error("event not found")]
    NotFound,
    #[error("event pointer references a missing primary record")]
    DanglingPointer,
    #[error("storage error: {0}")]
    Storage(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl TelemetryError {
    /// Stable wire code carried in every error response body.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config(_) => "CONFIG_ERROR",
            Self::MissingField(_) => "MISSING_REQUIRED_FIELD",
            Self::InvalidField(_) => "INVALID_FIELD_VALUE",
            Self::InvalidJson(_) => "INVALID_JSON",
            Self::PayloadTooLarge(_) => "PAYLOAD_TOO_LARGE",
            Self::InvalidSignature => "INVALID_SIGNATURE",
            Self::InvalidCursor => "INVALID_CURSOR",
            Self::InvalidDayRange(_) => "INVALID_DAY_RANGE",
            Self::InvalidQuery(_) => "INVALID_QUERY",
            Self::NotFound => "NOT_FOUND",
            Self::DanglingPointer => "DANGLING_POINTER",
            Self::Storage(_) | Self::Io(_) => "WRITE_FAILED",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }
}

impl From<toml::de::Error> for TelemetryError {
    fn from(err: toml::de::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<toml::ser::Error> for TelemetryError {
    fn from(err: toml::ser::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for TelemetryError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    ok: bool,
    error: &'a str,
    message: &'a str,
}

impl IntoResponse for TelemetryError {
    fn into_response(self) -> Response {
        let status = match self {
            Self::Config(_)
            | Self::MissingField(_)
            | Self::InvalidField(_)
            | Self::InvalidJson(_)
            | Self::InvalidCursor
            | Self::InvalidDayRange(_)
            | Self::InvalidQuery(_) => StatusCode::BAD_REQUEST,
            Self::InvalidSignature => StatusCode::UNAUTHORIZED,
            Self::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::DanglingPointer | Self::Storage(_) | Self::Serialization(_) | Self::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let code = self.code();
        let message = self.to_string();
        (
            status,
            Json(ErrorBody {
                ok: false,
                error: code,
                message: &message,
            }),
        )
            .into_response()
    }
}
