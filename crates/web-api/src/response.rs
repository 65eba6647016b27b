//! The `{ data, error, meta }` envelope and error mapping.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::{Map, Value};

use spend_recon_core::ReconError;

/// Body of every response.
#[derive(Debug, Serialize)]
pub struct Envelope<T> {
    pub data: Option<T>,
    pub error: Option<String>,
    pub meta: Map<String, Value>,
}

impl<T: Serialize> Envelope<T> {
    #[must_use]
    pub fn ok(data: T) -> Self {
        Self {
            data: Some(data),
            error: None,
            meta: Map::new(),
        }
    }

    #[must_use]
    pub fn with_meta(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.meta.insert(key.to_string(), value.into());
        self
    }

    /// Copies the fields of a serializable struct into `meta`.
    #[must_use]
    pub fn with_meta_fields(mut self, fields: &impl Serialize) -> Self {
        if let Ok(Value::Object(map)) = serde_json::to_value(fields) {
            self.meta.extend(map);
        }
        self
    }
}

/// A successful response with a status code.
pub struct ApiResponse<T>(pub StatusCode, pub Envelope<T>);

impl<T: Serialize> IntoResponse for ApiResponse<T> {
    fn into_response(self) -> Response {
        (self.0, Json(self.1)).into_response()
    }
}

/// A domain error rendered as an envelope.
#[derive(Debug)]
pub struct ApiError(pub ReconError);

impl From<ReconError> for ApiError {
    fn from(err: ReconError) -> Self {
        Self(err)
    }
}

impl ApiError {
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            ReconError::Validation(_) => StatusCode::BAD_REQUEST,
            ReconError::Unauthorized => StatusCode::UNAUTHORIZED,
            ReconError::Forbidden(_) => StatusCode::FORBIDDEN,
            ReconError::NotFound { .. } => StatusCode::NOT_FOUND,
            ReconError::Conflict(_) => StatusCode::CONFLICT,
            ReconError::InvalidTransition(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ReconError::Configuration(_) | ReconError::Storage(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = if status.is_server_error() {
            tracing::error!(error = %self.0, "Request failed");
            "internal error".to_string()
        } else {
            self.0.to_string()
        };

        let mut meta = Map::new();
        meta.insert("code".to_string(), Value::from(self.0.code()));
        let body: Envelope<()> = Envelope {
            data: None,
            error: Some(message),
            meta,
        };
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<ApiResponse<T>, ApiError>;
