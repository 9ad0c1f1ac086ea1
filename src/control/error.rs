//! Control plane error responses
//!
//! Every failure leaves the daemon as `{"error": "<message>"}` with an
//! appropriate status; the strings are stable enough for a GUI to display.

use crate::store::StoreError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use std::fmt;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug)]
pub struct ApiError {
	pub status: StatusCode,
	pub message: String,
}

impl ApiError {
	pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
		Self {
			status,
			message: message.into(),
		}
	}

	pub fn bad_request(message: impl Into<String>) -> Self {
		Self::new(StatusCode::BAD_REQUEST, message)
	}

	pub fn not_found(message: impl Into<String>) -> Self {
		Self::new(StatusCode::NOT_FOUND, message)
	}

	pub fn internal(message: impl Into<String>) -> Self {
		Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
	}
}

impl fmt::Display for ApiError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.message)
	}
}

impl std::error::Error for ApiError {}

impl IntoResponse for ApiError {
	fn into_response(self) -> Response {
		let body = Json(json!({ "error": self.message }));
		(self.status, body).into_response()
	}
}

impl From<StoreError> for ApiError {
	fn from(err: StoreError) -> Self {
		match &err {
			StoreError::NotFound(_) => Self::not_found(err.to_string()),
			StoreError::InvalidInput(_) => Self::bad_request(err.to_string()),
			StoreError::Corrupt(_) => {
				Self::new(StatusCode::SERVICE_UNAVAILABLE, err.to_string())
			}
			StoreError::Db(_) => Self::internal(err.to_string()),
		}
	}
}
