use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Serialize;

/// Stable machine-readable error codes carried in every error body.
///
/// Clients are expected to branch on these rather than on the message text,
/// which may change between releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    MissingUrl,
    InvalidUrl,
    UrlTooLong,
    HttpsRequired,
    CredentialsInUrl,
    PrivateHost,
    DomainNotAllowed,
    MissingParams,
    InvalidParams,
    UpstreamError,
    InvalidContentType,
    ImageTooLarge,
    EmptyBody,
    InvalidRedirect,
    RedirectBlocked,
    TooManyRedirects,
    UpstreamTimeout,
    FetchFailed,
    ImageNotCached,
    RateLimitExceeded,
    InternalError,
    NotFound,
    PurgeFailed,
    NotImplemented,
    ApiKeyInvalid,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::MissingUrl => "MISSING_URL",
            ErrorCode::InvalidUrl => "INVALID_URL",
            ErrorCode::UrlTooLong => "URL_TOO_LONG",
            ErrorCode::HttpsRequired => "HTTPS_REQUIRED",
            ErrorCode::CredentialsInUrl => "CREDENTIALS_IN_URL",
            ErrorCode::PrivateHost => "PRIVATE_HOST",
            ErrorCode::DomainNotAllowed => "DOMAIN_NOT_ALLOWED",
            ErrorCode::MissingParams => "MISSING_PARAMS",
            ErrorCode::InvalidParams => "INVALID_PARAMS",
            ErrorCode::UpstreamError => "UPSTREAM_ERROR",
            ErrorCode::InvalidContentType => "INVALID_CONTENT_TYPE",
            ErrorCode::ImageTooLarge => "IMAGE_TOO_LARGE",
            ErrorCode::EmptyBody => "EMPTY_BODY",
            ErrorCode::InvalidRedirect => "INVALID_REDIRECT",
            ErrorCode::RedirectBlocked => "REDIRECT_BLOCKED",
            ErrorCode::TooManyRedirects => "TOO_MANY_REDIRECTS",
            ErrorCode::UpstreamTimeout => "UPSTREAM_TIMEOUT",
            ErrorCode::FetchFailed => "FETCH_FAILED",
            ErrorCode::ImageNotCached => "IMAGE_NOT_CACHED",
            ErrorCode::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            ErrorCode::InternalError => "INTERNAL_ERROR",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::PurgeFailed => "PURGE_FAILED",
            ErrorCode::NotImplemented => "NOT_IMPLEMENTED",
            ErrorCode::ApiKeyInvalid => "API_KEY_INVALID",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A structured request-processing error: the HTTP status it maps to, a
/// stable code, and a human-readable message.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{code}: {message}")]
pub struct ProxyError {
    pub status: u16,
    pub code: ErrorCode,
    pub message: String,
}

impl ProxyError {
    pub fn new(status: u16, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(500, ErrorCode::InternalError, message)
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: ErrorDetail<'a>,
}

#[derive(Serialize)]
struct ErrorDetail<'a> {
    status: u16,
    code: &'a str,
    message: &'a str,
    #[serde(rename = "requestId")]
    request_id: &'a str,
}

/// A `ProxyError` paired with the request correlation ID, ready to be sent
/// to the client as the JSON error body.
pub struct ApiError {
    pub error: ProxyError,
    pub request_id: String,
}

impl ApiError {
    pub fn new(error: ProxyError, request_id: impl Into<String>) -> Self {
        Self {
            error,
            request_id: request_id.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        // Internal failure details stay in the logs; the wire gets a generic
        // string.
        let message = if self.error.code == ErrorCode::InternalError {
            "internal server error"
        } else {
            self.error.message.as_str()
        };
        let body = ErrorBody {
            error: ErrorDetail {
                status: self.error.status,
                code: self.error.code.as_str(),
                message,
                request_id: &self.request_id,
            },
        };
        let status =
            StatusCode::from_u16(self.error.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let json = serde_json::to_string(&body).unwrap_or_else(|_| {
            format!(
                "{{\"error\":{{\"status\":{},\"code\":\"{}\",\"message\":\"internal server error\",\"requestId\":\"\"}}}}",
                self.error.status,
                self.error.code.as_str()
            )
        });
        (
            status,
            [(header::CONTENT_TYPE, "application/json")],
            json,
        )
            .into_response()
    }
}
