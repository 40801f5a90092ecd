use axum::{
    body::Body,
    response::{IntoResponse, Response},
};
use http::{
    header::{CONTENT_TYPE, WWW_AUTHENTICATE},
    HeaderValue, StatusCode,
};
use log::error;
use serde::Serialize;

use crate::outcome::{ErrorCategory, Rejection};

pub const PROBLEM_CONTENT_TYPE: &str = "application/problem+json";
const PROBLEM_TYPE_PREFIX: &str = "urn:flow-jwt-validation:problem:";

/// Failures raised by the gateway itself rather than by token validation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GatewayErrorCode {
    RouteNotFound,
    UpstreamFailed,
    BodyTooLarge,
}

impl GatewayErrorCode {
    pub fn code(&self) -> &'static str {
        match self {
            GatewayErrorCode::RouteNotFound => "GATEWAY-001",
            GatewayErrorCode::UpstreamFailed => "GATEWAY-002",
            GatewayErrorCode::BodyTooLarge => "GATEWAY-003",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            GatewayErrorCode::RouteNotFound => "Route not found",
            GatewayErrorCode::UpstreamFailed => "Upstream request failed",
            GatewayErrorCode::BodyTooLarge => "Request body too large",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            GatewayErrorCode::RouteNotFound => StatusCode::NOT_FOUND,
            GatewayErrorCode::UpstreamFailed => StatusCode::BAD_GATEWAY,
            GatewayErrorCode::BodyTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
        }
    }
}

/// RFC 7807 problem detail, carrying the same error codes as the record
/// attributes.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProblemDetail {
    #[serde(rename = "type")]
    pub problem_type: String,
    pub title: String,
    pub status: u16,
    pub detail: String,
    pub error_code: String,
}

impl ProblemDetail {
    fn new(code: &str, title: &str, status: StatusCode, detail: impl Into<String>) -> Self {
        Self {
            problem_type: format!("{}{}", PROBLEM_TYPE_PREFIX, code.to_ascii_lowercase()),
            title: title.to_owned(),
            status: status.as_u16(),
            detail: detail.into(),
            error_code: code.to_owned(),
        }
    }

    pub fn from_rejection(rejection: &Rejection) -> Self {
        let category = rejection.category;
        Self::new(
            category.code(),
            category.title(),
            category.status(),
            rejection.reason.clone(),
        )
    }

    pub fn gateway(code: GatewayErrorCode, detail: impl Into<String>) -> Self {
        Self::new(code.code(), code.title(), code.status(), detail)
    }

    pub fn status_code(&self) -> StatusCode {
        StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }
}

impl IntoResponse for ProblemDetail {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = match serde_json::to_vec(&self) {
            Ok(body) => body,
            Err(e) => {
                error!("Unable to serialize problem detail: {}", e);
                return StatusCode::INTERNAL_SERVER_ERROR.into_response();
            }
        };
        let mut response = Response::new(Body::from(body));
        *response.status_mut() = status;
        let headers = response.headers_mut();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(PROBLEM_CONTENT_TYPE));
        if status == StatusCode::UNAUTHORIZED {
            let challenge = if self.error_code == ErrorCategory::MissingToken.code() {
                HeaderValue::from_static("Bearer")
            } else {
                HeaderValue::from_static("Bearer error=\"invalid_token\"")
            };
            headers.insert(WWW_AUTHENTICATE, challenge);
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use http_body_util::BodyExt;
    use serde_json::{json, Value};

    use super::*;

    #[tokio::test]
    async fn missing_token_response() {
        let rejection = Rejection::new(ErrorCategory::MissingToken, "no bearer token provided");

        let response = ProblemDetail::from_rejection(&rejection).into_response();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            PROBLEM_CONTENT_TYPE
        );
        assert_eq!(response.headers().get(WWW_AUTHENTICATE).unwrap(), "Bearer");
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(
            body,
            json!({
                "type": "urn:flow-jwt-validation:problem:auth-001",
                "title": "Bearer token missing",
                "status": 401,
                "detail": "no bearer token provided",
                "errorCode": "AUTH-001"
            })
        );
    }

    #[test]
    fn forbidden_has_no_challenge() {
        let rejection = Rejection::new(ErrorCategory::InsufficientScope, "missing scope");
        let response = ProblemDetail::from_rejection(&rejection).into_response();

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert!(response.headers().get(WWW_AUTHENTICATE).is_none());
    }

    #[test]
    fn gateway_codes() {
        let problem = ProblemDetail::gateway(GatewayErrorCode::RouteNotFound, "GET /x");
        assert_eq!(problem.status, 404);
        assert_eq!(problem.error_code, "GATEWAY-001");
        assert_eq!(
            ProblemDetail::gateway(GatewayErrorCode::UpstreamFailed, "").status,
            502
        );
        assert_eq!(
            ProblemDetail::gateway(GatewayErrorCode::BodyTooLarge, "").status,
            413
        );
    }
}
