//! HTTP error mapping

use axum::{
    extract::rejection::{JsonRejection, PathRejection, QueryRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::Error;

/// Error returned by API handlers
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self(Error::Validation(rejection.body_text()))
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        Self(Error::Validation(rejection.body_text()))
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self(Error::Validation(rejection.body_text()))
    }
}

impl ApiError {
    /// Status code and machine-readable code for the wrapped error
    #[must_use]
    pub const fn status(&self) -> (StatusCode, &'static str) {
        match &self.0 {
            Error::Validation(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            Error::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            Error::TimedOut { .. } => (StatusCode::REQUEST_TIMEOUT, "timed_out"),
            Error::StoreUnavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "store_unavailable"),
            Error::Config(_) | Error::Io(_) | Error::Serialization(_) | Error::Toml(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal")
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        #[derive(Serialize)]
        struct ErrorBody {
            code: &'static str,
            message: String,
        }

        let (status, code) = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self.0, "request failed");
        }

        let mut body = Map::new();
        body.insert(
            "error".to_string(),
            serde_json::to_value(ErrorBody {
                code,
                message: self.0.to_string(),
            })
            .unwrap_or(Value::Null),
        );

        // An empty list keeps "no answer" apart from "answered with nothing"
        if let Error::TimedOut { kind, .. } = &self.0 {
            if kind.is_listing() {
                body.insert(kind.result_field().to_string(), Value::Array(Vec::new()));
            }
        }

        (status, Json(Value::Object(body))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::correlator::RequestKind;

    async fn body_of(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn listing_timeout_carries_empty_list() {
        let response = ApiError(Error::TimedOut {
            device_id: "dev1".to_string(),
            kind: RequestKind::Sms,
            elapsed: Duration::from_millis(15_000),
        })
        .into_response();

        assert_eq!(response.status(), StatusCode::REQUEST_TIMEOUT);
        let body = body_of(response).await;
        assert_eq!(body["smsList"], serde_json::json!([]));
        assert_eq!(body["error"]["code"], "timed_out");
    }

    #[tokio::test]
    async fn status_mapping() {
        let cases = [
            (Error::Validation("x".into()), StatusCode::BAD_REQUEST),
            (Error::NotFound("x".into()), StatusCode::NOT_FOUND),
            (Error::StoreUnavailable("x".into()), StatusCode::SERVICE_UNAVAILABLE),
            (Error::Config("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (error, expected) in cases {
            let response = ApiError(error).into_response();
            assert_eq!(response.status(), expected);
            assert!(body_of(response).await["error"]["message"].is_string());
        }
    }
}
