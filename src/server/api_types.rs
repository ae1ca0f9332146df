use crate::errors::ErrorKind;
use crate::prelude::*;
use http::header::{HeaderValue, CONTENT_TYPE};
use http::{Response, StatusCode};
use hyper::Body;
use serde::Serialize;

#[derive(Serialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum ApiResponse<T> {
    Success {
        result: T,
    },
    SlowDown,
    Error {
        #[serde(skip)]
        code: StatusCode,
        kind: String,
        error: String,
    },
}

impl ApiResponse<()> {
    pub(in crate::server) fn error(kind: &ErrorKind) -> ApiResponse<()> {
        ApiResponse::Error {
            code: kind.status_code(),
            kind: kind.label().to_string(),
            error: kind.to_string(),
        }
    }
}

impl<T: Serialize> ApiResponse<T> {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiResponse::Success { .. } => StatusCode::OK,
            ApiResponse::SlowDown => StatusCode::SERVICE_UNAVAILABLE,
            ApiResponse::Error { code, .. } => *code,
        }
    }

    pub(in crate::server) fn into_response(self) -> Fallible<Response<Body>> {
        let serialized = ::serde_json::to_vec(&self)?;

        let mut resp = Response::new(serialized.into());
        resp.headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        *resp.status_mut() = self.status_code();
        Ok(resp)
    }
}

#[cfg(test)]
mod tests {
    use super::ApiResponse;
    use crate::errors::ErrorKind;
    use http::StatusCode;

    #[test]
    fn test_error_mapping() {
        let resp = ApiResponse::error(&ErrorKind::NotFound("investigation x".into()))
            .into_response()
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = ApiResponse::error(&ErrorKind::RateLimited {
            retry_after_secs: 60,
        })
        .into_response()
        .unwrap();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);

        let resp = ApiResponse::Success { result: 42 }.into_response().unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[test]
    fn test_error_body_shape() {
        let resp = ApiResponse::error(&ErrorKind::Validation("query text must not be empty".into()));
        let body = serde_json::to_value(&resp).unwrap();
        assert_eq!(body["status"], "error");
        assert_eq!(body["kind"], "validation");
        assert!(body.get("code").is_none());
    }
}
