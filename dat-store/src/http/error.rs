use axum::{
    extract::rejection::{PathRejection, QueryRejection},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, StoreError};

/// Result type of request handlers.
pub type AppResult<T> = Result<T, AppError>;

/// JSON error body of failed requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppError {
    #[serde(with = "serde_status_code")]
    status: StatusCode,
    detail: Option<String>,
}

impl Default for AppError {
    fn default() -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            detail: None,
        }
    }
}

impl AppError {
    /// Create a new [`AppError`].
    pub fn new(status_code: StatusCode, message: Option<impl ToString>) -> AppError {
        Self {
            status: status_code,
            detail: message.map(|m| m.to_string()),
        }
    }

    /// The status code of the response.
    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let json = Json(self.clone());
        (self.status, json).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(value: anyhow::Error) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            detail: Some(value.to_string()),
        }
    }
}

impl From<StoreError> for AppError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::NotFound(_) => Self::new(StatusCode::NOT_FOUND, Some(value)),
            StoreError::Conflict(_) | StoreError::NotEmpty => {
                Self::new(StatusCode::CONFLICT, Some(value))
            }
            _ => Self::new(StatusCode::INTERNAL_SERVER_ERROR, Some(value)),
        }
    }
}

impl From<PipelineError> for AppError {
    fn from(value: PipelineError) -> Self {
        match value {
            PipelineError::Store(err) => err.into(),
            PipelineError::UnknownFormat(_)
            | PipelineError::UnknownPrimary(_)
            | PipelineError::Format { .. }
            | PipelineError::Input(_) => Self::new(StatusCode::BAD_REQUEST, Some(value)),
            PipelineError::Join(_) => Self::new(StatusCode::INTERNAL_SERVER_ERROR, Some(value)),
        }
    }
}

impl From<tokio::task::JoinError> for AppError {
    fn from(value: tokio::task::JoinError) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, Some(value))
    }
}

impl From<QueryRejection> for AppError {
    fn from(value: QueryRejection) -> Self {
        Self::new(StatusCode::BAD_REQUEST, Some(value))
    }
}

impl From<PathRejection> for AppError {
    fn from(value: PathRejection) -> Self {
        Self::new(StatusCode::BAD_REQUEST, Some(value))
    }
}

/// Serialize/Deserializer for status codes.
///
/// This is needed because status code according to JSON API spec must
/// be the status code as a STRING.
///
/// We could have used http_serde, but it encodes the status code as a NUMBER.
pub mod serde_status_code {
    use http::StatusCode;
    use serde::{de::Unexpected, Deserialize, Deserializer, Serialize, Serializer};

    /// Serialize [StatusCode]s.
    pub fn serialize<S: Serializer>(status: &StatusCode, ser: S) -> Result<S::Ok, S::Error> {
        String::serialize(&status.as_u16().to_string(), ser)
    }

    /// Deserialize [StatusCode]s.
    pub fn deserialize<'de, D>(de: D) -> Result<StatusCode, D::Error>
    where
        D: Deserializer<'de>,
    {
        let str = String::deserialize(de)?;
        StatusCode::from_bytes(str.as_bytes()).map_err(|_| {
            serde::de::Error::invalid_value(
                Unexpected::Str(str.as_str()),
                &"A valid http status code",
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_from_errors() {
        let err: AppError = StoreError::NotFound("x".into()).into();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
        let err: AppError = PipelineError::UnknownFormat("xml".into()).into();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        let err: AppError = PipelineError::Store(StoreError::Corrupt("bad".into())).into();
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["status"], "500");
    }
}
