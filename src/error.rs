// Copyright (c) 2019 Jason White
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in
// all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
// SOFTWARE.
use std::fmt;
use std::io;

use derive_more::Display;
use http::{header, StatusCode};
use hyper::Response;

use crate::access::AccessError;
use crate::auth::oauth::OAuthError;
use crate::auth::AuthError;
use crate::config::ConfigError;
use crate::db::MetadataError;
use crate::kv::KvError;
use crate::lfs::{self, KeyError};
use crate::sha256::Sha256VerifyError;
use crate::storage::StorageError;
use crate::util::{full, into_json, BoxBody};

/// Stable classification of every error the server can surface. Upper layers
/// map errors to HTTP statuses through this and nothing else.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    #[display("invalid_input")]
    InvalidInput,
    #[display("unauthenticated")]
    Unauthenticated,
    #[display("forbidden")]
    Forbidden,
    #[display("not_found")]
    NotFound,
    #[display("conflict")]
    Conflict,
    #[display("unprocessable")]
    Unprocessable,
    #[display("dependency_unavailable")]
    DependencyUnavailable,
    #[display("timeout")]
    Timeout,
    #[display("internal")]
    Internal,
}

impl ErrorKind {
    /// HTTP status for this kind. `proxy` selects the mapping used by the
    /// streaming upload and download endpoints.
    pub fn status(self, proxy: bool) -> StatusCode {
        match self {
            ErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
            ErrorKind::Unauthenticated => StatusCode::UNAUTHORIZED,
            ErrorKind::Forbidden => StatusCode::FORBIDDEN,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::Unprocessable => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorKind::DependencyUnavailable if proxy => {
                StatusCode::BAD_GATEWAY
            }
            ErrorKind::DependencyUnavailable => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

// Define a type so we can return multiple types of errors
#[derive(Debug)]
pub enum Error {
    Io(io::Error),
    Http(http::Error),
    Hyper(hyper::Error),
    HyperUtil(hyper_util::client::legacy::Error),
    Json(serde_json::Error),
    Body(String),
    Key(KeyError),
    Integrity(Sha256VerifyError),
    Storage(StorageError),
    Kv(KvError),
    Metadata(MetadataError),
    Auth(AuthError),
    Access(AccessError),
    OAuth(OAuthError),
    Config(ConfigError),
    Timeout(tokio::time::error::Elapsed),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Io(_) | Error::Http(_) | Error::Hyper(_) => {
                ErrorKind::Internal
            }
            Error::HyperUtil(_) | Error::Storage(_) | Error::Kv(_) => {
                ErrorKind::DependencyUnavailable
            }
            Error::Json(_) | Error::Body(_) | Error::Key(_) => {
                ErrorKind::InvalidInput
            }
            Error::Integrity(_) => ErrorKind::Unprocessable,
            Error::Metadata(err) => err.kind(),
            Error::Auth(err) => err.kind(),
            Error::Access(err) => err.kind(),
            Error::OAuth(err) => err.kind(),
            Error::Config(_) => ErrorKind::Internal,
            Error::Timeout(_) => ErrorKind::Timeout,
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<http::Error> for Error {
    fn from(err: http::Error) -> Self {
        Error::Http(err)
    }
}

impl From<hyper::Error> for Error {
    fn from(err: hyper::Error) -> Self {
        Error::Hyper(err)
    }
}

impl From<hyper_util::client::legacy::Error> for Error {
    fn from(err: hyper_util::client::legacy::Error) -> Self {
        Error::HyperUtil(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Json(err)
    }
}

impl From<KeyError> for Error {
    fn from(err: KeyError) -> Self {
        Error::Key(err)
    }
}

impl From<Sha256VerifyError> for Error {
    fn from(err: Sha256VerifyError) -> Self {
        Error::Integrity(err)
    }
}

impl From<StorageError> for Error {
    fn from(err: StorageError) -> Self {
        Error::Storage(err)
    }
}

impl From<KvError> for Error {
    fn from(err: KvError) -> Self {
        Error::Kv(err)
    }
}

impl From<MetadataError> for Error {
    fn from(err: MetadataError) -> Self {
        Error::Metadata(err)
    }
}

impl From<AuthError> for Error {
    fn from(err: AuthError) -> Self {
        Error::Auth(err)
    }
}

impl From<AccessError> for Error {
    fn from(err: AccessError) -> Self {
        Error::Access(err)
    }
}

impl From<OAuthError> for Error {
    fn from(err: OAuthError) -> Self {
        Error::OAuth(err)
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        Error::Timeout(err)
    }
}

impl From<std::convert::Infallible> for Error {
    fn from(err: std::convert::Infallible) -> Self {
        match err {}
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Io(error) => write!(f, "I/O error: {}", error),
            Error::Http(error) => write!(f, "HTTP error: {}", error),
            Error::Hyper(error) => write!(f, "Hyper error: {}", error),
            Error::HyperUtil(error) => write!(f, "HyperUtil error: {}", error),
            Error::Json(error) => write!(f, "JSON error: {}", error),
            Error::Body(error) => write!(f, "request body error: {}", error),
            Error::Key(error) => write!(f, "{}", error),
            Error::Integrity(error) => write!(f, "integrity error: {}", error),
            Error::Storage(error) => write!(f, "{}", error),
            Error::Kv(error) => write!(f, "{}", error),
            Error::Metadata(error) => write!(f, "{}", error),
            Error::Auth(error) => write!(f, "{}", error),
            Error::Access(error) => write!(f, "{}", error),
            Error::OAuth(error) => write!(f, "{}", error),
            Error::Config(error) => write!(f, "configuration error: {}", error),
            Error::Timeout(_) => write!(f, "operation timed out"),
        }
    }
}

/// Message shown to clients. Dependency and internal failures are not
/// described in detail.
pub fn public_message(err: &Error) -> String {
    match err.kind() {
        ErrorKind::DependencyUnavailable => {
            "service temporarily unavailable".into()
        }
        ErrorKind::Internal => "internal server error".into(),
        ErrorKind::Timeout => "operation timed out".into(),
        _ => err.to_string(),
    }
}

/// An LFS JSON error body, as returned by the batch and verify endpoints.
pub fn lfs_error_response(
    status: StatusCode,
    message: impl Into<String>,
    request_id: Option<&str>,
) -> Response<BoxBody> {
    let body = lfs::ErrorResponse {
        message: message.into(),
        request_id: request_id.map(String::from),
        documentation_url: None,
    };

    let mut resp = Response::new(full(into_json(&body).unwrap_or_default()));
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static(lfs::LFS_MIME),
    );
    resp
}

/// A plain-text error body, as returned by the proxy endpoints.
pub fn plain_error_response(
    status: StatusCode,
    message: impl Into<String>,
) -> Response<BoxBody> {
    let mut resp = Response::new(full(message.into()));
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    resp
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dependency_errors_split_by_endpoint() {
        let kind = ErrorKind::DependencyUnavailable;
        assert_eq!(kind.status(false), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(kind.status(true), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn key_errors_are_invalid_input() {
        let err = Error::from(KeyError::InvalidOid);
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        assert_eq!(err.kind().status(false), StatusCode::BAD_REQUEST);
        assert_eq!(public_message(&err), "invalid oid");
    }

    #[test]
    fn storage_errors_hide_detail() {
        let err = Error::from(StorageError::new(
            crate::storage::StorageOp::Put,
            "connection reset by peer",
        ));
        assert_eq!(
            err.to_string(),
            "storage put error: connection reset by peer"
        );
        assert_eq!(public_message(&err), "service temporarily unavailable");
    }

    #[test]
    fn kind_names_are_stable() {
        assert_eq!(ErrorKind::InvalidInput.to_string(), "invalid_input");
        assert_eq!(
            ErrorKind::DependencyUnavailable.to_string(),
            "dependency_unavailable"
        );
    }
}
