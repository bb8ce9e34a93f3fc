use std::io::Error as IoError;

use mongodb::{bson::ser::Error as BsonError, error::Error as DbError};
use rocket::{
    http::{ContentType, Status},
    response::{self, Responder},
    Request, Response,
};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Every way a request into the voting core can fail.
///
/// The variant (and its reason code) is for the logs only: responses carry a
/// fixed generic body so that an adversarial caller learns nothing beyond the
/// status class.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed identifiers or parameters, rejected before any lookup.
    #[error("Validation failed: {0}")]
    Validation(&'static str),
    /// Token or capability mismatch. Always logged as a security event.
    #[error("Unauthorized: {0}")]
    Authorization(&'static str),
    /// The caller is known but a voting rule denies the request.
    #[error("Denied: {0}")]
    Denied(&'static str),
    /// Election, location or voter absent.
    #[error("Not found: {0}")]
    NotFound(&'static str),
    /// The vote has progressed past the point where a token may be re-issued.
    #[error("Vote already cast")]
    Gone,
    /// Storage or census I/O failure; the request is denied, never retried.
    #[error(transparent)]
    Transient(#[from] TransientError),
}

/// Failures of the collaborators the core depends on.
#[derive(Debug, Error)]
pub enum TransientError {
    #[error(transparent)]
    Db(#[from] DbError),
    #[error(transparent)]
    Bson(#[from] BsonError),
    #[error("Census file I/O: {0}")]
    Io(#[from] IoError),
    #[error("Storage call exceeded {0} ms")]
    Timeout(u128),
    #[error("SMS delivery failed: {0}")]
    Sms(String),
    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

impl From<DbError> for Error {
    fn from(err: DbError) -> Self {
        Self::Transient(err.into())
    }
}

impl From<BsonError> for Error {
    fn from(err: BsonError) -> Self {
        Self::Transient(err.into())
    }
}

impl From<IoError> for Error {
    fn from(err: IoError) -> Self {
        Self::Transient(err.into())
    }
}

impl Error {
    /// The short reason code written to the security and error logs.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Validation(reason)
            | Self::Authorization(reason)
            | Self::Denied(reason)
            | Self::NotFound(reason) => reason,
            Self::Gone => "vote_already_cast",
            Self::Transient(_) => "transient_failure",
        }
    }

    pub fn status(&self) -> Status {
        match self {
            Self::Validation(_) => Status::BadRequest,
            Self::Authorization(_) | Self::Denied(_) => Status::Forbidden,
            Self::NotFound(_) => Status::NotFound,
            Self::Gone => Status::Gone,
            Self::Transient(_) => Status::ServiceUnavailable,
        }
    }
}

pub const DENIED_BODY: &str = "request denied";
pub const GONE_BODY: &str = "gone";

impl<'r, 'o: 'r> Responder<'r, 'o> for Error {
    fn respond_to(self, _: &'r Request<'_>) -> response::Result<'o> {
        let body = match self {
            Self::Gone => GONE_BODY,
            _ => DENIED_BODY,
        };
        Response::build()
            .status(self.status())
            .header(ContentType::Plain)
            .sized_body(body.len(), std::io::Cursor::new(body))
            .ok()
    }
}
