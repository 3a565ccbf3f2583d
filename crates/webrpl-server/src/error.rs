//! Error taxonomy shared by every service in the crate.
//!
//! Handlers map these onto HTTP responses in `http.rs`; services never panic on bad
//! input and never retry store failures themselves.

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed caller input. No state was changed.
    #[error("invalid input: {0}")]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    NotFound(#[from] NotFound),

    /// The participation is valid but the event has not ended yet.
    #[error("certificate is not available until the event has ended")]
    NotYetEligible { ends_at: i64 },

    /// Uploaded content failed an integrity check. Logged as a security event.
    #[error("integrity check failed: {0}")]
    Integrity(#[from] IntegrityError),

    #[error("store error: {0}")]
    Persistence(#[from] sea_orm::DbErr),

    #[error("password hashing failed: {0}")]
    Hashing(String),

    #[error("token signing failed: {0}")]
    Signing(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("code length must be greater than zero")]
    InvalidLength,
    #[error("invalid email address")]
    InvalidEmail,
    #[error("missing field `{0}`")]
    MissingField(&'static str),
    #[error("invalid base64 payload")]
    Base64,
    #[error("invalid role `{0}`")]
    InvalidRole(String),
    #[error("identity already registered")]
    AlreadyRegistered,
    #[error("already registered for this event")]
    AlreadyParticipating,
    #[error("invalid archive: {0}")]
    Archive(String),
}

/// Authentication and authorization rejections.
///
/// `InvalidCredentials` deliberately covers both "unknown identity" and "wrong password";
/// the distinction only exists in logs.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing bearer token")]
    Missing,
    #[error("invalid token")]
    Invalid,
    #[error("token expired")]
    Expired,
    #[error("email or password is incorrect")]
    InvalidCredentials,
    #[error("invalid or expired one-time code")]
    InvalidOtp,
    #[error("insufficient privileges")]
    Forbidden,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NotFound {
    #[error("user not found")]
    User,
    #[error("event not found")]
    Event,
    #[error("participation not found")]
    Participation,
    #[error("certificate template not found")]
    Template,
    #[error("certificate template file not found: {0}")]
    TemplateFile(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IntegrityError {
    #[error("payload is not an HTML document")]
    NotHtml,
    #[error("payload is not a PNG image")]
    NotPng,
    #[error("archive entry escapes the template directory: {0}")]
    PathTraversal(String),
}
