use std::fmt::Display;

use axum::extract::rejection::JsonRejection;
use axum::extract::{FromRequest, FromRequestParts, Request};
use axum::http::header::{self, HeaderMap, HeaderValue};
use axum::http::request::Parts;
use axum::http::{Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{AuthError, Error, NotFound};
use crate::jwt::SessionClaims;
use crate::AppState;

/// Reflect the caller's Origin, or allow all when there is none.
///
/// Sessions travel as bearer tokens, never cookies, so credentialed requests are not allowed.
fn apply_cors(origin: Option<HeaderValue>, headers: &mut HeaderMap) {
    let origin = origin.unwrap_or_else(|| HeaderValue::from_static("*"));
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin);
    headers.insert(header::VARY, HeaderValue::from_static("Origin"));
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET,POST,OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Authorization,Content-Type,Accept,X-Requested-With"),
    );
}

/// Middleware: answer preflights and decorate every response with CORS headers.
pub async fn cors(req: Request, next: Next) -> Response {
    let origin = req.headers().get(header::ORIGIN).cloned();

    let mut resp = if req.method() == Method::OPTIONS {
        StatusCode::NO_CONTENT.into_response()
    } else {
        next.run(req).await
    };
    apply_cors(origin, resp.headers_mut());
    resp
}

pub fn success<T: Serialize>(message: &str, data: T) -> Response {
    Json(serde_json::json!({
        "success": true,
        "message": message,
        "data": data,
    }))
    .into_response()
}

pub fn error_response(status: StatusCode, code: &str, message: &str) -> Response {
    let body = serde_json::json!({
        "success": false,
        "error": {
            "code": code,
            "message": message
        },
        "data": null,
    });

    (status, Json(body)).into_response()
}

pub fn internal_error_response<E: Display>(context: &str, err: &E) -> Response {
    tracing::error!(error = %err, "{context}");
    error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", "Internal server error")
}

pub fn not_found() -> Response {
    error_response(StatusCode::NOT_FOUND, "not_found", "Not found")
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        match &self {
            Error::Validation(e) => error_response(StatusCode::BAD_REQUEST, "invalid_input", &e.to_string()),
            Error::Auth(e) => match e {
                AuthError::Missing | AuthError::Invalid => {
                    error_response(StatusCode::UNAUTHORIZED, "unauthorized", "Invalid or missing token")
                }
                AuthError::Expired => {
                    error_response(StatusCode::UNAUTHORIZED, "token_expired", "Session expired")
                }
                AuthError::InvalidCredentials => error_response(
                    StatusCode::UNAUTHORIZED,
                    "invalid_credentials",
                    "Email or password is incorrect",
                ),
                AuthError::InvalidOtp => {
                    error_response(StatusCode::BAD_REQUEST, "invalid_otp", "Invalid or expired code")
                }
                AuthError::Forbidden => {
                    error_response(StatusCode::FORBIDDEN, "forbidden", "Insufficient privileges")
                }
            },
            Error::NotFound(NotFound::TemplateFile(path)) => {
                tracing::warn!(%path, "certificate template row points at a missing file");
                error_response(StatusCode::NOT_FOUND, "not_found", "Certificate template not found")
            }
            Error::NotFound(e) => error_response(StatusCode::NOT_FOUND, "not_found", &e.to_string()),
            Error::NotYetEligible { .. } => {
                error_response(StatusCode::BAD_REQUEST, "not_eligible", &self.to_string())
            }
            Error::Integrity(e) => {
                error_response(StatusCode::BAD_REQUEST, "integrity_check_failed", &e.to_string())
            }
            Error::Persistence(_)
            | Error::Hashing(_)
            | Error::Signing(_)
            | Error::Config(_)
            | Error::Io(_) => internal_error_response("request failed", &self),
        }
    }
}

pub fn extract_bearer_token(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(header::AUTHORIZATION)?.to_str().ok()?.trim();
    let (scheme, rest) = raw.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }

    let token = rest.trim();
    if token.is_empty() {
        return None;
    }
    Some(token.to_string())
}

/// Validated session of the caller. Rejects with 401 when absent or invalid.
#[derive(Debug, Clone)]
pub struct Session(pub SessionClaims);

#[axum::async_trait]
impl FromRequestParts<AppState> for Session {
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = extract_bearer_token(&parts.headers).ok_or(AuthError::Missing)?;
        let claims = state.issuer.validate(&token)?;
        Ok(Session(claims))
    }
}

/// JSON body whose parse failures use the standard error envelope.
pub struct JsonBody<T>(pub T);

#[axum::async_trait]
impl<S, T> FromRequest<S> for JsonBody<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
{
    type Rejection = Response;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(JsonBody(value)),
            Err(e) => {
                tracing::debug!(error = %e, "rejected request body");
                Err(error_response(StatusCode::BAD_REQUEST, "invalid_json", "Invalid JSON body"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_extraction() {
        let mut headers = HeaderMap::new();
        assert_eq!(extract_bearer_token(&headers), None);

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc.def"));
        assert_eq!(extract_bearer_token(&headers).as_deref(), Some("abc.def"));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("bearer   xyz "));
        assert_eq!(extract_bearer_token(&headers).as_deref(), Some("xyz"));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(extract_bearer_token(&headers), None);

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer "));
        assert_eq!(extract_bearer_token(&headers), None);
    }

    #[test]
    fn reflected_origins_never_allow_credentials() {
        let mut headers = HeaderMap::new();
        apply_cors(Some(HeaderValue::from_static("https://evil.test")), &mut headers);
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], "https://evil.test");
        assert!(headers.get(header::ACCESS_CONTROL_ALLOW_CREDENTIALS).is_none());

        let mut headers = HeaderMap::new();
        apply_cors(None, &mut headers);
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
        assert!(headers.get(header::ACCESS_CONTROL_ALLOW_CREDENTIALS).is_none());
    }

    #[test]
    fn error_statuses() {
        let status = |e: Error| e.into_response().status();
        assert_eq!(status(AuthError::Expired.into()), StatusCode::UNAUTHORIZED);
        assert_eq!(status(AuthError::Forbidden.into()), StatusCode::FORBIDDEN);
        assert_eq!(status(NotFound::Participation.into()), StatusCode::NOT_FOUND);
        assert_eq!(status(Error::NotYetEligible { ends_at: 1 }), StatusCode::BAD_REQUEST);
        assert_eq!(
            status(Error::Io(std::io::Error::other("disk"))),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
