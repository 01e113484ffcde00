//! HTTP Basic access control for stream endpoints

use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::sync::Arc;
use tracing::debug;

use crate::config::AuthConfig;

/// Realm announced in `WWW-Authenticate`
pub const REALM: &str = "Restricted";

/// Username and password a viewer must present
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    username: String,
    password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// `None` when the configured username is empty (access control off)
    pub fn from_config(auth: &AuthConfig) -> Option<Self> {
        auth.is_enabled()
            .then(|| Self::new(auth.username.clone(), auth.password.clone()))
    }

    /// Checks an `Authorization` header value
    pub fn accepts(&self, header_value: &str) -> bool {
        match decode_basic(header_value) {
            Some((username, password)) => username == self.username && password == self.password,
            None => false,
        }
    }

    /// Header value a client would send for these credentials
    pub fn header_value(&self) -> String {
        let token = STANDARD.encode(format!("{}:{}", self.username, self.password));
        format!("Basic {}", token)
    }
}

/// Splits a `Basic <base64(user:pass)>` header into its parts
pub fn decode_basic(header_value: &str) -> Option<(String, String)> {
    let (scheme, token) = header_value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }

    let decoded = STANDARD.decode(token.trim()).ok()?;
    let text = String::from_utf8(decoded).ok()?;
    let (username, password) = text.split_once(':')?;
    Some((username.to_string(), password.to_string()))
}

/// Middleware rejecting requests without matching credentials
pub async fn require_basic(
    State(credentials): State<Arc<Credentials>>,
    request: Request,
    next: Next,
) -> Response {
    let authorized = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| credentials.accepts(value));

    if authorized {
        next.run(request).await
    } else {
        debug!(uri = %request.uri(), "Rejected viewer without valid credentials");
        unauthorized()
    }
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, format!("Basic realm=\"{}\"", REALM))],
        "Unauthorized",
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_basic() {
        // "admin:secret"
        assert_eq!(
            decode_basic("Basic YWRtaW46c2VjcmV0"),
            Some(("admin".to_string(), "secret".to_string()))
        );
        // Password may contain ':'
        let creds = Credentials::new("u", "p:w");
        assert_eq!(
            decode_basic(&creds.header_value()),
            Some(("u".to_string(), "p:w".to_string()))
        );
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert_eq!(decode_basic("Bearer YWRtaW46c2VjcmV0"), None);
        assert_eq!(decode_basic("Basic !!!"), None);
        assert_eq!(decode_basic("Basic bm9jb2xvbg=="), None); // "nocolon"
        assert_eq!(decode_basic(""), None);
    }

    #[test]
    fn test_accepts_only_matching_pair() {
        let creds = Credentials::new("admin", "secret");
        assert!(creds.accepts("Basic YWRtaW46c2VjcmV0"));
        assert!(creds.accepts("basic YWRtaW46c2VjcmV0"));
        assert!(!creds.accepts(&Credentials::new("admin", "wrong").header_value()));
        assert!(!creds.accepts(&Credentials::new("root", "secret").header_value()));
    }

    #[test]
    fn test_empty_username_disables_auth() {
        let auth = AuthConfig {
            username: String::new(),
            password: "ignored".to_string(),
        };
        assert_eq!(Credentials::from_config(&auth), None);

        let auth = AuthConfig {
            username: "viewer".to_string(),
            password: String::new(),
        };
        assert_eq!(Credentials::from_config(&auth), Some(Credentials::new("viewer", "")));
    }
}
