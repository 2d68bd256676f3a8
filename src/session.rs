//! Per-virtual-user authentication state.
//!
//! Each virtual user derives a [`Session`] once when it starts, before any task
//! runs, and carries it unchanged until the user exits. The session holds the
//! opaque bearer token and the header map derived from it; every task request
//! attaches these headers.
//!
//! Tokens are pre-provisioned: they are read from an environment variable (the
//! `--token-env` option names it) rather than embedded in the load test, so a
//! captured token never ends up committed in a loadtest repository.

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};

use crate::StampedeError;

/// Authentication state established once per virtual user at session start.
///
/// Immutable once created. Sessions are owned exclusively by their virtual
/// user and are never shared.
#[derive(Debug, Clone)]
pub struct Session {
    /// The opaque bearer token this session authenticates with.
    token: String,
    /// Headers derived from the token, attached to every task request.
    headers: HeaderMap,
}

impl Session {
    /// Derive a session from a pre-provisioned bearer token.
    ///
    /// The derived header map contains exactly one entry:
    /// `Authorization: Bearer <token>`.
    ///
    /// # Example
    /// ```rust
    /// use reqwest::header::AUTHORIZATION;
    /// use stampede::session::Session;
    ///
    /// let session = Session::new("abc123").unwrap();
    /// assert_eq!(
    ///     session.headers().get(AUTHORIZATION).unwrap(),
    ///     "Bearer abc123"
    /// );
    /// ```
    pub fn new(token: &str) -> Result<Self, StampedeError> {
        let mut headers = HeaderMap::new();
        let mut value = HeaderValue::from_str(&format!("Bearer {}", token)).map_err(|_| {
            StampedeError::InvalidToken {
                detail: "Token contains characters not allowed in an Authorization header."
                    .to_string(),
            }
        })?;
        // Keep the token out of debug output.
        value.set_sensitive(true);
        headers.insert(AUTHORIZATION, value);

        Ok(Session {
            token: token.to_string(),
            headers,
        })
    }

    /// Read the bearer token from the named environment variable and derive a
    /// session from it. A missing or empty variable is an error.
    pub fn from_env(variable: &str) -> Result<Self, StampedeError> {
        match std::env::var(variable) {
            Ok(token) if !token.is_empty() => Session::new(&token),
            _ => Err(StampedeError::MissingToken {
                variable: variable.to_string(),
                detail: format!(
                    "No bearer token found; export a token in the {} environment variable.",
                    variable
                ),
            }),
        }
    }

    /// The bearer token this session was derived from.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// The header map attached to every request made with this session.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_bearer_header() {
        let session = Session::new("abc123").unwrap();
        assert_eq!(session.token(), "abc123");
        // The header mapping is exactly {"Authorization": "Bearer " + token}.
        assert_eq!(session.headers().len(), 1);
        assert_eq!(
            session.headers().get(AUTHORIZATION).unwrap(),
            "Bearer abc123"
        );
    }

    #[test]
    fn rejects_invalid_token() {
        // Control characters can't appear in a header value.
        assert!(Session::new("abc\n123").is_err());
    }

    #[test]
    fn missing_variable_is_an_error() {
        match Session::from_env("STAMPEDE_TEST_UNSET_VARIABLE") {
            Err(StampedeError::MissingToken { variable, .. }) => {
                assert_eq!(variable, "STAMPEDE_TEST_UNSET_VARIABLE");
            }
            _ => panic!("expected MissingToken"),
        }
    }
}
