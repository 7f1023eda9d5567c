//! Credentials and server-side authenticators.
//!
//! A credential is a free-form `"<scheme>:<value>"` string; validation is
//! delegated to whichever authenticator the zipper registered under that
//! scheme name. Authenticators are passed explicitly to the server
//! constructor, never through a global registry.

use bytes::Bytes;

use crate::frame::AuthenticationFrame;

/// A parsed client credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    name: String,
    payload: String,
}

impl Credential {
    /// Parse `"<scheme>:<value>"`. Input without a colon becomes the
    /// anonymous `none` scheme.
    #[must_use]
    pub fn new(raw: &str) -> Self {
        match raw.split_once(':') {
            Some((name, payload)) => Self {
                name: name.to_string(),
                payload: payload.to_string(),
            },
            None => Self {
                name: "none".to_string(),
                payload: raw.to_string(),
            },
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn payload(&self) -> &str {
        &self.payload
    }

    /// The authentication frame presenting this credential.
    #[must_use]
    pub fn to_frame(&self) -> AuthenticationFrame {
        AuthenticationFrame {
            auth_name: self.name.clone(),
            auth_payload: Bytes::copy_from_slice(self.payload.as_bytes()),
        }
    }
}

impl Default for Credential {
    fn default() -> Self {
        Self {
            name: "none".to_string(),
            payload: String::new(),
        }
    }
}

/// Validates credential payloads for one scheme.
pub trait Authenticator: Send + Sync {
    /// The scheme this authenticator handles, e.g. `"token"`.
    fn name(&self) -> &str;
    /// Whether the presented payload is acceptable.
    fn authenticate(&self, payload: &[u8]) -> bool;
}

/// Shared-secret token authenticator for `"token:<value>"` credentials.
pub struct TokenAuthenticator {
    token: String,
}

impl TokenAuthenticator {
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl Authenticator for TokenAuthenticator {
    fn name(&self) -> &str {
        "token"
    }

    fn authenticate(&self, payload: &[u8]) -> bool {
        payload == self.token.as_bytes()
    }
}

/// Check a presented authentication frame against the registered
/// authenticators. An empty list means the zipper is open and every
/// credential is accepted.
#[must_use]
pub fn authenticate(authenticators: &[Box<dyn Authenticator>], frame: &AuthenticationFrame) -> bool {
    if authenticators.is_empty() {
        return true;
    }
    authenticators
        .iter()
        .any(|a| a.name() == frame.auth_name && a.authenticate(&frame.auth_payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_scheme_and_value() {
        let c = Credential::new("token:abc");
        assert_eq!(c.name(), "token");
        assert_eq!(c.payload(), "abc");

        let c = Credential::new("token:a:b");
        assert_eq!(c.payload(), "a:b");

        let c = Credential::new("anonymous");
        assert_eq!(c.name(), "none");
    }

    #[test]
    fn token_authenticator() {
        let auths: Vec<Box<dyn Authenticator>> = vec![Box::new(TokenAuthenticator::new("abc"))];

        assert!(authenticate(&auths, &Credential::new("token:abc").to_frame()));
        assert!(!authenticate(
            &auths,
            &Credential::new("token:WRONG").to_frame()
        ));
        assert!(!authenticate(
            &auths,
            &Credential::new("basic:abc").to_frame()
        ));
    }

    #[test]
    fn open_zipper_accepts_anything() {
        assert!(authenticate(&[], &Credential::default().to_frame()));
    }
}
