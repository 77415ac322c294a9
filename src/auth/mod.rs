//! Credentials and SASL mechanisms.
//!
//! Supports the password-based mechanisms:
//! - PLAIN (RFC 4616)
//! - LOGIN (obsolete but widely used)
//! - CRAM-MD5 (RFC 2195)

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use hmac::{Hmac, Mac};
use md5::Md5;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::errors::{CredentialError, SmtpError, SmtpErrorKind, SmtpResult};

/// Authentication methods supported by the SMTP client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthMethod {
    /// PLAIN authentication (RFC 4616).
    Plain,
    /// LOGIN authentication (obsolete).
    Login,
    /// CRAM-MD5 challenge-response.
    CramMd5,
}

impl AuthMethod {
    /// Returns the SMTP AUTH mechanism name.
    pub fn mechanism_name(&self) -> &'static str {
        match self {
            AuthMethod::Plain => "PLAIN",
            AuthMethod::Login => "LOGIN",
            AuthMethod::CramMd5 => "CRAM-MD5",
        }
    }

    /// Returns the priority for auto-selection (higher is better).
    pub fn priority(&self) -> u8 {
        match self {
            AuthMethod::CramMd5 => 3,
            AuthMethod::Plain => 2,
            AuthMethod::Login => 1,
        }
    }

    /// Parses from SMTP capability string.
    pub fn from_capability(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "PLAIN" => Some(AuthMethod::Plain),
            "LOGIN" => Some(AuthMethod::Login),
            "CRAM-MD5" => Some(AuthMethod::CramMd5),
            _ => None,
        }
    }
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.mechanism_name())
    }
}

/// Username and password for one verification attempt.
#[derive(Clone)]
pub struct Credentials {
    /// Username as supplied by the caller, before any domain suffix.
    pub username: String,
    /// Password (protected).
    pub password: SecretString,
}

impl Credentials {
    /// Creates credentials.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: SecretString::new(password.into()),
        }
    }

    /// Returns the first missing piece, if any.
    pub fn missing_part(&self) -> Option<&'static str> {
        if self.username.is_empty() {
            Some("Username is empty.")
        } else if self.password.expose_secret().is_empty() {
            Some("Password is empty.")
        } else {
            None
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// Supplies the username and password for an attempt.
pub trait CredentialSource {
    /// Returns the credentials to verify.
    fn credentials(&self) -> Result<Credentials, CredentialError>;
}

/// Credential source holding fixed values.
#[derive(Debug, Clone)]
pub struct StaticCredentials {
    credentials: Credentials,
}

impl StaticCredentials {
    /// Creates a new static source.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            credentials: Credentials::new(username, password),
        }
    }
}

impl From<Credentials> for StaticCredentials {
    fn from(credentials: Credentials) -> Self {
        Self { credentials }
    }
}

impl CredentialSource for StaticCredentials {
    fn credentials(&self) -> Result<Credentials, CredentialError> {
        Ok(self.credentials.clone())
    }
}

/// Authentication mechanism implementation.
pub struct Authenticator;

impl Authenticator {
    /// Generates the initial response for PLAIN authentication.
    pub fn plain_initial_response(identity: &str, secret: &SecretString) -> String {
        // Format: \0identity\0secret
        let response = format!("\0{}\0{}", identity, secret.expose_secret());
        BASE64.encode(response)
    }

    /// Generates LOGIN username response.
    pub fn login_username(identity: &str) -> String {
        BASE64.encode(identity)
    }

    /// Generates LOGIN password response.
    pub fn login_password(secret: &SecretString) -> String {
        BASE64.encode(secret.expose_secret())
    }

    /// Generates CRAM-MD5 response.
    pub fn cram_md5_response(
        challenge: &str,
        identity: &str,
        secret: &SecretString,
    ) -> SmtpResult<String> {
        let challenge_bytes = BASE64
            .decode(challenge.trim())
            .map_err(|e| SmtpError::protocol(format!("Invalid CRAM-MD5 challenge: {}", e)))?;

        type HmacMd5 = Hmac<Md5>;
        let mut mac = HmacMd5::new_from_slice(secret.expose_secret().as_bytes())
            .map_err(|e| SmtpError::protocol(format!("HMAC error: {}", e)))?;
        mac.update(&challenge_bytes);
        let digest = mac.finalize().into_bytes();

        // Format: identity space hex-digest
        let hex_digest: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
        Ok(BASE64.encode(format!("{} {}", identity, hex_digest)))
    }

    /// Picks the mechanism to use from what the server advertises.
    ///
    /// A forced mechanism must be advertised; otherwise the highest priority
    /// advertised mechanism wins.
    pub fn select_method(
        available: &[AuthMethod],
        forced: Option<AuthMethod>,
    ) -> SmtpResult<AuthMethod> {
        if let Some(method) = forced {
            return if available.contains(&method) {
                Ok(method)
            } else {
                Err(SmtpError::new(
                    SmtpErrorKind::AuthMethodNotSupported,
                    format!("Server does not offer AUTH {}", method),
                ))
            };
        }

        available
            .iter()
            .copied()
            .max_by_key(AuthMethod::priority)
            .ok_or_else(|| {
                SmtpError::new(
                    SmtpErrorKind::AuthMethodNotSupported,
                    "Server offers no usable AUTH mechanism",
                )
            })
    }
}
