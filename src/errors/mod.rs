//! Error types for the SMTP credential verifier.
//!
//! Two families live here: [`ConfigError`] for problems with the module
//! arguments, detected before any network contact, and [`SmtpError`] for
//! everything the SMTP exchange can produce. The kind of an [`SmtpError`]
//! decides whether a failed attempt counts as a rejected login or as a local
//! configuration problem.

use std::fmt;
use thiserror::Error;

/// Result type for SMTP operations.
pub type SmtpResult<T> = Result<T, SmtpError>;

/// Malformed module arguments.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// No target host was given.
    #[error("No option.")]
    NoHost,
    /// The protocol token is neither `starttls` nor `tls`.
    #[error("Bad option: \"{0}\"")]
    BadProtocol(String),
    /// The domain suffix does not start with `@`.
    #[error("Bad domain: \"{0}\"")]
    BadDomain(String),
    /// A `key=value` option has an unusable value.
    #[error("Bad option value: \"{0}\"")]
    BadOption(String),
}

/// The credential source could not supply a username or password.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Credential retrieval failed: {message}")]
pub struct CredentialError {
    message: String,
}

impl CredentialError {
    /// Creates a new credential error.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Returns the error message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// SMTP error kinds categorizing different failure modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SmtpErrorKind {
    // Connection errors
    /// DNS resolution failed.
    DnsResolution,
    /// Connection was refused.
    ConnectionRefused,
    /// Connection was reset.
    ConnectionReset,

    // TLS errors
    /// TLS handshake failed.
    TlsHandshakeFailed,
    /// STARTTLS not supported by server.
    StarttlsNotSupported,
    /// Server refuses AUTH over an unencrypted connection (530, 538).
    EncryptionRequired,

    // Authentication errors
    /// Credentials are invalid.
    CredentialsInvalid,
    /// Credentials have expired.
    CredentialsExpired,
    /// Authentication method not supported.
    AuthMethodNotSupported,
    /// Server cannot authenticate right now (454).
    AuthTemporarilyUnavailable,
    /// Too many authentication attempts.
    TooManyAuthAttempts,

    // Protocol errors
    /// Invalid response from server.
    InvalidResponse,
    /// Unexpected response code.
    UnexpectedResponse,
    /// Server is shutting down (421).
    ServerShutdown,

    // Timeout errors
    /// Connect timeout.
    ConnectTimeout,
    /// Read timeout.
    ReadTimeout,
    /// Write timeout.
    WriteTimeout,

    // Configuration errors
    /// Configuration is invalid.
    ConfigurationInvalid,

    // Generic
    /// Unknown or internal error.
    Unknown,
}

impl SmtpErrorKind {
    /// Returns true if the server passed judgement on the presented
    /// credentials, as opposed to the attempt failing before that point.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            SmtpErrorKind::CredentialsInvalid
                | SmtpErrorKind::CredentialsExpired
                | SmtpErrorKind::TooManyAuthAttempts
        )
    }
}

impl fmt::Display for SmtpErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SmtpErrorKind::DnsResolution => write!(f, "DNS resolution failed"),
            SmtpErrorKind::ConnectionRefused => write!(f, "Connection refused"),
            SmtpErrorKind::ConnectionReset => write!(f, "Connection reset"),
            SmtpErrorKind::TlsHandshakeFailed => write!(f, "TLS handshake failed"),
            SmtpErrorKind::StarttlsNotSupported => write!(f, "STARTTLS not supported"),
            SmtpErrorKind::EncryptionRequired => write!(f, "Encryption required"),
            SmtpErrorKind::CredentialsInvalid => write!(f, "Invalid credentials"),
            SmtpErrorKind::CredentialsExpired => write!(f, "Credentials expired"),
            SmtpErrorKind::AuthMethodNotSupported => write!(f, "Auth method not supported"),
            SmtpErrorKind::AuthTemporarilyUnavailable => {
                write!(f, "Authentication temporarily unavailable")
            }
            SmtpErrorKind::TooManyAuthAttempts => write!(f, "Too many auth attempts"),
            SmtpErrorKind::InvalidResponse => write!(f, "Invalid server response"),
            SmtpErrorKind::UnexpectedResponse => write!(f, "Unexpected response"),
            SmtpErrorKind::ServerShutdown => write!(f, "Server shutting down"),
            SmtpErrorKind::ConnectTimeout => write!(f, "Connect timeout"),
            SmtpErrorKind::ReadTimeout => write!(f, "Read timeout"),
            SmtpErrorKind::WriteTimeout => write!(f, "Write timeout"),
            SmtpErrorKind::ConfigurationInvalid => write!(f, "Invalid configuration"),
            SmtpErrorKind::Unknown => write!(f, "Unknown error"),
        }
    }
}

/// Enhanced SMTP status code (RFC 2034).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnhancedStatusCode {
    /// Class (2=success, 4=temporary, 5=permanent).
    pub class: u8,
    /// Subject (e.g., 1=addressing, 7=security).
    pub subject: u16,
    /// Detail code.
    pub detail: u16,
}

impl EnhancedStatusCode {
    /// Parses an enhanced status code from a string (e.g., "5.7.8").
    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.split('.');
        let code = Self {
            class: parts.next()?.parse().ok()?,
            subject: parts.next()?.parse().ok()?,
            detail: parts.next()?.parse().ok()?,
        };
        if parts.next().is_some() || !(2..=5).contains(&code.class) {
            return None;
        }
        Some(code)
    }

    /// Returns true for `X.7.11`, encryption required for the requested
    /// mechanism (RFC 4954).
    pub fn requires_encryption(&self) -> bool {
        self.subject == 7 && self.detail == 11
    }
}

impl fmt::Display for EnhancedStatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.class, self.subject, self.detail)
    }
}

/// SMTP error with detailed information.
#[derive(Error, Debug)]
pub struct SmtpError {
    /// Error kind.
    kind: SmtpErrorKind,
    /// Human-readable message.
    message: String,
    /// SMTP status code if available.
    smtp_code: Option<u16>,
    /// Enhanced status code if available.
    enhanced_code: Option<EnhancedStatusCode>,
    /// Underlying cause.
    #[source]
    cause: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl SmtpError {
    /// Creates a new SMTP error.
    pub fn new(kind: SmtpErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            smtp_code: None,
            enhanced_code: None,
            cause: None,
        }
    }

    /// Sets the SMTP status code.
    pub fn with_smtp_code(mut self, code: u16) -> Self {
        self.smtp_code = Some(code);
        self
    }

    /// Sets the enhanced status code.
    pub fn with_enhanced_code(mut self, code: EnhancedStatusCode) -> Self {
        self.enhanced_code = Some(code);
        self
    }

    /// Sets the underlying cause.
    pub fn with_cause<E: std::error::Error + Send + Sync + 'static>(mut self, cause: E) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Returns the error kind.
    pub fn kind(&self) -> SmtpErrorKind {
        self.kind
    }

    /// Returns the error message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns the SMTP status code if available.
    pub fn smtp_code(&self) -> Option<u16> {
        self.smtp_code
    }

    /// Returns the enhanced status code if available.
    pub fn enhanced_code(&self) -> Option<&EnhancedStatusCode> {
        self.enhanced_code.as_ref()
    }

    /// Returns true if the server rejected the credentials.
    pub fn is_rejection(&self) -> bool {
        self.kind.is_rejection()
    }

    // Convenience constructors

    /// Creates a connection error.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(SmtpErrorKind::ConnectionRefused, message)
    }

    /// Creates a timeout error.
    pub fn timeout(kind: SmtpErrorKind, message: impl Into<String>) -> Self {
        Self::new(kind, message)
    }

    /// Creates a TLS error.
    pub fn tls(message: impl Into<String>) -> Self {
        Self::new(SmtpErrorKind::TlsHandshakeFailed, message)
    }

    /// Creates a protocol error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(SmtpErrorKind::InvalidResponse, message)
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(SmtpErrorKind::ConfigurationInvalid, message)
    }

    /// Creates an error from an SMTP response outside the AUTH exchange.
    pub fn from_smtp_response(code: u16, message: impl Into<String>) -> Self {
        let kind = match code {
            421 => SmtpErrorKind::ServerShutdown,
            500..=504 => SmtpErrorKind::InvalidResponse,
            530 | 538 => SmtpErrorKind::EncryptionRequired,
            _ if (400..600).contains(&code) => SmtpErrorKind::UnexpectedResponse,
            _ => SmtpErrorKind::Unknown,
        };
        Self::new(kind, message).with_smtp_code(code)
    }

    /// Creates an error from a negative reply to `AUTH` or to one of its
    /// continuation lines.
    ///
    /// Only a 5xx that is not about syntax, mechanism or transport security
    /// counts as a refusal of the credentials.
    pub fn from_auth_response(code: u16, message: impl Into<String>) -> Self {
        let kind = match code {
            421 => SmtpErrorKind::ServerShutdown,
            454 => SmtpErrorKind::AuthTemporarilyUnavailable,
            504 | 534 => SmtpErrorKind::AuthMethodNotSupported,
            530 | 538 => SmtpErrorKind::EncryptionRequired,
            500..=503 => SmtpErrorKind::InvalidResponse,
            _ if (500..600).contains(&code) => SmtpErrorKind::CredentialsInvalid,
            _ => SmtpErrorKind::UnexpectedResponse,
        };
        Self::new(kind, message).with_smtp_code(code)
    }
}

impl fmt::Display for SmtpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        if let Some(code) = self.smtp_code {
            write!(f, " (SMTP {})", code)?;
        }
        if let Some(enhanced) = &self.enhanced_code {
            write!(f, " [{}]", enhanced)?;
        }
        Ok(())
    }
}
