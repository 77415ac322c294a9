//! # pam-smtp
//!
//! Verifies a username/password pair by logging in to an SMTP server, for
//! use as a PAM service module.
//!
//! - Positional module arguments resolved into a [`ConnectionPolicy`]
//!   (host, `starttls` | `tls`, `@domain` suffix)
//! - `key=value` options for ports, timeouts, SASL mechanism and TLS
//!   verification
//! - STARTTLS and implicit TLS, PLAIN / LOGIN / CRAM-MD5
//! - Three-way outcome: success, configuration error, rejected login
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pam_smtp::{StaticCredentials, Verifier, VerificationOutcome};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let verifier = Verifier::from_args(&["mail.example.com", "tls", "@example.com"])?;
//!
//!     match verifier.run(&StaticCredentials::new("alice", "secret")) {
//!         VerificationOutcome::Success => println!("accepted"),
//!         other => println!("denied: {}", other),
//!     }
//!
//!     Ok(())
//! }
//! ```
//!
//! Build with the `pam` feature to export the `pam_sm_*` entry points.

#![warn(missing_docs)]
#![warn(clippy::all)]

// Core modules
pub mod config;
pub mod errors;

// Protocol layer
pub mod protocol;

// Transport layer
pub mod transport;

// Authentication
pub mod auth;

// Observability
pub mod observability;

// Client
pub mod client;

// Orchestration
pub mod verify;

// PAM glue
pub mod pam;

// Mocks for testing
pub mod mocks;

// Re-exports for convenience
pub use auth::{AuthMethod, CredentialSource, Credentials, StaticCredentials};
pub use client::{Scheme, SmtpAuthClient, SmtpLoginClient, UseSsl, VerifyRequest};
pub use config::{resolve, ClientConfig, ConnectionPolicy, ModuleArgs, Protocol, TlsConfig};
pub use errors::{ConfigError, CredentialError, SmtpError, SmtpErrorKind, SmtpResult};
pub use pam::PamCode;
pub use protocol::{EsmtpCapabilities, SmtpCommand, SmtpResponse};
pub use transport::SmtpTransport;
pub use verify::{authenticate, VerificationOutcome, Verifier};
