//! Authentication attempt orchestration.
//!
//! Turns a [`ConnectionPolicy`] and a pair of credentials into one call to an
//! [`SmtpAuthClient`] and classifies what came back.

use std::fmt;

use crate::auth::{CredentialSource, Credentials};
use crate::client::{Scheme, SmtpAuthClient, SmtpLoginClient, UseSsl, VerifyRequest};
use crate::config::{resolve, ConnectionPolicy, ModuleArgs, Protocol};
use crate::errors::ConfigError;
use crate::observability::{AttemptContext, Timer};

/// Result of one verification attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationOutcome {
    /// The server accepted the credentials.
    Success,
    /// Local problem: bad input, unusable setup, unreachable server.
    ConfigurationError(String),
    /// The server refused the credentials.
    AuthRejected(String),
}

impl VerificationOutcome {
    /// Returns true on success.
    pub fn is_success(&self) -> bool {
        matches!(self, VerificationOutcome::Success)
    }

    /// Returns the diagnostic text of a failure.
    pub fn diagnostic(&self) -> Option<&str> {
        match self {
            VerificationOutcome::Success => None,
            VerificationOutcome::ConfigurationError(reason)
            | VerificationOutcome::AuthRejected(reason) => Some(reason),
        }
    }
}

impl fmt::Display for VerificationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VerificationOutcome::Success => write!(f, "success"),
            VerificationOutcome::ConfigurationError(reason) => {
                write!(f, "configuration error: {}", reason)
            }
            VerificationOutcome::AuthRejected(reason) => write!(f, "rejected: {}", reason),
        }
    }
}

/// Builds the client request for a policy and credentials.
fn request_for(policy: &ConnectionPolicy, creds: Credentials) -> VerifyRequest {
    VerifyRequest {
        host: policy.target_host.clone(),
        scheme: match policy.protocol {
            Protocol::StartTls => Scheme::Smtp,
            Protocol::ImplicitTls => Scheme::Smtps,
        },
        use_ssl: if policy.encryption_required {
            UseSsl::Control
        } else {
            UseSsl::None
        },
        identity: policy.compose_identity(&creds.username),
        secret: creds.password,
    }
}

/// Runs one verification attempt.
///
/// Empty credentials never reach the client. Client errors that amount to a
/// refusal of the credentials become [`VerificationOutcome::AuthRejected`];
/// every other failure is a [`VerificationOutcome::ConfigurationError`].
pub async fn authenticate(
    policy: &ConnectionPolicy,
    creds: Credentials,
    client: &dyn SmtpAuthClient,
) -> VerificationOutcome {
    if let Some(reason) = creds.missing_part() {
        return VerificationOutcome::ConfigurationError(reason.to_string());
    }

    let request = request_for(policy, creds);
    let context = AttemptContext::new(&request);
    let timer = Timer::start("smtp_verify");

    #[cfg(feature = "tracing")]
    let result = {
        use tracing::Instrument;
        client.verify(&request).instrument(context.span()).await
    };

    #[cfg(not(feature = "tracing"))]
    let result = client.verify(&request).await;

    let outcome = match result {
        Ok(()) => VerificationOutcome::Success,
        Err(e) if e.is_rejection() => VerificationOutcome::AuthRejected(e.to_string()),
        Err(e) => VerificationOutcome::ConfigurationError(e.to_string()),
    };

    let elapsed = timer.stop();

    #[cfg(feature = "tracing")]
    tracing::info!(
        attempt_id = %context.attempt_id,
        target = %context.target,
        identity = %context.identity,
        duration_ms = elapsed.as_millis(),
        outcome = %outcome,
        "Verification finished"
    );

    #[cfg(not(feature = "tracing"))]
    let _ = (context, elapsed);

    outcome
}

/// Blocking front end: one policy, one client, a fresh runtime per attempt.
#[derive(Debug, Clone)]
pub struct Verifier<C> {
    policy: ConnectionPolicy,
    client: C,
}

impl Verifier<SmtpLoginClient> {
    /// Builds a network verifier from a module argument list.
    ///
    /// `key=value` options configure the client; the remaining tokens go
    /// through [`resolve`].
    pub fn from_args<S: AsRef<str>>(args: &[S]) -> Result<Self, ConfigError> {
        let (positional, config) = ModuleArgs::split(args)?;
        let policy = resolve(&positional)?;
        let client = SmtpLoginClient::new(config)
            .map_err(|e| ConfigError::BadOption(e.message().to_string()))?;
        Ok(Self::new(policy, client))
    }
}

impl<C: SmtpAuthClient> Verifier<C> {
    /// Creates a verifier.
    pub fn new(policy: ConnectionPolicy, client: C) -> Self {
        Self { policy, client }
    }

    /// Returns the connection policy.
    pub fn policy(&self) -> &ConnectionPolicy {
        &self.policy
    }

    /// Returns the client.
    pub fn client(&self) -> &C {
        &self.client
    }

    /// Fetches credentials and runs one attempt, blocking the caller.
    ///
    /// Called from inside a tokio runtime it refuses to block and returns a
    /// [`VerificationOutcome::ConfigurationError`]; async callers use
    /// [`authenticate`] directly.
    pub fn run(&self, source: &dyn CredentialSource) -> VerificationOutcome {
        if tokio::runtime::Handle::try_current().is_ok() {
            return VerificationOutcome::ConfigurationError(
                "Cannot block inside an async runtime".to_string(),
            );
        }

        let creds = match source.credentials() {
            Ok(creds) => creds,
            Err(e) => return VerificationOutcome::ConfigurationError(e.message().to_string()),
        };

        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(e) => {
                return VerificationOutcome::ConfigurationError(format!(
                    "Cannot start I/O runtime: {}",
                    e
                ))
            }
        };

        runtime.block_on(authenticate(&self.policy, creds, &self.client))
    }
}
