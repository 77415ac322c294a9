//! Mock implementations for testing.
//!
//! Provides a scripted transport and a stub authentication client so the
//! session logic and the orchestrator can be exercised without a network.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::auth::{CredentialSource, Credentials};
use crate::client::{SmtpAuthClient, VerifyRequest};
use crate::config::TlsConfig;
use crate::errors::{CredentialError, SmtpError, SmtpErrorKind, SmtpResult};
use crate::protocol::{codes, EsmtpCapabilities, SmtpCommand, SmtpResponse, TransactionState};
use crate::transport::SmtpTransport;

/// Builds a multiline EHLO reply from capability lines.
pub fn ehlo_response(capabilities: &[&str]) -> SmtpResponse {
    let mut message = vec!["mail.example.com".to_string()];
    message.extend(capabilities.iter().map(|c| c.to_string()));

    SmtpResponse {
        code: codes::OK,
        enhanced_code: None,
        is_multiline: message.len() > 1,
        message,
    }
}

/// Mock SMTP transport for testing.
#[derive(Debug)]
pub struct MockTransport {
    /// Recorded commands.
    commands: Arc<Mutex<Vec<SmtpCommand>>>,
    /// Queued responses.
    responses: Arc<Mutex<VecDeque<SmtpResponse>>>,
    /// Default response.
    default_response: SmtpResponse,
    /// Current state.
    state: TransactionState,
    /// Server capabilities.
    capabilities: Option<EsmtpCapabilities>,
    /// TLS enabled.
    tls_enabled: bool,
    /// Simulate failure.
    fail_next: Arc<Mutex<Option<SmtpError>>>,
}

impl MockTransport {
    /// Creates a connected mock transport.
    pub fn new() -> Self {
        Self {
            commands: Arc::new(Mutex::new(Vec::new())),
            responses: Arc::new(Mutex::new(VecDeque::new())),
            default_response: SmtpResponse::new(codes::OK, "OK"),
            state: TransactionState::Connected,
            capabilities: None,
            tls_enabled: false,
            fail_next: Arc::new(Mutex::new(None)),
        }
    }

    /// Queues a response.
    pub fn queue_response(&self, response: SmtpResponse) -> &Self {
        self.responses.lock().unwrap().push_back(response);
        self
    }

    /// Queues an OK response.
    pub fn queue_ok(&self) -> &Self {
        self.queue_response(SmtpResponse::new(codes::OK, "OK"))
    }

    /// Queues an error response.
    pub fn queue_error(&self, code: u16, message: &str) -> &Self {
        self.queue_response(SmtpResponse::new(code, message))
    }

    /// Sets the next call to fail.
    pub fn fail_next_with(&self, error: SmtpError) -> &Self {
        *self.fail_next.lock().unwrap() = Some(error);
        self
    }

    /// Sets TLS enabled, as after an implicit TLS connect.
    pub fn set_tls_enabled(&mut self, enabled: bool) {
        self.tls_enabled = enabled;
    }

    /// Returns recorded commands, including the QUIT sent on close.
    pub fn recorded_commands(&self) -> Vec<SmtpCommand> {
        self.commands.lock().unwrap().clone()
    }

    /// Returns how many queued responses were never consumed.
    pub fn pending_responses(&self) -> usize {
        self.responses.lock().unwrap().len()
    }

    fn take_failure(&self) -> Option<SmtpError> {
        self.fail_next.lock().unwrap().take()
    }

    fn get_next_response(&self) -> SmtpResponse {
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.default_response.clone())
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SmtpTransport for MockTransport {
    async fn send_command(&mut self, command: &SmtpCommand) -> SmtpResult<SmtpResponse> {
        if let Some(error) = self.take_failure() {
            return Err(error);
        }

        self.commands.lock().unwrap().push(command.clone());
        Ok(self.get_next_response())
    }

    async fn read_response(&mut self) -> SmtpResult<SmtpResponse> {
        if let Some(error) = self.take_failure() {
            return Err(error);
        }

        Ok(self.get_next_response())
    }

    async fn upgrade_tls(&mut self, _config: &TlsConfig, _host: &str) -> SmtpResult<()> {
        if let Some(error) = self.take_failure() {
            return Err(error);
        }

        self.tls_enabled = true;
        self.state = TransactionState::TlsEstablished;
        Ok(())
    }

    fn is_tls(&self) -> bool {
        self.tls_enabled
    }

    async fn close(&mut self) {
        if self.state != TransactionState::Closed {
            self.commands.lock().unwrap().push(SmtpCommand::Quit);
            self.state = TransactionState::Closed;
        }
    }

    fn state(&self) -> TransactionState {
        self.state
    }

    fn set_state(&mut self, state: TransactionState) {
        self.state = state;
    }

    fn capabilities(&self) -> Option<&EsmtpCapabilities> {
        self.capabilities.as_ref()
    }

    fn set_capabilities(&mut self, caps: EsmtpCapabilities) {
        self.capabilities = Some(caps);
    }
}

/// Stub authentication client with a fixed answer.
///
/// Records every request so tests can check what was sent, or that nothing
/// was sent at all.
#[derive(Debug, Clone)]
pub struct MockAuthClient {
    outcome: Result<(), (SmtpErrorKind, String)>,
    requests: Arc<Mutex<Vec<VerifyRequest>>>,
    calls: Arc<AtomicUsize>,
}

impl MockAuthClient {
    /// Client that accepts every login.
    pub fn accepting() -> Self {
        Self::with_outcome(Ok(()))
    }

    /// Client that fails every login with the given error kind.
    pub fn failing(kind: SmtpErrorKind, message: impl Into<String>) -> Self {
        Self::with_outcome(Err((kind, message.into())))
    }

    /// Client whose server refuses the password.
    pub fn rejecting() -> Self {
        Self::failing(SmtpErrorKind::CredentialsInvalid, "535 5.7.8 Authentication failed")
    }

    fn with_outcome(outcome: Result<(), (SmtpErrorKind, String)>) -> Self {
        Self {
            outcome,
            requests: Arc::new(Mutex::new(Vec::new())),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Returns how many times `verify` ran.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Returns the recorded requests.
    pub fn requests(&self) -> Vec<VerifyRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl SmtpAuthClient for MockAuthClient {
    async fn verify(&self, request: &VerifyRequest) -> SmtpResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());

        match &self.outcome {
            Ok(()) => Ok(()),
            Err((kind, message)) => Err(SmtpError::new(*kind, message.clone())),
        }
    }
}

/// Credential source that always fails, like a conversation that was aborted.
#[derive(Debug, Clone)]
pub struct UnavailableCredentials {
    message: String,
}

impl UnavailableCredentials {
    /// Creates a failing source.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl CredentialSource for UnavailableCredentials {
    fn credentials(&self) -> Result<Credentials, CredentialError> {
        Err(CredentialError::new(self.message.clone()))
    }
}
