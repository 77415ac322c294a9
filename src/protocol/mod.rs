//! SMTP protocol implementation.
//!
//! The subset of RFC 5321 and RFC 4954 needed to greet a server, secure the
//! connection and authenticate.

use std::collections::HashSet;
use std::fmt;

use crate::auth::AuthMethod;
use crate::errors::{EnhancedStatusCode, SmtpError, SmtpErrorKind, SmtpResult};

/// SMTP commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmtpCommand {
    /// Extended HELLO with client identity.
    Ehlo(String),
    /// Basic HELLO.
    Helo(String),
    /// Start TLS negotiation.
    StartTls,
    /// Authenticate.
    Auth {
        /// Authentication mechanism.
        mechanism: AuthMethod,
        /// Initial response (optional).
        initial_response: Option<String>,
    },
    /// Base64 line answering a 334 challenge.
    AuthResponse(String),
    /// Quit connection.
    Quit,
}

impl SmtpCommand {
    /// Formats the command for sending.
    pub fn to_smtp_string(&self) -> String {
        match self {
            SmtpCommand::Ehlo(domain) => format!("EHLO {}", domain),
            SmtpCommand::Helo(domain) => format!("HELO {}", domain),
            SmtpCommand::StartTls => "STARTTLS".to_string(),
            SmtpCommand::Auth {
                mechanism,
                initial_response,
            } => match initial_response {
                Some(response) => format!("AUTH {} {}", mechanism, response),
                None => format!("AUTH {}", mechanism),
            },
            SmtpCommand::AuthResponse(line) => line.clone(),
            SmtpCommand::Quit => "QUIT".to_string(),
        }
    }
}

/// Log-safe rendering: SASL payloads are never shown.
impl fmt::Display for SmtpCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SmtpCommand::Auth {
                mechanism,
                initial_response: Some(_),
            } => write!(f, "AUTH {} [REDACTED]", mechanism),
            SmtpCommand::AuthResponse(_) => write!(f, "[REDACTED]"),
            other => write!(f, "{}", other.to_smtp_string()),
        }
    }
}

/// SMTP response from server.
#[derive(Debug, Clone)]
pub struct SmtpResponse {
    /// Status code (e.g., 220, 235, 535).
    pub code: u16,
    /// Enhanced status code (optional).
    pub enhanced_code: Option<EnhancedStatusCode>,
    /// Response message lines.
    pub message: Vec<String>,
    /// Whether this is a multiline response.
    pub is_multiline: bool,
}

impl SmtpResponse {
    /// Creates a new response.
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            enhanced_code: None,
            message: vec![message.into()],
            is_multiline: false,
        }
    }

    /// Parses a response from raw lines.
    pub fn parse(lines: &[String]) -> SmtpResult<Self> {
        if lines.is_empty() {
            return Err(SmtpError::protocol("Empty response"));
        }

        let mut messages = Vec::with_capacity(lines.len());
        let mut code = 0u16;
        let mut enhanced_code = None;

        for (i, line) in lines.iter().enumerate() {
            let parsed_code: u16 = line
                .get(..3)
                .filter(|c| c.bytes().all(|b| b.is_ascii_digit()))
                .and_then(|c| c.parse().ok())
                .ok_or_else(|| SmtpError::protocol(format!("Invalid status code: {}", line)))?;

            if i == 0 {
                code = parsed_code;
            } else if parsed_code != code {
                return Err(SmtpError::protocol("Inconsistent status codes in multiline response"));
            }

            let message = line.get(4..).unwrap_or("");
            let message = match (i, Self::parse_enhanced_code(message)) {
                (0, Some((esc, rest))) => {
                    enhanced_code = Some(esc);
                    rest.trim().to_string()
                }
                _ => message.to_string(),
            };

            messages.push(message);
        }

        Ok(Self {
            code,
            enhanced_code,
            message: messages,
            is_multiline: lines.len() > 1,
        })
    }

    /// Parses enhanced status code from message start.
    fn parse_enhanced_code(msg: &str) -> Option<(EnhancedStatusCode, &str)> {
        // Format: X.Y.Z rest
        let (head, rest) = msg.split_once(' ').unwrap_or((msg, ""));
        let code = EnhancedStatusCode::parse(head)?;
        Some((code, rest))
    }

    /// Returns true if this is a success response (2xx).
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }

    /// Returns the first message line.
    pub fn first_message(&self) -> &str {
        self.message.first().map(|s| s.as_str()).unwrap_or("")
    }

    /// Returns all message lines joined.
    pub fn full_message(&self) -> String {
        self.message.join("\n")
    }

    /// Converts to an error outside the AUTH exchange.
    pub fn to_error(&self) -> SmtpError {
        let err = SmtpError::from_smtp_response(self.code, self.full_message());
        self.attach_enhanced(err)
    }

    /// Converts to an error during the AUTH exchange.
    ///
    /// An enhanced `5.7.11` overrides the basic code: the server wants TLS,
    /// it has not judged the password.
    pub fn to_auth_error(&self) -> SmtpError {
        let err = match &self.enhanced_code {
            Some(enhanced) if enhanced.requires_encryption() => {
                SmtpError::new(SmtpErrorKind::EncryptionRequired, self.full_message())
                    .with_smtp_code(self.code)
            }
            _ => SmtpError::from_auth_response(self.code, self.full_message()),
        };
        self.attach_enhanced(err)
    }

    fn attach_enhanced(&self, err: SmtpError) -> SmtpError {
        match &self.enhanced_code {
            Some(enhanced) => err.with_enhanced_code(enhanced.clone()),
            None => err,
        }
    }
}

impl fmt::Display for SmtpResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.first_message())
    }
}

/// ESMTP server capabilities.
#[derive(Debug, Clone, Default)]
pub struct EsmtpCapabilities {
    /// Supported authentication mechanisms.
    pub auth_mechanisms: HashSet<AuthMethod>,
    /// STARTTLS supported.
    pub starttls: bool,
    /// Enhanced status codes supported.
    pub enhanced_status_codes: bool,
    /// Raw capability strings.
    pub raw: Vec<String>,
}

impl EsmtpCapabilities {
    /// Parses capabilities from EHLO response.
    ///
    /// The first line is the server greeting and carries no capability.
    pub fn from_ehlo_response(response: &SmtpResponse) -> Self {
        let mut caps = Self::default();

        for line in response.message.iter().skip(1) {
            let line = line.trim().to_uppercase();
            let (capability, params) = line.split_once(' ').unwrap_or((line.as_str(), ""));

            match capability {
                "AUTH" => Self::add_mechanisms(&mut caps, params),
                // Pre-RFC form still announced by some servers: "AUTH=LOGIN".
                _ if capability.starts_with("AUTH=") => {
                    Self::add_mechanisms(&mut caps, &line["AUTH=".len()..])
                }
                "STARTTLS" => caps.starttls = true,
                "ENHANCEDSTATUSCODES" => caps.enhanced_status_codes = true,
                _ => {}
            }

            caps.raw.push(line);
        }

        caps
    }

    fn add_mechanisms(caps: &mut Self, params: &str) {
        caps.auth_mechanisms
            .extend(params.split_whitespace().filter_map(AuthMethod::from_capability));
    }

    /// Returns the advertised mechanisms in a stable order.
    pub fn mechanisms(&self) -> Vec<AuthMethod> {
        let mut methods: Vec<_> = self.auth_mechanisms.iter().copied().collect();
        methods.sort_by_key(|m| std::cmp::Reverse(m.priority()));
        methods
    }
}

/// SMTP session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Initial state, greeting not read yet.
    Initial,
    /// Connected, received server greeting.
    Connected,
    /// EHLO/HELO sent, ready for TLS or AUTH.
    Greeted,
    /// TLS established.
    TlsEstablished,
    /// Authenticated.
    Authenticated,
    /// Connection closed.
    Closed,
}

impl TransactionState {
    /// Returns true if authentication is allowed in this state.
    pub fn can_authenticate(&self) -> bool {
        matches!(self, TransactionState::Greeted)
    }
}

/// Response codes used during verification.
pub mod codes {
    /// Service ready.
    pub const SERVICE_READY: u16 = 220;
    /// Authentication successful.
    pub const AUTH_SUCCESS: u16 = 235;
    /// OK.
    pub const OK: u16 = 250;
    /// Continue (AUTH).
    pub const AUTH_CONTINUE: u16 = 334;
}
