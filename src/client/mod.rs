//! SMTP authentication client.
//!
//! Opens one connection per verification, negotiates TLS as requested,
//! presents the login/password pair through SASL and reports whether the
//! server accepted it. The connection is closed on every exit path.

use async_trait::async_trait;
use secrecy::SecretString;
use std::fmt;
use std::sync::Arc;

use crate::auth::{AuthMethod, Authenticator};
use crate::config::{split_host_port, ClientConfig, DEFAULT_SMTPS_PORT, DEFAULT_SMTP_PORT};
use crate::errors::{SmtpError, SmtpErrorKind, SmtpResult};
use crate::protocol::{codes, EsmtpCapabilities, SmtpCommand, SmtpResponse, TransactionState};
use crate::transport::{Endpoint, SmtpTransport, TcpTransport};

/// URL scheme of the target server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    /// Plain SMTP, optionally upgraded with STARTTLS.
    Smtp,
    /// SMTP over implicit TLS.
    Smtps,
}

impl Scheme {
    /// Returns the scheme name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Smtp => "smtp",
            Scheme::Smtps => "smtps",
        }
    }

    /// Returns the port used when the target names none.
    pub fn default_port(&self) -> u16 {
        match self {
            Scheme::Smtp => DEFAULT_SMTP_PORT,
            Scheme::Smtps => DEFAULT_SMTPS_PORT,
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether the control connection must be encrypted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UseSsl {
    /// No encryption demanded; plaintext AUTH is allowed.
    None,
    /// The control connection must be encrypted before AUTH.
    Control,
}

/// One verification request.
#[derive(Clone)]
pub struct VerifyRequest {
    /// Target host, optionally with `:port`.
    pub host: String,
    /// URL scheme.
    pub scheme: Scheme,
    /// Encryption demand.
    pub use_ssl: UseSsl,
    /// Login identity presented to the server.
    pub identity: String,
    /// Password.
    pub secret: SecretString,
}

impl VerifyRequest {
    /// Returns the target as a URL, for diagnostics.
    pub fn url(&self) -> String {
        format!("{}://{}", self.scheme, self.host)
    }
}

impl fmt::Debug for VerifyRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VerifyRequest")
            .field("host", &self.host)
            .field("scheme", &self.scheme)
            .field("use_ssl", &self.use_ssl)
            .field("identity", &self.identity)
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

/// Capability that checks a login/password pair against a mail server.
#[async_trait]
pub trait SmtpAuthClient: Send + Sync {
    /// Attempts a login. `Ok` means the server accepted the credentials.
    async fn verify(&self, request: &VerifyRequest) -> SmtpResult<()>;
}

/// Network-backed [`SmtpAuthClient`].
#[derive(Debug, Clone)]
pub struct SmtpLoginClient {
    config: Arc<ClientConfig>,
}

impl SmtpLoginClient {
    /// Creates a client after validating its configuration.
    pub fn new(config: ClientConfig) -> SmtpResult<Self> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
        })
    }

    /// Returns the client configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Works out where to connect for a request.
    ///
    /// A port in the target wins over the `port` option, which wins over the
    /// scheme default.
    pub fn endpoint(&self, request: &VerifyRequest) -> SmtpResult<Endpoint> {
        let (host, port) = split_host_port(&request.host)?;
        Ok(Endpoint {
            host: host.to_string(),
            port: port
                .or(self.config.port)
                .unwrap_or_else(|| request.scheme.default_port()),
            implicit_tls: request.scheme == Scheme::Smtps,
        })
    }
}

#[async_trait]
impl SmtpAuthClient for SmtpLoginClient {
    async fn verify(&self, request: &VerifyRequest) -> SmtpResult<()> {
        let endpoint = self.endpoint(request)?;

        #[cfg(feature = "tracing")]
        tracing::debug!(url = %request.url(), port = endpoint.port, "Opening SMTP session");

        let mut transport = TcpTransport::connect(&endpoint, &self.config).await?;
        run_session(&mut transport, &self.config, request, &endpoint.host).await
    }
}

/// Runs the login exchange over a connected transport and closes it.
///
/// `tls_host` is the name checked against the server certificate.
pub async fn run_session(
    transport: &mut dyn SmtpTransport,
    config: &ClientConfig,
    request: &VerifyRequest,
    tls_host: &str,
) -> SmtpResult<()> {
    let result = login(transport, config, request, tls_host).await;
    transport.close().await;
    result
}

async fn login(
    transport: &mut dyn SmtpTransport,
    config: &ClientConfig,
    request: &VerifyRequest,
    tls_host: &str,
) -> SmtpResult<()> {
    greet(transport, config).await?;

    if request.scheme == Scheme::Smtp && request.use_ssl == UseSsl::Control {
        start_tls(transport, config, tls_host).await?;
        greet(transport, config).await?;
    }

    authenticate(transport, config, request).await
}

/// Sends EHLO, falling back to HELO, and records the capabilities.
async fn greet(transport: &mut dyn SmtpTransport, config: &ClientConfig) -> SmtpResult<()> {
    let client_id = config.client_id().to_string();

    let mut response = transport.send_command(&SmtpCommand::Ehlo(client_id.clone())).await?;
    if !response.is_success() {
        response = transport.send_command(&SmtpCommand::Helo(client_id)).await?;
        if !response.is_success() {
            return Err(response.to_error());
        }
    }

    transport.set_capabilities(EsmtpCapabilities::from_ehlo_response(&response));
    transport.set_state(TransactionState::Greeted);
    Ok(())
}

async fn start_tls(
    transport: &mut dyn SmtpTransport,
    config: &ClientConfig,
    tls_host: &str,
) -> SmtpResult<()> {
    let offered = transport.capabilities().map(|c| c.starttls).unwrap_or(false);
    if !offered {
        return Err(SmtpError::new(
            SmtpErrorKind::StarttlsNotSupported,
            "Server does not support STARTTLS",
        ));
    }

    let response = transport.send_command(&SmtpCommand::StartTls).await?;
    if response.code != codes::SERVICE_READY {
        return Err(SmtpError::new(
            SmtpErrorKind::StarttlsNotSupported,
            format!("STARTTLS refused: {}", response),
        )
        .with_smtp_code(response.code));
    }

    transport.upgrade_tls(&config.tls, tls_host).await
}

async fn authenticate(
    transport: &mut dyn SmtpTransport,
    config: &ClientConfig,
    request: &VerifyRequest,
) -> SmtpResult<()> {
    if !transport.state().can_authenticate() {
        return Err(SmtpError::protocol("Session is not ready for AUTH"));
    }

    let available = transport
        .capabilities()
        .map(EsmtpCapabilities::mechanisms)
        .unwrap_or_default();
    let method = Authenticator::select_method(&available, config.auth_method)?;

    #[cfg(feature = "tracing")]
    tracing::debug!(mechanism = %method, tls = transport.is_tls(), "Authenticating");

    match method {
        AuthMethod::Plain => auth_plain(transport, request).await?,
        AuthMethod::Login => auth_login(transport, request).await?,
        AuthMethod::CramMd5 => auth_cram_md5(transport, request).await?,
    }

    transport.set_state(TransactionState::Authenticated);
    Ok(())
}

async fn auth_plain(transport: &mut dyn SmtpTransport, request: &VerifyRequest) -> SmtpResult<()> {
    let command = SmtpCommand::Auth {
        mechanism: AuthMethod::Plain,
        initial_response: Some(Authenticator::plain_initial_response(
            &request.identity,
            &request.secret,
        )),
    };

    let response = transport.send_command(&command).await?;
    expect(response, codes::AUTH_SUCCESS).map(drop)
}

async fn auth_login(transport: &mut dyn SmtpTransport, request: &VerifyRequest) -> SmtpResult<()> {
    let command = SmtpCommand::Auth {
        mechanism: AuthMethod::Login,
        initial_response: None,
    };
    let response = transport.send_command(&command).await?;
    expect(response, codes::AUTH_CONTINUE)?;

    let username = SmtpCommand::AuthResponse(Authenticator::login_username(&request.identity));
    let response = transport.send_command(&username).await?;
    expect(response, codes::AUTH_CONTINUE)?;

    let password = SmtpCommand::AuthResponse(Authenticator::login_password(&request.secret));
    let response = transport.send_command(&password).await?;
    expect(response, codes::AUTH_SUCCESS).map(drop)
}

async fn auth_cram_md5(
    transport: &mut dyn SmtpTransport,
    request: &VerifyRequest,
) -> SmtpResult<()> {
    let command = SmtpCommand::Auth {
        mechanism: AuthMethod::CramMd5,
        initial_response: None,
    };
    let response = transport.send_command(&command).await?;
    let challenge = expect(response, codes::AUTH_CONTINUE)?;

    let answer = Authenticator::cram_md5_response(
        challenge.first_message(),
        &request.identity,
        &request.secret,
    )?;
    let response = transport.send_command(&SmtpCommand::AuthResponse(answer)).await?;
    expect(response, codes::AUTH_SUCCESS).map(drop)
}

/// Accepts only `code`; anything else is classified as an AUTH failure.
fn expect(response: SmtpResponse, code: u16) -> SmtpResult<SmtpResponse> {
    if response.code == code {
        Ok(response)
    } else {
        Err(response.to_auth_error())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::{ehlo_response, MockTransport};
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;

    fn request(scheme: Scheme, use_ssl: UseSsl) -> VerifyRequest {
        VerifyRequest {
            host: "mail.example.com".to_string(),
            scheme,
            use_ssl,
            identity: "alice@example.com".to_string(),
            secret: SecretString::new("hunter2".to_string()),
        }
    }

    fn verbs(transport: &MockTransport) -> Vec<String> {
        transport
            .recorded_commands()
            .iter()
            .map(|c| c.to_smtp_string().split(' ').next().unwrap_or("").to_string())
            .collect()
    }

    #[tokio::test]
    async fn test_plain_login_without_tls() {
        let mut transport = MockTransport::new();
        transport
            .queue_response(ehlo_response(&["AUTH PLAIN LOGIN", "STARTTLS"]))
            .queue_response(SmtpResponse::new(235, "2.7.0 Authentication successful"));

        let config = ClientConfig::default();
        let result = run_session(
            &mut transport,
            &config,
            &request(Scheme::Smtp, UseSsl::None),
            "mail.example.com",
        )
        .await;

        assert!(result.is_ok());
        assert_eq!(verbs(&transport), vec!["EHLO", "AUTH", "QUIT"]);
        assert!(!transport.is_tls());
        assert_eq!(transport.state(), TransactionState::Closed);

        let commands = transport.recorded_commands();
        match &commands[1] {
            SmtpCommand::Auth {
                mechanism: AuthMethod::Plain,
                initial_response: Some(initial),
            } => {
                let decoded = BASE64.decode(initial).unwrap();
                assert_eq!(decoded, b"\0alice@example.com\0hunter2");
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_starttls_when_encryption_required() {
        let mut transport = MockTransport::new();
        transport
            .queue_response(ehlo_response(&["STARTTLS", "AUTH PLAIN"]))
            .queue_response(SmtpResponse::new(220, "Ready to start TLS"))
            .queue_response(ehlo_response(&["AUTH PLAIN"]))
            .queue_response(SmtpResponse::new(235, "OK"));

        let config = ClientConfig::default();
        run_session(
            &mut transport,
            &config,
            &request(Scheme::Smtp, UseSsl::Control),
            "mail.example.com",
        )
        .await
        .unwrap();

        assert_eq!(verbs(&transport), vec!["EHLO", "STARTTLS", "EHLO", "AUTH", "QUIT"]);
        assert!(transport.is_tls());
    }

    #[tokio::test]
    async fn test_starttls_missing_is_not_a_rejection() {
        let mut transport = MockTransport::new();
        transport.queue_response(ehlo_response(&["AUTH PLAIN"]));

        let err = run_session(
            &mut transport,
            &ClientConfig::default(),
            &request(Scheme::Smtp, UseSsl::Control),
            "mail.example.com",
        )
        .await
        .unwrap_err();

        assert_eq!(err.kind(), SmtpErrorKind::StarttlsNotSupported);
        assert!(!err.is_rejection());
        assert_eq!(verbs(&transport), vec!["EHLO", "QUIT"]);
    }

    #[tokio::test]
    async fn test_implicit_tls_skips_starttls() {
        let mut transport = MockTransport::new();
        transport.set_tls_enabled(true);
        transport
            .queue_response(ehlo_response(&["AUTH PLAIN"]))
            .queue_response(SmtpResponse::new(235, "OK"));

        run_session(
            &mut transport,
            &ClientConfig::default(),
            &request(Scheme::Smtps, UseSsl::Control),
            "mail.example.com",
        )
        .await
        .unwrap();

        assert_eq!(verbs(&transport), vec!["EHLO", "AUTH", "QUIT"]);
    }

    #[tokio::test]
    async fn test_rejected_password_still_quits() {
        let mut transport = MockTransport::new();
        transport
            .queue_response(ehlo_response(&["AUTH PLAIN"]))
            .queue_response(SmtpResponse::new(535, "5.7.8 Authentication credentials invalid"));

        let err = run_session(
            &mut transport,
            &ClientConfig::default(),
            &request(Scheme::Smtp, UseSsl::None),
            "mail.example.com",
        )
        .await
        .unwrap_err();

        assert_eq!(err.kind(), SmtpErrorKind::CredentialsInvalid);
        assert!(err.is_rejection());
        assert_eq!(verbs(&transport).last().map(String::as_str), Some("QUIT"));
        assert_eq!(transport.state(), TransactionState::Closed);
    }

    #[tokio::test]
    async fn test_plaintext_auth_refused_by_policy() {
        let mut transport = MockTransport::new();
        transport
            .queue_response(ehlo_response(&["AUTH PLAIN", "STARTTLS"]))
            .queue_response(
                SmtpResponse::parse(&["530 5.7.0 Must issue a STARTTLS command first".to_string()])
                    .unwrap(),
            );

        let err = run_session(
            &mut transport,
            &ClientConfig::default(),
            &request(Scheme::Smtp, UseSsl::None),
            "mail.example.com",
        )
        .await
        .unwrap_err();

        assert_eq!(err.kind(), SmtpErrorKind::EncryptionRequired);
        assert!(!err.is_rejection());
        assert_eq!(verbs(&transport), vec!["EHLO", "AUTH", "QUIT"]);
    }

    #[tokio::test]
    async fn test_login_mechanism_exchange() {
        let mut transport = MockTransport::new();
        transport
            .queue_response(ehlo_response(&["AUTH LOGIN"]))
            .queue_response(SmtpResponse::new(334, "VXNlcm5hbWU6"))
            .queue_response(SmtpResponse::new(334, "UGFzc3dvcmQ6"))
            .queue_response(SmtpResponse::new(235, "OK"));

        run_session(
            &mut transport,
            &ClientConfig::default(),
            &request(Scheme::Smtp, UseSsl::None),
            "mail.example.com",
        )
        .await
        .unwrap();

        let commands = transport.recorded_commands();
        assert_eq!(commands[2], SmtpCommand::AuthResponse(BASE64.encode("alice@example.com")));
        assert_eq!(commands[3], SmtpCommand::AuthResponse(BASE64.encode("hunter2")));
    }

    #[tokio::test]
    async fn test_cram_md5_preferred() {
        let mut transport = MockTransport::new();
        transport
            .queue_response(ehlo_response(&["AUTH LOGIN PLAIN CRAM-MD5"]))
            .queue_response(SmtpResponse::new(
                334,
                "PDE4OTYuNjk3MTcwOTUyQHBvc3RvZmZpY2UucmVzdG9uLm1jaS5uZXQ+",
            ))
            .queue_response(SmtpResponse::new(535, "Authentication failed"));

        let err = run_session(
            &mut transport,
            &ClientConfig::default(),
            &request(Scheme::Smtp, UseSsl::None),
            "mail.example.com",
        )
        .await
        .unwrap_err();

        assert!(err.is_rejection());
        match &transport.recorded_commands()[1] {
            SmtpCommand::Auth { mechanism, .. } => assert_eq!(*mechanism, AuthMethod::CramMd5),
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_forced_mechanism() {
        let mut transport = MockTransport::new();
        transport
            .queue_response(ehlo_response(&["AUTH PLAIN CRAM-MD5"]))
            .queue_response(SmtpResponse::new(235, "OK"));

        let config = ClientConfig::builder()
            .auth_method(AuthMethod::Plain)
            .build()
            .unwrap();
        run_session(
            &mut transport,
            &config,
            &request(Scheme::Smtp, UseSsl::None),
            "mail.example.com",
        )
        .await
        .unwrap();

        match &transport.recorded_commands()[1] {
            SmtpCommand::Auth { mechanism, .. } => assert_eq!(*mechanism, AuthMethod::Plain),
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_no_auth_advertised() {
        let mut transport = MockTransport::new();
        transport.queue_response(ehlo_response(&["PIPELINING"]));

        let err = run_session(
            &mut transport,
            &ClientConfig::default(),
            &request(Scheme::Smtp, UseSsl::None),
            "mail.example.com",
        )
        .await
        .unwrap_err();

        assert_eq!(err.kind(), SmtpErrorKind::AuthMethodNotSupported);
        assert!(!err.is_rejection());
    }

    #[tokio::test]
    async fn test_helo_fallback() {
        let mut transport = MockTransport::new();
        transport
            .queue_error(502, "Command not implemented")
            .queue_response(SmtpResponse::new(250, "mail.example.com"));

        let err = run_session(
            &mut transport,
            &ClientConfig::default(),
            &request(Scheme::Smtp, UseSsl::None),
            "mail.example.com",
        )
        .await
        .unwrap_err();

        // HELO servers advertise nothing, so no mechanism can be picked.
        assert_eq!(err.kind(), SmtpErrorKind::AuthMethodNotSupported);
        assert_eq!(verbs(&transport), vec!["EHLO", "HELO", "QUIT"]);
    }

    #[tokio::test]
    async fn test_transport_failure_closes() {
        let mut transport = MockTransport::new();
        transport.fail_next_with(SmtpError::new(
            SmtpErrorKind::ConnectionReset,
            "Server closed connection",
        ));

        let err = run_session(
            &mut transport,
            &ClientConfig::default(),
            &request(Scheme::Smtp, UseSsl::None),
            "mail.example.com",
        )
        .await
        .unwrap_err();

        assert_eq!(err.kind(), SmtpErrorKind::ConnectionReset);
        assert_eq!(transport.state(), TransactionState::Closed);
    }

    #[test]
    fn test_endpoint_selection() {
        let client = SmtpLoginClient::new(ClientConfig::default()).unwrap();

        let endpoint = client.endpoint(&request(Scheme::Smtp, UseSsl::None)).unwrap();
        assert_eq!(endpoint.port, 25);
        assert!(!endpoint.implicit_tls);

        let endpoint = client.endpoint(&request(Scheme::Smtps, UseSsl::Control)).unwrap();
        assert_eq!(endpoint.port, 465);
        assert!(endpoint.implicit_tls);

        let mut explicit = request(Scheme::Smtp, UseSsl::None);
        explicit.host = "[2001:db8::1]:2525".to_string();
        let endpoint = client.endpoint(&explicit).unwrap();
        assert_eq!(endpoint.host, "2001:db8::1");
        assert_eq!(endpoint.port, 2525);

        let client = SmtpLoginClient::new(ClientConfig::builder().port(587).build().unwrap()).unwrap();
        let endpoint = client.endpoint(&request(Scheme::Smtp, UseSsl::None)).unwrap();
        assert_eq!(endpoint.port, 587);
    }

    #[test]
    fn test_request_debug_redacts_secret() {
        let debug = format!("{:?}", request(Scheme::Smtp, UseSsl::None));
        assert!(debug.contains("[REDACTED]"));
        assert!(!debug.contains("hunter2"));
        assert_eq!(request(Scheme::Smtps, UseSsl::Control).url(), "smtps://mail.example.com");
    }
}
