//! Configuration for a verification attempt.
//!
//! The module argument list carries two kinds of tokens:
//! - positional tokens, resolved by [`resolve`] into a [`ConnectionPolicy`]
//!   (target host, protocol, encryption requirement, username domain suffix)
//! - `key=value` options, split out by [`ModuleArgs::split`] into a
//!   [`ClientConfig`] (port, timeouts, TLS verification, EHLO name)

use std::path::PathBuf;
use std::time::Duration;
use serde::{Deserialize, Serialize};

use crate::auth::AuthMethod;
use crate::errors::{ConfigError, SmtpError, SmtpResult};

/// Default port for `smtp` (STARTTLS or plaintext).
pub const DEFAULT_SMTP_PORT: u16 = 25;

/// Default port for `smtps` (implicit TLS).
pub const DEFAULT_SMTPS_PORT: u16 = 465;

/// Default timeout for connections.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default timeout for commands.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// Default timeout for the TLS handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// How the connection to the mail server is secured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    /// `smtp://`, upgraded with STARTTLS when encryption is required.
    #[default]
    StartTls,
    /// `smtps://`, TLS from the first byte.
    ImplicitTls,
}

impl Protocol {
    /// Parses a protocol keyword. Matching is case sensitive.
    pub fn from_keyword(token: &str) -> Option<Self> {
        match token {
            "starttls" => Some(Protocol::StartTls),
            "tls" => Some(Protocol::ImplicitTls),
            _ => None,
        }
    }
}

/// Normalized description of how to reach the mail server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionPolicy {
    /// Mail server, optionally with `:port`.
    pub target_host: String,
    /// Connection scheme.
    pub protocol: Protocol,
    /// Whether the control connection must be encrypted.
    pub encryption_required: bool,
    /// Appended to the username; empty or starting with `@`.
    pub domain_suffix: String,
}

impl ConnectionPolicy {
    /// Returns the login identity sent to the server.
    pub fn compose_identity(&self, username: &str) -> String {
        format!("{}{}", username, self.domain_suffix)
    }
}

/// Resolves the positional module arguments into a [`ConnectionPolicy`].
///
/// `args[0]` is the host. A single extra token is a domain suffix when it
/// starts with `@` and a protocol keyword otherwise. With two or more extra
/// tokens the first is the protocol and the second the domain suffix; the
/// rest are ignored. Naming a protocol always makes encryption mandatory.
pub fn resolve<S: AsRef<str>>(args: &[S]) -> Result<ConnectionPolicy, ConfigError> {
    let target_host = args.first().ok_or(ConfigError::NoHost)?.as_ref().to_string();

    let mut policy = ConnectionPolicy {
        target_host,
        protocol: Protocol::StartTls,
        encryption_required: false,
        domain_suffix: String::new(),
    };

    match args {
        [] | [_] => {}
        [_, token] if token.as_ref().starts_with('@') => {
            policy.domain_suffix = token.as_ref().to_string();
        }
        [_, token, rest @ ..] => {
            let token = token.as_ref();
            policy.protocol = Protocol::from_keyword(token)
                .ok_or_else(|| ConfigError::BadProtocol(token.to_string()))?;
            policy.encryption_required = true;

            if let Some(domain) = rest.first() {
                let domain = domain.as_ref();
                if !domain.starts_with('@') {
                    return Err(ConfigError::BadDomain(domain.to_string()));
                }
                policy.domain_suffix = domain.to_string();
            }
        }
    }

    Ok(policy)
}

/// Splits `host`, `host:port`, `[v6]` or `[v6]:port` into its parts.
///
/// A bare IPv6 address (several colons, no brackets) is returned whole.
pub fn split_host_port(target: &str) -> SmtpResult<(&str, Option<u16>)> {
    let parse_port = |port: &str| {
        port.parse::<u16>()
            .ok()
            .filter(|p| *p != 0)
            .ok_or_else(|| SmtpError::configuration(format!("Invalid port in \"{}\"", target)))
    };

    if let Some(rest) = target.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| SmtpError::configuration(format!("Unclosed bracket in \"{}\"", target)))?;
        return match tail {
            "" => Ok((host, None)),
            _ => match tail.strip_prefix(':') {
                Some(port) => Ok((host, Some(parse_port(port)?))),
                None => Err(SmtpError::configuration(format!("Invalid host \"{}\"", target))),
            },
        };
    }

    match target.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => Ok((host, Some(parse_port(port)?))),
        _ => Ok((target, None)),
    }
}

/// TLS configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Verify the server certificate chain.
    #[serde(default = "default_true")]
    pub verify_certificate: bool,
    /// Verify the hostname matches the certificate.
    #[serde(default = "default_true")]
    pub verify_hostname: bool,
    /// Extra PEM trust anchors, added to the bundled roots.
    pub ca_cert_path: Option<PathBuf>,
    /// TLS handshake timeout.
    #[serde(default = "default_handshake_timeout", with = "humantime_serde")]
    pub handshake_timeout: Duration,
}

fn default_true() -> bool {
    true
}

fn default_handshake_timeout() -> Duration { DEFAULT_HANDSHAKE_TIMEOUT }

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            verify_certificate: true,
            verify_hostname: true,
            ca_cert_path: None,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }
}

impl TlsConfig {
    /// Returns true if any part of certificate verification is switched off.
    pub fn is_permissive(&self) -> bool {
        !self.verify_certificate || !self.verify_hostname
    }

    /// Validates the TLS configuration.
    pub fn validate(&self) -> SmtpResult<()> {
        if self.handshake_timeout == Duration::ZERO {
            return Err(SmtpError::configuration("handshake_timeout must be positive"));
        }

        if self.is_permissive() {
            #[cfg(feature = "tracing")]
            tracing::warn!(
                verify_certificate = self.verify_certificate,
                verify_hostname = self.verify_hostname,
                "TLS certificate verification is partially or fully disabled"
            );
        }

        Ok(())
    }
}

/// Settings for the SMTP authentication client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Port override; the scheme default applies otherwise.
    pub port: Option<u16>,
    /// TLS configuration.
    #[serde(default)]
    pub tls: TlsConfig,
    /// Connect timeout.
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Command timeout.
    #[serde(default = "default_command_timeout", with = "humantime_serde")]
    pub command_timeout: Duration,
    /// Client identifier for EHLO.
    pub client_id: Option<String>,
    /// Forced SASL mechanism.
    pub auth_method: Option<AuthMethod>,
}

fn default_connect_timeout() -> Duration { DEFAULT_CONNECT_TIMEOUT }
fn default_command_timeout() -> Duration { DEFAULT_COMMAND_TIMEOUT }

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            port: None,
            tls: TlsConfig::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            client_id: None,
            auth_method: None,
        }
    }
}

impl ClientConfig {
    /// Creates a new configuration builder.
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::default()
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SmtpResult<()> {
        if self.port == Some(0) {
            return Err(SmtpError::configuration("Port must be non-zero"));
        }

        if self.connect_timeout == Duration::ZERO || self.command_timeout == Duration::ZERO {
            return Err(SmtpError::configuration("Timeouts must be positive"));
        }

        if self.client_id.as_deref().is_some_and(str::is_empty) {
            return Err(SmtpError::configuration("client_id must not be empty"));
        }

        self.tls.validate()
    }

    /// Returns the client identifier for EHLO.
    pub fn client_id(&self) -> &str {
        self.client_id.as_deref().unwrap_or("localhost")
    }
}

/// Builder for [`ClientConfig`].
#[derive(Debug, Default)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    /// Sets the port override.
    pub fn port(mut self, port: u16) -> Self {
        self.config.port = Some(port);
        self
    }

    /// Sets the TLS configuration.
    pub fn tls(mut self, config: TlsConfig) -> Self {
        self.config.tls = config;
        self
    }

    /// Sets whether to verify the certificate chain and hostname.
    pub fn verify_certificate(mut self, verify: bool) -> Self {
        self.config.tls.verify_certificate = verify;
        self.config.tls.verify_hostname = verify;
        self
    }

    /// Sets whether to verify the hostname only.
    pub fn verify_hostname(mut self, verify: bool) -> Self {
        self.config.tls.verify_hostname = verify;
        self
    }

    /// Sets the CA certificate path.
    pub fn ca_cert_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.tls.ca_cert_path = Some(path.into());
        self
    }

    /// Sets connect timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Sets command timeout.
    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.config.command_timeout = timeout;
        self
    }

    /// Sets the client identifier for EHLO.
    pub fn client_id(mut self, id: impl Into<String>) -> Self {
        self.config.client_id = Some(id.into());
        self
    }

    /// Forces a SASL mechanism.
    pub fn auth_method(mut self, method: AuthMethod) -> Self {
        self.config.auth_method = Some(method);
        self
    }

    /// Builds the configuration.
    pub fn build(self) -> SmtpResult<ClientConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Module argument list, split into positional tokens and options.
#[derive(Debug)]
pub struct ModuleArgs;

impl ModuleArgs {
    /// Separates `key=value` options from positional tokens.
    ///
    /// Only tokens whose key is a known option are consumed; everything else
    /// keeps its relative order and is left for [`resolve`].
    pub fn split<S: AsRef<str>>(args: &[S]) -> Result<(Vec<String>, ClientConfig), ConfigError> {
        let mut positional = Vec::with_capacity(args.len());
        let mut builder = ClientConfig::builder();

        for arg in args {
            let token = arg.as_ref();
            let option = token
                .split_once('=')
                .filter(|(key, _)| !token.starts_with('@') && Self::is_option(key));

            match option {
                Some((key, value)) => builder = Self::apply(builder, key, value, token)?,
                None => positional.push(token.to_string()),
            }
        }

        let config = builder
            .build()
            .map_err(|e| ConfigError::BadOption(e.message().to_string()))?;
        Ok((positional, config))
    }

    fn is_option(key: &str) -> bool {
        matches!(
            key,
            "port" | "timeout" | "command_timeout" | "helo" | "auth" | "verify"
                | "verify_hostname" | "ca_file"
        )
    }

    fn apply(
        builder: ClientConfigBuilder,
        key: &str,
        value: &str,
        token: &str,
    ) -> Result<ClientConfigBuilder, ConfigError> {
        let bad = || ConfigError::BadOption(token.to_string());

        let builder = match key {
            "port" => builder.port(value.parse::<u16>().ok().filter(|p| *p != 0).ok_or_else(bad)?),
            "timeout" => builder.connect_timeout(parse_duration(value).ok_or_else(bad)?),
            "command_timeout" => builder.command_timeout(parse_duration(value).ok_or_else(bad)?),
            "helo" if !value.is_empty() => builder.client_id(value),
            "auth" => builder.auth_method(AuthMethod::from_capability(value).ok_or_else(bad)?),
            "verify" => builder.verify_certificate(parse_switch(value).ok_or_else(bad)?),
            "verify_hostname" => builder.verify_hostname(parse_switch(value).ok_or_else(bad)?),
            "ca_file" if !value.is_empty() => builder.ca_cert_path(value),
            _ => return Err(bad()),
        };
        Ok(builder)
    }
}

fn parse_duration(value: &str) -> Option<Duration> {
    humantime::parse_duration(value)
        .ok()
        .filter(|d| *d > Duration::ZERO)
}

fn parse_switch(value: &str) -> Option<bool> {
    match value {
        "yes" | "true" | "on" | "1" => Some(true),
        "no" | "false" | "off" | "0" => Some(false),
        _ => None,
    }
}

// Humantime serde support
mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn policy(host: &str, protocol: Protocol, encrypted: bool, suffix: &str) -> ConnectionPolicy {
        ConnectionPolicy {
            target_host: host.to_string(),
            protocol,
            encryption_required: encrypted,
            domain_suffix: suffix.to_string(),
        }
    }

    #[rstest]
    #[case(&["mail.example.com"], policy("mail.example.com", Protocol::StartTls, false, ""))]
    #[case(&["mail.example.com", "@example.com"], policy("mail.example.com", Protocol::StartTls, false, "@example.com"))]
    #[case(&["mail.example.com", "tls"], policy("mail.example.com", Protocol::ImplicitTls, true, ""))]
    #[case(&["mail.example.com", "starttls"], policy("mail.example.com", Protocol::StartTls, true, ""))]
    #[case(&["mail.example.com", "starttls", "@example.com"], policy("mail.example.com", Protocol::StartTls, true, "@example.com"))]
    #[case(&["mail.example.com", "tls", "@example.com", "ignored", "@also"], policy("mail.example.com", Protocol::ImplicitTls, true, "@example.com"))]
    fn test_resolve_accepts(#[case] args: &[&str], #[case] expected: ConnectionPolicy) {
        assert_eq!(resolve(args).unwrap(), expected);
    }

    #[rstest]
    #[case(&[], ConfigError::NoHost)]
    #[case(&["mail.example.com", "bogus"], ConfigError::BadProtocol("bogus".to_string()))]
    #[case(&["mail.example.com", "TLS"], ConfigError::BadProtocol("TLS".to_string()))]
    #[case(&["mail.example.com", "@example.com", "@example.org"], ConfigError::BadProtocol("@example.com".to_string()))]
    #[case(&["mail.example.com", "tls", "example.com"], ConfigError::BadDomain("example.com".to_string()))]
    #[case(&["mail.example.com", "bogus", "example.com"], ConfigError::BadProtocol("bogus".to_string()))]
    fn test_resolve_rejects(#[case] args: &[&str], #[case] expected: ConfigError) {
        assert_eq!(resolve(args).unwrap_err(), expected);
    }

    #[test]
    fn test_resolve_is_deterministic() {
        let args = vec!["mail.example.com".to_string(), "tls".to_string()];
        assert_eq!(resolve(&args), resolve(&args));
    }

    #[rstest]
    #[case("")]
    #[case("@example.com")]
    #[case("@sub.example.org")]
    fn test_compose_identity(#[case] suffix: &str) {
        let policy = policy("mail.example.com", Protocol::StartTls, false, suffix);
        assert_eq!(policy.compose_identity("alice"), format!("alice{}", suffix));
    }

    #[rstest]
    #[case("mail.example.com", "mail.example.com", None)]
    #[case("mail.example.com:2525", "mail.example.com", Some(2525))]
    #[case("192.0.2.1:587", "192.0.2.1", Some(587))]
    #[case("[2001:db8::1]:25", "2001:db8::1", Some(25))]
    #[case("[2001:db8::1]", "2001:db8::1", None)]
    #[case("2001:db8::1", "2001:db8::1", None)]
    fn test_split_host_port(#[case] target: &str, #[case] host: &str, #[case] port: Option<u16>) {
        assert_eq!(split_host_port(target).unwrap(), (host, port));
    }

    #[rstest]
    #[case("mail.example.com:smtp")]
    #[case("mail.example.com:0")]
    #[case("[2001:db8::1")]
    #[case("[2001:db8::1]25")]
    fn test_split_host_port_invalid(#[case] target: &str) {
        assert!(split_host_port(target).is_err());
    }

    #[test]
    fn test_module_args_defaults() {
        let (positional, config) = ModuleArgs::split(&["mail.example.com", "tls"]).unwrap();
        assert_eq!(positional, vec!["mail.example.com", "tls"]);
        assert_eq!(config.port, None);
        assert_eq!(config.connect_timeout, DEFAULT_CONNECT_TIMEOUT);
        assert_eq!(config.client_id(), "localhost");
        assert!(config.tls.verify_certificate);
        assert!(config.tls.verify_hostname);
    }

    #[test]
    fn test_module_args_options() {
        let args = [
            "mail.example.com",
            "port=2525",
            "starttls",
            "timeout=5s",
            "verify=no",
            "@example.com",
            "helo=gateway.example.com",
            "auth=login",
        ];
        let (positional, config) = ModuleArgs::split(&args).unwrap();

        assert_eq!(positional, vec!["mail.example.com", "starttls", "@example.com"]);
        assert_eq!(config.port, Some(2525));
        assert_eq!(config.connect_timeout, Duration::from_secs(5));
        assert_eq!(config.client_id(), "gateway.example.com");
        assert_eq!(config.auth_method, Some(AuthMethod::Login));
        assert!(!config.tls.verify_certificate);
        assert!(!config.tls.verify_hostname);
    }

    #[test]
    fn test_module_args_unknown_keys_stay_positional() {
        let (positional, _) = ModuleArgs::split(&["mail.example.com", "mode=fast"]).unwrap();
        assert_eq!(positional, vec!["mail.example.com", "mode=fast"]);
        assert_eq!(
            resolve(&positional).unwrap_err(),
            ConfigError::BadProtocol("mode=fast".to_string())
        );
    }

    #[rstest]
    #[case("port=0")]
    #[case("port=smtp")]
    #[case("timeout=soon")]
    #[case("timeout=0s")]
    #[case("verify=maybe")]
    #[case("auth=gssapi")]
    #[case("helo=")]
    fn test_module_args_bad_values(#[case] option: &str) {
        let err = ModuleArgs::split(&["mail.example.com", option]).unwrap_err();
        assert_eq!(err, ConfigError::BadOption(option.to_string()));
    }

    #[test]
    fn test_hostname_only_verification_switch() {
        let (_, config) = ModuleArgs::split(&["mail.example.com", "verify_hostname=no"]).unwrap();
        assert!(config.tls.verify_certificate);
        assert!(!config.tls.verify_hostname);
        assert!(config.tls.is_permissive());
    }

    #[test]
    fn test_config_validation() {
        let result = ClientConfig::builder().port(0).build();
        assert!(result.is_err());

        let result = ClientConfig::builder()
            .command_timeout(Duration::ZERO)
            .build();
        assert!(result.is_err());
    }
}
