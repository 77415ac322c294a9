//! Transport layer for SMTP connections.
//!
//! Provides the [`SmtpTransport`] abstraction and a TCP implementation with
//! STARTTLS and implicit TLS support.

use async_trait::async_trait;
use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use trust_dns_resolver::TokioAsyncResolver;

use crate::config::{ClientConfig, TlsConfig};
use crate::errors::{SmtpError, SmtpErrorKind, SmtpResult};
use crate::protocol::{EsmtpCapabilities, SmtpCommand, SmtpResponse, TransactionState};

#[cfg(feature = "rustls-tls")]
pub mod tls;

/// Longest reply line accepted, CRLF included.
const MAX_LINE_LENGTH: usize = 4096;

/// Most lines accepted in one multiline reply.
const MAX_REPLY_LINES: usize = 100;

/// Upper bound on the QUIT exchange at close.
const QUIT_TIMEOUT: Duration = Duration::from_secs(1);

/// Trait for SMTP transport abstraction.
#[async_trait]
pub trait SmtpTransport: Send + Sync + fmt::Debug {
    /// Sends a command and receives a response.
    async fn send_command(&mut self, command: &SmtpCommand) -> SmtpResult<SmtpResponse>;

    /// Reads a response from the server.
    async fn read_response(&mut self) -> SmtpResult<SmtpResponse>;

    /// Upgrades the connection to TLS.
    async fn upgrade_tls(&mut self, config: &TlsConfig, host: &str) -> SmtpResult<()>;

    /// Returns true if TLS is enabled.
    fn is_tls(&self) -> bool;

    /// Sends QUIT and closes the connection. Never fails.
    async fn close(&mut self);

    /// Returns the current session state.
    fn state(&self) -> TransactionState;

    /// Sets the session state.
    fn set_state(&mut self, state: TransactionState);

    /// Returns the server capabilities.
    fn capabilities(&self) -> Option<&EsmtpCapabilities>;

    /// Sets the server capabilities.
    fn set_capabilities(&mut self, caps: EsmtpCapabilities);
}

/// Where to connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Host name or IP literal, without brackets.
    pub host: String,
    /// TCP port.
    pub port: u16,
    /// Start TLS before the greeting (`smtps`).
    pub implicit_tls: bool,
}

/// TCP connection with optional TLS.
pub struct TcpTransport {
    /// Read/write stream.
    stream: TransportStream,
    /// Command timeout.
    command_timeout: Duration,
    /// Session state.
    state: TransactionState,
    /// Server capabilities.
    capabilities: Option<EsmtpCapabilities>,
    /// TLS enabled flag.
    tls_enabled: bool,
    /// Set after a failed read or write; the stream is not reused.
    broken: bool,
    /// Server host.
    host: String,
}

/// Stream type that can be plain TCP or TLS.
enum TransportStream {
    Plain(BufReader<TcpStream>),
    #[cfg(feature = "rustls-tls")]
    Tls(BufReader<tokio_rustls::client::TlsStream<TcpStream>>),
    #[cfg(feature = "native-tls")]
    NativeTls(BufReader<tokio_native_tls::TlsStream<TcpStream>>),
    /// Placeholder while the socket is handed to the TLS handshake.
    Detached,
}

impl fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpTransport")
            .field("host", &self.host)
            .field("tls_enabled", &self.tls_enabled)
            .field("state", &self.state)
            .finish()
    }
}

impl TcpTransport {
    /// Connects to an SMTP server and reads its greeting.
    pub async fn connect(endpoint: &Endpoint, config: &ClientConfig) -> SmtpResult<Self> {
        let addresses = resolve_host(&endpoint.host, endpoint.port).await?;
        let stream = Self::connect_any(&addresses, config.connect_timeout).await?;
        stream.set_nodelay(true).ok();

        let mut transport = Self {
            stream: TransportStream::Plain(BufReader::new(stream)),
            command_timeout: config.command_timeout,
            state: TransactionState::Initial,
            capabilities: None,
            tls_enabled: false,
            broken: false,
            host: endpoint.host.clone(),
        };

        // smtps speaks TLS from the first byte, the greeting included
        if endpoint.implicit_tls {
            transport.upgrade_tls(&config.tls, &endpoint.host).await?;
        }

        let greeting = transport.read_response().await?;
        if !greeting.is_success() {
            return Err(greeting.to_error());
        }

        transport.state = TransactionState::Connected;
        Ok(transport)
    }

    /// Tries each resolved address in turn.
    async fn connect_any(addresses: &[SocketAddr], limit: Duration) -> SmtpResult<TcpStream> {
        let mut last_error = None;

        for address in addresses {
            #[cfg(feature = "tracing")]
            tracing::debug!(%address, "Connecting to SMTP server");

            match timeout(limit, TcpStream::connect(address)).await {
                Ok(Ok(stream)) => return Ok(stream),
                Ok(Err(e)) => last_error = Some(Self::map_io_error(e, &address.to_string())),
                Err(_) => {
                    last_error = Some(SmtpError::timeout(
                        SmtpErrorKind::ConnectTimeout,
                        format!("Connect to {} timed out", address),
                    ))
                }
            }
        }

        Err(last_error.unwrap_or_else(|| SmtpError::connection("No address to connect to")))
    }

    /// Maps IO errors to SMTP errors.
    fn map_io_error(error: io::Error, address: &str) -> SmtpError {
        match error.kind() {
            io::ErrorKind::ConnectionRefused => {
                SmtpError::new(SmtpErrorKind::ConnectionRefused, format!("Connection refused to {}", address))
            }
            io::ErrorKind::TimedOut => {
                SmtpError::timeout(SmtpErrorKind::ConnectTimeout, format!("Connect to {} timed out", address))
            }
            io::ErrorKind::ConnectionReset => {
                SmtpError::new(SmtpErrorKind::ConnectionReset, "Connection reset by server")
            }
            _ => SmtpError::connection(format!("Connection error: {}", error)).with_cause(error),
        }
    }

    /// Reads lines until we have a complete response.
    ///
    /// The whole reply, continuation lines included, must arrive within
    /// `timeout_duration`.
    pub(crate) async fn read_response_inner<R: AsyncBufRead + Unpin>(
        reader: &mut R,
        timeout_duration: Duration,
    ) -> SmtpResult<SmtpResponse> {
        timeout(timeout_duration, Self::read_reply(reader))
            .await
            .map_err(|_| SmtpError::timeout(SmtpErrorKind::ReadTimeout, "Read timed out"))?
    }

    async fn read_reply<R: AsyncBufRead + Unpin>(reader: &mut R) -> SmtpResult<SmtpResponse> {
        let mut lines = Vec::new();

        loop {
            if lines.len() == MAX_REPLY_LINES {
                return Err(SmtpError::protocol("Response has too many lines"));
            }

            let mut line = Vec::new();
            let read = (&mut *reader)
                .take(MAX_LINE_LENGTH as u64)
                .read_until(b'\n', &mut line)
                .await
                .map_err(|e| SmtpError::protocol(format!("Read error: {}", e)))?;

            if read == 0 {
                return Err(SmtpError::new(
                    SmtpErrorKind::ConnectionReset,
                    "Server closed connection",
                ));
            }

            if read == MAX_LINE_LENGTH && !line.ends_with(b"\n") {
                return Err(SmtpError::protocol("Response line too long"));
            }

            let line = String::from_utf8(line)
                .map_err(|_| SmtpError::protocol("Response is not valid UTF-8"))?;
            let line = line.trim_end().to_string();

            // Check for continuation (code-hyphen)
            let is_continuation = line.as_bytes().get(3) == Some(&b'-');
            lines.push(line);

            if !is_continuation {
                break;
            }
        }

        SmtpResponse::parse(&lines)
    }

    /// Writes data to the stream.
    async fn write_all<W: AsyncWrite + Unpin>(
        writer: &mut W,
        data: &[u8],
        timeout_duration: Duration,
    ) -> SmtpResult<()> {
        timeout(timeout_duration, writer.write_all(data))
            .await
            .map_err(|_| SmtpError::timeout(SmtpErrorKind::WriteTimeout, "Write timed out"))?
            .map_err(|e| SmtpError::protocol(format!("Write error: {}", e)))?;

        timeout(timeout_duration, writer.flush())
            .await
            .map_err(|_| SmtpError::timeout(SmtpErrorKind::WriteTimeout, "Flush timed out"))?
            .map_err(|e| SmtpError::protocol(format!("Flush error: {}", e)))?;

        Ok(())
    }

    fn detached() -> SmtpError {
        SmtpError::new(SmtpErrorKind::ConnectionReset, "Connection lost during TLS upgrade")
    }

    /// Takes the plain socket out of the transport for a TLS handshake.
    fn take_plain(&mut self) -> SmtpResult<TcpStream> {
        match std::mem::replace(&mut self.stream, TransportStream::Detached) {
            TransportStream::Plain(reader) => Ok(reader.into_inner()),
            other => {
                self.stream = other;
                Err(SmtpError::tls("Already using TLS"))
            }
        }
    }
}

#[async_trait]
impl SmtpTransport for TcpTransport {
    async fn send_command(&mut self, command: &SmtpCommand) -> SmtpResult<SmtpResponse> {
        let cmd_str = format!("{}\r\n", command.to_smtp_string());

        #[cfg(feature = "tracing")]
        tracing::debug!(command = %command, "Sending SMTP command");

        let bytes = cmd_str.as_bytes();
        let written = match &mut self.stream {
            TransportStream::Plain(ref mut stream) => {
                Self::write_all(stream.get_mut(), bytes, self.command_timeout).await
            }
            #[cfg(feature = "rustls-tls")]
            TransportStream::Tls(ref mut stream) => {
                Self::write_all(stream.get_mut(), bytes, self.command_timeout).await
            }
            #[cfg(feature = "native-tls")]
            TransportStream::NativeTls(ref mut stream) => {
                Self::write_all(stream.get_mut(), bytes, self.command_timeout).await
            }
            TransportStream::Detached => Err(Self::detached()),
        };

        if let Err(e) = written {
            self.broken = true;
            return Err(e);
        }

        self.read_response().await
    }

    async fn read_response(&mut self) -> SmtpResult<SmtpResponse> {
        let result = match &mut self.stream {
            TransportStream::Plain(ref mut stream) => {
                Self::read_response_inner(stream, self.command_timeout).await
            }
            #[cfg(feature = "rustls-tls")]
            TransportStream::Tls(ref mut stream) => {
                Self::read_response_inner(stream, self.command_timeout).await
            }
            #[cfg(feature = "native-tls")]
            TransportStream::NativeTls(ref mut stream) => {
                Self::read_response_inner(stream, self.command_timeout).await
            }
            TransportStream::Detached => Err(Self::detached()),
        };

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                self.broken = true;
                return Err(e);
            }
        };

        #[cfg(feature = "tracing")]
        tracing::debug!(code = response.code, message = %response.first_message(), "Received SMTP response");

        Ok(response)
    }

    async fn upgrade_tls(&mut self, config: &TlsConfig, host: &str) -> SmtpResult<()> {
        if self.tls_enabled {
            return Ok(());
        }

        #[cfg(feature = "rustls-tls")]
        {
            let connector = tls::connector(config)?;
            let server_name = tls::server_name(host)?;
            let tcp_stream = self.take_plain()?;

            let tls_stream = timeout(
                config.handshake_timeout,
                connector.connect(server_name, tcp_stream),
            )
            .await
            .map_err(|_| SmtpError::timeout(SmtpErrorKind::ConnectTimeout, "TLS handshake timed out"))?
            .map_err(|e| SmtpError::tls(format!("TLS handshake failed: {}", e)))?;

            self.stream = TransportStream::Tls(BufReader::new(tls_stream));
            self.tls_enabled = true;
            self.state = TransactionState::TlsEstablished;

            #[cfg(feature = "tracing")]
            tracing::debug!(host = %host, "TLS established");

            Ok(())
        }

        #[cfg(all(feature = "native-tls", not(feature = "rustls-tls")))]
        {
            let mut builder = native_tls::TlsConnector::builder();
            builder.danger_accept_invalid_certs(!config.verify_certificate);
            builder.danger_accept_invalid_hostnames(!config.verify_hostname);

            if let Some(path) = &config.ca_cert_path {
                let pem = std::fs::read(path).map_err(|e| {
                    SmtpError::configuration(format!("Cannot read {}: {}", path.display(), e))
                })?;
                let cert = native_tls::Certificate::from_pem(&pem)
                    .map_err(|e| SmtpError::configuration(format!("Invalid CA file: {}", e)))?;
                builder.add_root_certificate(cert);
            }

            let connector = builder
                .build()
                .map_err(|e| SmtpError::tls(format!("Failed to build TLS connector: {}", e)))?;
            let connector = tokio_native_tls::TlsConnector::from(connector);
            let tcp_stream = self.take_plain()?;

            let tls_stream = timeout(config.handshake_timeout, connector.connect(host, tcp_stream))
                .await
                .map_err(|_| SmtpError::timeout(SmtpErrorKind::ConnectTimeout, "TLS handshake timed out"))?
                .map_err(|e| SmtpError::tls(format!("TLS handshake failed: {}", e)))?;

            self.stream = TransportStream::NativeTls(BufReader::new(tls_stream));
            self.tls_enabled = true;
            self.state = TransactionState::TlsEstablished;

            Ok(())
        }

        #[cfg(not(any(feature = "rustls-tls", feature = "native-tls")))]
        {
            let _ = (config, host);
            Err(SmtpError::configuration("No TLS implementation available"))
        }
    }

    fn is_tls(&self) -> bool {
        self.tls_enabled
    }

    async fn close(&mut self) {
        // A stream that already timed out or desynchronized gets no QUIT.
        if self.state != TransactionState::Closed && !self.broken {
            let limit = self.command_timeout.min(QUIT_TIMEOUT);
            let _ = timeout(limit, self.send_command(&SmtpCommand::Quit)).await;
        }
        self.state = TransactionState::Closed;
        self.stream = TransportStream::Detached;
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

/// Resolves a host to socket addresses. IP literals skip DNS.
async fn resolve_host(host: &str, port: u16) -> SmtpResult<Vec<SocketAddr>> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(vec![SocketAddr::new(ip, port)]);
    }

    let resolver = TokioAsyncResolver::tokio_from_system_conf().map_err(|e| {
        SmtpError::new(SmtpErrorKind::DnsResolution, "Cannot load resolver configuration")
            .with_cause(e)
    })?;

    let lookup = resolver.lookup_ip(host).await.map_err(|e| {
        SmtpError::new(
            SmtpErrorKind::DnsResolution,
            format!("Cannot resolve host {}: {}", host, e),
        )
    })?;

    let addresses: Vec<SocketAddr> = lookup.iter().map(|ip| SocketAddr::new(ip, port)).collect();
    if addresses.is_empty() {
        return Err(SmtpError::new(
            SmtpErrorKind::DnsResolution,
            format!("No address found for host {}", host),
        ));
    }

    Ok(addresses)
}
