//! Observability helpers for verification attempts.
//!
//! Log output goes through `tracing` when the feature is enabled; these
//! types only carry the fields worth attaching to each event.

use std::time::{Duration, Instant};

use crate::client::VerifyRequest;

/// Timer for measuring operation duration.
#[derive(Debug)]
pub struct Timer {
    start: Instant,
    name: String,
}

impl Timer {
    /// Creates and starts a new timer.
    pub fn start(name: impl Into<String>) -> Self {
        Self {
            start: Instant::now(),
            name: name.into(),
        }
    }

    /// Returns the elapsed time.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Stops the timer and returns the duration.
    pub fn stop(self) -> Duration {
        let elapsed = self.start.elapsed();

        #[cfg(feature = "tracing")]
        tracing::debug!(
            timer = %self.name,
            duration_ms = elapsed.as_millis(),
            "Timer stopped"
        );

        elapsed
    }
}

/// Fields identifying one verification attempt in the logs.
#[derive(Debug, Clone)]
pub struct AttemptContext {
    /// Unique attempt ID.
    pub attempt_id: String,
    /// Target URL, e.g. `smtps://mail.example.com`.
    pub target: String,
    /// Login identity presented to the server.
    pub identity: String,
}

impl AttemptContext {
    /// Creates a context for a request.
    pub fn new(request: &VerifyRequest) -> Self {
        Self {
            attempt_id: uuid::Uuid::new_v4().to_string(),
            target: request.url(),
            identity: request.identity.clone(),
        }
    }

    /// Returns a span carrying the attempt fields.
    #[cfg(feature = "tracing")]
    pub fn span(&self) -> tracing::Span {
        tracing::info_span!(
            "smtp_verify",
            attempt_id = %self.attempt_id,
            target = %self.target,
            identity = %self.identity,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{Scheme, UseSsl};
    use secrecy::SecretString;

    #[test]
    fn test_timer() {
        let timer = Timer::start("test");
        std::thread::sleep(Duration::from_millis(10));
        let duration = timer.stop();
        assert!(duration >= Duration::from_millis(10));
    }

    #[test]
    fn test_attempt_context() {
        let request = VerifyRequest {
            host: "mail.example.com".to_string(),
            scheme: Scheme::Smtps,
            use_ssl: UseSsl::Control,
            identity: "bob@example.com".to_string(),
            secret: SecretString::new("pw".to_string()),
        };

        let first = AttemptContext::new(&request);
        let second = AttemptContext::new(&request);

        assert_eq!(first.target, "smtps://mail.example.com");
        assert_eq!(first.identity, "bob@example.com");
        assert_ne!(first.attempt_id, second.attempt_id);
    }
}
