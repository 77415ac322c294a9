//! PAM service module glue.
//!
//! Maps verification outcomes onto PAM return codes and drives one attempt
//! from a module argument list. The `pam_sm_*` entry points themselves live
//! in the `ffi` submodule, compiled only with the `pam` feature so the rest
//! of the crate builds and tests without libpam.

use std::ffi::CStr;
use std::fmt;
use std::os::raw::c_int;

use crate::auth::{Credentials, StaticCredentials};
use crate::client::SmtpAuthClient;
use crate::verify::{VerificationOutcome, Verifier};

#[cfg(feature = "pam")]
pub mod ffi;

/// A PAM return code.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PamCode(pub c_int);

impl PamCode {
    /// `PAM_SUCCESS`.
    pub const SUCCESS: PamCode = PamCode(0);
    /// `PAM_SERVICE_ERR`.
    pub const SERVICE_ERR: PamCode = PamCode(3);
    /// `PAM_AUTH_ERR`.
    pub const AUTH_ERR: PamCode = PamCode(7);

    /// Returns the raw value handed back to libpam.
    pub fn as_raw(self) -> c_int {
        self.0
    }
}

impl fmt::Display for PamCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            PamCode::SUCCESS => write!(f, "PAM_SUCCESS"),
            PamCode::SERVICE_ERR => write!(f, "PAM_SERVICE_ERR"),
            PamCode::AUTH_ERR => write!(f, "PAM_AUTH_ERR"),
            PamCode(other) => write!(f, "PAM code {}", other),
        }
    }
}

impl VerificationOutcome {
    /// Maps the outcome onto the code PAM expects.
    ///
    /// Only a refusal by the server gives `PAM_AUTH_ERR`. An empty username
    /// or password, an unreachable server and any other failure before the
    /// server judged the credentials give `PAM_SERVICE_ERR`. Stacks whose
    /// control flags treat the two codes differently (`[default=die]`,
    /// `[auth_err=...]`) therefore see a network outage as a module fault
    /// rather than as a wrong password.
    pub fn pam_code(&self) -> PamCode {
        match self {
            VerificationOutcome::Success => PamCode::SUCCESS,
            VerificationOutcome::ConfigurationError(_) => PamCode::SERVICE_ERR,
            VerificationOutcome::AuthRejected(_) => PamCode::AUTH_ERR,
        }
    }
}

/// Decodes module arguments. Returns `None` if any is not UTF-8.
pub fn decode_args<'a, I>(args: I) -> Option<Vec<String>>
where
    I: IntoIterator<Item = &'a CStr>,
{
    args.into_iter()
        .map(|arg| arg.to_str().ok().map(str::to_string))
        .collect()
}

/// Runs one attempt for a module argument list.
///
/// Argument errors are logged and reported as `PAM_SERVICE_ERR` before any
/// credential is requested. A failing `fetch_credentials` hands its code
/// back unchanged.
pub fn run_module<S, F, L>(args: &[S], fetch_credentials: F, mut log: L) -> PamCode
where
    S: AsRef<str>,
    F: FnOnce() -> Result<Credentials, PamCode>,
    L: FnMut(&str),
{
    match Verifier::from_args(args) {
        Ok(verifier) => run_with(&verifier, fetch_credentials, log),
        Err(e) => {
            log(&e.to_string());
            PamCode::SERVICE_ERR
        }
    }
}

/// Runs one attempt with an already configured verifier.
pub fn run_with<C, F, L>(verifier: &Verifier<C>, fetch_credentials: F, mut log: L) -> PamCode
where
    C: SmtpAuthClient,
    F: FnOnce() -> Result<Credentials, PamCode>,
    L: FnMut(&str),
{
    let credentials = match fetch_credentials() {
        Ok(credentials) => StaticCredentials::from(credentials),
        Err(code) => return code,
    };

    let outcome = verifier.run(&credentials);
    if let Some(diagnostic) = outcome.diagnostic() {
        log(diagnostic);
    }

    outcome.pam_code()
}
