//! `pam_sm_*` entry points.

use libc::LOG_ERR;
use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_int, c_void};
use std::ptr;

use super::{decode_args, run_module, PamCode};
use crate::auth::Credentials;

/// Opaque `pam_handle_t`.
#[repr(C)]
pub struct PamHandle {
    _private: [u8; 0],
}

const PAM_USER: c_int = 2;
const PAM_AUTHTOK: c_int = 6;

#[link(name = "pam")]
extern "C" {
    fn pam_get_item(pamh: *const PamHandle, item_type: c_int, item: *mut *const c_void) -> c_int;

    fn pam_get_authtok(
        pamh: *mut PamHandle,
        item: c_int,
        authtok: *mut *const c_char,
        prompt: *const c_char,
    ) -> c_int;

    fn pam_syslog(pamh: *const PamHandle, priority: c_int, fmt: *const c_char, ...);
}

fn syslog(pamh: *mut PamHandle, message: &str) {
    let message = CString::new(message.replace('\0', " ")).unwrap_or_default();
    // SAFETY: pamh comes from libpam; both strings are NUL terminated and
    // outlive the call.
    unsafe {
        pam_syslog(pamh, LOG_ERR, b"%s\0".as_ptr().cast(), message.as_ptr());
    }
}

/// Copies a NUL-terminated string owned by libpam. Null reads as empty.
///
/// # Safety
///
/// `value` must be null or point to a valid C string.
unsafe fn owned_string(value: *const c_char, what: &str) -> Result<String, String> {
    if value.is_null() {
        return Ok(String::new());
    }
    CStr::from_ptr(value)
        .to_str()
        .map(str::to_string)
        .map_err(|_| format!("{} is not valid UTF-8.", what))
}

/// Reads the username and password from libpam.
///
/// # Safety
///
/// `pamh` must be the handle libpam passed to the entry point.
unsafe fn pam_credentials(pamh: *mut PamHandle) -> Result<Credentials, PamCode> {
    let mut user: *const c_void = ptr::null();
    let rc = pam_get_item(pamh, PAM_USER, &mut user);
    if rc != PamCode::SUCCESS.as_raw() {
        return Err(PamCode(rc));
    }

    let mut password: *const c_char = ptr::null();
    let rc = pam_get_authtok(pamh, PAM_AUTHTOK, &mut password, ptr::null());
    if rc != PamCode::SUCCESS.as_raw() {
        return Err(PamCode(rc));
    }

    let username = owned_string(user.cast(), "Username");
    let password = owned_string(password, "Password");
    match (username, password) {
        (Ok(username), Ok(password)) => Ok(Credentials::new(username, password)),
        (Err(e), _) | (_, Err(e)) => {
            syslog(pamh, &e);
            Err(PamCode::SERVICE_ERR)
        }
    }
}

/// Decodes `argv`.
///
/// # Safety
///
/// `argv` must hold `argc` valid C strings.
unsafe fn module_args(argc: c_int, argv: *const *const c_char) -> Option<Vec<String>> {
    let count = usize::try_from(argc).ok()?;
    if count == 0 || argv.is_null() {
        return Some(Vec::new());
    }

    let raw = std::slice::from_raw_parts(argv, count);
    if raw.iter().any(|arg| arg.is_null()) {
        return None;
    }
    decode_args(raw.iter().map(|arg| CStr::from_ptr(*arg)))
}

/// Verifies the PAM user's password against the configured SMTP server.
///
/// # Safety
///
/// Called by libpam with a valid handle and argument vector.
#[no_mangle]
pub unsafe extern "C" fn pam_sm_authenticate(
    pamh: *mut PamHandle,
    _flags: c_int,
    argc: c_int,
    argv: *const *const c_char,
) -> c_int {
    let Some(args) = module_args(argc, argv) else {
        syslog(pamh, "Module arguments are not valid UTF-8.");
        return PamCode::SERVICE_ERR.as_raw();
    };

    run_module(
        &args,
        || unsafe { pam_credentials(pamh) },
        |message| syslog(pamh, message),
    )
    .as_raw()
}

/// No credentials to establish.
///
/// # Safety
///
/// Called by libpam.
#[no_mangle]
pub unsafe extern "C" fn pam_sm_setcred(
    _pamh: *mut PamHandle,
    _flags: c_int,
    _argc: c_int,
    _argv: *const *const c_char,
) -> c_int {
    PamCode::SUCCESS.as_raw()
}

/// Same check as [`pam_sm_authenticate`].
///
/// # Safety
///
/// Called by libpam with a valid handle and argument vector.
#[no_mangle]
pub unsafe extern "C" fn pam_sm_acct_mgmt(
    pamh: *mut PamHandle,
    flags: c_int,
    argc: c_int,
    argv: *const *const c_char,
) -> c_int {
    pam_sm_authenticate(pamh, flags, argc, argv)
}

/// Same check as [`pam_sm_authenticate`].
///
/// # Safety
///
/// Called by libpam with a valid handle and argument vector.
#[no_mangle]
pub unsafe extern "C" fn pam_sm_open_session(
    pamh: *mut PamHandle,
    flags: c_int,
    argc: c_int,
    argv: *const *const c_char,
) -> c_int {
    pam_sm_authenticate(pamh, flags, argc, argv)
}

/// Same check as [`pam_sm_authenticate`].
///
/// # Safety
///
/// Called by libpam with a valid handle and argument vector.
#[no_mangle]
pub unsafe extern "C" fn pam_sm_close_session(
    pamh: *mut PamHandle,
    flags: c_int,
    argc: c_int,
    argv: *const *const c_char,
) -> c_int {
    pam_sm_authenticate(pamh, flags, argc, argv)
}

/// Same check as [`pam_sm_authenticate`].
///
/// # Safety
///
/// Called by libpam with a valid handle and argument vector.
#[no_mangle]
pub unsafe extern "C" fn pam_sm_chauthtok(
    pamh: *mut PamHandle,
    flags: c_int,
    argc: c_int,
    argv: *const *const c_char,
) -> c_int {
    pam_sm_authenticate(pamh, flags, argc, argv)
}
