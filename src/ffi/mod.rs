//! Foreign Function Interface (FFI) for mobile and desktop shells.
//!
//! Lets a host application (Android via JNI, iOS via Swift, anything with a
//! C FFI) own a relay server: create it with a port and an event callback,
//! start and stop it, and free it.
//!
//! ## Memory Safety
//!
//! - Handles are opaque pointers to Rust-managed resources
//! - Callers must free handles with [`lansocks_server_free`]
//! - All strings are null-terminated C strings
//! - Errors are returned as negative integers or NULL pointers
//!
//! ## Events
//!
//! Every [`ServerEvent`] is serialized to JSON and passed to the callback,
//! for example `{"type":"state_changed","running":true}`. The string is only
//! valid for the duration of the call. The callback runs on runtime worker
//! threads and must not block or call back into this library.

use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_int, c_void};
use std::ptr;
use std::sync::Arc;

use crate::error::{Error, ErrorCategory};
use crate::server::{CallbackSink, Server, ServerConfig, ServerEvent};

/// Result code indicating success.
pub const LANSOCKS_OK: c_int = 0;
/// Result code indicating generic error.
pub const LANSOCKS_ERROR: c_int = -1;
/// Result code indicating invalid argument.
pub const LANSOCKS_ERROR_INVALID_ARG: c_int = -2;
/// Result code indicating the configured port is out of range.
pub const LANSOCKS_ERROR_INVALID_PORT: c_int = -3;
/// Result code indicating the listener could not bind.
pub const LANSOCKS_ERROR_BIND: c_int = -4;
/// Result code indicating the async runtime could not be created.
pub const LANSOCKS_ERROR_RUNTIME: c_int = -5;

/// Event callback: `(event_json, user_data)`.
pub type LansocksEventCallback = extern "C" fn(event_json: *const c_char, user_data: *mut c_void);

/// Host-owned context pointer handed back on every callback.
#[derive(Clone, Copy)]
struct UserData(*mut c_void);

// SAFETY: the pointer is never dereferenced here; the host promises it may
// be used from any thread when it registers the callback.
unsafe impl Send for UserData {}
unsafe impl Sync for UserData {}

/// Opaque handle to a relay server.
pub struct LansocksServer {
    // Dropped before the runtime it was started on
    server: Server,
    runtime: tokio::runtime::Runtime,
}

/// Initialize the library.
///
/// Installs a `tracing` subscriber honoring `RUST_LOG`. Thread-safe and can
/// be called multiple times (subsequent calls are no-ops).
///
/// # Returns
///
/// LANSOCKS_OK on success.
#[no_mangle]
pub extern "C" fn lansocks_init() -> c_int {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        // Host may already have installed one
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .with_target(false)
            .try_init();
    });

    LANSOCKS_OK
}

/// Create a server listening on all interfaces at `port`.
///
/// Nothing is bound until [`lansocks_server_start`]. The port is validated
/// on start, so out-of-range values are accepted here.
///
/// # Arguments
///
/// * `port` - Listen port
/// * `callback` - Event callback, may be NULL
/// * `user_data` - Passed back unchanged on every callback
///
/// # Returns
///
/// Pointer to server handle, or NULL if the runtime could not be created.
#[no_mangle]
pub extern "C" fn lansocks_server_new(
    port: u32,
    callback: Option<LansocksEventCallback>,
    user_data: *mut c_void,
) -> *mut LansocksServer {
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("lansocks")
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!("failed to create runtime: {}", e);
            return ptr::null_mut();
        }
    };

    let user_data = UserData(user_data);
    let sink = CallbackSink(move |event: ServerEvent| {
        if let Some(callback) = callback {
            deliver(callback, user_data, &event);
        }
    });

    let server = Server::new(ServerConfig::new(port), Arc::new(sink));
    Box::into_raw(Box::new(LansocksServer { server, runtime }))
}

fn deliver(callback: LansocksEventCallback, user_data: UserData, event: &ServerEvent) {
    let json = match serde_json::to_string(event) {
        Ok(json) => json,
        Err(e) => {
            tracing::warn!("failed to serialize event: {}", e);
            return;
        }
    };
    match CString::new(json) {
        Ok(json) => callback(json.as_ptr(), user_data.0),
        Err(e) => tracing::warn!("event contains NUL byte: {}", e),
    }
}

fn error_code(err: &Error) -> c_int {
    match err {
        Error::InvalidPort(_) => LANSOCKS_ERROR_INVALID_PORT,
        Error::Bind { .. } => LANSOCKS_ERROR_BIND,
        e if e.category() == ErrorCategory::Configuration => LANSOCKS_ERROR_INVALID_ARG,
        _ => LANSOCKS_ERROR,
    }
}

/// Start accepting connections.
///
/// Starting a running server succeeds without effect.
///
/// # Safety
///
/// The handle must come from [`lansocks_server_new`] and not be freed.
///
/// # Returns
///
/// LANSOCKS_OK on success, or a negative error code. The failure is also
/// reported through the callback as an `error` event.
#[no_mangle]
pub unsafe extern "C" fn lansocks_server_start(handle: *mut LansocksServer) -> c_int {
    let Some(handle) = handle.as_ref() else {
        return LANSOCKS_ERROR_INVALID_ARG;
    };

    match handle.runtime.block_on(handle.server.start()) {
        Ok(_) => LANSOCKS_OK,
        Err(e) => error_code(&e),
    }
}

/// Stop the server and close every connection.
///
/// Returns after each connection has reported its final `closed` snapshot.
/// Stopping a stopped server succeeds without effect.
///
/// # Safety
///
/// The handle must come from [`lansocks_server_new`] and not be freed.
#[no_mangle]
pub unsafe extern "C" fn lansocks_server_stop(handle: *mut LansocksServer) -> c_int {
    let Some(handle) = handle.as_ref() else {
        return LANSOCKS_ERROR_INVALID_ARG;
    };

    handle.runtime.block_on(handle.server.stop());
    LANSOCKS_OK
}

/// Whether the server is accepting connections.
///
/// # Safety
///
/// The handle must come from [`lansocks_server_new`] and not be freed.
///
/// # Returns
///
/// 1 if running, 0 if stopped, LANSOCKS_ERROR_INVALID_ARG for a NULL handle.
#[no_mangle]
pub unsafe extern "C" fn lansocks_server_is_running(handle: *const LansocksServer) -> c_int {
    let Some(handle) = handle.as_ref() else {
        return LANSOCKS_ERROR_INVALID_ARG;
    };

    c_int::from(handle.runtime.block_on(handle.server.is_running()))
}

/// Stop (if needed) and free a server handle.
///
/// # Safety
///
/// The handle must have been returned by [`lansocks_server_new`] and not
/// previously freed. Must not be called from inside the event callback.
#[no_mangle]
pub unsafe extern "C" fn lansocks_server_free(handle: *mut LansocksServer) {
    if handle.is_null() {
        return;
    }

    let handle = Box::from_raw(handle);
    handle.runtime.block_on(handle.server.stop());
    drop(handle);
}

/// Get the library version string.
///
/// # Returns
///
/// Null-terminated version string. Caller must not free this pointer.
#[no_mangle]
pub extern "C" fn lansocks_version() -> *const c_char {
    static VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), "\0");
    VERSION.as_ptr() as *const c_char
}

/// Get error description for an error code.
///
/// # Returns
///
/// Null-terminated error description. Caller must not free this pointer.
#[no_mangle]
pub extern "C" fn lansocks_error_string(error_code: c_int) -> *const c_char {
    let msg: &'static CStr = match error_code {
        LANSOCKS_OK => c"Success",
        LANSOCKS_ERROR => c"Unknown error",
        LANSOCKS_ERROR_INVALID_ARG => c"Invalid argument",
        LANSOCKS_ERROR_INVALID_PORT => c"Port out of range",
        LANSOCKS_ERROR_BIND => c"Could not bind listener",
        LANSOCKS_ERROR_RUNTIME => c"Could not create runtime",
        _ => c"Unknown error code",
    };
    msg.as_ptr()
}
