//! Handles and C-compatible enums for the FFI boundary.
//!
//! # Design
//! Every handle is an opaque struct: C only ever sees a pointer to it.
//! Requests, clients and perform handles are heap-allocated and owned by the
//! caller until freed or consumed. Responses and errors live on the stack of
//! the completion closure and are only valid while the C callback runs.
//!
//! `CallbackContext` bundles the C callback, its context pointer and the
//! optional deleter. It is moved into the request's completion closure, so
//! the closure's single call and its drop map exactly onto "callback once,
//! deleter once".

use std::os::raw::{c_char, c_void};
use std::ptr;

use liberty_core::{Error, ErrorKind, Outcome, Response};

/// Completion callback. Exactly one of `error` and `response` is non-null.
pub type LibertyCompleteCallback = Option<
    unsafe extern "C" fn(error: *const LibertyError, response: *const LibertyHttpResponse, data: *mut c_void),
>;

/// Releases the context pointer passed alongside a callback.
pub type LibertyDeleter = Option<unsafe extern "C" fn(data: *mut c_void)>;

/// Status returned by mutating entry points.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LibertyCode {
    Ok = 0,
    NullArgument = -1,
    InvalidArgument = -2,
    Failed = -3,
    Panic = -4,
}

/// Failure classes reported by `liberty_error_kind`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LibertyErrorKind {
    Configuration = 1,
    Resolve = 2,
    Connect = 3,
    Tls = 4,
    Timeout = 5,
    Write = 6,
    Read = 7,
    MalformedResponse = 8,
    Cancelled = 9,
}

impl From<ErrorKind> for LibertyErrorKind {
    fn from(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::Configuration => LibertyErrorKind::Configuration,
            ErrorKind::Resolve => LibertyErrorKind::Resolve,
            ErrorKind::Connect => LibertyErrorKind::Connect,
            ErrorKind::Tls => LibertyErrorKind::Tls,
            ErrorKind::Timeout => LibertyErrorKind::Timeout,
            ErrorKind::Write => LibertyErrorKind::Write,
            ErrorKind::Read => LibertyErrorKind::Read,
            ErrorKind::MalformedResponse => LibertyErrorKind::MalformedResponse,
            ErrorKind::Cancelled => LibertyErrorKind::Cancelled,
        }
    }
}

/// Opaque request under construction.
pub struct LibertyHttpRequest {
    pub(crate) inner: liberty_core::Request,
}

/// Opaque client.
pub struct LibertyHttpClient {
    pub(crate) inner: liberty_core::Client,
}

/// Opaque handle to a submitted perform, used to cancel it.
pub struct LibertyPerformHandle {
    pub(crate) inner: liberty_core::PerformHandle,
}

/// Opaque response, valid only during the completion callback.
pub struct LibertyHttpResponse {
    pub(crate) inner: Response,
}

/// Opaque error, valid only during the completion callback.
pub struct LibertyError {
    pub(crate) inner: Error,
}

/// A C callback with its context. Dropping it runs the deleter.
pub(crate) struct CallbackContext {
    callback: unsafe extern "C" fn(*const LibertyError, *const LibertyHttpResponse, *mut c_void),
    data: *mut c_void,
    deleter: LibertyDeleter,
}

// The context pointer is handed back only to the caller's own callback and
// deleter, which the API contract requires to be callable from any thread.
unsafe impl Send for CallbackContext {}

impl CallbackContext {
    pub(crate) fn new(
        callback: unsafe extern "C" fn(*const LibertyError, *const LibertyHttpResponse, *mut c_void),
        data: *mut c_void,
        deleter: LibertyDeleter,
    ) -> Self {
        Self {
            callback,
            data,
            deleter,
        }
    }

    /// Call the C callback with the outcome, then release the context.
    pub(crate) fn invoke(self, outcome: Outcome) {
        match outcome {
            Ok(response) => {
                let response = LibertyHttpResponse { inner: response };
                unsafe { (self.callback)(ptr::null(), &response, self.data) };
            }
            Err(error) => {
                let error = LibertyError { inner: error };
                unsafe { (self.callback)(&error, ptr::null(), self.data) };
            }
        }
    }
}

impl Drop for CallbackContext {
    fn drop(&mut self) {
        if let Some(deleter) = self.deleter.take() {
            unsafe { deleter(self.data) };
        }
    }
}

/// View `size` bytes at `data` as a slice. A zero size is an empty slice
/// even when `data` is null.
///
/// # Safety
/// A non-null `data` must point to `size` readable bytes that stay valid
/// for `'a`.
pub(crate) unsafe fn bytes<'a>(data: *const c_char, size: usize) -> Option<&'a [u8]> {
    if size == 0 {
        return Some(&[]);
    }
    if data.is_null() {
        return None;
    }
    Some(unsafe { std::slice::from_raw_parts(data.cast::<u8>(), size) })
}

/// Like `bytes`, additionally requiring UTF-8.
///
/// # Safety
/// Same contract as `bytes`.
pub(crate) unsafe fn text<'a>(data: *const c_char, size: usize) -> Option<&'a str> {
    unsafe { bytes(data, size) }.and_then(|b| std::str::from_utf8(b).ok())
}
