//! C ABI for the liberty HTTP engine.
//!
//! # Overview
//! C callers build a request, attach a completion callback with an opaque
//! context, and hand the request to a client. The client performs it on its
//! own threads and calls the callback exactly once with either an error or a
//! response. Response and error handles are only valid during that callback.
//!
//! # Design
//! - Every `extern "C"` function wraps its body in `catch_unwind` so panics
//!   never cross the FFI boundary.
//! - Null handles are tolerated: free functions ignore them, mutators return
//!   `LibertyCode::NullArgument`, accessors return zero or null.
//! - A callback's deleter runs exactly once: after the callback, or when the
//!   request is freed unsubmitted, or when the callback is replaced.
//! - `liberty_http_client_free` blocks until every pending callback has run.
//!   It must not be called from inside a completion callback.

pub mod types;

use std::os::raw::{c_char, c_int, c_void};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::ptr;
use std::time::Duration;

use liberty_core::{Client, ClientConfig};
use tracing::error;

use types::*;

/// `catch_unwind` for closures over raw handles.
fn guard<T>(f: impl FnOnce() -> T) -> std::thread::Result<T> {
    catch_unwind(AssertUnwindSafe(f))
}

/// Run `f` unless `request` is null, mapping panics to `LibertyCode::Panic`.
fn with_request(request: *mut LibertyHttpRequest, f: impl FnOnce(&mut LibertyHttpRequest) -> LibertyCode) -> LibertyCode {
    if request.is_null() {
        return LibertyCode::NullArgument;
    }
    guard(|| f(unsafe { &mut *request })).unwrap_or(LibertyCode::Panic)
}

// ---------------------------------------------------------------------------
// Request lifecycle
// ---------------------------------------------------------------------------

/// Create an empty GET request. Free it with `liberty_http_request_free`
/// unless it is handed to `liberty_http_client_perform`.
#[unsafe(no_mangle)]
pub extern "C" fn liberty_http_request_make() -> *mut LibertyHttpRequest {
    guard(|| {
        Box::into_raw(Box::new(LibertyHttpRequest {
            inner: liberty_core::Request::new(),
        }))
    })
    .unwrap_or(ptr::null_mut())
}

/// Free a request that was never performed. Runs the deleter of its
/// callback, if any. Safe to call with null.
#[unsafe(no_mangle)]
pub extern "C" fn liberty_http_request_free(request: *mut LibertyHttpRequest) {
    if !request.is_null() {
        let _ = guard(|| {
            drop(unsafe { Box::from_raw(request) });
        });
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn liberty_http_request_get(request: *mut LibertyHttpRequest) -> LibertyCode {
    with_request(request, |request| {
        request.inner.set_method_get();
        LibertyCode::Ok
    })
}

/// Make the request a POST. The body set with `liberty_http_request_data`
/// is sent only for methods that carry one.
#[unsafe(no_mangle)]
pub extern "C" fn liberty_http_request_post(request: *mut LibertyHttpRequest) -> LibertyCode {
    with_request(request, |request| {
        request.inner.set_method_post();
        LibertyCode::Ok
    })
}

/// Set the URL from `size` bytes of UTF-8. The URL itself is validated when
/// the request is performed; an invalid one is reported to the callback.
#[unsafe(no_mangle)]
pub extern "C" fn liberty_http_request_url(
    request: *mut LibertyHttpRequest,
    data: *const c_char,
    size: usize,
) -> LibertyCode {
    with_request(request, |request| match unsafe { text(data, size) } {
        Some(url) => {
            request.inner.set_url(url);
            LibertyCode::Ok
        }
        None => LibertyCode::InvalidArgument,
    })
}

/// Copy `size` bytes as the request body.
#[unsafe(no_mangle)]
pub extern "C" fn liberty_http_request_data(
    request: *mut LibertyHttpRequest,
    data: *const c_char,
    size: usize,
) -> LibertyCode {
    with_request(request, |request| match unsafe { bytes(data, size) } {
        Some(body) => {
            request.inner.set_body(body.to_vec());
            LibertyCode::Ok
        }
        None => LibertyCode::InvalidArgument,
    })
}

/// Append a header. Name and value must be UTF-8.
#[unsafe(no_mangle)]
pub extern "C" fn liberty_http_request_header(
    request: *mut LibertyHttpRequest,
    name: *const c_char,
    name_size: usize,
    value: *const c_char,
    value_size: usize,
) -> LibertyCode {
    with_request(request, |request| {
        match (unsafe { text(name, name_size) }, unsafe { text(value, value_size) }) {
            (Some(name), Some(value)) if !name.is_empty() => {
                request.inner.append_header(name, value);
                LibertyCode::Ok
            }
            _ => LibertyCode::InvalidArgument,
        }
    })
}

/// Deadline for the whole perform in milliseconds; 0 restores the client's
/// default.
#[unsafe(no_mangle)]
pub extern "C" fn liberty_http_request_timeout_ms(request: *mut LibertyHttpRequest, ms: u64) -> LibertyCode {
    with_request(request, |request| {
        if ms == 0 {
            request.inner.clear_timeout();
        } else {
            request.inner.set_timeout(Duration::from_millis(ms));
        }
        LibertyCode::Ok
    })
}

/// Register the completion callback. `data` is passed back to `callback`
/// and then to `deleter` (if non-null), each exactly once. Replacing a
/// callback runs the previous deleter. A null `callback` clears the
/// registration and releases `data` through `deleter` immediately.
#[unsafe(no_mangle)]
pub extern "C" fn liberty_http_request_complete_callback(
    request: *mut LibertyHttpRequest,
    callback: LibertyCompleteCallback,
    data: *mut c_void,
    deleter: LibertyDeleter,
) -> LibertyCode {
    if request.is_null() {
        if let Some(deleter) = deleter {
            unsafe { deleter(data) };
        }
        return LibertyCode::NullArgument;
    }
    with_request(request, |request| {
        match callback {
            Some(callback) => {
                let context = CallbackContext::new(callback, data, deleter);
                request.inner.set_completion(move |outcome| context.invoke(outcome));
            }
            None => {
                request.inner.clear_completion();
                if let Some(deleter) = deleter {
                    unsafe { deleter(data) };
                }
            }
        }
        LibertyCode::Ok
    })
}

// ---------------------------------------------------------------------------
// Client lifecycle
// ---------------------------------------------------------------------------

/// Create a client with the default configuration. Returns null on failure.
#[unsafe(no_mangle)]
pub extern "C" fn liberty_http_client_make() -> *mut LibertyHttpClient {
    guard(|| match Client::new() {
        Ok(client) => Box::into_raw(Box::new(LibertyHttpClient { inner: client })),
        Err(err) => {
            error!(%err, "creating client failed");
            ptr::null_mut()
        }
    })
    .unwrap_or(ptr::null_mut())
}

/// Create a client from `size` bytes of TOML configuration. Returns null if
/// the document is not valid UTF-8, fails to parse or fails validation.
#[unsafe(no_mangle)]
pub extern "C" fn liberty_http_client_make_with_config(config: *const c_char, size: usize) -> *mut LibertyHttpClient {
    guard(|| {
        let Some(toml) = (unsafe { text(config, size) }) else {
            return ptr::null_mut();
        };
        let client = ClientConfig::from_toml_str(toml)
            .map_err(liberty_core::BuildError::from)
            .and_then(Client::with_config);
        match client {
            Ok(client) => Box::into_raw(Box::new(LibertyHttpClient { inner: client })),
            Err(err) => {
                error!(%err, "creating client failed");
                ptr::null_mut()
            }
        }
    })
    .unwrap_or(ptr::null_mut())
}

/// Free a client. Pending performs are cancelled (or drained, per config)
/// and every outstanding callback runs before this returns. Safe to call
/// with null.
#[unsafe(no_mangle)]
pub extern "C" fn liberty_http_client_free(client: *mut LibertyHttpClient) {
    if !client.is_null() {
        let _ = guard(|| {
            drop(unsafe { Box::from_raw(client) });
        });
    }
}

fn submit(client: *mut LibertyHttpClient, request: *mut LibertyHttpRequest) -> Option<liberty_core::PerformHandle> {
    if request.is_null() {
        return None;
    }
    let request = unsafe { Box::from_raw(request) };
    if client.is_null() {
        // Consumed either way; dropping the request runs its deleter.
        return None;
    }
    let client = unsafe { &*client };
    Some(client.inner.perform(request.inner))
}

/// Perform `request` asynchronously. Takes ownership of the request: do not
/// use or free it afterwards. If `client` is null the request is freed.
#[unsafe(no_mangle)]
pub extern "C" fn liberty_http_client_perform(
    client: *mut LibertyHttpClient,
    request: *mut LibertyHttpRequest,
) -> LibertyCode {
    guard(|| match submit(client, request) {
        Some(_) => LibertyCode::Ok,
        None => LibertyCode::NullArgument,
    })
    .unwrap_or(LibertyCode::Panic)
}

/// Like `liberty_http_client_perform`, returning a handle that can cancel
/// the perform. Free the handle with `liberty_perform_free`; freeing it does
/// not cancel.
#[unsafe(no_mangle)]
pub extern "C" fn liberty_http_client_perform_cancellable(
    client: *mut LibertyHttpClient,
    request: *mut LibertyHttpRequest,
) -> *mut LibertyPerformHandle {
    guard(|| match submit(client, request) {
        Some(handle) => Box::into_raw(Box::new(LibertyPerformHandle { inner: handle })),
        None => ptr::null_mut(),
    })
    .unwrap_or(ptr::null_mut())
}

/// Ask a perform to stop; its callback receives a cancelled error unless it
/// has already completed. Safe to call repeatedly and from any thread.
#[unsafe(no_mangle)]
pub extern "C" fn liberty_perform_cancel(handle: *const LibertyPerformHandle) -> LibertyCode {
    if handle.is_null() {
        return LibertyCode::NullArgument;
    }
    guard(|| {
        unsafe { &*handle }.inner.cancel();
        LibertyCode::Ok
    })
    .unwrap_or(LibertyCode::Panic)
}

/// Whether the perform's callback has returned.
#[unsafe(no_mangle)]
pub extern "C" fn liberty_perform_is_finished(handle: *const LibertyPerformHandle) -> bool {
    if handle.is_null() {
        return false;
    }
    guard(|| unsafe { &*handle }.inner.is_finished()).unwrap_or(false)
}

/// Free a perform handle. Safe to call with null.
#[unsafe(no_mangle)]
pub extern "C" fn liberty_perform_free(handle: *mut LibertyPerformHandle) {
    if !handle.is_null() {
        let _ = guard(|| {
            drop(unsafe { Box::from_raw(handle) });
        });
    }
}

// ---------------------------------------------------------------------------
// Response accessors (valid during the callback only)
// ---------------------------------------------------------------------------

#[unsafe(no_mangle)]
pub extern "C" fn liberty_http_response_code(response: *const LibertyHttpResponse) -> c_int {
    if response.is_null() {
        return 0;
    }
    guard(|| c_int::from(unsafe { &*response }.inner.status_code())).unwrap_or(0)
}

/// Body bytes; not NUL-terminated, see `liberty_http_response_body_size`.
#[unsafe(no_mangle)]
pub extern "C" fn liberty_http_response_body(response: *const LibertyHttpResponse) -> *const c_char {
    if response.is_null() {
        return ptr::null();
    }
    guard(|| unsafe { &*response }.inner.body().as_ptr().cast::<c_char>()).unwrap_or(ptr::null())
}

#[unsafe(no_mangle)]
pub extern "C" fn liberty_http_response_body_size(response: *const LibertyHttpResponse) -> usize {
    if response.is_null() {
        return 0;
    }
    guard(|| unsafe { &*response }.inner.body_size()).unwrap_or(0)
}

/// First value of header `name` (case-insensitive), with its length written
/// to `out_size`. Returns null if the header is absent.
#[unsafe(no_mangle)]
pub extern "C" fn liberty_http_response_header(
    response: *const LibertyHttpResponse,
    name: *const c_char,
    name_size: usize,
    out_size: *mut usize,
) -> *const c_char {
    if response.is_null() {
        return ptr::null();
    }
    guard(|| {
        let Some(name) = (unsafe { text(name, name_size) }) else {
            return ptr::null();
        };
        match unsafe { &*response }.inner.header(name) {
            Some(value) => {
                if !out_size.is_null() {
                    unsafe { *out_size = value.len() };
                }
                value.as_ptr().cast::<c_char>()
            }
            None => ptr::null(),
        }
    })
    .unwrap_or(ptr::null())
}

// ---------------------------------------------------------------------------
// Error accessors (valid during the callback only)
// ---------------------------------------------------------------------------

/// Failure class. A null error reports `Configuration`.
#[unsafe(no_mangle)]
pub extern "C" fn liberty_error_kind(error: *const LibertyError) -> LibertyErrorKind {
    if error.is_null() {
        return LibertyErrorKind::Configuration;
    }
    guard(|| LibertyErrorKind::from(unsafe { &*error }.inner.kind()))
        .unwrap_or(LibertyErrorKind::Configuration)
}

/// Diagnostic bytes; not NUL-terminated, see `liberty_error_extra_size`.
#[unsafe(no_mangle)]
pub extern "C" fn liberty_error_extra(error: *const LibertyError) -> *const c_char {
    if error.is_null() {
        return ptr::null();
    }
    guard(|| unsafe { &*error }.inner.extra().as_ptr().cast::<c_char>()).unwrap_or(ptr::null())
}

#[unsafe(no_mangle)]
pub extern "C" fn liberty_error_extra_size(error: *const LibertyError) -> usize {
    if error.is_null() {
        return 0;
    }
    guard(|| unsafe { &*error }.inner.extra_size()).unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

/// Install a stderr log formatter filtered by the `LIBERTY_LOG` environment
/// variable (for example `LIBERTY_LOG=liberty_core=debug`). Defaults to
/// `warn`. Fails if a global subscriber is already installed.
#[unsafe(no_mangle)]
pub extern "C" fn liberty_logging_init() -> LibertyCode {
    guard(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_env("LIBERTY_LOG")
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        match tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init()
        {
            Ok(()) => LibertyCode::Ok,
            Err(_) => LibertyCode::Failed,
        }
    })
    .unwrap_or(LibertyCode::Panic)
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::sync::mpsc;
    use std::sync::Mutex;

    const WAIT: Duration = Duration::from_secs(5);

    fn start_mock_server() -> SocketAddr {
        let std_listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = std_listener.local_addr().unwrap();
        std_listener.set_nonblocking(true).unwrap();

        std::thread::spawn(move || {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            rt.block_on(async {
                let listener = tokio::net::TcpListener::from_std(std_listener).unwrap();
                mock_server::run(listener).await
            })
            .unwrap();
        });
        addr
    }

    /// What the C callback observed, copied out while the handles were valid.
    #[derive(Debug)]
    enum Seen {
        Response { code: c_int, body: Vec<u8>, content_type: Option<Vec<u8>> },
        Error { kind: LibertyErrorKind, extra: Vec<u8> },
    }

    /// Context handed through `void *data`: a channel plus a deletion flag.
    struct Probe {
        tx: Mutex<mpsc::Sender<Seen>>,
        deleted: mpsc::Sender<()>,
    }

    unsafe extern "C" fn record(error: *const LibertyError, response: *const LibertyHttpResponse, data: *mut c_void) {
        let probe = unsafe { &*(data as *const Probe) };
        let seen = if error.is_null() {
            let body = unsafe {
                std::slice::from_raw_parts(
                    liberty_http_response_body(response).cast::<u8>(),
                    liberty_http_response_body_size(response),
                )
            }
            .to_vec();
            let name = b"content-type";
            let mut size = 0usize;
            let value = liberty_http_response_header(response, name.as_ptr().cast(), name.len(), &mut size);
            let content_type = (!value.is_null())
                .then(|| unsafe { std::slice::from_raw_parts(value.cast::<u8>(), size) }.to_vec());
            Seen::Response {
                code: liberty_http_response_code(response),
                body,
                content_type,
            }
        } else {
            let extra = unsafe {
                std::slice::from_raw_parts(liberty_error_extra(error).cast::<u8>(), liberty_error_extra_size(error))
            }
            .to_vec();
            Seen::Error {
                kind: liberty_error_kind(error),
                extra,
            }
        };
        let _ = probe.tx.lock().unwrap().send(seen);
    }

    unsafe extern "C" fn release(data: *mut c_void) {
        let probe = unsafe { Box::from_raw(data as *mut Probe) };
        let _ = probe.deleted.send(());
    }

    fn probe() -> (*mut c_void, mpsc::Receiver<Seen>, mpsc::Receiver<()>) {
        let (tx, seen) = mpsc::channel();
        let (deleted_tx, deleted) = mpsc::channel();
        let probe = Box::new(Probe {
            tx: Mutex::new(tx),
            deleted: deleted_tx,
        });
        (Box::into_raw(probe).cast(), seen, deleted)
    }

    fn request(url: &str) -> *mut LibertyHttpRequest {
        let request = liberty_http_request_make();
        assert_eq!(liberty_http_request_url(request, url.as_ptr().cast(), url.len()), LibertyCode::Ok);
        request
    }

    fn attach(request: *mut LibertyHttpRequest) -> (mpsc::Receiver<Seen>, mpsc::Receiver<()>) {
        let (data, seen, deleted) = probe();
        assert_eq!(
            liberty_http_request_complete_callback(request, Some(record), data, Some(release)),
            LibertyCode::Ok
        );
        (seen, deleted)
    }

    #[test]
    fn request_make_and_free() {
        let request = liberty_http_request_make();
        assert!(!request.is_null());
        liberty_http_request_free(request);
    }

    #[test]
    fn null_handles_are_tolerated() {
        liberty_http_request_free(ptr::null_mut());
        liberty_http_client_free(ptr::null_mut());
        liberty_perform_free(ptr::null_mut());
        assert_eq!(liberty_http_request_post(ptr::null_mut()), LibertyCode::NullArgument);
        assert_eq!(liberty_perform_cancel(ptr::null()), LibertyCode::NullArgument);
        assert_eq!(liberty_http_response_code(ptr::null()), 0);
        assert_eq!(liberty_error_extra_size(ptr::null()), 0);
        assert!(liberty_http_response_body(ptr::null()).is_null());
    }

    #[test]
    fn invalid_utf8_url_is_rejected() {
        let request = liberty_http_request_make();
        let raw = [0xffu8, 0xfe];
        assert_eq!(
            liberty_http_request_url(request, raw.as_ptr().cast(), raw.len()),
            LibertyCode::InvalidArgument
        );
        liberty_http_request_free(request);
    }

    #[test]
    fn freeing_unsubmitted_request_runs_deleter_once() {
        let request = request("http://127.0.0.1:1/");
        let (seen, deleted) = attach(request);
        liberty_http_request_free(request);

        assert!(deleted.recv_timeout(WAIT).is_ok());
        assert!(seen.try_recv().is_err());
    }

    #[test]
    fn replacing_callback_runs_previous_deleter() {
        let request = request("http://127.0.0.1:1/");
        let (_seen_a, deleted_a) = attach(request);
        let (_seen_b, deleted_b) = attach(request);

        assert!(deleted_a.try_recv().is_ok());
        assert!(deleted_b.try_recv().is_err());
        liberty_http_request_free(request);
        assert!(deleted_b.try_recv().is_ok());
    }

    #[test]
    fn empty_url_reports_configuration_error() {
        let client = liberty_http_client_make();
        let request = liberty_http_request_make();
        let (seen, deleted) = attach(request);

        assert_eq!(liberty_http_client_perform(client, request), LibertyCode::Ok);

        match seen.recv_timeout(WAIT).unwrap() {
            Seen::Error { kind, extra } => {
                assert_eq!(kind, LibertyErrorKind::Configuration);
                assert_eq!(extra, b"empty url");
            }
            other => panic!("expected error, got {other:?}"),
        }
        assert!(deleted.recv_timeout(WAIT).is_ok());
        liberty_http_client_free(client);
    }

    #[test]
    fn post_roundtrip_against_mock_server() {
        let addr = start_mock_server();
        let client = liberty_http_client_make();
        let request = request(&format!("http://{addr}/echo"));
        assert_eq!(liberty_http_request_post(request), LibertyCode::Ok);
        let body = b"abc";
        assert_eq!(liberty_http_request_data(request, body.as_ptr().cast(), body.len()), LibertyCode::Ok);
        let (name, value) = ("Content-Type", "text/plain");
        assert_eq!(
            liberty_http_request_header(request, name.as_ptr().cast(), name.len(), value.as_ptr().cast(), value.len()),
            LibertyCode::Ok
        );
        let (seen, deleted) = attach(request);

        assert_eq!(liberty_http_client_perform(client, request), LibertyCode::Ok);

        match seen.recv_timeout(WAIT).unwrap() {
            Seen::Response { code, body, content_type } => {
                assert_eq!(code, 200);
                assert_eq!(body, b"abc");
                assert_eq!(content_type.as_deref(), Some(&b"text/plain"[..]));
            }
            other => panic!("expected response, got {other:?}"),
        }
        assert!(deleted.recv_timeout(WAIT).is_ok());
        liberty_http_client_free(client);
    }

    #[test]
    fn cancellable_perform_reports_cancelled() {
        let addr = start_mock_server();
        let client = liberty_http_client_make();
        let request = request(&format!("http://{addr}/slow/5000"));
        let (seen, deleted) = attach(request);

        let handle = liberty_http_client_perform_cancellable(client, request);
        assert!(!handle.is_null());
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(liberty_perform_cancel(handle), LibertyCode::Ok);

        match seen.recv_timeout(WAIT).unwrap() {
            Seen::Error { kind, .. } => assert_eq!(kind, LibertyErrorKind::Cancelled),
            other => panic!("expected error, got {other:?}"),
        }
        assert!(deleted.recv_timeout(WAIT).is_ok());
        liberty_perform_free(handle);
        liberty_http_client_free(client);
    }

    #[test]
    fn client_free_fires_pending_callbacks() {
        let addr = start_mock_server();
        let client = liberty_http_client_make();
        let mut receivers = Vec::new();
        for _ in 0..3 {
            let request = request(&format!("http://{addr}/slow/5000"));
            receivers.push(attach(request));
            liberty_http_client_perform(client, request);
        }

        liberty_http_client_free(client);

        for (seen, deleted) in receivers {
            assert!(matches!(
                seen.try_recv().unwrap(),
                Seen::Error {
                    kind: LibertyErrorKind::Cancelled,
                    ..
                }
            ));
            assert!(deleted.try_recv().is_ok());
        }
    }

    #[test]
    fn perform_with_null_client_frees_request() {
        let request = request("http://127.0.0.1:1/");
        let (_seen, deleted) = attach(request);
        assert_eq!(liberty_http_client_perform(ptr::null_mut(), request), LibertyCode::NullArgument);
        assert!(deleted.try_recv().is_ok());
    }

    #[test]
    fn client_from_toml_config() {
        let toml = "worker_threads = 1\nrequest_timeout_ms = 100\n[pool]\nmax_connections_per_host = 1\n";
        let client = liberty_http_client_make_with_config(toml.as_ptr().cast(), toml.len());
        assert!(!client.is_null());
        liberty_http_client_free(client);

        let bad = "worker_threads = 0";
        assert!(liberty_http_client_make_with_config(bad.as_ptr().cast(), bad.len()).is_null());
    }

    #[test]
    fn request_timeout_reports_timeout() {
        let addr = start_mock_server();
        let client = liberty_http_client_make();
        let request = request(&format!("http://{addr}/slow/5000"));
        assert_eq!(liberty_http_request_timeout_ms(request, 100), LibertyCode::Ok);
        let (seen, _deleted) = attach(request);

        liberty_http_client_perform(client, request);

        match seen.recv_timeout(WAIT).unwrap() {
            Seen::Error { kind, .. } => assert_eq!(kind, LibertyErrorKind::Timeout),
            other => panic!("expected error, got {other:?}"),
        }
        liberty_http_client_free(client);
    }
}
