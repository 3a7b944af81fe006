//! Exactly-once completion dispatch.
//!
//! # Design
//! The caller's completion is an owned `FnOnce` closure: whatever context it
//! needs is captured by value, and its cleanup is the closure's drop. Calling
//! a `FnOnce` consumes it, so a handler can run at most once and its captures
//! are released right after it returns. `Dispatch` adds the "at least once"
//! half: if it is dropped without an outcome (the task running the exchange
//! was torn down), it fires the handler with `cancelled` from its `Drop`.
//!
//! `perform` builds the `Dispatch` but hands it to the spawned task, which
//! is the only place the handler is invoked. The handler therefore never
//! runs inside the caller's `perform` call frame.

use std::panic::{catch_unwind, AssertUnwindSafe};

use tokio::sync::watch;
use tracing::{debug, error};

use crate::error::Error;
use crate::response::Response;

/// Terminal result of one perform.
pub type Outcome = Result<Response, Error>;

/// Caller-supplied completion handler.
pub type CompletionHandler = Box<dyn FnOnce(Outcome) + Send + 'static>;

/// Owns a perform's handler until the outcome is known.
pub(crate) struct Dispatch {
    handler: Option<CompletionHandler>,
    finished: Option<watch::Sender<bool>>,
}

impl Dispatch {
    pub(crate) fn new(handler: Option<CompletionHandler>, finished: watch::Sender<bool>) -> Self {
        Self {
            handler,
            finished: Some(finished),
        }
    }

    /// Deliver the outcome. Consumes the dispatch, so a second delivery does
    /// not type-check.
    pub(crate) fn complete(mut self, outcome: Outcome) {
        self.fire(outcome);
    }

    fn fire(&mut self, outcome: Outcome) {
        let Some(finished) = self.finished.take() else {
            return;
        };
        match self.handler.take() {
            Some(handler) => {
                if catch_unwind(AssertUnwindSafe(move || handler(outcome))).is_err() {
                    error!("completion handler panicked");
                }
            }
            None => match &outcome {
                Ok(response) => debug!(
                    status = response.status_code(),
                    "no completion handler registered, response discarded"
                ),
                Err(err) => debug!(%err, "no completion handler registered, error discarded"),
            },
        }
        finished.send_replace(true);
    }
}

impl Drop for Dispatch {
    fn drop(&mut self) {
        if self.finished.is_some() {
            self.fire(Err(Error::cancelled("request abandoned before completion")));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::http::{Headers, Version};
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    fn ok_response() -> Outcome {
        Ok(Response::new(
            200,
            "OK".to_string(),
            Version::Http11,
            Headers::new(),
            Bytes::from_static(b"done"),
        ))
    }

    fn counting_handler(calls: &Arc<AtomicUsize>) -> CompletionHandler {
        let calls = Arc::clone(calls);
        Box::new(move |_: Outcome| {
            calls.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn complete_invokes_handler_once_and_marks_finished() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = watch::channel(false);
        let dispatch = Dispatch::new(Some(counting_handler(&calls)), tx);

        dispatch.complete(ok_response());

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(*rx.borrow());
    }

    #[test]
    fn dropping_without_outcome_reports_cancelled() {
        let seen = Arc::new(Mutex::new(None));
        let seen2 = Arc::clone(&seen);
        let (tx, rx) = watch::channel(false);
        let dispatch = Dispatch::new(
            Some(Box::new(move |outcome: Outcome| {
                *seen2.lock().unwrap() = Some(outcome.unwrap_err().kind());
            })),
            tx,
        );

        drop(dispatch);

        assert_eq!(*seen.lock().unwrap(), Some(ErrorKind::Cancelled));
        assert!(*rx.borrow());
    }

    #[test]
    fn captured_context_is_released_after_handler_returns() {
        struct Context {
            log: Arc<Mutex<Vec<&'static str>>>,
        }
        impl Drop for Context {
            fn drop(&mut self) {
                self.log.lock().unwrap().push("released");
            }
        }

        let log = Arc::new(Mutex::new(Vec::new()));
        let context = Context {
            log: Arc::clone(&log),
        };
        let (tx, _rx) = watch::channel(false);
        let dispatch = Dispatch::new(
            Some(Box::new(move |_outcome: Outcome| {
                context.log.lock().unwrap().push("handled");
            })),
            tx,
        );

        dispatch.complete(ok_response());

        assert_eq!(*log.lock().unwrap(), vec!["handled", "released"]);
    }

    #[test]
    fn panicking_handler_is_contained() {
        let (tx, rx) = watch::channel(false);
        let dispatch = Dispatch::new(Some(Box::new(|_: Outcome| panic!("boom"))), tx);

        dispatch.complete(ok_response());

        assert!(*rx.borrow());
    }

    #[test]
    fn missing_handler_still_finishes() {
        let (tx, rx) = watch::channel(false);
        Dispatch::new(None, tx).complete(Err(Error::resolve("nx")));
        assert!(*rx.borrow());
    }
}
