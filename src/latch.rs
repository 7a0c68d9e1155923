//! The shared fatal-error latch a [`crate::Session`] hands to both its
//! command channel and its event listener (spec §7: "the first fatal error
//! is latched").

use crate::error::{Error, Result};
use std::sync::{Arc, Mutex};

#[derive(Clone)]
pub(crate) struct Latch(Arc<Mutex<Option<Error>>>);

impl Latch {
    pub(crate) fn new() -> Self {
        Self(Arc::new(Mutex::new(None)))
    }

    /// Returns the latched error, if any has been recorded yet.
    pub(crate) fn check(&self) -> Result<()> {
        match self.0.lock().unwrap().clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Records `err` if it is fatal and nothing has latched yet. The first
    /// fatal error wins; later ones are discarded (spec §7).
    pub(crate) fn set_if_fatal(&self, err: &Error) {
        if err.is_fatal() {
            let mut guard = self.0.lock().unwrap();
            if guard.is_none() {
                *guard = Some(err.clone());
            }
        }
    }

    /// Latches `SessionClosed` unconditionally, unless some other error
    /// (fatal or a prior close) already won the race. Called by
    /// [`crate::Session::close`] so that any command or subscribe/unsubscribe
    /// call issued afterwards fails fast instead of reaching the socket
    /// (spec §7: "operation issued after close").
    pub(crate) fn close(&self) {
        let mut guard = self.0.lock().unwrap();
        if guard.is_none() {
            *guard = Some(Error::SessionClosed);
        }
    }

    /// The latched error, if one is present, without allocating a
    /// `Result`. Used by [`crate::event::EventListener::next_event`] to
    /// decide what to return once its buffer has drained.
    pub(crate) fn get(&self) -> Option<Error> {
        self.0.lock().unwrap().clone()
    }
}
