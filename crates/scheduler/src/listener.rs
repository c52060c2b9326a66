//! Lifecycle listeners for fetch requests
//!
//! A listener observes one or more requests. For every request it sees
//! `created`, then `started` once a worker picks it up, then exactly one
//! terminal notification: `completed` (preceded by `updated` when pixels were
//! read), `canceled` or `error`. Nothing is delivered after the terminal
//! notification.

use crate::request::RequestId;
use std::sync::Arc;
use tilefetch_raster::{Extent, PixelFormat};

/// Error code passed to [`FetchListener::error`] when the source or the
/// listener itself panicked while the request was being serviced.
pub const PANIC_ERROR_CODE: i32 = i32::MIN;

/// Pixels delivered by an `updated` notification.
///
/// The buffer belongs to the worker that serviced the request and is reused
/// for the next request, so listeners must copy what they want to keep.
#[derive(Debug, Clone, Copy)]
pub struct TileData<'a> {
    pub data: &'a [u8],
    pub extent: Extent,
    pub format: PixelFormat,
}

/// Receives lifecycle notifications for fetch requests.
///
/// All methods default to doing nothing. Notifications are delivered on the
/// submitting thread (`created`), a worker thread (`started`, `updated`,
/// `completed`, `error`) or the canceling thread (`canceled`).
pub trait FetchListener: Send + Sync {
    /// The request was accepted by the scheduler.
    fn created(&self, _id: RequestId) {}

    /// A worker is about to read the request.
    fn started(&self, _id: RequestId) {}

    /// Pixels for the request are available.
    fn updated(&self, _id: RequestId, _tile: &TileData<'_>) {}

    /// The request finished successfully.
    fn completed(&self, _id: RequestId) {}

    /// The request was canceled, before or during servicing.
    fn canceled(&self, _id: RequestId) {}

    /// The source failed to read the request.
    fn error(&self, _id: RequestId, _code: i32, _message: &str) {}
}

/// A lifecycle notification, as seen by closure listeners.
#[derive(Debug, Clone, Copy)]
pub enum FetchEvent<'a> {
    Created(RequestId),
    Started(RequestId),
    Updated {
        id: RequestId,
        tile: &'a TileData<'a>,
    },
    Completed(RequestId),
    Canceled(RequestId),
    Error {
        id: RequestId,
        code: i32,
        message: &'a str,
    },
}

impl FetchEvent<'_> {
    /// The request this event is about.
    pub fn id(&self) -> RequestId {
        match self {
            FetchEvent::Created(id)
            | FetchEvent::Started(id)
            | FetchEvent::Completed(id)
            | FetchEvent::Canceled(id) => *id,
            FetchEvent::Updated { id, .. } | FetchEvent::Error { id, .. } => *id,
        }
    }

    /// Returns `true` for `completed`, `canceled` and `error`.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FetchEvent::Completed(_) | FetchEvent::Canceled(_) | FetchEvent::Error { .. }
        )
    }
}

/// Adapts a closure into a [`FetchListener`].
pub struct FnListener<F> {
    callback: F,
}

impl<F> FetchListener for FnListener<F>
where
    F: Fn(FetchEvent<'_>) + Send + Sync,
{
    fn created(&self, id: RequestId) {
        (self.callback)(FetchEvent::Created(id));
    }

    fn started(&self, id: RequestId) {
        (self.callback)(FetchEvent::Started(id));
    }

    fn updated(&self, id: RequestId, tile: &TileData<'_>) {
        (self.callback)(FetchEvent::Updated { id, tile });
    }

    fn completed(&self, id: RequestId) {
        (self.callback)(FetchEvent::Completed(id));
    }

    fn canceled(&self, id: RequestId) {
        (self.callback)(FetchEvent::Canceled(id));
    }

    fn error(&self, id: RequestId, code: i32, message: &str) {
        (self.callback)(FetchEvent::Error { id, code, message });
    }
}

/// Create a listener from a closure over [`FetchEvent`]s.
///
/// # Example
///
/// ```
/// use tilefetch_scheduler::{listener_fn, FetchEvent};
///
/// let listener = listener_fn(|event| {
///     if let FetchEvent::Completed(id) = event {
///         println!("request {} done", id);
///     }
/// });
/// # let _ = listener;
/// ```
pub fn listener_fn<F>(callback: F) -> Arc<dyn FetchListener>
where
    F: Fn(FetchEvent<'_>) + Send + Sync + 'static,
{
    Arc::new(FnListener { callback })
}

/// Identity of a listener, used to cancel every request sharing it.
pub(crate) fn listener_key(listener: &Arc<dyn FetchListener>) -> usize {
    Arc::as_ptr(listener) as *const () as usize
}
