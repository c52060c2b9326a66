//! Dispatch ordering for queued requests.
//!
//! Within a source, requests are dispatched coarsest level first, and in
//! creation order within a level. A [`Prioritizer`] can override this for
//! any pair it has an opinion about; when it returns the same answer in both
//! directions the pair falls through to the default order.

use crate::request::FetchRequest;
use std::cmp::Ordering;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::warn;

/// Decides which of two requests on the same source should go first.
///
/// `compare(a, b)` returns `true` if `a` should be dispatched before `b`.
/// Implementations must not block or call back into the scheduler.
pub trait Prioritizer: Send + Sync {
    fn compare(&self, a: &FetchRequest, b: &FetchRequest) -> bool;
}

impl<F> Prioritizer for F
where
    F: Fn(&FetchRequest, &FetchRequest) -> bool + Send + Sync,
{
    fn compare(&self, a: &FetchRequest, b: &FetchRequest) -> bool {
        self(a, b)
    }
}

/// The built-in order: higher level first, then lower id first.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultPrioritizer;

impl Prioritizer for DefaultPrioritizer {
    fn compare(&self, a: &FetchRequest, b: &FetchRequest) -> bool {
        default_order(a, b) == Ordering::Less
    }
}

fn default_order(a: &FetchRequest, b: &FetchRequest) -> Ordering {
    b.level().cmp(&a.level()).then(a.id().cmp(&b.id()))
}

/// Total dispatch order of two live requests; `Less` means `a` goes first.
///
/// Cancellation is not considered here. The queue moves canceled requests
/// ahead of everything else before sorting.
pub fn dispatch_order(
    prioritizer: Option<&dyn Prioritizer>,
    a: &FetchRequest,
    b: &FetchRequest,
) -> Ordering {
    if let Some(prioritizer) = prioritizer {
        let a_first = prioritizer.compare(a, b);
        let b_first = prioritizer.compare(b, a);
        if a_first != b_first {
            return if a_first {
                Ordering::Less
            } else {
                Ordering::Greater
            };
        }
    }
    default_order(a, b)
}

/// Sort `requests` so that the next one to dispatch is at the end.
///
/// A prioritizer that panics, or that is inconsistent enough to make the sort
/// panic, is ignored for this pass and the default order is used instead.
pub(crate) fn sort_for_dispatch(
    requests: &mut [Arc<FetchRequest>],
    prioritizer: Option<&dyn Prioritizer>,
) {
    if prioritizer.is_some() {
        let sorted = panic::catch_unwind(AssertUnwindSafe(|| {
            requests.sort_by(|a, b| dispatch_order(prioritizer, b, a));
        }));
        if sorted.is_ok() {
            return;
        }
        warn!(
            requests = requests.len(),
            "prioritizer panicked, falling back to the default order"
        );
    }
    requests.sort_by(|a, b| default_order(b, a));
}
