use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

static NEXT_MARKER: AtomicU64 = AtomicU64::new(1);

struct Slot<F: ?Sized> {
    current: Arc<F>,
    /// Set while a wrapper installed by [`Hookable::wrap`] is live.
    marker: Option<u64>,
}

/// A replaceable member of a host module.
///
/// Callers fetch the current implementation on every call with
/// [`Hookable::get`], so an installed wrapper is seen by all of them.
/// Clones share the same slot.
pub struct Hookable<F: ?Sized> {
    slot: Arc<RwLock<Slot<F>>>,
}

impl<F: ?Sized> Clone for Hookable<F> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<F: ?Sized> Hookable<F> {
    pub fn new(f: Arc<F>) -> Self {
        Self {
            slot: Arc::new(RwLock::new(Slot {
                current: f,
                marker: None,
            })),
        }
    }

    /// The implementation currently installed.
    pub fn get(&self) -> Arc<F> {
        Arc::clone(&self.slot.read().current)
    }

    pub fn is_wrapped(&self) -> bool {
        self.slot.read().marker.is_some()
    }

    /// Install `transform(original)` in place of the current implementation.
    ///
    /// Returns `None` without invoking `transform` if a wrapper is already
    /// installed, so repeated load notifications wrap at most once.
    /// The returned handle restores the original.
    pub fn wrap(&self, transform: impl FnOnce(Arc<F>) -> Arc<F>) -> Option<Unwrap<F>> {
        let original = {
            let slot = self.slot.read();
            if slot.marker.is_some() {
                return None;
            }
            Arc::clone(&slot.current)
        };

        let replacement = transform(Arc::clone(&original));

        let mut slot = self.slot.write();
        // Lost a race with another wrap, or the member was replaced meanwhile.
        if slot.marker.is_some() || !same_target(&slot.current, &original) {
            return None;
        }
        let marker = NEXT_MARKER.fetch_add(1, Ordering::Relaxed);
        slot.current = replacement;
        slot.marker = Some(marker);

        Some(Unwrap {
            slot: Arc::clone(&self.slot),
            original,
            marker,
        })
    }
}

/// Handle returned by a successful wrap.
#[must_use = "dropping the handle leaves the wrapper installed with no way to remove it"]
pub struct Unwrap<F: ?Sized> {
    slot: Arc<RwLock<Slot<F>>>,
    original: Arc<F>,
    marker: u64,
}

impl<F: ?Sized> Unwrap<F> {
    /// Put the original member back and clear the marker so the
    /// member can be wrapped again. Returns `false` if the slot no longer
    /// holds this wrapper.
    pub fn restore(self) -> bool {
        let mut slot = self.slot.write();
        if slot.marker != Some(self.marker) {
            return false;
        }
        slot.current = self.original;
        slot.marker = None;
        true
    }

    /// The implementation that was in place before wrapping.
    pub fn original(&self) -> Arc<F> {
        Arc::clone(&self.original)
    }

    /// Give up the ability to restore; the wrapper stays installed.
    pub fn forget(self) {}
}

fn same_target<F: ?Sized>(a: &Arc<F>, b: &Arc<F>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}
