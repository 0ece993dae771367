// Single-writer / multi-reader snapshot cells shared between activities
//
// Each cell is written by exactly one component and read by the others.
// Readers always see a whole value: a publish swaps the pointer, it never
// mutates the value a reader may be holding.

use std::sync::Arc;

use arc_swap::ArcSwap;

/// Atomically replaceable latest value
#[derive(Debug)]
pub struct Snapshot<T> {
    inner: Arc<ArcSwap<T>>,
}

impl<T> Snapshot<T> {
    pub fn new(initial: T) -> Self {
        Self {
            inner: Arc::new(ArcSwap::from_pointee(initial)),
        }
    }

    /// Replace the current value, overwriting whatever was there
    pub fn publish(&self, value: T) {
        self.inner.store(Arc::new(value));
    }

    /// Take a snapshot of the current value; never blocks on the writer
    pub fn load(&self) -> Arc<T> {
        self.inner.load_full()
    }
}

impl<T: Default> Default for Snapshot<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

// Clones share the same cell (handles, not copies)
impl<T> Clone for Snapshot<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}
