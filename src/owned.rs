//! Move-only ownership of imported GPU objects.
//!
//! Imported textures and fences must be handed back to the [`Device`] that
//! created them, which a plain `Drop` cannot do without every object holding
//! a device reference. [`Owned`] makes the hand-back explicit: the only ways
//! out are [`Owned::release`] and [`Owned::into_inner`], so every eviction in
//! the cache is a visible call.
//!
//! [`Device`]: crate::Device

use std::fmt;

/// An imported GPU object that must be released explicitly.
///
/// Not `Clone`. Dropping a value that was never released logs a warning:
/// the underlying GPU object is leaked until its device is destroyed.
pub struct Owned<T> {
    inner: Option<T>,
    what: &'static str,
}

impl<T> Owned<T> {
    /// Take ownership of `value`. `what` names the object in leak warnings.
    #[must_use]
    pub fn new(value: T, what: &'static str) -> Self {
        Self {
            inner: Some(value),
            what,
        }
    }

    /// Borrow the wrapped object.
    #[must_use]
    pub fn get(&self) -> &T {
        match &self.inner {
            Some(value) => value,
            None => crate::fatal!("{} used after release", self.what),
        }
    }

    /// Mutably borrow the wrapped object.
    #[must_use]
    pub fn get_mut(&mut self) -> &mut T {
        match &mut self.inner {
            Some(value) => value,
            None => crate::fatal!("{} used after release", self.what),
        }
    }

    /// Release the wrapped object through `release`, consuming the wrapper.
    pub fn release(mut self, release: impl FnOnce(T)) {
        if let Some(value) = self.inner.take() {
            release(value);
        }
    }

    /// Give up tracking and return the wrapped object.
    #[must_use]
    pub fn into_inner(mut self) -> T {
        match self.inner.take() {
            Some(value) => value,
            None => crate::fatal!("{} used after release", self.what),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Owned<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Owned").field(&self.inner).finish()
    }
}

impl<T> Drop for Owned<T> {
    fn drop(&mut self) {
        if self.inner.is_some() {
            tracing::warn!(what = self.what, "GPU object dropped without release; leaking");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn release_hands_value_to_callback_once() {
        let mut released = Vec::new();
        let owned = Owned::new(42_u32, "test object");
        assert_eq!(*owned.get(), 42);
        owned.release(|v| released.push(v));
        assert_eq!(released, [42]);
    }

    #[test]
    fn into_inner_disarms_leak_warning() {
        let mut owned = Owned::new(String::from("view"), "test object");
        owned.get_mut().push('!');
        assert_eq!(owned.into_inner(), "view!");
    }
}
