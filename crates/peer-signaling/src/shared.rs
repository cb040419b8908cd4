use std::sync::Arc;

use parking_lot::Mutex;

/// Who is keeping a [`SharedResource`] alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Holder {
    Foreground,
    Background,
}

struct Slot<T> {
    value: Option<Arc<T>>,
    foreground: bool,
    background: bool,
}

/// Process-wide handle that is built on first use and dropped once neither
/// the foreground nor the background holder needs it.
pub struct SharedResource<T> {
    slot: Mutex<Slot<T>>,
}

impl<T> SharedResource<T> {
    pub const fn new() -> Self {
        Self {
            slot: Mutex::new(Slot {
                value: None,
                foreground: false,
                background: false,
            }),
        }
    }

    /// Marks `holder` active and returns the instance, building it if absent.
    pub fn acquire<E>(&self, holder: Holder, init: impl FnOnce() -> Result<T, E>) -> Result<Arc<T>, E> {
        let mut slot = self.slot.lock();
        let value = match &slot.value {
            Some(value) => value.clone(),
            None => {
                let value = Arc::new(init()?);
                slot.value = Some(value.clone());
                value
            }
        };
        match holder {
            Holder::Foreground => slot.foreground = true,
            Holder::Background => slot.background = true,
        }
        Ok(value)
    }

    /// Marks `holder` inactive; the instance goes away with the last holder.
    /// Returns true when this call dropped it.
    pub fn release(&self, holder: Holder) -> bool {
        let mut slot = self.slot.lock();
        match holder {
            Holder::Foreground => slot.foreground = false,
            Holder::Background => slot.background = false,
        }
        if slot.foreground || slot.background {
            return false;
        }
        slot.value.take().is_some()
    }

    pub fn is_active(&self) -> bool {
        self.slot.lock().value.is_some()
    }
}

impl<T> Default for SharedResource<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn released_only_when_both_holders_leave() {
        let builds = AtomicUsize::new(0);
        let shared: SharedResource<usize> = SharedResource::new();
        let build = || {
            Ok::<_, Infallible>(builds.fetch_add(1, Ordering::SeqCst))
        };

        let first = shared.acquire(Holder::Foreground, build).expect("build");
        let second = shared.acquire(Holder::Background, build).expect("reuse");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(builds.load(Ordering::SeqCst), 1);

        assert!(!shared.release(Holder::Foreground));
        assert!(shared.is_active());
        assert!(shared.release(Holder::Background));
        assert!(!shared.is_active());

        shared.acquire(Holder::Foreground, build).expect("rebuild");
        assert_eq!(builds.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn failed_build_leaves_holders_untouched() {
        let shared: SharedResource<u8> = SharedResource::new();
        let err = shared
            .acquire(Holder::Background, || Err::<u8, _>("no device"))
            .expect_err("init fails");
        assert_eq!(err, "no device");
        assert!(!shared.is_active());
        assert!(!shared.release(Holder::Background));
    }
}
