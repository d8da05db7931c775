use std::time::Duration;
use std::{
    mem::take,
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
};

/// A condvar-backed value shared between threads. Used both as a cancellation
/// signal (`Context<bool>`) and as a one-shot decision slot
/// (`Context<Option<T>>`) that a caller can block on.
#[derive(Debug, Clone, Default)]
pub struct Context<T>(Arc<(Mutex<T>, Condvar)>);

impl<T> Context<T>
where
    T: Default,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the value and notifies every thread blocked on this [`Context`]
    /// so they unblock and act on it.
    pub fn cancel_all(&self, val: T) -> Result<(), PoisonError<MutexGuard<'_, T>>> {
        let (lck, cvar) = &*self.0;
        let mut lck = lck.lock()?;
        *lck = val;
        cvar.notify_all();
        Ok(())
    }

    /// Waits for a notification on the condvar, returning the value set by the
    /// notifier and leaving the default behind.
    pub fn wait_condvar(&self) -> Result<T, PoisonError<MutexGuard<'_, T>>> {
        let (lck, cvar) = &*self.0;
        let mut lck = lck.lock()?;
        lck = cvar.wait(lck)?;
        let current = take(&mut *lck);
        Ok(current)
    }

    pub(crate) fn get_lock_cvar(&self) -> &(Mutex<T>, Condvar) {
        &self.0
    }

    /// Resets the inner value to its default.
    pub fn reset(&self) -> Result<(), PoisonError<MutexGuard<'_, T>>> {
        let (lck, _) = &*self.0;
        let mut lck = lck.lock()?;
        *lck = <T as Default>::default();
        Ok(())
    }
}

impl Context<bool> {
    pub fn is_cancelled(&self) -> bool {
        let (lck, _) = &*self.0;
        *lck.lock().unwrap()
    }

    /// Blocks until the context is cancelled or the timeout elapses.
    /// Returns true if the context was cancelled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (lck, cvar) = &*self.0;
        let guard = lck.lock().unwrap();
        let (guard, result) = cvar
            .wait_timeout_while(guard, timeout, |cancelled| !*cancelled)
            .unwrap();
        !result.timed_out() || *guard
    }
}
