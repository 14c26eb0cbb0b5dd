use std::collections::HashMap;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use log::debug;

use crate::error::PreviewError;

struct Slot<T> {
    result: Mutex<Option<Result<T, String>>>,
    ready: Condvar,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Registry of generations currently running, keyed by target path.
///
/// The first caller for a key does the work; callers arriving while it runs
/// block and receive a copy of its result.
pub(crate) struct InFlight<T> {
    slots: Mutex<HashMap<PathBuf, Arc<Slot<T>>>>,
}

impl<T: Clone> InFlight<T> {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn run<F>(&self, key: &Path, work: F) -> Result<T, PreviewError>
    where
        F: FnOnce() -> Result<T, PreviewError>,
    {
        let (slot, leader) = {
            let mut slots = lock(&self.slots);
            match slots.get(key) {
                Some(slot) => (Arc::clone(slot), false),
                None => {
                    let slot = Arc::new(Slot {
                        result: Mutex::new(None),
                        ready: Condvar::new(),
                    });
                    slots.insert(key.to_path_buf(), Arc::clone(&slot));
                    (slot, true)
                }
            }
        };

        if !leader {
            debug!("Waiting on in-flight generation of {}", key.display());
            return Self::wait_for(key, &slot);
        }

        let outcome = catch_unwind(AssertUnwindSafe(work));
        let shared = match &outcome {
            Ok(Ok(value)) => Ok(value.clone()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err("generation panicked".to_string()),
        };

        *lock(&slot.result) = Some(shared);
        slot.ready.notify_all();
        lock(&self.slots).remove(key);

        match outcome {
            Ok(result) => result,
            Err(panic) => resume_unwind(panic),
        }
    }

    fn wait_for(key: &Path, slot: &Slot<T>) -> Result<T, PreviewError> {
        let mut result = lock(&slot.result);
        loop {
            if let Some(shared) = result.as_ref() {
                return shared.clone().map_err(|message| PreviewError::Shared {
                    target: key.to_path_buf(),
                    message,
                });
            }
            result = slot.ready.wait(result).unwrap_or_else(PoisonError::into_inner);
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        lock(&self.slots).len()
    }
}
