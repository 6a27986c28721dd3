use std::sync::{Mutex, OnceLock};

fn env_lock() -> &'static Mutex<()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
}

/// Serialises environment mutation across the whole test body.
pub(crate) fn with_locked_env<R>(run: impl FnOnce() -> R) -> R {
    let _guard = env_lock().lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    run()
}

/// Snapshot of environment variables, restored on drop.
///
/// Only use inside [`with_locked_env`].
pub(crate) struct EnvGuard {
    saved: Vec<(String, Option<String>)>,
}

impl EnvGuard {
    /// Records the current values of `keys` and removes them.
    pub(crate) fn clear(keys: &[&str]) -> Self {
        let saved = keys
            .iter()
            .map(|key| (key.to_string(), std::env::var(key).ok()))
            .collect();
        for key in keys {
            // SAFETY: callers hold the env lock, so no other test thread touches the environment.
            unsafe { std::env::remove_var(key) };
        }
        Self { saved }
    }

    pub(crate) fn set(key: &str, value: &str) {
        // SAFETY: callers hold the env lock, so no other test thread touches the environment.
        unsafe { std::env::set_var(key, value) };
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, value) in &self.saved {
            // SAFETY: the guard is dropped before the env lock is released.
            unsafe {
                match value {
                    Some(v) => std::env::set_var(key, v),
                    None => std::env::remove_var(key),
                }
            }
        }
    }
}
