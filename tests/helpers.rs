use std::env;
use std::ffi::{OsStr, OsString};
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
static TEMP_COUNTER: AtomicUsize = AtomicUsize::new(0);

fn env_lock() -> MutexGuard<'static, ()> {
    match ENV_LOCK.get_or_init(|| Mutex::new(())).lock() {
        Ok(g) => g,
        // A test that panicked while holding the lock must not block the rest.
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Fresh, empty directory under the system temp dir.
#[allow(dead_code)]
pub fn unique_test_temp_dir(prefix: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let n = TEMP_COUNTER.fetch_add(1, Ordering::SeqCst);
    let dir = env::temp_dir().join(format!(
        "fleet-{prefix}-{}-{nanos}-{n}",
        std::process::id()
    ));
    fs::create_dir_all(&dir).expect("create test temp dir");
    dir
}

/// RAII guard for test-only env var mutation.
///
/// All mutations through these guards are serialized with one global lock, so
/// hold at most one guard at a time; use [`EnvVarGuard::set_many`] for several
/// variables.
#[must_use]
pub struct EnvVarGuard {
    entries: Vec<(String, Option<OsString>)>,
    _lock: MutexGuard<'static, ()>,
}

#[allow(dead_code)]
impl EnvVarGuard {
    pub fn set<K: Into<String>, V: AsRef<OsStr>>(key: K, value: V) -> Self {
        Self::apply(vec![(key.into(), Some(value.as_ref().to_os_string()))])
    }

    pub fn unset<K: Into<String>>(key: K) -> Self {
        Self::apply(vec![(key.into(), None)])
    }

    pub fn set_many(pairs: &[(&str, &str)]) -> Self {
        Self::apply(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), Some(OsString::from(v))))
                .collect(),
        )
    }

    fn apply(changes: Vec<(String, Option<OsString>)>) -> Self {
        let lock = env_lock();
        let mut entries = Vec::with_capacity(changes.len());
        for (key, value) in changes {
            let old = env::var_os(&key);
            // Env mutation is only sound while ENV_LOCK is held.
            unsafe {
                match value {
                    Some(v) => env::set_var(&key, v),
                    None => env::remove_var(&key),
                }
            }
            entries.push((key, old));
        }
        Self {
            entries,
            _lock: lock,
        }
    }
}

impl Drop for EnvVarGuard {
    fn drop(&mut self) {
        for (key, old) in self.entries.iter().rev() {
            unsafe {
                match old {
                    Some(v) => env::set_var(key, v),
                    None => env::remove_var(key),
                }
            }
        }
    }
}
