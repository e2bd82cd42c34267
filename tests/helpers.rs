#![allow(dead_code)]

use std::env;
use std::ffi::{OsStr, OsString};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, OnceLock};

static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
static TEMP_SEQ: AtomicUsize = AtomicUsize::new(0);

fn env_lock() -> MutexGuard<'static, ()> {
    match ENV_LOCK.get_or_init(|| Mutex::new(())).lock() {
        Ok(g) => g,
        // A test that panicked while holding the lock must not wedge the rest.
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Fresh directory under the system temp dir, unique per call and process.
pub fn unique_test_temp_dir(prefix: &str) -> PathBuf {
    let seq = TEMP_SEQ.fetch_add(1, Ordering::SeqCst);
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let dir = env::temp_dir().join(format!(
        "swarm-test-{prefix}-{}-{seq}-{nanos}",
        std::process::id()
    ));
    fs::create_dir_all(&dir).expect("create unique temp dir");
    dir
}

/// Write an executable shell script (the fake execution backend).
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, body).expect("write script");
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(&path).expect("script metadata").permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).expect("chmod script");
    }
    path
}

/// RAII guard for test-only env var mutation.
///
/// All mutations through this guard are serialized with a global lock;
/// mutations that bypass it are not controlled.
#[must_use]
pub struct EnvVarGuard {
    entries: Vec<(String, Option<OsString>)>,
    _lock: MutexGuard<'static, ()>,
}

impl EnvVarGuard {
    pub fn set<K: Into<String>, V: AsRef<OsStr>>(key: K, value: V) -> Self {
        let key: String = key.into();
        Self::set_many(&[(key.as_str(), value.as_ref())])
    }

    pub fn set_many(pairs: &[(&str, &OsStr)]) -> Self {
        let lock = env_lock();
        let mut entries = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let old = env::var_os(key);
            // Env mutation is unsafe on recent toolchains; ENV_LOCK serializes it.
            unsafe {
                env::set_var(key, value);
            }
            entries.push((key.to_string(), old));
        }
        Self {
            entries,
            _lock: lock,
        }
    }

    pub fn unset<K: Into<String>>(key: K) -> Self {
        let key = key.into();
        let lock = env_lock();
        let old = env::var_os(&key);
        unsafe {
            env::remove_var(&key);
        }
        Self {
            entries: vec![(key, old)],
            _lock: lock,
        }
    }
}

impl Drop for EnvVarGuard {
    fn drop(&mut self) {
        for (key, old) in self.entries.iter() {
            unsafe {
                match old {
                    Some(v) => env::set_var(key, v),
                    None => env::remove_var(key),
                }
            }
        }
    }
}
