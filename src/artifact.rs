//! Temporary plaintext artifacts
//!
//! Decrypted output only ever lives inside a per-session directory created
//! by an [`ArtifactManager`]. Every artifact is recorded in a process-wide
//! registry until it is released, so that [`purge_outstanding`] can remove
//! whatever is left on an abrupt shutdown path. Leftovers from processes
//! that died without cleaning up are removed by [`sweep_stale`].
//!
//! On Unix the session directory is mode 0o700 and artifacts are mode
//! 0o600. Plaintext still sits on disk while an artifact is alive.

use crate::error::{ErrorCategory, ErrorKind, Result, SecureMediaError};
use crate::header::MAX_EXTENSION_LEN;
use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tempfile::TempDir;
use tracing::{debug, warn};

/// Name prefix of every session directory
pub const SESSION_PREFIX: &str = "secure-media-";

/// Longest stem kept from the input file name
const MAX_STEM_LEN: usize = 64;

/// Random characters tempfile inserts into each artifact name
const NAME_RAND_LEN: usize = 6;

struct Registry {
    sessions: BTreeSet<PathBuf>,
    artifacts: BTreeSet<PathBuf>,
}

static REGISTRY: Mutex<Registry> = Mutex::new(Registry {
    sessions: BTreeSet::new(),
    artifacts: BTreeSet::new(),
});

fn registry() -> MutexGuard<'static, Registry> {
    // The registry holds only paths; a panic elsewhere cannot leave it torn.
    REGISTRY.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Session {
    dir: TempDir,
}

impl Drop for Session {
    fn drop(&mut self) {
        let removed = purge_matching(|path| path.starts_with(self.dir.path()));
        registry().sessions.remove(self.dir.path());
        debug!(dir = %self.dir.path().display(), removed, "closing artifact session");
    }
}

/// Allocates artifacts inside one private session directory.
///
/// Clones share the session. The directory is deleted when the last clone
/// and the last handle drawn from it are gone.
#[derive(Clone)]
pub struct ArtifactManager {
    session: Arc<Session>,
}

impl ArtifactManager {
    /// Create a session under the system temporary directory.
    pub fn new() -> Result<Self> {
        Self::new_in(std::env::temp_dir())
    }

    /// Create a session under `base`.
    pub fn new_in(base: impl AsRef<Path>) -> Result<Self> {
        let base = base.as_ref();
        let prefix = format!("{}{}-", SESSION_PREFIX, std::process::id());
        let dir = tempfile::Builder::new()
            .prefix(&prefix)
            .tempdir_in(base)
            .map_err(|e| {
                SecureMediaError::with_kind_and_source(
                    ErrorCategory::Internal,
                    ErrorKind::Io,
                    format!("failed to create session directory in {}", base.display()),
                    e,
                )
            })?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(dir.path(), fs::Permissions::from_mode(0o700)).map_err(|e| {
                SecureMediaError::with_kind_and_source(
                    ErrorCategory::Internal,
                    ErrorKind::Io,
                    "failed to restrict session directory permissions",
                    e,
                )
            })?;
        }

        registry().sessions.insert(dir.path().to_path_buf());
        debug!(dir = %dir.path().display(), "opened artifact session");
        Ok(Self {
            session: Arc::new(Session { dir }),
        })
    }

    pub fn session_dir(&self) -> &Path {
        self.session.dir.path()
    }

    /// Allocate an empty artifact whose name ends in `.{suggested_extension}`.
    pub fn acquire(&self, suggested_extension: &str) -> Result<ArtifactHandle> {
        self.acquire_named("artifact", suggested_extension)
    }

    /// Allocate an empty artifact named `{stem}-XXXXXX.{extension}`.
    ///
    /// An empty extension yields a name without a suffix.
    pub fn acquire_named(&self, stem: &str, extension: &str) -> Result<ArtifactHandle> {
        if extension.len() > MAX_EXTENSION_LEN
            || !extension.bytes().all(|b| b.is_ascii_alphanumeric())
        {
            return Err(SecureMediaError::invalid_input(format!(
                "unsupported artifact extension {:?}",
                extension
            )));
        }
        let suffix = if extension.is_empty() {
            String::new()
        } else {
            format!(".{}", extension)
        };

        let temp = tempfile::Builder::new()
            .prefix(&format!("{}-", sanitize_stem(stem)))
            .suffix(&suffix)
            .rand_bytes(NAME_RAND_LEN)
            .tempfile_in(self.session_dir())
            .map_err(|e| {
                SecureMediaError::with_kind_and_source(
                    ErrorCategory::Internal,
                    ErrorKind::Io,
                    "failed to create artifact",
                    e,
                )
            })?;
        let (file, path) = temp.keep().map_err(|e| {
            SecureMediaError::with_kind_and_source(
                ErrorCategory::Internal,
                ErrorKind::Io,
                "failed to take ownership of artifact",
                e,
            )
        })?;

        registry().artifacts.insert(path.clone());
        debug!(path = %path.display(), "acquired artifact");
        Ok(ArtifactHandle {
            path,
            file: Some(file),
            released: false,
            _session: Arc::clone(&self.session),
        })
    }

    /// Paths of the artifacts of this session that have not been released
    pub fn live_artifacts(&self) -> Vec<PathBuf> {
        let dir = self.session_dir();
        registry()
            .artifacts
            .iter()
            .filter(|p| p.starts_with(dir))
            .cloned()
            .collect()
    }

    /// Delete every artifact of this session that is still live.
    ///
    /// Returns the number of artifacts removed. Handles that outlive the
    /// teardown become no-ops on release.
    pub fn teardown(&self) -> usize {
        let dir = self.session_dir().to_path_buf();
        purge_matching(|path| path.starts_with(&dir))
    }
}

/// One temporary plaintext file.
///
/// Released (deleted and unregistered) explicitly via [`release`] or
/// implicitly on drop.
///
/// [`release`]: ArtifactHandle::release
pub struct ArtifactHandle {
    path: PathBuf,
    file: Option<File>,
    released: bool,
    _session: Arc<Session>,
}

impl ArtifactHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Take the write handle opened at creation. Returns `None` on later calls.
    pub fn take_file(&mut self) -> Option<File> {
        self.file.take()
    }

    /// Delete the artifact. Calling this more than once is fine.
    pub fn release(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.file = None;
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(SecureMediaError::with_kind_and_source(
                    ErrorCategory::Internal,
                    ErrorKind::Io,
                    format!("failed to remove artifact {}", self.path.display()),
                    e,
                ));
            }
        }
        registry().artifacts.remove(&self.path);
        self.released = true;
        debug!(path = %self.path.display(), "released artifact");
        Ok(())
    }
}

impl Drop for ArtifactHandle {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!(error = %e, "artifact left behind; it stays registered for purge");
        }
    }
}

impl std::fmt::Debug for ArtifactHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactHandle")
            .field("path", &self.path)
            .field("released", &self.released)
            .finish()
    }
}

/// Best-effort removal of every artifact and session directory this process
/// still has registered. Meant for shutdown paths that skip normal drops.
///
/// Returns the number of artifacts removed.
pub fn purge_outstanding() -> usize {
    let removed = purge_matching(|_| true);
    let sessions = std::mem::take(&mut registry().sessions);
    for dir in sessions {
        if let Err(e) = fs::remove_dir_all(&dir) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(dir = %dir.display(), error = %e, "failed to remove session directory");
            }
        }
    }
    removed
}

/// Remove session directories under `base` left by earlier processes.
///
/// A directory is kept if this process registered it, if the process whose
/// pid is in its name is still running, or if it was modified less than
/// `max_age` ago. Returns the number of directories removed.
pub fn sweep_stale(base: &Path, max_age: Duration) -> Result<usize> {
    let entries = fs::read_dir(base).map_err(|e| {
        SecureMediaError::with_kind_and_source(
            ErrorCategory::Internal,
            ErrorKind::Io,
            format!("failed to list {}", base.display()),
            e,
        )
    })?;

    let mut removed = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
            continue;
        };
        if !name.starts_with(SESSION_PREFIX) || registry().sessions.contains(&path) {
            continue;
        }
        if session_owner(&name).is_some_and(process_alive) {
            debug!(dir = %path.display(), "session owner still running");
            continue;
        }
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        if !metadata.is_dir() {
            continue;
        }
        let age = metadata
            .modified()
            .ok()
            .and_then(|m| m.elapsed().ok())
            .unwrap_or(Duration::ZERO);
        if age < max_age {
            continue;
        }
        match fs::remove_dir_all(&path) {
            Ok(()) => {
                debug!(dir = %path.display(), "removed stale session");
                removed += 1;
            }
            Err(e) => warn!(dir = %path.display(), error = %e, "failed to remove stale session"),
        }
    }
    Ok(removed)
}

/// Pid encoded in a session directory name (`secure-media-<pid>-<random>`)
fn session_owner(name: &str) -> Option<u32> {
    let rest = name.strip_prefix(SESSION_PREFIX)?;
    let (pid, _) = rest.split_once('-')?;
    pid.parse().ok()
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    // 0 and values past i32::MAX would address process groups.
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    match kill(Pid::from_raw(raw), None::<Signal>) {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        // EPERM: it exists but belongs to someone else.
        Err(_) => true,
    }
}

// No cheap liveness check here; age alone decides.
#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    false
}

fn purge_matching(select: impl Fn(&Path) -> bool) -> usize {
    let mut reg = registry();
    let targets: Vec<PathBuf> = reg
        .artifacts
        .iter()
        .filter(|p| select(p))
        .cloned()
        .collect();

    let mut removed = 0;
    for path in targets {
        match fs::remove_file(&path) {
            Ok(()) => removed += 1,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to purge artifact");
                continue;
            }
        }
        reg.artifacts.remove(&path);
    }
    removed
}

fn sanitize_stem(stem: &str) -> String {
    let cleaned: String = stem
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '-' | '_' | '.' | ' ') {
                c
            } else {
                '_'
            }
        })
        .take(MAX_STEM_LEN)
        .collect();
    if cleaned.trim().is_empty() {
        "artifact".to_string()
    } else {
        cleaned
    }
}
