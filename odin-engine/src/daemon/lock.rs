//! Single-instance lock per project root.
//!
//! The lock is a PID file at `.odin/odin.lock` holding the owner's PID and,
//! where `/proc` exists, its start time. It is advisory: any process that
//! does not go through [`acquire`] can still touch the project.
//!
//! A live holder counts as another instance only when its start time matches
//! the recorded one and its program name (`argv[0]` basename) equals the
//! identity marker. Arguments are never looked at. A dead PID, a zombie, a
//! reused PID or some unrelated program is stale and the file is reclaimed.
//! An identified instance is asked to stop (SIGTERM, then SIGKILL) when
//! `terminate_conflicting` is set; a holder that cannot be identified is
//! never signalled, only waited for.
//!
//! Removing a stale file happens under an exclusive `flock` on
//! `.odin/odin.lock.reclaim`, with the file re-read first, so two processes
//! reclaiming the same stale lock cannot delete each other's fresh one.
//!
//! Calling [`acquire`] again from the process that already holds the lock
//! succeeds and returns a non-owning guard; only the first guard removes the
//! file.

use crate::config::LockConfig;
use crate::utils::errors::LockError;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub const LOCK_FILE_NAME: &str = "odin.lock";
const RECLAIM_FILE_NAME: &str = "odin.lock.reclaim";

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const KILL_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct LockOptions {
    pub acquire_timeout: Duration,
    pub terminate_timeout: Duration,
    pub identity_marker: String,
    pub terminate_conflicting: bool,
}

impl From<&LockConfig> for LockOptions {
    fn from(config: &LockConfig) -> Self {
        Self {
            acquire_timeout: config.acquire_timeout(),
            terminate_timeout: config.terminate_timeout(),
            identity_marker: config.identity_marker.clone(),
            terminate_conflicting: config.terminate_conflicting,
        }
    }
}

impl Default for LockOptions {
    fn default() -> Self {
        Self::from(&LockConfig::default())
    }
}

/// Held instance lock. Dropping it releases the lock.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    pid: u32,
    acquired_at: DateTime<Utc>,
    owner: bool,
    released: bool,
}

impl LockGuard {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn lock_path(&self) -> &Path {
        &self.path
    }

    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }

    /// False for the guard handed out on same-process re-acquisition
    pub fn is_owner(&self) -> bool {
        self.owner
    }

    /// Remove the lock file if it still names this process.
    ///
    /// Idempotent. A non-owning guard, a file that is already gone, or a file
    /// now naming another process all make this a no-op.
    pub fn release(&mut self) -> Result<(), LockError> {
        if self.released || !self.owner {
            self.released = true;
            return Ok(());
        }
        self.released = true;

        match read_pid(&self.path) {
            Some(pid) if pid == self.pid => match fs::remove_file(&self.path) {
                Ok(()) => {
                    debug!("Released instance lock {}", self.path.display());
                    Ok(())
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            },
            Some(other) => {
                warn!(
                    "Lock file {} now names pid {}, leaving it in place",
                    self.path.display(),
                    other
                );
                Ok(())
            }
            None => Ok(()),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!("Failed to release instance lock: {}", e);
        }
    }
}

/// Path of the lock file for a project root
pub fn lock_path(root: &Path) -> PathBuf {
    root.join(".odin").join(LOCK_FILE_NAME)
}

/// PID currently recorded in the root's lock file, if any
pub fn current_holder(root: &Path) -> Option<u32> {
    read_pid(&lock_path(root))
}

/// Acquire the instance lock for `root`.
pub fn acquire(root: &Path, options: &LockOptions) -> Result<LockGuard, LockError> {
    let path = lock_path(root);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let me = std::process::id();
    let deadline = Instant::now() + options.acquire_timeout;
    let mut termination_attempted = false;
    let mut attempts = 0u32;
    // Live instance seen on the previous pass, if any.
    let mut waiting_on: Option<u32> = None;

    loop {
        if attempts > 0 && Instant::now() >= deadline {
            return Err(match waiting_on {
                Some(pid) => {
                    warn!(pid, "Gave up waiting for the instance lock after {:?}", options.acquire_timeout);
                    LockError::AlreadyRunning { pid }
                }
                // The file kept reappearing after every stale removal.
                None => LockError::AcquireTimeout(options.acquire_timeout),
            });
        }
        attempts += 1;
        waiting_on = None;
        match create_exclusive(&path, me) {
            Ok(()) => {
                info!(pid = me, "Acquired instance lock {}", path.display());
                return Ok(LockGuard {
                    path,
                    pid: me,
                    acquired_at: Utc::now(),
                    owner: true,
                    released: false,
                });
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e.into()),
        }

        match read_owner(&path) {
            Some(owner) if owner.pid == me => {
                debug!("Instance lock already held by this process");
                return Ok(LockGuard {
                    path,
                    pid: me,
                    acquired_at: Utc::now(),
                    owner: false,
                    released: false,
                });
            }
            Some(owner) => match probe(&owner, &options.identity_marker) {
                Holder::Dead => {
                    info!(pid = owner.pid, "Removing stale lock left by a dead process");
                    reclaim(&path, Some(&owner))?;
                    continue;
                }
                Holder::Foreign => {
                    info!(pid = owner.pid, "Removing lock naming an unrelated process");
                    reclaim(&path, Some(&owner))?;
                    continue;
                }
                Holder::Unknown => {
                    debug!(pid = owner.pid, "Lock holder cannot be identified, waiting");
                    waiting_on = Some(owner.pid);
                }
                Holder::Instance => {
                    let pid = owner.pid;
                    if options.terminate_conflicting && !termination_attempted {
                        termination_attempted = true;
                        warn!(pid, "Another instance holds the lock, asking it to stop");
                        if !terminate(pid, options.terminate_timeout) {
                            return Err(LockError::AlreadyRunning { pid });
                        }
                        // Always retry once after a successful stop.
                        attempts = 0;
                        continue;
                    }
                    waiting_on = Some(pid);
                }
            },
            None => {
                // The file is always written whole before it is linked in, so
                // unparseable content can only be left over from elsewhere.
                warn!("Lock file {} is unreadable, removing it", path.display());
                reclaim(&path, None)?;
                continue;
            }
        }

        std::thread::sleep(POLL_INTERVAL);
    }
}

/// Publish a lock file naming `pid` in one step.
///
/// The content is written to a private temp file that is then hard-linked
/// into place; the link fails with `AlreadyExists` when another lock is
/// present, and readers never observe a half-written file.
fn create_exclusive(path: &Path, pid: u32) -> io::Result<()> {
    let tmp = path.with_file_name(format!(".{}.{}.tmp", LOCK_FILE_NAME, pid));
    let owner = LockOwner {
        pid,
        start_time: process_start_time(pid),
    };
    fs::write(&tmp, owner.to_line())?;
    let result = fs::hard_link(&tmp, path);
    let _ = fs::remove_file(&tmp);
    result
}

/// What a lock file records: `"<pid> [<start time>]\n"`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct LockOwner {
    pid: u32,
    /// Clock ticks since boot (`/proc/<pid>/stat` field 22)
    start_time: Option<u64>,
}

impl LockOwner {
    fn parse(content: &str) -> Option<Self> {
        let mut fields = content.split_whitespace();
        let pid = fields.next()?.parse().ok()?;
        let start_time = match fields.next() {
            Some(raw) => Some(raw.parse().ok()?),
            None => None,
        };
        Some(Self { pid, start_time })
    }

    fn to_line(&self) -> String {
        match self.start_time {
            Some(start) => format!("{} {}\n", self.pid, start),
            None => format!("{}\n", self.pid),
        }
    }
}

fn read_owner(path: &Path) -> Option<LockOwner> {
    LockOwner::parse(&fs::read_to_string(path).ok()?)
}

fn read_pid(path: &Path) -> Option<u32> {
    read_owner(path).map(|owner| owner.pid)
}

/// Remove a stale lock file if it still records `expected` (or is still
/// unparseable when `expected` is None).
///
/// Reclaimers serialize on an exclusive flock of a separate file that is
/// never deleted. Only reclaimers delete a lock they do not own, so the
/// content re-read under that flock cannot change before the unlink.
fn reclaim(path: &Path, expected: Option<&LockOwner>) -> io::Result<()> {
    let guard_file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(path.with_file_name(RECLAIM_FILE_NAME))?;
    guard_file.lock_exclusive()?;

    let result = if read_owner(path).as_ref() == expected {
        match fs::remove_file(path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    } else {
        debug!("Lock file {} changed hands, not reclaiming", path.display());
        Ok(())
    };

    if let Err(e) = FileExt::unlock(&guard_file) {
        debug!("Failed to unlock reclaim guard: {}", e);
    }
    result
}

#[derive(Debug, PartialEq, Eq)]
enum Holder {
    Dead,
    Foreign,
    /// Alive, but `/proc` could not tell us what it is
    Unknown,
    Instance,
}

fn probe(owner: &LockOwner, marker: &str) -> Holder {
    let pid = owner.pid;
    if !is_alive(pid) {
        return Holder::Dead;
    }
    if let (Some(recorded), Some(actual)) = (owner.start_time, process_start_time(pid)) {
        if recorded != actual {
            // Same PID, different process.
            return Holder::Foreign;
        }
    }
    match program_name(pid) {
        Some(name) if name == marker => Holder::Instance,
        Some(_) => Holder::Foreign,
        None => Holder::Unknown,
    }
}

pub(crate) fn is_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    match kill(Pid::from_raw(raw), None) {
        Ok(()) | Err(Errno::EPERM) => !is_zombie(pid),
        Err(_) => false,
    }
}

fn is_zombie(pid: u32) -> bool {
    let Ok(stat) = fs::read_to_string(format!("/proc/{pid}/stat")) else {
        return false;
    };
    // Format: "pid (comm) S ..."; comm may itself contain ')'.
    stat.rsplit_once(')')
        .and_then(|(_, rest)| rest.split_whitespace().next())
        .map(|state| state == "Z")
        .unwrap_or(false)
}

/// Start time of `pid` in clock ticks since boot.
fn process_start_time(pid: u32) -> Option<u64> {
    let stat = fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    // Fields after "(comm)" start at field 3, so starttime (22) is index 19.
    stat.rsplit_once(')')?.1.split_whitespace().nth(19)?.parse().ok()
}

/// Basename of `argv[0]`. Empty for kernel threads.
fn program_name(pid: u32) -> Option<String> {
    let raw = fs::read(format!("/proc/{pid}/cmdline")).ok()?;
    let argv0 = raw.split(|b| *b == 0).next().unwrap_or_default();
    let argv0 = String::from_utf8_lossy(argv0);
    Some(
        Path::new(argv0.as_ref())
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default(),
    )
}

/// SIGTERM, wait up to `timeout`, then SIGKILL. True once the process is gone.
fn terminate(pid: u32, timeout: Duration) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    let target = Pid::from_raw(raw);

    if let Err(e) = kill(target, Signal::SIGTERM) {
        return e == Errno::ESRCH;
    }

    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if !is_alive(pid) {
            info!(pid, "Conflicting instance exited");
            return true;
        }
        std::thread::sleep(POLL_INTERVAL);
    }

    warn!(pid, "Conflicting instance ignored SIGTERM, sending SIGKILL");
    let _ = kill(target, Signal::SIGKILL);
    std::thread::sleep(KILL_GRACE);
    !is_alive(pid)
}
