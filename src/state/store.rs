//! File-backed run records and abort markers.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::PathBuf;

use sysinfo::{Pid, System};
use tracing::{debug, info, warn};

use super::RunRecord;
use crate::config::Config;
use crate::util::sanitize_name;
use crate::{Error, Result};

/// Exclusive claim on a slug, held for the whole run. The lock file is
/// removed on drop.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "could not remove run lock");
            }
        }
    }
}

fn process_alive(pid: u32) -> bool {
    let pid = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_process(pid) && system.process(pid).is_some()
}

/// Run records live in `<dir>/<slug>.json`; an abort request is the empty
/// file `<dir>/<slug>.abort`; `<dir>/<slug>.lock` holds the pid of the
/// process running the slug.
#[derive(Debug, Clone)]
pub struct RunStore {
    dir: PathBuf,
}

impl RunStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Store under `~/.baton/runs`.
    pub fn open_default() -> Result<Self> {
        Ok(Self::new(Config::runs_dir()?))
    }

    fn record_path(&self, slug: &str) -> PathBuf {
        self.dir.join(format!("{}.json", sanitize_name(slug)))
    }

    fn abort_path(&self, slug: &str) -> PathBuf {
        self.dir.join(format!("{}.abort", sanitize_name(slug)))
    }

    fn lock_path(&self, slug: &str) -> PathBuf {
        self.dir.join(format!("{}.lock", sanitize_name(slug)))
    }

    /// Claim `slug` for this process.
    ///
    /// Fails with `EnvironmentExists` while another live process, or another
    /// run in this one, holds the lock. A lock whose owner is gone is taken
    /// over.
    pub fn lock(&self, slug: &str) -> Result<RunLock> {
        fs::create_dir_all(&self.dir)?;
        let path = self.lock_path(slug);
        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    write!(file, "{}", std::process::id())?;
                    debug!(slug, "run lock taken");
                    return Ok(RunLock { path });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    let owner = fs::read_to_string(&path)
                        .ok()
                        .and_then(|s| s.trim().parse::<u32>().ok());
                    if let Some(pid) = owner.filter(|pid| process_alive(*pid)) {
                        warn!(slug, pid, "plan is already running");
                        return Err(Error::EnvironmentExists(slug.to_string()));
                    }
                    info!(slug, ?owner, "removing stale run lock");
                    match fs::remove_file(&path) {
                        Ok(()) => {}
                        Err(e) if e.kind() == ErrorKind::NotFound => {}
                        Err(e) => return Err(e.into()),
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(Error::EnvironmentExists(slug.to_string()))
    }

    pub fn load(&self, slug: &str) -> Result<Option<RunRecord>> {
        let path = self.record_path(slug);
        if !path.exists() {
            return Ok(None);
        }
        let record = serde_json::from_str(&fs::read_to_string(&path)?)?;
        Ok(Some(record))
    }

    /// Write through a temporary file so a crash never leaves half a record.
    pub fn save(&self, record: &RunRecord) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let path = self.record_path(&record.slug);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(record)?)?;
        fs::rename(&tmp, &path)?;
        debug!(slug = %record.slug, phase = %record.phase, "run record saved");
        Ok(())
    }

    pub fn request_abort(&self, slug: &str) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        fs::write(self.abort_path(slug), b"")?;
        info!(slug, "abort requested");
        Ok(())
    }

    pub fn abort_requested(&self, slug: &str) -> bool {
        self.abort_path(slug).exists()
    }

    pub fn clear_abort(&self, slug: &str) -> Result<()> {
        let path = self.abort_path(slug);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    /// Every stored record, skipping files that fail to parse.
    pub fn list(&self) -> Result<Vec<RunRecord>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut records = Vec::new();
        for entry in fs::read_dir(&self.dir)?.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match fs::read_to_string(&path)
                .map_err(crate::Error::from)
                .and_then(|s| serde_json::from_str::<RunRecord>(&s).map_err(Into::into))
            {
                Ok(record) => records.push(record),
                Err(e) => debug!(path = %path.display(), error = %e, "skipping run record"),
            }
        }
        records.sort_by(|a, b| a.slug.cmp(&b.slug));
        Ok(records)
    }
}
