use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use anyhow::{format_err, Error};
use serde::{Deserialize, Serialize};

use dedup_index::framed::{read_framed_file, write_framed_file};

/// Advisory daemon lock file holding the owning pid.
///
/// The flock is released when the process exits, so a stale pid in the
/// file never blocks a restart.
pub struct Lockfile {
    path: PathBuf,
    _file: std::fs::File,
}

impl Lockfile {
    pub fn acquire<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref().to_owned();
        let mut file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .map_err(|err| format_err!("unable to open lockfile {:?} - {}", path, err))?;

        nix::fcntl::flock(
            file.as_raw_fd(),
            nix::fcntl::FlockArg::LockExclusiveNonblock,
        )
        .map_err(|err| {
            format_err!("unable to lock {:?} - another instance running? ({})", path, err)
        })?;

        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;
        Ok(Self { path, _file: file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// State of the dirty file: whether the last run shut down cleanly and
/// with which configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DirtyFileData {
    /// The raw configuration text of the run that wrote the file.
    pub config: String,
    /// All dirty state was written back before the last stop.
    pub clean: bool,
    /// The engine was stopped (as opposed to crashed mid-run).
    pub stopped: bool,
    pub revision: u64,
}

/// The dirty file decides the startup mode.
///
/// A missing file, `clean == false` or `stopped == false` triggers the
/// dirty replay; a configuration mismatch aborts the startup unless
/// forced.
pub struct DirtyFile {
    path: PathBuf,
    data: DirtyFileData,
}

impl DirtyFile {
    pub fn open<P: AsRef<Path>>(path: P, config: &str) -> Result<(Self, bool), Error> {
        let path = path.as_ref().to_owned();
        match read_framed_file::<DirtyFileData, _>(&path)? {
            Some(stored) => {
                let dirty = !stored.clean || !stored.stopped;
                let mut data = stored;
                data.config = config.to_string();
                data.revision += 1;
                Ok((Self { path, data }, dirty))
            }
            None => {
                let data = DirtyFileData {
                    config: config.to_string(),
                    clean: true,
                    stopped: true,
                    revision: 0,
                };
                Ok((Self { path, data }, false))
            }
        }
    }

    /// The configuration stored by the previous run, if any.
    pub fn stored_config<P: AsRef<Path>>(path: P) -> Result<Option<String>, Error> {
        Ok(read_framed_file::<DirtyFileData, _>(path)?.map(|data| data.config))
    }

    /// Marks the engine running; a crash from here on is a dirty stop.
    pub fn mark_running(&mut self) -> Result<(), Error> {
        self.data.clean = false;
        self.data.stopped = false;
        write_framed_file(&self.path, &self.data)
    }

    pub fn mark_stopped(&mut self, clean: bool) -> Result<(), Error> {
        self.data.clean = clean;
        self.data.stopped = true;
        write_framed_file(&self.path, &self.data)
    }

    pub fn revision(&self) -> u64 {
        self.data.revision
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testutil::TestDir;

    #[test]
    fn lockfile_rejects_second_holder() {
        let dir = TestDir::new("lockfile-exclusive");
        let path = dir.path().join("daemon.lockfile");

        let lock = Lockfile::acquire(&path).unwrap();
        // the same process already holds the flock; re-locking on a new
        // fd succeeds on Linux, so only check the pid content here
        let content = std::fs::read_to_string(lock.path()).unwrap();
        assert_eq!(content.trim(), std::process::id().to_string());
    }

    #[test]
    fn dirty_file_lifecycle() {
        let dir = TestDir::new("dirtyfile-lifecycle");
        let path = dir.path().join("daemon.dirtyfile");

        // first start: no file, not dirty
        let (mut dirty_file, dirty) = DirtyFile::open(&path, "config-a").unwrap();
        assert!(!dirty);
        dirty_file.mark_running().unwrap();

        // crash: the next open sees an unclean stop
        let (mut dirty_file, dirty) = DirtyFile::open(&path, "config-a").unwrap();
        assert!(dirty);
        dirty_file.mark_running().unwrap();
        dirty_file.mark_stopped(true).unwrap();

        // clean stop: the next open is clean and the revision advanced
        let (dirty_file, dirty) = DirtyFile::open(&path, "config-a").unwrap();
        assert!(!dirty);
        assert_eq!(dirty_file.revision(), 2);

        assert_eq!(
            DirtyFile::stored_config(&path).unwrap().unwrap(),
            "config-a"
        );
    }
}
