use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use anyhow::{bail, format_err, Error};

/// A data file accessed with positional reads and writes.
///
/// All accesses are full-buffer: short transfers are retried until the
/// buffer is complete or the kernel reports an error.
pub struct DataFile {
    path: PathBuf,
    file: File,
}

impl DataFile {
    pub fn open<P: AsRef<Path>>(path: P, create: bool) -> Result<Self, Error> {
        let path = path.as_ref().to_owned();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .open(&path)
            .map_err(|err| format_err!("unable to open data file {:?} - {}", path, err))?;
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> Result<u64, Error> {
        let stat = nix::sys::stat::fstat(self.file.as_raw_fd())
            .map_err(|err| format_err!("fstat failed for {:?} - {}", self.path, err))?;
        Ok(stat.st_size as u64)
    }

    /// Grows the file to `size` bytes, allocating backing storage.
    pub fn allocate(&self, size: u64) -> Result<(), Error> {
        nix::fcntl::fallocate(
            self.file.as_raw_fd(),
            nix::fcntl::FallocateFlags::empty(),
            0,
            size as i64,
        )
        .map_err(|err| format_err!("fallocate of {:?} to {} failed - {}", self.path, size, err))?;
        Ok(())
    }

    pub fn truncate(&self, size: u64) -> Result<(), Error> {
        nix::unistd::ftruncate(self.file.as_raw_fd(), size as i64)
            .map_err(|err| format_err!("truncate of {:?} to {} failed - {}", self.path, size, err))
    }

    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), Error> {
        let mut done = 0;
        while done < buf.len() {
            let n = nix::sys::uio::pread(
                self.file.as_raw_fd(),
                &mut buf[done..],
                (offset + done as u64) as i64,
            )
            .map_err(|err| {
                format_err!("read of {:?} at offset {} failed - {}", self.path, offset, err)
            })?;
            if n == 0 {
                bail!(
                    "short read of {:?} at offset {} ({} of {} bytes)",
                    self.path,
                    offset,
                    done,
                    buf.len()
                );
            }
            done += n;
        }
        Ok(())
    }

    pub fn write_at(&self, offset: u64, buf: &[u8]) -> Result<(), Error> {
        let mut done = 0;
        while done < buf.len() {
            let n = nix::sys::uio::pwrite(
                self.file.as_raw_fd(),
                &buf[done..],
                (offset + done as u64) as i64,
            )
            .map_err(|err| {
                format_err!("write of {:?} at offset {} failed - {}", self.path, offset, err)
            })?;
            if n == 0 {
                bail!("short write of {:?} at offset {}", self.path, offset);
            }
            done += n;
        }
        Ok(())
    }

    pub fn sync(&self) -> Result<(), Error> {
        nix::unistd::fsync(self.file.as_raw_fd())
            .map_err(|err| format_err!("fsync of {:?} failed - {}", self.path, err))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn positional_read_write() {
        let dir = crate::testutil::TestDir::new("file-positional");
        let file = DataFile::open(dir.path().join("data"), true).unwrap();
        file.allocate(8192).unwrap();
        assert_eq!(file.size().unwrap(), 8192);

        file.write_at(4096, b"hello").unwrap();
        let mut buf = [0u8; 5];
        file.read_at(4096, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");

        // untouched regions read as zero
        let mut buf = [0xffu8; 16];
        file.read_at(0, &mut buf).unwrap();
        assert_eq!(buf, [0u8; 16]);
    }

    #[test]
    fn read_past_end_fails() {
        let dir = crate::testutil::TestDir::new("file-short-read");
        let file = DataFile::open(dir.path().join("data"), true).unwrap();
        file.allocate(100).unwrap();
        let mut buf = [0u8; 64];
        assert!(file.read_at(90, &mut buf).is_err());
    }
}
