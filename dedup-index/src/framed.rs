use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::path::Path;

use anyhow::{bail, format_err, Error};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Reads a framed message file: `{size: u32, payload, crc32: u32}`.
///
/// Returns `None` if the file does not exist.
pub fn read_framed_file<T: DeserializeOwned, P: AsRef<Path>>(path: P) -> Result<Option<T>, Error> {
    let path = path.as_ref();
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => bail!("unable to read {:?} - {}", path, err),
    };
    if data.len() < 8 {
        bail!("framed message {:?} truncated ({} bytes)", path, data.len());
    }
    let size = u32::from_le_bytes(data[0..4].try_into().unwrap()) as usize;
    if data.len() < 4 + size + 4 {
        bail!("framed message {:?} truncated", path);
    }
    let payload = &data[4..4 + size];
    let crc = u32::from_le_bytes(data[4 + size..8 + size].try_into().unwrap());

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(payload);
    if hasher.finalize() != crc {
        bail!("framed message {:?} has invalid crc", path);
    }
    let value = serde_json::from_slice(payload)
        .map_err(|err| format_err!("unable to parse {:?} - {}", path, err))?;
    Ok(Some(value))
}

/// Writes a framed message file atomically (temp file + rename + fsync).
pub fn write_framed_file<T: Serialize, P: AsRef<Path>>(path: P, value: &T) -> Result<(), Error> {
    let path = path.as_ref();
    let payload = serde_json::to_vec(value)?;

    let mut data = Vec::with_capacity(payload.len() + 8);
    data.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    data.extend_from_slice(&payload);
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&payload);
    data.extend_from_slice(&hasher.finalize().to_le_bytes());

    let mut tmp_path = path.to_owned();
    let tmp_name = match path.file_name().and_then(|n| n.to_str()) {
        Some(name) => format!("{name}.tmp"),
        None => bail!("illegal framed message path {:?}", path),
    };
    tmp_path.set_file_name(tmp_name);

    let mut file = std::fs::File::create(&tmp_path)
        .map_err(|err| format_err!("unable to create {:?} - {}", tmp_path, err))?;
    file.write_all(&data)?;
    nix::unistd::fsync(file.as_raw_fd())
        .map_err(|err| format_err!("fsync of {:?} failed - {}", tmp_path, err))?;
    std::fs::rename(&tmp_path, path)
        .map_err(|err| format_err!("unable to rename {:?} to {:?} - {}", tmp_path, path, err))?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Probe {
        name: String,
        count: u64,
    }

    #[test]
    fn framed_file_round_trip() {
        let dir = crate::testutil::TestDir::new("framed-roundtrip");
        let path = dir.path().join("probe.info");

        assert!(read_framed_file::<Probe, _>(&path).unwrap().is_none());

        let probe = Probe {
            name: "index".into(),
            count: 42,
        };
        write_framed_file(&path, &probe).unwrap();
        assert_eq!(read_framed_file::<Probe, _>(&path).unwrap().unwrap(), probe);
    }

    #[test]
    fn corrupted_frame_is_rejected() {
        let dir = crate::testutil::TestDir::new("framed-corrupt");
        let path = dir.path().join("probe.info");
        write_framed_file(
            &path,
            &Probe {
                name: "x".into(),
                count: 1,
            },
        )
        .unwrap();

        let mut data = std::fs::read(&path).unwrap();
        let len = data.len();
        data[len - 6] ^= 0x55;
        std::fs::write(&path, &data).unwrap();

        assert!(read_framed_file::<Probe, _>(&path).is_err());
    }
}
