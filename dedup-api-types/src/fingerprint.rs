use std::fmt::{self, Display};

use anyhow::{bail, Error};
use serde::{Deserialize, Serialize};

/// Size of a chunk fingerprint in bytes (SHA-1).
pub const FINGERPRINT_SIZE: usize = 20;

/// 20-byte chunk fingerprint, usually calculated with SHA-1.
///
/// Equality of fingerprints defines chunk identity.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize)]
#[serde(transparent)]
pub struct Fingerprint {
    #[serde(with = "bytes_as_hex")]
    bytes: [u8; FINGERPRINT_SIZE],
}

impl Fingerprint {
    pub fn new(bytes: [u8; FINGERPRINT_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn bytes(&self) -> &[u8; FINGERPRINT_SIZE] {
        &self.bytes
    }

    pub fn from_slice(data: &[u8]) -> Result<Self, Error> {
        if data.len() != FINGERPRINT_SIZE {
            bail!("illegal fingerprint size {}", data.len());
        }
        let mut bytes = [0u8; FINGERPRINT_SIZE];
        bytes.copy_from_slice(data);
        Ok(Self { bytes })
    }
}

impl Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.bytes))
    }
}

impl std::str::FromStr for Fingerprint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        let data = hex::decode(s)?;
        Self::from_slice(&data)
    }
}

impl AsRef<[u8]> for Fingerprint {
    fn as_ref(&self) -> &[u8] {
        &self.bytes
    }
}

mod bytes_as_hex {
    use serde::{Deserialize, Deserializer, Serializer};

    use super::FINGERPRINT_SIZE;

    pub fn serialize<S: Serializer>(
        bytes: &[u8; FINGERPRINT_SIZE],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<[u8; FINGERPRINT_SIZE], D::Error> {
        let s = String::deserialize(deserializer)?;
        let data = hex::decode(s).map_err(serde::de::Error::custom)?;
        data.try_into()
            .map_err(|_| serde::de::Error::custom("illegal fingerprint size"))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fingerprint_hex_round_trip() {
        let fp = Fingerprint::new([0xab; FINGERPRINT_SIZE]);
        let s = fp.to_string();
        assert_eq!(s.len(), 2 * FINGERPRINT_SIZE);
        assert_eq!(s.parse::<Fingerprint>().unwrap(), fp);
    }

    #[test]
    fn fingerprint_rejects_bad_sizes() {
        assert!(Fingerprint::from_slice(&[1, 2, 3]).is_err());
        assert!("abcd".parse::<Fingerprint>().is_err());
    }
}
