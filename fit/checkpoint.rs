//! # Checkpoint Store
//!
//! Persists fitted-model handles as human-readable TOML snapshots, one file
//! per (family, sparse flag, test tag, feature, variant) key. Snapshots are
//! written after a winning free-optimization fit and read back for post-hoc
//! prediction.

use crate::family::Family;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use thiserror::Error;

/// Identity of one persisted model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointKey<'a> {
    pub family: Family,
    pub sparse: bool,
    /// True for the three-model (two-samples) test.
    pub paired_series: bool,
    pub feature: &'a str,
    pub variant: usize,
}

impl fmt::Display for CheckpointKey<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_", self.family.name())?;
        if self.sparse {
            write!(f, "sparse_")?;
        }
        if self.paired_series {
            write!(f, "tst_")?;
        }
        write!(f, "{}_model_{}", self.feature, self.variant)
    }
}

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("Failed to read or write checkpoint file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML checkpoint file: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize model to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
}

/// A directory of model snapshots.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    /// Opens (creating if needed) the store directory.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, CheckpointError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, key: &CheckpointKey<'_>) -> PathBuf {
        self.dir.join(format!("{key}.toml"))
    }

    pub fn save<H: Serialize>(
        &self,
        key: &CheckpointKey<'_>,
        handle: &H,
    ) -> Result<(), CheckpointError> {
        let toml_string = toml::to_string_pretty(handle)?;
        let mut file = fs::File::create(self.path_for(key))?;
        file.write_all(toml_string.as_bytes())?;
        Ok(())
    }

    pub fn load<H: DeserializeOwned>(&self, key: &CheckpointKey<'_>) -> Result<H, CheckpointError> {
        let toml_string = fs::read_to_string(self.path_for(key))?;
        Ok(toml::from_str(&toml_string)?)
    }
}
