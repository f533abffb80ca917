//! JSON file store.
//!
//! Implements [`StorePort`] over a data directory:
//!
//! | File                     | Contents                         |
//! |--------------------------|----------------------------------|
//! | `pump-config.json`       | pump table (`[PumpConfig]`)      |
//! | `ingredient-levels.json` | flat ledger rows                 |
//! | `config.json`            | optional [`DispenserConfig`]     |
//!
//! Writes go to a `.tmp` sibling first and are renamed into place, so a
//! crash mid-write leaves the previous file intact.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use log::{debug, info};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::app::ports::{StoreError, StorePort};
use crate::config::DispenserConfig;
use crate::ledger::IngredientLevel;
use crate::registry::PumpConfig;

const PUMPS_FILE: &str = "pump-config.json";
const LEVELS_FILE: &str = "ingredient-levels.json";
const CONFIG_FILE: &str = "config.json";

/// Parse a levels backup document.
pub fn parse_levels(json: &str) -> Result<Vec<IngredientLevel>, StoreError> {
    serde_json::from_str(json).map_err(|e| StoreError::Corrupted(e.to_string()))
}

pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    /// Open (and create if needed) the data directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| StoreError::Io(e.to_string()))?;
        info!("JsonFileStore: data directory {}", dir.display());
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// `config.json` if present, defaults otherwise.
    pub fn load_config(&self) -> crate::error::Result<DispenserConfig> {
        let path = self.dir.join(CONFIG_FILE);
        match fs::read_to_string(&path) {
            Ok(json) => DispenserConfig::from_json(&json),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("JsonFileStore: no {}, using defaults", CONFIG_FILE);
                Ok(DispenserConfig::default())
            }
            Err(e) => Err(crate::error::Error::config(format!("{}: {e}", path.display()))),
        }
    }

    fn read<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, StoreError> {
        let path = self.dir.join(name);
        let bytes = match fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::Io(format!("{}: {e}", path.display()))),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| StoreError::Corrupted(format!("{name}: {e}")))
    }

    fn write<T: Serialize + ?Sized>(&self, name: &str, value: &T) -> Result<(), StoreError> {
        let json =
            serde_json::to_vec_pretty(value).map_err(|e| StoreError::Corrupted(e.to_string()))?;
        let path = self.dir.join(name);
        let tmp = self.dir.join(format!("{name}.tmp"));
        let io = |e: std::io::Error| StoreError::Io(format!("{}: {e}", path.display()));

        let mut file = fs::File::create(&tmp).map_err(io)?;
        file.write_all(&json).map_err(io)?;
        file.sync_all().map_err(io)?;
        drop(file);
        fs::rename(&tmp, &path).map_err(io)?;
        debug!("JsonFileStore: wrote {} ({} bytes)", name, json.len());
        Ok(())
    }
}

impl StorePort for JsonFileStore {
    fn load_pumps(&self) -> Result<Option<Vec<PumpConfig>>, StoreError> {
        self.read(PUMPS_FILE)
    }

    fn save_pumps(&self, pumps: &[PumpConfig]) -> Result<(), StoreError> {
        self.write(PUMPS_FILE, pumps)
    }

    fn load_levels(&self) -> Result<Vec<IngredientLevel>, StoreError> {
        Ok(self.read(LEVELS_FILE)?.unwrap_or_default())
    }

    fn save_levels(&self, levels: &[IngredientLevel]) -> Result<(), StoreError> {
        self.write(LEVELS_FILE, levels)
    }
}
