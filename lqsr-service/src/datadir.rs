// (c) 2020-2022 ZeroTier, Inc. -- currently propritery pending actual release and licensing. See LICENSE.md.
//
// Data directory: on-disk home for this node's persistent configuration.
// Grounded on `DataDir::open`/`save_config` (full file read), adapted from
// the teacher's async/`tokio::fs` implementation to plain synchronous
// `std::fs`, since `lqsr-core`'s own concurrency model is synchronous and
// the service harness has no other async dependency pulling in a runtime.
// The atomic-write contract (`temp file + rename`, so a crash mid-write
// cannot corrupt the previous good config) is preserved.

use std::path::{Path, PathBuf};

use parking_lot::RwLock;

use crate::localconfig::LocalConfig;

const CONFIG_FILENAME: &str = "local.conf";

pub struct DataDir {
    pub base_path: PathBuf,
    config: RwLock<LocalConfig>,
}

impl DataDir {
    pub fn open<P: AsRef<Path>>(path: P) -> std::io::Result<Self> {
        let base_path = path.as_ref().to_path_buf();
        if !base_path.is_dir() {
            std::fs::create_dir_all(&base_path)?;
        }

        let config_path = base_path.join(CONFIG_FILENAME);
        let config = if config_path.is_file() {
            let data = std::fs::read_to_string(&config_path)?;
            LocalConfig::from_toml_str(&data).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?
        } else {
            LocalConfig::default()
        };

        Ok(Self { base_path, config: RwLock::new(config) })
    }

    pub fn config(&self) -> LocalConfig {
        self.config.read().clone()
    }

    /// Persist a modified configuration, replacing the in-memory copy only
    /// once the write has landed. Writes to a sibling temp file and renames
    /// over the target so a crash mid-write never leaves a half-written
    /// `local.conf` behind.
    pub fn save_config(&self, modified: LocalConfig) -> std::io::Result<()> {
        let data = modified.to_toml_string().map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let final_path = self.base_path.join(CONFIG_FILENAME);
        let tmp_path = self.base_path.join(format!("{}.tmp", CONFIG_FILENAME));
        std::fs::write(&tmp_path, data.as_bytes())?;
        std::fs::rename(&tmp_path, &final_path)?;
        *self.config.write() = modified;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_fresh_directory_with_default_config() {
        let dir = tempfile::tempdir().unwrap();
        let dd = DataDir::open(dir.path()).unwrap();
        assert_eq!(dd.config(), LocalConfig::default());
    }

    #[test]
    fn save_and_reopen_round_trips_config() {
        let dir = tempfile::tempdir().unwrap();
        let dd = DataDir::open(dir.path()).unwrap();
        let mut cfg = dd.config();
        cfg.route_flap_damping = 7;
        dd.save_config(cfg.clone()).unwrap();

        let reopened = DataDir::open(dir.path()).unwrap();
        assert_eq!(reopened.config(), cfg);
    }
}
