use std::fs::{create_dir_all, read_to_string, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use twitch_core::{AuthGrant, Result, TwitchError};

const TOKEN_FILE: &str = "token.json";
const APP_DIR: &str = "twitchify";

/// JSON file holding the last grant between runs.
#[derive(Debug, Clone)]
pub struct TokenStore {
    path: PathBuf,
}

impl TokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<config dir>/twitchify/token.json`
    pub fn default_location() -> Result<Self> {
        let base = dirs::config_dir()
            .ok_or_else(|| TwitchError::Storage("no config directory on this platform".into()))?;
        Ok(Self::new(base.join(APP_DIR).join(TOKEN_FILE)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `None` when no grant was stored. A corrupt file is treated as missing.
    pub fn load(&self) -> Result<Option<AuthGrant>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = read_to_string(&self.path)?;
        match serde_json::from_str::<AuthGrant>(&content) {
            Ok(grant) => Ok(Some(grant)),
            Err(e) => {
                warn!("Ignoring unreadable token file {}: {}", self.path.display(), e);
                Ok(None)
            }
        }
    }

    pub fn save(&self, grant: &AuthGrant) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(grant)?;
        let mut file = File::create(&self.path)?;
        file.write_all(content.as_bytes())?;
        debug!("Saved token to {}", self.path.display());
        Ok(())
    }

    pub fn clear(&self) -> Result<()> {
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;

    #[test]
    fn grant_round_trip_through_disk() {
        let dir = tempdir().expect("tempdir");
        let store = TokenStore::new(dir.path().join("nested").join(TOKEN_FILE));

        let mut grant = AuthGrant::new("access", Duration::from_secs(3600))
            .with_refresh_token("refresh")
            .with_scopes(["user:read:chat"]);
        grant.user_id = Some("42".into());

        store.save(&grant).expect("save");
        let loaded = store.load().expect("load").expect("present");

        assert_eq!(loaded, grant);
    }

    #[test]
    fn missing_and_corrupt_files_load_as_none() {
        let dir = tempdir().expect("tempdir");
        let store = TokenStore::new(dir.path().join(TOKEN_FILE));
        assert!(store.load().expect("load").is_none());

        std::fs::write(store.path(), "{not json").expect("write");
        assert!(store.load().expect("load").is_none());

        store.clear().expect("clear");
        assert!(!store.path().exists());
    }
}
