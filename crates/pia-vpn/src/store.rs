//! Session persistence
//!
//! One JSON file per session name under a cache directory. Writes go to a
//! temporary file that is renamed over the old record, so a crash leaves
//! either the previous session or the new one, never half of each.

use crate::session::Session;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Cache files hold the private key and the token
#[cfg(unix)]
const CACHE_FILE_MODE: u32 = 0o660;

/// Session store errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("No saved session named {name}")]
    NotFound { name: String },

    #[error("Saved session {name} is corrupt: {reason}")]
    Corrupt { name: String, reason: String },

    #[error("Invalid session name {0:?}: must be a plain file name")]
    InvalidName(String),

    #[error("Session store I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Directory of persisted sessions
#[derive(Debug, Clone)]
pub struct SessionStore {
    dir: PathBuf,
}

impl SessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File holding the session called `name`
    ///
    /// The name doubles as the interface name and comes from the command
    /// line, so it must stay a single component inside the store directory.
    pub fn path_for(&self, name: &str) -> Result<PathBuf, StoreError> {
        Self::check_name(name)?;
        Ok(self.dir.join(format!("{name}.json")))
    }

    /// Reject names that are empty, `.`/`..`, or contain a path separator
    pub fn check_name(name: &str) -> Result<(), StoreError> {
        let plain = !name.is_empty()
            && name != "."
            && name != ".."
            && !name.contains(['/', '\\', '\0']);
        if plain {
            Ok(())
        } else {
            Err(StoreError::InvalidName(name.to_string()))
        }
    }

    /// Restore a session; a missing record and an unreadable one are
    /// reported differently
    pub async fn load(&self, name: &str) -> Result<Session, StoreError> {
        let path = self.path_for(name)?;
        let data = match fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound {
                    name: name.to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        };

        let session: Session = serde_json::from_slice(&data).map_err(|e| StoreError::Corrupt {
            name: name.to_string(),
            reason: e.to_string(),
        })?;
        debug!("Loaded session {} from {}", name, path.display());
        Ok(session)
    }

    /// Load a session if one exists; corruption is still an error
    pub async fn load_optional(&self, name: &str) -> Result<Option<Session>, StoreError> {
        match self.load(name).await {
            Ok(session) => Ok(Some(session)),
            Err(StoreError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Persist `session` under its name, replacing any previous record
    pub async fn save(&self, session: &Session) -> Result<(), StoreError> {
        let path = self.path_for(&session.name)?;
        let data = serde_json::to_vec_pretty(session).map_err(io::Error::other)?;
        fs::create_dir_all(&self.dir).await?;

        let tmp = self.dir.join(format!("{}.json.tmp", session.name));
        match write_replace(&tmp, &path, &data).await {
            Ok(()) => {
                debug!("Saved session {} to {}", session.name, path.display());
                Ok(())
            }
            Err(e) => {
                let _ = fs::remove_file(&tmp).await;
                Err(e.into())
            }
        }
    }
}

async fn write_replace(tmp: &Path, path: &Path, data: &[u8]) -> io::Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(CACHE_FILE_MODE);

    let mut file = options.open(tmp).await?;
    file.write_all(data).await?;
    file.sync_all().await?;
    drop(file);

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(tmp, std::fs::Permissions::from_mode(CACHE_FILE_MODE)).await?;
    }

    fs::rename(tmp, path).await
}
