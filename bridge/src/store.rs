use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};

use rapt_common::{BridgeError, Credential, Result};
use tokio::io::AsyncWriteExt;
use tracing::warn;

/// Single-slot token file. Every save replaces the previous record.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `Ok(None)` when nothing has been stored yet. A file that exists but
    /// does not hold a timestamp and a token is treated the same way so the
    /// next call simply refreshes it.
    pub async fn load(&self) -> Result<Option<Credential>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => {
                let credential = Credential::parse(&raw);
                if credential.is_none() {
                    warn!(path = %self.path.display(), "ignoring unreadable credential file");
                }
                Ok(credential)
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(self.io_error(err)),
        }
    }

    pub async fn save(&self, credential: &Credential) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|err| self.io_error(err))?;
            }
        }

        let staging = self.staging_path();
        write_private(&staging, credential.to_file_contents().as_bytes())
            .await
            .map_err(|err| self.io_error(err))?;
        tokio::fs::rename(&staging, &self.path)
            .await
            .map_err(|err| self.io_error(err))?;
        Ok(())
    }

    fn staging_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".tmp");
        PathBuf::from(name)
    }

    fn io_error(&self, source: std::io::Error) -> BridgeError {
        BridgeError::Store {
            path: self.path.display().to_string(),
            source,
        }
    }
}

async fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);

    let mut file = options.open(path).await?;
    file.write_all(contents).await?;
    file.sync_all().await?;
    Ok(())
}

#[cfg(test)]
pub(crate) fn scratch_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("rapt-bridge-{}-{name}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    dir
}
