//! Durable client identity.

use std::path::{Path, PathBuf};

use tracing::info;

use crate::{AppError, Result};

/// File under the state directory holding the client id.
pub const CLIENT_ID_FILE: &str = "client-id";

/// Identifier generated once per workspace and reused across restarts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    client_id: String,
}

impl ClientIdentity {
    /// Read the identity from `state_dir`, creating it on first use.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the directory or file cannot be read or
    /// written.
    pub async fn load_or_create(state_dir: &Path) -> Result<Self> {
        let path = state_dir.join(CLIENT_ID_FILE);
        match tokio::fs::read_to_string(&path).await {
            Ok(raw) if !raw.trim().is_empty() => {
                return Ok(Self {
                    client_id: raw.trim().to_owned(),
                });
            }
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(AppError::Io(format!(
                    "failed to read {}: {err}",
                    path.display()
                )))
            }
        }

        tokio::fs::create_dir_all(state_dir).await.map_err(|err| {
            AppError::Io(format!("failed to create {}: {err}", state_dir.display()))
        })?;
        let client_id = uuid::Uuid::new_v4().to_string();
        tokio::fs::write(&path, &client_id)
            .await
            .map_err(|err| AppError::Io(format!("failed to write {}: {err}", path.display())))?;
        info!(client_id, "generated new client identity");
        Ok(Self { client_id })
    }

    /// Identity with a fixed id.
    #[must_use]
    pub fn fixed(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
        }
    }

    /// The client id.
    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Location of the identity file under `state_dir`.
    #[must_use]
    pub fn path_in(state_dir: &Path) -> PathBuf {
        state_dir.join(CLIENT_ID_FILE)
    }
}
