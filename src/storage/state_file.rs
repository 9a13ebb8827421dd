//! File-backed signing watermark.
//!
//! The watermark is cached in memory and written through on every update.
//! A write goes to a temporary file that is synced and renamed over the
//! previous one, so a crash leaves either the old or the new watermark on
//! disk, never a torn one.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{KmsError, KmsResult};
use crate::signing::guard;
use crate::signing::types::SigningState;

/// Durable store for the last signed vote or proposal.
#[derive(Debug)]
pub struct SigningStateStore {
    path: PathBuf,
    state: SigningState,
}

impl SigningStateStore {
    /// Open the watermark at `path`.
    ///
    /// A missing file is a first run: the zero watermark is written so the
    /// file exists from then on. A file that exists but cannot be parsed is
    /// an error; no watermark is guessed.
    pub fn open(path: &Path) -> KmsResult<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|e| {
                KmsError::Storage(format!("failed to create {}: {e}", parent.display()))
            })?;
        }

        let state = match fs::read_to_string(path) {
            Ok(contents) => serde_json::from_str::<SigningState>(&contents).map_err(|e| {
                KmsError::StateCorrupt(format!("{}: {e}", path.display()))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let state = SigningState::default();
                persist(path, &state)?;
                tracing::info!(path = %path.display(), "Initialized empty signing state");
                state
            }
            Err(e) => {
                return Err(KmsError::Storage(format!(
                    "failed to read {}: {e}",
                    path.display()
                )));
            }
        };

        tracing::info!(
            path = %path.display(),
            chain_id = %state.chain_id,
            height = state.height,
            round = state.round,
            msg_type = %state.msg_type,
            "Opened signing state"
        );

        Ok(Self {
            path: path.to_path_buf(),
            state,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current watermark.
    pub fn read(&self) -> SigningState {
        self.state.clone()
    }

    /// Borrow the current watermark without cloning.
    pub fn current(&self) -> &SigningState {
        &self.state
    }

    /// Durably replace the watermark.
    ///
    /// Refuses a state that does not move strictly forward. The in-memory
    /// copy is only updated once the file has been synced and renamed.
    pub fn write(&mut self, state: SigningState) -> KmsResult<()> {
        guard::check(&self.state, &state.hrs()).into_result()?;

        persist(&self.path, &state)?;
        self.state = state;

        tracing::debug!(
            height = self.state.height,
            round = self.state.round,
            msg_type = %self.state.msg_type,
            "Persisted signing state"
        );
        Ok(())
    }
}

fn storage_err(context: &str, path: &Path, err: impl std::fmt::Display) -> KmsError {
    KmsError::Storage(format!("{context} {}: {err}", path.display()))
}

/// Write to a sibling temp file, sync, then rename over `path`.
fn persist(path: &Path, state: &SigningState) -> KmsResult<()> {
    let json = serde_json::to_vec_pretty(state)
        .map_err(|e| KmsError::Storage(format!("failed to serialize signing state: {e}")))?;

    let temp_path = path.with_extension("tmp");

    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options
        .open(&temp_path)
        .map_err(|e| storage_err("failed to create", &temp_path, e))?;
    file.write_all(&json)
        .map_err(|e| storage_err("failed to write", &temp_path, e))?;
    file.sync_all()
        .map_err(|e| storage_err("failed to sync", &temp_path, e))?;
    drop(file);

    fs::rename(&temp_path, path).map_err(|e| storage_err("failed to replace", path, e))?;

    // Make the rename itself durable.
    #[cfg(unix)]
    if let Some(parent) = path.parent() {
        let dir = if parent.as_os_str().is_empty() {
            Path::new(".")
        } else {
            parent
        };
        File::open(dir)
            .and_then(|d| d.sync_all())
            .map_err(|e| storage_err("failed to sync directory", dir, e))?;
    }

    Ok(())
}
