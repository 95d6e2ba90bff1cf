//! Durable storage for the OAuth credential triple (`auth.json`).
//!
//! Reads return the full record or nothing; writes replace the whole
//! record atomically (temp file + rename). Only the token authority
//! writes, so no locking discipline beyond single-writer is needed.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::Result;

/// The OAuth credential triple as persisted on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialRecord {
    pub refresh: String,
    pub access: String,
    /// Unix millis. Advisory only — the upstream's 401 is authoritative,
    /// so the proxy never gates on this field.
    #[serde(rename = "expiresAt")]
    pub expires_at: i64,
}

pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    pub fn new(dir: &Path) -> Self {
        Self {
            path: dir.join("auth.json"),
        }
    }

    /// Read the full record, or `None` when no credential exists on disk.
    pub fn load(&self) -> Result<Option<CredentialRecord>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let data = fs::read_to_string(&self.path)?;
        let record = serde_json::from_str(&data)?;
        Ok(Some(record))
    }

    /// Replace the whole record atomically. The token authority calls this
    /// before handing the new access token to any caller.
    pub fn save(&self, record: &CredentialRecord) -> Result<()> {
        let json = serde_json::to_string_pretty(record)?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json.as_bytes())?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&tmp, fs::Permissions::from_mode(0o600))?;
        }
        fs::rename(&tmp, &self.path)?;
        debug!(path = %self.path.display(), "credential record saved");
        Ok(())
    }

    /// Delete the credential (logout).
    pub fn clear(&self) -> Result<()> {
        if self.path.exists() {
            fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}
