//! Durable storage for the access/renewal credential pair.
//!
//! Both credentials live under two well-known keys. The store is a dumb
//! key-value layer: it never decodes or validates what it holds, and it makes
//! no encryption-at-rest promise.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result};
use keyring::Entry;
use serde::{Deserialize, Serialize};

/// Key under which the access credential is stored
pub const ACCESS_KEY: &str = "access_token";

/// Key under which the renewal credential is stored
pub const RENEWAL_KEY: &str = "refresh_token";

/// Credentials file name in the cache directory
const CREDENTIALS_FILE: &str = "credentials.json";

/// An authenticated credential pair. Both halves are always present.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialPair {
    pub access: String,
    pub renewal: String,
}

impl CredentialPair {
    pub fn new(access: impl Into<String>, renewal: impl Into<String>) -> Self {
        Self {
            access: access.into(),
            renewal: renewal.into(),
        }
    }
}

// Tokens never show up in Debug output
impl std::fmt::Debug for CredentialPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialPair")
            .field("access", &super::claims::fingerprint(&self.access))
            .field("renewal", &super::claims::fingerprint(&self.renewal))
            .finish()
    }
}

/// Whatever the store currently holds, which may be a partial pair.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredCredentials {
    #[serde(rename = "access_token", default, skip_serializing_if = "Option::is_none")]
    pub access: Option<String>,
    #[serde(rename = "refresh_token", default, skip_serializing_if = "Option::is_none")]
    pub renewal: Option<String>,
}

impl StoredCredentials {
    pub fn is_empty(&self) -> bool {
        self.access.is_none() && self.renewal.is_none()
    }

    /// The complete pair, if both halves are present
    pub fn pair(&self) -> Option<CredentialPair> {
        match (&self.access, &self.renewal) {
            (Some(access), Some(renewal)) => Some(CredentialPair::new(access, renewal)),
            _ => None,
        }
    }
}

impl From<&CredentialPair> for StoredCredentials {
    fn from(pair: &CredentialPair) -> Self {
        Self {
            access: Some(pair.access.clone()),
            renewal: Some(pair.renewal.clone()),
        }
    }
}

/// Synchronous persistence for the credential pair.
pub trait CredentialStore: Send + Sync {
    fn load(&self) -> Result<StoredCredentials>;
    fn save(&self, pair: &CredentialPair) -> Result<()>;
    fn clear(&self) -> Result<()>;
}

/// JSON file holding both keys, written with owner-only permissions.
pub struct FileCredentialStore {
    path: PathBuf,
}

impl FileCredentialStore {
    /// Store credentials in `credentials.json` under `dir`
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            path: dir.into().join(CREDENTIALS_FILE),
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

impl CredentialStore for FileCredentialStore {
    fn load(&self) -> Result<StoredCredentials> {
        if !self.path.exists() {
            return Ok(StoredCredentials::default());
        }
        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read credentials from {}", self.path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse credentials from {}", self.path.display()))
    }

    fn save(&self, pair: &CredentialPair) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }
        let contents = serde_json::to_string_pretty(&StoredCredentials::from(pair))
            .context("Failed to serialize credentials")?;

        let mut options = OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options
            .open(&self.path)
            .with_context(|| format!("Failed to open {} for writing", self.path.display()))?;
        file.write_all(contents.as_bytes())
            .with_context(|| format!("Failed to write to {}", self.path.display()))?;
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        if self.path.exists() {
            fs::remove_file(&self.path)
                .with_context(|| format!("Failed to remove {}", self.path.display()))?;
        }
        Ok(())
    }
}

/// OS keychain storage, one keyring entry per well-known key.
pub struct KeyringCredentialStore {
    service: String,
}

impl KeyringCredentialStore {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(&self, key: &str) -> Result<Entry> {
        Entry::new(&self.service, key).context("Failed to create keyring entry")
    }

    fn read(&self, key: &str) -> Result<Option<String>> {
        match self.entry(key)?.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e).context("Failed to retrieve credential from keychain"),
        }
    }

    fn delete(&self, key: &str) -> Result<()> {
        match self.entry(key)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e).context("Failed to delete credential from keychain"),
        }
    }
}

impl CredentialStore for KeyringCredentialStore {
    fn load(&self) -> Result<StoredCredentials> {
        Ok(StoredCredentials {
            access: self.read(ACCESS_KEY)?,
            renewal: self.read(RENEWAL_KEY)?,
        })
    }

    fn save(&self, pair: &CredentialPair) -> Result<()> {
        self.entry(RENEWAL_KEY)?
            .set_password(&pair.renewal)
            .context("Failed to store renewal credential in keychain")?;
        self.entry(ACCESS_KEY)?
            .set_password(&pair.access)
            .context("Failed to store access credential in keychain")?;
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        self.delete(ACCESS_KEY)?;
        self.delete(RENEWAL_KEY)
    }
}

/// Process-local store. Does not survive a restart.
#[derive(Default)]
pub struct MemoryCredentialStore {
    inner: Mutex<StoredCredentials>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with arbitrary (possibly partial) contents
    pub fn with_contents(contents: StoredCredentials) -> Self {
        Self {
            inner: Mutex::new(contents),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoredCredentials> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn load(&self) -> Result<StoredCredentials> {
        Ok(self.lock().clone())
    }

    fn save(&self, pair: &CredentialPair) -> Result<()> {
        *self.lock() = StoredCredentials::from(pair);
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        *self.lock() = StoredCredentials::default();
        Ok(())
    }
}
