//! Secret provider seam.
//!
//! The vault itself is an external collaborator; the runner only needs one
//! read-only operation. In deployment the secret is mounted into the
//! container filesystem (CSI / secret volume), so the production provider
//! reads files. Secrets travel as [`SecretString`] and are exposed only at
//! the header build site; nothing here caches beyond a single run.

use std::path::PathBuf;

use secrecy::SecretString;
use thiserror::Error;

/// Errors raised while fetching a secret.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SecretError {
    /// No secret exists under the requested name.
    #[error("secret {name} not found at {path}")]
    NotFound {
        /// Requested secret name.
        name: String,
        /// Path that was probed.
        path: PathBuf,
    },

    /// The secret exists but could not be read.
    #[error("failed to read secret {name}: {source}")]
    Io {
        /// Requested secret name.
        name: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The secret file is empty.
    #[error("secret {name} is empty")]
    Empty {
        /// Requested secret name.
        name: String,
    },
}

/// Read-only access to named secrets.
pub trait SecretProvider: Send + Sync {
    /// Returns the current value of the named secret.
    ///
    /// # Errors
    ///
    /// Returns [`SecretError`] when the secret is absent, unreadable or
    /// empty.
    fn get_secret(&self, name: &str) -> Result<SecretString, SecretError>;
}

/// Secret provider over a mounted secret file or directory.
///
/// When the configured URI is a directory, the secret is read from
/// `<dir>/<name>`; when it is a file, the file itself holds the secret and
/// the name is informational. Trailing whitespace (the usual trailing
/// newline of mounted secrets) is trimmed.
#[derive(Debug, Clone)]
pub struct FileSecretProvider {
    root: PathBuf,
}

impl FileSecretProvider {
    /// Creates a provider over the given path.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, name: &str) -> PathBuf {
        if self.root.is_dir() {
            self.root.join(name)
        } else {
            self.root.clone()
        }
    }
}

impl SecretProvider for FileSecretProvider {
    fn get_secret(&self, name: &str) -> Result<SecretString, SecretError> {
        let path = self.path_for(name);
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(source) if source.kind() == std::io::ErrorKind::NotFound => {
                return Err(SecretError::NotFound {
                    name: name.to_string(),
                    path,
                });
            },
            Err(source) => {
                return Err(SecretError::Io {
                    name: name.to_string(),
                    source,
                });
            },
        };

        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(SecretError::Empty {
                name: name.to_string(),
            });
        }
        Ok(SecretString::from(trimmed.to_string()))
    }
}

/// Fixed secret for tests.
#[derive(Debug, Clone)]
pub struct StaticSecretProvider {
    value: String,
}

impl StaticSecretProvider {
    /// Creates a provider that always returns `value`.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
        }
    }
}

impl SecretProvider for StaticSecretProvider {
    fn get_secret(&self, _name: &str) -> Result<SecretString, SecretError> {
        Ok(SecretString::from(self.value.clone()))
    }
}
