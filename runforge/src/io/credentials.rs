//! Credential store seam.
//!
//! The supervisor only asks one question: is an archive key available right now? A
//! key being available when a run exits is what "private mode" means.

use std::fmt;

use parking_lot::RwLock;

use crate::io::crypto::ArchiveKey;

/// Source of the key used to seal finished runs.
pub trait CredentialStore: Send + Sync {
    fn archive_key(&self) -> Option<ArchiveKey>;
}

/// User/password pair entered by the user.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub user: String,
    pub password: String,
}

impl Credential {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
        }
    }

    pub fn derive_key(&self) -> ArchiveKey {
        ArchiveKey::derive(&self.user, &self.password)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Public mode: never archives.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCredentials;

impl CredentialStore for NoCredentials {
    fn archive_key(&self) -> Option<ArchiveKey> {
        None
    }
}

/// Credentials held for the lifetime of a session; login and logout may happen while
/// runs are in flight.
#[derive(Debug, Default)]
pub struct SessionCredentials {
    key: RwLock<Option<ArchiveKey>>,
}

impl SessionCredentials {
    pub fn logged_in(credential: &Credential) -> Self {
        Self {
            key: RwLock::new(Some(credential.derive_key())),
        }
    }

    pub fn login(&self, credential: &Credential) {
        *self.key.write() = Some(credential.derive_key());
    }

    pub fn logout(&self) {
        *self.key.write() = None;
    }
}

impl CredentialStore for SessionCredentials {
    fn archive_key(&self) -> Option<ArchiveKey> {
        self.key.read().clone()
    }
}
