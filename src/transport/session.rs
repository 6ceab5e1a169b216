//! Shared ssh session table and the elevation secret container.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::endpoint::url::SshLocation;

use super::ssh::{SshConfig, SshSession};

/// One multiplexed session per (host, user, port, identity); all
/// destination workers targeting the same host borrow the same session.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub host: String,
    pub user: Option<String>,
    pub port: Option<u16>,
    pub identity: Option<PathBuf>,
}

impl SessionKey {
    pub fn new(location: &SshLocation, identity: Option<&PathBuf>) -> Self {
        Self {
            host: location.host.clone(),
            user: location.user.clone(),
            port: location.port,
            identity: identity.cloned(),
        }
    }
}

#[derive(Debug, Default)]
pub struct SessionTable {
    inner: Mutex<HashMap<SessionKey, Arc<SshSession>>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&self, config: SshConfig) -> Arc<SshSession> {
        let key = SessionKey::new(&config.location, config.identity.as_ref());
        let mut table = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        table
            .entry(key)
            .or_insert_with(|| Arc::new(SshSession::new(config)))
            .clone()
    }

    /// Stop every master. Secrets die with their sessions.
    pub fn shutdown(&self) {
        let table = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        for session in table.values() {
            session.stop();
        }
    }
}

impl Drop for SessionTable {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// An elevation secret. Never logged, best-effort zeroed on drop.
#[derive(Clone)]
pub struct Secret(Arc<SecretInner>);

struct SecretInner(Mutex<Vec<u8>>);

impl Secret {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(Arc::new(SecretInner(Mutex::new(bytes))))
    }

    pub fn bytes(&self) -> SecretBytes<'_> {
        SecretBytes(self.0.0.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Secret(…)")
    }
}

impl Drop for SecretInner {
    fn drop(&mut self) {
        if let Ok(mut bytes) = self.0.lock() {
            for b in bytes.iter_mut() {
                *b = 0;
            }
        }
    }
}

pub struct SecretBytes<'a>(std::sync::MutexGuard<'a, Vec<u8>>);

impl std::ops::Deref for SecretBytes<'_> {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_key_distinguishes_identity() {
        let location = SshLocation {
            user: None,
            host: "nas".to_string(),
            port: None,
            path: PathBuf::from("/srv"),
        };
        let a = SessionKey::new(&location, None);
        let b = SessionKey::new(&location, Some(&PathBuf::from("/home/u/.ssh/id_ed25519")));
        assert_ne!(a, b);
    }

    #[test]
    fn table_reuses_sessions_per_key() {
        let table = SessionTable::new();
        let location = SshLocation {
            user: Some("backup".to_string()),
            host: "nas".to_string(),
            port: None,
            path: PathBuf::from("/srv"),
        };
        let a = table.get_or_create(SshConfig::new(location.clone()));
        let b = table.get_or_create(SshConfig::new(location));
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn secret_exposes_bytes() {
        let secret = Secret::new(b"hunter2".to_vec());
        assert_eq!(&*secret.bytes(), b"hunter2");
    }
}
