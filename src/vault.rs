//! Secret storage
//!
//! Provisioned resources may come with credentials. They are kept in a vault
//! and referenced by key from the transfer entity, never stored inline.

use dashmap::DashMap;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum VaultError {
    #[error("Secret not found: {0}")]
    NotFound(String),

    #[error("Vault unavailable: {0}")]
    Unavailable(String),
}

pub trait Vault: Send + Sync {
    fn resolve_secret(&self, key: &str) -> Result<Option<String>, VaultError>;

    fn store_secret(&self, key: &str, value: &str) -> Result<(), VaultError>;

    /// Deleting a missing secret is `NotFound`
    fn delete_secret(&self, key: &str) -> Result<(), VaultError>;
}

#[derive(Debug, Default)]
pub struct InMemoryVault {
    secrets: DashMap<String, String>,
}

impl InMemoryVault {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.secrets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty()
    }
}

impl Vault for InMemoryVault {
    fn resolve_secret(&self, key: &str) -> Result<Option<String>, VaultError> {
        Ok(self.secrets.get(key).map(|v| v.value().clone()))
    }

    fn store_secret(&self, key: &str, value: &str) -> Result<(), VaultError> {
        self.secrets.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete_secret(&self, key: &str) -> Result<(), VaultError> {
        self.secrets
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| VaultError::NotFound(key.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_resolve_delete() {
        let vault = InMemoryVault::new();
        vault.store_secret("k", "s3cr3t").unwrap();
        assert_eq!(vault.resolve_secret("k").unwrap().as_deref(), Some("s3cr3t"));

        vault.delete_secret("k").unwrap();
        assert_eq!(vault.resolve_secret("k").unwrap(), None);
        assert_eq!(
            vault.delete_secret("k"),
            Err(VaultError::NotFound("k".into()))
        );
        assert!(vault.is_empty());
    }
}
