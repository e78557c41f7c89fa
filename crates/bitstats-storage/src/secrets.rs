//! Named secret lookup (API token).

use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum SecretError {
    #[error("secret {name} not found")]
    NotFound { name: String },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn get_parameter(&self, name: &str, decrypt: bool) -> Result<String, SecretError>;
}

/// Map a parameter path such as `/bitly/apptoken` to `BITLY_APPTOKEN`.
pub fn parameter_env_key(name: &str) -> String {
    name.trim_start_matches('/')
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// Reads parameters from environment variables.
#[derive(Debug, Clone, Default)]
pub struct EnvSecretStore;

#[async_trait]
impl SecretStore for EnvSecretStore {
    async fn get_parameter(&self, name: &str, decrypt: bool) -> Result<String, SecretError> {
        let key = parameter_env_key(name);
        debug!(name, env_key = %key, decrypt, "looking up secret in environment");
        match std::env::var(&key) {
            Ok(value) if !value.trim().is_empty() => Ok(value.trim().to_string()),
            _ => Err(SecretError::NotFound {
                name: name.to_string(),
            }),
        }
    }
}

/// Reads parameters from files under a directory; `/bitly/apptoken` lives at
/// `<root>/bitly/apptoken`.
#[derive(Debug, Clone)]
pub struct DirSecretStore {
    root: PathBuf,
}

impl DirSecretStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl SecretStore for DirSecretStore {
    async fn get_parameter(&self, name: &str, decrypt: bool) -> Result<String, SecretError> {
        let path = self.root.join(name.trim_start_matches('/'));
        debug!(name, path = %path.display(), decrypt, "looking up secret file");
        match tokio::fs::read_to_string(&path).await {
            Ok(value) if !value.trim().is_empty() => Ok(value.trim().to_string()),
            Ok(_) => Err(SecretError::NotFound {
                name: name.to_string(),
            }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Err(SecretError::NotFound {
                name: name.to_string(),
            }),
            Err(err) => Err(anyhow::Error::new(err)
                .context(format!("reading secret file {}", path.display()))
                .into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn parameter_paths_map_to_env_keys() {
        assert_eq!(parameter_env_key("/bitly/apptoken"), "BITLY_APPTOKEN");
        assert_eq!(parameter_env_key("/svc/api-key"), "SVC_API_KEY");
    }

    #[tokio::test]
    async fn env_store_reads_and_trims() {
        std::env::set_var("BITSTATS_TEST_SECRETS_TOKEN", "  abc123\n");
        let value = EnvSecretStore
            .get_parameter("/bitstats_test/secrets-token", true)
            .await
            .expect("secret");
        assert_eq!(value, "abc123");
    }

    #[tokio::test]
    async fn env_store_missing_is_not_found() {
        let err = EnvSecretStore
            .get_parameter("/bitstats_test/definitely_unset", true)
            .await
            .unwrap_err();
        assert!(matches!(err, SecretError::NotFound { ref name } if name == "/bitstats_test/definitely_unset"));
    }

    #[tokio::test]
    async fn dir_store_reads_nested_file() {
        let dir = tempdir().expect("tempdir");
        std::fs::create_dir_all(dir.path().join("bitly")).unwrap();
        std::fs::write(dir.path().join("bitly").join("apptoken"), "tok\n").unwrap();
        let store = DirSecretStore::new(dir.path());

        assert_eq!(
            store.get_parameter("/bitly/apptoken", true).await.expect("secret"),
            "tok"
        );
        assert!(matches!(
            store.get_parameter("/bitly/other", true).await,
            Err(SecretError::NotFound { .. })
        ));
    }
}
