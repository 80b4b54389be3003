//! Durable credential bundle and its remote bootstrap source.
//!
//! The bundle is opaque to us: whatever the backend hands over is written
//! byte for byte and read back the same way. Writes go to a temp file in the
//! same directory and are renamed into place, so a restarting process never
//! observes a half-written bundle.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::io::AsyncWriteExt;

use crate::error::{AuthError, PersistenceError};

/// File name of the bundle inside the session directory.
pub const CREDENTIALS_FILE: &str = "creds.json";

/// Where session ids are resolved when no template is configured.
pub const DEFAULT_URL_TEMPLATE: &str = "https://mega.nz/file/{id}";

/// Serialized authentication state. Never logged.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials(Vec<u8>);

impl Credentials {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Credentials(<{} bytes>)", self.0.len())
    }
}

/// Resolves a session id to a credential blob over HTTP.
#[derive(Debug, Clone)]
pub struct RemoteSource {
    http: reqwest::Client,
    url_template: String,
}

impl RemoteSource {
    /// `url_template` must contain `{id}`; [`crate::config::BotConfig`]
    /// validates that before we get here.
    pub fn new(url_template: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            url_template: url_template.into(),
        }
    }

    pub fn url_for(&self, source_id: &str) -> String {
        self.url_template.replace("{id}", source_id)
    }

    pub async fn fetch(&self, source_id: &str) -> Result<Vec<u8>, AuthError> {
        let fail = |reason: String| AuthError::Fetch {
            source_id: source_id.to_string(),
            reason,
        };

        let url = self.url_for(source_id);
        tracing::debug!(%url, "Fetching remote session");
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| fail(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(fail(format!("HTTP {status}")));
        }

        let body = resp.bytes().await.map_err(|e| fail(e.to_string()))?;
        if body.is_empty() {
            return Err(fail("empty response body".to_string()));
        }
        Ok(body.to_vec())
    }
}

impl Default for RemoteSource {
    fn default() -> Self {
        Self::new(DEFAULT_URL_TEMPLATE)
    }
}

/// Owner of the on-disk credential bundle.
#[derive(Debug)]
pub struct SessionStore {
    dir: PathBuf,
    remote: RemoteSource,
}

impl SessionStore {
    /// Open the store, creating `dir` if it does not exist yet.
    pub async fn open(dir: impl Into<PathBuf>, remote: RemoteSource) -> Result<Self, PersistenceError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| PersistenceError::new("create directory", &dir, e))?;
        Ok(Self { dir, remote })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn credentials_path(&self) -> PathBuf {
        self.dir.join(CREDENTIALS_FILE)
    }

    pub async fn has_local_credentials(&self) -> bool {
        tokio::fs::try_exists(self.credentials_path())
            .await
            .unwrap_or(false)
    }

    /// Read the local bundle, or download it from the remote source and
    /// store it first. Download failures are reported, never retried here.
    pub async fn load_or_fetch(&self, source_id: Option<&str>) -> Result<Credentials, AuthError> {
        let path = self.credentials_path();
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                tracing::info!(path = %path.display(), "Session file found");
                return Ok(Credentials::new(bytes));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => return Err(AuthError::Read { path, source }),
        }

        let Some(source_id) = source_id else {
            return Err(AuthError::MissingSource);
        };

        let creds = Credentials::new(self.remote.fetch(source_id).await?);
        if let Err(source) = self.persist(&creds).await {
            return Err(AuthError::Store {
                credentials: creds,
                source,
            });
        }
        tracing::info!(bytes = creds.len(), "Session downloaded");
        Ok(creds)
    }

    /// Replace the bundle atomically.
    pub async fn persist(&self, creds: &Credentials) -> Result<(), PersistenceError> {
        let path = self.credentials_path();
        let temp_path = self.temp_path();

        if let Err(e) = write_synced(&temp_path, creds.as_bytes()).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(PersistenceError::new("write", &temp_path, e));
        }

        if let Err(e) = tokio::fs::rename(&temp_path, &path).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(PersistenceError::new("rename", &path, e));
        }
        Ok(())
    }

    /// Remove the bundle. Missing files are not an error.
    pub async fn clear(&self) -> Result<(), PersistenceError> {
        let path = self.credentials_path();
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PersistenceError::new("remove", &path, e)),
        }
    }

    fn temp_path(&self) -> PathBuf {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let now_nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
        self.dir
            .join(format!(".{CREDENTIALS_FILE}.{now_nanos}.{seq}.tmp"))
    }
}

async fn write_synced(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = tokio::fs::File::create(path).await?;
    file.write_all(bytes).await?;
    file.sync_all().await
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store_in(dir: &Path) -> SessionStore {
        SessionStore::open(dir.join("session"), RemoteSource::default())
            .await
            .expect("open store")
    }

    #[tokio::test]
    async fn open_creates_directory_idempotently() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(tmp.path()).await;
        assert!(store.dir().is_dir());
        let again = store_in(tmp.path()).await;
        assert_eq!(again.dir(), store.dir());
    }

    #[tokio::test]
    async fn missing_bundle_without_source_is_auth_error() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(tmp.path()).await;
        assert!(!store.has_local_credentials().await);
        let err = store.load_or_fetch(None).await.unwrap_err();
        assert!(matches!(err, AuthError::MissingSource));
    }

    #[tokio::test]
    async fn persist_leaves_no_temp_files_behind() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(tmp.path()).await;
        store.persist(&Credentials::new(b"one".to_vec())).await.unwrap();
        store.persist(&Credentials::new(b"two".to_vec())).await.unwrap();

        let names: Vec<String> = std::fs::read_dir(store.dir())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec![CREDENTIALS_FILE.to_string()]);
        assert_eq!(std::fs::read(store.credentials_path()).unwrap(), b"two");
    }

    #[tokio::test]
    async fn local_bundle_wins_over_remote_source() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(tmp.path()).await;
        store.persist(&Credentials::new(b"local".to_vec())).await.unwrap();
        // The default remote is never contacted when a bundle exists.
        let creds = store.load_or_fetch(Some("ignored")).await.unwrap();
        assert_eq!(creds.as_bytes(), b"local");
    }

    #[tokio::test]
    async fn clear_tolerates_missing_bundle() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(tmp.path()).await;
        store.clear().await.unwrap();
        store.persist(&Credentials::new(vec![1, 2, 3])).await.unwrap();
        store.clear().await.unwrap();
        assert!(!store.has_local_credentials().await);
    }

    #[test]
    fn url_template_substitutes_id() {
        let remote = RemoteSource::new("https://files.example/{id}/raw");
        assert_eq!(remote.url_for("abc123"), "https://files.example/abc123/raw");
    }

    #[test]
    fn debug_output_hides_credential_bytes() {
        let creds = Credentials::new(b"secret".to_vec());
        assert_eq!(format!("{creds:?}"), "Credentials(<6 bytes>)");
    }
}
