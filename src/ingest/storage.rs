//! Uploaded-document file storage.
//!
//! Files live at `<upload_dir>/<tenant_id>/<document_id>.<ext>` so a
//! tenant's uploads can be purged by removing one directory.

use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

use crate::errors::Result;
use crate::types::{DocumentId, TenantId};

/// Filesystem storage for raw uploads, partitioned by tenant.
#[derive(Debug, Clone)]
pub struct DocumentStorage {
    upload_dir: PathBuf,
}

impl DocumentStorage {
    pub fn new(upload_dir: impl Into<PathBuf>) -> Self {
        Self {
            upload_dir: upload_dir.into(),
        }
    }

    /// Path for a document's stored file.
    pub fn path_for(&self, tenant_id: TenantId, document_id: DocumentId, ext: &str) -> PathBuf {
        self.upload_dir
            .join(tenant_id.to_string())
            .join(format!("{}.{}", document_id, ext))
    }

    /// Persist raw upload bytes, creating the tenant directory as needed.
    pub async fn save(
        &self,
        tenant_id: TenantId,
        document_id: DocumentId,
        ext: &str,
        bytes: &[u8],
    ) -> Result<PathBuf> {
        let path = self.path_for(tenant_id, document_id, ext);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&path, bytes).await?;

        debug!(%tenant_id, %document_id, path = %path.display(), "stored upload");
        Ok(path)
    }

    /// Remove a stored file. Missing files are not an error; deletion must
    /// be idempotent under job replay.
    pub async fn delete(&self, path: &Path) -> Result<()> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove a tenant's entire upload directory.
    pub async fn purge_tenant(&self, tenant_id: TenantId) -> Result<()> {
        let dir = self.upload_dir.join(tenant_id.to_string());
        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
