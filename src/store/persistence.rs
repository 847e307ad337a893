//! Sled-backed store: one database, five trees.

use super::{ImageRecord, ImageRecordStore, StoredManifest};
use crate::error::StorageError;
use crate::types::GlobalParams;
use sled::Tree;
use std::path::Path;
use tracing::{debug, info};

const META_TREE: &str = "meta";
const CHUNK_TREE: &str = "chunks";
const SLAB_TREE: &str = "slabs";
const IMAGE_TREE: &str = "images";
const MANIFEST_TREE: &str = "manifests";

pub(crate) const META_PARAMS: &[u8] = b"params";

/// Persisted daemon state.
///
/// Trees are cheap handles onto the same database; cloning the store shares them.
#[derive(Clone)]
pub struct SledStore {
    db: sled::Db,
    pub(crate) meta: Tree,
    pub(crate) chunks: Tree,
    pub(crate) slabs: Tree,
    pub(crate) images: Tree,
    pub(crate) manifests: Tree,
    params: GlobalParams,
}

impl SledStore {
    /// Open (or create) the store at `path`, verifying global params.
    pub fn open(path: &Path, params: &GlobalParams) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = sled::open(path)?;
        info!(path = %path.display(), "Opened store");
        Self::from_db(db, params)
    }

    /// In-memory store removed on drop; for tests and dry runs.
    pub fn temporary(params: &GlobalParams) -> Result<Self, StorageError> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db, params)
    }

    pub fn from_db(db: sled::Db, params: &GlobalParams) -> Result<Self, StorageError> {
        let store = Self {
            meta: db.open_tree(META_TREE)?,
            chunks: db.open_tree(CHUNK_TREE)?,
            slabs: db.open_tree(SLAB_TREE)?,
            images: db.open_tree(IMAGE_TREE)?,
            manifests: db.open_tree(MANIFEST_TREE)?,
            db,
            params: params.clone(),
        };
        store.check_params()?;
        Ok(store)
    }

    /// Write params on first open; afterwards they must match exactly.
    fn check_params(&self) -> Result<(), StorageError> {
        let encoded = bincode::serialize(&self.params)?;
        match self
            .meta
            .compare_and_swap(META_PARAMS, None as Option<&[u8]>, Some(encoded))?
        {
            Ok(()) => {
                debug!(params = ?self.params, "Recorded global params");
                Ok(())
            }
            Err(cas) => {
                let stored: GlobalParams = match cas.current {
                    Some(bytes) => bincode::deserialize(&bytes)?,
                    None => return Ok(()),
                };
                if stored != self.params {
                    return Err(StorageError::ParamsMismatch {
                        stored: format!("{:?}", stored),
                        configured: format!("{:?}", self.params),
                    });
                }
                Ok(())
            }
        }
    }

    pub fn params(&self) -> &GlobalParams {
        &self.params
    }

    pub fn get_manifest(&self, tree_hash: &str) -> Result<Option<StoredManifest>, StorageError> {
        match self.manifests.get(tree_hash.as_bytes())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn put_manifest(&self, tree_hash: &str, manifest: &StoredManifest) -> Result<(), StorageError> {
        let bytes = bincode::serialize(manifest)?;
        self.manifests.insert(tree_hash.as_bytes(), bytes)?;
        Ok(())
    }

    pub fn delete_image(&self, tree_hash: &str) -> Result<(), StorageError> {
        self.images.remove(tree_hash.as_bytes())?;
        self.manifests.remove(tree_hash.as_bytes())?;
        Ok(())
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub async fn flush(&self) -> Result<(), StorageError> {
        self.db.flush_async().await?;
        Ok(())
    }
}

impl ImageRecordStore for SledStore {
    fn get_image(&self, tree_hash: &str) -> Result<Option<ImageRecord>, StorageError> {
        match self.images.get(tree_hash.as_bytes())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn put_image(&self, record: &ImageRecord) -> Result<(), StorageError> {
        let bytes = bincode::serialize(record)?;
        self.images.insert(record.tree_hash.as_bytes(), bytes)?;
        Ok(())
    }

    fn list_images(&self) -> Result<Vec<ImageRecord>, StorageError> {
        let mut out = Vec::new();
        for item in self.images.iter() {
            let (_, bytes) = item?;
            out.push(bincode::deserialize(&bytes)?);
        }
        Ok(out)
    }
}
