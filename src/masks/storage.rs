//! Disk persistence for baked masks.
//!
//! One grayscale PNG per mask, named by the canonical key:
//! `{base_dir}/{canonical_key}.png`

use std::fs;
use std::path::{Path, PathBuf};

use super::key::MaskKey;
use super::MaskTexture;

/// Storage manager for persisting baked masks to disk.
pub struct MaskStorage {
    base_dir: PathBuf,
}

impl MaskStorage {
    pub fn new<P: AsRef<Path>>(base_dir: P) -> Self {
        Self {
            base_dir: base_dir.as_ref().to_path_buf(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Get the file path for a mask
    pub fn mask_path(&self, key: &MaskKey) -> PathBuf {
        self.base_dir.join(key.file_name())
    }

    fn ensure_dir(&self) -> std::io::Result<()> {
        fs::create_dir_all(&self.base_dir)
    }

    pub fn mask_exists(&self, key: &MaskKey) -> bool {
        self.mask_path(key).exists()
    }

    /// Write a mask, returning the path written.
    pub fn save_mask(&self, key: &MaskKey, texture: &MaskTexture) -> Result<PathBuf, MaskStorageError> {
        self.ensure_dir()?;
        let path = self.mask_path(key);
        texture.to_image().save(&path)?;
        Ok(path)
    }

    /// Read a mask. Returns None if it was never written.
    pub fn load_mask(&self, key: &MaskKey) -> Result<Option<MaskTexture>, MaskStorageError> {
        let path = self.mask_path(key);
        if !path.exists() {
            return Ok(None);
        }
        Self::load_path(&path).map(Some)
    }

    /// Read a mask from an explicit path.
    pub fn load_path(path: &Path) -> Result<MaskTexture, MaskStorageError> {
        let img = image::open(path)?.into_luma8();
        Ok(MaskTexture::from_image(&img))
    }

    /// Delete a mask from disk (if it exists).
    pub fn delete_mask(&self, key: &MaskKey) -> std::io::Result<()> {
        let path = self.mask_path(key);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    /// List keys of every stored mask. Files whose name is not a canonical key
    /// are skipped.
    pub fn list_masks(&self) -> Result<Vec<MaskKey>, MaskStorageError> {
        if !self.base_dir.exists() {
            return Ok(Vec::new());
        }

        let mut keys = Vec::new();
        for entry in fs::read_dir(&self.base_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("png") {
                continue;
            }
            if let Some(key) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(MaskKey::parse)
            {
                keys.push(key);
            }
        }
        Ok(keys)
    }

    /// Get the total size of stored masks in bytes.
    pub fn total_size(&self) -> std::io::Result<u64> {
        if !self.base_dir.exists() {
            return Ok(0);
        }
        let mut total = 0;
        for entry in fs::read_dir(&self.base_dir)? {
            total += entry?.metadata()?.len();
        }
        Ok(total)
    }

    /// Remove every stored mask.
    pub fn clear(&self) -> Result<usize, MaskStorageError> {
        let keys = self.list_masks()?;
        for key in &keys {
            self.delete_mask(key)?;
        }
        Ok(keys.len())
    }
}

/// Errors that can occur during mask storage operations.
#[derive(Debug)]
pub enum MaskStorageError {
    /// IO error (file not found, permissions, etc.)
    Io(std::io::Error),
    /// PNG encode/decode error
    Image(image::ImageError),
}

impl std::fmt::Display for MaskStorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MaskStorageError::Io(e) => write!(f, "IO error: {}", e),
            MaskStorageError::Image(e) => write!(f, "Image error: {}", e),
        }
    }
}

impl std::error::Error for MaskStorageError {}

impl From<std::io::Error> for MaskStorageError {
    fn from(e: std::io::Error) -> Self {
        MaskStorageError::Io(e)
    }
}

impl From<image::ImageError> for MaskStorageError {
    fn from(e: image::ImageError) -> Self {
        MaskStorageError::Image(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tile::TileId;
    use tempfile::tempdir;

    fn texture(seed: u8) -> MaskTexture {
        MaskTexture::from_vec(4, 2, (0..8).map(|i| i * 30 + seed).collect()).unwrap()
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let storage = MaskStorage::new(dir.path());
        let key = MaskKey::layers(TileId::new(1, 2), 3, 4);

        let path = storage.save_mask(&key, &texture(1)).unwrap();
        assert_eq!(path, dir.path().join("1_2_layer_l3_i4.png"));
        assert!(storage.mask_exists(&key));

        let loaded = storage.load_mask(&key).unwrap().unwrap();
        assert_eq!(loaded, texture(1));
    }

    #[test]
    fn test_list_and_clear() {
        let dir = tempdir().unwrap();
        let storage = MaskStorage::new(dir.path());
        storage.save_mask(&MaskKey::layers(TileId::new(0, 0), 1, 4), &texture(0)).unwrap();
        storage.save_mask(&MaskKey::biome(TileId::new(0, 1), "desert", 4), &texture(2)).unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let mut keys: Vec<String> = storage.list_masks().unwrap().iter().map(|k| k.canonical()).collect();
        keys.sort();
        assert_eq!(keys, vec!["0_0_layer_l1_i4", "0_1_biome_sdesert_i4"]);

        assert_eq!(storage.clear().unwrap(), 2);
        assert!(storage.list_masks().unwrap().is_empty());
    }

    #[test]
    fn test_load_nonexistent() {
        let dir = tempdir().unwrap();
        let storage = MaskStorage::new(dir.path());
        assert!(storage.load_mask(&MaskKey::layers(TileId::new(9, 9), 1, 1)).unwrap().is_none());
    }
}
