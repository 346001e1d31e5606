//! Materialized state image archives
//!
//! An archive is a zstd-compressed tar holding `image.json`, `event.json`
//! and one `staging/<entity>.json` per configured entity with the full
//! staging rows as row documents.

use crate::audit::ChangeEvent;
use crate::error::{Result, TabledgerError};
use crate::progress::create_file_progress;
use crate::state::StateImage;
use indexmap::IndexMap;
use std::fs::{self, File};
use std::io::Read;
use std::path::Path;
use tar::{Archive, Builder};
use zstd::{Decoder, Encoder};

const IMAGE_ENTRY: &str = "image.json";
const EVENT_ENTRY: &str = "event.json";
const STAGING_PREFIX: &str = "staging/";

/// Reads and writes image archives
pub struct ArchiveManager;

impl ArchiveManager {
    /// File name of the archive for an image
    pub fn archive_name(image_id: &str) -> String {
        format!("{}.tar.zst", image_id)
    }

    /// Write the archive for `image` into `images_dir` and return its file name
    pub fn write_image(
        images_dir: &Path,
        image: &StateImage,
        event: &ChangeEvent,
        staging: &[(String, Vec<serde_json::Value>)],
    ) -> Result<String> {
        fs::create_dir_all(images_dir)?;

        let mut files: Vec<(String, Vec<u8>)> = vec![
            (IMAGE_ENTRY.to_string(), serde_json::to_vec_pretty(image)?),
            (EVENT_ENTRY.to_string(), serde_json::to_vec_pretty(event)?),
        ];
        for (entity, rows) in staging {
            files.push((format!("{}{}.json", STAGING_PREFIX, entity), serde_json::to_vec(rows)?));
        }

        let name = Self::archive_name(&image.id);
        Self::create_archive(&images_dir.join(&name), &files)?;
        log::debug!("Materialized image {} into {}", image.id, name);
        Ok(name)
    }

    /// Load an image archive back into memory
    pub fn read_image(archive_path: &Path) -> Result<ImageArchive> {
        let mut image = None;
        let mut event = None;
        let mut staging = IndexMap::new();

        for (path, content) in Self::extract_archive(archive_path)? {
            if path == IMAGE_ENTRY {
                image = Some(serde_json::from_slice::<StateImage>(&content)?);
            } else if path == EVENT_ENTRY {
                event = Some(serde_json::from_slice::<serde_json::Value>(&content)?);
            } else if let Some(entity) = path.strip_prefix(STAGING_PREFIX).and_then(|p| p.strip_suffix(".json")) {
                staging.insert(entity.to_string(), serde_json::from_slice(&content)?);
            }
        }

        Ok(ImageArchive {
            image: image.ok_or_else(|| {
                TabledgerError::archive(format!("{} has no {}", archive_path.display(), IMAGE_ENTRY))
            })?,
            event: event.ok_or_else(|| {
                TabledgerError::archive(format!("{} has no {}", archive_path.display(), EVENT_ENTRY))
            })?,
            staging,
        })
    }

    fn create_archive(archive_path: &Path, files: &[(String, Vec<u8>)]) -> Result<()> {
        let archive_file = File::create(archive_path)?;

        let total_size: u64 = files.iter().map(|(_, content)| content.len() as u64).sum();
        let progress = create_file_progress(total_size, "Writing image archive");

        let mut encoder = Encoder::new(archive_file, 3)?;
        {
            let mut tar_builder = Builder::new(&mut encoder);
            let mut processed = 0u64;

            for (filename, content) in files {
                let mut header = tar::Header::new_gnu();
                header.set_size(content.len() as u64);
                header.set_mode(0o644);
                header.set_cksum();

                tar_builder.append_data(&mut header, filename, content.as_slice())?;

                processed += content.len() as u64;
                progress.set_position(processed);
            }

            tar_builder.finish()?;
        }
        encoder.finish()?;

        progress.finish_and_clear();
        Ok(())
    }

    fn extract_archive(archive_path: &Path) -> Result<Vec<(String, Vec<u8>)>> {
        let archive_file = File::open(archive_path).map_err(|e| {
            TabledgerError::archive(format!("cannot open {}: {}", archive_path.display(), e))
        })?;
        let mut decoder = Decoder::new(archive_file)?;
        let mut archive = Archive::new(&mut decoder);

        let mut files = Vec::new();
        for entry in archive.entries()? {
            let mut entry = entry?;
            let path = entry.path()?.to_string_lossy().to_string();
            let mut content = Vec::new();
            entry.read_to_end(&mut content)?;
            files.push((path, content));
        }
        Ok(files)
    }

    /// List files in an archive without extracting
    pub fn list_archive_contents(archive_path: &Path) -> Result<Vec<ArchiveEntry>> {
        let archive_file = File::open(archive_path)?;
        let mut decoder = Decoder::new(archive_file)?;
        let mut archive = Archive::new(&mut decoder);

        let mut entries = Vec::new();
        for entry in archive.entries()? {
            let entry = entry?;
            entries.push(ArchiveEntry {
                path: entry.path()?.to_string_lossy().to_string(),
                size: entry.header().size()?,
            });
        }
        Ok(entries)
    }

    /// Archive size and compression ratio
    pub fn get_archive_stats(archive_path: &Path) -> Result<ArchiveStats> {
        let compressed_size = fs::metadata(archive_path)?.len();
        let entries = Self::list_archive_contents(archive_path)?;
        let uncompressed_size: u64 = entries.iter().map(|e| e.size).sum();

        let compression_ratio = if uncompressed_size > 0 {
            compressed_size as f64 / uncompressed_size as f64
        } else {
            1.0
        };

        Ok(ArchiveStats {
            compressed_size,
            uncompressed_size,
            compression_ratio,
            file_count: entries.len(),
        })
    }
}

/// Contents of a materialized image
#[derive(Debug, Clone)]
pub struct ImageArchive {
    pub image: StateImage,
    pub event: serde_json::Value,
    /// Row documents per entity
    pub staging: IndexMap<String, Vec<serde_json::Value>>,
}

/// Information about a file in an archive
#[derive(Debug, Clone)]
pub struct ArchiveEntry {
    pub path: String,
    pub size: u64,
}

/// Statistics about an archive
#[derive(Debug, Clone)]
pub struct ArchiveStats {
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    pub compression_ratio: f64,
    pub file_count: usize,
}

impl ArchiveStats {
    pub fn compression_percentage(&self) -> f64 {
        (1.0 - self.compression_ratio) * 100.0
    }
}
