//! Storage retention
//!
//! Applies the configured maximum-size and shrink-by rules to a persisted
//! trace store. When the store outgrows `maximum_trace_size`, the oldest
//! bytes are moved into timestamped archive files under the archive
//! directory and the live store is compacted. Archives are fsync'd before
//! anything is removed from the store, and are never rewritten afterwards.
//!
//! The pass is invoked by a scheduler outside this crate; its correctness
//! does not depend on the cadence.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;

use crate::config::StorageConfig;

/// What one retention pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionReport {
    /// Total bytes moved into archives during this pass.
    pub bytes_moved: u64,
    /// Archive files created, in creation order.
    pub archives: Vec<PathBuf>,
    /// Store size after the pass.
    pub store_size: u64,
}

/// Bytes one shrink step removes from a store of `size` bytes:
/// `ceil(size * percentage / 100)`, capped at `size`.
pub fn shrink_amount(size: u64, percentage: u8) -> u64 {
    let amount = ((size as u128 * percentage as u128 + 99) / 100) as u64;
    amount.min(size)
}

/// Apply the retention rules to the store at `store`. Shrink steps repeat
/// until the store fits under the configured maximum; each step writes one
/// archive file. A store already within bounds is left untouched.
pub fn apply_retention(store: &Path, config: &StorageConfig) -> Result<RetentionReport> {
    let mut size = fs::metadata(store)
        .with_context(|| format!("cannot stat trace store {}", store.display()))?
        .len();

    let mut report = RetentionReport {
        store_size: size,
        ..RetentionReport::default()
    };
    if size <= config.maximum_trace_size {
        return Ok(report);
    }

    fs::create_dir_all(&config.archive_directory).with_context(|| {
        format!(
            "cannot create archive directory {}",
            config.archive_directory.display()
        )
    })?;
    let extension = store
        .extension()
        .map(|e| e.to_string_lossy().into_owned())
        .unwrap_or_else(|| String::from("log"));

    while size > config.maximum_trace_size {
        let moved = shrink_step(store, config, &extension, size, &mut report)?;
        size -= moved;
    }

    report.store_size = size;
    Ok(report)
}

/// Move one shrink step's worth of the oldest bytes into a new archive
/// file, then compact the store. Returns the number of bytes moved.
fn shrink_step(
    store: &Path,
    config: &StorageConfig,
    extension: &str,
    size: u64,
    report: &mut RetentionReport,
) -> Result<u64> {
    let amount = shrink_amount(size, config.shrink_percentage);
    let archive_path = next_archive_path(&config.archive_directory, extension)?;

    let mut store_file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(store)
        .with_context(|| format!("cannot open trace store {}", store.display()))?;

    // The archive must be durable before the live store loses the bytes.
    let mut archive = File::options()
        .write(true)
        .create_new(true)
        .open(&archive_path)
        .with_context(|| format!("cannot create archive {}", archive_path.display()))?;
    io::copy(&mut (&mut store_file).take(amount), &mut archive)
        .with_context(|| format!("cannot copy into archive {}", archive_path.display()))?;
    archive
        .sync_all()
        .with_context(|| format!("cannot sync archive {}", archive_path.display()))?;

    // Compact: shift the remainder to the front and truncate.
    let mut remainder = Vec::with_capacity((size - amount) as usize);
    store_file
        .seek(SeekFrom::Start(amount))
        .context("cannot seek past archived bytes")?;
    store_file
        .read_to_end(&mut remainder)
        .context("cannot read store remainder")?;
    store_file
        .seek(SeekFrom::Start(0))
        .context("cannot rewind trace store")?;
    store_file
        .write_all(&remainder)
        .context("cannot rewrite trace store")?;
    store_file
        .set_len(remainder.len() as u64)
        .context("cannot truncate trace store")?;
    store_file.sync_all().context("cannot sync trace store")?;

    report.bytes_moved += amount;
    report.archives.push(archive_path);
    Ok(amount)
}

/// First unused `archive_YYYYMMDDThhmmss_N.<ext>` name under `directory`.
fn next_archive_path(directory: &Path, extension: &str) -> Result<PathBuf> {
    let stamp = Utc::now().format("%Y%m%dT%H%M%S");
    for n in 1u32.. {
        let candidate = directory.join(format!("archive_{}_{}.{}", stamp, n, extension));
        if !candidate.exists() {
            return Ok(candidate);
        }
    }
    unreachable!("u32 archive counter exhausted")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage_config(directory: &Path, maximum: u64, percentage: u8) -> StorageConfig {
        StorageConfig {
            maximum_trace_size: maximum,
            shrink_percentage: percentage,
            archive_directory: directory.to_path_buf(),
        }
    }

    #[test]
    fn test_shrink_amount_rounds_up() {
        assert_eq!(shrink_amount(1_000_000, 25), 250_000);
        assert_eq!(shrink_amount(999, 10), 100);
        assert_eq!(shrink_amount(1, 1), 1);
        assert_eq!(shrink_amount(0, 50), 0);
    }

    #[test]
    fn test_shrink_amount_full_store() {
        assert_eq!(shrink_amount(12345, 100), 12345);
    }

    #[test]
    fn test_store_within_bounds_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let store = dir.path().join("trace.log");
        fs::write(&store, vec![b'x'; 100]).unwrap();
        let config = storage_config(&dir.path().join("archive"), 200, 50);

        let report = apply_retention(&store, &config).unwrap();
        assert_eq!(report.bytes_moved, 0);
        assert!(report.archives.is_empty());
        assert_eq!(report.store_size, 100);
        assert!(!config.archive_directory.exists());
    }

    #[test]
    fn test_single_pass_moves_exact_share() {
        let dir = tempfile::tempdir().unwrap();
        let store = dir.path().join("trace.log");
        let contents: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        fs::write(&store, &contents).unwrap();
        let archive_dir = dir.path().join("archive");
        let config = storage_config(&archive_dir, 8_000, 25);

        let report = apply_retention(&store, &config).unwrap();
        assert_eq!(report.bytes_moved, 2_500);
        assert_eq!(report.store_size, 7_500);
        assert_eq!(report.archives.len(), 1);

        // The oldest bytes went to the archive, the newest stayed.
        let archived = fs::read(&report.archives[0]).unwrap();
        assert_eq!(archived, &contents[..2_500]);
        let remaining = fs::read(&store).unwrap();
        assert_eq!(remaining, &contents[2_500..]);
    }

    #[test]
    fn test_repeated_steps_until_within_bounds() {
        let dir = tempfile::tempdir().unwrap();
        let store = dir.path().join("trace.log");
        fs::write(&store, vec![b'a'; 1_000]).unwrap();
        let archive_dir = dir.path().join("archive");
        // 10% steps: 1000 -> 900 -> 810 -> 729, needs three archives.
        let config = storage_config(&archive_dir, 750, 10);

        let report = apply_retention(&store, &config).unwrap();
        assert_eq!(report.store_size, 729);
        assert_eq!(report.bytes_moved, 271);
        assert_eq!(report.archives.len(), 3);
        assert!(report.store_size <= config.maximum_trace_size);
    }

    #[test]
    fn test_archive_names_follow_convention() {
        let dir = tempfile::tempdir().unwrap();
        let store = dir.path().join("trace.log");
        fs::write(&store, vec![b'a'; 100]).unwrap();
        let config = storage_config(&dir.path().join("archive"), 50, 60);

        let report = apply_retention(&store, &config).unwrap();
        let name = report.archives[0].file_name().unwrap().to_string_lossy();
        assert!(name.starts_with("archive_"), "bad name {}", name);
        assert!(name.ends_with(".log"), "bad name {}", name);
        // archive_YYYYMMDDThhmmss_N.log
        let stamp = name
            .strip_prefix("archive_")
            .and_then(|s| s.strip_suffix(".log"))
            .unwrap();
        let (datetime, counter) = stamp.rsplit_once('_').unwrap();
        assert_eq!(datetime.len(), 15);
        assert_eq!(&datetime[8..9], "T");
        assert!(counter.parse::<u32>().is_ok());
    }

    #[test]
    fn test_archive_extension_matches_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = dir.path().join("trace.xml");
        fs::write(&store, vec![b'a'; 100]).unwrap();
        let config = storage_config(&dir.path().join("archive"), 50, 50);

        let report = apply_retention(&store, &config).unwrap();
        assert!(report.archives[0]
            .file_name()
            .unwrap()
            .to_string_lossy()
            .ends_with(".xml"));
    }

    #[test]
    fn test_counter_disambiguates_within_one_second() {
        let dir = tempfile::tempdir().unwrap();
        let store = dir.path().join("trace.log");
        fs::write(&store, vec![b'a'; 1_000]).unwrap();
        let archive_dir = dir.path().join("archive");
        let config = storage_config(&archive_dir, 100, 50);

        let report = apply_retention(&store, &config).unwrap();
        assert!(report.archives.len() >= 2);
        let unique: std::collections::HashSet<_> = report.archives.iter().collect();
        assert_eq!(unique.len(), report.archives.len());
    }

    #[test]
    fn test_full_shrink_empties_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = dir.path().join("trace.log");
        fs::write(&store, vec![b'a'; 500]).unwrap();
        let config = storage_config(&dir.path().join("archive"), 0, 100);

        let report = apply_retention(&store, &config).unwrap();
        assert_eq!(report.store_size, 0);
        assert_eq!(fs::metadata(&store).unwrap().len(), 0);
        assert_eq!(report.bytes_moved, 500);
    }

    #[test]
    fn test_missing_store_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = storage_config(&dir.path().join("archive"), 100, 50);
        assert!(apply_retention(&dir.path().join("absent.log"), &config).is_err());
    }
}
