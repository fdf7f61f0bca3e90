//! Per-device archive merging.
//!
//! Grounded in the teacher's `provider::process::copy_dir_all` for the
//! recursive directory-copy shape, applied here to fold N per-device
//! archive directories into one lane archive keyed by device hostname
//! rather than copying a single tree.

use std::path::{Path, PathBuf};

use crate::error::{CoreError, CoreResult};

/// One per-device archive produced by a `DeviceExecutor` worker run.
#[derive(Debug, Clone)]
pub struct DeviceArchive {
    pub hostname: String,
    pub path: PathBuf,
}

/// Merges per-device archives into a single lane archive directory whose
/// top-level entries are the device hostnames.
#[derive(Debug, Default)]
pub struct ArchiveAggregator;

impl ArchiveAggregator {
    pub fn new() -> Self {
        Self
    }

    /// Builds `destination` (created fresh) with one subdirectory per
    /// device archive, containing every file from that device's archive
    /// tree. `destination` must not already contain files for a device this
    /// call is about to write, since we never overwrite quietly -- a
    /// name collision is an aggregation error.
    pub async fn aggregate(&self, archives: &[DeviceArchive], destination: &Path) -> CoreResult<PathBuf> {
        tokio::fs::create_dir_all(destination)
            .await
            .map_err(CoreError::Io)?;

        for archive in archives {
            if !archive.path.exists() {
                return Err(CoreError::Aggregation(format!(
                    "archive for device {} not found at {}",
                    archive.hostname,
                    archive.path.display()
                )));
            }

            let device_dest = destination.join(&archive.hostname);
            if device_dest.exists() {
                return Err(CoreError::Aggregation(format!(
                    "duplicate device hostname {} in archive set",
                    archive.hostname
                )));
            }

            if archive.path.is_dir() {
                copy_dir_all(&archive.path, &device_dest)
                    .await
                    .map_err(CoreError::Io)?;
            } else {
                if let Some(parent) = device_dest.parent() {
                    tokio::fs::create_dir_all(parent).await.map_err(CoreError::Io)?;
                }
                tokio::fs::copy(&archive.path, &device_dest)
                    .await
                    .map_err(CoreError::Io)?;
            }
        }

        Ok(destination.to_path_buf())
    }
}

fn copy_dir_all<'a>(
    src: &'a Path,
    dst: &'a Path,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = std::io::Result<()>> + Send + 'a>> {
    Box::pin(async move {
        tokio::fs::create_dir_all(dst).await?;

        let mut entries = tokio::fs::read_dir(src).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            let src_path = entry.path();
            let dst_path = dst.join(entry.file_name());

            if file_type.is_dir() {
                copy_dir_all(&src_path, &dst_path).await?;
            } else {
                tokio::fs::copy(&src_path, &dst_path).await?;
            }
        }

        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[tokio::test]
    async fn aggregates_device_archives_under_hostname_directories() {
        let root = tempfile::tempdir().unwrap();
        let dev1 = root.path().join("dev1_archive");
        let dev2 = root.path().join("dev2_archive");
        fs::create_dir_all(dev1.join("logs")).unwrap();
        fs::write(dev1.join("logs/device.log"), "dev1 log").unwrap();
        fs::create_dir_all(&dev2).unwrap();
        fs::write(dev2.join("results.xml"), "<testsuite/>").unwrap();

        let aggregator = ArchiveAggregator::new();
        let dest = root.path().join("lane_archive");
        let archives = vec![
            DeviceArchive {
                hostname: "router1".to_string(),
                path: dev1,
            },
            DeviceArchive {
                hostname: "router2".to_string(),
                path: dev2,
            },
        ];

        aggregator.aggregate(&archives, &dest).await.unwrap();

        assert!(dest.join("router1/logs/device.log").is_file());
        assert!(dest.join("router2/results.xml").is_file());
    }

    #[tokio::test]
    async fn missing_source_archive_is_an_aggregation_error() {
        let root = tempfile::tempdir().unwrap();
        let aggregator = ArchiveAggregator::new();
        let archives = vec![DeviceArchive {
            hostname: "ghost".to_string(),
            path: root.path().join("does_not_exist"),
        }];

        let result = aggregator.aggregate(&archives, &root.path().join("out")).await;
        assert!(matches!(result, Err(CoreError::Aggregation(_))));
    }

    #[tokio::test]
    async fn duplicate_hostname_is_an_aggregation_error() {
        let root = tempfile::tempdir().unwrap();
        let dev = root.path().join("dev_archive");
        fs::create_dir_all(&dev).unwrap();
        fs::write(dev.join("a.txt"), "x").unwrap();

        let aggregator = ArchiveAggregator::new();
        let dest = root.path().join("out");
        let archives = vec![
            DeviceArchive {
                hostname: "router1".to_string(),
                path: dev.clone(),
            },
            DeviceArchive {
                hostname: "router1".to_string(),
                path: dev,
            },
        ];

        let result = aggregator.aggregate(&archives, &dest).await;
        assert!(matches!(result, Err(CoreError::Aggregation(_))));
    }
}
