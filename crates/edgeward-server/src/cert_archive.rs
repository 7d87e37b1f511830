//! Versioned backups of the proxy's certificate storage
//!
//! Before a deployment the newest archive is restored so the proxy does not have to
//! re-issue certificates, then a fresh archive is taken once the directory stops changing.
//! Archives are named `certs-<timestamp>.zip` and sort chronologically by name.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::Utc;
use thiserror::Error;
use zip::write::SimpleFileOptions;
use zip::{ZipArchive, ZipWriter};

const ARCHIVE_PREFIX: &str = "certs-";
const ARCHIVE_SUFFIX: &str = ".zip";

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("Archive entry escapes the target directory: {0}")]
    UnsafePath(String),
}

/// Result of [`CertArchive::prepare_deployment`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentReport {
    /// Archive restored before the deployment, if one existed
    pub restored: Option<PathBuf>,
    /// Archive taken afterwards
    pub archived: PathBuf,
    /// Whether the directory settled before the archive was taken
    pub stable: bool,
}

/// (relative path, size, modification time) of every file
type Snapshot = Vec<(PathBuf, u64, Option<SystemTime>)>;

pub struct CertArchive {
    storage_dir: PathBuf,
    archive_dir: PathBuf,
}

impl CertArchive {
    pub fn new(storage_dir: impl Into<PathBuf>, archive_dir: impl Into<PathBuf>) -> Self {
        Self {
            storage_dir: storage_dir.into(),
            archive_dir: archive_dir.into(),
        }
    }

    /// Newest archive by name, if any
    pub fn latest(&self) -> Result<Option<PathBuf>, ArchiveError> {
        if !self.archive_dir.exists() {
            return Ok(None);
        }

        let mut newest: Option<(String, PathBuf)> = None;
        for entry in fs::read_dir(&self.archive_dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !(name.starts_with(ARCHIVE_PREFIX) && name.ends_with(ARCHIVE_SUFFIX)) {
                continue;
            }
            if newest.as_ref().map_or(true, |(best, _)| name > *best) {
                newest = Some((name, entry.path()));
            }
        }

        Ok(newest.map(|(_, path)| path))
    }

    /// Extract the newest archive over the storage directory
    ///
    /// Restoring twice yields the same directory contents.
    pub fn restore_latest(&self) -> Result<Option<PathBuf>, ArchiveError> {
        let Some(archive) = self.latest()? else {
            tracing::info!(dir = %self.archive_dir.display(), "No certificate archive to restore");
            return Ok(None);
        };

        let count = extract(&archive, &self.storage_dir)?;
        tracing::info!(archive = %archive.display(), files = count, "Restored certificate archive");
        Ok(Some(archive))
    }

    /// Take a new timestamped archive of the storage directory
    pub fn create(&self) -> Result<PathBuf, ArchiveError> {
        fs::create_dir_all(&self.archive_dir)?;

        let name = format!(
            "{ARCHIVE_PREFIX}{}{ARCHIVE_SUFFIX}",
            Utc::now().format("%Y%m%d_%H%M%S%3f")
        );
        let path = self.archive_dir.join(name);

        let mut zip = ZipWriter::new(File::create(&path)?);
        let options =
            SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);

        let mut files = 0usize;
        if self.storage_dir.exists() {
            for relative in walk(&self.storage_dir)? {
                let full = self.storage_dir.join(&relative);
                let name = zip_name(&relative);

                if full.is_dir() {
                    zip.add_directory(name, options)?;
                    continue;
                }

                zip.start_file(name, options.unix_permissions(file_mode(&full)?))?;
                zip.write_all(&fs::read(&full)?)?;
                files += 1;
            }
        }

        zip.finish()?;
        tracing::info!(archive = %path.display(), files, "Created certificate archive");
        Ok(path)
    }

    /// Poll until two consecutive snapshots of the storage directory match
    pub fn wait_until_stable(&self, interval: Duration, max_checks: u32) -> Result<bool, ArchiveError> {
        let mut previous = self.snapshot()?;
        for _ in 0..max_checks {
            std::thread::sleep(interval);
            let current = self.snapshot()?;
            if current == previous {
                return Ok(true);
            }
            previous = current;
        }

        tracing::warn!(dir = %self.storage_dir.display(), "Certificate storage kept changing");
        Ok(false)
    }

    /// Restore the newest archive, wait for the directory to settle, then archive it again
    pub fn prepare_deployment(
        &self,
        interval: Duration,
        max_checks: u32,
    ) -> Result<DeploymentReport, ArchiveError> {
        fs::create_dir_all(&self.storage_dir)?;
        let restored = self.restore_latest()?;
        let stable = self.wait_until_stable(interval, max_checks)?;
        let archived = self.create()?;

        Ok(DeploymentReport {
            restored,
            archived,
            stable,
        })
    }

    fn snapshot(&self) -> Result<Snapshot, ArchiveError> {
        if !self.storage_dir.exists() {
            return Ok(Vec::new());
        }

        let mut snapshot = Vec::new();
        for relative in walk(&self.storage_dir)? {
            let meta = fs::metadata(self.storage_dir.join(&relative))?;
            if meta.is_file() {
                snapshot.push((relative, meta.len(), meta.modified().ok()));
            }
        }
        Ok(snapshot)
    }
}

/// Relative paths of every entry under `root`, parents before children, sorted
fn walk(root: &Path) -> Result<Vec<PathBuf>, ArchiveError> {
    let mut out = Vec::new();
    let mut pending = vec![PathBuf::new()];

    while let Some(dir) = pending.pop() {
        let mut entries: Vec<_> = fs::read_dir(root.join(&dir))?.collect::<Result<_, _>>()?;
        entries.sort_by_key(|e| e.file_name());

        for entry in entries {
            let relative = dir.join(entry.file_name());
            if entry.file_type()?.is_dir() {
                pending.push(relative.clone());
            }
            out.push(relative);
        }
    }

    out.sort();
    Ok(out)
}

fn zip_name(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(unix)]
fn file_mode(path: &Path) -> Result<u32, ArchiveError> {
    use std::os::unix::fs::PermissionsExt;
    Ok(fs::metadata(path)?.permissions().mode() & 0o7777)
}

#[cfg(not(unix))]
fn file_mode(_path: &Path) -> Result<u32, ArchiveError> {
    Ok(0o644)
}

fn extract(archive: &Path, dest: &Path) -> Result<usize, ArchiveError> {
    let mut zip = ZipArchive::new(File::open(archive)?)?;
    fs::create_dir_all(dest)?;

    let mut files = 0;
    for i in 0..zip.len() {
        let mut entry = zip.by_index(i)?;
        let relative = entry
            .enclosed_name()
            .ok_or_else(|| ArchiveError::UnsafePath(entry.name().to_string()))?;
        let target = dest.join(relative);

        if entry.is_dir() {
            fs::create_dir_all(&target)?;
            continue;
        }

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut content = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut content)?;
        fs::write(&target, &content)?;

        #[cfg(unix)]
        if let Some(mode) = entry.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&target, fs::Permissions::from_mode(mode & 0o7777))?;
        }

        files += 1;
    }

    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn populate(dir: &Path) {
        let cert_dir = dir
            .join("certificates")
            .join("acme-v02.api.letsencrypt.org-directory")
            .join("site.example.com");
        fs::create_dir_all(&cert_dir).unwrap();
        fs::write(cert_dir.join("site.example.com.crt"), b"-----BEGIN CERTIFICATE-----\nabc\n").unwrap();
        fs::write(cert_dir.join("site.example.com.key"), [0u8, 1, 2, 255, 254]).unwrap();
        fs::create_dir_all(dir.join("locks")).unwrap();
        fs::write(dir.join("instance.uuid"), b"1234").unwrap();
    }

    fn contents(dir: &Path) -> Vec<(PathBuf, Vec<u8>)> {
        walk(dir)
            .unwrap()
            .into_iter()
            .filter(|p| dir.join(p).is_file())
            .map(|p| {
                let bytes = fs::read(dir.join(&p)).unwrap();
                (p, bytes)
            })
            .collect()
    }

    #[test]
    fn test_archive_then_restore_is_byte_identical() {
        let storage = tempfile::tempdir().unwrap();
        let backups = tempfile::tempdir().unwrap();
        populate(storage.path());
        let before = contents(storage.path());

        let archive = CertArchive::new(storage.path(), backups.path());
        let path = archive.create().unwrap();
        assert!(path.file_name().unwrap().to_string_lossy().starts_with("certs-"));

        fs::remove_dir_all(storage.path()).unwrap();
        assert_eq!(archive.restore_latest().unwrap(), Some(path));
        assert_eq!(contents(storage.path()), before);
        assert!(storage.path().join("locks").is_dir());

        // Restoring again changes nothing
        archive.restore_latest().unwrap();
        assert_eq!(contents(storage.path()), before);
    }

    #[test]
    fn test_latest_picks_newest_name() {
        let backups = tempfile::tempdir().unwrap();
        for name in [
            "certs-20250101_000000000.zip",
            "certs-20250301_120000000.zip",
            "certs-20250201_000000000.zip",
            "notes.txt",
        ] {
            fs::write(backups.path().join(name), b"").unwrap();
        }

        let archive = CertArchive::new("/nonexistent", backups.path());
        assert_eq!(
            archive.latest().unwrap(),
            Some(backups.path().join("certs-20250301_120000000.zip"))
        );
        assert_eq!(
            CertArchive::new("/nonexistent", "/nonexistent-backups").latest().unwrap(),
            None
        );
    }

    #[test]
    fn test_rejects_escaping_entries() {
        let backups = tempfile::tempdir().unwrap();
        let storage = tempfile::tempdir().unwrap();

        let path = backups.path().join("certs-20250101_000000000.zip");
        let mut zip = ZipWriter::new(File::create(&path).unwrap());
        zip.start_file("../escape.txt", SimpleFileOptions::default()).unwrap();
        zip.write_all(b"nope").unwrap();
        zip.finish().unwrap();

        let archive = CertArchive::new(storage.path().join("data"), backups.path());
        assert!(matches!(
            archive.restore_latest(),
            Err(ArchiveError::UnsafePath(_))
        ));
        assert!(!storage.path().join("escape.txt").exists());
    }

    #[test]
    fn test_prepare_deployment_restores_then_archives() {
        let storage = tempfile::tempdir().unwrap();
        let backups = tempfile::tempdir().unwrap();
        populate(storage.path());

        let archive = CertArchive::new(storage.path(), backups.path());
        let first = archive.create().unwrap();
        std::thread::sleep(Duration::from_millis(5));

        fs::remove_file(storage.path().join("instance.uuid")).unwrap();
        let report = archive
            .prepare_deployment(Duration::from_millis(10), 5)
            .unwrap();

        assert_eq!(report.restored, Some(first.clone()));
        assert!(report.stable);
        assert_ne!(report.archived, first);
        assert!(storage.path().join("instance.uuid").exists());
        assert_eq!(archive.latest().unwrap(), Some(report.archived));
    }
}
