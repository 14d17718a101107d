//! Archive post-processing for tool bundles: plausibility check, extraction
//! to a scratch directory, recursive binary search, and installation.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::humanize::ByteSize;

use super::validate::{ArchiveFormat, detect_archive};

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("Archive is implausibly small ({actual} < {floor}); deleted as corrupt")]
    TooSmall { actual: ByteSize, floor: ByteSize },

    #[error("Unrecognized archive format")]
    UnknownFormat,

    #[error("Extraction failed: {0}; archive deleted")]
    Corrupt(String),

    #[error("Binary '{0}' not found in extracted archive")]
    BinaryMissing(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, ArchiveError>;

/// What to pull out of a fetched archive.
#[derive(Debug, Clone)]
pub struct InstallSpec {
    /// Binary that must be present for the install to succeed.
    pub primary: String,
    /// Companion probe binary; installed when present, ignored otherwise.
    pub companion: Option<String>,
    /// Archives smaller than this are corrupt by definition.
    pub floor: ByteSize,
}

/// Extract `archive` and install the requested binaries into `install_dir`,
/// overwriting prior versions. The archive and scratch space are removed on
/// success; a failed extraction also deletes the archive so the next fetch
/// starts clean.
pub fn install_from_archive(
    archive: &Path,
    install_dir: &Path,
    spec: &InstallSpec,
) -> Result<Vec<PathBuf>> {
    let size = std::fs::metadata(archive)?.len();
    if size < spec.floor.as_u64() {
        std::fs::remove_file(archive)?;
        return Err(ArchiveError::TooSmall {
            actual: ByteSize(size),
            floor: spec.floor,
        });
    }

    let format = {
        let mut leading = [0u8; 6];
        let mut file = File::open(archive)?;
        let n = io::Read::read(&mut file, &mut leading)?;
        detect_archive(&leading[..n]).ok_or(ArchiveError::UnknownFormat)?
    };

    std::fs::create_dir_all(install_dir)?;
    let scratch = tempfile::tempdir_in(install_dir)?;

    if let Err(err) = extract(archive, format, scratch.path()) {
        // An archive that passed the magic check but fails to extract is
        // truncated or corrupt; force a clean refetch.
        warn!(archive = %archive.display(), error = %err, "Extraction failed, deleting archive");
        let _ = std::fs::remove_file(archive);
        return Err(ArchiveError::Corrupt(err.to_string()));
    }

    let mut installed = Vec::new();
    let primary = find_in_tree(scratch.path(), &spec.primary)
        .ok_or_else(|| ArchiveError::BinaryMissing(spec.primary.clone()))?;
    installed.push(install_binary(&primary, install_dir)?);

    if let Some(companion) = &spec.companion {
        match find_in_tree(scratch.path(), companion) {
            Some(found) => installed.push(install_binary(&found, install_dir)?),
            None => debug!(companion, "Companion binary not present in archive"),
        }
    }

    std::fs::remove_file(archive)?;
    info!(
        install_dir = %install_dir.display(),
        count = installed.len(),
        "Binaries installed from archive"
    );
    Ok(installed)
}

fn extract(archive: &Path, format: ArchiveFormat, scratch: &Path) -> io::Result<()> {
    match format {
        ArchiveFormat::TarXz => {
            let file = File::open(archive)?;
            let decoder = xz2::read::XzDecoder::new(file);
            tar::Archive::new(decoder).unpack(scratch)
        }
        ArchiveFormat::Zip => {
            let file = File::open(archive)?;
            let mut zip = zip::ZipArchive::new(file)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            zip.extract(scratch)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
        }
    }
}

/// Depth-first search of the extracted tree for a file with the exact name
/// (or the name plus `.exe`).
fn find_in_tree(dir: &Path, name: &str) -> Option<PathBuf> {
    let exe_name = format!("{name}.exe");
    let entries = std::fs::read_dir(dir).ok()?;
    let mut subdirs = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            subdirs.push(path);
        } else if let Some(file_name) = path.file_name().and_then(|n| n.to_str()) {
            if file_name == name || file_name == exe_name {
                return Some(path);
            }
        }
    }
    subdirs.into_iter().find_map(|sub| find_in_tree(&sub, name))
}

fn install_binary(source: &Path, install_dir: &Path) -> Result<PathBuf> {
    let name = source
        .file_name()
        .ok_or_else(|| ArchiveError::BinaryMissing(source.display().to_string()))?;
    let target = install_dir.join(name);
    std::fs::copy(source, &target)?;
    set_executable(&target)?;
    debug!(target = %target.display(), "Installed binary");
    Ok(target)
}

#[cfg(unix)]
fn set_executable(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
}

#[cfg(not(unix))]
fn set_executable(_path: &Path) -> io::Result<()> {
    Ok(())
}
