//! Archive extraction for engine payloads.
//!
//! Supports `.zip`, `.tar.gz`/`.tgz`, and `.tar.zst` archives. Selective
//! extraction pulls only named entries out of an archive, which repair uses
//! to replace broken files without rewriting a valid install.

use crate::{HangarError, Result};
use std::collections::HashSet;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Zip,
    TarGz,
    TarZst,
}

/// Determine the archive format from the file name.
pub fn detect_format(path: &Path) -> Result<ArchiveFormat> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default();

    if name.ends_with(".zip") {
        Ok(ArchiveFormat::Zip)
    } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
        Ok(ArchiveFormat::TarGz)
    } else if name.ends_with(".tar.zst") || name.ends_with(".tzst") {
        Ok(ArchiveFormat::TarZst)
    } else {
        Err(HangarError::ExtractFailed {
            message: format!("Unsupported archive format: {}", name),
        })
    }
}

/// Extract a whole archive into `dest`.
pub fn extract_archive(archive_path: &Path, dest: &Path) -> Result<()> {
    info!(
        "Extracting {} to {}",
        archive_path.display(),
        dest.display()
    );

    std::fs::create_dir_all(dest).map_err(|e| HangarError::io_with_path(e, dest))?;

    match detect_format(archive_path)? {
        ArchiveFormat::Zip => extract_zip(archive_path, dest, None).map(|_| ()),
        ArchiveFormat::TarGz => {
            let file = open_archive(archive_path)?;
            let decoder = flate2::read::GzDecoder::new(BufReader::new(file));
            extract_tar(decoder, dest, None).map(|_| ())
        }
        ArchiveFormat::TarZst => {
            let file = open_archive(archive_path)?;
            let decoder =
                zstd::stream::Decoder::new(BufReader::new(file)).map_err(|e| {
                    HangarError::ExtractFailed {
                        message: format!("Failed to create zstd decoder: {}", e),
                    }
                })?;
            extract_tar(decoder, dest, None).map(|_| ())
        }
    }
}

/// Extract only the entries whose install-relative path is in `wanted`.
///
/// Entry names are matched both as-is and with a single wrapping top-level
/// directory stripped, since release archives commonly wrap their content.
/// Returns the number of entries written.
pub fn extract_entries(
    archive_path: &Path,
    dest: &Path,
    wanted: &HashSet<String>,
) -> Result<usize> {
    debug!(
        "Selectively extracting {} entries from {}",
        wanted.len(),
        archive_path.display()
    );

    std::fs::create_dir_all(dest).map_err(|e| HangarError::io_with_path(e, dest))?;

    match detect_format(archive_path)? {
        ArchiveFormat::Zip => extract_zip(archive_path, dest, Some(wanted)),
        ArchiveFormat::TarGz => {
            let file = open_archive(archive_path)?;
            let decoder = flate2::read::GzDecoder::new(BufReader::new(file));
            extract_tar(decoder, dest, Some(wanted))
        }
        ArchiveFormat::TarZst => {
            let file = open_archive(archive_path)?;
            let decoder =
                zstd::stream::Decoder::new(BufReader::new(file)).map_err(|e| {
                    HangarError::ExtractFailed {
                        message: format!("Failed to create zstd decoder: {}", e),
                    }
                })?;
            extract_tar(decoder, dest, Some(wanted))
        }
    }
}

/// If `dir` contains exactly one subdirectory and nothing else, hoist its
/// contents up one level. Release archives from GitHub and friends wrap
/// everything in `name-version/`.
pub fn flatten_wrapping_dir(dir: &Path) -> Result<()> {
    let entries: Vec<PathBuf> = std::fs::read_dir(dir)
        .map_err(|e| HangarError::io_with_path(e, dir))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .collect();

    if entries.len() != 1 || !entries[0].is_dir() {
        return Ok(());
    }

    let wrapper = &entries[0];
    debug!("Flattening wrapping directory {}", wrapper.display());

    for entry in std::fs::read_dir(wrapper).map_err(|e| HangarError::io_with_path(e, wrapper))? {
        let entry = entry.map_err(|e| HangarError::io_with_path(e, wrapper))?;
        let target = dir.join(entry.file_name());
        std::fs::rename(entry.path(), &target)
            .map_err(|e| HangarError::io_with_path(e, &target))?;
    }

    std::fs::remove_dir(wrapper).map_err(|e| HangarError::io_with_path(e, wrapper))?;
    Ok(())
}

fn open_archive(path: &Path) -> Result<File> {
    File::open(path).map_err(|e| HangarError::io_with_path(e, path))
}

/// Match an archive entry path against the wanted set, tolerating one
/// wrapping directory. Returns the install-relative path to write to.
fn match_wanted(entry_path: &Path, wanted: &HashSet<String>) -> Option<String> {
    let as_string = entry_path.to_string_lossy().replace('\\', "/");
    if wanted.contains(as_string.as_str()) {
        return Some(as_string);
    }

    let mut components = entry_path.components();
    components.next();
    let stripped = components.as_path().to_string_lossy().replace('\\', "/");
    if !stripped.is_empty() && wanted.contains(stripped.as_str()) {
        return Some(stripped);
    }

    None
}

fn extract_zip(
    archive_path: &Path,
    dest: &Path,
    wanted: Option<&HashSet<String>>,
) -> Result<usize> {
    let file = open_archive(archive_path)?;
    let mut archive = zip::ZipArchive::new(file).map_err(|e| HangarError::ExtractFailed {
        message: format!("Invalid zip archive: {}", e),
    })?;

    let mut written = 0usize;

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| HangarError::ExtractFailed {
                message: format!("Failed to read zip entry {}: {}", i, e),
            })?;

        // enclosed_name rejects absolute paths and `..` traversal
        let safe_name = match entry.enclosed_name() {
            Some(path) => path.to_path_buf(),
            None => {
                warn!("Skipping unsafe zip entry: {}", entry.name());
                continue;
            }
        };

        let outpath = match wanted {
            Some(set) => match match_wanted(&safe_name, set) {
                Some(relative) => dest.join(relative),
                None => continue,
            },
            None => dest.join(&safe_name),
        };

        if entry.is_dir() {
            std::fs::create_dir_all(&outpath)
                .map_err(|e| HangarError::io_with_path(e, &outpath))?;
            continue;
        }

        if let Some(parent) = outpath.parent() {
            std::fs::create_dir_all(parent).map_err(|e| HangarError::io_with_path(e, parent))?;
        }

        let mut outfile =
            File::create(&outpath).map_err(|e| HangarError::io_with_path(e, &outpath))?;
        std::io::copy(&mut entry, &mut outfile)
            .map_err(|e| HangarError::io_with_path(e, &outpath))?;
        written += 1;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Some(mode) = entry.unix_mode() {
                std::fs::set_permissions(&outpath, std::fs::Permissions::from_mode(mode)).ok();
            }
        }
    }

    Ok(written)
}

fn extract_tar<R: Read>(
    reader: R,
    dest: &Path,
    wanted: Option<&HashSet<String>>,
) -> Result<usize> {
    let mut archive = tar::Archive::new(reader);

    match wanted {
        None => {
            // tar's unpack sanitizes paths itself
            archive
                .unpack(dest)
                .map_err(|e| HangarError::ExtractFailed {
                    message: format!("Failed to extract tarball: {}", e),
                })?;
            Ok(0)
        }
        Some(set) => {
            let mut written = 0usize;
            let entries = archive.entries().map_err(|e| HangarError::ExtractFailed {
                message: format!("Failed to read tarball entries: {}", e),
            })?;

            for entry in entries {
                let mut entry = entry.map_err(|e| HangarError::ExtractFailed {
                    message: format!("Failed to read tarball entry: {}", e),
                })?;

                let entry_path = entry
                    .path()
                    .map_err(|e| HangarError::ExtractFailed {
                        message: format!("Invalid tarball entry path: {}", e),
                    })?
                    .to_path_buf();

                if entry_path
                    .components()
                    .any(|c| matches!(c, Component::ParentDir | Component::RootDir))
                {
                    warn!("Skipping unsafe tar entry: {}", entry_path.display());
                    continue;
                }

                let relative = match match_wanted(&entry_path, set) {
                    Some(r) => r,
                    None => continue,
                };

                let outpath = dest.join(&relative);
                if let Some(parent) = outpath.parent() {
                    std::fs::create_dir_all(parent)
                        .map_err(|e| HangarError::io_with_path(e, parent))?;
                }

                entry
                    .unpack(&outpath)
                    .map_err(|e| HangarError::ExtractFailed {
                        message: format!(
                            "Failed to extract {}: {}",
                            outpath.display(),
                            e
                        ),
                    })?;
                written += 1;
            }

            Ok(written)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn make_zip(dir: &Path, entries: &[(&str, &[u8])]) -> PathBuf {
        let path = dir.join("payload.zip");
        let file = File::create(&path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default();
        for (name, data) in entries {
            writer.start_file(*name, options).unwrap();
            writer.write_all(data).unwrap();
        }
        writer.finish().unwrap();
        path
    }

    fn make_targz(dir: &Path, entries: &[(&str, &[u8])]) -> PathBuf {
        let path = dir.join("payload.tar.gz");
        let file = File::create(&path).unwrap();
        let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::fast());
        let mut builder = tar::Builder::new(encoder);
        for (name, data) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, *data).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();
        path
    }

    #[test]
    fn test_detect_format() {
        assert_eq!(
            detect_format(Path::new("a.zip")).unwrap(),
            ArchiveFormat::Zip
        );
        assert_eq!(
            detect_format(Path::new("a.tar.gz")).unwrap(),
            ArchiveFormat::TarGz
        );
        assert_eq!(
            detect_format(Path::new("a.tgz")).unwrap(),
            ArchiveFormat::TarGz
        );
        assert_eq!(
            detect_format(Path::new("a.tar.zst")).unwrap(),
            ArchiveFormat::TarZst
        );
        assert!(detect_format(Path::new("a.rar")).is_err());
    }

    #[test]
    fn test_extract_zip_full() {
        let temp_dir = TempDir::new().unwrap();
        let archive = make_zip(
            temp_dir.path(),
            &[("bin/engine", b"binary"), ("README.md", b"docs")],
        );

        let dest = temp_dir.path().join("out");
        extract_archive(&archive, &dest).unwrap();

        assert_eq!(std::fs::read(dest.join("bin/engine")).unwrap(), b"binary");
        assert_eq!(std::fs::read(dest.join("README.md")).unwrap(), b"docs");
    }

    #[test]
    fn test_extract_targz_full() {
        let temp_dir = TempDir::new().unwrap();
        let archive = make_targz(temp_dir.path(), &[("bin/engine", b"binary")]);

        let dest = temp_dir.path().join("out");
        extract_archive(&archive, &dest).unwrap();

        assert_eq!(std::fs::read(dest.join("bin/engine")).unwrap(), b"binary");
    }

    #[test]
    fn test_selective_extraction_only_writes_wanted() {
        let temp_dir = TempDir::new().unwrap();
        let archive = make_zip(
            temp_dir.path(),
            &[("bin/engine", b"binary"), ("README.md", b"docs")],
        );

        let dest = temp_dir.path().join("out");
        let wanted: HashSet<String> = ["bin/engine".to_string()].into_iter().collect();
        let written = extract_entries(&archive, &dest, &wanted).unwrap();

        assert_eq!(written, 1);
        assert!(dest.join("bin/engine").exists());
        assert!(!dest.join("README.md").exists());
    }

    #[test]
    fn test_selective_extraction_strips_wrapper() {
        let temp_dir = TempDir::new().unwrap();
        let archive = make_targz(
            temp_dir.path(),
            &[("engine-1.0/bin/engine", b"binary")],
        );

        let dest = temp_dir.path().join("out");
        let wanted: HashSet<String> = ["bin/engine".to_string()].into_iter().collect();
        let written = extract_entries(&archive, &dest, &wanted).unwrap();

        assert_eq!(written, 1);
        assert_eq!(std::fs::read(dest.join("bin/engine")).unwrap(), b"binary");
    }

    #[test]
    fn test_flatten_wrapping_dir() {
        let temp_dir = TempDir::new().unwrap();
        let dest = temp_dir.path().join("out");
        std::fs::create_dir_all(dest.join("engine-1.0/bin")).unwrap();
        std::fs::write(dest.join("engine-1.0/bin/engine"), b"binary").unwrap();

        flatten_wrapping_dir(&dest).unwrap();
        assert!(dest.join("bin/engine").exists());
        assert!(!dest.join("engine-1.0").exists());
    }

    #[test]
    fn test_flatten_leaves_multiple_entries_alone() {
        let temp_dir = TempDir::new().unwrap();
        let dest = temp_dir.path().join("out");
        std::fs::create_dir_all(&dest).unwrap();
        std::fs::write(dest.join("a"), b"1").unwrap();
        std::fs::write(dest.join("b"), b"2").unwrap();

        flatten_wrapping_dir(&dest).unwrap();
        assert!(dest.join("a").exists());
        assert!(dest.join("b").exists());
    }
}
