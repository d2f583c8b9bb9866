//! Finds the helper executable and its companion dynamic library.
//!
//! Grounded on the teacher's `bin_shared::windows::{wintun_dll_path,
//! ensure_dll}`, generalized from an embedded-bytes DLL to a
//! configurable source path the way `tun2Socks.wintunDllPath` specifies
//! it.

use crate::error::HelperError;
use std::path::{Path, PathBuf};

/// Resolves the helper executable path.
///
/// Search order: the configured path verbatim if absolute; else joined
/// against the config directory, the running binary's directory, and the
/// current directory, in that order; else the bare filename under each of
/// those same directories.
pub fn resolve_executable(
    configured: &Path,
    config_dir: &Path,
    binary_dir: &Path,
) -> Result<PathBuf, HelperError> {
    let mut tried = Vec::new();

    if configured.is_absolute() {
        tried.push(configured.to_path_buf());
        if configured.is_file() {
            return Ok(configured.to_path_buf());
        }
    }

    let search_dirs = [config_dir, binary_dir, Path::new(".")];

    for dir in search_dirs {
        let candidate = dir.join(configured);
        tried.push(candidate.clone());
        if candidate.is_file() {
            return Ok(candidate);
        }
    }

    if let Some(filename) = configured.file_name() {
        for dir in search_dirs {
            let candidate = dir.join(filename);
            tried.push(candidate.clone());
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
    }

    Err(HelperError::NotFound { tried })
}

/// Ensures the companion dynamic library sits next to the helper
/// executable, copying it from `source` (or a matching filename under the
/// same search directories) if necessary.
pub fn ensure_companion_library(
    source: Option<&Path>,
    helper_dir: &Path,
    config_dir: &Path,
    binary_dir: &Path,
    library_filename: &str,
) -> Result<PathBuf, HelperError> {
    let target = helper_dir.join(library_filename);
    if target.is_file() {
        return Ok(target);
    }

    let mut candidates: Vec<PathBuf> = Vec::new();
    if let Some(source) = source {
        candidates.push(source.to_path_buf());
    }
    candidates.push(config_dir.join(library_filename));
    candidates.push(binary_dir.join(library_filename));

    for candidate in candidates {
        if candidate.is_file() {
            std::fs::copy(&candidate, &target).map_err(|source| HelperError::CompanionLibraryMissing {
                target: target.clone(),
                source,
            })?;
            return Ok(target);
        }
    }

    Err(HelperError::CompanionLibraryMissing {
        target,
        source: std::io::Error::new(std::io::ErrorKind::NotFound, "no source copy of the companion library was found"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn finds_executable_relative_to_config_dir() {
        let dir = tempfile_dir();
        let exe = dir.join("tun2socks.exe");
        fs::write(&exe, b"stub").unwrap();

        let found = resolve_executable(Path::new("tun2socks.exe"), &dir, Path::new("/nonexistent")).unwrap();
        assert_eq!(found, exe);

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn errors_with_every_path_tried() {
        let err = resolve_executable(Path::new("missing.exe"), Path::new("/a"), Path::new("/b")).unwrap_err();
        match err {
            HelperError::NotFound { tried } => assert!(tried.len() >= 2),
            _ => panic!("wrong error variant"),
        }
    }

    #[test]
    fn copies_companion_library_from_configured_source() {
        let dir = tempfile_dir();
        let helper_dir = dir.join("helper");
        let source_dir = dir.join("source");
        fs::create_dir_all(&helper_dir).unwrap();
        fs::create_dir_all(&source_dir).unwrap();
        let source_lib = source_dir.join("wintun.dll");
        fs::write(&source_lib, b"stub-dll").unwrap();

        let target = ensure_companion_library(
            Some(&source_lib),
            &helper_dir,
            Path::new("/nonexistent"),
            Path::new("/nonexistent"),
            "wintun.dll",
        )
        .unwrap();

        assert!(target.is_file());
        fs::remove_dir_all(&dir).ok();
    }

    fn tempfile_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("eptun-helper-test-{:?}", std::thread::current().id()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }
}
