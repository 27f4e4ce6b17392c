//! Output storage service implementation
//!
//! [`OutputService`] binds all writes of one processing stage to a single output directory.
//! Free functions cover reading sources, scanning input directories and writing to an
//! explicitly chosen destination.
//!
//! # Write Model
//!
//! ```text
//! <input_dir>/
//! ├── PRV-001-AB12-45.edf          # source, read-only
//! └── modified_files/              # output directory, created idempotently
//!     ├── .tmpXXXXXX               # staged content (transient)
//!     └── PRV-001-AB12-45.edf      # persisted atomically from the staged file
//! ```
//!
//! The staged file lives in the destination directory so the final rename never crosses a
//! filesystem boundary.

use crate::FilesError;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Service writing de-identified outputs into one directory
///
/// # Design
///
/// - Directory-scoped: each instance is bound to one output directory
/// - Non-destructive: a destination resolving to its own source is rejected
/// - Atomic: content is staged and persisted in one step
#[derive(Debug)]
pub struct OutputService {
    /// Canonicalised output directory
    output_directory: PathBuf,
}

impl OutputService {
    /// Creates the service, creating the output directory if it does not exist yet
    ///
    /// # Errors
    ///
    /// Returns `FilesError` if:
    /// - The directory cannot be created
    /// - The path exists but is not a directory
    /// - Path canonicalisation fails
    pub fn new(output_directory: &Path) -> Result<Self, FilesError> {
        fs::create_dir_all(output_directory).map_err(|e| {
            FilesError::InvalidOutputDirectory(format!(
                "Cannot create {}: {}",
                output_directory.display(),
                e
            ))
        })?;

        if !output_directory.is_dir() {
            return Err(FilesError::InvalidOutputDirectory(format!(
                "Path is not a directory: {}",
                output_directory.display()
            )));
        }

        let output_directory = output_directory.canonicalize().map_err(|e| {
            FilesError::InvalidOutputDirectory(format!(
                "Cannot canonicalize path {}: {}",
                output_directory.display(),
                e
            ))
        })?;

        Ok(Self { output_directory })
    }

    /// Returns the destination path for a source file: same basename, output directory
    ///
    /// # Errors
    ///
    /// Returns `FilesError::InvalidPath` if the source has no file name.
    pub fn output_path_for(&self, source_path: &Path) -> Result<PathBuf, FilesError> {
        let file_name = source_path.file_name().ok_or_else(|| {
            FilesError::InvalidPath(format!("No file name in {}", source_path.display()))
        })?;
        Ok(self.output_directory.join(file_name))
    }

    /// Writes `content` as the output counterpart of `source_path`
    ///
    /// # Returns
    ///
    /// The path of the persisted output file.
    ///
    /// # Errors
    ///
    /// Returns `FilesError` if the destination would overwrite the source or the staged
    /// write / persist fails.
    pub fn write(&self, source_path: &Path, content: &[u8]) -> Result<PathBuf, FilesError> {
        let destination = self.output_path_for(source_path)?;
        write_new_file(source_path, &destination, content)?;
        Ok(destination)
    }

    /// Returns the canonicalised output directory
    #[must_use]
    pub fn output_directory(&self) -> &Path {
        &self.output_directory
    }
}

/// Reads a source file fully into memory
///
/// # Errors
///
/// Returns `FilesError::Io` with the path in the message if the file cannot be read.
pub fn read_source(source_path: &Path) -> Result<Vec<u8>, FilesError> {
    fs::read(source_path).map_err(|e| {
        FilesError::Io(std::io::Error::new(
            e.kind(),
            format!("Failed to read source file {}: {}", source_path.display(), e),
        ))
    })
}

/// Reads a UTF-8 source file fully into memory
///
/// # Errors
///
/// Returns `FilesError::Io` if the file cannot be read or is not valid UTF-8.
pub fn read_source_text(source_path: &Path) -> Result<String, FilesError> {
    fs::read_to_string(source_path).map_err(|e| {
        FilesError::Io(std::io::Error::new(
            e.kind(),
            format!("Failed to read source file {}: {}", source_path.display(), e),
        ))
    })
}

/// Writes `content` to `destination` without ever touching `source_path`
///
/// The parent directory of `destination` is created if needed. The content is staged in a
/// temporary file next to the destination and persisted with a rename, replacing any output
/// left by a previous run.
///
/// # Errors
///
/// Returns `FilesError` if:
/// - `destination` resolves to `source_path` (`SourceOverwrite`)
/// - The destination has no parent or file name (`InvalidPath`)
/// - Staging or persisting fails (`Io`)
pub fn write_new_file(
    source_path: &Path,
    destination: &Path,
    content: &[u8],
) -> Result<(), FilesError> {
    let parent = match destination.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        Some(_) => PathBuf::from("."),
        None => {
            return Err(FilesError::InvalidPath(format!(
                "No parent directory for {}",
                destination.display()
            )))
        }
    };
    fs::create_dir_all(&parent)?;

    if resolves_to_same_file(source_path, destination)? {
        return Err(FilesError::SourceOverwrite(source_path.display().to_string()));
    }

    write_atomic(destination, content)
}

/// Atomically writes `content` to `destination`, creating the parent directory if needed
///
/// Used for derived artefacts (reports) that have no source file to protect.
///
/// # Errors
///
/// Returns `FilesError` if staging or persisting fails.
pub fn write_atomic(destination: &Path, content: &[u8]) -> Result<(), FilesError> {
    let parent = match destination.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)?;

    let mut staged = tempfile::NamedTempFile::new_in(&parent).map_err(|e| {
        FilesError::Io(std::io::Error::new(
            e.kind(),
            format!("Failed to stage output in {}: {}", parent.display(), e),
        ))
    })?;
    staged.write_all(content)?;
    staged.flush()?;
    staged.persist(destination).map_err(|e| {
        FilesError::Io(std::io::Error::new(
            e.error.kind(),
            format!("Failed to write file to {}: {}", destination.display(), e.error),
        ))
    })?;

    tracing::debug!("wrote {} bytes to {}", content.len(), destination.display());
    Ok(())
}

/// Lists regular files in `directory` whose names end with `suffix`
///
/// Names ending with any of `exclude_suffixes` are dropped. The result is sorted
/// lexicographically by path.
///
/// # Errors
///
/// Returns `FilesError::InvalidInputDirectory` if `directory` is not a directory, or
/// `FilesError::Io` if it cannot be read.
pub fn list_inputs(
    directory: &Path,
    suffix: &str,
    exclude_suffixes: &[&str],
) -> Result<Vec<PathBuf>, FilesError> {
    if !directory.is_dir() {
        return Err(FilesError::InvalidInputDirectory(format!(
            "Directory '{}' not found",
            directory.display()
        )));
    }

    let mut inputs = Vec::new();
    for entry in fs::read_dir(directory)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !name.ends_with(suffix) || exclude_suffixes.iter().any(|ex| name.ends_with(ex)) {
            continue;
        }
        inputs.push(path);
    }

    inputs.sort();
    Ok(inputs)
}

fn resolves_to_same_file(source_path: &Path, destination: &Path) -> Result<bool, FilesError> {
    let Ok(source) = source_path.canonicalize() else {
        // A source that does not exist cannot be overwritten.
        return Ok(false);
    };

    let destination = if destination.exists() {
        destination.canonicalize()?
    } else {
        let file_name = destination.file_name().ok_or_else(|| {
            FilesError::InvalidPath(format!("No file name in {}", destination.display()))
        })?;
        let parent = match destination.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        parent.canonicalize()?.join(file_name)
    };

    Ok(source == destination)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_output_service_creates_directory_idempotently() {
        let temp = TempDir::new().unwrap();
        let out = temp.path().join("modified_files");

        let first = OutputService::new(&out).unwrap();
        let second = OutputService::new(&out).unwrap();

        assert!(out.is_dir());
        assert_eq!(first.output_directory(), second.output_directory());
    }

    #[test]
    fn test_output_service_rejects_file_path() {
        let temp = TempDir::new().unwrap();
        let not_a_dir = temp.path().join("file.txt");
        fs::write(&not_a_dir, b"x").unwrap();

        let result = OutputService::new(&not_a_dir);
        assert!(matches!(result, Err(FilesError::InvalidOutputDirectory(_))));
    }

    #[test]
    fn test_write_keeps_basename_and_leaves_source_untouched() {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("PRV-001-AB12-45.edf");
        fs::write(&source, b"original").unwrap();

        let service = OutputService::new(&temp.path().join("modified_files")).unwrap();
        let written = service.write(&source, b"shifted").unwrap();

        assert!(written.ends_with("modified_files/PRV-001-AB12-45.edf"));
        assert_eq!(fs::read(&written).unwrap(), b"shifted");
        assert_eq!(fs::read(&source).unwrap(), b"original");
    }

    #[test]
    fn test_write_replaces_output_from_previous_run() {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("a.xml");
        fs::write(&source, b"<a/>").unwrap();

        let service = OutputService::new(&temp.path().join("out")).unwrap();
        service.write(&source, b"first").unwrap();
        let written = service.write(&source, b"second").unwrap();

        assert_eq!(fs::read(written).unwrap(), b"second");
    }

    #[test]
    fn test_write_new_file_refuses_source_as_destination() {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("in.edf");
        fs::write(&source, b"original").unwrap();

        let result = write_new_file(&source, &source, b"changed");

        assert!(matches!(result, Err(FilesError::SourceOverwrite(_))));
        assert_eq!(fs::read(&source).unwrap(), b"original");
    }

    #[test]
    fn test_output_dir_equal_to_source_dir_is_rejected() {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("in.edf");
        fs::write(&source, b"original").unwrap();

        let service = OutputService::new(temp.path()).unwrap();
        let result = service.write(&source, b"changed");

        assert!(matches!(result, Err(FilesError::SourceOverwrite(_))));
        assert_eq!(fs::read(&source).unwrap(), b"original");
    }

    #[test]
    fn test_write_leaves_no_staged_files_behind() {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("in.edf");
        fs::write(&source, b"original").unwrap();

        let out = temp.path().join("out");
        let service = OutputService::new(&out).unwrap();
        service.write(&source, b"content").unwrap();

        let names: Vec<_> = fs::read_dir(&out)
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names.len(), 1, "only the persisted output should remain");
    }

    #[test]
    fn test_list_inputs_sorted_and_filtered() {
        let temp = TempDir::new().unwrap();
        for name in ["b.edf", "a.edf", "c_modified.edf", "notes.txt"] {
            fs::write(temp.path().join(name), b"x").unwrap();
        }
        fs::create_dir(temp.path().join("dir.edf")).unwrap();

        let inputs = list_inputs(temp.path(), ".edf", &["_modified.edf"]).unwrap();
        let names: Vec<_> = inputs
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();

        assert_eq!(names, vec!["a.edf", "b.edf"]);
    }

    #[test]
    fn test_list_inputs_missing_directory() {
        let result = list_inputs(Path::new("/non-existent/dir"), ".edf", &[]);
        assert!(matches!(result, Err(FilesError::InvalidInputDirectory(_))));
    }

    #[test]
    fn test_read_source_missing_file() {
        let result = read_source(Path::new("/non-existent/file.edf"));
        assert!(matches!(result, Err(FilesError::Io(_))));
    }
}
