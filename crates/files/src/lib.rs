//! De-identification output storage
//!
//! This crate owns every filesystem write made by the de-identification tools.
//!
//! ## Design Principles
//!
//! - Source files are read in full and never opened for writing
//! - Outputs go to a distinct directory, keeping the source basename
//! - Output directories are created once, idempotently (safe under repeated runs)
//! - Writes are all-or-nothing: content is staged in a temporary file beside the
//!   destination and atomically persisted, so a failure never leaves a partial output
//! - Input discovery is deterministic (lexicographic by path)
//!
//! ## Example Usage
//!
//! ```no_run
//! use deid_files::OutputService;
//! use std::path::Path;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let service = OutputService::new(Path::new("recordings/modified_files"))?;
//! let source = Path::new("recordings/PRV-001-AB12-45.edf");
//! let bytes = deid_files::read_source(source)?;
//! let written = service.write(source, &bytes)?;
//! # Ok(())
//! # }
//! ```

mod constants;
mod files;

pub use constants::{MODIFIED_EDF_DIR_NAME, MODIFIED_XML_DIR_NAME};
pub use files::{
    list_inputs, read_source, read_source_text, write_atomic, write_new_file, OutputService,
};

/// Errors that can occur during file operations
#[derive(Debug, thiserror::Error)]
pub enum FilesError {
    /// Input directory does not exist or is not a directory
    #[error("Invalid input directory: {0}")]
    InvalidInputDirectory(String),

    /// Output directory could not be created or is not a directory
    #[error("Invalid output directory: {0}")]
    InvalidOutputDirectory(String),

    /// Path has no usable file name
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// Destination resolves to the source file
    #[error("Refusing to overwrite source file: {0}")]
    SourceOverwrite(String),

    /// I/O error occurred
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
