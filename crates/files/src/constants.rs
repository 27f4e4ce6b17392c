/// Directory (under the recording directory) receiving shifted EDF files.
pub const MODIFIED_EDF_DIR_NAME: &str = "modified_files";

/// Directory (under the annotation directory) receiving shifted annotation files.
pub const MODIFIED_XML_DIR_NAME: &str = "modified_xml";
