//! On-disk file store: data files and the file registry.

pub mod file_registry;
pub mod page_file;

pub use file_registry::{FileRegistry, REGISTRY_FILE_NAME};
pub use page_file::PageFile;
