pub mod archive_writer;
pub mod blob_store;

pub use archive_writer::{ArchiveBatchHandler, ArchiveWriterConfig};
pub use blob_store::{blobstore_by_url, blobstores, BlobStore};
