pub mod export_blobs;
pub mod export_repo;
pub mod init;
pub mod inspect;
pub mod job;
pub mod version;

pub use export_blobs::ExportBlobs;
pub use export_repo::ExportRepo;
pub use init::Init;
pub use inspect::Inspect;
pub use version::Version;
