pub mod hash;
pub mod store;
pub mod watcher;

pub use hash::{compute_version_hash, generate_version_id};
pub use store::{
    DslVersion, MigrationStatus, VersionError, VersionMigration, VersionStatus, VersionStore,
};
pub use watcher::DrainWatcher;
