//! Contracts of the collaborators that act on the device outside the database.
//!
//! They are only invoked when a change is materialized, never for pure
//! buffering decisions.

use sd_sync::{Branch, Soid, Sokid};

use super::namespace::ResolvedPath;

#[derive(thiserror::Error, Debug)]
pub enum StorageError {
	#[error("{0}")]
	Other(String),
}

/// Bytes and folders on disk.
pub trait PhysicalStorage: Send + Sync {
	fn create_folder(&self, path: &ResolvedPath) -> Result<(), StorageError>;

	fn move_object(&self, from: &ResolvedPath, to: &ResolvedPath) -> Result<(), StorageError>;

	fn delete_file(&self, path: &ResolvedPath, branch: Branch) -> Result<(), StorageError>;

	fn delete_folder(&self, path: &ResolvedPath) -> Result<(), StorageError>;

	/// Re-associates whatever is stored at `path` with `soid`.
	fn update_identity(&self, path: &ResolvedPath, soid: Soid) -> Result<(), StorageError>;

	/// Drops partially downloaded content staged for `sokid`.
	fn delete_prefix(&self, sokid: Sokid) -> Result<(), StorageError>;
}

/// Downloads file content announced by the sequencer.
pub trait ContentScheduler: Send + Sync {
	fn schedule(&self, soid: Soid);
}

/// Selective sync bookkeeping.
pub trait ExpulsionListener: Send + Sync {
	fn object_moved(&self, old_path: &ResolvedPath, soid: Soid);
}
