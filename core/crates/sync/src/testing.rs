//! In-memory collaborators that record what the engine asked of them.

use sd_sync::{Branch, Soid, Sokid};

use std::sync::{
	atomic::{AtomicBool, Ordering},
	Arc, Mutex, PoisonError,
};

use super::{
	apply::Materializer,
	namespace::ResolvedPath,
	physical::{ContentScheduler, ExpulsionListener, PhysicalStorage, StorageError},
};

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum StorageOp {
	CreateFolder(String),
	Move { from: String, to: String },
	DeleteFile { path: String, branch: Branch },
	DeleteFolder(String),
	UpdateIdentity { path: String, soid: Soid },
	DeletePrefix(Sokid),
}

#[derive(Default, Debug)]
pub struct MemoryStorage {
	ops: Mutex<Vec<StorageOp>>,
	fail_next: AtomicBool,
}

impl MemoryStorage {
	pub fn ops(&self) -> Vec<StorageOp> {
		self.ops
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.clone()
	}

	/// Makes the next storage operation fail.
	pub fn fail_next(&self) {
		self.fail_next.store(true, Ordering::SeqCst);
	}

	fn record(&self, op: StorageOp) -> Result<(), StorageError> {
		if self.fail_next.swap(false, Ordering::SeqCst) {
			return Err(StorageError::Other(format!("injected failure on {op:?}")));
		}

		self.ops
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.push(op);

		Ok(())
	}
}

impl PhysicalStorage for MemoryStorage {
	fn create_folder(&self, path: &ResolvedPath) -> Result<(), StorageError> {
		self.record(StorageOp::CreateFolder(path.to_string()))
	}

	fn move_object(&self, from: &ResolvedPath, to: &ResolvedPath) -> Result<(), StorageError> {
		self.record(StorageOp::Move {
			from: from.to_string(),
			to: to.to_string(),
		})
	}

	fn delete_file(&self, path: &ResolvedPath, branch: Branch) -> Result<(), StorageError> {
		self.record(StorageOp::DeleteFile {
			path: path.to_string(),
			branch,
		})
	}

	fn delete_folder(&self, path: &ResolvedPath) -> Result<(), StorageError> {
		self.record(StorageOp::DeleteFolder(path.to_string()))
	}

	fn update_identity(&self, path: &ResolvedPath, soid: Soid) -> Result<(), StorageError> {
		self.record(StorageOp::UpdateIdentity {
			path: path.to_string(),
			soid,
		})
	}

	fn delete_prefix(&self, sokid: Sokid) -> Result<(), StorageError> {
		self.record(StorageOp::DeletePrefix(sokid))
	}
}

#[derive(Default, Debug)]
pub struct RecordingContentScheduler {
	scheduled: Mutex<Vec<Soid>>,
}

impl RecordingContentScheduler {
	pub fn scheduled(&self) -> Vec<Soid> {
		self.scheduled
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.clone()
	}
}

impl ContentScheduler for RecordingContentScheduler {
	fn schedule(&self, soid: Soid) {
		self.scheduled
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.push(soid);
	}
}

#[derive(Default, Debug)]
pub struct RecordingExpulsionListener {
	moves: Mutex<Vec<(String, Soid)>>,
}

impl RecordingExpulsionListener {
	pub fn moves(&self) -> Vec<(String, Soid)> {
		self.moves
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.clone()
	}
}

impl ExpulsionListener for RecordingExpulsionListener {
	fn object_moved(&self, old_path: &ResolvedPath, soid: Soid) {
		self.moves
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.push((old_path.to_string(), soid));
	}
}

/// One recorder per collaborator, shared with the [`Materializer`] built from them.
#[derive(Default, Clone, Debug)]
pub struct Recorders {
	pub storage: Arc<MemoryStorage>,
	pub content: Arc<RecordingContentScheduler>,
	pub expulsion: Arc<RecordingExpulsionListener>,
}

impl Recorders {
	#[must_use]
	pub fn materializer(&self) -> Materializer {
		Materializer::new(
			self.storage.clone(),
			self.content.clone(),
			self.expulsion.clone(),
		)
	}
}
