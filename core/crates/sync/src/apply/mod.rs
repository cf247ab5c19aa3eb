//! Per-transform reconciliation: admission, dispatch and the buffering policy.

use sd_sync::{ObjectType, Oid, Soid, StoreId, Transform, TransformType};

use std::sync::Arc;

use tracing::{debug, instrument, trace};

use super::{
	alias, buffer,
	db::Tx,
	echo::SubmissionCorrelator,
	link::{self, RemoteLink},
	local_changes, namespace,
	version::{self, RemoteContent},
	Error,
};

mod conflict;
mod operations;
mod replay;

pub use operations::{ApplyOperations, Materializer};
pub use replay::ReplaySummary;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DiscardReason {
	/// The parent's version counter already covers the transform.
	StaleVersion,
	/// A more recent position of the child is already known.
	ObsoleteLink,
	/// The transform acknowledges a change made by this device.
	LocalEcho,
	/// Removal from a parent the child has since been moved away from.
	StaleRemove,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ApplyOutcome {
	Applied,
	/// Accepted, materialization waits for buffered replay.
	Buffered,
	/// Removal of a buffered object, resolved by buffered replay.
	Deferred,
	Discarded(DiscardReason),
}

#[derive(Clone, Copy, Debug)]
enum MetaOp {
	Insert,
	Rename,
	Remove,
}

#[derive(Clone, Copy, Debug)]
enum BufferReason {
	ChildBuffered,
	ParentBuffered,
	ParentNotMaterialized,
	OutstandingLocalChanges,
	NameCollision(Oid),
	ParentInSubtree,
}

fn require<T>(value: Option<T>, transform: &Transform, field: &'static str) -> Result<T, Error> {
	value.ok_or(Error::MissingField {
		timestamp: transform.logical_timestamp,
		field,
	})
}

/// Decides, transform by transform, whether to apply, buffer or discard.
pub struct ApplyChange<O = Materializer> {
	ops: O,
	correlator: Arc<dyn SubmissionCorrelator>,
}

impl<O: ApplyOperations> ApplyChange<O> {
	pub fn new(ops: O, correlator: Arc<dyn SubmissionCorrelator>) -> Self {
		Self { ops, correlator }
	}

	pub const fn operations(&self) -> &O {
		&self.ops
	}

	/// Reconciles one transform of `store`.
	///
	/// `merge_boundary` is the watermark the store must reach before a change
	/// buffered by this transform becomes eligible for replay.
	#[instrument(
		skip(self, tx, transform),
		fields(%store, ts = transform.logical_timestamp, kind = %transform.transform_type),
		err
	)]
	pub fn apply(
		&self,
		tx: &mut Tx,
		store: StoreId,
		transform: &Transform,
		merge_boundary: u64,
	) -> Result<ApplyOutcome, Error> {
		let parent = alias::resolve(tx, Soid::new(store, transform.oid))?;

		if !self.ops.exists(tx, parent)? && !buffer::is_buffered(tx, parent)? {
			return Err(Error::UnknownParent(parent));
		}

		let op = match transform.transform_type {
			TransformType::InsertChild => MetaOp::Insert,
			TransformType::RenameChild => MetaOp::Rename,
			TransformType::RemoveChild => MetaOp::Remove,
			TransformType::UpdateContent => return self.apply_content(tx, parent, transform),
			TransformType::Unknown => {
				return Err(Error::UnknownTransformType(transform.logical_timestamp))
			}
		};

		let child = alias::resolve(
			tx,
			Soid::new(store, require(transform.child, transform, "child")?),
		)?;
		let name = match op {
			MetaOp::Insert | MetaOp::Rename => Some(require(
				transform.child_name.as_deref(),
				transform,
				"childName",
			)?),
			MetaOp::Remove => None,
		};
		let ts = transform.logical_timestamp;

		if version::is_stale(tx, parent, transform.new_version)? {
			debug!(%parent, new_version = transform.new_version, "Discarding stale transform;");
			return Ok(ApplyOutcome::Discarded(DiscardReason::StaleVersion));
		}

		if link::is_obsolete(tx, child, ts)? {
			debug!(%child, "Discarding transform obsoleted by a newer link;");
			return Ok(ApplyOutcome::Discarded(DiscardReason::ObsoleteLink));
		}

		let link = link::get(tx, child)?;
		let resolved = Transform {
			oid: parent.oid,
			child: Some(child.oid),
			..transform.clone()
		};

		if self
			.correlator
			.try_match_submitted_change(tx, store, &resolved, link.as_ref())?
		{
			version::set(tx, parent, transform.new_version)?;

			match name {
				Some(name) => link::set(
					tx,
					child,
					&RemoteLink {
						parent: parent.oid,
						name: name.to_string(),
						logical_timestamp: ts,
					},
				)?,
				None => {
					link::remove(tx, child)?;
				}
			}

			debug!(%child, "Discarding echo of a local change;");
			return Ok(ApplyOutcome::Discarded(DiscardReason::LocalEcho));
		}

		version::set(tx, parent, transform.new_version)?;

		match (op, name) {
			(MetaOp::Insert, Some(name)) => {
				let object_type =
					require(transform.child_object_type, transform, "childObjectType")?;

				if self.ops.exists(tx, child)? || link.is_some() {
					// Cross-parent moves reach us as an insert followed by a remove
					self.apply_move(tx, parent, child, name, Some(object_type), ts, merge_boundary)
				} else {
					self.apply_insert(tx, parent, child, name, object_type, ts, merge_boundary)
				}
			}
			(MetaOp::Rename, Some(name)) => self.apply_move(
				tx,
				parent,
				child,
				name,
				transform.child_object_type,
				ts,
				merge_boundary,
			),
			(MetaOp::Remove, _) => self.apply_remove(tx, parent, child, link.as_ref()),
			(MetaOp::Insert | MetaOp::Rename, None) => Err(Error::MissingField {
				timestamp: ts,
				field: "childName",
			}),
		}
	}

	fn collision(
		tx: &Tx,
		parent: Soid,
		name: &str,
		child: Soid,
	) -> Result<Option<BufferReason>, Error> {
		Ok(namespace::get_child_by_name(tx, parent, name)?
			.filter(|occupant| *occupant != child.oid)
			.map(BufferReason::NameCollision))
	}

	#[allow(clippy::too_many_arguments)]
	fn apply_insert(
		&self,
		tx: &mut Tx,
		parent: Soid,
		child: Soid,
		name: &str,
		object_type: ObjectType,
		ts: u64,
		merge_boundary: u64,
	) -> Result<ApplyOutcome, Error> {
		let reason = if buffer::is_buffered(tx, child)? {
			Some(BufferReason::ChildBuffered)
		} else if buffer::is_buffered(tx, parent)? {
			Some(BufferReason::ParentBuffered)
		} else if local_changes::has_outstanding_changes(tx, parent.store)? {
			Some(BufferReason::OutstandingLocalChanges)
		} else {
			Self::collision(tx, parent, name, child)?
		};

		link::set(
			tx,
			child,
			&RemoteLink {
				parent: parent.oid,
				name: name.to_string(),
				logical_timestamp: ts,
			},
		)?;

		if let Some(reason) = reason {
			debug!(%child, %parent, ?reason, "Buffering insert;");
			buffer::insert(tx, child, object_type, merge_boundary)?;
			return Ok(ApplyOutcome::Buffered);
		}

		trace!(%child, %parent, name, "Inserting object;");
		self.ops.insert(tx, child, parent.oid, name, object_type)?;

		Ok(ApplyOutcome::Applied)
	}

	#[allow(clippy::too_many_arguments)]
	fn apply_move(
		&self,
		tx: &mut Tx,
		parent: Soid,
		child: Soid,
		name: &str,
		announced_type: Option<ObjectType>,
		ts: u64,
		merge_boundary: u64,
	) -> Result<ApplyOutcome, Error> {
		let object_type = match namespace::get_object_nullable(tx, child)? {
			Some(oa) => Some(oa.object_type),
			None => buffer::get(tx, child)?.map(|change| change.object_type),
		}
		.or(announced_type)
		.ok_or(Error::MissingField {
			timestamp: ts,
			field: "childObjectType",
		})?;

		let exists = self.ops.exists(tx, child)?;

		let reason = if buffer::is_buffered(tx, child)? {
			Some(BufferReason::ChildBuffered)
		} else if !self.ops.exists(tx, parent)? {
			Some(BufferReason::ParentNotMaterialized)
		} else if exists && namespace::is_ancestor(tx, child.oid, parent)? {
			Some(BufferReason::ParentInSubtree)
		} else {
			Self::collision(tx, parent, name, child)?
		};

		link::set(
			tx,
			child,
			&RemoteLink {
				parent: parent.oid,
				name: name.to_string(),
				logical_timestamp: ts,
			},
		)?;

		if let Some(reason) = reason {
			debug!(%child, %parent, ?reason, "Buffering move;");
			buffer::insert(tx, child, object_type, merge_boundary)?;
			return Ok(ApplyOutcome::Buffered);
		}

		if exists {
			trace!(%child, %parent, name, "Moving object;");
			self.ops.move_object(tx, child, parent.oid, name)?;
		} else {
			trace!(%child, %parent, name, "Inserting previously unmaterialized object;");
			self.ops.insert(tx, child, parent.oid, name, object_type)?;
		}

		Ok(ApplyOutcome::Applied)
	}

	fn apply_remove(
		&self,
		tx: &mut Tx,
		parent: Soid,
		child: Soid,
		link: Option<&RemoteLink>,
	) -> Result<ApplyOutcome, Error> {
		match link {
			Some(link) if link.parent == parent.oid => {}
			Some(link) => {
				debug!(%child, from = %parent, now_under = %link.parent, "Ignoring remove from a former parent;");
				return Ok(ApplyOutcome::Discarded(DiscardReason::StaleRemove));
			}
			None => {
				debug!(%child, "Ignoring remove of an object without remote link;");
				return Ok(ApplyOutcome::Discarded(DiscardReason::StaleRemove));
			}
		}

		link::remove(tx, child)?;

		if buffer::is_buffered(tx, child)? {
			debug!(%child, "Deferring remove of buffered object;");
			return Ok(ApplyOutcome::Deferred);
		}

		if self.ops.exists(tx, child)? {
			trace!(%child, "Deleting object;");
			self.ops.delete(tx, child)?;
		}

		Ok(ApplyOutcome::Applied)
	}

	fn apply_content(
		&self,
		tx: &mut Tx,
		soid: Soid,
		transform: &Transform,
	) -> Result<ApplyOutcome, Error> {
		let content = RemoteContent {
			version: transform.new_version,
			hash: require(transform.content_hash.clone(), transform, "contentHash")?,
			size: require(transform.content_size, transform, "contentSize")?,
			originator: transform.originator,
		};

		self.ops.new_content(tx, soid, content)
	}
}

#[cfg(test)]
mod tests {
	use sd_sync::DeviceId;

	use crate::{db::Scratch, echo::LocalEchoDetector, testing::Recorders};

	use super::*;

	struct Fixture {
		tx: Scratch,
		store: StoreId,
		device: DeviceId,
		remote: DeviceId,
		engine: ApplyChange,
		recorders: Recorders,
	}

	impl Fixture {
		fn new() -> Self {
			let mut tx = Scratch::new();
			let store = StoreId::new_v4();
			namespace::provision_store(&mut tx, store).unwrap();

			let device = DeviceId::new_v4();
			let recorders = Recorders::default();
			let engine = ApplyChange::new(
				recorders.materializer(),
				Arc::new(LocalEchoDetector::new(device)),
			);

			Self {
				tx,
				store,
				device,
				remote: DeviceId::new_v4(),
				engine,
				recorders,
			}
		}

		fn apply(&mut self, transform: &Transform) -> Result<ApplyOutcome, Error> {
			self.engine.apply(&mut self.tx, self.store, transform, transform.logical_timestamp)
		}

		fn soid(&self, oid: Oid) -> Soid {
			Soid::new(self.store, oid)
		}

		fn child(&self, parent: Oid, name: &str) -> Option<Oid> {
			namespace::get_child_by_name(&self.tx, self.soid(parent), name).unwrap()
		}

		fn link(&self, oid: Oid) -> Option<RemoteLink> {
			link::get(&self.tx, self.soid(oid)).unwrap()
		}

		fn parent_of(&self, oid: Oid) -> Oid {
			namespace::get_object(&self.tx, self.soid(oid)).unwrap().parent
		}

		/// Creates an object the way the local scanner would, with an outstanding change.
		fn create_local(&mut self, oid: Oid, name: &str, object_type: ObjectType) {
			let soid = self.soid(oid);

			namespace::create_object(&mut self.tx, object_type, soid, Oid::ROOT, name).unwrap();
			local_changes::insert_change(&mut self.tx, self.store, oid, Oid::ROOT, name).unwrap();
		}
	}

	#[test]
	fn inserts_when_preconditions_hold() {
		let mut f = Fixture::new();
		let folder = Oid::new_v4();

		let outcome = f
			.apply(&Transform::insert_child(Oid::ROOT, folder, "docs", ObjectType::Folder, 1, 1, f.remote))
			.unwrap();

		assert_eq!(outcome, ApplyOutcome::Applied);
		assert_eq!(f.child(Oid::ROOT, "docs"), Some(folder));
		assert_eq!(version::get(&f.tx, f.soid(Oid::ROOT)).unwrap(), Some(1));
		assert_eq!(f.link(folder).map(|link| link.logical_timestamp), Some(1));
	}

	#[test]
	fn unknown_parent_is_a_protocol_error() {
		let mut f = Fixture::new();

		let err = f
			.apply(&Transform::insert_child(Oid::new_v4(), Oid::new_v4(), "x", ObjectType::File, 1, 1, f.remote))
			.unwrap_err();

		assert!(matches!(err, Error::UnknownParent(_)));
		assert!(err.is_protocol());
	}

	#[test]
	fn unknown_transform_type_is_rejected() {
		let mut f = Fixture::new();
		let mut transform = Transform::remove_child(Oid::ROOT, Oid::new_v4(), 1, 1, f.remote);
		transform.transform_type = TransformType::Unknown;

		assert!(matches!(f.apply(&transform), Err(Error::UnknownTransformType(1))));
	}

	#[test]
	fn missing_fields_are_rejected() {
		let mut f = Fixture::new();
		let mut transform =
			Transform::insert_child(Oid::ROOT, Oid::new_v4(), "x", ObjectType::File, 1, 1, f.remote);
		transform.child_name = None;

		assert!(matches!(
			f.apply(&transform),
			Err(Error::MissingField {
				field: "childName",
				..
			})
		));
	}

	#[test]
	fn stale_versions_are_discarded() {
		let mut f = Fixture::new();
		let a = Oid::new_v4();
		let b = Oid::new_v4();

		f.apply(&Transform::insert_child(Oid::ROOT, a, "a", ObjectType::File, 5, 1, f.remote))
			.unwrap();

		let outcome = f
			.apply(&Transform::insert_child(Oid::ROOT, b, "b", ObjectType::File, 5, 2, f.remote))
			.unwrap();

		assert_eq!(outcome, ApplyOutcome::Discarded(DiscardReason::StaleVersion));
		assert_eq!(f.child(Oid::ROOT, "b"), None);
	}

	#[test]
	fn newer_links_make_transforms_obsolete() {
		let mut f = Fixture::new();
		let a = Oid::new_v4();
		let file = Oid::new_v4();

		f.apply(&Transform::insert_child(Oid::ROOT, a, "a", ObjectType::Folder, 1, 1, f.remote))
			.unwrap();
		f.apply(&Transform::insert_child(a, file, "f", ObjectType::File, 1, 5, f.remote))
			.unwrap();

		// An older position under another parent, whose version counter is still low
		let outcome = f
			.apply(&Transform::rename_child(Oid::ROOT, file, "g", 2, 4, f.remote))
			.unwrap();

		assert_eq!(outcome, ApplyOutcome::Discarded(DiscardReason::ObsoleteLink));
		assert_eq!(f.child(a, "f"), Some(file));
	}

	#[test]
	fn outstanding_local_changes_buffer_inserts() {
		let mut f = Fixture::new();
		let mine = Oid::new_v4();
		let theirs = Oid::new_v4();

		f.create_local(mine, "mine", ObjectType::File);

		let outcome = f
			.apply(&Transform::insert_child(Oid::ROOT, theirs, "theirs", ObjectType::File, 1, 1, f.remote))
			.unwrap();

		assert_eq!(outcome, ApplyOutcome::Buffered);
		assert!(buffer::is_buffered(&f.tx, f.soid(theirs)).unwrap());
		assert!(f.link(theirs).is_some());
		assert_eq!(f.child(Oid::ROOT, "theirs"), None);
	}

	#[test]
	fn children_of_buffered_parents_are_buffered() {
		let mut f = Fixture::new();
		let folder = Oid::new_v4();
		let file = Oid::new_v4();

		buffer::insert(&mut f.tx, Soid::new(f.store, folder), ObjectType::Folder, 1).unwrap();

		let outcome = f
			.apply(&Transform::insert_child(folder, file, "f", ObjectType::File, 1, 2, f.remote))
			.unwrap();

		assert_eq!(outcome, ApplyOutcome::Buffered);
	}

	#[test]
	fn name_collisions_buffer_moves() {
		let mut f = Fixture::new();
		let a = Oid::new_v4();
		let b = Oid::new_v4();

		f.apply(&Transform::insert_child(Oid::ROOT, a, "a", ObjectType::File, 1, 1, f.remote))
			.unwrap();
		f.apply(&Transform::insert_child(Oid::ROOT, b, "b", ObjectType::File, 2, 2, f.remote))
			.unwrap();

		let outcome = f
			.apply(&Transform::rename_child(Oid::ROOT, b, "a", 3, 3, f.remote))
			.unwrap();

		assert_eq!(outcome, ApplyOutcome::Buffered);
		assert_eq!(f.child(Oid::ROOT, "b"), Some(b));
		assert_eq!(f.link(b).map(|link| link.name), Some("a".to_string()));
	}

	#[test]
	fn moves_into_unmaterialized_folders_are_buffered() {
		let mut f = Fixture::new();
		let folder = Oid::new_v4();
		let file = Oid::new_v4();

		f.apply(&Transform::insert_child(Oid::ROOT, file, "f", ObjectType::File, 1, 1, f.remote))
			.unwrap();
		buffer::insert(&mut f.tx, Soid::new(f.store, folder), ObjectType::Folder, 2).unwrap();
		let ops = f.recorders.storage.ops();

		let outcome = f
			.apply(&Transform::rename_child(folder, file, "f", 1, 3, f.remote))
			.unwrap();

		assert_eq!(outcome, ApplyOutcome::Buffered);
		assert!(buffer::is_buffered(&f.tx, f.soid(file)).unwrap());
		assert_eq!(f.child(Oid::ROOT, "f"), Some(file));
		assert_eq!(f.link(file).map(|link| link.parent), Some(folder));
		assert_eq!(f.recorders.storage.ops(), ops);
	}

	#[test]
	fn moves_under_own_subtree_are_buffered() {
		let mut f = Fixture::new();
		let parent = Oid::new_v4();
		let child = Oid::new_v4();

		f.apply(&Transform::insert_child(Oid::ROOT, parent, "p", ObjectType::Folder, 1, 1, f.remote))
			.unwrap();
		f.apply(&Transform::insert_child(parent, child, "c", ObjectType::Folder, 1, 2, f.remote))
			.unwrap();

		let outcome = f
			.apply(&Transform::rename_child(child, parent, "p", 1, 3, f.remote))
			.unwrap();

		assert_eq!(outcome, ApplyOutcome::Buffered);
		assert!(buffer::is_buffered(&f.tx, f.soid(parent)).unwrap());
		assert_eq!(f.parent_of(parent), Oid::ROOT);
		assert_eq!(f.parent_of(child), parent);
		assert_eq!(f.child(Oid::ROOT, "p"), Some(parent));
	}

	#[test]
	fn remove_of_unlinked_object_is_stale() {
		let mut f = Fixture::new();
		let mine = Oid::new_v4();

		namespace::create_object(
			&mut f.tx,
			ObjectType::File,
			Soid::new(f.store, mine),
			Oid::ROOT,
			"mine",
		)
		.unwrap();

		let outcome = f
			.apply(&Transform::remove_child(Oid::ROOT, mine, 1, 1, f.remote))
			.unwrap();

		assert_eq!(outcome, ApplyOutcome::Discarded(DiscardReason::StaleRemove));
		assert_eq!(f.child(Oid::ROOT, "mine"), Some(mine));
		assert!(!namespace::is_in_trash(&f.tx, f.soid(mine)).unwrap());
		assert!(f.recorders.storage.ops().is_empty());
	}

	#[test]
	fn remove_of_buffered_object_is_deferred() {
		let mut f = Fixture::new();
		let theirs = Oid::new_v4();

		local_changes::insert_change(&mut f.tx, f.store, Oid::new_v4(), Oid::ROOT, "mine").unwrap();

		f.apply(&Transform::insert_child(Oid::ROOT, theirs, "t", ObjectType::File, 1, 1, f.remote))
			.unwrap();
		let outcome = f
			.apply(&Transform::remove_child(Oid::ROOT, theirs, 2, 2, f.remote))
			.unwrap();

		assert_eq!(outcome, ApplyOutcome::Deferred);
		assert!(f.link(theirs).is_none());
		assert!(buffer::is_buffered(&f.tx, f.soid(theirs)).unwrap());
	}

	#[test]
	fn own_transforms_are_acknowledged_not_reapplied() {
		let mut f = Fixture::new();
		let folder = Oid::new_v4();

		f.create_local(folder, "mine", ObjectType::Folder);

		let outcome = f
			.apply(&Transform::insert_child(Oid::ROOT, folder, "mine", ObjectType::Folder, 1, 1, f.device))
			.unwrap();

		assert_eq!(outcome, ApplyOutcome::Discarded(DiscardReason::LocalEcho));
		assert!(!local_changes::has_outstanding_changes(&f.tx, f.store).unwrap());
		assert_eq!(version::get(&f.tx, f.soid(Oid::ROOT)).unwrap(), Some(1));
		assert_eq!(
			f.link(folder),
			Some(RemoteLink {
				parent: Oid::ROOT,
				name: "mine".to_string(),
				logical_timestamp: 1,
			})
		);
		assert!(f.recorders.storage.ops().is_empty());
	}

	#[test]
	fn aliased_parents_are_resolved() {
		let mut f = Fixture::new();
		let old = Oid::new_v4();
		let new = Oid::new_v4();
		let file = Oid::new_v4();

		f.apply(&Transform::insert_child(Oid::ROOT, new, "Notes", ObjectType::Folder, 1, 1, f.remote))
			.unwrap();
		alias::add_alias(&mut f.tx, Soid::new(f.store, old), new).unwrap();

		f.apply(&Transform::insert_child(old, file, "todo.md", ObjectType::File, 1, 2, f.remote))
			.unwrap();

		assert_eq!(f.child(new, "todo.md"), Some(file));
	}
}
