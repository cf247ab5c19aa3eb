use sd_sync::{Branch, ObjectType, Oid, Soid, Sokid};

use std::sync::Arc;

use tracing::{debug, trace};

use crate::{
	db::Tx,
	local_changes,
	namespace::{self, ResolvedPath},
	physical::{ContentScheduler, ExpulsionListener, PhysicalStorage},
	version::{self, RemoteContent},
	Error,
};

use super::{ApplyOutcome, DiscardReason};

/// Primitive namespace mutations the reconciliation logic is written against.
///
/// Every primitive must be idempotent: applying it again to a state it already
/// produced changes nothing.
pub trait ApplyOperations: Send + Sync {
	fn exists(&self, tx: &Tx, soid: Soid) -> Result<bool, Error>;

	fn insert(
		&self,
		tx: &mut Tx,
		soid: Soid,
		parent: Oid,
		name: &str,
		object_type: ObjectType,
	) -> Result<(), Error>;

	fn move_object(&self, tx: &mut Tx, soid: Soid, parent: Oid, name: &str) -> Result<(), Error>;

	fn delete(&self, tx: &mut Tx, soid: Soid) -> Result<(), Error>;

	fn new_content(
		&self,
		tx: &mut Tx,
		soid: Soid,
		content: RemoteContent,
	) -> Result<ApplyOutcome, Error>;

	/// Hands everything known locally about `from` over to `to`, after aliasing.
	fn migrate_identity(&self, tx: &mut Tx, from: Soid, to: Oid) -> Result<(), Error>;
}

/// Applies changes to the namespace tables and mirrors them on the device.
pub struct Materializer {
	storage: Arc<dyn PhysicalStorage>,
	content: Arc<dyn ContentScheduler>,
	expulsion: Arc<dyn ExpulsionListener>,
}

impl Materializer {
	pub fn new(
		storage: Arc<dyn PhysicalStorage>,
		content: Arc<dyn ContentScheduler>,
		expulsion: Arc<dyn ExpulsionListener>,
	) -> Self {
		Self {
			storage,
			content,
			expulsion,
		}
	}

	/// Whether `soid` is supposed to be present on the device.
	fn is_visible(tx: &Tx, soid: Soid) -> Result<bool, Error> {
		Ok(!namespace::is_in_trash(tx, soid)? && !namespace::is_expelled(tx, soid)?)
	}

	/// Brings a visible subtree onto the device.
	fn materialize(&self, tx: &Tx, soid: Soid) -> Result<(), Error> {
		let oa = namespace::get_object(tx, soid)?;

		match oa.object_type {
			ObjectType::File => {
				if version::remote_content(tx, soid)?.is_some() {
					self.content.schedule(soid);
				}
			}
			ObjectType::Folder | ObjectType::MountPoint => {
				self.storage
					.create_folder(&namespace::resolve_path(tx, soid)?)?;

				for child in namespace::children(tx, soid)? {
					let child = soid.with_oid(child);

					if !namespace::get_object(tx, child)?.expelled {
						self.materialize(tx, child)?;
					}
				}
			}
		}

		Ok(())
	}

	/// Removes what used to be at `path` from the device.
	fn dematerialize(&self, tx: &Tx, soid: Soid, path: &ResolvedPath) -> Result<(), Error> {
		let oa = namespace::get_object(tx, soid)?;

		match oa.object_type {
			ObjectType::File => {
				for branch in oa.branches.keys() {
					self.storage.delete_file(path, *branch)?;
				}
				self.storage.delete_prefix(Sokid::master(soid))?;
			}
			ObjectType::Folder | ObjectType::MountPoint => self.storage.delete_folder(path)?,
		}

		Ok(())
	}

	fn drop_conflict_branch(&self, tx: &mut Tx, soid: Soid) -> Result<(), Error> {
		let Some(oa) = namespace::get_object_nullable(tx, soid)? else {
			return Ok(());
		};

		if oa.branches.len() > 2 || oa.branches.keys().any(|branch| *branch > Branch::CONFLICT) {
			return Err(Error::Invariant(format!(
				"{soid} has {} content branches",
				oa.branches.len()
			)));
		}

		let conflict = Sokid::new(soid, Branch::CONFLICT);

		if namespace::get_content(tx, conflict)?.is_none() {
			return Ok(());
		}

		let path = namespace::resolve_path(tx, soid)?;
		let visible = Self::is_visible(tx, soid)?;

		namespace::delete_branch(tx, conflict)?;

		if visible {
			self.storage.delete_file(&path, Branch::CONFLICT)?;
		}

		debug!(%soid, "Dropped conflict branch resolved remotely;");

		Ok(())
	}
}

impl ApplyOperations for Materializer {
	fn exists(&self, tx: &Tx, soid: Soid) -> Result<bool, Error> {
		Ok(namespace::get_object_nullable(tx, soid)?.is_some())
	}

	fn insert(
		&self,
		tx: &mut Tx,
		soid: Soid,
		parent: Oid,
		name: &str,
		object_type: ObjectType,
	) -> Result<(), Error> {
		if let Some(oa) = namespace::get_object_nullable(tx, soid)? {
			if oa.object_type == object_type {
				trace!(%soid, "Insert of an existing object;");
				return Ok(());
			}

			return Err(Error::Invariant(format!(
				"cannot insert {soid} as a {object_type}, it exists as a {}",
				oa.object_type
			)));
		}

		namespace::create_object(tx, object_type, soid, parent, name)?;

		if Self::is_visible(tx, soid)? {
			self.materialize(tx, soid)?;
		}

		Ok(())
	}

	fn move_object(&self, tx: &mut Tx, soid: Soid, parent: Oid, name: &str) -> Result<(), Error> {
		let oa = namespace::get_object(tx, soid)?;
		if oa.parent == parent && oa.name == name {
			return Ok(());
		}

		let old_path = namespace::resolve_path(tx, soid)?;
		let was_visible = Self::is_visible(tx, soid)?;

		namespace::set_parent_and_name(tx, soid, parent, name)?;

		let now_visible = Self::is_visible(tx, soid)?;

		match (was_visible, now_visible) {
			(true, true) => self
				.storage
				.move_object(&old_path, &namespace::resolve_path(tx, soid)?)?,
			(true, false) => self.dematerialize(tx, soid, &old_path)?,
			(false, true) => self.materialize(tx, soid)?,
			(false, false) => return Ok(()),
		}

		self.expulsion.object_moved(&old_path, soid);

		Ok(())
	}

	fn delete(&self, tx: &mut Tx, soid: Soid) -> Result<(), Error> {
		self.move_object(tx, soid, Oid::TRASH, &soid.oid.to_string())
	}

	fn new_content(
		&self,
		tx: &mut Tx,
		soid: Soid,
		content: RemoteContent,
	) -> Result<ApplyOutcome, Error> {
		if version::is_content_stale(tx, soid, content.version)? {
			debug!(%soid, version = content.version, "Discarding stale content;");
			return Ok(ApplyOutcome::Discarded(DiscardReason::StaleVersion));
		}

		if let Some(oa) = namespace::get_object_nullable(tx, soid)? {
			if !oa.object_type.is_file() {
				return Err(Error::Invariant(format!(
					"content announced for {soid} which is a {}",
					oa.object_type
				)));
			}
		}

		let local_matches = namespace::get_content(tx, Sokid::master(soid))?
			.is_some_and(|local| local.hash == content.hash && local.size == content.size);

		version::set_content(tx, soid, content.version)?;

		if local_matches {
			local_changes::delete_content_change(tx, soid)?;
			version::remove_remote_content(tx, soid)?;
			self.drop_conflict_branch(tx, soid)?;

			debug!(%soid, "Local content already up to date;");
			return Ok(ApplyOutcome::Applied);
		}

		version::set_remote_content(tx, soid, &content)?;

		if self.exists(tx, soid)? && Self::is_visible(tx, soid)? {
			self.content.schedule(soid);
		} else {
			trace!(%soid, "Content recorded, download waits for the object;");
		}

		Ok(ApplyOutcome::Applied)
	}

	fn migrate_identity(&self, tx: &mut Tx, from: Soid, to: Oid) -> Result<(), Error> {
		let path = namespace::resolve_path(tx, from)?;
		let visible = Self::is_visible(tx, from)?;
		let is_file = namespace::get_object(tx, from)?.object_type.is_file();
		let target = from.with_oid(to);

		namespace::rekey_object(tx, from, to)?;

		if !visible {
			return Ok(());
		}

		self.storage.update_identity(&path, target)?;

		if is_file {
			self.storage.delete_prefix(Sokid::master(from))?;

			let local = namespace::get_content(tx, Sokid::master(target))?;
			let outdated = version::remote_content(tx, target)?.is_some_and(|remote| {
				local.map_or(true, |local| local.hash != remote.hash || local.size != remote.size)
			});

			if outdated {
				self.content.schedule(target);
			}
		}

		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use sd_sync::{ContentHash, DeviceId, StoreId};

	use crate::{namespace::ContentAttributes, testing::Recorders, testing::StorageOp};

	use crate::db::Scratch;

	use super::*;

	fn setup() -> (Scratch, StoreId, Recorders, Materializer) {
		let mut tx = Scratch::new();
		let store = StoreId::new_v4();
		namespace::provision_store(&mut tx, store).unwrap();

		let recorders = Recorders::default();
		let materializer = recorders.materializer();

		(tx, store, recorders, materializer)
	}

	fn content(version: u64, hash: u8) -> RemoteContent {
		RemoteContent {
			version,
			hash: ContentHash::new(vec![hash]),
			size: 1,
			originator: DeviceId::new_v4(),
		}
	}

	#[test]
	fn insert_creates_folders_and_is_idempotent() {
		let (mut tx, store, recorders, ops) = setup();
		let folder = Soid::new(store, Oid::new_v4());

		ops.insert(&mut tx, folder, Oid::ROOT, "docs", ObjectType::Folder)
			.unwrap();
		ops.insert(&mut tx, folder, Oid::ROOT, "docs", ObjectType::Folder)
			.unwrap();

		assert_eq!(
			recorders.storage.ops(),
			[StorageOp::CreateFolder("/docs".to_string())]
		);
		assert!(ops
			.insert(&mut tx, folder, Oid::ROOT, "docs", ObjectType::File)
			.is_err());
	}

	#[test]
	fn delete_moves_to_trash_and_removes_from_disk() {
		let (mut tx, store, recorders, ops) = setup();
		let folder = Soid::new(store, Oid::new_v4());

		ops.insert(&mut tx, folder, Oid::ROOT, "docs", ObjectType::Folder)
			.unwrap();
		ops.delete(&mut tx, folder).unwrap();
		ops.delete(&mut tx, folder).unwrap();

		assert!(namespace::is_in_trash(&tx, folder).unwrap());
		assert_eq!(
			recorders.storage.ops(),
			[
				StorageOp::CreateFolder("/docs".to_string()),
				StorageOp::DeleteFolder("/docs".to_string()),
			]
		);
		assert_eq!(recorders.expulsion.moves(), [("/docs".to_string(), folder)]);
	}

	#[test]
	fn moves_are_mirrored_and_reported() {
		let (mut tx, store, recorders, ops) = setup();
		let a = Soid::new(store, Oid::new_v4());
		let b = Soid::new(store, Oid::new_v4());

		ops.insert(&mut tx, a, Oid::ROOT, "a", ObjectType::Folder).unwrap();
		ops.insert(&mut tx, b, Oid::ROOT, "b", ObjectType::Folder).unwrap();
		ops.move_object(&mut tx, b, a.oid, "b2").unwrap();

		assert_eq!(
			recorders.storage.ops().last(),
			Some(&StorageOp::Move {
				from: "/b".to_string(),
				to: "/a/b2".to_string(),
			})
		);
		assert_eq!(recorders.expulsion.moves(), [("/b".to_string(), b)]);
	}

	#[test]
	fn content_for_missing_file_waits_for_insert() {
		let (mut tx, store, recorders, ops) = setup();
		let file = Soid::new(store, Oid::new_v4());

		assert_eq!(
			ops.new_content(&mut tx, file, content(1, 7)).unwrap(),
			ApplyOutcome::Applied
		);
		assert!(recorders.content.scheduled().is_empty());

		ops.insert(&mut tx, file, Oid::ROOT, "f", ObjectType::File)
			.unwrap();
		assert_eq!(recorders.content.scheduled(), [file]);

		assert_eq!(
			ops.new_content(&mut tx, file, content(1, 7)).unwrap(),
			ApplyOutcome::Discarded(DiscardReason::StaleVersion)
		);
	}

	#[test]
	fn expelled_content_is_not_scheduled() {
		let (mut tx, store, recorders, ops) = setup();
		let folder = Soid::new(store, Oid::new_v4());
		let file = Soid::new(store, Oid::new_v4());

		ops.insert(&mut tx, folder, Oid::ROOT, "d", ObjectType::Folder)
			.unwrap();
		ops.insert(&mut tx, file, folder.oid, "f", ObjectType::File)
			.unwrap();
		namespace::set_expelled(&mut tx, folder, true).unwrap();

		ops.new_content(&mut tx, file, content(1, 7)).unwrap();

		assert!(recorders.content.scheduled().is_empty());
		assert!(version::remote_content(&tx, file).unwrap().is_some());
	}

	#[test]
	fn matching_content_resolves_conflict_branch() {
		let (mut tx, store, recorders, ops) = setup();
		let file = Soid::new(store, Oid::new_v4());

		ops.insert(&mut tx, file, Oid::ROOT, "f", ObjectType::File)
			.unwrap();
		for (branch, hash) in [(Branch::MASTER, 7), (Branch::CONFLICT, 8)] {
			namespace::set_content(
				&mut tx,
				Sokid::new(file, branch),
				ContentAttributes {
					hash: ContentHash::new(vec![hash]),
					size: 1,
				},
			)
			.unwrap();
		}
		local_changes::insert_content_change(&mut tx, file).unwrap();

		assert_eq!(
			ops.new_content(&mut tx, file, content(3, 7)).unwrap(),
			ApplyOutcome::Applied
		);

		assert!(!local_changes::has_content_change(&tx, file).unwrap());
		assert!(namespace::get_content(&tx, Sokid::new(file, Branch::CONFLICT))
			.unwrap()
			.is_none());
		assert_eq!(version::get_content(&tx, file).unwrap(), Some(3));
		assert!(recorders.content.scheduled().is_empty());
		assert_eq!(
			recorders.storage.ops().last(),
			Some(&StorageOp::DeleteFile {
				path: "/f".to_string(),
				branch: Branch::CONFLICT,
			})
		);
	}

	#[test]
	fn migrating_identity_rekeys_and_notifies_storage() {
		let (mut tx, store, recorders, ops) = setup();
		let local = Soid::new(store, Oid::new_v4());
		let remote = Oid::new_v4();

		ops.insert(&mut tx, local, Oid::ROOT, "f", ObjectType::File)
			.unwrap();
		version::set_remote_content(&mut tx, local.with_oid(remote), &content(1, 9)).unwrap();

		ops.migrate_identity(&mut tx, local, remote).unwrap();

		assert!(!ops.exists(&tx, local).unwrap());
		assert!(ops.exists(&tx, local.with_oid(remote)).unwrap());
		assert_eq!(
			recorders.storage.ops(),
			[
				StorageOp::UpdateIdentity {
					path: "/f".to_string(),
					soid: local.with_oid(remote),
				},
				StorageOp::DeletePrefix(Sokid::master(local)),
			]
		);
		assert_eq!(recorders.content.scheduled(), [local.with_oid(remote)]);
	}
}
