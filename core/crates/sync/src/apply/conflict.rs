use sd_sync::{next_file_name, ObjectType, Soid};

use tracing::info;

use crate::{alias, db::Tx, link, link::RemoteLink, local_changes, namespace, Error};

use super::{ApplyChange, ApplyOperations, ReplaySummary};

/// Most candidates tried by [`next_free_name`].
const MAX_RENAME_ATTEMPTS: usize = 10_000;

/// First name derived from `name` that is free under `parent`.
fn next_free_name(tx: &Tx, parent: Soid, name: &str) -> Result<String, Error> {
	let mut candidate = next_file_name(name);

	for _ in 0..MAX_RENAME_ATTEMPTS {
		if namespace::get_child_by_name(tx, parent, &candidate)?.is_none() {
			return Ok(candidate);
		}

		candidate = next_file_name(&candidate);
	}

	Err(Error::Invariant(format!(
		"no free name derived from '{name}' under {parent} after {MAX_RENAME_ATTEMPTS} attempts"
	)))
}

impl<O: ApplyOperations> ApplyChange<O> {
	/// Puts `incoming` at the position of its remote link, which `incumbent` occupies.
	#[allow(clippy::too_many_arguments)]
	pub(super) fn resolve_conflict(
		&self,
		tx: &mut Tx,
		incoming: Soid,
		object_type: ObjectType,
		link: &RemoteLink,
		parent: Soid,
		incumbent: Soid,
		summary: &mut ReplaySummary,
	) -> Result<(), Error> {
		let incumbent_type = namespace::get_object(tx, incumbent)?.object_type;
		let incumbent_link = link::get(tx, incumbent)?;

		if !self.ops.exists(tx, incoming)?
			&& incumbent_link.is_none()
			&& incumbent_type == object_type
			&& !object_type.is_mount_point()
		{
			info!(%incumbent, %incoming, name = %link.name, "Aliasing local object to its remote twin;");
			self.alias(tx, incumbent, incoming, link)?;
			summary.aliased += 1;
			return Ok(());
		}

		let renamed = next_free_name(tx, parent, &link.name)?;
		let store = incoming.store;

		if incumbent_link.is_some_and(|own| own.logical_timestamp >= link.logical_timestamp) {
			info!(%incoming, %incumbent, %renamed, "Renaming incoming object, incumbent is more recent;");

			self.materialize(tx, incoming, parent.oid, &renamed, object_type)?;
			local_changes::insert_change(tx, store, incoming.oid, parent.oid, &renamed)?;
		} else {
			info!(%incoming, %incumbent, %renamed, "Renaming incumbent away from incoming object;");

			self.ops.move_object(tx, incumbent, parent.oid, &renamed)?;
			local_changes::insert_change(tx, store, incumbent.oid, parent.oid, &renamed)?;

			self.materialize(tx, incoming, parent.oid, &link.name, object_type)?;
		}

		summary.renamed += 1;

		Ok(())
	}

	/// Declares the local-only `source` to be the same object as the remote `target`.
	fn alias(
		&self,
		tx: &mut Tx,
		source: Soid,
		target: Soid,
		link: &RemoteLink,
	) -> Result<(), Error> {
		local_changes::redirect_changes(tx, source.store, source.oid, target.oid)?;
		local_changes::redirect_content_change(tx, source, target)?;

		// The sequencer already has the target where the source was created
		for change in local_changes::changes_for(tx, target)? {
			if change.new_parent == link.parent && change.new_name == link.name {
				local_changes::remove_change(tx, target.store, change.idx)?;
			}
		}

		alias::add_alias(tx, source, target.oid)?;
		self.ops.migrate_identity(tx, source, target.oid)
	}
}
