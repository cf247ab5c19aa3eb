use sd_sync::{ObjectType, Oid, Soid, StoreId};

use std::{collections::HashSet, ops::AddAssign};

use tracing::{debug, instrument, trace};

use crate::{alias, buffer, db::Tx, link, namespace, Error};

use super::{ApplyChange, ApplyOperations};

#[derive(Clone, Copy, Default, PartialEq, Eq, Debug)]
pub struct ReplaySummary {
	/// Buffered objects put in place, aliased and renamed ones included.
	pub replayed: usize,
	pub aliased: usize,
	pub renamed: usize,
	/// Buffered objects removed remotely in the meantime.
	pub trashed: usize,
}

impl ReplaySummary {
	#[must_use]
	pub const fn is_empty(&self) -> bool {
		self.replayed == 0 && self.trashed == 0
	}
}

impl AddAssign for ReplaySummary {
	fn add_assign(&mut self, rhs: Self) {
		self.replayed += rhs.replayed;
		self.aliased += rhs.aliased;
		self.renamed += rhs.renamed;
		self.trashed += rhs.trashed;
	}
}

impl<O: ApplyOperations> ApplyChange<O> {
	/// Materializes every buffered change of `store` whose merge boundary is at most `watermark`.
	#[instrument(skip(self, tx), fields(%store), err)]
	pub fn apply_buffered_changes(
		&self,
		tx: &mut Tx,
		store: StoreId,
		watermark: u64,
	) -> Result<ReplaySummary, Error> {
		let mut summary = ReplaySummary::default();

		while let Some(change) = buffer::next(tx, store, watermark)? {
			let mut visiting = HashSet::new();
			self.replay(tx, Soid::new(store, change.oid), &mut visiting, &mut summary)?;
		}

		if !summary.is_empty() {
			debug!(?summary, remaining = buffer::len(tx, store)?, "Replayed buffered changes;");
		}

		Ok(summary)
	}

	fn replay(
		&self,
		tx: &mut Tx,
		soid: Soid,
		visiting: &mut HashSet<Oid>,
		summary: &mut ReplaySummary,
	) -> Result<(), Error> {
		visiting.insert(soid.oid);

		// Removed before anything else, so nothing below can process it twice
		let Some(change) = buffer::remove(tx, soid)? else {
			return Ok(());
		};

		let Some(link) = link::get(tx, soid)? else {
			trace!(%soid, "Buffered object was removed remotely;");

			if self.ops.exists(tx, soid)? {
				self.ops.delete(tx, soid)?;
			} else {
				self.ops.insert(
					tx,
					soid,
					Oid::TRASH,
					&soid.oid.to_string(),
					change.object_type,
				)?;
			}

			summary.trashed += 1;
			return Ok(());
		};

		let parent = alias::resolve(tx, soid.with_oid(link.parent))?;

		if visiting.contains(&parent.oid) && !self.ops.exists(tx, parent)? {
			return Err(Error::BufferCycle(soid));
		}

		if buffer::is_buffered(tx, parent)? {
			trace!(%soid, %parent, "Resolving buffered parent first;");
			self.replay(tx, parent, visiting, summary)?;
		}

		if !self.ops.exists(tx, parent)? {
			return Err(Error::DanglingBufferedParent {
				child: soid,
				parent,
			});
		}

		if self.ops.exists(tx, soid)? && namespace::is_ancestor(tx, soid.oid, parent)? {
			return Err(Error::BufferCycle(soid));
		}

		match namespace::get_child_by_name(tx, parent, &link.name)? {
			Some(occupant) if occupant != soid.oid => self.resolve_conflict(
				tx,
				soid,
				change.object_type,
				&link,
				parent,
				parent.with_oid(occupant),
				summary,
			)?,
			_ => self.materialize(tx, soid, parent.oid, &link.name, change.object_type)?,
		}

		summary.replayed += 1;

		Ok(())
	}

	pub(super) fn materialize(
		&self,
		tx: &mut Tx,
		soid: Soid,
		parent: Oid,
		name: &str,
		object_type: ObjectType,
	) -> Result<(), Error> {
		if self.ops.exists(tx, soid)? {
			self.ops.move_object(tx, soid, parent, name)
		} else {
			self.ops.insert(tx, soid, parent, name, object_type)
		}
	}
}
