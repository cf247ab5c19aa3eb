//! Local edits awaiting acknowledgement by the sequencer.
//!
//! A metadata change records where this device put an object; it is consumed
//! once the sequencer echoes the matching transform back. Content changes only
//! record that a file has locally edited bytes.

use sd_sync::{Oid, Soid, StoreId};

use serde::{Deserialize, Serialize};

use super::db::{self, key, Tx, CONTENT_CHANGES, META_CHANGES};

#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, Debug)]
pub struct LocalChange {
	pub idx: u64,
	pub oid: Oid,
	pub new_parent: Oid,
	pub new_name: String,
}

pub fn insert_change(
	tx: &mut Tx,
	store: StoreId,
	oid: Oid,
	new_parent: Oid,
	new_name: &str,
) -> Result<u64, db::Error> {
	let idx = tx.next_idx()?;

	tx.insert(
		META_CHANGES,
		&key::indexed(store, idx),
		&LocalChange {
			idx,
			oid,
			new_parent,
			new_name: new_name.to_string(),
		},
	)?;

	Ok(idx)
}

pub fn has_outstanding_changes(tx: &Tx, store: StoreId) -> Result<bool, db::Error> {
	Ok(!changes(tx, store)?.is_empty())
}

/// Outstanding changes of `store`, oldest first.
pub fn changes(tx: &Tx, store: StoreId) -> Result<Vec<LocalChange>, db::Error> {
	Ok(tx
		.scan(META_CHANGES, &key::store(store))?
		.into_iter()
		.map(|(_, change)| change)
		.collect())
}

pub fn changes_for(tx: &Tx, soid: Soid) -> Result<Vec<LocalChange>, db::Error> {
	Ok(changes(tx, soid.store)?
		.into_iter()
		.filter(|change| change.oid == soid.oid)
		.collect())
}

pub fn remove_change(tx: &mut Tx, store: StoreId, idx: u64) -> Result<Option<LocalChange>, db::Error> {
	tx.remove(META_CHANGES, &key::indexed(store, idx))
}

pub fn delete_changes(tx: &mut Tx, store: StoreId, oid: Oid) -> Result<(), db::Error> {
	for change in changes_for(tx, Soid::new(store, oid))? {
		remove_change(tx, store, change.idx)?;
	}

	Ok(())
}

/// Rewrites every change of `store` mentioning `from`, as subject or as parent, to `to`.
pub fn redirect_changes(tx: &mut Tx, store: StoreId, from: Oid, to: Oid) -> Result<(), db::Error> {
	for mut change in changes(tx, store)? {
		if change.oid != from && change.new_parent != from {
			continue;
		}

		if change.oid == from {
			change.oid = to;
		}

		if change.new_parent == from {
			change.new_parent = to;
		}

		tx.insert(META_CHANGES, &key::indexed(store, change.idx), &change)?;
	}

	Ok(())
}

pub fn insert_content_change(tx: &mut Tx, soid: Soid) -> Result<(), db::Error> {
	tx.insert(CONTENT_CHANGES, &key::soid(soid), &())
}

pub fn has_content_change(tx: &Tx, soid: Soid) -> Result<bool, db::Error> {
	tx.contains(CONTENT_CHANGES, &key::soid(soid))
}

pub fn delete_content_change(tx: &mut Tx, soid: Soid) -> Result<bool, db::Error> {
	Ok(tx.remove::<()>(CONTENT_CHANGES, &key::soid(soid))?.is_some())
}

pub fn redirect_content_change(tx: &mut Tx, from: Soid, to: Soid) -> Result<(), db::Error> {
	if delete_content_change(tx, from)? {
		insert_content_change(tx, to)?;
	}

	Ok(())
}

#[cfg(test)]
mod tests {
	use crate::db::Scratch;

	use super::*;

	#[test]
	fn changes_are_ordered_and_scoped_per_store() {
		let mut tx = Scratch::new();
		let store = StoreId::new_v4();
		let other = StoreId::new_v4();
		let a = Oid::new_v4();
		let b = Oid::new_v4();

		insert_change(&mut tx, store, a, Oid::ROOT, "a").unwrap();
		insert_change(&mut tx, other, a, Oid::ROOT, "elsewhere").unwrap();
		insert_change(&mut tx, store, b, a, "b").unwrap();

		let oids: Vec<_> = changes(&tx, store)
			.unwrap()
			.into_iter()
			.map(|change| change.oid)
			.collect();
		assert_eq!(oids, [a, b]);

		delete_changes(&mut tx, store, a).unwrap();
		assert!(changes_for(&tx, Soid::new(store, a)).unwrap().is_empty());
		assert_eq!(changes_for(&tx, Soid::new(other, a)).unwrap().len(), 1);
	}

	#[test]
	fn redirect_rewrites_subject_and_parent() {
		let mut tx = Scratch::new();
		let store = StoreId::new_v4();
		let old = Oid::new_v4();
		let new = Oid::new_v4();
		let child = Oid::new_v4();

		insert_change(&mut tx, store, old, Oid::ROOT, "Notes").unwrap();
		insert_change(&mut tx, store, child, old, "todo.md").unwrap();
		insert_content_change(&mut tx, Soid::new(store, old)).unwrap();

		redirect_changes(&mut tx, store, old, new).unwrap();
		redirect_content_change(&mut tx, Soid::new(store, old), Soid::new(store, new)).unwrap();

		assert!(changes(&tx, store)
			.unwrap()
			.iter()
			.all(|change| change.oid != old && change.new_parent != old));
		assert_eq!(changes_for(&tx, Soid::new(store, new)).unwrap().len(), 1);
		assert_eq!(
			changes_for(&tx, Soid::new(store, child)).unwrap()[0].new_parent,
			new
		);
		assert!(has_content_change(&tx, Soid::new(store, new)).unwrap());
		assert!(!has_content_change(&tx, Soid::new(store, old)).unwrap());
	}
}
