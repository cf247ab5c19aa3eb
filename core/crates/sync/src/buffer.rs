//! Objects whose remote transforms were accepted but not materialized yet.
//!
//! Entries are kept in admission order per store. Re-buffering an object keeps
//! its original position and only raises its merge boundary.

use sd_sync::{ObjectType, Oid, Soid, StoreId};

use serde::{Deserialize, Serialize};
use tracing::trace;

use super::db::{self, key, Tx, BUFFER, BUFFER_INDEX};

#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug)]
pub struct BufferedChange {
	pub oid: Oid,
	pub object_type: ObjectType,
	/// Replay waits until the store's watermark reaches this timestamp.
	pub merge_boundary: u64,
}

fn index(tx: &Tx, soid: Soid) -> Result<Option<u64>, db::Error> {
	tx.get(BUFFER_INDEX, &key::soid(soid))
}

pub fn insert(
	tx: &mut Tx,
	soid: Soid,
	object_type: ObjectType,
	merge_boundary: u64,
) -> Result<(), db::Error> {
	if let Some(idx) = index(tx, soid)? {
		let entry = key::indexed(soid.store, idx);

		if let Some(mut change) = tx.get::<BufferedChange>(BUFFER, &entry)? {
			change.merge_boundary = change.merge_boundary.max(merge_boundary);
			tx.insert(BUFFER, &entry, &change)?;

			trace!(%soid, merge_boundary = change.merge_boundary, "Raised merge boundary of buffered change;");
			return Ok(());
		}
	}

	let idx = tx.next_idx()?;

	tx.insert(
		BUFFER,
		&key::indexed(soid.store, idx),
		&BufferedChange {
			oid: soid.oid,
			object_type,
			merge_boundary,
		},
	)?;
	tx.insert(BUFFER_INDEX, &key::soid(soid), &idx)
}

pub fn is_buffered(tx: &Tx, soid: Soid) -> Result<bool, db::Error> {
	tx.contains(BUFFER_INDEX, &key::soid(soid))
}

pub fn get(tx: &Tx, soid: Soid) -> Result<Option<BufferedChange>, db::Error> {
	match index(tx, soid)? {
		Some(idx) => tx.get(BUFFER, &key::indexed(soid.store, idx)),
		None => Ok(None),
	}
}

pub fn remove(tx: &mut Tx, soid: Soid) -> Result<Option<BufferedChange>, db::Error> {
	match tx.remove::<u64>(BUFFER_INDEX, &key::soid(soid))? {
		Some(idx) => tx.remove(BUFFER, &key::indexed(soid.store, idx)),
		None => Ok(None),
	}
}

/// Oldest entry of `store` eligible for replay at `watermark`.
pub fn next(tx: &Tx, store: StoreId, watermark: u64) -> Result<Option<BufferedChange>, db::Error> {
	Ok(entries(tx, store)?
		.into_iter()
		.find(|change| change.merge_boundary <= watermark))
}

/// Buffered changes of `store`, in admission order.
pub fn entries(tx: &Tx, store: StoreId) -> Result<Vec<BufferedChange>, db::Error> {
	Ok(tx
		.scan(BUFFER, &key::store(store))?
		.into_iter()
		.map(|(_, change)| change)
		.collect())
}

pub fn len(tx: &Tx, store: StoreId) -> Result<usize, db::Error> {
	entries(tx, store).map(|entries| entries.len())
}

#[cfg(test)]
mod tests {
	use crate::db::Scratch;

	use super::*;

	#[test]
	fn keeps_admission_order_and_position() {
		let mut tx = Scratch::new();
		let store = StoreId::new_v4();
		let a = Soid::new(store, Oid::new_v4());
		let b = Soid::new(store, Oid::new_v4());

		insert(&mut tx, a, ObjectType::Folder, 10).unwrap();
		insert(&mut tx, b, ObjectType::File, 5).unwrap();
		insert(&mut tx, a, ObjectType::Folder, 12).unwrap();

		let order: Vec<_> = entries(&tx, store)
			.unwrap()
			.into_iter()
			.map(|change| change.oid)
			.collect();
		assert_eq!(order, [a.oid, b.oid]);
		assert_eq!(
			get(&tx, a).unwrap().map(|change| change.merge_boundary),
			Some(12)
		);
	}

	#[test]
	fn next_honors_merge_boundary() {
		let mut tx = Scratch::new();
		let store = StoreId::new_v4();
		let a = Soid::new(store, Oid::new_v4());
		let b = Soid::new(store, Oid::new_v4());

		insert(&mut tx, a, ObjectType::Folder, 20).unwrap();
		insert(&mut tx, b, ObjectType::File, 5).unwrap();

		assert_eq!(next(&tx, store, 4).unwrap(), None);
		assert_eq!(next(&tx, store, 10).unwrap().map(|change| change.oid), Some(b.oid));
		assert_eq!(next(&tx, store, 20).unwrap().map(|change| change.oid), Some(a.oid));

		assert!(remove(&mut tx, a).unwrap().is_some());
		assert!(!is_buffered(&tx, a).unwrap());
		assert_eq!(len(&tx, store).unwrap(), 1);
	}

	#[test]
	fn stores_do_not_share_a_queue() {
		let mut tx = Scratch::new();
		let one = StoreId::new_v4();
		let other = StoreId::new_v4();

		insert(&mut tx, Soid::new(one, Oid::new_v4()), ObjectType::File, 1).unwrap();

		assert_eq!(len(&tx, one).unwrap(), 1);
		assert_eq!(len(&tx, other).unwrap(), 0);
	}
}
