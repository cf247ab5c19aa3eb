//! Per-store fetch watermarks.

use sd_sync::{LogicalTimestamp, StoreId};

use super::{
	db::{self, key, Tx, EPOCHS, PROGRESS},
	Error,
};

/// Starts fetching `store` from the beginning of its log, unless it already has a watermark.
pub fn init(tx: &mut Tx, store: StoreId) -> Result<(), db::Error> {
	if get(tx, store)?.is_none() {
		tx.insert(EPOCHS, &key::store(store), &0_u64)?;
	}

	Ok(())
}

/// Logical timestamp of the last transform durably applied for `store`.
///
/// `None` means the store is not provisioned for remote fetch.
pub fn get(tx: &Tx, store: StoreId) -> Result<Option<LogicalTimestamp>, db::Error> {
	tx.get(EPOCHS, &key::store(store))
}

pub fn set(tx: &mut Tx, store: StoreId, timestamp: LogicalTimestamp) -> Result<(), Error> {
	let epoch = get(tx, store)?.unwrap_or(0);

	if timestamp < epoch {
		return Err(Error::Invariant(format!(
			"epoch of {store} would go back from {epoch} to {timestamp}"
		)));
	}

	tx.insert(EPOCHS, &key::store(store), &timestamp)?;

	Ok(())
}

/// Last `maxTransformCount` reported by the sequencer, for diagnostics only.
pub fn progress(tx: &Tx, store: StoreId) -> Result<Option<u64>, db::Error> {
	tx.get(PROGRESS, &key::store(store))
}

pub fn set_progress(tx: &mut Tx, store: StoreId, max_transform_count: u64) -> Result<(), db::Error> {
	tx.insert(PROGRESS, &key::store(store), &max_transform_count)
}

#[cfg(test)]
mod tests {
	use crate::db::Scratch;

	use super::*;

	#[test]
	fn watermark_never_goes_back() {
		let mut tx = Scratch::new();
		let store = StoreId::new_v4();

		assert_eq!(get(&tx, store).unwrap(), None);

		init(&mut tx, store).unwrap();
		set(&mut tx, store, 10).unwrap();
		init(&mut tx, store).unwrap();

		assert_eq!(get(&tx, store).unwrap(), Some(10));
		assert!(set(&mut tx, store, 9).is_err());
	}
}
