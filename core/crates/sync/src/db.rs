//! Transactional key-value persistence for the reconciliation engine.
//!
//! Every mutation of the engine's state, and of the collaborator state it reads
//! alongside, happens inside [`Database::transaction`], one `redb` write
//! transaction. An error aborts it and leaves no partial effect behind.
//!
//! Each kind of record lives in its own table. Keys are fixed-width big endian
//! encodings so that range scans follow store, parent and admission order;
//! values are `MessagePack`.

use sd_sync::{Soid, StoreId};

use std::{collections::BTreeMap, fmt, path::Path};

use redb::{
	backends::InMemoryBackend, ReadTransaction, ReadableTable, ReadableTableMetadata,
	TableDefinition, TableHandle, WriteTransaction,
};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, trace, warn};

pub(crate) type Table = TableDefinition<'static, &'static [u8], &'static [u8]>;

pub(crate) const OBJECTS: Table = TableDefinition::new("objects");
/// `(parent, name) -> child` for every object but the store roots and trash.
pub(crate) const CHILDREN: Table = TableDefinition::new("children");
pub(crate) const VERSIONS: Table = TableDefinition::new("versions");
pub(crate) const CONTENT_VERSIONS: Table = TableDefinition::new("content_versions");
pub(crate) const REMOTE_CONTENTS: Table = TableDefinition::new("remote_contents");
pub(crate) const LINKS: Table = TableDefinition::new("links");
pub(crate) const BUFFER: Table = TableDefinition::new("buffer");
pub(crate) const BUFFER_INDEX: Table = TableDefinition::new("buffer_index");
pub(crate) const META_CHANGES: Table = TableDefinition::new("meta_changes");
pub(crate) const CONTENT_CHANGES: Table = TableDefinition::new("content_changes");
pub(crate) const ALIASES: Table = TableDefinition::new("aliases");
pub(crate) const EPOCHS: Table = TableDefinition::new("epochs");
pub(crate) const PROGRESS: Table = TableDefinition::new("progress");
const COUNTERS: Table = TableDefinition::new("counters");

const TABLES: [Table; 14] = [
	OBJECTS,
	CHILDREN,
	VERSIONS,
	CONTENT_VERSIONS,
	REMOTE_CONTENTS,
	LINKS,
	BUFFER,
	BUFFER_INDEX,
	META_CHANGES,
	CONTENT_CHANGES,
	ALIASES,
	EPOCHS,
	PROGRESS,
	COUNTERS,
];

const NEXT_IDX: &[u8] = b"next_idx";

#[derive(thiserror::Error, Debug)]
pub enum Error {
	#[error("failed to open database: {0}")]
	Open(#[from] redb::DatabaseError),
	#[error("failed to begin transaction: {0}")]
	Transaction(#[from] redb::TransactionError),
	#[error("failed to open table: {0}")]
	Table(#[from] redb::TableError),
	#[error("storage error: {0}")]
	Storage(#[from] redb::StorageError),
	#[error("failed to commit transaction: {0}")]
	Commit(#[from] redb::CommitError),
	#[error("failed to encode record: {0}")]
	Encode(#[from] rmp_serde::encode::Error),
	#[error("failed to decode record: {0}")]
	Decode(#[from] rmp_serde::decode::Error),
	#[error("write attempted in a read-only transaction")]
	ReadOnly,
}

/// Key layouts shared by the tables.
pub(crate) mod key {
	use super::{Soid, StoreId};

	#[must_use]
	pub(crate) fn store(store: StoreId) -> Vec<u8> {
		store.as_uuid().as_bytes().to_vec()
	}

	#[must_use]
	pub(crate) fn soid(soid: Soid) -> Vec<u8> {
		let mut key = store(soid.store);
		key.extend_from_slice(soid.oid.as_uuid().as_bytes());
		key
	}

	/// Entries of a per-store queue, in `idx` order.
	#[must_use]
	pub(crate) fn indexed(store: StoreId, idx: u64) -> Vec<u8> {
		let mut key = self::store(store);
		key.extend_from_slice(&idx.to_be_bytes());
		key
	}

	#[must_use]
	pub(crate) fn named(parent: Soid, name: &str) -> Vec<u8> {
		let mut key = soid(parent);
		key.extend_from_slice(name.as_bytes());
		key
	}
}

/// Raw contents of every table, for diagnostics and state comparisons.
pub type Snapshot = BTreeMap<String, Vec<(Vec<u8>, Vec<u8>)>>;

enum Inner {
	Read(ReadTransaction),
	Write(WriteTransaction),
}

/// A unit of work over the database tables.
///
/// Obtained from [`Database::transaction`] (read-write) or [`Database::read`]
/// (read-only); all collaborator functions of this crate take one.
pub struct Tx {
	inner: Inner,
}

impl fmt::Debug for Tx {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Tx")
			.field("writable", &matches!(self.inner, Inner::Write(_)))
			.finish_non_exhaustive()
	}
}

fn get<V: DeserializeOwned>(
	table: &impl ReadableTable<&'static [u8], &'static [u8]>,
	key: &[u8],
) -> Result<Option<V>, Error> {
	match table.get(key)? {
		Some(value) => Ok(Some(rmp_serde::from_slice(value.value())?)),
		None => Ok(None),
	}
}

fn contains(
	table: &impl ReadableTable<&'static [u8], &'static [u8]>,
	key: &[u8],
) -> Result<bool, Error> {
	Ok(table.get(key)?.is_some())
}

fn scan_raw(
	table: &impl ReadableTable<&'static [u8], &'static [u8]>,
	prefix: &[u8],
) -> Result<Vec<(Vec<u8>, Vec<u8>)>, Error> {
	let mut entries = vec![];

	for entry in table.range(prefix..)? {
		let (key, value) = entry?;

		if !key.value().starts_with(prefix) {
			break;
		}

		entries.push((key.value().to_vec(), value.value().to_vec()));
	}

	Ok(entries)
}

impl Tx {
	fn write_txn(&self) -> Result<&WriteTransaction, Error> {
		match &self.inner {
			Inner::Write(txn) => Ok(txn),
			Inner::Read(_) => Err(Error::ReadOnly),
		}
	}

	pub(crate) fn get<V: DeserializeOwned>(
		&self,
		table: Table,
		key: &[u8],
	) -> Result<Option<V>, Error> {
		match &self.inner {
			Inner::Read(txn) => get(&txn.open_table(table)?, key),
			Inner::Write(txn) => get(&txn.open_table(table)?, key),
		}
	}

	pub(crate) fn contains(&self, table: Table, key: &[u8]) -> Result<bool, Error> {
		match &self.inner {
			Inner::Read(txn) => contains(&txn.open_table(table)?, key),
			Inner::Write(txn) => contains(&txn.open_table(table)?, key),
		}
	}

	fn scan_raw(&self, table: Table, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, Error> {
		match &self.inner {
			Inner::Read(txn) => scan_raw(&txn.open_table(table)?, prefix),
			Inner::Write(txn) => scan_raw(&txn.open_table(table)?, prefix),
		}
	}

	/// Every record of `table` whose key starts with `prefix`, in key order.
	pub(crate) fn scan<V: DeserializeOwned>(
		&self,
		table: Table,
		prefix: &[u8],
	) -> Result<Vec<(Vec<u8>, V)>, Error> {
		self.scan_raw(table, prefix)?
			.into_iter()
			.map(|(key, value)| Ok((key, rmp_serde::from_slice(&value)?)))
			.collect()
	}

	pub(crate) fn len(&self, table: Table) -> Result<u64, Error> {
		match &self.inner {
			Inner::Read(txn) => Ok(txn.open_table(table)?.len()?),
			Inner::Write(txn) => Ok(txn.open_table(table)?.len()?),
		}
	}

	pub(crate) fn insert<V: Serialize>(
		&mut self,
		table: Table,
		key: &[u8],
		value: &V,
	) -> Result<(), Error> {
		let bytes = rmp_serde::to_vec(value)?;
		let mut table = self.write_txn()?.open_table(table)?;
		table.insert(key, bytes.as_slice())?;

		Ok(())
	}

	pub(crate) fn remove<V: DeserializeOwned>(
		&mut self,
		table: Table,
		key: &[u8],
	) -> Result<Option<V>, Error> {
		let mut table = self.write_txn()?.open_table(table)?;
		let removed = match table.remove(key)? {
			Some(value) => Some(rmp_serde::from_slice(value.value())?),
			None => None,
		};

		Ok(removed)
	}

	/// Next value of the database-wide sequence used to order queued records.
	pub(crate) fn next_idx(&mut self) -> Result<u64, Error> {
		let idx = self.get::<u64>(COUNTERS, NEXT_IDX)?.unwrap_or(0) + 1;
		self.insert(COUNTERS, NEXT_IDX, &idx)?;

		Ok(idx)
	}

	/// Raw contents of every table.
	pub fn snapshot(&self) -> Result<Snapshot, Error> {
		TABLES
			.iter()
			.map(|table| Ok((table.name().to_string(), self.scan_raw(*table, &[])?)))
			.collect()
	}

	fn commit(self) -> Result<(), Error> {
		if let Inner::Write(txn) = self.inner {
			txn.commit()?;
		}

		Ok(())
	}

	fn abort(self) {
		if let Inner::Write(txn) = self.inner {
			if let Err(e) = txn.abort() {
				warn!(?e, "Failed to abort sync transaction;");
			}
		}
	}
}

pub struct Database {
	db: redb::Database,
}

impl fmt::Debug for Database {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Database").finish_non_exhaustive()
	}
}

impl Database {
	fn init(db: redb::Database) -> Result<Self, Error> {
		let txn = db.begin_write()?;
		for table in TABLES {
			txn.open_table(table)?;
		}
		txn.commit()?;

		Ok(Self { db })
	}

	/// A database that lives only as long as this value.
	pub fn in_memory() -> Result<Self, Error> {
		Self::init(redb::Builder::new().create_with_backend(InMemoryBackend::new())?)
	}

	/// Opens (or creates) a database persisted at `path`.
	pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
		let path = path.as_ref();
		debug!(path = %path.display(), "Opening sync database;");

		Self::init(redb::Database::create(path)?)
	}

	/// Runs `f` as one atomic, durable unit of work.
	pub fn transaction<T, E>(&self, f: impl FnOnce(&mut Tx) -> Result<T, E>) -> Result<T, E>
	where
		E: From<Error>,
	{
		let mut tx = Tx {
			inner: Inner::Write(self.db.begin_write().map_err(Error::from)?),
		};

		match f(&mut tx) {
			Ok(out) => {
				tx.commit()?;
				trace!("Committed sync transaction;");
				Ok(out)
			}
			Err(e) => {
				tx.abort();
				Err(e)
			}
		}
	}

	/// Runs `f` against a snapshot of the last committed state.
	pub fn read<T, E>(&self, f: impl FnOnce(&Tx) -> Result<T, E>) -> Result<T, E>
	where
		E: From<Error>,
	{
		let tx = Tx {
			inner: Inner::Read(self.db.begin_read().map_err(Error::from)?),
		};

		f(&tx)
	}
}

/// A write transaction over a fresh in-memory database, dropped without commit.
#[cfg(test)]
pub(crate) struct Scratch {
	tx: Tx,
	_db: redb::Database,
}

#[cfg(test)]
impl Scratch {
	pub(crate) fn new() -> Self {
		let db = Database::in_memory().expect("failed to create in-memory database");

		Self {
			tx: Tx {
				inner: Inner::Write(db.db.begin_write().expect("failed to begin transaction")),
			},
			_db: db.db,
		}
	}
}

#[cfg(test)]
impl std::ops::Deref for Scratch {
	type Target = Tx;

	fn deref(&self) -> &Tx {
		&self.tx
	}
}

#[cfg(test)]
impl std::ops::DerefMut for Scratch {
	fn deref_mut(&mut self) -> &mut Tx {
		&mut self.tx
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[derive(thiserror::Error, Debug)]
	enum TestError {
		#[error(transparent)]
		Db(#[from] Error),
		#[error("rolled back")]
		Rollback,
	}

	fn epoch(db: &Database, store: StoreId) -> Option<u64> {
		db.read(|tx| tx.get::<u64>(EPOCHS, &key::store(store)))
			.unwrap()
	}

	#[test]
	fn failed_transaction_has_no_effect() {
		let db = Database::in_memory().unwrap();
		let store = StoreId::new_v4();

		db.transaction(|tx| {
			tx.insert(EPOCHS, &key::store(store), &5_u64)?;
			Ok::<_, TestError>(())
		})
		.unwrap();

		let res = db.transaction(|tx| {
			tx.insert(EPOCHS, &key::store(store), &6_u64)?;
			Err::<(), _>(TestError::Rollback)
		});

		assert!(matches!(res, Err(TestError::Rollback)));
		assert_eq!(epoch(&db, store), Some(5));
	}

	#[test]
	fn committed_state_survives_reopen() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("sync.db");
		let store = StoreId::new_v4();
		let root = Soid::root(store);

		{
			let db = Database::open(&path).unwrap();
			db.transaction(|tx| {
				tx.insert(EPOCHS, &key::store(store), &42_u64)?;
				tx.insert(VERSIONS, &key::soid(root), &3_u64)?;
				Ok::<_, Error>(())
			})
			.unwrap();
		}

		let db = Database::open(&path).unwrap();

		assert_eq!(epoch(&db, store), Some(42));
		assert_eq!(
			db.read(|tx| tx.get::<u64>(VERSIONS, &key::soid(root)))
				.unwrap(),
			Some(3)
		);
	}

	#[test]
	fn scans_stop_at_the_prefix() {
		let mut tx = Scratch::new();
		let store = StoreId::new_v4();
		let other = StoreId::new_v4();

		for idx in [3_u64, 1, 2] {
			tx.insert(META_CHANGES, &key::indexed(store, idx), &idx).unwrap();
		}
		tx.insert(META_CHANGES, &key::indexed(other, 0), &0_u64)
			.unwrap();

		let values: Vec<u64> = tx
			.scan(META_CHANGES, &key::store(store))
			.unwrap()
			.into_iter()
			.map(|(_, value)| value)
			.collect();

		assert_eq!(values, [1, 2, 3]);
		assert_eq!(tx.len(META_CHANGES).unwrap(), 4);
	}

	#[test]
	fn reads_cannot_write() {
		let db = Database::in_memory().unwrap();

		let res = db.read(|tx| {
			// Writes need `&mut Tx`, which a read never hands out
			tx.write_txn().map(|_| ())
		});

		assert!(matches!(res, Err(Error::ReadOnly)));
	}

	#[test]
	fn sequence_is_shared_by_every_queue() {
		let mut tx = Scratch::new();

		assert_eq!(tx.next_idx().unwrap(), 1);
		assert_eq!(tx.next_idx().unwrap(), 2);
	}
}
