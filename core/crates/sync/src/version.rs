//! Version counters and the remote content known for each file.
//!
//! Metadata versions are kept per parent (the `oid` of child transforms),
//! content versions per file. Both only ever grow.

use sd_sync::{ContentHash, DeviceId, Soid, Version};

use serde::{Deserialize, Serialize};

use super::db::{self, key, Table, Tx, CONTENT_VERSIONS, REMOTE_CONTENTS, VERSIONS};

/// Content announced by the sequencer for a file, fetchable by the content subsystem.
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, Debug)]
pub struct RemoteContent {
	pub version: Version,
	pub hash: ContentHash,
	pub size: u64,
	pub originator: DeviceId,
}

fn raise(tx: &mut Tx, table: Table, soid: Soid, new_version: Version) -> Result<(), db::Error> {
	let version = tx.get::<Version>(table, &key::soid(soid))?.unwrap_or_default();
	tx.insert(table, &key::soid(soid), &version.max(new_version))
}

pub fn get(tx: &Tx, parent: Soid) -> Result<Option<Version>, db::Error> {
	tx.get(VERSIONS, &key::soid(parent))
}

/// Whether a metadata transform at `new_version` is already reflected under `parent`.
pub fn is_stale(tx: &Tx, parent: Soid, new_version: Version) -> Result<bool, db::Error> {
	Ok(get(tx, parent)?.is_some_and(|version| version >= new_version))
}

pub fn set(tx: &mut Tx, parent: Soid, new_version: Version) -> Result<(), db::Error> {
	raise(tx, VERSIONS, parent, new_version)
}

pub fn get_content(tx: &Tx, soid: Soid) -> Result<Option<Version>, db::Error> {
	tx.get(CONTENT_VERSIONS, &key::soid(soid))
}

pub fn is_content_stale(tx: &Tx, soid: Soid, new_version: Version) -> Result<bool, db::Error> {
	Ok(get_content(tx, soid)?.is_some_and(|version| version >= new_version))
}

pub fn set_content(tx: &mut Tx, soid: Soid, new_version: Version) -> Result<(), db::Error> {
	raise(tx, CONTENT_VERSIONS, soid, new_version)
}

pub fn remote_content(tx: &Tx, soid: Soid) -> Result<Option<RemoteContent>, db::Error> {
	tx.get(REMOTE_CONTENTS, &key::soid(soid))
}

pub fn set_remote_content(
	tx: &mut Tx,
	soid: Soid,
	content: &RemoteContent,
) -> Result<(), db::Error> {
	tx.insert(REMOTE_CONTENTS, &key::soid(soid), content)
}

pub fn remove_remote_content(tx: &mut Tx, soid: Soid) -> Result<Option<RemoteContent>, db::Error> {
	tx.remove(REMOTE_CONTENTS, &key::soid(soid))
}
