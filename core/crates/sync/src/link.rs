//! Last known remote position of every object positioned by a transform.

use sd_sync::{LogicalTimestamp, Oid, Soid};

use serde::{Deserialize, Serialize};

use super::db::{self, key, Tx, LINKS};

#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, Debug)]
pub struct RemoteLink {
	pub parent: Oid,
	pub name: String,
	pub logical_timestamp: LogicalTimestamp,
}

pub fn get(tx: &Tx, child: Soid) -> Result<Option<RemoteLink>, db::Error> {
	tx.get(LINKS, &key::soid(child))
}

pub fn set(tx: &mut Tx, child: Soid, link: &RemoteLink) -> Result<(), db::Error> {
	tx.insert(LINKS, &key::soid(child), link)
}

pub fn remove(tx: &mut Tx, child: Soid) -> Result<Option<RemoteLink>, db::Error> {
	tx.remove(LINKS, &key::soid(child))
}

/// Whether the known position of `child` is at least as recent as `timestamp`.
pub fn is_obsolete(tx: &Tx, child: Soid, timestamp: LogicalTimestamp) -> Result<bool, db::Error> {
	Ok(get(tx, child)?.is_some_and(|link| link.logical_timestamp >= timestamp))
}
