//! The locally materialized namespace: object attributes, the children index and paths.

use sd_sync::{Branch, ContentHash, ObjectType, Oid, Soid, Sokid, StoreId};

use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};
use tracing::trace;

use super::{
	db::{self, key, Tx, CHILDREN, OBJECTS},
	epoch, Error,
};

#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, Debug)]
pub struct ContentAttributes {
	pub hash: ContentHash,
	pub size: u64,
}

#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, Debug)]
pub struct ObjectAttributes {
	pub soid: Soid,
	pub object_type: ObjectType,
	pub parent: Oid,
	pub name: String,
	/// Excluded from this device by selective sync, along with its whole subtree.
	pub expelled: bool,
	pub branches: BTreeMap<Branch, ContentAttributes>,
}

/// Location of an object relative to its store root, or to the store trash.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ResolvedPath {
	pub store: StoreId,
	pub elements: Vec<String>,
	pub in_trash: bool,
}

impl fmt::Display for ResolvedPath {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		if self.in_trash {
			f.write_str("trash:")?;
		}

		if self.elements.is_empty() {
			return f.write_str("/");
		}

		for element in &self.elements {
			write!(f, "/{element}")?;
		}

		Ok(())
	}
}

fn put(tx: &mut Tx, oa: &ObjectAttributes) -> Result<(), db::Error> {
	tx.insert(OBJECTS, &key::soid(oa.soid), oa)
}

/// Creates the root and trash of `store` and starts fetching it from epoch 0.
pub fn provision_store(tx: &mut Tx, store: StoreId) -> Result<(), db::Error> {
	for (oid, name) in [(Oid::ROOT, ""), (Oid::TRASH, ".trash")] {
		let soid = Soid::new(store, oid);

		if get_object_nullable(tx, soid)?.is_none() {
			put(
				tx,
				&ObjectAttributes {
					soid,
					object_type: ObjectType::Folder,
					parent: oid,
					name: name.to_string(),
					expelled: false,
					branches: BTreeMap::new(),
				},
			)?;
		}
	}

	epoch::init(tx, store)
}

pub fn get_object_nullable(tx: &Tx, soid: Soid) -> Result<Option<ObjectAttributes>, db::Error> {
	tx.get(OBJECTS, &key::soid(soid))
}

pub fn get_object(tx: &Tx, soid: Soid) -> Result<ObjectAttributes, Error> {
	get_object_nullable(tx, soid)?.ok_or(Error::ObjectNotFound(soid))
}

fn occupy(tx: &mut Tx, parent: Soid, name: &str, oid: Oid) -> Result<(), Error> {
	match get_child_by_name(tx, parent, name)? {
		Some(occupant) if occupant != oid => Err(Error::Invariant(format!(
			"name '{name}' under {parent} already taken by {occupant}"
		))),
		_ => {
			tx.insert(CHILDREN, &key::named(parent, name), &oid)?;
			Ok(())
		}
	}
}

/// Creates `soid` under `parent`, a no-op if it already exists with the same type.
pub fn create_object(
	tx: &mut Tx,
	object_type: ObjectType,
	soid: Soid,
	parent: Oid,
	name: &str,
) -> Result<(), Error> {
	if let Some(existing) = get_object_nullable(tx, soid)? {
		if existing.object_type == object_type {
			trace!(%soid, "Object already exists;");
			return Ok(());
		}

		return Err(Error::Invariant(format!(
			"{soid} exists as a {} but was created as a {object_type}",
			existing.object_type
		)));
	}

	let parent_soid = soid.with_oid(parent);
	get_object(tx, parent_soid)?;
	occupy(tx, parent_soid, name, soid.oid)?;

	put(
		tx,
		&ObjectAttributes {
			soid,
			object_type,
			parent,
			name: name.to_string(),
			expelled: false,
			branches: BTreeMap::new(),
		},
	)?;

	Ok(())
}

pub fn set_parent_and_name(
	tx: &mut Tx,
	soid: Soid,
	parent: Oid,
	name: &str,
) -> Result<(), Error> {
	let mut oa = get_object(tx, soid)?;

	if oa.parent == parent && oa.name == name {
		return Ok(());
	}

	if soid.oid.is_root() || soid.oid.is_trash() {
		return Err(Error::Invariant(format!("{soid} cannot be moved")));
	}

	let parent_soid = soid.with_oid(parent);
	get_object(tx, parent_soid)?;

	if is_ancestor(tx, soid.oid, parent_soid)? {
		return Err(Error::Invariant(format!(
			"moving {soid} under {parent_soid} would detach it from the root"
		)));
	}

	occupy(tx, parent_soid, name, soid.oid)?;
	tx.remove::<Oid>(CHILDREN, &key::named(soid.with_oid(oa.parent), &oa.name))?;

	oa.parent = parent;
	oa.name = name.to_string();
	put(tx, &oa)?;

	Ok(())
}

pub fn get_child_by_name(tx: &Tx, parent: Soid, name: &str) -> Result<Option<Oid>, db::Error> {
	tx.get(CHILDREN, &key::named(parent, name))
}

pub fn children(tx: &Tx, parent: Soid) -> Result<Vec<Oid>, db::Error> {
	Ok(tx
		.scan(CHILDREN, &key::soid(parent))?
		.into_iter()
		.map(|(_, oid)| oid)
		.collect())
}

/// Walks from `soid` up to the store root or trash, `soid` included.
fn ancestors(tx: &Tx, soid: Soid) -> Result<Vec<ObjectAttributes>, Error> {
	let mut chain = Vec::new();
	let mut current = soid;

	for _ in 0..=tx.len(OBJECTS)? {
		let oa = get_object(tx, current)?;
		let reached_top = current.oid.is_root() || current.oid.is_trash();

		current = current.with_oid(oa.parent);
		chain.push(oa);

		if reached_top {
			return Ok(chain);
		}
	}

	Err(Error::Invariant(format!(
		"parent chain of {soid} does not reach the root"
	)))
}

/// Whether `ancestor` is `soid` itself or one of its ancestors.
pub fn is_ancestor(tx: &Tx, ancestor: Oid, soid: Soid) -> Result<bool, Error> {
	Ok(ancestors(tx, soid)?
		.iter()
		.any(|oa| oa.soid.oid == ancestor))
}

pub fn resolve_path(tx: &Tx, soid: Soid) -> Result<ResolvedPath, Error> {
	let chain = ancestors(tx, soid)?;
	let in_trash = chain.last().is_some_and(|oa| oa.soid.oid.is_trash());

	Ok(ResolvedPath {
		store: soid.store,
		elements: chain
			.iter()
			.rev()
			.skip(1)
			.map(|oa| oa.name.clone())
			.collect(),
		in_trash,
	})
}

pub fn is_in_trash(tx: &Tx, soid: Soid) -> Result<bool, Error> {
	Ok(ancestors(tx, soid)?
		.last()
		.is_some_and(|oa| oa.soid.oid.is_trash()))
}

pub fn is_expelled(tx: &Tx, soid: Soid) -> Result<bool, Error> {
	Ok(ancestors(tx, soid)?.iter().any(|oa| oa.expelled))
}

pub fn set_expelled(tx: &mut Tx, soid: Soid, expelled: bool) -> Result<(), Error> {
	let mut oa = get_object(tx, soid)?;
	oa.expelled = expelled;
	put(tx, &oa)?;

	Ok(())
}

pub fn get_content(tx: &Tx, sokid: Sokid) -> Result<Option<ContentAttributes>, db::Error> {
	Ok(get_object_nullable(tx, sokid.soid)?
		.and_then(|mut oa| oa.branches.remove(&sokid.branch)))
}

pub fn get_content_hash(tx: &Tx, sokid: Sokid) -> Result<Option<ContentHash>, db::Error> {
	Ok(get_content(tx, sokid)?.map(|content| content.hash))
}

/// Records locally available content for a branch of a file.
pub fn set_content(tx: &mut Tx, sokid: Sokid, content: ContentAttributes) -> Result<(), Error> {
	if sokid.branch > Branch::CONFLICT {
		return Err(Error::Invariant(format!(
			"{sokid} exceeds the two branches a file may have"
		)));
	}

	let mut oa = get_object(tx, sokid.soid)?;

	if !oa.object_type.is_file() {
		return Err(Error::Invariant(format!(
			"{} is a {} and has no content",
			sokid.soid, oa.object_type
		)));
	}

	oa.branches.insert(sokid.branch, content);
	put(tx, &oa)?;

	Ok(())
}

/// Returns whether the branch existed.
pub fn delete_branch(tx: &mut Tx, sokid: Sokid) -> Result<bool, Error> {
	let mut oa = get_object(tx, sokid.soid)?;
	let existed = oa.branches.remove(&sokid.branch).is_some();

	if existed {
		put(tx, &oa)?;
	}

	Ok(existed)
}

/// Moves an object, and the parent reference of its children, from `from` to `to`.
pub fn rekey_object(tx: &mut Tx, from: Soid, to: Oid) -> Result<(), Error> {
	let target = from.with_oid(to);

	if get_object_nullable(tx, target)?.is_some() {
		return Err(Error::Invariant(format!(
			"cannot rekey {from}, {target} already exists"
		)));
	}

	let mut oa = tx
		.remove::<ObjectAttributes>(OBJECTS, &key::soid(from))?
		.ok_or(Error::ObjectNotFound(from))?;

	oa.soid = target;
	tx.insert(CHILDREN, &key::named(from.with_oid(oa.parent), &oa.name), &to)?;
	put(tx, &oa)?;

	for child in children(tx, from)? {
		let Some(mut child_oa) = get_object_nullable(tx, from.with_oid(child))? else {
			continue;
		};

		child_oa.parent = to;
		tx.remove::<Oid>(CHILDREN, &key::named(from, &child_oa.name))?;
		tx.insert(CHILDREN, &key::named(target, &child_oa.name), &child)?;
		put(tx, &child_oa)?;
	}

	Ok(())
}
