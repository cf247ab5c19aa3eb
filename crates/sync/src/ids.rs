use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity of a namespace entry, stable across renames and moves.
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct Oid(Uuid);

impl Oid {
	/// Local root of every store.
	pub const ROOT: Self = Self(Uuid::nil());
	/// Local trash of every store, never exposed to the sequencer.
	pub const TRASH: Self = Self(Uuid::from_u128(u128::MAX));

	#[must_use]
	pub fn new_v4() -> Self {
		Self(Uuid::new_v4())
	}

	#[must_use]
	pub const fn from_uuid(uuid: Uuid) -> Self {
		Self(uuid)
	}

	#[must_use]
	pub const fn as_uuid(&self) -> &Uuid {
		&self.0
	}

	#[must_use]
	pub fn is_root(&self) -> bool {
		*self == Self::ROOT
	}

	#[must_use]
	pub fn is_trash(&self) -> bool {
		*self == Self::TRASH
	}
}

impl From<Uuid> for Oid {
	fn from(uuid: Uuid) -> Self {
		Self(uuid)
	}
}

impl fmt::Display for Oid {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		if self.is_root() {
			write!(f, "root")
		} else if self.is_trash() {
			write!(f, "trash")
		} else {
			write!(f, "{}", self.0.simple())
		}
	}
}

impl fmt::Debug for Oid {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "Oid({self})")
	}
}

/// An independently sequenced namespace root, e.g. a shared folder.
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct StoreId(Uuid);

impl StoreId {
	#[must_use]
	pub fn new_v4() -> Self {
		Self(Uuid::new_v4())
	}

	#[must_use]
	pub const fn from_uuid(uuid: Uuid) -> Self {
		Self(uuid)
	}

	#[must_use]
	pub const fn as_uuid(&self) -> &Uuid {
		&self.0
	}

	/// The id the sequencer uses for this store's root object.
	///
	/// Transforms targeting the store root carry this placeholder, which must be
	/// mapped to [`Oid::ROOT`] before they reach the local namespace.
	#[must_use]
	pub const fn root_oid(&self) -> Oid {
		Oid(self.0)
	}
}

impl fmt::Display for StoreId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0.simple())
	}
}

impl fmt::Debug for StoreId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "StoreId({self})")
	}
}

/// Identity of the device that submitted a transform.
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
#[serde(transparent)]
pub struct DeviceId(Uuid);

impl DeviceId {
	#[must_use]
	pub fn new_v4() -> Self {
		Self(Uuid::new_v4())
	}

	#[must_use]
	pub const fn from_uuid(uuid: Uuid) -> Self {
		Self(uuid)
	}
}

impl fmt::Display for DeviceId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0.simple())
	}
}

/// Store-scoped object id.
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Soid {
	pub store: StoreId,
	pub oid: Oid,
}

impl Soid {
	#[must_use]
	pub const fn new(store: StoreId, oid: Oid) -> Self {
		Self { store, oid }
	}

	#[must_use]
	pub const fn root(store: StoreId) -> Self {
		Self::new(store, Oid::ROOT)
	}

	#[must_use]
	pub const fn trash(store: StoreId) -> Self {
		Self::new(store, Oid::TRASH)
	}

	#[must_use]
	pub const fn with_oid(&self, oid: Oid) -> Self {
		Self::new(self.store, oid)
	}
}

impl fmt::Display for Soid {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}:{}", self.store, self.oid)
	}
}

impl fmt::Debug for Soid {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "Soid({self})")
	}
}

/// Index of a content branch of a file.
///
/// A file has at most two branches: the master branch and a single conflict
/// branch created when a local and a remote edit diverge.
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
#[serde(transparent)]
pub struct Branch(u8);

impl Branch {
	pub const MASTER: Self = Self(0);
	pub const CONFLICT: Self = Self(1);

	#[must_use]
	pub const fn new(index: u8) -> Self {
		Self(index)
	}

	#[must_use]
	pub const fn index(&self) -> u8 {
		self.0
	}
}

impl fmt::Display for Branch {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// A single content branch of a store-scoped object.
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct Sokid {
	pub soid: Soid,
	pub branch: Branch,
}

impl Sokid {
	#[must_use]
	pub const fn new(soid: Soid, branch: Branch) -> Self {
		Self { soid, branch }
	}

	#[must_use]
	pub const fn master(soid: Soid) -> Self {
		Self::new(soid, Branch::MASTER)
	}
}

impl fmt::Display for Sokid {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}#{}", self.soid, self.branch)
	}
}
