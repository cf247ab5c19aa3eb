use std::{fmt, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::{DeviceId, Oid};

/// Strictly increasing, per-store sequence number assigned by the sequencer.
pub type LogicalTimestamp = u64;

/// Per-object (or per-parent) version number assigned by the sequencer.
pub type Version = u64;

#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ObjectType {
	File,
	Folder,
	/// Anchor of a shared folder, its identity is meaningful across devices.
	MountPoint,
}

impl ObjectType {
	#[must_use]
	pub const fn is_mount_point(self) -> bool {
		matches!(self, Self::MountPoint)
	}

	#[must_use]
	pub const fn is_file(self) -> bool {
		matches!(self, Self::File)
	}
}

impl fmt::Display for ObjectType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			Self::File => "file",
			Self::Folder => "folder",
			Self::MountPoint => "mount point",
		})
	}
}

#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransformType {
	InsertChild,
	RenameChild,
	RemoveChild,
	UpdateContent,
	/// Anything this client does not understand, rejected when applied.
	#[serde(other)]
	Unknown,
}

impl fmt::Display for TransformType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			Self::InsertChild => "INSERT_CHILD",
			Self::RenameChild => "RENAME_CHILD",
			Self::RemoveChild => "REMOVE_CHILD",
			Self::UpdateContent => "UPDATE_CONTENT",
			Self::Unknown => "UNKNOWN",
		})
	}
}

#[derive(thiserror::Error, Debug)]
#[error("invalid content hash: {0}")]
pub struct InvalidContentHash(#[from] hex::FromHexError);

/// Content hash of a file branch, hex encoded on the wire.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentHash(Vec<u8>);

impl ContentHash {
	#[must_use]
	pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
		Self(bytes.into())
	}

	#[must_use]
	pub fn as_bytes(&self) -> &[u8] {
		&self.0
	}
}

impl FromStr for ContentHash {
	type Err = InvalidContentHash;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Ok(Self(hex::decode(s)?))
	}
}

impl fmt::Display for ContentHash {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&hex::encode(&self.0))
	}
}

impl fmt::Debug for ContentHash {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "ContentHash({self})")
	}
}

impl Serialize for ContentHash {
	fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_str(&hex::encode(&self.0))
	}
}

impl<'de> Deserialize<'de> for ContentHash {
	fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
		let s = String::deserialize(deserializer)?;
		s.parse().map_err(serde::de::Error::custom)
	}
}

/// One authoritative, ordered operation on a store's namespace.
///
/// For the three child operations `oid` is the parent and `child` the object
/// being positioned. For [`TransformType::UpdateContent`] `oid` is the file
/// itself and the child fields are absent.
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Transform {
	pub oid: Oid,
	pub transform_type: TransformType,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub child: Option<Oid>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub child_name: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub child_object_type: Option<ObjectType>,
	pub new_version: Version,
	pub logical_timestamp: LogicalTimestamp,
	pub originator: DeviceId,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub content_hash: Option<ContentHash>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub content_size: Option<u64>,
}

impl Transform {
	#[allow(clippy::too_many_arguments)]
	fn meta(
		transform_type: TransformType,
		parent: Oid,
		child: Oid,
		name: Option<String>,
		object_type: Option<ObjectType>,
		new_version: Version,
		logical_timestamp: LogicalTimestamp,
		originator: DeviceId,
	) -> Self {
		Self {
			oid: parent,
			transform_type,
			child: Some(child),
			child_name: name,
			child_object_type: object_type,
			new_version,
			logical_timestamp,
			originator,
			content_hash: None,
			content_size: None,
		}
	}

	#[must_use]
	pub fn insert_child(
		parent: Oid,
		child: Oid,
		name: impl Into<String>,
		object_type: ObjectType,
		new_version: Version,
		logical_timestamp: LogicalTimestamp,
		originator: DeviceId,
	) -> Self {
		Self::meta(
			TransformType::InsertChild,
			parent,
			child,
			Some(name.into()),
			Some(object_type),
			new_version,
			logical_timestamp,
			originator,
		)
	}

	#[must_use]
	pub fn rename_child(
		parent: Oid,
		child: Oid,
		name: impl Into<String>,
		new_version: Version,
		logical_timestamp: LogicalTimestamp,
		originator: DeviceId,
	) -> Self {
		Self::meta(
			TransformType::RenameChild,
			parent,
			child,
			Some(name.into()),
			None,
			new_version,
			logical_timestamp,
			originator,
		)
	}

	#[must_use]
	pub fn remove_child(
		parent: Oid,
		child: Oid,
		new_version: Version,
		logical_timestamp: LogicalTimestamp,
		originator: DeviceId,
	) -> Self {
		Self::meta(
			TransformType::RemoveChild,
			parent,
			child,
			None,
			None,
			new_version,
			logical_timestamp,
			originator,
		)
	}

	#[must_use]
	pub fn update_content(
		oid: Oid,
		hash: ContentHash,
		size: u64,
		new_version: Version,
		logical_timestamp: LogicalTimestamp,
		originator: DeviceId,
	) -> Self {
		Self {
			oid,
			transform_type: TransformType::UpdateContent,
			child: None,
			child_name: None,
			child_object_type: None,
			new_version,
			logical_timestamp,
			originator,
			content_hash: Some(hash),
			content_size: Some(size),
		}
	}
}

/// Response body of `GET /transforms/{storeRootId}`.
///
/// A missing or empty `transforms` list means the client is caught up.
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct TransformPage {
	pub max_transform_count: u64,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub transforms: Option<Vec<Transform>>,
}

impl TransformPage {
	#[must_use]
	pub fn transforms(&self) -> &[Transform] {
		self.transforms.as_deref().unwrap_or_default()
	}

	#[must_use]
	pub fn into_transforms(self) -> Vec<Transform> {
		self.transforms.unwrap_or_default()
	}

	#[must_use]
	pub fn is_caught_up(&self) -> bool {
		self.transforms().is_empty()
	}
}
