//! Recognition of transforms that only acknowledge this device's own submissions.

use sd_sync::{DeviceId, Oid, Soid, StoreId, Transform, TransformType};

use tracing::{debug, trace};

use super::{db::Tx, link::RemoteLink, local_changes, Error};

pub trait SubmissionCorrelator: Send + Sync {
	/// Returns `true` when `transform` is the acknowledgment of a local change.
	///
	/// Any bookkeeping of the matched local change happens here; the caller
	/// then only records the transform as seen.
	fn try_match_submitted_change(
		&self,
		tx: &mut Tx,
		store: StoreId,
		transform: &Transform,
		link: Option<&RemoteLink>,
	) -> Result<bool, Error>;
}

/// Matches transforms originated by this device against its outstanding local changes.
#[derive(Debug, Clone, Copy)]
pub struct LocalEchoDetector {
	device: DeviceId,
}

impl LocalEchoDetector {
	#[must_use]
	pub const fn new(device: DeviceId) -> Self {
		Self { device }
	}
}

impl SubmissionCorrelator for LocalEchoDetector {
	fn try_match_submitted_change(
		&self,
		tx: &mut Tx,
		store: StoreId,
		transform: &Transform,
		link: Option<&RemoteLink>,
	) -> Result<bool, Error> {
		if transform.originator != self.device {
			return Ok(false);
		}

		let Some(child) = transform.child else {
			return Ok(false);
		};

		let (parent, name) = match transform.transform_type {
			TransformType::InsertChild | TransformType::RenameChild => {
				(transform.oid, transform.child_name.as_deref())
			}
			TransformType::RemoveChild => (Oid::TRASH, None),
			TransformType::UpdateContent | TransformType::Unknown => return Ok(false),
		};

		let pending = local_changes::changes_for(tx, Soid::new(store, child))?;

		let Some(matched) = pending.iter().position(|change| {
			change.new_parent == parent && name.map_or(true, |name| change.new_name == name)
		}) else {
			trace!(%child, ?link, pending = pending.len(), "Own transform matches no outstanding change;");
			return Ok(false);
		};

		// Earlier changes of the same object were superseded by the matched one
		for change in &pending[..=matched] {
			local_changes::remove_change(tx, store, change.idx)?;
		}

		debug!(
			%child,
			consumed = matched + 1,
			ts = transform.logical_timestamp,
			"Acknowledged local change;"
		);

		Ok(true)
	}
}

#[cfg(test)]
mod tests {
	use sd_sync::ObjectType;

	use crate::db::Scratch;

	use super::*;

	#[test]
	fn consumes_matched_and_older_changes() {
		let mut tx = Scratch::new();
		let store = StoreId::new_v4();
		let device = DeviceId::new_v4();
		let detector = LocalEchoDetector::new(device);
		let folder = Oid::new_v4();

		local_changes::insert_change(&mut tx, store, folder, Oid::ROOT, "Draft").unwrap();
		local_changes::insert_change(&mut tx, store, folder, Oid::ROOT, "Notes").unwrap();
		local_changes::insert_change(&mut tx, store, folder, Oid::TRASH, &folder.to_string()).unwrap();

		let insert = Transform::insert_child(Oid::ROOT, folder, "Notes", ObjectType::Folder, 1, 1, device);

		assert!(detector
			.try_match_submitted_change(&mut tx, store, &insert, None)
			.unwrap());

		let remaining = local_changes::changes_for(&tx, Soid::new(store, folder)).unwrap();
		assert_eq!(remaining.len(), 1);
		assert_eq!(remaining[0].new_parent, Oid::TRASH);

		let remove = Transform::remove_child(Oid::ROOT, folder, 2, 2, device);
		assert!(detector
			.try_match_submitted_change(&mut tx, store, &remove, None)
			.unwrap());
		assert!(!local_changes::has_outstanding_changes(&tx, store).unwrap());
	}

	#[test]
	fn ignores_other_devices_and_unmatched_positions() {
		let mut tx = Scratch::new();
		let store = StoreId::new_v4();
		let device = DeviceId::new_v4();
		let detector = LocalEchoDetector::new(device);
		let file = Oid::new_v4();

		local_changes::insert_change(&mut tx, store, file, Oid::ROOT, "a.txt").unwrap();

		let foreign = Transform::insert_child(Oid::ROOT, file, "a.txt", ObjectType::File, 1, 1, DeviceId::new_v4());
		let elsewhere = Transform::insert_child(Oid::ROOT, file, "b.txt", ObjectType::File, 1, 1, device);

		assert!(!detector
			.try_match_submitted_change(&mut tx, store, &foreign, None)
			.unwrap());
		assert!(!detector
			.try_match_submitted_change(&mut tx, store, &elsewhere, None)
			.unwrap());
		assert!(local_changes::has_outstanding_changes(&tx, store).unwrap());
	}
}
