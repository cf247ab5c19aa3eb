//! Client-side reconciliation of a local namespace against the sequencer's transform log.
//!
//! Transforms are pulled page by page by the [`ChangeFetcher`], each one applied
//! by [`ApplyChange`] inside its own [`db::Database::transaction`]. Transforms
//! whose preconditions cannot be met yet are buffered and replayed once the
//! page head has been reached, resolving name conflicts on the way.

#![warn(
	clippy::all,
	clippy::pedantic,
	clippy::correctness,
	clippy::perf,
	clippy::style,
	clippy::suspicious,
	clippy::complexity,
	clippy::nursery,
	clippy::unwrap_used,
	unused_qualifications,
	rust_2018_idioms,
	trivial_casts,
	trivial_numeric_casts,
	unused_allocation,
	clippy::unnecessary_cast,
	clippy::cast_lossless,
	clippy::cast_possible_truncation,
	clippy::cast_possible_wrap,
	clippy::cast_precision_loss,
	clippy::cast_sign_loss,
	clippy::dbg_macro,
	clippy::deprecated_cfg_attr,
	clippy::separated_literal_suffix,
	deprecated
)]
#![forbid(deprecated_in_future)]
#![allow(clippy::missing_errors_doc, clippy::module_name_repetitions)]

use sd_sync::{LogicalTimestamp, Soid, StoreId};

pub mod alias;
pub mod apply;
pub mod buffer;
pub mod config;
pub mod db;
pub mod echo;
pub mod epoch;
pub mod fetcher;
pub mod link;
pub mod local_changes;
mod manager;
pub mod namespace;
pub mod physical;
pub mod scheduler;
pub mod testing;
pub mod version;

pub use apply::{ApplyChange, ApplyOutcome, DiscardReason, ReplaySummary};
pub use config::SyncConfig;
pub use db::{Database, Tx};
pub use echo::{LocalEchoDetector, SubmissionCorrelator};
pub use fetcher::{ChangeFetcher, CloudTransformSource, FetchReport, TransformSource};
pub use manager::Manager as SyncManager;
pub use physical::{ContentScheduler, ExpulsionListener, PhysicalStorage, StorageError};
pub use scheduler::FetchScheduler;

#[derive(thiserror::Error, Debug)]
pub enum Error {
	#[error("transform references {0} which is neither present nor buffered")]
	UnknownParent(Soid),
	#[error("out of order transform in store {store}: {received} after {previous}")]
	OutOfOrder {
		store: StoreId,
		previous: LogicalTimestamp,
		received: LogicalTimestamp,
	},
	#[error("unknown transform type at logical timestamp {0}")]
	UnknownTransformType(LogicalTimestamp),
	#[error("transform at logical timestamp {timestamp} is missing `{field}`")]
	MissingField {
		timestamp: LogicalTimestamp,
		field: &'static str,
	},
	#[error("buffered changes form a parent cycle through {0}")]
	BufferCycle(Soid),
	#[error("buffered {child} points at {parent} which is neither materialized nor buffered")]
	DanglingBufferedParent { child: Soid, parent: Soid },
	#[error("object not found: {0}")]
	ObjectNotFound(Soid),
	#[error("invariant violation: {0}")]
	Invariant(String),
	#[error("database error: {0}")]
	Database(#[from] db::Error),
	#[error("physical storage error: {0}")]
	Storage(#[from] StorageError),
	#[error("sequencer error: {0}")]
	CloudApi(#[from] sd_cloud_api::Error),
	#[error("background task failed: {0}")]
	BackgroundTaskFailed(#[from] tokio::task::JoinError),
}

impl Error {
	/// Whether the sequencer handed us something this client cannot make sense of.
	///
	/// Everything else is either a transient backend failure or a local defect.
	#[must_use]
	pub const fn is_protocol(&self) -> bool {
		matches!(
			self,
			Self::UnknownParent(_)
				| Self::OutOfOrder { .. }
				| Self::UnknownTransformType(_)
				| Self::MissingField { .. }
				| Self::BufferCycle(_)
				| Self::DanglingBufferedParent { .. }
		)
	}
}
