//! Pulls transforms from the sequencer and feeds them, in order, to the engine.

use sd_cloud_api::{auth::OAuthToken, RequestConfig};
use sd_sync::{LogicalTimestamp, Oid, StoreId, TransformPage};

use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::spawn_blocking;
use tracing::{debug, instrument, trace};

use super::{
	apply::{ApplyChange, ApplyOperations, ApplyOutcome, Materializer, ReplaySummary},
	config::SyncConfig,
	db::{Database, Tx},
	epoch, Error,
};

/// Where pages of transforms come from.
#[async_trait]
pub trait TransformSource: Send + Sync {
	/// At most `count` transforms of `store` with a logical timestamp above `since`.
	async fn fetch(
		&self,
		store: StoreId,
		since: LogicalTimestamp,
		count: u32,
	) -> Result<TransformPage, Error>;
}

/// [`TransformSource`] backed by the sequencer's HTTP API.
#[derive(Debug, Clone)]
pub struct CloudTransformSource {
	config: RequestConfig,
}

impl CloudTransformSource {
	#[must_use]
	pub const fn new(config: RequestConfig) -> Self {
		Self { config }
	}

	#[must_use]
	pub fn from_config(config: &SyncConfig, auth_token: Option<OAuthToken>) -> Self {
		let request_config = RequestConfig::new(&config.api_url);

		Self::new(match auth_token {
			Some(token) => request_config.with_auth_token(token),
			None => request_config,
		})
	}
}

#[async_trait]
impl TransformSource for CloudTransformSource {
	async fn fetch(
		&self,
		store: StoreId,
		since: LogicalTimestamp,
		count: u32,
	) -> Result<TransformPage, Error> {
		sd_cloud_api::transforms::get(&self.config, store, since, count)
			.await
			.map_err(Into::into)
	}
}

/// Result of one [`ChangeFetcher::fetch`] cycle.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FetchReport {
	pub transforms: usize,
	pub last_timestamp: Option<LogicalTimestamp>,
	pub outcomes: Vec<ApplyOutcome>,
	pub replayed: ReplaySummary,
}

impl FetchReport {
	/// Whether any transform was processed, in which case more may be waiting.
	#[must_use]
	pub const fn processed(&self) -> bool {
		self.transforms > 0
	}
}

pub struct ChangeFetcher<O = Materializer> {
	db: Arc<Database>,
	engine: Arc<ApplyChange<O>>,
	source: Arc<dyn TransformSource>,
	batch_size: u32,
}

impl<O: ApplyOperations + 'static> ChangeFetcher<O> {
	pub fn new(
		db: Arc<Database>,
		engine: ApplyChange<O>,
		source: Arc<dyn TransformSource>,
		batch_size: u32,
	) -> Self {
		Self {
			db,
			engine: Arc::new(engine),
			source,
			batch_size: batch_size.max(1),
		}
	}

	pub const fn database(&self) -> &Arc<Database> {
		&self.db
	}

	pub fn engine(&self) -> &ApplyChange<O> {
		&self.engine
	}

	/// Runs `f` as one unit of work on the blocking pool, committed when it returns `Ok`.
	async fn unit_of_work<T, F>(&self, f: F) -> Result<T, Error>
	where
		T: Send + 'static,
		F: FnOnce(&mut Tx, &ApplyChange<O>) -> Result<T, Error> + Send + 'static,
	{
		let db = Arc::clone(&self.db);
		let engine = Arc::clone(&self.engine);

		spawn_blocking(move || db.transaction(|tx| f(tx, &*engine))).await?
	}

	async fn replay(
		&self,
		store: StoreId,
		watermark: LogicalTimestamp,
	) -> Result<ReplaySummary, Error> {
		self.unit_of_work(move |tx, engine| engine.apply_buffered_changes(tx, store, watermark))
			.await
	}

	/// Runs one fetch cycle for `store`: a single page plus buffered replay.
	#[instrument(skip(self), fields(%store), err)]
	pub async fn fetch(&self, store: StoreId) -> Result<FetchReport, Error> {
		let db = Arc::clone(&self.db);
		let Some(watermark) = spawn_blocking(move || db.read(|tx| epoch::get(tx, store))).await??
		else {
			debug!("Store is not provisioned for remote fetch;");
			return Ok(FetchReport::default());
		};

		let mut report = FetchReport {
			replayed: self.replay(store, watermark).await?,
			..Default::default()
		};

		let page = self
			.source
			.fetch(store, watermark, self.batch_size)
			.await?;

		let max_transform_count = page.max_transform_count;
		let transforms = page.into_transforms();

		if transforms.is_empty() {
			trace!(watermark, "Caught up;");
			return Ok(report);
		}

		self.unit_of_work(move |tx, _| {
			epoch::set_progress(tx, store, max_transform_count)?;
			Ok(())
		})
		.await?;

		let mut previous = watermark;

		for mut transform in transforms {
			let ts = transform.logical_timestamp;

			if ts <= previous {
				return Err(Error::OutOfOrder {
					store,
					previous,
					received: ts,
				});
			}

			if transform.oid == store.root_oid() {
				transform.oid = Oid::ROOT;
			}

			let outcome = self
				.unit_of_work(move |tx, engine| {
					let outcome =
						engine.apply(tx, store, &transform, max_transform_count.max(ts))?;
					epoch::set(tx, store, ts)?;

					Ok(outcome)
				})
				.await?;

			trace!(ts, ?outcome, "Applied transform;");

			previous = ts;
			report.transforms += 1;
			report.last_timestamp = Some(ts);
			report.outcomes.push(outcome);
		}

		report.replayed += self.replay(store, previous).await?;

		debug!(
			transforms = report.transforms,
			watermark = previous,
			max_transform_count,
			"Fetched transforms;"
		);

		Ok(report)
	}
}
