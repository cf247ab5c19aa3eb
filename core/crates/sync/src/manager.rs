use sd_sync::{DeviceId, StoreId};

use std::{collections::HashMap, fmt, sync::Arc};

use tokio::{sync::Mutex, task::spawn_blocking};
use tracing::{debug, info};

use super::{
	apply::{ApplyChange, Materializer},
	config::SyncConfig,
	db::Database,
	echo::LocalEchoDetector,
	fetcher::{ChangeFetcher, TransformSource},
	namespace,
	scheduler::FetchScheduler,
	Error,
};

/// Wires the engine for this device and runs one fetch scheduler per started store.
pub struct Manager {
	config: SyncConfig,
	fetcher: Arc<ChangeFetcher>,
	schedulers: Mutex<HashMap<StoreId, FetchScheduler>>,
}

impl fmt::Debug for Manager {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("SyncManager").finish_non_exhaustive()
	}
}

impl Manager {
	pub fn new(
		config: SyncConfig,
		db: Arc<Database>,
		device: DeviceId,
		source: Arc<dyn TransformSource>,
		materializer: Materializer,
	) -> Self {
		let engine = ApplyChange::new(materializer, Arc::new(LocalEchoDetector::new(device)));

		Self {
			fetcher: Arc::new(ChangeFetcher::new(db, engine, source, config.batch_size)),
			config,
			schedulers: Mutex::default(),
		}
	}

	pub const fn fetcher(&self) -> &Arc<ChangeFetcher> {
		&self.fetcher
	}

	pub fn database(&self) -> &Arc<Database> {
		self.fetcher.database()
	}

	/// Provisions `store` if needed and starts fetching it in the background.
	pub async fn start_store(&self, store: StoreId) -> Result<(), Error> {
		let mut schedulers = self.schedulers.lock().await;

		if schedulers.contains_key(&store) {
			debug!(%store, "Store already started;");
			return Ok(());
		}

		let db = Arc::clone(self.database());
		spawn_blocking(move || db.transaction(|tx| namespace::provision_store(tx, store))).await??;

		schedulers.insert(
			store,
			FetchScheduler::spawn(Arc::clone(&self.fetcher), store, &self.config),
		);

		info!(%store, "Started syncing store;");

		Ok(())
	}

	/// Asks for an immediate fetch of `store`, e.g. after a push notification.
	pub async fn notify(&self, store: StoreId) {
		if let Some(scheduler) = self.schedulers.lock().await.get(&store) {
			scheduler.notify();
		}
	}

	pub async fn stop_store(&self, store: StoreId) {
		let scheduler = self.schedulers.lock().await.remove(&store);

		if let Some(scheduler) = scheduler {
			scheduler.shutdown().await;
			info!(%store, "Stopped syncing store;");
		}
	}

	pub async fn shutdown(&self) {
		let schedulers = std::mem::take(&mut *self.schedulers.lock().await);

		for (_, scheduler) in schedulers {
			scheduler.shutdown().await;
		}
	}
}
