//! Drives fetch cycles of a store until shut down.

use sd_sync::StoreId;

use std::{sync::Arc, time::Duration};

use futures_concurrency::future::Race;
use tokio::{
	spawn,
	sync::{watch, Notify},
	task::JoinHandle,
	time::sleep,
};
use tracing::{debug, error, trace, warn};

use super::{
	apply::ApplyOperations,
	config::{BackoffConfig, SyncConfig},
	fetcher::ChangeFetcher,
};

/// Background task repeatedly fetching one store.
///
/// Re-polls right away while pages keep coming, waits for the poll interval or
/// a [`FetchScheduler::notify`] once caught up, and backs off exponentially
/// after failures.
pub struct FetchScheduler {
	store: StoreId,
	notify: Arc<Notify>,
	stop_tx: watch::Sender<bool>,
	handle: JoinHandle<()>,
}

impl FetchScheduler {
	pub fn spawn<O: ApplyOperations + 'static>(
		fetcher: Arc<ChangeFetcher<O>>,
		store: StoreId,
		config: &SyncConfig,
	) -> Self {
		let notify = Arc::new(Notify::new());
		let (stop_tx, stop_rx) = watch::channel(false);

		let handle = spawn(run(
			fetcher,
			store,
			config.backoff,
			config.poll_interval(),
			Arc::clone(&notify),
			stop_rx,
		));

		Self {
			store,
			notify,
			stop_tx,
			handle,
		}
	}

	#[must_use]
	pub const fn store(&self) -> StoreId {
		self.store
	}

	/// Fetches as soon as the current wait, or fetch, is over.
	pub fn notify(&self) {
		self.notify.notify_one();
	}

	/// Stops the task once the fetch in progress, if any, has finished.
	pub async fn shutdown(self) {
		if self.stop_tx.send(true).is_err() {
			trace!(store = %self.store, "Fetch scheduler already stopped;");
		}

		if let Err(e) = self.handle.await {
			error!(?e, store = %self.store, "Fetch scheduler task panicked;");
		}
	}
}

async fn run<O: ApplyOperations + 'static>(
	fetcher: Arc<ChangeFetcher<O>>,
	store: StoreId,
	backoff: BackoffConfig,
	poll_interval: Duration,
	notify: Arc<Notify>,
	mut stop_rx: watch::Receiver<bool>,
) {
	enum RaceOutput {
		Elapsed,
		Notified,
		Stopped,
	}

	let mut failures = 0u32;

	debug!(%store, "Fetch scheduler started;");

	loop {
		if *stop_rx.borrow() {
			break;
		}

		let wait = match fetcher.fetch(store).await {
			Ok(report) if report.processed() => {
				failures = 0;
				continue;
			}
			Ok(_) => {
				failures = 0;
				poll_interval
			}
			Err(e) => {
				failures = failures.saturating_add(1);
				let delay = backoff.delay(failures);

				if e.is_protocol() {
					error!(?e, %store, failures, ?delay, "Fetch failed on a protocol error;");
				} else {
					warn!(?e, %store, failures, ?delay, "Fetch failed;");
				}

				delay
			}
		};

		match (
			async {
				sleep(wait).await;
				RaceOutput::Elapsed
			},
			async {
				notify.notified().await;
				RaceOutput::Notified
			},
			async {
				stop_rx.changed().await.ok();
				RaceOutput::Stopped
			},
		)
			.race()
			.await
		{
			RaceOutput::Elapsed => trace!(%store, "Fetch wait elapsed;"),
			RaceOutput::Notified => trace!(%store, "Fetch requested;"),
			RaceOutput::Stopped => break,
		}
	}

	debug!(%store, "Fetch scheduler stopped;");
}
