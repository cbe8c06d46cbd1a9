//! Background jobs. Each job body runs on the blocking pool, so a panic inside
//! it comes back as a `JoinError` and the loop carries on with the next run.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, info};

use crate::store::{now_millis, Store};

/// How often the expiry reaper runs by default.
pub const DEFAULT_REAPER_INTERVAL: Duration = Duration::from_secs(60);

/// Run `job` now and then again `every` after each run finishes, forever.
///
/// A job that errors or panics is logged and run again on the next tick.
pub fn run_job_in_background<F>(name: &'static str, every: Duration, job: F) -> JoinHandle<()>
where
    F: Fn() -> Result<()> + Send + Sync + 'static,
{
    let job = Arc::new(job);
    tokio::spawn(async move {
        loop {
            debug!(job_name = name, "executing job");

            let run = Arc::clone(&job);
            match tokio::task::spawn_blocking(move || run()).await {
                Ok(Ok(())) => debug!(job_name = name, "executed job"),
                Ok(Err(e)) => error!(job_name = name, error = %e, "job failed"),
                Err(e) => error!(job_name = name, error = %e, "job aborted"),
            }

            time::sleep(every).await;
        }
    })
}

/// Spawn the reaper that deletes secrets whose TTL has elapsed.
pub fn spawn_expiry_reaper(store: Store, every: Duration) -> JoinHandle<()> {
    run_job_in_background("delete_expired_secrets", every, move || {
        let deleted = store.expire(now_millis())?;
        info!(deleted_secrets = deleted, "deleted expired secrets");
        Ok(())
    })
}
