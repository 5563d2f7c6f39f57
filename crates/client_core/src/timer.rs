use std::{future::Future, time::Duration};

use anyhow::{bail, Result};
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tracing::debug;

/// Fixed-interval job owned by whoever started it. The first tick fires
/// immediately; every tick runs in its own task so a slow run never delays the
/// next one. Dropping the task stops the timer. A zero period is rejected.
pub struct IntervalTask {
    name: &'static str,
    handle: JoinHandle<()>,
}

impl IntervalTask {
    pub fn spawn<F, Fut>(name: &'static str, period: Duration, mut job: F) -> Result<Self>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if period.is_zero() {
            bail!("timer '{name}' needs a non-zero period");
        }
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                tokio::spawn(job());
            }
        });
        debug!(task = name, period_ms = period.as_millis() as u64, "timer: started");
        Ok(Self { name, handle })
    }

    pub fn stop(self) {
        drop(self);
    }
}

impl Drop for IntervalTask {
    fn drop(&mut self) {
        self.handle.abort();
        debug!(task = self.name, "timer: stopped");
    }
}
