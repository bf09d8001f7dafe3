//! Heartbeat file writer: periodically dumps the current time to a file an external
//! liveness/readiness probe polls.
//!
//! Uses the `%Y-%m-%d %H:%M:%S` format so `date -d "$(cat heartbeat.txt)"` parses it
//! directly; the >= 1s minimum period is enforced by [`oper8_core::config::Config::validate`]
//! rather than here. Runs as a `tokio::task`.

use chrono::Local;
use oper8_core::config::Config;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::warn;

const DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub struct HeartbeatWriter {
    shutdown: Arc<Notify>,
    task: Option<JoinHandle<()>>,
}

impl HeartbeatWriter {
    /// Spawns the writer if `config.heartbeat_path` is set; returns `None` otherwise,
    /// since the heartbeat file is an optional external-probe integration.
    #[must_use]
    pub fn spawn(config: &Arc<Config>) -> Option<Self> {
        let path = config.heartbeat_path.clone()?;
        let period = config.heartbeat_period;
        let shutdown = Arc::new(Notify::new());
        let task = tokio::spawn(run_loop(path, period, Arc::clone(&shutdown)));
        Some(Self { shutdown, task: Some(task) })
    }
}

async fn run_loop(path: String, period: std::time::Duration, shutdown: Arc<Notify>) {
    loop {
        write_beat(&path).await;
        tokio::select! {
            _ = tokio::time::sleep(period) => {}
            () = shutdown.notified() => return,
        }
    }
}

async fn write_beat(path: &str) {
    let now = Local::now().format(DATE_FORMAT).to_string();
    if let Err(error) = tokio::fs::write(path, now).await {
        warn!(%error, path, "failed to write heartbeat file");
    }
}

impl Drop for HeartbeatWriter {
    fn drop(&mut self) {
        self.shutdown.notify_waiters();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
