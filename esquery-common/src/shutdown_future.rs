use std::future::Future;

use parking_lot::Mutex;
use tokio::{select, spawn, sync::watch, task::JoinHandle};
use tracing::{error, info};

/// A background task that runs until either it finishes on its own or `shutdown()` is called.
#[derive(Debug)]
pub struct ShutdownFuture {
    task: Mutex<Option<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<()>,
    tag: &'static str,
}

async fn shutdown_task<Fut>(fut: Fut, mut shutdown_rx: watch::Receiver<()>, tag: &str)
where
    Fut: Future<Output = ()> + Send + 'static,
{
    select! {
        _ = fut => {
            info!("{}: Task finished on its own.", tag);
        }
        _ = shutdown_rx.changed() => {
            info!("{}: Shutdown signal received. Stopping task.", tag);
        }
    }
}

impl ShutdownFuture {
    pub fn new<Fut>(fut: Fut, tag: &'static str) -> Self
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let task = spawn(shutdown_task(fut, shutdown_rx, tag));
        Self {
            task: Mutex::new(Some(task)),
            shutdown_tx,
            tag,
        }
    }

    pub async fn shutdown(&self) {
        let task = {
            let mut guard = self.task.lock();
            let Some(inner) = guard.take() else {
                error!("{}: Called shutdown() more than once", self.tag);
                return;
            };
            inner
        };

        if task.is_finished() {
            return;
        }

        if let Err(e) = self.shutdown_tx.send(()) {
            error!("{}: Failed to send shutdown to task: {:?}", self.tag, e);
        }
        if let Err(e) = task.await {
            error!("{}: Failed to join task: {:?}", self.tag, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            Arc,
            atomic::{AtomicBool, Ordering},
        },
        time::Duration,
    };

    use super::*;

    #[tokio::test]
    async fn shutdown_stops_pending_task() {
        let stopped = Arc::new(AtomicBool::new(false));
        let stopped_clone = stopped.clone();

        let task = ShutdownFuture::new(
            async move {
                let _guard = DropFlag(stopped_clone);
                std::future::pending::<()>().await;
            },
            "pending",
        );

        tokio::time::sleep(Duration::from_millis(5)).await;
        task.shutdown().await;
        assert!(stopped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn shutdown_after_task_finished_returns() {
        let task = ShutdownFuture::new(async {}, "instant");
        tokio::time::sleep(Duration::from_millis(5)).await;
        task.shutdown().await;
    }

    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }
}
