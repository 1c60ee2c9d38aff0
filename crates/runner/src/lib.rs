//! Runs named long-lived processes side by side and shuts them down together.
//!
//! - Every process receives a clone of one [`CancellationToken`]
//! - SIGINT/SIGTERM, a process error or a panic cancels the token
//! - Closers run afterwards, concurrently, bounded by a timeout
//!
//! # Example
//!
//! ```no_run
//! use meshtopo_runner::Runner;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     Runner::new()
//!         .with_app_process("heartbeat", |ctx| async move {
//!             let mut ticker = tokio::time::interval(Duration::from_secs(5));
//!             loop {
//!                 tokio::select! {
//!                     _ = ctx.cancelled() => return Ok(()),
//!                     _ = ticker.tick() => tracing::info!("alive"),
//!                 }
//!             }
//!         })
//!         .with_closer(|| async move {
//!             tracing::info!("flushing");
//!             Ok(())
//!         })
//!         .run()
//!         .await;
//! }
//! ```

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// A process body: takes the shared cancellation token.
pub type AppProcess = Box<
    dyn FnOnce(CancellationToken) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>
        + Send,
>;

/// Cleanup run after every process has stopped.
pub type Closer = Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>> + Send>;

/// Concurrent process runner with graceful shutdown.
pub struct Runner {
    app_processes: Vec<(String, AppProcess)>,
    closers: Vec<Closer>,
    closer_timeout: Duration,
    cancellation_token: CancellationToken,
}

impl Default for Runner {
    fn default() -> Self {
        Self::new()
    }
}

impl Runner {
    /// Runner with a 10 second closer timeout and nothing registered
    pub fn new() -> Self {
        Self {
            app_processes: Vec::new(),
            closers: Vec::new(),
            closer_timeout: Duration::from_secs(10),
            cancellation_token: CancellationToken::new(),
        }
    }

    /// Register a process. An `Err` from any process stops all of them.
    pub fn with_app_process<F, Fut>(mut self, name: impl Into<String>, process: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.app_processes
            .push((name.into(), Box::new(|token| Box::pin(process(token)))));
        self
    }

    /// Register an already boxed process, as handed out by components
    pub fn with_named_process(mut self, name: impl Into<String>, process: AppProcess) -> Self {
        self.app_processes.push((name.into(), process));
        self
    }

    /// Register cleanup that runs once every process has stopped
    pub fn with_closer<F, Fut>(mut self, closer: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.closers.push(Box::new(|| Box::pin(closer())));
        self
    }

    pub fn with_closer_timeout(mut self, timeout: Duration) -> Self {
        self.closer_timeout = timeout;
        self
    }

    /// Use an externally owned token, e.g. to stop the runner from a test
    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancellation_token = token;
        self
    }

    /// Run until stopped, then exit the process: code 1 if a process
    /// failed, 0 otherwise.
    pub async fn run(self) {
        spawn_signal_handlers(self.cancellation_token.clone());

        match self.run_until_stopped().await {
            Ok(()) => {
                tracing::info!("application exiting normally");
                std::process::exit(0);
            }
            Err(err) => {
                tracing::error!(error = %format!("{:#}", err), "application exiting with error");
                std::process::exit(1);
            }
        }
    }

    /// Run every process until the token is cancelled or one of them fails,
    /// then run the closers. Returns the first process error.
    pub async fn run_until_stopped(self) -> anyhow::Result<()> {
        let token = self.cancellation_token;
        let mut join_set = JoinSet::new();

        for (name, process) in self.app_processes {
            let process_token = token.clone();
            tracing::debug!(process = %name, "starting app process");
            join_set.spawn(async move { (name, process(process_token).await) });
        }

        let mut first_error = None;
        while let Some(result) = join_set.join_next().await {
            match result {
                Ok((name, Ok(()))) => {
                    tracing::debug!(process = %name, "app process completed");
                }
                Ok((name, Err(err))) => {
                    if !token.is_cancelled() {
                        tracing::error!(process = %name, error = %format!("{:#}", err), "app process failed");
                        first_error = Some(err);
                        token.cancel();
                    }
                }
                Err(err) => {
                    tracing::error!(error = %err, "app process panicked");
                    token.cancel();
                }
            }

            if token.is_cancelled() {
                break;
            }
        }

        // let the remaining processes observe cancellation before aborting
        drain_or_abort(&mut join_set, self.closer_timeout).await;

        if !self.closers.is_empty() {
            tracing::info!(timeout = ?self.closer_timeout, "running closers");
            match tokio::time::timeout(self.closer_timeout, run_closers(self.closers)).await {
                Ok(()) => tracing::info!("all closers completed"),
                Err(_) => tracing::error!(timeout = ?self.closer_timeout, "closers timed out"),
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

async fn drain_or_abort(
    join_set: &mut JoinSet<(String, anyhow::Result<()>)>,
    timeout: Duration,
) {
    let drain = async {
        while let Some(result) = join_set.join_next().await {
            if let Ok((name, Err(err))) = result {
                tracing::warn!(process = %name, error = %format!("{:#}", err), "app process failed during shutdown");
            }
        }
    };
    if tokio::time::timeout(timeout, drain).await.is_err() {
        tracing::warn!("app processes did not stop in time, aborting");
        join_set.shutdown().await;
    }
}

async fn run_closers(closers: Vec<Closer>) {
    let mut closer_set = JoinSet::new();
    for closer in closers {
        closer_set.spawn(closer());
    }

    while let Some(result) = closer_set.join_next().await {
        match result {
            Ok(Ok(())) => tracing::debug!("closer completed"),
            Ok(Err(err)) => tracing::error!(error = %format!("{:#}", err), "closer failed"),
            Err(err) => tracing::error!(error = %err, "closer panicked"),
        }
    }
}

fn spawn_signal_handlers(token: CancellationToken) {
    let ctrl_c_token = token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("received SIGINT");
                ctrl_c_token.cancel();
            }
            Err(err) => tracing::error!(error = %err, "failed to listen for SIGINT"),
        }
    });

    #[cfg(unix)]
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                tracing::info!("received SIGTERM");
                token.cancel();
            }
            Err(err) => tracing::error!(error = %err, "failed to listen for SIGTERM"),
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    fn wait_for_cancel(ctx: CancellationToken) -> impl Future<Output = anyhow::Result<()>> {
        async move {
            ctx.cancelled().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_cancellation_stops_processes_and_runs_closers() {
        let token = CancellationToken::new();
        let closer_called = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&closer_called);

        let runner = Runner::new()
            .with_app_process("first", wait_for_cancel)
            .with_app_process("second", wait_for_cancel)
            .with_closer(move || async move {
                flag.store(true, Ordering::SeqCst);
                Ok(())
            })
            .with_cancellation_token(token.clone())
            .with_closer_timeout(Duration::from_secs(1));

        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });

        assert!(runner.run_until_stopped().await.is_ok());
        assert!(closer_called.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_process_error_cancels_others() {
        let token = CancellationToken::new();
        let stopped = Arc::new(AtomicUsize::new(0));
        let stopped_clone = Arc::clone(&stopped);

        let runner = Runner::new()
            .with_app_process("failing", |_ctx| async move {
                anyhow::bail!("broker unreachable")
            })
            .with_app_process("waiting", move |ctx| async move {
                ctx.cancelled().await;
                stopped_clone.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .with_cancellation_token(token.clone())
            .with_closer_timeout(Duration::from_secs(1));

        let err = runner.run_until_stopped().await.unwrap_err();
        assert!(err.to_string().contains("broker unreachable"));
        assert!(token.is_cancelled());
        assert_eq!(stopped.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_boxed_process_runs() {
        let token = CancellationToken::new();
        let ran = Arc::new(AtomicBool::new(false));
        let ran_clone = Arc::clone(&ran);

        let process: AppProcess = Box::new(move |ctx| {
            Box::pin(async move {
                ran_clone.store(true, Ordering::SeqCst);
                ctx.cancel();
                Ok(())
            })
        });

        Runner::new()
            .with_named_process("boxed", process)
            .with_cancellation_token(token)
            .run_until_stopped()
            .await
            .unwrap();
        assert!(ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_slow_closers_time_out() {
        let token = CancellationToken::new();
        token.cancel();

        let started = std::time::Instant::now();
        Runner::new()
            .with_closer(|| async move {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(())
            })
            .with_cancellation_token(token)
            .with_closer_timeout(Duration::from_millis(50))
            .run_until_stopped()
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
