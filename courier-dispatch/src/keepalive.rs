use std::{sync::Arc, time::Duration};

use courier_common::internal;
use courier_smtp::SendFailure;
use tokio::{sync::Mutex, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::mailer::Mailer;

/// Periodically probes a shared session so a silently dropped connection is
/// noticed before the next email needs it.
pub struct KeepAliveMonitor {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl KeepAliveMonitor {
    /// Start probing every `interval` until `stop` is called or `parent` is
    /// cancelled.
    pub fn spawn<M: Mailer + 'static>(
        worker: impl Into<String>,
        mailer: Arc<Mutex<M>>,
        interval: Duration,
        parent: &CancellationToken,
    ) -> Self {
        let token = parent.child_token();
        let worker = worker.into();

        let handle = tokio::spawn({
            let token = token.clone();
            async move {
                internal!(
                    level = DEBUG,
                    worker = %worker,
                    "Keep-alive probing every {}s",
                    interval.as_secs()
                );

                loop {
                    tokio::select! {
                        biased;
                        () = token.cancelled() => break,
                        () = tokio::time::sleep(interval) => {}
                    }

                    let mut mailer = mailer.lock().await;
                    match mailer.probe().await {
                        Ok(()) => internal!(worker = %worker, "Keep-alive NOOP ok"),
                        Err(SendFailure::Disconnected(reason)) => {
                            internal!(
                                level = DEBUG,
                                worker = %worker,
                                "SMTPServerDisconnected, reconnecting: {reason}"
                            );
                            mailer.reconnect().await;
                        }
                        Err(err) => {
                            internal!(level = ERROR, worker = %worker, "Keep-alive probe failed: {err}");
                        }
                    }
                }

                internal!(level = DEBUG, worker = %worker, "Keep-alive stopped");
            }
        });

        Self { token, handle }
    }

    /// Cancel the loop and wait for it. A probe already in progress finishes
    /// first.
    pub async fn stop(self) {
        self.token.cancel();
        if let Err(err) = self.handle.await {
            internal!(level = ERROR, "Keep-alive task failed: {err}");
        }
    }
}
