//! Fire-and-forget secondary effects.
//!
//! Pinning, naming and similar follow-ups run detached from the request. A
//! failure or panic in one of them is logged and goes no further.

use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use tokio::task::JoinHandle;
use tracing::{debug, error};

pub fn spawn_detached<F>(name: &'static str, task: F) -> JoinHandle<()>
where
    F: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        match AssertUnwindSafe(task).catch_unwind().await {
            Ok(Ok(())) => debug!("Background task {} finished", name),
            Ok(Err(e)) => error!("Background task {} failed: {}", name, e),
            Err(panic_info) => {
                let msg = if let Some(s) = panic_info.downcast_ref::<String>() {
                    s.clone()
                } else if let Some(s) = panic_info.downcast_ref::<&str>() {
                    s.to_string()
                } else {
                    "unknown panic".to_string()
                };
                error!("Background task {} panicked: {}", name, msg);
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_panics_and_errors_are_contained() {
        let failed = spawn_detached("failing", async { Err(anyhow::anyhow!("nope")) });
        let panicked = spawn_detached("panicking", async {
            let explode = true;
            if explode {
                panic!("boom");
            }
            Ok(())
        });
        assert!(failed.await.is_ok());
        assert!(panicked.await.is_ok());
    }
}
