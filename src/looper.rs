//! Cancelable fixed-interval polling

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::{Error, Result};

/// Run `step` until it returns `Ok(true)`, sleeping `interval` between
/// attempts.
///
/// Cancellation is only observed while sleeping, so a step that is already
/// running is never interrupted. A cancelled loop returns
/// [`Error::Cancelled`]; an error from `step` ends the loop immediately.
pub async fn poll_until<F, Fut>(
    cancel: &CancellationToken,
    interval: Duration,
    mut step: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    loop {
        if step().await? {
            return Ok(());
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Polling cancelled");
                return Err(Error::Cancelled);
            }
            _ = tokio::time::sleep(interval) => {}
        }
    }
}
