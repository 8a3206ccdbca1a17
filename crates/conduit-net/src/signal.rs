//! One-shot boolean signals shared by sessions and servers.

use tokio::sync::watch;

/// Resolve once `rx` reads `true`, or once its sender is gone.
pub(crate) async fn fired(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}
