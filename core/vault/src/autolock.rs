//! Inactivity timer task.
//!
//! One task runs per armed timer. It holds only a weak reference to the
//! manager so an idle timer never keeps a dropped manager alive.

use std::sync::Weak;
use std::time::Duration;
use tracing::debug;

use crate::manager::{ManagerInner, SessionManager};
use crate::session::SessionHandle;

/// Sleep for `timeout`, then lock the session identified by `handle`
/// and `generation` once the app is in the background.
///
/// While the app is in the foreground the lock is deferred and the
/// state is re-checked every `poll`. The task exits silently if the
/// session was locked or the timer re-armed in the meantime.
pub(crate) async fn run(
    weak: Weak<ManagerInner>,
    handle: SessionHandle,
    generation: u64,
    timeout: Duration,
    poll: Duration,
) {
    tokio::time::sleep(timeout).await;

    loop {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        let manager = SessionManager::from_inner(inner);

        if !manager.is_current(&handle, generation).await {
            return;
        }

        if !manager.is_app_foreground() {
            debug!("Auto-lock timeout reached");
            // Locking drops the session, which aborts this task, so the
            // lock runs on its own task.
            tokio::spawn(async move { manager.expire(&handle, generation).await });
            return;
        }

        drop(manager);
        tokio::time::sleep(poll).await;
    }
}
