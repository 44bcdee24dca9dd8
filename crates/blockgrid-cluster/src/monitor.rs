//! Background monitors
//!
//! Two periodic tasks drive the manager between RPCs: the decommission
//! monitor walks decommissioning nodes, and the heartbeat sweep publishes
//! staleness and removes dead nodes. Both sleep interruptibly and join
//! within a fixed budget on shutdown.

use crate::manager::DatanodeManager;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Join budget applied to each monitor on shutdown
const SHUTDOWN_JOIN_BUDGET: Duration = Duration::from_secs(3);

/// Handles to the manager's periodic tasks.
pub struct MonitorHandles {
    shutdown: watch::Sender<bool>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

/// Spawn the decommission monitor and the heartbeat sweep for a manager.
pub fn spawn_monitors(manager: &Arc<DatanodeManager>) -> MonitorHandles {
    let (shutdown, _) = watch::channel(false);
    let decommission_period = Duration::from_secs(manager.config().decommission_interval_secs);
    let sweep_period = Duration::from_millis(manager.config().heartbeat_recheck_interval_ms);

    let tasks = vec![
        (
            "decommission-monitor",
            spawn_periodic("decommission-monitor", decommission_period, shutdown.subscribe(), {
                let manager = Arc::clone(manager);
                move || manager.decommission_tick()
            }),
        ),
        (
            "heartbeat-sweep",
            spawn_periodic("heartbeat-sweep", sweep_period, shutdown.subscribe(), {
                let manager = Arc::clone(manager);
                move || manager.heartbeat_tick()
            }),
        ),
    ];
    MonitorHandles { shutdown, tasks }
}

fn spawn_periodic<F>(
    name: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() + Send + 'static,
{
    tokio::spawn(async move {
        debug!("{} started with a {}ms period", name, period.as_millis());
        loop {
            tokio::select! {
                () = tokio::time::sleep(period) => tick(),
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("{} stopped", name);
    })
}

impl MonitorHandles {
    /// Signal the monitors to stop and join each within the budget;
    /// a monitor that overruns it is aborted.
    pub async fn close(mut self) {
        let _ = self.shutdown.send(true);
        for (name, handle) in self.tasks.drain(..) {
            let abort = handle.abort_handle();
            match tokio::time::timeout(SHUTDOWN_JOIN_BUDGET, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("{} ended abnormally: {}", name, e),
                Err(_) => {
                    warn!(
                        "{} did not stop within {:?}; aborting it",
                        name, SHUTDOWN_JOIN_BUDGET
                    );
                    abort.abort();
                }
            }
        }
        info!("datanode monitors stopped");
    }
}
