//! Backend health probing and ejection.
//!
//! One probe task per backend pings on a dedicated connection (never a
//! traffic connection, so probes cannot interleave mid-frame). Consecutive
//! failures are counted; at exactly `ping_fail_limit`, a cluster with
//! `ping_auto_eject` rebuilds its ring without the backend. The next
//! successful probe restores it.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::cluster::node::NodeConn;
use crate::cluster::Cluster;

pub(crate) async fn probe_loop(cluster: Arc<Cluster>, backend: usize, cancel: CancellationToken) {
    let interval = Duration::from_millis(cluster.config().ping_interval.max(1));
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let fail_limit = cluster.config().ping_fail_limit;
    let auto_eject = cluster.config().ping_auto_eject;
    let addr = cluster.backends()[backend].addr.clone();
    let mut conn: Option<NodeConn> = None;
    let mut failures: u32 = 0;
    let mut ejected = false;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        match ping_once(&mut conn, &cluster, &addr).await {
            Ok(()) => {
                if ejected {
                    cluster.restore(backend);
                    ejected = false;
                }
                failures = 0;
            }
            Err(err) => {
                // a failed probe connection is never reused
                if let Some(nc) = conn.take() {
                    nc.close();
                }
                failures = failures.saturating_add(1);
                debug!(
                    cluster = %cluster.config().name,
                    addr = %addr,
                    failures,
                    error = %err,
                    "ping failed"
                );
                if failures == fail_limit && auto_eject && !ejected {
                    cluster.eject(backend);
                    ejected = true;
                }
            }
        }
    }
}

async fn ping_once(
    conn: &mut Option<NodeConn>,
    cluster: &Cluster,
    addr: &str,
) -> crate::error::Result<()> {
    if conn.is_none() {
        let cc = cluster.config();
        *conn = Some(
            NodeConn::connect(
                &cc.name,
                addr,
                cc.cache_type,
                &cc.conn_timeouts(),
                &cc.redis_auth,
                cluster.metrics(),
            )
            .await?,
        );
    }
    conn.as_mut().expect("probe connection present").ping().await
}
