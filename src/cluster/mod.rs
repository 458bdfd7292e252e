//! Cluster router: the ring, the per-backend workers and batch dispatch.
//!
//! Each backend runs `node_connections` worker tasks, each owning one socket.
//! Dispatch splits multi-key messages, routes every (sub-)request over the
//! ring into per-backend [`MsgBatch`]es, and submits each non-empty batch to
//! one worker. Completed batches come back over the frame's completion
//! channel; [`gather`] copies replies and errors back onto the messages.

pub mod node;
pub mod ping;
pub mod ring;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ClusterConfig;
use crate::error::{Error, Result};
use crate::metrics::ProxyMetrics;
use crate::proto::batch::{BatchJob, MsgBatch};
use crate::proto::{self, Message};
use node::NodeConn;
use ring::{Ring, RingBuilder};

/// Depth of each worker's inbox before dispatch backpressures.
const WORKER_QUEUE: usize = 128;

/// One configured backend server.
#[derive(Debug, Clone)]
pub struct Backend {
    pub addr: String,
    /// Ring identity: the alias when configured, else the address.
    pub name: String,
    pub weight: u32,
}

impl Backend {
    /// Parse `"host:port:weight"` or `"host:port:weight alias"`.
    pub fn parse(entry: &str) -> Result<Backend> {
        let (spec, alias) = match entry.split_once(' ') {
            Some((spec, alias)) if !alias.trim().is_empty() => (spec, Some(alias.trim())),
            Some((spec, _)) => (spec, None),
            None => (entry, None),
        };
        let (addr, weight) = spec
            .rsplit_once(':')
            .ok_or_else(|| Error::Config(format!("bad server entry '{entry}'")))?;
        let weight: u32 = weight
            .parse()
            .map_err(|_| Error::Config(format!("bad weight in server entry '{entry}'")))?;
        if weight == 0 || !addr.contains(':') {
            return Err(Error::Config(format!("bad server entry '{entry}'")));
        }
        Ok(Backend {
            addr: addr.to_owned(),
            name: alias.unwrap_or(addr).to_owned(),
            weight,
        })
    }
}

/// Router for one configured cluster.
pub struct Cluster {
    cc: ClusterConfig,
    backends: Vec<Backend>,
    ring: RwLock<Arc<Ring>>,
    alive: Vec<AtomicBool>,
    workers: Vec<Vec<mpsc::Sender<BatchJob>>>,
    metrics: Arc<ProxyMetrics>,
}

impl Cluster {
    /// Build the ring, spawn the backend workers and the probe tasks.
    pub fn new(
        cc: ClusterConfig,
        metrics: Arc<ProxyMetrics>,
        cancel: CancellationToken,
    ) -> Result<Arc<Cluster>> {
        cc.validate()?;
        let backends = cc.backends()?;

        let mut workers = Vec::with_capacity(backends.len());
        for backend in &backends {
            let mut conns = Vec::with_capacity(cc.node_connections);
            for _ in 0..cc.node_connections {
                let (tx, rx) = mpsc::channel(WORKER_QUEUE);
                tokio::spawn(worker_loop(
                    cc.clone(),
                    backend.addr.clone(),
                    rx,
                    metrics.clone(),
                    cancel.child_token(),
                ));
                conns.push(tx);
            }
            workers.push(conns);
        }

        let alive: Vec<AtomicBool> = backends.iter().map(|_| AtomicBool::new(true)).collect();
        let cluster = Arc::new(Cluster {
            ring: RwLock::new(Arc::new(build_ring(&cc, &backends, &alive))),
            cc,
            backends,
            alive,
            workers,
            metrics,
        });

        for i in 0..cluster.backends.len() {
            tokio::spawn(ping::probe_loop(cluster.clone(), i, cancel.child_token()));
        }
        Ok(cluster)
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.cc
    }

    pub fn backends(&self) -> &[Backend] {
        &self.backends
    }

    pub fn metrics(&self) -> Arc<ProxyMetrics> {
        self.metrics.clone()
    }

    /// Remove a backend from the ring. Dispatch sees either the old ring or
    /// the new one, never a half-built one.
    pub fn eject(&self, backend: usize) {
        self.alive[backend].store(false, Ordering::Release);
        self.swap_ring();
        warn!(
            cluster = %self.cc.name,
            addr = %self.backends[backend].addr,
            "backend ejected"
        );
    }

    /// Put an ejected backend back on the ring.
    pub fn restore(&self, backend: usize) {
        self.alive[backend].store(true, Ordering::Release);
        self.swap_ring();
        info!(
            cluster = %self.cc.name,
            addr = %self.backends[backend].addr,
            "backend restored"
        );
    }

    fn swap_ring(&self) {
        let ring = build_ring(&self.cc, &self.backends, &self.alive);
        *self.ring.write() = Arc::new(ring);
    }

    /// Current ring (read-mostly snapshot).
    pub fn ring(&self) -> Arc<Ring> {
        self.ring.read().clone()
    }

    /// Split, route and submit one frame's messages. Returns the per-backend
    /// batch slots, the completion channel and the number of submitted
    /// batches (the frame latch count).
    pub async fn dispatch(
        &self,
        msgs: &mut [Message],
        conn_seed: usize,
    ) -> (Vec<Option<MsgBatch>>, mpsc::Receiver<MsgBatch>, usize) {
        let ring = self.ring();
        let mut batches: Vec<Option<MsgBatch>> = (0..self.backends.len()).map(|_| None).collect();

        for (mi, msg) in msgs.iter_mut().enumerate() {
            let req = msg.request();
            if msg.err().is_some() || req.is_control() || req.is_unsupported() {
                continue;
            }
            if let Some(subs) = proto::split(req) {
                msg.set_subs(subs);
                for si in 0..msg.subs().len() {
                    let target = ring.locate(msg.subs()[si].req.key());
                    match target {
                        Some(b) => {
                            let req = msg.subs()[si].req.clone();
                            batches[b]
                                .get_or_insert_with(|| MsgBatch::new(b))
                                .push(req, mi, si);
                        }
                        None => {
                            msg.subs_mut()[si].set_err(Arc::new(Error::NoAvailableBackend));
                        }
                    }
                }
            } else {
                match ring.locate(req.key()) {
                    Some(b) => {
                        let req = req.clone();
                        batches[b]
                            .get_or_insert_with(|| MsgBatch::new(b))
                            .push(req, mi, 0);
                    }
                    None => msg.set_err(Arc::new(Error::NoAvailableBackend)),
                }
            }
        }

        // one slot per backend covers every batch this frame can submit, so
        // the channel acts as a countdown latch with a single waker
        let (tx, rx) = mpsc::channel(self.backends.len());
        let mut submitted = 0;
        for b in 0..batches.len() {
            let Some(batch) = batches[b].take() else {
                continue;
            };
            if batch.is_empty() {
                continue;
            }
            let conns = &self.workers[b];
            let worker = &conns[conn_seed % conns.len()];
            match worker
                .send(BatchJob {
                    batch,
                    done: tx.clone(),
                })
                .await
            {
                Ok(()) => submitted += 1,
                Err(send_err) => {
                    // worker is gone (shutdown); fail the batch in place
                    let mut batch = send_err.0.batch;
                    batch.fail_unfilled(&Arc::new(Error::Closed));
                    batches[b] = Some(batch);
                }
            }
        }
        (batches, rx, submitted)
    }
}

fn build_ring(cc: &ClusterConfig, backends: &[Backend], alive: &[AtomicBool]) -> Ring {
    let mut builder = RingBuilder::new(cc.hash_method, cc.hash_tag_pair());
    for (i, backend) in backends.iter().enumerate() {
        if alive[i].load(Ordering::Acquire) {
            builder = builder.node(&backend.name, backend.weight, i as u16);
        }
    }
    builder.build()
}

/// Copy batch results back onto the frame's messages.
pub fn gather(batches: Vec<Option<MsgBatch>>, msgs: &mut [Message]) {
    for batch in batches.into_iter().flatten() {
        for entry in batch.into_entries() {
            let msg = &mut msgs[entry.parent];
            if msg.has_subs() {
                let sub = &mut msg.subs_mut()[entry.sub];
                if let Some(reply) = entry.reply {
                    sub.reply = Some(reply);
                }
                if let Some(err) = entry.err {
                    sub.set_err(err);
                }
            } else {
                if let Some(reply) = entry.reply {
                    msg.set_reply(reply);
                }
                if let Some(err) = entry.err {
                    msg.set_err(err);
                }
            }
        }
    }
}

/// One backend worker: owns one socket, drains its inbox batch by batch.
async fn worker_loop(
    cc: ClusterConfig,
    addr: String,
    mut rx: mpsc::Receiver<BatchJob>,
    metrics: Arc<ProxyMetrics>,
    cancel: CancellationToken,
) {
    let timeouts = cc.conn_timeouts();
    let mut conn: Option<NodeConn> = None;
    loop {
        let mut job = tokio::select! {
            _ = cancel.cancelled() => break,
            job = rx.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };

        if conn.is_none() {
            match NodeConn::connect(
                &cc.name,
                &addr,
                cc.cache_type,
                &timeouts,
                &cc.redis_auth,
                metrics.clone(),
            )
            .await
            {
                Ok(nc) => conn = Some(nc),
                Err(e) => {
                    fail_batch(&metrics, &cc.name, &addr, &mut job.batch, e);
                    job.finish();
                    continue;
                }
            }
        }

        let nc = conn.as_mut().expect("backend connection present");
        let res = async {
            nc.write_batch(&mut job.batch).await?;
            nc.read_batch(&mut job.batch).await
        }
        .await;

        match res {
            Ok(()) => {
                for entry in job.batch.entries() {
                    if let (Some(w), Some(r)) = (entry.written_at, entry.read_at) {
                        metrics.handle_time.observe(
                            [&cc.name, &addr, entry.req.command()],
                            r.duration_since(w),
                        );
                    }
                }
            }
            Err(e) => {
                // fatal for this connection; the batch fails as a unit
                if let Some(nc) = conn.take() {
                    nc.close();
                }
                fail_batch(&metrics, &cc.name, &addr, &mut job.batch, e);
            }
        }
        job.finish();
    }
    debug!(cluster = %cc.name, addr = %addr, "backend worker stopped");
}

fn fail_batch(
    metrics: &ProxyMetrics,
    cluster: &str,
    addr: &str,
    batch: &mut MsgBatch,
    err: Error,
) {
    debug!(cluster, addr, error = %err, "batch failed");
    let cause = err.cause();
    for entry in batch.entries() {
        if entry.reply.is_none() && !entry.skip_read() {
            metrics
                .errors
                .inc([cluster, addr, entry.req.command(), cause]);
        }
    }
    batch.fail_unfilled(&Arc::new(err));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_parse() {
        let b = Backend::parse("127.0.0.1:11211:1").unwrap();
        assert_eq!(b.addr, "127.0.0.1:11211");
        assert_eq!(b.name, "127.0.0.1:11211");
        assert_eq!(b.weight, 1);

        let b = Backend::parse("10.0.0.2:6379:2 shard-a").unwrap();
        assert_eq!(b.addr, "10.0.0.2:6379");
        assert_eq!(b.name, "shard-a");
        assert_eq!(b.weight, 2);
    }

    #[test]
    fn test_backend_parse_rejects_garbage() {
        assert!(Backend::parse("localhost").is_err());
        assert!(Backend::parse("host:port:w").is_err());
        assert!(Backend::parse("127.0.0.1:11211:0").is_err());
        assert!(Backend::parse("11211:1").is_err());
    }
}
