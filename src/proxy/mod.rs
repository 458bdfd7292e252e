//! Client-facing listeners and the per-connection handler loop.
//!
//! One handler per client socket runs the frame cycle: decode as many
//! pipelined requests as are buffered (bounded by the adaptive `concurrent`
//! limit), dispatch them across the backends, wait for every batch, then
//! encode the responses in the order the client issued them. Control
//! commands short-circuit inside the proxy; per-message backend errors keep
//! the client connection open.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, UnixListener};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bufio::{Reader, Writer};
use crate::cluster::{self, Cluster};
use crate::config::{ClusterConfig, ListenProto};
use crate::error::{Error, Result};
use crate::metrics::ProxyMetrics;
use crate::proto::Message;

/// Initial per-connection pipeline depth.
const DEFAULT_CONCURRENT: usize = 2;
/// Upper bound for the adaptive pipeline depth.
const MAX_CONCURRENT: usize = 1024;

type ClientRead = Box<dyn AsyncRead + Send + Unpin>;
type ClientWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// Start one cluster: router, workers, probes and the client listener.
/// Returns the bound address for TCP listeners.
pub async fn spawn_cluster(
    cc: ClusterConfig,
    metrics: Arc<ProxyMetrics>,
    cancel: CancellationToken,
) -> Result<Option<SocketAddr>> {
    let cluster = Cluster::new(cc.clone(), metrics, cancel.child_token())?;
    match cc.listen_proto {
        ListenProto::Tcp => {
            let listener = TcpListener::bind(&cc.listen_addr)
                .await
                .map_err(|e| Error::Config(format!("bind {}: {e}", cc.listen_addr)))?;
            let addr = listener.local_addr().map_err(Error::ClientIo)?;
            info!(cluster = %cc.name, %addr, cache_type = %cc.cache_type, "cluster listening");
            tokio::spawn(accept_tcp(listener, cluster, cancel));
            Ok(Some(addr))
        }
        ListenProto::Unix => {
            let _ = std::fs::remove_file(&cc.listen_addr);
            let listener = UnixListener::bind(&cc.listen_addr)
                .map_err(|e| Error::Config(format!("bind {}: {e}", cc.listen_addr)))?;
            info!(cluster = %cc.name, path = %cc.listen_addr, "cluster listening");
            tokio::spawn(accept_unix(listener, cluster, cancel));
            Ok(None)
        }
    }
}

async fn accept_tcp(listener: TcpListener, cluster: Arc<Cluster>, cancel: CancellationToken) {
    let mut next_id: u64 = 0;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let _ = stream.set_nodelay(true);
                    debug!(cluster = %cluster.config().name, %peer, "client connected");
                    next_id = next_id.wrapping_add(1);
                    let (rd, wr) = stream.into_split();
                    tokio::spawn(handle_client(
                        cluster.clone(),
                        cancel.child_token(),
                        next_id,
                        Box::new(rd),
                        Box::new(wr),
                    ));
                }
                Err(e) => {
                    error!(cluster = %cluster.config().name, error = %e, "accept failed");
                }
            },
        }
    }
}

async fn accept_unix(listener: UnixListener, cluster: Arc<Cluster>, cancel: CancellationToken) {
    let mut next_id: u64 = 0;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    next_id = next_id.wrapping_add(1);
                    let (rd, wr) = stream.into_split();
                    tokio::spawn(handle_client(
                        cluster.clone(),
                        cancel.child_token(),
                        next_id,
                        Box::new(rd),
                        Box::new(wr),
                    ));
                }
                Err(e) => {
                    error!(cluster = %cluster.config().name, error = %e, "accept failed");
                }
            },
        }
    }
}

async fn handle_client(
    cluster: Arc<Cluster>,
    cancel: CancellationToken,
    id: u64,
    rd: ClientRead,
    wr: ClientWrite,
) {
    let metrics = cluster.metrics();
    let name = cluster.config().name.clone();
    metrics.conns.inc([&name]);
    let result = client_loop(&cluster, &cancel, id, rd, wr).await;
    metrics.conns.dec([&name]);
    match result {
        Ok(()) => debug!(cluster = %name, id, "client disconnected"),
        Err(e) => warn!(cluster = %name, id, error = %e, "client connection failed"),
    }
}

async fn client_loop(
    cluster: &Cluster,
    cancel: &CancellationToken,
    id: u64,
    rd_half: ClientRead,
    wr_half: ClientWrite,
) -> Result<()> {
    let cc = cluster.config();
    let ctype = cc.cache_type;
    let timeouts = cc.conn_timeouts();
    let metrics = cluster.metrics();
    let mut rd = Reader::new(rd_half, timeouts.read);
    let mut wr = Writer::new(wr_half, timeouts.write);
    let mut concurrent = DEFAULT_CONCURRENT;
    let mut msgs: Vec<Message> = Vec::new();

    loop {
        // 1. decode: greedy up to `concurrent`, but return on the first
        //    complete request rather than waiting for a full window
        msgs.clear();
        loop {
            ctype.decode_requests(&mut rd, &mut msgs, concurrent)?;
            if !msgs.is_empty() {
                break;
            }
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                res = rd.fill() => match res {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
                    Err(e) => return Err(Error::ClientIo(e)),
                },
            }
        }

        // 2. fan out, 3. wait for every submitted batch
        let (mut batches, mut done_rx, submitted) = cluster.dispatch(&mut msgs, id as usize).await;
        let mut received = 0;
        while received < submitted {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                batch = done_rx.recv() => match batch {
                    Some(batch) => {
                        let b = batch.backend();
                        batches[b] = Some(batch);
                        received += 1;
                    }
                    None => break,
                },
            }
        }
        cluster::gather(batches, &mut msgs);

        // 4. encode in client order, 5. flush once
        let mut close_after = false;
        for msg in msgs.iter_mut() {
            ctype.encode_response(msg, &mut wr)?;
            msg.mark_done();
            metrics
                .proxy_time
                .observe([&cc.name, msg.request().command()], msg.total_dur());
            if let Some(err) = msg.err() {
                if matches!(**err, Error::NoAvailableBackend) {
                    metrics
                        .errors
                        .inc([&cc.name, "-", msg.request().command(), err.cause()]);
                }
            }
            if msg.request().closes_connection() {
                close_after = true;
            }
            msg.reset_subs();
        }
        wr.flush().await.map_err(Error::ClientIo)?;
        if close_after {
            return Ok(());
        }

        // 6. adaptive concurrency: double on a full window, never shrink
        if msgs.len() == concurrent && concurrent < MAX_CONCURRENT {
            concurrent = (concurrent * 2).min(MAX_CONCURRENT);
        }
    }
}

/// Plain-text stats listener: every connection gets a metrics snapshot.
pub async fn spawn_stat_listener(
    addr: &str,
    metrics: Arc<ProxyMetrics>,
    cancel: CancellationToken,
) -> Result<SocketAddr> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Config(format!("bind {addr}: {e}")))?;
    let local = listener.local_addr().map_err(Error::ClientIo)?;
    info!(addr = %local, "stats listening");
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => {
                    if let Ok((mut stream, _)) = accepted {
                        let snapshot = metrics.render();
                        let _ = tokio::io::AsyncWriteExt::write_all(
                            &mut stream,
                            snapshot.as_bytes(),
                        )
                        .await;
                    }
                }
            }
        }
    });
    Ok(local)
}
