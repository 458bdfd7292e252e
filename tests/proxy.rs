//! End-to-end scenarios against mock backends.
//!
//! Each test starts real TCP mock servers speaking just enough of the
//! backend dialect, points a one-cluster proxy at them, and drives the
//! client side over a plain socket.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use porter::{spawn_cluster, CacheType, ClusterConfig, ProxyMetrics};

type RequestLog = Arc<Mutex<Vec<Vec<String>>>>;

/// Mock Redis backend: GET/SET/DEL/PING over RESP, optional per-request delay.
async fn spawn_mock_redis(
    store: HashMap<String, String>,
    delay: Duration,
) -> (SocketAddr, RequestLog) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let log: RequestLog = Arc::new(Mutex::new(Vec::new()));
    let log2 = log.clone();
    let store = Arc::new(store);
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let store = store.clone();
            let log = log2.clone();
            tokio::spawn(async move {
                let (rd, mut wr) = stream.into_split();
                let mut rd = BufReader::new(rd);
                while let Some(args) = read_resp_array(&mut rd).await {
                    let cmd = args.first().cloned().unwrap_or_default().to_uppercase();
                    if cmd != "PING" {
                        log.lock().push(args.clone());
                    }
                    if !delay.is_zero() {
                        sleep(delay).await;
                    }
                    let reply = match cmd.as_str() {
                        "PING" => "+PONG\r\n".to_string(),
                        "GET" => match store.get(&args[1]) {
                            Some(v) => format!("${}\r\n{}\r\n", v.len(), v),
                            None => "$-1\r\n".to_string(),
                        },
                        "DEL" => {
                            let n: i64 = args[1..]
                                .iter()
                                .map(|k| i64::from(store.contains_key(k)))
                                .sum();
                            format!(":{n}\r\n")
                        }
                        "SET" => "+OK\r\n".to_string(),
                        _ => "-ERR mock: unhandled command\r\n".to_string(),
                    };
                    if wr.write_all(reply.as_bytes()).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    (addr, log)
}

/// Read one RESP array of bulk strings; `None` on disconnect.
async fn read_resp_array<R: tokio::io::AsyncBufRead + Unpin>(rd: &mut R) -> Option<Vec<String>> {
    let mut line = String::new();
    if rd.read_line(&mut line).await.ok()? == 0 {
        return None;
    }
    let count: usize = line.trim_start_matches('*').trim().parse().ok()?;
    let mut args = Vec::with_capacity(count);
    for _ in 0..count {
        let mut len_line = String::new();
        rd.read_line(&mut len_line).await.ok()?;
        let len: usize = len_line.trim_start_matches('$').trim().parse().ok()?;
        let mut body = vec![0u8; len + 2];
        rd.read_exact(&mut body).await.ok()?;
        body.truncate(len);
        args.push(String::from_utf8(body).ok()?);
    }
    Some(args)
}

/// Mock memcached (text) backend: single-key get, set (including pings).
async fn spawn_mock_memcache(store: HashMap<String, String>) -> (SocketAddr, RequestLog) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let log: RequestLog = Arc::new(Mutex::new(Vec::new()));
    let log2 = log.clone();
    let store = Arc::new(store);
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let store = store.clone();
            let log = log2.clone();
            tokio::spawn(async move {
                let (rd, mut wr) = stream.into_split();
                let mut rd = BufReader::new(rd);
                loop {
                    let mut line = String::new();
                    match rd.read_line(&mut line).await {
                        Ok(0) | Err(_) => break,
                        Ok(_) => {}
                    }
                    let fields: Vec<String> =
                        line.trim_end().split(' ').map(str::to_string).collect();
                    let reply = match fields[0].as_str() {
                        "get" | "gets" => {
                            log.lock().push(fields.clone());
                            match store.get(&fields[1]) {
                                Some(v) => {
                                    format!("VALUE {} 0 {}\r\n{}\r\nEND\r\n", fields[1], v.len(), v)
                                }
                                None => "END\r\n".to_string(),
                            }
                        }
                        "set" => {
                            let len: usize = fields[4].parse().unwrap_or(0);
                            let mut body = vec![0u8; len + 2];
                            if rd.read_exact(&mut body).await.is_err() {
                                break;
                            }
                            if fields[1] != "_ping" {
                                log.lock().push(fields.clone());
                            }
                            "STORED\r\n".to_string()
                        }
                        _ => "ERROR\r\n".to_string(),
                    };
                    if wr.write_all(reply.as_bytes()).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    (addr, log)
}

/// A backend that accepts and immediately drops every connection.
async fn spawn_dead_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, _)) => drop(stream),
                Err(_) => break,
            }
        }
    });
    addr
}

async fn start_proxy(cc: ClusterConfig, cancel: &CancellationToken) -> SocketAddr {
    spawn_cluster(cc, Arc::new(ProxyMetrics::new()), cancel.clone())
        .await
        .unwrap()
        .expect("tcp listener address")
}

fn redis_cluster(name: &str, backends: &[SocketAddr]) -> ClusterConfig {
    let servers: Vec<String> = backends.iter().map(|a| format!("{a}:1")).collect();
    let servers: Vec<&str> = servers.iter().map(String::as_str).collect();
    ClusterConfig::new(name, CacheType::Redis, "127.0.0.1:0").with_servers(&servers)
}

async fn read_exactly(stream: &mut TcpStream, n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    stream.read_exact(&mut buf).await.unwrap();
    buf
}

#[tokio::test]
async fn redis_mget_splits_and_merges_in_key_order() {
    let store: HashMap<String, String> = [("a", "va"), ("b", "vb"), ("c", "vc")]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    let (b0, log0) = spawn_mock_redis(store.clone(), Duration::ZERO).await;
    let (b1, log1) = spawn_mock_redis(store.clone(), Duration::ZERO).await;
    let (b2, log2) = spawn_mock_redis(store, Duration::ZERO).await;

    let cancel = CancellationToken::new();
    let addr = start_proxy(redis_cluster("mget", &[b0, b1, b2]), &cancel).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    client
        .write_all(b"*4\r\n$4\r\nMGET\r\n$1\r\na\r\n$1\r\nb\r\n$1\r\nc\r\n")
        .await
        .unwrap();
    let reply = read_exactly(&mut client, 28).await;
    assert_eq!(&reply[..], b"*3\r\n$2\r\nva\r\n$2\r\nvb\r\n$2\r\nvc\r\n");

    // every backend request was a single-key GET and each key went somewhere
    let mut seen = Vec::new();
    for log in [&log0, &log1, &log2] {
        for req in log.lock().iter() {
            assert_eq!(req[0].to_uppercase(), "GET");
            assert_eq!(req.len(), 2);
            seen.push(req[1].clone());
        }
    }
    seen.sort();
    assert_eq!(seen, vec!["a", "b", "c"]);
    cancel.cancel();
}

#[tokio::test]
async fn redis_del_count_sums_backend_replies() {
    // k1 and k3 exist, k2 does not: DEL must come back as :2
    let store: HashMap<String, String> = [("k1", "x"), ("k3", "x")]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    let (b0, _) = spawn_mock_redis(store.clone(), Duration::ZERO).await;
    let (b1, _) = spawn_mock_redis(store.clone(), Duration::ZERO).await;
    let (b2, _) = spawn_mock_redis(store, Duration::ZERO).await;

    let cancel = CancellationToken::new();
    let addr = start_proxy(redis_cluster("del", &[b0, b1, b2]), &cancel).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    client
        .write_all(b"*4\r\n$3\r\nDEL\r\n$2\r\nk1\r\n$2\r\nk2\r\n$2\r\nk3\r\n")
        .await
        .unwrap();
    let reply = read_exactly(&mut client, 4).await;
    assert_eq!(&reply[..], b":2\r\n");
    cancel.cancel();
}

#[tokio::test]
async fn memcache_multiget_merges_hits_under_one_end() {
    let store: HashMap<String, String> = [("a".to_string(), "X".to_string())].into();
    let (b0, _) = spawn_mock_memcache(store.clone()).await;
    let (b1, _) = spawn_mock_memcache(store).await;

    let servers: Vec<String> = [b0, b1].iter().map(|a| format!("{a}:1")).collect();
    let servers: Vec<&str> = servers.iter().map(String::as_str).collect();
    let cc = ClusterConfig::new("mc", CacheType::Memcache, "127.0.0.1:0").with_servers(&servers);

    let cancel = CancellationToken::new();
    let addr = start_proxy(cc, &cancel).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(b"get a b\r\n").await.unwrap();
    let reply = read_exactly(&mut client, 21).await;
    assert_eq!(&reply[..], b"VALUE a 0 1\r\nX\r\nEND\r\n");
    cancel.cancel();
}

#[tokio::test]
async fn partial_frame_generates_no_backend_traffic() {
    let store: HashMap<String, String> = [("a".to_string(), "va".to_string())].into();
    let (b0, log) = spawn_mock_redis(store, Duration::ZERO).await;

    let cancel = CancellationToken::new();
    let addr = start_proxy(redis_cluster("partial", &[b0]), &cancel).await;

    let frame = b"*2\r\n$3\r\nGET\r\n$1\r\na\r\n";
    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(&frame[..7]).await.unwrap();
    client.flush().await.unwrap();
    sleep(Duration::from_millis(100)).await;
    assert!(log.lock().is_empty(), "no complete frame, no backend traffic");

    client.write_all(&frame[7..]).await.unwrap();
    let reply = read_exactly(&mut client, 8).await;
    assert_eq!(&reply[..], b"$2\r\nva\r\n");
    assert_eq!(log.lock().len(), 1);
    cancel.cancel();
}

#[tokio::test]
async fn pipelined_gets_return_in_request_order() {
    let n = 40;
    let store: HashMap<String, String> =
        (0..n).map(|i| (format!("key-{i}"), format!("v{i}"))).collect();
    // deliberately skewed backend latency
    let (b0, _) = spawn_mock_redis(store.clone(), Duration::ZERO).await;
    let (b1, _) = spawn_mock_redis(store.clone(), Duration::from_millis(5)).await;
    let (b2, _) = spawn_mock_redis(store, Duration::from_millis(15)).await;

    let cancel = CancellationToken::new();
    let addr = start_proxy(redis_cluster("pipe", &[b0, b1, b2]), &cancel).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    let mut pipelined = Vec::new();
    for i in 0..n {
        let key = format!("key-{i}");
        pipelined
            .extend_from_slice(format!("*2\r\n$3\r\nGET\r\n${}\r\n{}\r\n", key.len(), key).as_bytes());
    }
    client.write_all(&pipelined).await.unwrap();

    let mut expected = Vec::new();
    for i in 0..n {
        let val = format!("v{i}");
        expected.extend_from_slice(format!("${}\r\n{}\r\n", val.len(), val).as_bytes());
    }
    let reply = read_exactly(&mut client, expected.len()).await;
    assert_eq!(reply, expected, "responses must follow request order");
    cancel.cancel();
}

#[tokio::test]
async fn ejected_backend_stops_receiving_keys() {
    let store: HashMap<String, String> =
        (0..20).map(|i| (format!("key-{i}"), "v".to_string())).collect();
    let (alive, alive_log) = spawn_mock_redis(store, Duration::ZERO).await;
    let dead = spawn_dead_backend().await;

    let servers: Vec<String> = [alive, dead].iter().map(|a| format!("{a}:1")).collect();
    let servers: Vec<&str> = servers.iter().map(String::as_str).collect();
    let cc = ClusterConfig::new("eject", CacheType::Redis, "127.0.0.1:0")
        .with_servers(&servers)
        .with_ping(50, 3, true);

    let cancel = CancellationToken::new();
    let addr = start_proxy(cc, &cancel).await;

    // three ping failures at ~50 ms cadence, then the ring rebuild
    sleep(Duration::from_millis(600)).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    for i in 0..20 {
        let key = format!("key-{i}");
        client
            .write_all(format!("*2\r\n$3\r\nGET\r\n${}\r\n{}\r\n", key.len(), key).as_bytes())
            .await
            .unwrap();
        let reply = read_exactly(&mut client, 7).await;
        assert_eq!(&reply[..], b"$1\r\nv\r\n", "key {key} must hit the live backend");
    }
    assert_eq!(alive_log.lock().len(), 20, "every key reroutes to the live backend");
    cancel.cancel();
}

#[tokio::test]
async fn control_commands_never_touch_backends() {
    let (b0, log) = spawn_mock_redis(HashMap::new(), Duration::ZERO).await;
    let cancel = CancellationToken::new();
    let addr = start_proxy(redis_cluster("ctl", &[b0]), &cancel).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(b"*1\r\n$4\r\nPING\r\n").await.unwrap();
    let reply = read_exactly(&mut client, 7).await;
    assert_eq!(&reply[..], b"+PONG\r\n");

    client
        .write_all(b"*2\r\n$4\r\nECHO\r\n$5\r\nhello\r\n")
        .await
        .unwrap();
    let reply = read_exactly(&mut client, 11).await;
    assert_eq!(&reply[..], b"$5\r\nhello\r\n");

    assert!(log.lock().is_empty());
    cancel.cancel();
}

#[tokio::test]
async fn unsupported_command_keeps_connection_open() {
    let store: HashMap<String, String> = [("a".to_string(), "va".to_string())].into();
    let (b0, _) = spawn_mock_redis(store, Duration::ZERO).await;
    let cancel = CancellationToken::new();
    let addr = start_proxy(redis_cluster("unsup", &[b0]), &cancel).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(b"*2\r\n$4\r\nKEYS\r\n$1\r\n*\r\n").await.unwrap();
    let reply = read_exactly(&mut client, 29).await;
    assert_eq!(&reply[..], b"-ERR unknown command 'KEYS'\r\n");

    // the same connection still proxies real traffic
    client.write_all(b"*2\r\n$3\r\nGET\r\n$1\r\na\r\n").await.unwrap();
    let reply = read_exactly(&mut client, 8).await;
    assert_eq!(&reply[..], b"$2\r\nva\r\n");
    cancel.cancel();
}

#[tokio::test]
async fn memcache_set_and_get_round_trip() {
    let store: HashMap<String, String> = HashMap::new();
    let (b0, log) = spawn_mock_memcache(store).await;

    let servers = format!("{b0}:1");
    let cc = ClusterConfig::new("mc-rt", CacheType::Memcache, "127.0.0.1:0")
        .with_servers(&[&servers]);
    let cancel = CancellationToken::new();
    let addr = start_proxy(cc, &cancel).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(b"set k 0 0 3\r\nabc\r\n").await.unwrap();
    let reply = read_exactly(&mut client, 8).await;
    assert_eq!(&reply[..], b"STORED\r\n");

    let sets: Vec<Vec<String>> = log.lock().clone();
    assert_eq!(sets.len(), 1);
    assert_eq!(sets[0][..2], ["set".to_string(), "k".to_string()]);
    cancel.cancel();
}
