//! Full-stack round trips: pool -> stub -> wire -> skeleton and back,
//! over real loopback sockets.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use wirecall::client::{PoolConfig, StubPool, Timeout};
use wirecall::echo::{Echo, EchoMessage, EchoService};
use wirecall::server::Skeleton;
use wirecall::transport::{Endpoint, RpcListener, StreamConnector};
use wirecall::wire::{IoVector, Message};

struct TestServer {
    endpoint: Endpoint,
    skeleton: Arc<Skeleton>,
    accept_loop: thread::JoinHandle<()>,
}

/// Bind `endpoint`, serve the echo operation, and accept exactly
/// `connections` clients before winding down.
fn start_server(endpoint: &Endpoint, connections: usize) -> TestServer {
    let listener = RpcListener::bind(endpoint).unwrap();
    let bound = listener.local_endpoint().unwrap();

    let skeleton = Arc::new(Skeleton::new());
    skeleton
        .add_operation::<Echo, _>(Arc::new(EchoService))
        .unwrap();

    let serve_skeleton = Arc::clone(&skeleton);
    let accept_loop = thread::spawn(move || {
        let mut workers = Vec::new();
        for _ in 0..connections {
            let stream = listener.accept().unwrap();
            let skeleton = Arc::clone(&serve_skeleton);
            workers.push(thread::spawn(move || {
                skeleton.serve(stream).unwrap();
            }));
        }
        for worker in workers {
            worker.join().unwrap();
        }
    });

    TestServer {
        endpoint: bound,
        skeleton,
        accept_loop,
    }
}

fn pool() -> StubPool<StreamConnector> {
    StubPool::new(
        StreamConnector,
        PoolConfig {
            connect_timeout: Duration::from_secs(1),
            call_timeout: Duration::from_secs(5),
            idle_expiration: Duration::from_secs(60),
        },
    )
}

fn temp_sock_path(tag: &str) -> std::path::PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "wirecall-e2e-{tag}-{}-{}",
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("time should be after epoch")
            .as_nanos()
    ));
    std::fs::create_dir_all(&dir).expect("temp dir should be creatable");
    dir.join("e2e.sock")
}

#[test]
fn tcp_echo_round_trip() {
    let server = start_server(&"127.0.0.1:0".parse().unwrap(), 1);
    let pool = pool();

    let request = EchoMessage {
        seq: 1,
        payload: Bytes::from_static(b"over tcp"),
    };
    let response = pool
        .with_stub(&server.endpoint, false, |stub| {
            let mut resp_iov = IoVector::new();
            stub.call_open::<Echo>(&request, &mut resp_iov, Timeout::new(Duration::from_secs(5)))
        })
        .unwrap();
    assert_eq!(response, request);

    drop(pool);
    server.accept_loop.join().unwrap();
    server.skeleton.shutdown(true);
}

#[cfg(unix)]
#[test]
fn unix_echo_round_trip() {
    let path = temp_sock_path("uds");
    let server = start_server(&Endpoint::Unix(path.clone()), 1);
    let pool = pool();

    let request = EchoMessage {
        seq: 2,
        payload: Bytes::from_static(b"over a unix socket"),
    };
    let response = pool
        .with_stub(&server.endpoint, false, |stub| {
            let mut resp_iov = IoVector::new();
            stub.call_open::<Echo>(&request, &mut resp_iov, Timeout::new(Duration::from_secs(5)))
        })
        .unwrap();
    assert_eq!(response, request);

    drop(pool);
    server.accept_loop.join().unwrap();
    server.skeleton.shutdown(true);

    if let Some(parent) = path.parent() {
        let _ = std::fs::remove_dir_all(parent);
    }
}

#[test]
fn fixed_buffer_path_over_tcp() {
    let server = start_server(&"127.0.0.1:0".parse().unwrap(), 1);
    let pool = pool();

    let stub = pool.get_stub(&server.endpoint, false).unwrap();
    let request = EchoMessage {
        seq: 3,
        payload: Bytes::from_static(b"exact fit"),
    };
    // Pre-size the response payload to the exact echoed size: the reply
    // then matches the budget and takes the checksum-validated path.
    let mut response = EchoMessage {
        seq: 0,
        payload: Bytes::from(vec![0u8; request.payload.len()]),
    };
    let received = stub
        .call::<Echo>(&request, &mut response, Timeout::new(Duration::from_secs(5)))
        .unwrap();

    assert_eq!(
        received,
        wirecall::wire::CHECKSUM_SIZE + EchoMessage::FIXED_SIZE + request.payload.len()
    );
    assert_eq!(response, request);

    pool.put_stub(&server.endpoint, false).unwrap();
    drop(pool);
    server.accept_loop.join().unwrap();
    server.skeleton.shutdown(true);
}

#[test]
fn concurrent_callers_share_one_pooled_connection() {
    let server = start_server(&"127.0.0.1:0".parse().unwrap(), 1);
    let pool = Arc::new(pool());

    // Warm the cache so the callers race on one shared entry instead of
    // opening parallel connections the single-accept server would ignore.
    let _ = pool.get_stub(&server.endpoint, false).unwrap();
    pool.put_stub(&server.endpoint, false).unwrap();

    let mut callers = Vec::new();
    for i in 0..8u64 {
        let pool = Arc::clone(&pool);
        let endpoint = server.endpoint.clone();
        callers.push(thread::spawn(move || {
            for j in 0..4u64 {
                let seq = i * 100 + j;
                let request = EchoMessage {
                    seq,
                    payload: Bytes::from(format!("caller {i} call {j}").into_bytes()),
                };
                let response = pool
                    .with_stub(&endpoint, false, |stub| {
                        let mut resp_iov = IoVector::new();
                        stub.call_open::<Echo>(
                            &request,
                            &mut resp_iov,
                            Timeout::new(Duration::from_secs(5)),
                        )
                    })
                    .unwrap();
                assert_eq!(response, request);
            }
        }));
    }
    for caller in callers {
        caller.join().unwrap();
    }
    assert_eq!(pool.len(), 1, "all callers should share one connection");

    drop(pool);
    server.accept_loop.join().unwrap();
    server.skeleton.shutdown(true);
}
