
use std::sync::Arc;
use std::time::Duration;

use faultline_proxy::{Proxy, ProxyError};
use faultline_toxics::{Direction, Latency};
use harness::{
    proxy_addr, start_tcp_proxy, start_udp_proxy, step, tcp_roundtrip, udp_client, udp_roundtrip,
    TcpEchoServer, UdpEchoServer,
};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio_test::{assert_err, assert_ok};

#[tokio::test]
async fn start_reports_concrete_address() {
    let upstream = TcpEchoServer::spawn().await.unwrap();
    let proxy = start_tcp_proxy("echo", upstream.addr).await;

    let addr = proxy_addr(&proxy);
    assert_ne!(addr.port(), 0);
    assert_eq!(proxy.config().listen, addr.to_string());
    assert!(proxy.config().enabled);

    // Reachable as soon as start returns.
    assert_ok!(TcpStream::connect(addr).await);

    proxy.stop().await;
}

#[tokio::test]
async fn double_start_is_rejected() {
    let upstream = TcpEchoServer::spawn().await.unwrap();
    let proxy = start_tcp_proxy("echo", upstream.addr).await;
    let addr = proxy_addr(&proxy);

    let err = proxy.start().await.unwrap_err();
    assert!(matches!(err, ProxyError::AlreadyStarted(name) if name == "echo"));

    // The running loop is untouched.
    assert_eq!(proxy_addr(&proxy), addr);
    let mut client = TcpStream::connect(addr).await.unwrap();
    assert_eq!(tcp_roundtrip(&mut client, b"still here").await, b"still here");

    proxy.stop().await;
}

#[tokio::test]
async fn double_stop_is_a_no_op() {
    let upstream = TcpEchoServer::spawn().await.unwrap();
    let proxy = start_tcp_proxy("echo", upstream.addr).await;

    step(proxy.stop()).await;
    step(proxy.stop()).await;

    assert!(!proxy.enabled());
}

#[tokio::test]
async fn start_then_stop_releases_tcp_port() {
    let upstream = TcpEchoServer::spawn().await.unwrap();
    let proxy = start_tcp_proxy("echo", upstream.addr).await;
    let addr = proxy_addr(&proxy);

    step(proxy.stop()).await;

    assert_eq!(proxy.connection_count(), 0);
    assert_ok!(TcpListener::bind(addr).await);
}

#[tokio::test]
async fn start_then_stop_releases_udp_port() {
    let upstream = UdpEchoServer::spawn().await.unwrap();
    let proxy = start_udp_proxy("echo", upstream.addr).await;
    let addr = proxy_addr(&proxy);

    step(proxy.stop()).await;

    assert_eq!(proxy.connection_count(), 0);
    assert_ok!(UdpSocket::bind(addr).await);
}

#[tokio::test]
async fn bind_failure_leaves_proxy_retryable() {
    let upstream = TcpEchoServer::spawn().await.unwrap();
    let squatter = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let taken = squatter.local_addr().unwrap();

    let proxy = Proxy::tcp("echo", taken.to_string(), upstream.addr.to_string());

    let err = proxy.start().await.unwrap_err();
    assert!(matches!(err, ProxyError::Bind { .. }));
    assert!(!proxy.enabled());

    drop(squatter);
    assert_ok!(proxy.start().await);
    assert_eq!(proxy_addr(&proxy), taken);

    proxy.stop().await;
}

#[tokio::test]
async fn restart_keeps_toxics() {
    let upstream = TcpEchoServer::spawn().await.unwrap();
    let proxy = start_tcp_proxy("echo", upstream.addr).await;
    proxy
        .toxics()
        .add(
            "latency",
            Direction::Upstream,
            Arc::new(Latency::new(Duration::from_millis(1))),
        )
        .unwrap();

    proxy.stop().await;
    assert_ok!(proxy.start().await);

    assert_eq!(proxy.toxics().list()[0].name, "latency");
    let mut client = TcpStream::connect(proxy_addr(&proxy)).await.unwrap();
    assert_eq!(tcp_roundtrip(&mut client, b"hi").await, b"hi");

    proxy.stop().await;
}

#[tokio::test]
async fn update_disable_only_touches_that_proxy() {
    let upstream = TcpEchoServer::spawn().await.unwrap();
    let first = start_tcp_proxy("first", upstream.addr).await;
    let second = start_tcp_proxy("second", upstream.addr).await;

    let mut a = TcpStream::connect(proxy_addr(&first)).await.unwrap();
    let mut b = TcpStream::connect(proxy_addr(&second)).await.unwrap();
    tcp_roundtrip(&mut a, b"a").await;
    tcp_roundtrip(&mut b, b"b").await;

    let config = first.config().with_enabled(false);
    step(first.update(&config)).await.unwrap();

    assert!(!first.enabled());
    assert_eq!(first.connection_count(), 0);

    assert!(second.enabled());
    assert_eq!(second.connection_count(), 2);
    assert_eq!(tcp_roundtrip(&mut b, b"still b").await, b"still b");

    second.stop().await;
}

#[tokio::test]
async fn update_to_enabled_starts_proxy() {
    let upstream = TcpEchoServer::spawn().await.unwrap();
    let proxy = Proxy::tcp("echo", "127.0.0.1:0", upstream.addr.to_string());

    let config = proxy.config().with_enabled(true);
    assert_ok!(proxy.update(&config).await);

    assert!(proxy.enabled());
    let mut client = TcpStream::connect(proxy_addr(&proxy)).await.unwrap();
    assert_eq!(tcp_roundtrip(&mut client, b"up").await, b"up");

    proxy.stop().await;
}

#[tokio::test]
async fn update_upstream_restarts_against_new_target() {
    let old_upstream = UdpEchoServer::spawn().await.unwrap();
    let new_upstream = UdpEchoServer::spawn().await.unwrap();
    let proxy = start_udp_proxy("echo", old_upstream.addr).await;

    let client = udp_client(&proxy).await;
    udp_roundtrip(&client, b"old").await;

    let mut config = proxy.config();
    config.upstream = new_upstream.addr.to_string();
    step(proxy.update(&config)).await.unwrap();

    assert!(proxy.enabled());
    assert_eq!(proxy.upstream(), new_upstream.addr.to_string());

    // Same listen port, fresh virtual connection.
    assert_eq!(udp_roundtrip(&client, b"new").await, b"new");
    assert_eq!(new_upstream.datagram_count(), 1);
    assert_eq!(old_upstream.datagram_count(), 1);

    proxy.stop().await;
}

#[tokio::test]
async fn update_rejects_empty_fields() {
    let proxy = Proxy::tcp("echo", "127.0.0.1:0", "127.0.0.1:1");

    let mut config = proxy.config();
    config.upstream.clear();

    assert_err!(proxy.update(&config).await);
    assert_eq!(proxy.upstream(), "127.0.0.1:1");
}

#[tokio::test]
async fn concurrent_starts_admit_one() {
    let upstream = TcpEchoServer::spawn().await.unwrap();
    let proxy = Arc::new(Proxy::tcp("echo", "127.0.0.1:0", upstream.addr.to_string()));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let proxy = Arc::clone(&proxy);
        handles.push(tokio::spawn(async move { proxy.start().await }));
    }

    let mut started = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(()) => started += 1,
            Err(ProxyError::AlreadyStarted(_)) => {}
            Err(e) => panic!("unexpected start error: {e}"),
        }
    }

    assert_eq!(started, 1);
    assert!(proxy.enabled());
    proxy.stop().await;
}

#[tokio::test]
async fn concurrent_stop_and_start_settle() {
    let upstream = TcpEchoServer::spawn().await.unwrap();
    let proxy = Arc::new(start_tcp_proxy("echo", upstream.addr).await);

    let stopper = {
        let proxy = Arc::clone(&proxy);
        tokio::spawn(async move { proxy.stop().await })
    };
    let starter = {
        let proxy = Arc::clone(&proxy);
        tokio::spawn(async move { proxy.start().await })
    };

    step(stopper).await.unwrap();
    let start = step(starter).await.unwrap();

    // Either order is fine, but the final state must match the last call.
    match start {
        Ok(()) => assert!(proxy.enabled()),
        Err(ProxyError::AlreadyStarted(_)) => assert!(!proxy.enabled()),
        Err(e) => panic!("unexpected start error: {e}"),
    }

    proxy.stop().await;
    assert!(!proxy.enabled());
}
