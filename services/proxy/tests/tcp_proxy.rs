
use std::sync::Arc;
use std::time::Duration;

use faultline_toxics::{Direction, Latency};
use harness::{
    closed_tcp_addr, eventually, proxy_addr, start_tcp_proxy, step, tcp_roundtrip, TcpEchoServer,
};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::time::Instant;

#[tokio::test]
async fn relays_bytes_unmodified() {
    let upstream = TcpEchoServer::spawn().await.unwrap();
    let proxy = start_tcp_proxy("echo", upstream.addr).await;

    let mut client = TcpStream::connect(proxy_addr(&proxy)).await.unwrap();
    let echoed = tcp_roundtrip(&mut client, b"hello world").await;

    assert_eq!(echoed, b"hello world");
    assert_eq!(upstream.connection_count(), 1);

    proxy.stop().await;
}

#[tokio::test]
async fn registers_both_directions_per_client() {
    let upstream = TcpEchoServer::spawn().await.unwrap();
    let proxy = start_tcp_proxy("echo", upstream.addr).await;

    let mut first = TcpStream::connect(proxy_addr(&proxy)).await.unwrap();
    let mut second = TcpStream::connect(proxy_addr(&proxy)).await.unwrap();
    tcp_roundtrip(&mut first, b"one").await;
    tcp_roundtrip(&mut second, b"two").await;

    let peer = first.local_addr().unwrap().to_string();
    assert_eq!(proxy.connection_count(), 4);
    assert!(proxy.connections().contains(&format!("{peer}upstream")));
    assert!(proxy.connections().contains(&format!("{peer}downstream")));

    proxy.stop().await;
}

#[tokio::test]
async fn client_disconnect_clears_its_links() {
    let upstream = TcpEchoServer::spawn().await.unwrap();
    let proxy = start_tcp_proxy("echo", upstream.addr).await;

    let mut client = TcpStream::connect(proxy_addr(&proxy)).await.unwrap();
    tcp_roundtrip(&mut client, b"ping").await;
    assert_eq!(proxy.connection_count(), 2);

    drop(client);

    assert!(eventually(|| proxy.connection_count() == 0).await);
    assert!(proxy.enabled());

    proxy.stop().await;
}

#[tokio::test]
async fn upstream_down_keeps_accepting() {
    let dead = closed_tcp_addr().await.unwrap();
    let proxy = start_tcp_proxy("dead", dead).await;

    for _ in 0..2 {
        let mut client = TcpStream::connect(proxy_addr(&proxy)).await.unwrap();
        let mut buf = [0u8; 8];
        // The proxy hangs up as soon as the upstream dial fails.
        let read = step(client.read(&mut buf)).await;
        assert!(matches!(read, Ok(0) | Err(_)));
    }

    assert!(proxy.enabled());
    assert_eq!(proxy.connection_count(), 0);

    // Pointing the proxy at a live upstream brings it back.
    let upstream = TcpEchoServer::spawn().await.unwrap();
    let mut config = proxy.config();
    config.upstream = upstream.addr.to_string();
    proxy.update(&config).await.unwrap();

    let mut client = TcpStream::connect(proxy_addr(&proxy)).await.unwrap();
    assert_eq!(tcp_roundtrip(&mut client, b"back").await, b"back");

    proxy.stop().await;
}

#[tokio::test]
async fn stop_closes_live_connections() {
    let upstream = TcpEchoServer::spawn().await.unwrap();
    let proxy = start_tcp_proxy("echo", upstream.addr).await;
    let addr = proxy_addr(&proxy);

    let mut client = TcpStream::connect(addr).await.unwrap();
    tcp_roundtrip(&mut client, b"ping").await;

    step(proxy.stop()).await;

    assert_eq!(proxy.connection_count(), 0);
    let mut buf = [0u8; 8];
    let read = step(client.read(&mut buf)).await;
    assert!(matches!(read, Ok(0) | Err(_)));

    assert!(TcpStream::connect(addr).await.is_err());
}

#[tokio::test]
async fn latency_toxic_delays_downstream() {
    let upstream = TcpEchoServer::spawn().await.unwrap();
    let proxy = start_tcp_proxy("slow", upstream.addr).await;
    proxy
        .toxics()
        .add(
            "latency_downstream",
            Direction::Downstream,
            Arc::new(Latency::new(Duration::from_millis(200))),
        )
        .unwrap();

    let mut client = TcpStream::connect(proxy_addr(&proxy)).await.unwrap();
    let started = Instant::now();
    let echoed = tcp_roundtrip(&mut client, b"hello").await;

    assert_eq!(echoed, b"hello");
    assert!(started.elapsed() >= Duration::from_millis(200));

    proxy.stop().await;
}
