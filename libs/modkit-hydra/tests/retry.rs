#![allow(clippy::unwrap_used, clippy::expect_used)]

//! Retries of requests sent on pooled connections the server already closed.

mod common;

use modkit_hydra::{ClientBuilder, HttpError, RequestOptions, SocketFaultKind};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

fn two_requests(client: &modkit_hydra::Client, url: &str) -> Result<String, HttpError> {
    let first = client.get(url, RequestOptions::new())?.text()?;
    assert_eq!(first, "ok");
    // let the server's FIN reach the pooled connection
    std::thread::sleep(Duration::from_millis(100));
    client.get(url, RequestOptions::new())?.text()
}

#[test]
fn test_dropped_keepalive_connection_is_retried() {
    common::init_tracing();
    let (addr, connections) = common::flaky_keepalive_server();
    let client = ClientBuilder::new().automatic_retries(3).build().unwrap();
    let url = format!("http://{addr}/");

    assert_eq!(two_requests(&client, &url).unwrap(), "ok");
    assert_eq!(connections.load(Ordering::SeqCst), 2);
}

#[test]
fn test_retry_count_is_reported() {
    let (addr, _) = common::flaky_keepalive_server();
    let client = ClientBuilder::new().automatic_retries(1).build().unwrap();
    let url = format!("http://{addr}/");

    client.get(&url, RequestOptions::new()).unwrap().body().unwrap();
    std::thread::sleep(Duration::from_millis(100));
    let mut second = client.get(&url, RequestOptions::new()).unwrap();
    assert_eq!(second.text().unwrap(), "ok");
    assert_eq!(second.times_retried().unwrap(), 1);
}

#[test]
fn test_without_retries_the_fault_surfaces() {
    let (addr, _) = common::flaky_keepalive_server();
    let client = ClientBuilder::new().automatic_retries(0).build().unwrap();
    let url = format!("http://{addr}/");

    let err = two_requests(&client, &url).unwrap_err();
    assert_eq!(err.socket_kind(), Some(SocketFaultKind::ClosedBeforeResponse));
}

#[test]
fn test_custom_retry_decider() {
    let (addr, _) = common::flaky_keepalive_server();
    let consulted = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&consulted);
    let client = ClientBuilder::new()
        .retry_policy(move |fault: &HttpError, attempt: usize| {
            counter.fetch_add(1, Ordering::SeqCst);
            fault.is_pre_response_fault() && attempt <= 1
        })
        .build()
        .unwrap();
    let url = format!("http://{addr}/");

    assert_eq!(two_requests(&client, &url).unwrap(), "ok");
    assert_eq!(consulted.load(Ordering::SeqCst), 1);
}

#[test]
fn test_stale_check_avoids_dead_connections() {
    let (addr, connections) = common::flaky_keepalive_server();
    let client = ClientBuilder::new()
        .automatic_retries(0)
        .stale_check(true)
        .build()
        .unwrap();
    let url = format!("http://{addr}/");

    assert_eq!(two_requests(&client, &url).unwrap(), "ok");
    assert_eq!(connections.load(Ordering::SeqCst), 2);
}

#[test]
fn test_keepalive_disabled_opens_fresh_connections() {
    let (addr, connections) = common::flaky_keepalive_server();
    let client = ClientBuilder::new()
        .automatic_retries(0)
        .keepalive(modkit_hydra::KeepAlive::Disabled)
        .build()
        .unwrap();
    let url = format!("http://{addr}/");

    assert_eq!(two_requests(&client, &url).unwrap(), "ok");
    assert_eq!(connections.load(Ordering::SeqCst), 2);
    assert_eq!(client.pool_stats().available, 0);
}
