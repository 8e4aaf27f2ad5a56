// tests/blocking.rs
//
// The blocking surface, driven from plain threads.

use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;

use esub::blocking::Client;
use esub::{
    // ---
    CancelReason,
    CancellationToken,
    ClientConfig,
    EsubError,
    Key,
    MemoryHub,
    SubscribeOptions,
    Token,
};

fn wait_for_waiters(hub: &MemoryHub, key: &str, n: usize) {
    // ---
    let key = Key::new(key).unwrap();
    let start = Instant::now();
    while hub.waiting(&key) < n {
        assert!(start.elapsed() < Duration::from_secs(5), "subscriber never arrived");
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn test_subscribe_and_reply_from_two_threads() {
    // ---
    let hub = MemoryHub::with_tokens(["secret"]);
    let client = Client::with_hub(ClientConfig::default(), hub.clone()).unwrap();
    let secret = Token::from("secret");

    let subscriber = thread::spawn({
        let client = client.clone();
        let secret = secret.clone();
        move || client.subscribe("orders", Some(&secret))
    });
    wait_for_waiters(&hub, "orders", 1);

    client.reply("orders", "shipped#42", Some(&secret)).unwrap();

    let msg = subscriber.join().unwrap().unwrap();
    assert_eq!(msg, Bytes::from("shipped#42"));
}

#[test]
fn test_cancel_token_from_another_thread() {
    // ---
    let hub = MemoryHub::new();
    let client = Client::with_hub(ClientConfig::default(), hub.clone()).unwrap();
    let cancel = CancellationToken::new();

    let subscriber = thread::spawn({
        let client = client.clone();
        let opts = SubscribeOptions::new().with_cancel(cancel.clone());
        move || client.subscribe_with("orders", None, opts)
    });
    wait_for_waiters(&hub, "orders", 1);

    let canceled_at = Instant::now();
    cancel.cancel();
    let outcome = subscriber.join().unwrap();

    assert!(matches!(outcome, Err(EsubError::Canceled(CancelReason::Caller))));
    assert!(canceled_at.elapsed() < Duration::from_secs(1));

    let later = client.reply("orders", "late", None);
    assert!(matches!(later, Err(EsubError::NoSubscriber(_))));
}

#[test]
fn test_timeout_unblocks_thread() {
    // ---
    let hub = MemoryHub::new();
    let config = ClientConfig::default().with_request_timeout(Duration::from_millis(100));
    let client = Client::with_hub(config, hub.clone()).unwrap();

    let outcome = client.subscribe("orders", None);
    assert!(matches!(outcome, Err(EsubError::Canceled(CancelReason::Timeout))));
    assert_eq!(hub.waiting(&Key::new("orders").unwrap()), 0);
}

#[test]
fn test_rejected_token_returns_immediately() {
    // ---
    let hub = MemoryHub::with_tokens(["secret"]);
    let client = Client::with_hub(ClientConfig::default(), hub).unwrap();

    let start = Instant::now();
    let outcome = client.subscribe("orders", Some(&Token::from("wrong")));
    assert!(matches!(outcome, Err(EsubError::Unauthorized)));
    assert!(start.elapsed() < Duration::from_secs(1));
}

#[test]
fn test_close_unblocks_waiting_thread() {
    // ---
    let hub = MemoryHub::new();
    let client = Client::with_hub(ClientConfig::default(), hub.clone()).unwrap();

    let subscriber = thread::spawn({
        let client = client.clone();
        move || client.subscribe("orders", None)
    });
    wait_for_waiters(&hub, "orders", 1);

    client.close().unwrap();
    let outcome = subscriber.join().unwrap();
    assert!(matches!(outcome, Err(EsubError::Canceled(CancelReason::Shutdown))));
}

#[test]
fn test_hub_shutdown_is_connection_failed() {
    // ---
    let hub = MemoryHub::new();
    let client = Client::with_hub(ClientConfig::default(), hub.clone()).unwrap();

    let subscriber = thread::spawn({
        let client = client.clone();
        move || client.subscribe("orders", None)
    });
    wait_for_waiters(&hub, "orders", 1);

    hub.shutdown();
    let outcome = subscriber.join().unwrap();
    assert!(matches!(outcome, Err(EsubError::ConnectionFailed(_))));
}
