//! Request/response scenarios over a local endpoint, with stub and skeleton
//! hosted by the same dispatcher (the local short-circuit path).

use std::sync::{Arc, Mutex};
use std::time::Duration;

use patchbay::{CallError, ConnectionState, Dispatcher, ErrorCode};
use patchbay_testkit::{
    init_tracing, pack_pair, pack_u32, temp_endpoint, unpack_pair, unpack_u32, CounterService,
    COUNTER_INTERFACE, METHOD_BUMP, METHOD_COUNT, METHOD_ECHO, METHOD_SESSION_COUNT,
};

const TIMEOUT: Duration = Duration::from_secs(2);

#[tokio::test]
async fn echo_round_trip() {
    init_tracing();
    let endpoint = temp_endpoint("echo.sock");
    let mut disp = Dispatcher::new();
    disp.attach(&endpoint.spec).await.unwrap();
    disp.add_server(Box::new(CounterService::new("echo"))).await;

    let states: Arc<Mutex<Vec<ConnectionState>>> = Arc::default();
    let observed = states.clone();
    let client = disp.add_client(COUNTER_INTERFACE, "echo", move |state| {
        observed.lock().unwrap().push(state);
    });

    disp.connect_blocking(client, TIMEOUT).await.unwrap();
    let reply = disp
        .call(client, METHOD_ECHO, pack_pair(42, 0.5), TIMEOUT)
        .await
        .unwrap();
    assert_eq!(unpack_pair(&reply), (42, 0.5));

    assert_eq!(
        &*states.lock().unwrap(),
        &[ConnectionState::Connecting, ConnectionState::Connected],
    );
}

#[tokio::test]
async fn oneways_are_counted_globally_and_per_session() {
    init_tracing();
    let endpoint = temp_endpoint("count.sock");
    let mut disp = Dispatcher::new();
    disp.attach(&endpoint.spec).await.unwrap();

    let service = CounterService::new("count");
    let count = service.counter();
    disp.add_server(Box::new(service)).await;

    let client = disp.add_client(COUNTER_INTERFACE, "count", |_| {});
    disp.connect_blocking(client, TIMEOUT).await.unwrap();

    for _ in 0..3 {
        disp.send_oneway(client, METHOD_BUMP, pack_u32(0)).await.unwrap();
    }

    // The count request is ordered behind the three bumps on the same
    // connection, so the reply proves they all ran.
    let reply = disp
        .call(client, METHOD_COUNT, pack_u32(0), TIMEOUT)
        .await
        .unwrap();
    assert_eq!(unpack_u32(&reply), 3);
    assert_eq!(count.load(std::sync::atomic::Ordering::SeqCst), 3);

    let reply = disp
        .call(client, METHOD_SESSION_COUNT, pack_u32(0), TIMEOUT)
        .await
        .unwrap();
    assert_eq!(unpack_u32(&reply), 3);
}

#[tokio::test]
async fn unknown_method_surfaces_as_runtime_error() {
    init_tracing();
    let endpoint = temp_endpoint("err.sock");
    let mut disp = Dispatcher::new();
    disp.attach(&endpoint.spec).await.unwrap();
    disp.add_server(Box::new(CounterService::new("err"))).await;

    let client = disp.add_client(COUNTER_INTERFACE, "err", |_| {});
    disp.connect_blocking(client, TIMEOUT).await.unwrap();

    match disp.call(client, 999, pack_u32(0), TIMEOUT).await {
        Err(CallError::Runtime(err)) => {
            assert_eq!(err.code, ErrorCode::Unimplemented as u32);
        }
        other => panic!("expected a runtime error, got {other:?}"),
    }
}

#[tokio::test]
async fn calling_before_connecting_is_refused() {
    init_tracing();
    let endpoint = temp_endpoint("refuse.sock");
    let mut disp = Dispatcher::new();
    disp.attach(&endpoint.spec).await.unwrap();
    disp.add_server(Box::new(CounterService::new("refuse"))).await;

    let client = disp.add_client(COUNTER_INTERFACE, "refuse", |_| {});
    assert!(matches!(
        disp.call(client, METHOD_ECHO, pack_u32(0), TIMEOUT).await,
        Err(CallError::NotConnected)
    ));
}

#[tokio::test]
async fn two_clients_interleave_on_one_connection() {
    init_tracing();
    let endpoint = temp_endpoint("multi.sock");
    let mut disp = Dispatcher::new();
    disp.attach(&endpoint.spec).await.unwrap();
    disp.add_server(Box::new(CounterService::new("multi"))).await;

    let a = disp.add_client(COUNTER_INTERFACE, "multi", |_| {});
    let b = disp.add_client(COUNTER_INTERFACE, "multi", |_| {});
    disp.connect_blocking(a, TIMEOUT).await.unwrap();
    disp.connect_blocking(b, TIMEOUT).await.unwrap();

    for (client, value) in [(a, 1i32), (b, 2), (a, 3)] {
        let reply = disp
            .call(client, METHOD_ECHO, pack_pair(value, 0.25), TIMEOUT)
            .await
            .unwrap();
        assert_eq!(unpack_pair(&reply), (value, 0.25));
    }
}
