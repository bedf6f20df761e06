//! Teardown safety: stale replies, destroyed contexts, peer disconnects.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use patchbay::{CallError, ConnectionState, Dispatcher};
use patchbay_testkit::{
    init_tracing, pack_pair, pack_u32, spawn_dispatcher, stop_dispatcher, temp_endpoint,
    unpack_pair, CounterService, COUNTER_INTERFACE, METHOD_ECHO,
};

const TIMEOUT: Duration = Duration::from_secs(2);

#[tokio::test]
async fn abandoned_request_never_hits_its_handler() {
    init_tracing();
    let endpoint = temp_endpoint("abandon.sock");
    let mut disp = Dispatcher::new();
    disp.attach(&endpoint.spec).await.unwrap();
    disp.add_server(Box::new(CounterService::new("abandon"))).await;

    let client = disp.add_client(COUNTER_INTERFACE, "abandon", |_| {});
    disp.connect_blocking(client, TIMEOUT).await.unwrap();

    let fired = Arc::new(AtomicBool::new(false));
    let flag = fired.clone();
    let seq = disp
        .send_request(client, METHOD_ECHO, pack_u32(1), move |_| {
            flag.store(true, Ordering::SeqCst);
        })
        .await
        .unwrap();

    // Context gone before the loop ever pumped the request.
    assert!(disp.abandon_request(seq));
    assert!(!disp.abandon_request(seq));

    // This round trip pumps the abandoned request's late response too; it
    // must be dropped as stale without invoking the dead handler.
    let reply = disp
        .call(client, METHOD_ECHO, pack_pair(5, 0.5), TIMEOUT)
        .await
        .unwrap();
    assert_eq!(unpack_pair(&reply), (5, 0.5));
    assert!(!fired.load(Ordering::SeqCst));
}

#[tokio::test]
async fn removing_a_client_purges_its_outstanding_requests() {
    init_tracing();
    let endpoint = temp_endpoint("purge.sock");
    let mut disp = Dispatcher::new();
    disp.attach(&endpoint.spec).await.unwrap();
    disp.add_server(Box::new(CounterService::new("purge"))).await;

    let client = disp.add_client(COUNTER_INTERFACE, "purge", |_| {});
    disp.connect_blocking(client, TIMEOUT).await.unwrap();

    let fired = Arc::new(AtomicBool::new(false));
    let flag = fired.clone();
    disp.send_request(client, METHOD_ECHO, pack_u32(2), move |_| {
        flag.store(true, Ordering::SeqCst);
    })
    .await
    .unwrap();

    disp.remove_client(client).await;

    // Drain the loop; the request is still served by the skeleton, but its
    // response finds no entry and evaporates.
    while disp.once(Duration::from_millis(100)).await {}
    assert!(!fired.load(Ordering::SeqCst));
}

#[tokio::test]
async fn timed_out_call_drops_the_late_reply() {
    init_tracing();
    let endpoint = temp_endpoint("late.sock");

    let mut server = Dispatcher::new();
    server.attach(&endpoint.spec).await.unwrap();
    server.add_server(Box::new(CounterService::new("late"))).await;
    let (handle, task) = spawn_dispatcher(server);

    let mut disp = Dispatcher::new();
    let client = disp.add_client_at(COUNTER_INTERFACE, "late", &endpoint.spec, |_| {});
    disp.connect_blocking(client, TIMEOUT).await.unwrap();

    // Park the server so the call cannot be answered in time.
    let server = stop_dispatcher(&handle, task).await;

    let outcome = disp
        .call(client, METHOD_ECHO, pack_u32(7), Duration::from_millis(200))
        .await;
    assert!(matches!(outcome, Err(CallError::Timeout)));

    // Wake the server back up; its late reply reaches a table with no
    // entry and the next call proceeds normally.
    let (handle, task) = spawn_dispatcher(server);
    let reply = disp
        .call(client, METHOD_ECHO, pack_pair(8, 0.125), TIMEOUT)
        .await
        .unwrap();
    assert_eq!(unpack_pair(&reply), (8, 0.125));

    stop_dispatcher(&handle, task).await;
}

#[tokio::test]
async fn peer_disconnect_walks_the_state_machine_down() {
    init_tracing();
    let endpoint = temp_endpoint("down.sock");

    let mut server = Dispatcher::new();
    server.attach(&endpoint.spec).await.unwrap();
    server.add_server(Box::new(CounterService::new("down"))).await;
    let (handle, task) = spawn_dispatcher(server);

    let mut disp = Dispatcher::new();
    let states: Arc<Mutex<Vec<ConnectionState>>> = Arc::default();
    let observed = states.clone();
    let client = disp.add_client_at(COUNTER_INTERFACE, "down", &endpoint.spec, move |state| {
        observed.lock().unwrap().push(state);
    });
    disp.connect_blocking(client, TIMEOUT).await.unwrap();

    // Kill the server process; dropping it closes every socket it owns.
    let server = stop_dispatcher(&handle, task).await;
    drop(server);

    // Pump until the hangup lands.
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    while states.lock().unwrap().last() != Some(&ConnectionState::Disconnected) {
        assert!(tokio::time::Instant::now() < deadline, "no disconnect seen");
        disp.once(Duration::from_millis(50)).await;
    }

    assert_eq!(
        &*states.lock().unwrap(),
        &[
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::Disconnected,
        ],
    );
    assert!(matches!(
        disp.call(client, METHOD_ECHO, pack_u32(1), TIMEOUT).await,
        Err(CallError::NotConnected)
    ));
}

#[tokio::test]
#[should_panic(expected = "attach an endpoint")]
async fn adding_a_server_before_attach_panics() {
    let mut disp = Dispatcher::new();
    disp.add_server(Box::new(CounterService::new("early"))).await;
}

#[tokio::test]
#[should_panic(expected = "already registered")]
async fn duplicate_server_names_panic() {
    let endpoint = temp_endpoint("dup.sock");
    let mut disp = Dispatcher::new();
    disp.attach(&endpoint.spec).await.unwrap();
    disp.add_server(Box::new(CounterService::new("dup"))).await;
    disp.add_server(Box::new(CounterService::new("dup"))).await;
}
