//! Signal fan-out, ordering and unsubscription.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use patchbay::Dispatcher;
use patchbay_testkit::{
    init_tracing, pack_u32, temp_endpoint, unpack_u32, CounterService, COUNTER_INTERFACE,
    METHOD_KICK, SIGNAL_TICK,
};

const TIMEOUT: Duration = Duration::from_secs(2);

fn collector() -> (Arc<Mutex<Vec<u32>>>, impl FnMut(&[u8]) + Send + 'static) {
    let seen: Arc<Mutex<Vec<u32>>> = Arc::default();
    let sink = seen.clone();
    (seen, move |args: &[u8]| {
        sink.lock().unwrap().push(unpack_u32(args));
    })
}

#[tokio::test]
async fn fan_out_to_two_subscribers_with_mid_stream_unsubscribe() {
    init_tracing();
    let endpoint = temp_endpoint("sig.sock");
    let mut disp = Dispatcher::new();
    disp.attach(&endpoint.spec).await.unwrap();
    let server_id = disp.add_server(Box::new(CounterService::new("sig"))).await;

    let c1 = disp.add_client(COUNTER_INTERFACE, "sig", |_| {});
    let c2 = disp.add_client(COUNTER_INTERFACE, "sig", |_| {});
    disp.connect_blocking(c1, TIMEOUT).await.unwrap();
    disp.connect_blocking(c2, TIMEOUT).await.unwrap();

    let (seen1, sink1) = collector();
    let (seen2, sink2) = collector();
    disp.subscribe_signal(c1, SIGNAL_TICK, sink1).await.unwrap();
    disp.subscribe_signal(c2, SIGNAL_TICK, sink2).await.unwrap();

    // Each kick round-trips, which also pumps the acks and emissions in
    // frame order: both subscribers see the values in emission order.
    for value in [100u32, 101] {
        disp.call(c1, METHOD_KICK, pack_u32(value), TIMEOUT)
            .await
            .unwrap();
    }
    assert_eq!(&*seen1.lock().unwrap(), &[100, 101]);
    assert_eq!(&*seen2.lock().unwrap(), &[100, 101]);

    // Unsubscribing c1 stops further delivery to c1 only.
    assert_eq!(disp.unsubscribe_signal(c1, SIGNAL_TICK).await, 1);
    disp.call(c1, METHOD_KICK, pack_u32(102), TIMEOUT)
        .await
        .unwrap();

    assert_eq!(&*seen1.lock().unwrap(), &[100, 101]);
    assert_eq!(&*seen2.lock().unwrap(), &[100, 101, 102]);

    // Emission also works from outside a dispatch, straight off the
    // skeleton's own code path.
    disp.emit_signal(server_id, SIGNAL_TICK, pack_u32(103)).await;
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    while seen2.lock().unwrap().last() != Some(&103) {
        assert!(tokio::time::Instant::now() < deadline, "emission never arrived");
        disp.once(Duration::from_millis(50)).await;
    }
    assert_eq!(&*seen1.lock().unwrap(), &[100, 101]);
}

#[tokio::test]
async fn removing_a_completed_registration_returns_none() {
    init_tracing();
    let endpoint = temp_endpoint("sigrace.sock");
    let mut disp = Dispatcher::new();
    disp.attach(&endpoint.spec).await.unwrap();
    disp.add_server(Box::new(CounterService::new("sigrace"))).await;

    let client = disp.add_client(COUNTER_INTERFACE, "sigrace", |_| {});
    disp.connect_blocking(client, TIMEOUT).await.unwrap();

    let (seen, sink) = collector();
    let seq = disp.subscribe_signal(client, SIGNAL_TICK, sink).await.unwrap();

    // The round trip pumps the ack, completing the handshake.
    disp.call(client, METHOD_KICK, pack_u32(1), TIMEOUT)
        .await
        .unwrap();
    assert_eq!(&*seen.lock().unwrap(), &[1]);

    // Too late: already resolved. Not an error, just a miss.
    assert_eq!(disp.remove_signal_registration(seq), None);
}

#[tokio::test]
async fn a_late_ack_after_removal_is_absorbed() {
    init_tracing();
    let endpoint = temp_endpoint("sigdrop.sock");
    let mut disp = Dispatcher::new();
    disp.attach(&endpoint.spec).await.unwrap();
    disp.add_server(Box::new(CounterService::new("sigdrop"))).await;

    let client = disp.add_client(COUNTER_INTERFACE, "sigdrop", |_| {});
    disp.connect_blocking(client, TIMEOUT).await.unwrap();

    let (seen, sink) = collector();
    let seq = disp.subscribe_signal(client, SIGNAL_TICK, sink).await.unwrap();

    // Unsubscribe before the ack was pumped; the registration is still
    // pending, so removal reports it.
    assert_eq!(disp.remove_signal_registration(seq), Some(seq));

    // Pumping now delivers the ack for a registration that no longer
    // exists, plus an emission for a handler that was never installed.
    // Both are dropped without a handler running.
    disp.call(client, METHOD_KICK, pack_u32(9), TIMEOUT)
        .await
        .unwrap();
    assert!(seen.lock().unwrap().is_empty());
}
