//! Compound reactor behavior: posted work, connection handles, shutdown.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use vigilis::{Connection, Reactor, ScopedConnection};

#[test]
fn posted_work_runs_on_a_dispatching_thread() {
    let reactor = Reactor::new().unwrap();
    let ran = Arc::new(AtomicUsize::new(0));

    let ran_in_item = ran.clone();
    reactor.post(move || {
        ran_in_item.fetch_add(1, Ordering::Relaxed);
    });

    while ran.load(Ordering::Relaxed) == 0 {
        reactor.dispatch(Some(Duration::from_secs(1)), usize::MAX).unwrap();
    }
    assert_eq!(ran.load(Ordering::Relaxed), 1);
}

#[test]
fn posted_work_preserves_order_across_passes() {
    let reactor = Reactor::new().unwrap();
    let order = Arc::new(std::sync::Mutex::new(Vec::new()));

    for n in 0..5 {
        let order = order.clone();
        reactor.post(move || {
            order.lock().unwrap().push(n);
        });
    }

    // one item per pass; the re-raised flag keeps the passes coming
    reactor.dispatch_pending_all().unwrap();
    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
}

#[test]
fn post_from_another_thread_wakes_dispatch() {
    let reactor = Arc::new(Reactor::new().unwrap());
    let ran = Arc::new(AtomicUsize::new(0));

    let poster = {
        let reactor = reactor.clone();
        let ran = ran.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            let ran_in_item = ran.clone();
            reactor.post(move || {
                ran_in_item.fetch_add(1, Ordering::Relaxed);
            });
        })
    };

    while ran.load(Ordering::Relaxed) == 0 {
        reactor.dispatch(Some(Duration::from_secs(10)), usize::MAX).unwrap();
    }
    poster.join().unwrap();
}

#[test]
fn typed_connections_downcast_to_plain_connections() {
    let reactor = Reactor::new().unwrap();

    let async_conn = reactor.async_procedure(|| {});
    let timer_conn = reactor.timer(|_| None, std::time::Instant::now() + Duration::from_secs(60));

    let mut plain: Connection = async_conn.into();
    assert!(plain.is_connected());
    plain.disconnect();
    assert!(!plain.is_connected());

    let mut plain: Connection = timer_conn.into();
    assert!(plain.is_connected());
    plain.disconnect();
    assert!(!plain.is_connected());
}

#[test]
fn scoped_connection_disconnects_on_drop() {
    let reactor = Reactor::new().unwrap();
    let called = Arc::new(AtomicUsize::new(0));

    let called_in_cb = called.clone();
    let conn = reactor.async_procedure(move || {
        called_in_cb.fetch_add(1, Ordering::Relaxed);
    });
    let probe = conn.clone();

    {
        let _scoped: ScopedConnection = Connection::from(conn).into();
        assert!(probe.is_connected());
    }
    assert!(!probe.is_connected(), "scope exit must disconnect");

    probe.trigger();
    reactor.dispatch_pending(usize::MAX).unwrap();
    assert_eq!(called.load(Ordering::Relaxed), 0);
}

#[test]
fn dispatch_returns_zero_on_timeout() {
    let reactor = Reactor::new().unwrap();
    let processed = reactor
        .dispatch(Some(Duration::from_millis(10)), usize::MAX)
        .unwrap();
    assert_eq!(processed, 0, "an idle reactor times out without events");
}

#[test]
fn reactor_shutdown_with_live_handles_is_clean() {
    let reactor = Reactor::new().unwrap();
    let called = Arc::new(AtomicUsize::new(0));

    let called_in_cb = called.clone();
    let async_conn = reactor.async_procedure(move || {
        called_in_cb.fetch_add(1, Ordering::Relaxed);
    });
    let timer_conn = reactor.timer(|_| None, std::time::Instant::now() + Duration::from_secs(60));
    async_conn.trigger();

    drop(reactor);

    assert!(!async_conn.is_connected());
    assert!(!timer_conn.is_connected());
    assert_eq!(called.load(Ordering::Relaxed), 0, "pending work is reclaimed, not run");
}
