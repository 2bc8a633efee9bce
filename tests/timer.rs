//! Timer behavior through the public reactor surface.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use vigilis::{Reactor, TimerConnection};

#[test]
fn timer_fires_at_deadline() {
    let reactor = Reactor::new().unwrap();
    let fired = Arc::new(AtomicUsize::new(0));

    let fired_in_cb = fired.clone();
    let start = Instant::now();
    let conn = reactor.timer(
        move |_| {
            fired_in_cb.fetch_add(1, Ordering::Relaxed);
            None
        },
        start + Duration::from_millis(30),
    );

    while fired.load(Ordering::Relaxed) == 0 {
        reactor.dispatch(Some(Duration::from_secs(5)), usize::MAX).unwrap();
    }
    assert!(
        start.elapsed() >= Duration::from_millis(30),
        "timer fired before its deadline"
    );
    assert!(!conn.is_connected(), "one-shot timer disconnects after firing");
}

#[test]
fn periodic_timer_reschedules_by_return_value() {
    let reactor = Reactor::new().unwrap();
    let fired = Arc::new(AtomicUsize::new(0));

    let fired_in_cb = fired.clone();
    let conn = reactor.timer(
        move |now| {
            if fired_in_cb.fetch_add(1, Ordering::Relaxed) < 2 {
                Some(now + Duration::from_millis(5))
            } else {
                None
            }
        },
        Instant::now(),
    );

    while fired.load(Ordering::Relaxed) < 3 {
        reactor.dispatch(Some(Duration::from_secs(5)), usize::MAX).unwrap();
    }
    assert_eq!(fired.load(Ordering::Relaxed), 3);
    assert!(!conn.is_connected());
}

#[test]
fn disconnected_timer_does_not_fire() {
    let reactor = Reactor::new().unwrap();
    let fired = Arc::new(AtomicUsize::new(0));

    let fired_in_cb = fired.clone();
    let mut conn = reactor.timer(
        move |_| {
            fired_in_cb.fetch_add(1, Ordering::Relaxed);
            None
        },
        Instant::now(),
    );
    conn.disconnect();

    reactor.dispatch_pending(usize::MAX).unwrap();
    assert_eq!(fired.load(Ordering::Relaxed), 0);
}

#[test]
fn rearm_moves_the_deadline() {
    let reactor = Reactor::new().unwrap();
    let fired = Arc::new(AtomicUsize::new(0));

    let fired_in_cb = fired.clone();
    let conn = reactor.timer(
        move |_| {
            fired_in_cb.fetch_add(1, Ordering::Relaxed);
            None
        },
        Instant::now() + Duration::from_secs(3600),
    );

    // nothing happens while the deadline is far away
    reactor.dispatch_pending(usize::MAX).unwrap();
    assert_eq!(fired.load(Ordering::Relaxed), 0);

    conn.rearm(Instant::now());
    while fired.load(Ordering::Relaxed) == 0 {
        reactor.dispatch(Some(Duration::from_secs(5)), usize::MAX).unwrap();
    }
    assert_eq!(fired.load(Ordering::Relaxed), 1);
}

#[test]
fn timer_callback_disconnecting_itself_is_safe() {
    let reactor = Reactor::new().unwrap();
    let fired = Arc::new(AtomicUsize::new(0));

    let slot: Arc<Mutex<TimerConnection>> = Arc::default();
    let fired_in_cb = fired.clone();
    let slot_in_cb = slot.clone();
    let conn = reactor.timer(
        move |now| {
            fired_in_cb.fetch_add(1, Ordering::Relaxed);
            slot_in_cb.lock().unwrap().disconnect();
            // ask for a reschedule; the disconnect must win
            Some(now + Duration::from_millis(1))
        },
        Instant::now(),
    );
    *slot.lock().unwrap() = conn.clone();

    while fired.load(Ordering::Relaxed) == 0 {
        reactor.dispatch(Some(Duration::from_secs(5)), usize::MAX).unwrap();
    }
    assert!(!conn.is_connected());

    // no further invocations, the reschedule request was superseded
    reactor.dispatch(Some(Duration::from_millis(20)), usize::MAX).unwrap();
    reactor.dispatch_pending(usize::MAX).unwrap();
    assert_eq!(fired.load(Ordering::Relaxed), 1);
}

#[test]
fn registering_an_earlier_timer_wakes_a_blocked_dispatch() {
    let reactor = Arc::new(Reactor::new().unwrap());
    let fired = Arc::new(AtomicUsize::new(0));

    let registrar = {
        let reactor = reactor.clone();
        let fired = fired.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            let fired_in_cb = fired.clone();
            let _conn = reactor.timer(
                move |_| {
                    fired_in_cb.fetch_add(1, Ordering::Relaxed);
                    None
                },
                Instant::now(),
            );
        })
    };

    // a due timer registered from another thread must interrupt the wait
    let start = Instant::now();
    while fired.load(Ordering::Relaxed) == 0 {
        reactor.dispatch(Some(Duration::from_secs(60)), usize::MAX).unwrap();
    }
    assert!(
        start.elapsed() < Duration::from_secs(30),
        "dispatch slept through the wake-up"
    );
    registrar.join().unwrap();
}
