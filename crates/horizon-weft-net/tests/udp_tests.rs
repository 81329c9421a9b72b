//! Tests for the UDP network manager.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;

use horizon_weft_net::udp::{
    Handle, ManagerConfig, SimControl, SimDriver, SocketState, UdpManager,
};
use horizon_weft_net::NetError;

fn loopback() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

fn addr(port: u16) -> SocketAddr {
    format!("127.0.0.1:{port}").parse().unwrap()
}

/// Poll `cond` for up to two seconds.
fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    cond()
}

fn sim_manager(config: ManagerConfig) -> (Arc<SimControl>, UdpManager) {
    let control = SimControl::new();
    let manager = UdpManager::with_driver(config, SimDriver::factory(Arc::clone(&control)))
        .expect("manager should start");
    (control, manager)
}

#[test]
fn test_listen_connect_send_receive() {
    let manager = UdpManager::new(ManagerConfig::new(4)).unwrap();

    let received: Arc<Mutex<Vec<(SocketAddr, Bytes)>>> = Arc::new(Mutex::new(Vec::new()));
    let received_clone = received.clone();
    let listener = manager
        .listen_udp(loopback(), move |handle, result| {
            received_clone.lock().push((handle.peer(), result.unwrap()));
        })
        .unwrap();
    assert_eq!(listener.bound_children(), 4);
    assert_ne!(listener.local_addr().port(), 0);

    // Connect a client through the same manager and send one datagram.
    let connected: Arc<Mutex<Option<Handle>>> = Arc::new(Mutex::new(None));
    let connected_clone = connected.clone();
    manager.connect_udp(loopback(), listener.local_addr(), None, move |result| {
        *connected_clone.lock() = Some(result.unwrap());
    });
    assert!(wait_for(|| connected.lock().is_some()));
    let handle = connected.lock().take().unwrap();
    let client_addr = handle.local();

    let sent = Arc::new(AtomicBool::new(false));
    let sent_clone = sent.clone();
    handle.send(&b"X"[..], move |_, result| {
        result.unwrap();
        sent_clone.store(true, Ordering::SeqCst);
    });

    assert!(wait_for(|| {
        sent.load(Ordering::SeqCst) && !received.lock().is_empty()
    }));
    {
        let received = received.lock();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].0, client_addr);
        assert_eq!(&received[0].1[..], b"X");
    }

    let snap = manager.stats();
    assert!(snap.sockets_opened >= 5);
    assert_eq!(snap.datagrams_received, 1);
    assert!(snap.sends_completed >= 1);

    listener.stop();
    assert!(!listener.is_active());
    assert_eq!(listener.state(), SocketState::Closed);

    drop(handle);
    manager.shutdown();
}

#[test]
fn test_echo_exchange() {
    const REQUESTS: usize = 20;

    let manager = UdpManager::new(ManagerConfig::new(2)).unwrap();

    // Server: echo every datagram back on the handle it arrived with.
    let server_reads = Arc::new(AtomicUsize::new(0));
    let server_reads_clone = server_reads.clone();
    let listener = manager
        .listen_udp(loopback(), move |handle, result| {
            if let Ok(payload) = result {
                server_reads_clone.fetch_add(1, Ordering::SeqCst);
                handle.send(payload, |_, _| {});
            }
        })
        .unwrap();

    let connected: Arc<Mutex<Option<Handle>>> = Arc::new(Mutex::new(None));
    let connected_clone = connected.clone();
    manager.connect_udp(loopback(), listener.local_addr(), None, move |result| {
        *connected_clone.lock() = Some(result.unwrap());
    });
    assert!(wait_for(|| connected.lock().is_some()));
    let handle = connected.lock().take().unwrap();

    let replies: Arc<Mutex<Vec<Bytes>>> = Arc::new(Mutex::new(Vec::new()));
    let replies_clone = replies.clone();
    handle
        .start_read(move |_, result| {
            if let Ok(payload) = result {
                replies_clone.lock().push(payload);
            }
        })
        .unwrap();

    for i in 0..REQUESTS {
        handle.send(format!("req-{i}"), |_, _| {});
    }

    assert!(wait_for(|| replies.lock().len() >= REQUESTS));
    assert_eq!(server_reads.load(Ordering::SeqCst), REQUESTS);

    let mut seen: Vec<String> = replies
        .lock()
        .iter()
        .map(|b| String::from_utf8(b.to_vec()).unwrap())
        .collect();
    seen.sort();
    let mut expected: Vec<String> = (0..REQUESTS).map(|i| format!("req-{i}")).collect();
    expected.sort();
    assert_eq!(seen, expected);

    handle.cancel_read().unwrap();
    drop(handle);
    listener.stop();
    manager.shutdown();
}

#[test]
fn test_no_receive_callback_after_stop_returns() {
    const BLAST: usize = 200;

    let manager = UdpManager::new(ManagerConfig::new(2)).unwrap();
    let received = Arc::new(AtomicUsize::new(0));
    let received_clone = received.clone();
    let listener = manager
        .listen_udp(loopback(), move |_, _| {
            received_clone.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    let server = listener.local_addr();

    // Blast datagrams from a plain socket while the listener goes down.
    let blaster = thread::spawn(move || {
        let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        for i in 0..BLAST {
            let _ = socket.send_to(format!("{i}").as_bytes(), server);
            thread::sleep(Duration::from_millis(1));
        }
    });

    assert!(wait_for(|| received.load(Ordering::SeqCst) >= 20));
    listener.stop();
    let at_stop = received.load(Ordering::SeqCst);
    assert!(at_stop > 0);
    assert!(at_stop < BLAST);

    // Once stop has returned no further receive callback may fire.
    thread::sleep(Duration::from_millis(100));
    assert_eq!(received.load(Ordering::SeqCst), at_stop);

    blaster.join().unwrap();
    manager.shutdown();
}

#[test]
fn test_send_completions_settle_before_stop_returns() {
    const BURST: usize = 400;

    let (control, manager) = sim_manager(ManagerConfig::new(1));
    let listener = manager.listen_udp(addr(8611), |_, _| {}).unwrap();
    let handle = listener.handle(addr(9611));

    // Queue a burst from outside the pool, then stop while much of it is
    // still working through the worker.
    let results: Arc<Mutex<Vec<horizon_weft_net::Result<()>>>> =
        Arc::new(Mutex::new(Vec::new()));
    for _ in 0..BURST {
        let sink = results.clone();
        handle.send(&b"out"[..], move |_, result| {
            sink.lock().push(result);
        });
    }
    listener.stop();

    // Every queued send has settled by the time stop returns, canceled
    // where the driver never finished it, and none fires afterwards.
    let at_stop = results.lock().len();
    assert_eq!(at_stop, BURST);
    thread::sleep(Duration::from_millis(100));
    assert_eq!(results.lock().len(), BURST);
    for result in results.lock().iter() {
        assert!(matches!(result, Ok(()) | Err(NetError::Canceled)));
    }

    let snap = manager.stats();
    assert_eq!(snap.sends_completed + snap.send_failures, BURST as u64);
    // Completed sends match datagrams actually transmitted; canceled ones
    // never hit the wire.
    assert_eq!(control.sends().len() as u64, snap.sends_completed);
    manager.shutdown();
}

#[test]
fn test_listener_survives_partial_bind_failure() {
    let (control, manager) = sim_manager(ManagerConfig::new(3));
    control.fail_bind_on(1);

    let hits = Arc::new(AtomicUsize::new(0));
    let hits_clone = hits.clone();
    let listener = manager
        .listen_udp(addr(8601), move |_, _| {
            hits_clone.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

    // The startup barrier means the counts are final as soon as listen
    // returns.
    assert_eq!(listener.bound_children(), 2);
    let snap = manager.stats();
    assert_eq!(snap.bind_failures, 1);
    assert_eq!(snap.sockets_opened, 2);

    // Both surviving children receive.
    control.inject_nth(addr(8601), 0, Some(addr(9001)), Bytes::from_static(b"a"));
    control.inject_nth(addr(8601), 1, Some(addr(9001)), Bytes::from_static(b"b"));
    assert!(wait_for(|| hits.load(Ordering::SeqCst) == 2));

    listener.stop();
    assert_eq!(listener.state(), SocketState::Closed);
    manager.shutdown();
}

#[test]
fn test_listen_fails_when_no_child_binds() {
    let (control, manager) = sim_manager(ManagerConfig::new(3));
    for worker in 0..3 {
        control.fail_bind_on(worker);
    }

    assert!(matches!(
        manager.listen_udp(addr(8602), |_, _| {}),
        Err(NetError::AllBindsFailed)
    ));
    assert_eq!(manager.stats().bind_failures, 3);
    manager.shutdown();
}

#[test]
fn test_recv_start_failure_is_absorbed() {
    let (control, manager) = sim_manager(ManagerConfig::new(2));
    control.fail_recv_start_on(0);

    let listener = manager.listen_udp(addr(8603), |_, _| {}).unwrap();
    assert_eq!(listener.bound_children(), 1);

    let snap = manager.stats();
    assert_eq!(snap.recv_start_failures, 1);
    assert_eq!(snap.sockets_opened, 1);

    listener.stop();
    manager.shutdown();
}

#[test]
fn test_oversize_send_vanishes_without_callback() {
    let (control, manager) = sim_manager(ManagerConfig::new(2).max_datagram_size(32));
    let listener = manager.listen_udp(addr(8604), |_, _| {}).unwrap();

    let fired = Arc::new(AtomicBool::new(false));
    let fired_clone = fired.clone();
    let handle = listener.handle(addr(9604));
    handle.send(vec![0u8; 33], move |_, _| {
        fired_clone.store(true, Ordering::SeqCst);
    });

    thread::sleep(Duration::from_millis(100));
    assert!(!fired.load(Ordering::SeqCst));
    assert_eq!(manager.stats().sends_dropped, 1);
    assert!(control.sends().is_empty());

    // A datagram at the limit still goes out normally.
    let completed = Arc::new(AtomicBool::new(false));
    let completed_clone = completed.clone();
    handle.send(vec![0u8; 32], move |_, result| {
        result.unwrap();
        completed_clone.store(true, Ordering::SeqCst);
    });
    assert!(wait_for(|| completed.load(Ordering::SeqCst)));
    let sends = control.sends();
    assert_eq!(sends.len(), 1);
    assert_eq!(sends[0].to, addr(9604));

    listener.stop();
    manager.shutdown();
}

#[test]
fn test_recv_drop_rules_through_manager() {
    let (control, manager) = sim_manager(ManagerConfig::new(1).max_datagram_size(16));
    let hits = Arc::new(AtomicUsize::new(0));
    let hits_clone = hits.clone();
    let listener = manager
        .listen_udp(addr(8605), move |_, _| {
            hits_clone.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

    control.inject(addr(8605), None, Bytes::from_static(b"sourceless"));
    control.inject(addr(8605), Some(addr(9605)), Bytes::from(vec![0u8; 17]));
    control.inject(addr(8605), Some(addr(9605)), Bytes::from_static(b"ok"));

    assert!(wait_for(|| hits.load(Ordering::SeqCst) == 1));
    assert!(wait_for(|| {
        let snap = manager.stats();
        snap.datagrams_dropped == 2 && snap.datagrams_received == 1
    }));

    listener.stop();
    manager.shutdown();
}

#[test]
fn test_cancel_read_completes_with_canceled() {
    let (control, manager) = sim_manager(ManagerConfig::new(2));

    let connected: Arc<Mutex<Option<Handle>>> = Arc::new(Mutex::new(None));
    let connected_clone = connected.clone();
    manager.connect_udp(loopback(), addr(9606), None, move |result| {
        *connected_clone.lock() = Some(result.unwrap());
    });
    assert!(wait_for(|| connected.lock().is_some()));
    let handle = connected.lock().take().unwrap();

    let canceled = Arc::new(AtomicBool::new(false));
    let canceled_clone = canceled.clone();
    handle
        .start_read(move |_, result| {
            if matches!(result, Err(NetError::Canceled)) {
                canceled_clone.store(true, Ordering::SeqCst);
            }
        })
        .unwrap();
    // A second read on the same socket is refused while one is armed.
    assert!(matches!(
        handle.start_read(|_, _| {}),
        Err(NetError::ReadInProgress)
    ));

    handle.cancel_read().unwrap();
    assert!(wait_for(|| canceled.load(Ordering::SeqCst)));

    drop(handle);
    assert!(wait_for(|| control.open_sockets() == 0));
    manager.shutdown();
}

#[test]
fn test_read_timeout_then_recovery() {
    let (control, manager) = sim_manager(ManagerConfig::new(2));

    let connected: Arc<Mutex<Option<Handle>>> = Arc::new(Mutex::new(None));
    let connected_clone = connected.clone();
    manager.connect_udp(
        loopback(),
        addr(9607),
        Some(Duration::from_millis(40)),
        move |result| {
            *connected_clone.lock() = Some(result.unwrap());
        },
    );
    assert!(wait_for(|| connected.lock().is_some()));
    let handle = connected.lock().take().unwrap();

    let results: Arc<Mutex<Vec<horizon_weft_net::Result<Bytes>>>> =
        Arc::new(Mutex::new(Vec::new()));
    let sink = results.clone();
    handle
        .start_read(move |_, result| sink.lock().push(result))
        .unwrap();

    // Nothing arrives, so the read times out.
    assert!(wait_for(|| !results.lock().is_empty()));
    assert!(matches!(
        results.lock().as_slice(),
        [Err(NetError::TimedOut)]
    ));

    // The socket is still usable: arm a new read and deliver to it.
    let sink = results.clone();
    handle
        .start_read(move |_, result| sink.lock().push(result))
        .unwrap();
    control.inject(handle.local(), Some(addr(9607)), Bytes::from_static(b"late"));
    assert!(wait_for(|| results.lock().len() >= 2));
    assert!(matches!(
        results.lock().get(1),
        Some(Ok(payload)) if &payload[..] == b"late"
    ));

    drop(handle);
    manager.shutdown();
}

#[test]
fn test_send_to_stopped_listener_is_canceled() {
    let (_control, manager) = sim_manager(ManagerConfig::new(2));
    let listener = manager.listen_udp(addr(8608), |_, _| {}).unwrap();
    let handle = listener.handle(addr(9608));
    listener.stop();

    let canceled = Arc::new(AtomicBool::new(false));
    let canceled_clone = canceled.clone();
    handle.send(&b"late"[..], move |_, result| {
        if matches!(result, Err(NetError::Canceled)) {
            canceled_clone.store(true, Ordering::SeqCst);
        }
    });
    assert!(wait_for(|| canceled.load(Ordering::SeqCst)));
    assert!(manager.stats().send_failures >= 1);

    manager.shutdown();
}

#[test]
fn test_stop_is_idempotent_and_safe_concurrently() {
    let manager = UdpManager::new(ManagerConfig::new(4)).unwrap();
    let listener = Arc::new(manager.listen_udp(loopback(), |_, _| {}).unwrap());

    thread::scope(|scope| {
        for _ in 0..2 {
            let listener = Arc::clone(&listener);
            scope.spawn(move || listener.stop());
        }
    });
    assert_eq!(listener.state(), SocketState::Closed);

    // Stopping an already-stopped listener is a no-op.
    listener.stop();
    manager.shutdown();
}

#[test]
fn test_shutdown_closes_outstanding_sockets() {
    let (control, manager) = sim_manager(ManagerConfig::new(2));

    let listener = manager.listen_udp(addr(8609), |_, _| {}).unwrap();

    let connected: Arc<Mutex<Option<Handle>>> = Arc::new(Mutex::new(None));
    let connected_clone = connected.clone();
    manager.connect_udp(loopback(), addr(9609), None, move |result| {
        *connected_clone.lock() = Some(result.unwrap());
    });
    assert!(wait_for(|| connected.lock().is_some()));
    let handle = connected.lock().take().unwrap();

    let read_ended = Arc::new(AtomicBool::new(false));
    let read_ended_clone = read_ended.clone();
    handle
        .start_read(move |_, result| {
            if result.is_err() {
                read_ended_clone.store(true, Ordering::SeqCst);
            }
        })
        .unwrap();

    manager.shutdown();

    assert!(read_ended.load(Ordering::SeqCst));
    assert!(!handle.is_active());
    assert_eq!(listener.state(), SocketState::Closed);
    assert_eq!(control.open_sockets(), 0);
}

#[test]
fn test_send_after_shutdown_completes_in_place() {
    let (_control, manager) = sim_manager(ManagerConfig::new(2));
    let listener = manager.listen_udp(addr(8612), |_, _| {}).unwrap();
    let handle = listener.handle(addr(9612));
    manager.shutdown();

    // The workers are gone, so the completion runs on the calling thread
    // before send returns.
    let result: Arc<Mutex<Option<horizon_weft_net::Result<()>>>> = Arc::new(Mutex::new(None));
    let sink = result.clone();
    handle.send(&b"late"[..], move |_, result| {
        *sink.lock() = Some(result);
    });
    assert!(matches!(
        result.lock().as_ref(),
        Some(Err(NetError::Shutdown))
    ));
    assert!(manager.stats().send_failures >= 1);
}

#[test]
fn test_stats_snapshot_reflects_activity() {
    let (control, manager) = sim_manager(ManagerConfig::new(2).max_datagram_size(64));
    let listener = manager.listen_udp(addr(8610), |_, _| {}).unwrap();

    control.inject(addr(8610), Some(addr(9610)), Bytes::from_static(b"one"));
    control.inject(addr(8610), None, Bytes::from_static(b"dropped"));

    let handle = listener.handle(addr(9610));
    let sent = Arc::new(AtomicUsize::new(0));
    for _ in 0..2 {
        let sent = sent.clone();
        handle.send(&b"out"[..], move |_, result| {
            result.unwrap();
            sent.fetch_add(1, Ordering::SeqCst);
        });
    }
    handle.send(vec![0u8; 65], |_, _| {});

    assert!(wait_for(|| sent.load(Ordering::SeqCst) == 2));
    assert!(wait_for(|| {
        let snap = manager.stats();
        snap.datagrams_received == 1
            && snap.datagrams_dropped == 1
            && snap.sends_completed == 2
            && snap.sends_dropped == 1
    }));
    assert_eq!(manager.stats().sockets_opened, 2);

    listener.stop();
    manager.shutdown();
}
