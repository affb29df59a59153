//! Redirect table manager lifecycle tests.
//!
//! Requires root and the compiled redirect program - run with:
//!   sudo -E MVIRT_SOCKMAP_PROGRAM=<path> cargo test --package mvirt-sockmap --test manager_test --features test-util

use mvirt_sockmap::descriptor::socket_cookie;
use mvirt_sockmap::error::SockmapError;
use mvirt_sockmap::test_util::{DEFAULT_TIMEOUT, TcpPair, read_exact_timeout, test_manager_config};
use mvirt_sockmap::{ManagerConfig, RedirectTableManager, SlotIndex};
use std::io::Write;
use std::net::UdpSocket;
use std::os::fd::AsFd;
use std::sync::Arc;

fn new_manager(capacity: u32) -> RedirectTableManager {
    RedirectTableManager::new(&test_manager_config(capacity)).expect("Failed to create manager")
}

#[test]
fn test_new_then_close_leaves_nothing_behind() {
    for capacity in [2, 4, 16, 200] {
        let first = new_manager(capacity);
        first.close().expect("Failed to close manager");
        assert!(first.is_closed());

        // A second manager can be built once the first is gone
        let second = new_manager(capacity);
        assert_eq!(second.capacity().get(), capacity);
        second.close().expect("Failed to close second manager");
    }
}

#[test]
fn test_invalid_capacity_is_rejected() {
    for capacity in [0, 1, 3, 7] {
        let result = RedirectTableManager::new(&test_manager_config(capacity));
        assert!(matches!(result, Err(SockmapError::InvalidCapacity(c)) if c == capacity));
    }
}

#[test]
fn test_missing_program_fails_to_load() {
    let config = ManagerConfig::new("/nonexistent/sockmap-redirect", 2);
    let result = RedirectTableManager::new(&config);
    assert!(matches!(result, Err(SockmapError::Load(_))));
}

#[test]
fn test_register_unregister_register() {
    let manager = new_manager(2);
    let pair = TcpPair::connect().unwrap();
    let index = SlotIndex::new(0);

    manager.register(&pair.server, index).unwrap();
    manager.unregister(index).unwrap();
    manager.register(&pair.server, index).unwrap();

    assert_eq!(
        manager.occupant(index).unwrap(),
        Some(socket_cookie(pair.server.as_fd()).unwrap())
    );
    manager.close().unwrap();
}

#[test]
fn test_register_out_of_range_index() {
    for capacity in [2, 4, 16] {
        let manager = new_manager(capacity);
        let pair = TcpPair::connect().unwrap();

        for index in [capacity, capacity + 1, u32::MAX] {
            let result = manager.register(&pair.server, SlotIndex::new(index));
            assert!(
                matches!(result, Err(SockmapError::InvalidIndex { index: i, capacity: c }) if i == index && c == capacity),
                "index {index} with capacity {capacity} should be rejected"
            );
        }
        assert!(matches!(
            manager.unregister(SlotIndex::new(capacity)),
            Err(SockmapError::InvalidIndex { .. })
        ));
        manager.close().unwrap();
    }
}

#[test]
fn test_register_rejects_non_stream_sockets() {
    let manager = new_manager(2);

    let file = std::fs::File::open("/dev/null").unwrap();
    assert!(matches!(
        manager.register(&file, SlotIndex::new(0)),
        Err(SockmapError::InvalidDescriptor { .. })
    ));

    let udp = UdpSocket::bind("127.0.0.1:0").unwrap();
    assert!(matches!(
        manager.register(&udp, SlotIndex::new(0)),
        Err(SockmapError::InvalidDescriptor { .. })
    ));

    assert_eq!(manager.occupant(SlotIndex::new(0)).unwrap(), None);
    manager.close().unwrap();
}

#[test]
fn test_unregister_empty_slot_is_idempotent() {
    let manager = new_manager(4);
    manager.unregister(SlotIndex::new(3)).unwrap();
    manager.unregister(SlotIndex::new(3)).unwrap();
    manager.close().unwrap();
}

#[test]
fn test_same_socket_cannot_occupy_two_slots() {
    let manager = new_manager(4);
    let pair = TcpPair::connect().unwrap();

    manager.register(&pair.server, SlotIndex::new(0)).unwrap();
    assert!(matches!(
        manager.register(&pair.server, SlotIndex::new(2)),
        Err(SockmapError::InvalidDescriptor { .. })
    ));
    manager.close().unwrap();
}

#[test]
fn test_overwrite_evicts_without_closing() {
    let manager = new_manager(2);
    let mut old = TcpPair::connect().unwrap();
    let new = TcpPair::connect().unwrap();
    let index = SlotIndex::new(0);

    manager.register(&old.server, index).unwrap();
    manager.register(&new.server, index).unwrap();

    assert_eq!(
        manager.occupant(index).unwrap(),
        Some(socket_cookie(new.server.as_fd()).unwrap())
    );
    assert_eq!(manager.index_of(&old.server).unwrap(), None);
    assert_eq!(manager.index_of(&new.server).unwrap(), Some(index));

    // The evicted socket is still open and usable
    old.server.write_all(b"still open").unwrap();
    let data = read_exact_timeout(&mut old.client, 10, DEFAULT_TIMEOUT).unwrap();
    assert_eq!(data, b"still open");

    manager.close().unwrap();
}

#[test]
fn test_overwrite_when_table_full() {
    let manager = new_manager(2);
    let a = TcpPair::connect().unwrap();
    let b = TcpPair::connect().unwrap();
    let c = TcpPair::connect().unwrap();

    manager.register(&a.server, SlotIndex::new(0)).unwrap();
    manager.register(&b.server, SlotIndex::new(1)).unwrap();
    manager.register(&c.server, SlotIndex::new(0)).unwrap();

    assert_eq!(manager.index_of(&a.server).unwrap(), None);
    assert_eq!(manager.index_of(&b.server).unwrap(), Some(SlotIndex::new(1)));
    assert_eq!(manager.index_of(&c.server).unwrap(), Some(SlotIndex::new(0)));

    manager.close().unwrap();
}

#[test]
fn test_operations_after_close() {
    let manager = new_manager(2);
    let pair = TcpPair::connect().unwrap();
    manager.close().unwrap();

    assert!(matches!(
        manager.register(&pair.server, SlotIndex::new(0)),
        Err(SockmapError::InvalidState)
    ));
    assert!(matches!(
        manager.unregister(SlotIndex::new(0)),
        Err(SockmapError::InvalidState)
    ));
    assert!(matches!(
        manager.occupant(SlotIndex::new(0)),
        Err(SockmapError::InvalidState)
    ));
    assert!(matches!(manager.close(), Err(SockmapError::AlreadyClosed)));
}

#[test]
fn test_close_leaves_registered_sockets_open() {
    let manager = new_manager(2);
    let mut pair = TcpPair::connect().unwrap();
    manager.register(&pair.server, SlotIndex::new(0)).unwrap();
    manager.close().unwrap();

    pair.server.write_all(b"ping").unwrap();
    let data = read_exact_timeout(&mut pair.client, 4, DEFAULT_TIMEOUT).unwrap();
    assert_eq!(data, b"ping");
}

#[test]
fn test_drop_without_close_releases_state() {
    {
        let manager = new_manager(2);
        let pair = TcpPair::connect().unwrap();
        manager.register(&pair.server, SlotIndex::new(0)).unwrap();
    }
    let manager = new_manager(2);
    manager.close().unwrap();
}

#[test]
fn test_concurrent_registration() {
    let manager = Arc::new(new_manager(200));

    let handles: Vec<_> = (0..100u32)
        .map(|i| {
            let manager = Arc::clone(&manager);
            std::thread::spawn(move || {
                let pair = TcpPair::connect().unwrap();
                let index = SlotIndex::new(i * 2);
                manager.register(&pair.server, index).unwrap();
                (index, pair)
            })
        })
        .collect();

    let registered: Vec<(SlotIndex, TcpPair)> =
        handles.into_iter().map(|h| h.join().unwrap()).collect();

    for (index, pair) in &registered {
        let cookie = socket_cookie(pair.server.as_fd()).unwrap();
        assert_eq!(manager.occupant(*index).unwrap(), Some(cookie));
        assert_eq!(manager.index_of(&pair.server).unwrap(), Some(*index));
    }

    for (index, _) in &registered {
        manager.unregister(*index).unwrap();
    }
    manager.close().unwrap();
}
