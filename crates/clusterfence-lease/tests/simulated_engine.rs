//! End-to-end exercise of [`clusterfence_lease::SimulatedLeaseEngine`]
//! across two simulated hosts sharing one lockspace, standing in for a
//! fencing host and a target talking through shared lease storage.

use clusterfence_lease::{
    bits, EventRecord, HostStatus, LeaseEngine, SetEventFlags, SimulatedLeaseEngine,
    SimulatedStorage,
};

#[test]
fn fencing_host_posts_reset_and_target_observes_it() {
    let storage = SimulatedStorage::new();
    storage.renew("ls", 2, 1_000, 10);

    let mut fencer = SimulatedLeaseEngine::new(storage.clone(), 1);
    let mut target = SimulatedLeaseEngine::new(storage.clone(), 2);

    let target_channel = target.reg_event("ls").unwrap();
    assert!(target.get_event(target_channel).unwrap().is_none());

    fencer
        .set_event(
            "ls",
            &EventRecord {
                event: bits::RESET,
                target_host_id: 2,
                from_host_id: 1,
                ..Default::default()
            },
            SetEventFlags::default(),
        )
        .unwrap();

    let delivered = target.get_event(target_channel).unwrap().unwrap();
    assert!(delivered.has(bits::RESET));
    assert_eq!(delivered.from_host_id, 1);

    // Target acknowledges by replying with RESETTING addressed back at the fencer.
    let fencer_channel = fencer.reg_event("ls").unwrap();
    target
        .set_event(
            "ls",
            &EventRecord {
                event: bits::RESETTING,
                target_host_id: 1,
                from_host_id: 2,
                ..Default::default()
            },
            SetEventFlags::default(),
        )
        .unwrap();
    let ack = fencer.get_event(fencer_channel).unwrap().unwrap();
    assert!(ack.has(bits::RESETTING));

    target.end_event(target_channel, "ls").unwrap();
    fencer.end_event(fencer_channel, "ls").unwrap();
}

#[test]
fn get_hosts_surfaces_derived_status_transitions() {
    let storage = SimulatedStorage::new();
    storage.renew("ls", 3, 500, 10);
    let mut watcher = SimulatedLeaseEngine::new(storage.clone(), 1);

    let before = watcher.get_hosts("ls", 3).unwrap();
    assert_eq!(before[0].status, HostStatus::Live);

    storage.set_status("ls", 3, HostStatus::Dead);
    let after = watcher.get_hosts("ls", 3).unwrap();
    assert_eq!(after[0].status, HostStatus::Dead);
    assert_eq!(after[0].timestamp, 500);
}

#[test]
fn unregistered_host_has_no_lease_state() {
    let storage = SimulatedStorage::new();
    let mut watcher = SimulatedLeaseEngine::new(storage, 1);
    assert!(watcher.get_hosts("nonexistent-lockspace", 7).unwrap().is_empty());
}
