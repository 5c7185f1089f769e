// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0
#![cfg(unix)]

mod common;

use common::unique_identifier;
use shmbus::{InstanceRegistry, SharedInstance};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

#[test]
fn first_attached_instance_fixes_the_capacity() {
    let identifier = unique_identifier("capacity");
    let a = SharedInstance::new(&identifier, 16).unwrap();
    let b = SharedInstance::new(&identifier, 9999).unwrap();
    assert_eq!(a.capacity(), 16);
    assert_eq!(b.capacity(), 16);
}

#[test]
fn concurrent_instances_get_distinct_increasing_ids() {
    let identifier = unique_identifier("ids");
    let a = SharedInstance::new(&identifier, 8).unwrap();
    let b = SharedInstance::new(&identifier, 8).unwrap();
    let c = SharedInstance::new(&identifier, 8).unwrap();
    assert!(a.id() < b.id() && b.id() < c.id());
    let mut live = a.live_instances().unwrap();
    live.sort_unstable();
    assert_eq!(live, vec![a.id(), b.id(), c.id()]);
}

#[test]
fn write_is_visible_through_every_instance_zero_padded() {
    let identifier = unique_identifier("visibility");
    let a = SharedInstance::new(&identifier, 16).unwrap();
    let b = SharedInstance::new(&identifier, 16).unwrap();
    a.write(&[1, 2, 3, 4]).unwrap();
    let mut expected = vec![0u8; 16];
    expected[..4].copy_from_slice(&[1, 2, 3, 4]);
    assert_eq!(b.read().unwrap(), expected);
}

#[test]
fn disposed_instance_leaves_the_table_and_reads_as_dead() {
    let identifier = unique_identifier("dispose");
    let a = SharedInstance::new(&identifier, 8).unwrap();
    let b = SharedInstance::new(&identifier, 8).unwrap();
    let a_id = a.id();

    assert!(SharedInstance::is_instance_alive(&identifier, a_id).unwrap());
    a.dispose().unwrap();

    assert!(!SharedInstance::is_instance_alive(&identifier, a_id).unwrap());
    assert!(!b.live_instances().unwrap().contains(&a_id));
}

#[test]
fn dispose_is_idempotent() {
    let identifier = unique_identifier("idempotent");
    let a = SharedInstance::new(&identifier, 8).unwrap();
    a.dispose().unwrap();
    a.dispose().unwrap();
}

#[test]
fn disposing_callback_fires_exactly_once() {
    let identifier = unique_identifier("disposing");
    let calls = Arc::new(AtomicU32::new(0));
    let instance = SharedInstance::builder(&identifier, 8)
        .on_disposing({
            let calls = calls.clone();
            move || {
                calls.fetch_add(1, Ordering::SeqCst);
            }
        })
        .build()
        .unwrap();
    instance.dispose().unwrap();
    instance.dispose().unwrap();
    drop(instance);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn dispose_releases_the_id_even_beside_a_dead_entry() {
    let identifier = unique_identifier("detach");
    let a = SharedInstance::new(&identifier, 8).unwrap();
    let registry = InstanceRegistry::open(&identifier).unwrap();
    // An unclaimed table entry makes the departure broadcast take the
    // eviction path; the own id must still leave the table afterwards.
    registry.attach(8).unwrap();

    a.dispose().unwrap();
    assert_eq!(registry.list_live().unwrap(), Vec::<i32>::new());
}

#[test]
fn drop_disposes_implicitly() {
    let identifier = unique_identifier("drop");
    let a = SharedInstance::new(&identifier, 8).unwrap();
    let b = SharedInstance::new(&identifier, 8).unwrap();
    let a_id = a.id();
    drop(a);
    assert!(!SharedInstance::is_instance_alive(&identifier, a_id).unwrap());
    assert!(!b.live_instances().unwrap().contains(&a_id));
}

#[test]
fn locked_block_is_indivisible_against_foreign_writes() {
    let identifier = unique_identifier("atomic");
    let a = SharedInstance::new(&identifier, 8).unwrap();
    let b = SharedInstance::new(&identifier, 8).unwrap();
    a.write(&[1]).unwrap();

    let (start_tx, start_rx) = mpsc::channel();
    let writer = std::thread::spawn(move || {
        start_rx.recv().unwrap();
        // Starts while the block below holds the bulk lock, so it must not
        // land mid-block even though it would otherwise finish first.
        b.write(&[9]).unwrap();
        b
    });

    let (before, after) = a
        .lock_read_write(|| {
            let before = a.read()?;
            start_tx.send(()).unwrap();
            std::thread::sleep(Duration::from_millis(200));
            let after = a.read()?;
            Ok((before, after))
        })
        .unwrap();
    assert_eq!(before, after);
    assert_eq!(before[0], 1);

    let b = writer.join().unwrap();
    assert_eq!(b.read().unwrap()[0], 9);
    assert_eq!(a.read().unwrap()[0], 9);
}

#[test]
fn end_to_end_scenario() {
    let identifier = unique_identifier("e2e");

    let (removed_tx, removed_rx) = mpsc::channel();
    let a = SharedInstance::new(&identifier, 16).unwrap();
    assert_eq!(a.id(), 1);
    assert_eq!(a.capacity(), 16);

    let b = SharedInstance::builder(&identifier, 9999)
        .on_instance_removed(move |id| removed_tx.send(id).unwrap())
        .build()
        .unwrap();
    assert_eq!(b.id(), 2);
    assert_eq!(b.capacity(), 16);

    a.write(&[1, 2, 3, 4]).unwrap();
    let mut expected = vec![0u8; 16];
    expected[..4].copy_from_slice(&[1, 2, 3, 4]);
    assert_eq!(b.read().unwrap(), expected);

    let a_id = a.id();
    a.dispose().unwrap();
    assert!(!SharedInstance::is_instance_alive(&identifier, a_id).unwrap());
    assert_eq!(removed_rx.recv_timeout(Duration::from_secs(2)).unwrap(), a_id);
    assert!(removed_rx.recv_timeout(Duration::from_millis(300)).is_err());
}
