#![cfg(unix)]

use std::sync::Arc;
use std::thread;
use wasi_hostfd::{Descriptor, DescriptorTable, Error, Pollable, Resource, Rights};

fn observer(tag: i32) -> Descriptor {
    Descriptor::new(Resource::FileObserver(Pollable(tag)), Rights::file_base())
}

fn tag(table: &DescriptorTable, fd: u32) -> i32 {
    let guard = table.resolve(fd).unwrap();
    match guard.resource() {
        Resource::FileObserver(p) => p.0,
        other => panic!("unexpected resource {other:?}"),
    }
}

#[test]
fn open_resolve_close() {
    let table = DescriptorTable::new();
    let fd = table.open(observer(7)).unwrap();
    assert_eq!(tag(&table, fd), 7);
    table.close(fd).unwrap();
    assert_eq!(table.resolve(fd).err(), Some(Error::Badf));
}

#[test]
fn closed_slot_reused_without_resurrection() {
    let table = DescriptorTable::new();
    let a = table.open(observer(1)).unwrap();
    let b = table.open(observer(2)).unwrap();
    table.close(a).unwrap();
    let c = table.open(observer(3)).unwrap();
    assert_eq!(a, c);
    // The reused slot holds the new descriptor, not a revived old one.
    assert_eq!(tag(&table, c), 3);
    assert_eq!(tag(&table, b), 2);
}

#[test]
fn renumber_self_requires_liveness() {
    let table = DescriptorTable::new();
    let fd = table.open(observer(1)).unwrap();
    assert!(table.renumber(fd, fd).is_ok());
    table.close(fd).unwrap();
    assert_eq!(table.renumber(fd, fd).err(), Some(Error::Badf));
    assert_eq!(table.renumber(99, 99).err(), Some(Error::Badf));
}

#[test]
fn renumber_displaces_target() {
    let table = DescriptorTable::new();
    let a = table.open(observer(10)).unwrap();
    let b = table.open(observer(20)).unwrap();
    table.renumber(a, b).unwrap();
    assert_eq!(table.resolve(a).err(), Some(Error::Badf));
    assert_eq!(tag(&table, b), 10);
}

#[test]
fn renumber_to_far_fd_and_back() {
    let table = DescriptorTable::new();
    let a = table.open(observer(10)).unwrap();
    table.renumber(a, 1000).unwrap();
    assert_eq!(tag(&table, 1000), 10);
    table.renumber(1000, 0).unwrap();
    assert_eq!(tag(&table, 0), 10);
    assert_eq!(table.resolve(1000).err(), Some(Error::Badf));
}

#[test]
fn rights_only_shrink() {
    let table = DescriptorTable::new();
    let fd = table.open(observer(1)).unwrap();
    {
        let mut guard = table.resolve(fd).unwrap();
        guard.expect_rights(Rights::FD_READ).unwrap();
        guard.limit_rights(Rights::FD_READ).unwrap();
    }
    {
        let mut guard = table.resolve(fd).unwrap();
        assert_eq!(guard.rights(), Rights::FD_READ);
        // Growing back is refused.
        assert_eq!(
            guard.limit_rights(Rights::FD_READ | Rights::FD_WRITE).err(),
            Some(Error::Notcapable)
        );
        assert_eq!(
            guard.expect_rights(Rights::FD_WRITE).err(),
            Some(Error::Notcapable)
        );
    }
}

#[test]
fn concurrent_open_close_storm() {
    let table = Arc::new(DescriptorTable::new());
    let mut handles = Vec::new();
    for t in 0..4 {
        let table = Arc::clone(&table);
        handles.push(thread::spawn(move || {
            for i in 0..300 {
                let fd = table.open(observer(t * 1_000 + i)).unwrap();
                {
                    let guard = table.resolve(fd).unwrap();
                    assert!(!guard.resource().is_null());
                }
                table.close(fd).unwrap();
                assert_eq!(table.resolve(fd).err(), Some(Error::Badf));
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
    // Every thread closed everything it opened: at most 4 descriptors were
    // ever live at once, so reuse stays within that dense range.
    assert!(table.open(observer(0)).unwrap() < 4);
}

#[test]
fn concurrent_renumber_storm() {
    let table = Arc::new(DescriptorTable::new());
    // Each thread owns a disjoint pair of far fds it shuttles a descriptor
    // between while other threads churn the dense region.
    let mut handles = Vec::new();
    for t in 0u32..4 {
        let table = Arc::clone(&table);
        handles.push(thread::spawn(move || {
            let base = 10_000 + t * 10;
            let fd = table.open(observer(t as i32)).unwrap();
            table.renumber(fd, base).unwrap();
            for _ in 0..200 {
                table.renumber(base, base + 1).unwrap();
                assert_eq!(table.resolve(base).err(), Some(Error::Badf));
                table.renumber(base + 1, base).unwrap();
            }
            table.close(base).unwrap();
        }));
    }
    for t in 0..2 {
        let table = Arc::clone(&table);
        handles.push(thread::spawn(move || {
            for i in 0..300 {
                let fd = table.open(observer(t * 100 + i)).unwrap();
                table.close(fd).unwrap();
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
}

#[test]
fn resolve_holds_off_close() {
    // A descriptor resolved on one thread cannot be drained by a close on
    // another until the guard drops; the close still completes afterwards.
    let table = Arc::new(DescriptorTable::new());
    let fd = table.open(observer(5)).unwrap();
    let guard = table.resolve(fd).unwrap();
    let closer = {
        let table = Arc::clone(&table);
        thread::spawn(move || table.close(fd))
    };
    thread::sleep(std::time::Duration::from_millis(50));
    assert!(!guard.resource().is_null());
    drop(guard);
    closer.join().unwrap().unwrap();
    assert_eq!(table.resolve(fd).err(), Some(Error::Badf));
}
