mod common;

use common::{harness, read_at, write_at};
use kernel_memory_addresses::PAGE_SIZE;
use kernel_vm::{
    Access, AccessKind, BackingSpec, FaultContext, FaultOutcome, FaultSignal, InodeId, Sharing,
    ThreadId,
};
use std::sync::atomic::Ordering;

const INODE: InodeId = InodeId(7);

#[test]
fn demand_paging_blocks_and_delivers_file_content() {
    let h = harness(256);
    h.store.put_page(INODE, 0, 0x42);
    let space = h.mgr.create_address_space().unwrap();
    let range = h
        .mgr
        .create_region(
            &space,
            BackingSpec::Inode { inode: INODE },
            None,
            2 * PAGE_SIZE,
            Access::READ,
            Sharing::Private,
        )
        .unwrap();

    assert_eq!(read_at(&h, &space, range.page_base(0)), Ok(0x42));
    // the faulting thread blocked exactly once, on the read handle
    assert_eq!(h.threads.blocked.lock().unwrap().len(), 1);

    // a page the file does not provide reads as zeros
    assert_eq!(read_at(&h, &space, range.page_base(1)), Ok(0));
}

#[test]
fn private_file_write_never_reaches_the_store() {
    let h = harness(256);
    h.store.put_page(INODE, 0, 0x42);
    let space = h.mgr.create_address_space().unwrap();
    let range = h
        .mgr
        .create_region(
            &space,
            BackingSpec::Inode { inode: INODE },
            None,
            PAGE_SIZE,
            Access::READ | Access::WRITE,
            Sharing::Private,
        )
        .unwrap();

    write_at(&h, &space, range.page_base(0), 0x99).unwrap();
    assert_eq!(read_at(&h, &space, range.page_base(0)), Ok(0x99));

    h.mgr.sync_range(&space, range).unwrap();
    assert!(h.store.writebacks.lock().unwrap().is_empty());
}

#[test]
fn shared_file_write_is_dirtied_and_written_back() {
    let h = harness(256);
    h.store.put_page(INODE, 1, 0x10);
    let space = h.mgr.create_address_space().unwrap();
    let range = h
        .mgr
        .create_region(
            &space,
            BackingSpec::Inode { inode: INODE },
            None,
            3 * PAGE_SIZE,
            Access::READ | Access::WRITE,
            Sharing::Shared,
        )
        .unwrap();

    // page 1 is written, page 0 only read
    assert_eq!(read_at(&h, &space, range.page_base(0)), Ok(0));
    write_at(&h, &space, range.page_base(1), 0x55).unwrap();

    h.mgr.sync_range(&space, range).unwrap();
    let writebacks = h.store.writebacks.lock().unwrap().clone();
    assert_eq!(writebacks, vec![(INODE, 1, 0x55)]);

    // clean again: a second sync writes nothing
    h.mgr.sync_range(&space, range).unwrap();
    assert_eq!(h.store.writebacks.lock().unwrap().len(), 1);

    // the flush write-protected the page, so the next write re-dirties
    write_at(&h, &space, range.page_base(1), 0x66).unwrap();
    h.mgr.sync_range(&space, range).unwrap();
    let writebacks = h.store.writebacks.lock().unwrap().clone();
    assert_eq!(writebacks.len(), 2);
    assert_eq!(writebacks[1], (INODE, 1, 0x66));
}

#[test]
fn failed_read_becomes_a_bus_error_and_leaks_nothing() {
    let h = harness(256);
    let space = h.mgr.create_address_space().unwrap();
    let range = h
        .mgr
        .create_region(
            &space,
            BackingSpec::Inode { inode: INODE },
            None,
            PAGE_SIZE,
            Access::READ,
            Sharing::Private,
        )
        .unwrap();

    h.store.fail_reads.store(true, Ordering::Relaxed);
    let used_before = h.mgr.frames().used_frames();

    let outcome = h.mgr.dispatch_fault(
        &space,
        ThreadId(3),
        range.page_base(0),
        AccessKind::Read,
        FaultContext::User,
    );
    assert_eq!(outcome, FaultOutcome::Fatal(FaultSignal::BusError));
    assert_eq!(
        h.threads.signals.lock().unwrap().as_slice(),
        &[(ThreadId(3), FaultSignal::BusError)]
    );
    // the frame grabbed for the read went back
    assert_eq!(h.mgr.frames().used_frames(), used_before);

    // the store recovers, so does the page
    h.store.fail_reads.store(false, Ordering::Relaxed);
    h.store.put_page(INODE, 0, 0x77);
    assert_eq!(read_at(&h, &space, range.page_base(0)), Ok(0x77));
}

#[test]
fn shared_mapping_is_coherent_across_spaces() {
    let h = harness(256);
    h.store.put_page(INODE, 0, 0x21);
    let a = h.mgr.create_address_space().unwrap();
    let range = h
        .mgr
        .create_region(
            &a,
            BackingSpec::Inode { inode: INODE },
            None,
            PAGE_SIZE,
            Access::READ | Access::WRITE,
            Sharing::Shared,
        )
        .unwrap();
    let b = h.mgr.fork_address_space(&a).unwrap();

    write_at(&h, &a, range.page_base(0), 0x99).unwrap();
    assert_eq!(read_at(&h, &b, range.page_base(0)), Ok(0x99));
}
