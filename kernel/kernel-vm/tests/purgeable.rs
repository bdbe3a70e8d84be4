mod common;

use common::{Harness, harness, harness_with, read_at, write_at};
use kernel_memory_addresses::{PAGE_SIZE, VirtualRange};
use kernel_vm::{Access, AddressSpace, BackingSpec, ContentState, PurgeConfig, Sharing};

fn purgeable_region(h: &Harness, space: &AddressSpace, pages: u64) -> VirtualRange {
    h.mgr
        .create_region(
            space,
            BackingSpec::Purgeable,
            None,
            pages * PAGE_SIZE,
            Access::READ | Access::WRITE,
            Sharing::Private,
        )
        .unwrap()
}

/// A watermark above the machine size makes every reclaim call fire.
fn pressured(total_frames: u64) -> Harness {
    harness_with(
        total_frames,
        PurgeConfig {
            low_watermark_frames: total_frames + 1,
        },
    )
}

#[test]
fn purged_volatile_range_reports_content_lost() {
    let h = pressured(256);
    let space = h.mgr.create_address_space().unwrap();
    let range = purgeable_region(&h, &space, 4);
    for i in 0..4 {
        write_at(&h, &space, range.page_base(i), 0x50 + i as u8).unwrap();
    }

    let middle = VirtualRange::new(range.page_base(1), 2 * PAGE_SIZE);
    h.mgr.mark_volatile(&space, middle).unwrap();

    let used_before = h.mgr.frames().used_frames();
    assert_eq!(h.mgr.reclaim_if_pressured(), 2);
    assert_eq!(h.mgr.frames().used_frames(), used_before - 2);

    // the purged translations are gone; the pinned neighbors survive
    assert!(space.translate(&h.platform, range.page_base(1)).is_none());
    assert!(space.translate(&h.platform, range.page_base(2)).is_none());
    assert_eq!(read_at(&h, &space, range.page_base(0)), Ok(0x50));
    assert_eq!(read_at(&h, &space, range.page_base(3)), Ok(0x53));

    assert_eq!(
        h.mgr.mark_nonvolatile(&space, middle).unwrap(),
        ContentState::Purged
    );
    // purged pages refault as zeros
    assert_eq!(read_at(&h, &space, range.page_base(1)), Ok(0));
    assert_eq!(read_at(&h, &space, range.page_base(2)), Ok(0));
}

#[test]
fn unreclaimed_volatile_range_keeps_its_content() {
    // default watermark, plenty of free frames: no reclaim happens
    let h = harness(256);
    let space = h.mgr.create_address_space().unwrap();
    let range = purgeable_region(&h, &space, 2);
    write_at(&h, &space, range.page_base(0), 0xEE).unwrap();

    h.mgr.mark_volatile(&space, range).unwrap();
    assert_eq!(h.mgr.reclaim_if_pressured(), 0);

    assert_eq!(
        h.mgr.mark_nonvolatile(&space, range).unwrap(),
        ContentState::Preserved
    );
    assert_eq!(read_at(&h, &space, range.page_base(0)), Ok(0xEE));
}

#[test]
fn nonvolatile_pages_are_never_reclaimed() {
    let h = pressured(256);
    let space = h.mgr.create_address_space().unwrap();
    let range = purgeable_region(&h, &space, 2);
    write_at(&h, &space, range.page_base(0), 0x01).unwrap();
    write_at(&h, &space, range.page_base(1), 0x02).unwrap();

    // nothing volatile: pressure reclaims nothing
    assert_eq!(h.mgr.reclaim_if_pressured(), 0);
    assert_eq!(read_at(&h, &space, range.page_base(0)), Ok(0x01));
    assert_eq!(read_at(&h, &space, range.page_base(1)), Ok(0x02));
}

#[test]
fn refault_after_purge_gets_a_fresh_private_frame() {
    let h = pressured(256);
    let space = h.mgr.create_address_space().unwrap();
    let range = purgeable_region(&h, &space, 1);
    write_at(&h, &space, range.page_base(0), 0x77).unwrap();

    h.mgr.mark_volatile(&space, range).unwrap();
    assert_eq!(h.mgr.reclaim_if_pressured(), 1);

    // a write before re-pinning still works and sees zeros, not stale data
    write_at(&h, &space, range.page_base(0), 0x88).unwrap();
    assert_eq!(read_at(&h, &space, range.page_base(0)), Ok(0x88));
    assert_eq!(read_at(&h, &space, range.page_base(0) + 1), Ok(0));
}

#[test]
fn forked_purgeable_regions_stay_reclaimable() {
    let h = pressured(256);
    let parent = h.mgr.create_address_space().unwrap();
    let range = purgeable_region(&h, &parent, 2);
    for i in 0..2 {
        write_at(&h, &parent, range.page_base(i), 0x11).unwrap();
    }
    let child = h.mgr.fork_address_space(&parent).unwrap();

    // the child's cloned object must be visible to the reclaim walk
    h.mgr.mark_volatile(&child, range).unwrap();
    assert_eq!(h.mgr.reclaim_if_pressured(), 2);
    assert!(child.translate(&h.platform, range.page_base(0)).is_none());
    assert_eq!(
        h.mgr.mark_nonvolatile(&child, range).unwrap(),
        ContentState::Purged
    );
    assert_eq!(read_at(&h, &child, range.page_base(0)), Ok(0));

    // the parent never marked anything volatile and keeps its content
    assert_eq!(read_at(&h, &parent, range.page_base(0)), Ok(0x11));
    assert_eq!(read_at(&h, &parent, range.page_base(1)), Ok(0x11));
}

#[test]
fn marking_a_non_purgeable_region_is_rejected() {
    let h = harness(128);
    let space = h.mgr.create_address_space().unwrap();
    let range = h
        .mgr
        .create_region(
            &space,
            BackingSpec::Anonymous,
            None,
            PAGE_SIZE,
            Access::READ | Access::WRITE,
            Sharing::Private,
        )
        .unwrap();
    assert!(h.mgr.mark_volatile(&space, range).is_err());
}
