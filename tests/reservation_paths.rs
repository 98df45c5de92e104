//! Reservation path selection through the public API
//!
//! Hint first, then the size classes or the large heap, then an extent
//! vector stitched from several free extents.

use vea_rs::{
    FreeExtent, Pool, ReservationState, SpaceInfo, VeaBuilder, VeaConfig, VeaError,
    HINT_OFF_INVALID,
};

/// `usable` blocks after one header block, every one durably allocated,
/// with the ranges in `holes` freed and settled
fn space_with_holes(usable: u32, threshold_mb: u32, holes: &[(u64, u32)]) -> SpaceInfo {
    let mut vea = VeaBuilder::new()
        .large_threshold_mb(threshold_mb)
        .format(u64::from(usable) + 1)
        .build()
        .unwrap();

    let mut all = [vea.reserve(usable, None).unwrap()];
    vea.publish(&mut all).unwrap();
    for &(offset, count) in holes {
        vea.free(offset, count).unwrap();
    }
    vea.flush().unwrap();
    vea
}

#[test]
fn test_hint_keeps_stream_contiguous() {
    let mut vea = VeaBuilder::new().format(4096).build().unwrap();
    let mut offsets = Vec::new();
    for _ in 0..4 {
        let mut resrv = [vea.reserve(8, Some(1)).unwrap()];
        vea.publish(&mut resrv).unwrap();
        offsets.push(resrv[0].offset());
    }
    assert_eq!(offsets, vec![1, 9, 17, 25]);

    let (_, stats) = vea.query().unwrap();
    assert_eq!(stats.resrv_hint, 3);
}

#[test]
fn test_cancel_of_earlier_reservation_keeps_later_hint() {
    let mut vea = VeaBuilder::new().format(4096).build().unwrap();
    let a = vea.reserve(10, Some(1)).unwrap();
    let b = vea.reserve(10, Some(1)).unwrap();
    assert_eq!((a.hint_seq(), b.hint_seq()), (1, 2));

    vea.cancel(&mut [a]).unwrap();
    assert_eq!(vea.hint_get(1), 21);
    assert_eq!(vea.hint_seq(1), Some(2));

    let c = vea.reserve(10, Some(1)).unwrap();
    assert_eq!(c.offset(), 21);
    assert_eq!(c.hint_seq(), 3);
    assert_ne!(b.offset(), c.offset());
}

#[test]
fn test_batch_cancel_rolls_hint_back() {
    let mut vea = VeaBuilder::new().format(4096).build().unwrap();
    let mut first = [vea.reserve(10, Some(2)).unwrap()];
    vea.publish(&mut first).unwrap();

    let mut batch = [
        vea.reserve(10, Some(2)).unwrap(),
        vea.reserve(10, Some(2)).unwrap(),
    ];
    vea.cancel(&mut batch).unwrap();

    assert_eq!(vea.hint_get(2), 11);
    assert_eq!(vea.hint_seq(2), Some(1));
    assert!(batch.iter().all(|r| r.state() == ReservationState::Cancelled));
}

#[test]
fn test_batch_publish_persists_last_hint() {
    let mut vea = VeaBuilder::new().format(4096).build().unwrap();
    let mut batch = [
        vea.reserve(10, Some(5)).unwrap(),
        vea.reserve(20, Some(5)).unwrap(),
        vea.reserve(5, None).unwrap(),
    ];
    vea.publish(&mut batch).unwrap();

    let pool = vea.unload().unwrap();
    let mut vea = SpaceInfo::load(pool, VeaConfig::default()).unwrap();
    let ctx = vea.hint_load(5).unwrap();
    assert_eq!((ctx.offset, ctx.seq), (31, 2));
    assert_eq!(vea.hint_get(6), HINT_OFF_INVALID);
}

#[test]
fn test_large_heap_prefers_lowest_offset_on_tie() {
    // 1 MiB threshold is 256 blocks
    let mut vea = space_with_holes(2000, 1, &[(1000, 300), (100, 300)]);

    let a = vea.reserve(300, None).unwrap();
    let b = vea.reserve(300, None).unwrap();
    assert_eq!((a.offset(), b.offset()), (100, 1000));

    let (_, stats) = vea.query().unwrap();
    assert_eq!(stats.resrv_large, 3);
}

#[test]
fn test_small_request_prefers_size_class() {
    let mut vea = space_with_holes(2000, 1, &[(100, 20), (1000, 300)]);

    let resrv = vea.reserve(10, None).unwrap();
    assert_eq!(resrv.offset(), 100);
    assert_eq!(
        vea.dump(true).unwrap(),
        vec![FreeExtent::new(110, 10), FreeExtent::new(1000, 300)]
    );
}

#[test]
fn test_small_request_falls_back_to_heap() {
    let mut vea = space_with_holes(2000, 1, &[(100, 20), (1000, 300)]);

    let resrv = vea.reserve(50, None).unwrap();
    assert_eq!(resrv.offset(), 1000);
}

#[test]
fn test_vector_from_fragments() {
    let mut vea = space_with_holes(1000, 64, &[(100, 40), (300, 30), (500, 30)]);

    let mut resrv = [vea.reserve(100, None).unwrap()];
    assert!(resrv[0].is_vector());
    assert_eq!(resrv[0].block_count(), 100);

    let mut pieces: Vec<_> = resrv[0]
        .extents()
        .iter()
        .map(|e| (e.offset, e.block_count))
        .collect();
    pieces.sort();
    assert_eq!(pieces, vec![(100, 40), (300, 30), (500, 30)]);

    vea.publish(&mut resrv).unwrap();
    let id = resrv[0].vector_id().unwrap();
    assert_eq!(vea.vector(id).unwrap().unwrap().block_count(), 100);
    assert!(vea.dump(false).unwrap().is_empty());

    let (_, stats) = vea.query().unwrap();
    assert_eq!(stats.resrv_vector, 1);
}

#[test]
fn test_vector_piece_limit() {
    let config = VeaConfig {
        max_vector_extents: 2,
        ..VeaConfig::default()
    };
    let mut pool = Pool::memory();
    SpaceInfo::format(&mut pool, &config, 1001, false).unwrap();
    let mut vea = SpaceInfo::load(pool, config).unwrap();

    let mut all = [vea.reserve(1000, None).unwrap()];
    vea.publish(&mut all).unwrap();
    for offset in [100, 300, 500] {
        vea.free(offset, 30).unwrap();
    }
    vea.flush().unwrap();

    assert!(matches!(
        vea.reserve(90, None),
        Err(VeaError::OutOfSpace { requested: 90 })
    ));
    assert_eq!(vea.reserve(60, None).unwrap().block_count(), 60);
}

#[test]
fn test_out_of_space_leaves_state_untouched() {
    let mut vea = VeaBuilder::new().format(101).build().unwrap();
    let before = vea.dump(true).unwrap();

    assert!(matches!(
        vea.reserve(101, Some(1)),
        Err(VeaError::OutOfSpace { .. })
    ));
    assert_eq!(vea.dump(true).unwrap(), before);
    assert_eq!(vea.total_reserved(), 0);
    assert_eq!(vea.hint_seq(1), Some(0));
}

#[test]
fn test_transaction_publish_and_free_together() {
    let mut vea = VeaBuilder::new().format(4096).build().unwrap();
    let mut old = [vea.reserve(64, None).unwrap()];
    vea.publish(&mut old).unwrap();

    let mut new = [vea.reserve(64, None).unwrap()];
    vea.transaction(|vea| {
        vea.tx_publish(&mut new)?;
        vea.tx_free(1, 64)
    })
    .unwrap();

    assert!(vea.verify_alloc(false, 65, 64).unwrap());
    assert!(!vea.verify_alloc(false, 1, 64).unwrap());
    assert_eq!(vea.total_reserved(), 0);
}

#[test]
fn test_failed_transaction_returns_reservations() {
    let mut vea = VeaBuilder::new().format(4096).build().unwrap();
    let mut resrv = [vea.reserve(64, None).unwrap()];

    let result: vea_rs::Result<()> = vea.transaction(|vea| {
        vea.tx_publish(&mut resrv)?;
        vea.tx_free(5000, 1)
    });

    assert!(matches!(result, Err(VeaError::InvalidArgument(_))));
    assert_eq!(vea.total_reserved(), 0);
    assert_eq!(vea.dump(true).unwrap(), vec![FreeExtent::new(1, 4095)]);
    assert_eq!(vea.dump(false).unwrap(), vec![FreeExtent::new(1, 4095)]);
}
