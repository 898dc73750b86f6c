//! Lease protocol tests against the SQL store.

mod common;

use std::collections::HashMap;

use common::{create_block_blob, create_container, ctx_at, no_lease, test_store, ACCOUNT};
use sqlblob::{AccessConditions, BlobMetadataStore, ErrorCode, LeaseState, LeaseStatus};

#[tokio::test]
async fn acquire_renew_release_fixed_blob_lease() {
    let store = test_store().await;
    create_container(&store, "c").await;
    create_block_blob(&store, "c", "b").await;

    let leased = store
        .acquire_blob_lease(&ctx_at(0), ACCOUNT, "c", "b", "", 30, Some("L1"))
        .await
        .unwrap();
    assert_eq!(leased.lease.state, LeaseState::Leased);
    assert_eq!(leased.lease.lease_id.as_deref(), Some("L1"));
    assert_eq!(
        leased.lease.expire_time,
        Some(ctx_at(30).start_time)
    );

    let renewed = store
        .renew_blob_lease(&ctx_at(20), ACCOUNT, "c", "b", "L1")
        .await
        .unwrap();
    assert_eq!(renewed.lease.expire_time, Some(ctx_at(50).start_time));

    let released = store
        .release_blob_lease(&ctx_at(25), ACCOUNT, "c", "b", "L1")
        .await
        .unwrap();
    assert_eq!(released.lease.state, LeaseState::Available);
    assert!(released.lease.lease_id.is_none());
}

#[tokio::test]
async fn expired_lease_is_observable_and_collapses_on_write() {
    let store = test_store().await;
    create_container(&store, "c").await;
    create_block_blob(&store, "c", "b").await;

    store
        .acquire_blob_lease(&ctx_at(0), ACCOUNT, "c", "b", "", 15, Some("L1"))
        .await
        .unwrap();

    let observed = store
        .get_blob_properties(&ctx_at(20), ACCOUNT, "c", "b", "", &no_lease())
        .await
        .unwrap();
    assert_eq!(observed.lease.state, LeaseState::Expired);
    assert_eq!(observed.lease.status, LeaseStatus::Unlocked);

    // A write with no lease id succeeds and collapses the lease.
    store
        .set_blob_metadata(&ctx_at(21), ACCOUNT, "c", "b", HashMap::new(), &no_lease())
        .await
        .unwrap();
    let after = store
        .get_blob_properties(&ctx_at(22), ACCOUNT, "c", "b", "", &no_lease())
        .await
        .unwrap();
    assert_eq!(after.lease.state, LeaseState::Available);
    assert!(after.lease.lease_id.is_none());
}

#[tokio::test]
async fn break_then_acquire() {
    let store = test_store().await;
    create_container(&store, "c").await;
    create_block_blob(&store, "c", "b").await;

    store
        .acquire_blob_lease(&ctx_at(0), ACCOUNT, "c", "b", "", -1, Some("L1"))
        .await
        .unwrap();

    let (broken, lease_time) = store
        .break_blob_lease(&ctx_at(10), ACCOUNT, "c", "b", Some(30))
        .await
        .unwrap();
    assert_eq!(broken.lease.state, LeaseState::Breaking);
    assert_eq!(lease_time, 30);

    let err = store
        .acquire_blob_lease(&ctx_at(20), ACCOUNT, "c", "b", "", 15, Some("L2"))
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::LeaseAlreadyPresent);

    let acquired = store
        .acquire_blob_lease(&ctx_at(45), ACCOUNT, "c", "b", "", 15, Some("L2"))
        .await
        .unwrap();
    assert_eq!(acquired.lease.state, LeaseState::Leased);
    assert_eq!(acquired.lease.lease_id.as_deref(), Some("L2"));
}

#[tokio::test]
async fn write_gate_on_leased_blob() {
    let store = test_store().await;
    create_container(&store, "c").await;
    create_block_blob(&store, "c", "b").await;
    store
        .acquire_blob_lease(&ctx_at(0), ACCOUNT, "c", "b", "", -1, Some("L1"))
        .await
        .unwrap();

    let err = store
        .set_blob_metadata(&ctx_at(1), ACCOUNT, "c", "b", HashMap::new(), &no_lease())
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::LeaseIdMissing);

    let err = store
        .set_blob_metadata(
            &ctx_at(2),
            ACCOUNT,
            "c",
            "b",
            HashMap::new(),
            &AccessConditions::lease("L2"),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::LeaseIdMismatchWithBlobOperation);

    // The holder writes; lease id comparison is case-insensitive.
    store
        .set_blob_metadata(
            &ctx_at(3),
            ACCOUNT,
            "c",
            "b",
            HashMap::new(),
            &AccessConditions::lease("l1"),
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn stale_lease_id_on_unlocked_blob_is_lost() {
    let store = test_store().await;
    create_container(&store, "c").await;
    create_block_blob(&store, "c", "b").await;

    let err = store
        .set_blob_metadata(
            &ctx_at(0),
            ACCOUNT,
            "c",
            "b",
            HashMap::new(),
            &AccessConditions::lease("L1"),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::LeaseLost);

    // Reads with a stale id are accepted on an unlocked blob.
    store
        .get_blob_properties(
            &ctx_at(1),
            ACCOUNT,
            "c",
            "b",
            "",
            &AccessConditions::lease("L1"),
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn change_and_renew_error_paths() {
    let store = test_store().await;
    create_container(&store, "c").await;
    create_block_blob(&store, "c", "b").await;

    let err = store
        .renew_blob_lease(&ctx_at(0), ACCOUNT, "c", "b", "L1")
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::LeaseIdMismatchWithLeaseOperation);

    store
        .acquire_blob_lease(&ctx_at(1), ACCOUNT, "c", "b", "", -1, Some("L1"))
        .await
        .unwrap();
    let changed = store
        .change_blob_lease(&ctx_at(2), ACCOUNT, "c", "b", "L1", "L2")
        .await
        .unwrap();
    assert_eq!(changed.lease.lease_id.as_deref(), Some("L2"));

    store
        .break_blob_lease(&ctx_at(3), ACCOUNT, "c", "b", Some(30))
        .await
        .unwrap();
    let err = store
        .change_blob_lease(&ctx_at(4), ACCOUNT, "c", "b", "L2", "L3")
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::LeaseIsBreakingAndCannotBeChanged);

    let err = store
        .renew_blob_lease(&ctx_at(5), ACCOUNT, "c", "b", "L2")
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::LeaseIsBrokenAndCannotBeRenewed);
}

#[tokio::test]
async fn invalid_durations_and_break_periods() {
    let store = test_store().await;
    create_container(&store, "c").await;
    create_block_blob(&store, "c", "b").await;

    for duration in [0, 14, 61] {
        let err = store
            .acquire_blob_lease(&ctx_at(0), ACCOUNT, "c", "b", "", duration, None)
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidLeaseDuration);
    }

    store
        .acquire_blob_lease(&ctx_at(1), ACCOUNT, "c", "b", "", -1, Some("L1"))
        .await
        .unwrap();
    let err = store
        .break_blob_lease(&ctx_at(2), ACCOUNT, "c", "b", Some(61))
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidLeaseBreakPeriod);
}

#[tokio::test]
async fn snapshots_cannot_be_leased() {
    let store = test_store().await;
    create_container(&store, "c").await;
    create_block_blob(&store, "c", "b").await;
    let (snapshot, _) = store
        .create_snapshot(&ctx_at(1), ACCOUNT, "c", "b", None, &no_lease())
        .await
        .unwrap();

    let err = store
        .acquire_blob_lease(&ctx_at(2), ACCOUNT, "c", "b", &snapshot, -1, None)
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::BlobSnapshotsPresent);
}

#[tokio::test]
async fn container_lease_round_trip() {
    let store = test_store().await;
    create_container(&store, "c").await;

    let leased = store
        .acquire_container_lease(&ctx_at(0), ACCOUNT, "c", 60, Some("C1"))
        .await
        .unwrap();
    assert_eq!(leased.lease.state, LeaseState::Leased);

    let renewed = store
        .renew_container_lease(&ctx_at(30), ACCOUNT, "c", "C1")
        .await
        .unwrap();
    assert_eq!(renewed.lease.expire_time, Some(ctx_at(90).start_time));

    let (breaking, lease_time) = store
        .break_container_lease(&ctx_at(40), ACCOUNT, "c", Some(10))
        .await
        .unwrap();
    assert_eq!(breaking.lease.state, LeaseState::Breaking);
    assert_eq!(lease_time, 10);

    let released = store
        .release_container_lease(&ctx_at(45), ACCOUNT, "c", "C1")
        .await
        .unwrap();
    assert_eq!(released.lease.state, LeaseState::Available);
}
