/// Transaction tests
///
/// Cross-process commit, local short-circuit, rollback and reaping.
/// Run with: cargo test --test transactions
mod common;

use common::{Fixture, User};
use rustdac::driver::Operation;
use rustdac::{Condition, Context, DacError};
use std::time::Duration;

#[tokio::test]
async fn test_cross_process_commit_needs_origin() {
    let fx = Fixture::new("tx-cross", Duration::from_secs(10));
    let client = fx.client();
    let dac = fx.dac();

    let process_a = Context::for_process("proc-a");
    let address = client.begin(&process_a, false, None).await.unwrap();
    let mut user = User {
        id: "u1".into(),
        name: "Ada".into(),
        ..Default::default()
    };
    dac.insert(&process_a, &mut user).await.unwrap();

    let process_b = Context::for_process("proc-b");
    process_b.attach_transaction(address.clone());
    let seen = dac
        .query_one::<User>(&process_b, Condition::eq("id", "u1"))
        .await
        .unwrap();
    assert_eq!(seen.map(|u| u.name), Some("Ada".to_string()));

    assert!(!client.commit(&process_b).await.unwrap());
    assert_eq!(fx.count(Operation::Commit), 0);
    assert!(client.commit(&process_a).await.unwrap());
    assert_eq!(fx.count(Operation::Commit), 1);

    let in_tx = fx
        .driver
        .requests()
        .into_iter()
        .filter(|r| matches!(r.operation, Operation::Query | Operation::Execute))
        .all(|r| r.in_transaction);
    assert!(in_tx);
}

#[tokio::test]
async fn test_nested_begin_commits_once() {
    let fx = Fixture::new("tx-nested", Duration::from_secs(10));
    let client = fx.client();
    let dac = fx.dac();
    let ctx = Context::new();

    client.begin(&ctx, false, None).await.unwrap();
    client.begin(&ctx, false, None).await.unwrap();
    let mut user = User {
        id: "u9".into(),
        name: "Kay".into(),
        ..Default::default()
    };
    dac.insert(&ctx, &mut user).await.unwrap();

    assert!(!client.commit(&ctx).await.unwrap());
    assert!(ctx.transaction_address().is_some());
    assert!(client.commit(&ctx).await.unwrap());
    assert!(ctx.transaction_address().is_none());
    assert_eq!(fx.count(Operation::Begin), 1);
    assert_eq!(fx.count(Operation::Commit), 1);
}

#[tokio::test]
async fn test_rollback_then_commit_is_absent() {
    let fx = Fixture::new("tx-rollback", Duration::from_secs(10));
    let client = fx.client();
    let ctx = Context::new();

    client.begin(&ctx, true, None).await.unwrap();
    client.rollback(&ctx).await.unwrap();
    assert_eq!(client.commit(&ctx).await, Err(DacError::TransactionAbsent));
    assert_eq!(fx.count(Operation::Rollback), 1);
    assert!(fx.service.group().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_abandoned_transaction_is_reaped() {
    let fx = Fixture::new("tx-reaper", Duration::from_secs(1));
    let client = fx.client();
    let ctx = Context::new();

    client.begin(&ctx, false, None).await.unwrap();
    tokio::time::sleep(Duration::from_secs(11)).await;

    assert_eq!(fx.count(Operation::Rollback), 1);
    let err = client.commit(&ctx).await.unwrap_err();
    assert_eq!(err.code(), "TransactionTimeout");
    assert!(ctx.transaction_address().is_none());
}
