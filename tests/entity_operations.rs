/// Entity operation tests
///
/// Insert, query, optimistic locking, conditional insert and paging against
/// the in-memory `users` store.
/// Run with: cargo test --test entity_operations
mod common;

use common::{Fixture, User};
use rustdac::driver::Operation;
use rustdac::{Condition, Context, DacError, Page, QueryOptions, asc, lit_query};
use std::time::Duration;

fn fixture(name: &str) -> Fixture {
    Fixture::new(name, Duration::from_secs(10))
}

#[tokio::test]
async fn test_insert_then_query_by_pk() {
    let fx = fixture("ops-insert");
    let dac = fx.dac();
    let ctx = Context::new();

    let mut user = User {
        id: "u1".into(),
        name: "Ada".into(),
        ..Default::default()
    };
    let result = dac.insert(&ctx, &mut user).await.unwrap();
    assert_eq!(result.rows_affected, 1);
    assert_eq!(user.v, 1);

    let found = dac
        .query_one::<User>(&ctx, Condition::eq("id", "u1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found, User { id: "u1".into(), name: "Ada".into(), v: 1 });

    assert!(dac.exist::<User>(&ctx, Some(&Condition::eq("id", "u1"))).await.unwrap());
    assert_eq!(dac.delete(&ctx, &mut user).await.unwrap().rows_affected, 1);
    assert_eq!(fx.store.len(), 0);
}

#[tokio::test]
async fn test_concurrent_updates_one_wins() {
    let fx = fixture("ops-lock");
    let dac = fx.dac();
    let ctx = Context::new();

    let mut user = User {
        id: "u1".into(),
        name: "Ada".into(),
        ..Default::default()
    };
    dac.insert(&ctx, &mut user).await.unwrap();

    let mut first = User { name: "Grace".into(), ..user.clone() };
    let mut second = User { name: "Barbara".into(), ..user.clone() };
    let (a, b) = tokio::join!(dac.update(&ctx, &mut first), dac.update(&ctx, &mut second));

    let outcomes = [(a, first.v), (b, second.v)];
    let won: Vec<_> = outcomes.iter().filter(|(r, _)| r.is_ok()).collect();
    let lost: Vec<_> = outcomes.iter().filter(|(r, _)| r.is_err()).collect();
    assert_eq!(won.len(), 1);
    assert_eq!(lost.len(), 1);

    let (ok, v) = won[0];
    assert_eq!(ok.as_ref().unwrap().rows_affected, 1);
    assert_eq!(*v, 2);
    let (err, v) = lost[0];
    assert_eq!(
        err.as_ref().unwrap_err(),
        &DacError::OptimisticLockFailed { entity: "User".into() }
    );
    assert_eq!(*v, 1);
    assert_eq!(fx.store.get("u1").unwrap().1, 2);
}

#[tokio::test]
async fn test_upsert_keeps_version_in_step() {
    let fx = fixture("ops-upsert");
    let dac = fx.dac();
    let ctx = Context::new();

    let mut user = User {
        id: "u1".into(),
        name: "Ada".into(),
        ..Default::default()
    };
    dac.insert(&ctx, &mut user).await.unwrap();

    let mut upserted = User {
        id: "u1".into(),
        name: "Grace".into(),
        ..Default::default()
    };
    assert_eq!(dac.insert_or_update(&ctx, &mut upserted).await.unwrap().rows_affected, 2);
    assert_eq!(fx.store.get("u1"), Some(("Grace".to_string(), 2)));
    assert_eq!(upserted.v, 2);

    upserted.name = "Lin".into();
    dac.update(&ctx, &mut upserted).await.unwrap();
    assert_eq!(upserted.v, 3);
    assert_eq!(fx.store.get("u1"), Some(("Lin".to_string(), 3)));

    let mut fresh = User {
        id: "u2".into(),
        name: "Kay".into(),
        ..Default::default()
    };
    dac.insert_or_update(&ctx, &mut fresh).await.unwrap();
    assert_eq!(fresh.v, 1);
}

#[tokio::test]
async fn test_insert_when_not_exist_is_idempotent() {
    let fx = fixture("ops-conditional");
    let dac = fx.dac();
    let ctx = Context::new();
    let source = lit_query("SELECT 1 FROM users WHERE id='u2'");

    for _ in 0..3 {
        let mut user = User {
            id: "u2".into(),
            name: "Lin".into(),
            ..Default::default()
        };
        dac.insert_when_not_exist(&ctx, &mut user, &source).await.unwrap();
    }
    assert_eq!(fx.store.len(), 1);

    let statements = fx.driver.statements();
    let insert = statements.iter().find(|sql| sql.starts_with("INSERT")).unwrap();
    assert_eq!(
        insert,
        "INSERT IGNORE INTO `users` (`id`, `name`, `v`) SELECT ?, ?, ? FROM DUAL \
         WHERE NOT EXISTS (SELECT 1 FROM users WHERE id='u2')"
    );
}

#[tokio::test]
async fn test_page_reports_total() {
    let fx = fixture("ops-page");
    let dac = fx.dac();
    let ctx = Context::new();

    let mut users: Vec<User> = (0..3)
        .map(|i| User {
            id: format!("u{}", i),
            name: format!("n{}", i),
            ..Default::default()
        })
        .collect();
    for user in users.iter_mut() {
        dac.insert(&ctx, user).await.unwrap();
    }

    let paged = dac
        .page::<User>(&ctx, QueryOptions::new().order_by(asc("id")), Page::new(1, 2).unwrap())
        .await
        .unwrap();
    assert_eq!(paged.total, 3);
    assert_eq!((paged.no, paged.size), (1, 2));
    assert_eq!(paged.pages(), 2);
    assert!(fx.driver.statements().iter().any(|sql| sql.contains("LIMIT 0, 2")));
    assert_eq!(fx.count(Operation::Begin), 0);
}
