//! Associations follow their owner's shard

mod common;

use common::{shard, TestEnv};
use shardrelay::{Datum, Record, Routable, ShardName, ShardRelayError};

async fn user_with_items(env: &TestEnv) -> Record {
    let mut user = Record::new("users").with("id", 1).with("name", "ada");
    assert_eq!(env.proxy.save(&mut user).await.unwrap(), shard("beta"));

    for name in ["lamp", "desk"] {
        let mut item = Record::new("items").with("name", name);
        let placed = env.proxy.save_associated(&mut user, "items", &mut item).await.unwrap();
        assert_eq!(placed, shard("beta"));
        assert_eq!(item.attribute("user_id"), Some(&Datum::from(1)));
        assert_eq!(item.attribute("shard_name"), Some(&Datum::from("beta")));
    }
    user
}

#[tokio::test]
async fn test_has_many_stays_on_owner_shard() {
    let env = TestEnv::new().await.unwrap();
    let user = user_with_items(&env).await;

    let items = env.proxy.load_association(&user, "items").await.unwrap();

    assert_eq!(items.len(), 2);
    assert!(items.iter().all(|item| item.current_shard() == Some(&shard("beta"))));
    assert_eq!(env.memory.rows(&shard("beta"), "items").await.len(), 2);
    assert!(env.memory.rows(&shard("alpha"), "items").await.is_empty());
}

#[tokio::test]
async fn test_owner_shard_beats_block_context() {
    let env = TestEnv::new().await.unwrap();
    let user = user_with_items(&env).await;
    let proxy = env.proxy.as_ref();

    let items = proxy
        .using("gamma", async { proxy.load_association(&user, "items").await })
        .await
        .unwrap()
        .unwrap();

    assert_eq!(items.len(), 2);
}

#[tokio::test]
async fn test_cross_shard_association_uses_target_routing() {
    let env = TestEnv::new().await.unwrap();
    let mut user = user_with_items(&env).await;

    let mut audit = Record::new("audits").with("action", "login");
    let placed = env.proxy.save_associated(&mut user, "audits", &mut audit).await.unwrap();
    assert_eq!(placed, ShardName::master());

    let audits = env.proxy.load_association(&user, "audits").await.unwrap();
    assert_eq!(audits.len(), 1);
    assert_eq!(audits[0].current_shard(), Some(&ShardName::master()));
    assert_eq!(audits[0].attribute("user_id"), Some(&Datum::from(1)));
}

#[tokio::test]
async fn test_belongs_to_loads_from_child_shard() {
    let env = TestEnv::new().await.unwrap();
    user_with_items(&env).await;

    let items = env.proxy.where_eq("items", "shard_name", "beta").await.unwrap();
    let owner = env.proxy.load_association(&items[0], "user").await.unwrap();

    assert_eq!(owner.len(), 1);
    assert_eq!(owner[0].attribute("name"), Some(&Datum::from("ada")));
    assert_eq!(owner[0].current_shard(), Some(&shard("beta")));
}

#[tokio::test]
async fn test_belongs_to_save_sets_owner_key() {
    let env = TestEnv::new().await.unwrap();

    let mut item = Record::new("items").with("id", 10).with("shard_name", "gamma");
    env.proxy.save(&mut item).await.unwrap();

    let mut user = Record::new("users").with("id", 7).with("name", "grace");
    let placed = env.proxy.save_associated(&mut item, "user", &mut user).await.unwrap();

    assert_eq!(placed, shard("gamma"));
    assert_eq!(item.attribute("user_id"), Some(&Datum::from(7)));
}

#[tokio::test]
async fn test_owner_without_shard_is_rejected() {
    let env = TestEnv::new().await.unwrap();
    let user = Record::new("users").with("id", 5);

    let err = env.proxy.load_association(&user, "items").await.unwrap_err();
    assert!(matches!(err, ShardRelayError::Routing { .. }));

    // Cross-shard associations do not need the owner's shard
    assert!(env.proxy.load_association(&user, "audits").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_unknown_or_mismatched_association() {
    let env = TestEnv::new().await.unwrap();
    let mut user = user_with_items(&env).await;

    let err = env.proxy.load_association(&user, "orders").await.unwrap_err();
    assert!(matches!(err, ShardRelayError::UnknownAssociation { .. }));

    let mut wrong = Record::new("settings").with("id", 1);
    let err = env
        .proxy
        .save_associated(&mut user, "items", &mut wrong)
        .await
        .unwrap_err();
    assert!(matches!(err, ShardRelayError::Routing { .. }));
}
