//! Shard resolution for reads and writes

mod common;

use std::collections::HashMap;
use std::sync::Arc;

use common::{shard, shards, sharded_config, TestDataGenerator, TestEnv, SHARDS};
use shardrelay::{
    Datum, ModelBinding, Record, Routable, RoutingProxy, SelectOptions, ShardName, ShardRelayError, ShardTracker,
    Statement,
};
use shardrelay_driver::MemoryConnector;

fn two_shard_proxy(memory: Arc<MemoryConnector>, binding: ModelBinding) -> RoutingProxy {
    RoutingProxy::builder(sharded_config(&["alpha", "beta"]))
        .connector(memory)
        .model(binding)
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_round_robin_covers_every_shard() {
    let env = TestEnv::new().await.unwrap();

    let mut counts: HashMap<ShardName, usize> = HashMap::new();
    for _ in 0..SHARDS.len() * 4 {
        let picked = env.proxy.choose_next_shard(SelectOptions::default()).await;
        *counts.entry(picked).or_default() += 1;
    }

    assert_eq!(counts.len(), SHARDS.len());
    assert!(counts.values().all(|count| *count == 4));
    assert!(!counts.contains_key(&ShardName::master()));
}

#[tokio::test]
async fn test_choose_next_shard_master_rules() {
    let env = TestEnv::new().await.unwrap();
    let with_master = SelectOptions::default().including_master();

    let first = env.proxy.choose_next_shard(with_master).await;
    assert_eq!(first, ShardName::master());

    let master_only = TestEnv::with_config(sharded_config(&[])).await.unwrap();
    for _ in 0..3 {
        assert_eq!(
            master_only.proxy.choose_next_shard(SelectOptions::default()).await,
            ShardName::master()
        );
    }
}

#[tokio::test]
async fn test_saved_records_resolve_back_to_their_shard() {
    let env = TestEnv::new().await.unwrap();

    let mut placed = Vec::new();
    for mut user in TestDataGenerator::users(1..=9) {
        let shard = env.proxy.save(&mut user).await.unwrap();
        placed.push((user.primary_key().cloned().unwrap(), shard));
    }
    for mut event in TestDataGenerator::events(100..=108) {
        let shard = env.proxy.save(&mut event).await.unwrap();
        placed.push((event.primary_key().cloned().unwrap(), shard));
    }

    for (index, (key, shard)) in placed.iter().enumerate() {
        let model = if index < 9 { "users" } else { "events" };
        for _ in 0..3 {
            let found = env.proxy.find(model, key.clone()).await.unwrap().unwrap();
            assert_eq!(found.current_shard(), Some(shard));
        }
    }
}

#[tokio::test]
async fn test_dynamic_tracker_spreads_by_key() {
    let env = TestEnv::new().await.unwrap();

    let mut users = TestDataGenerator::users(3..=5);
    let mut placed = Vec::new();
    for user in users.iter_mut() {
        placed.push(env.proxy.save(user).await.unwrap());
    }

    assert_eq!(placed, shards(&["alpha", "beta", "gamma"]));
    assert_eq!(env.memory.rows(&shard("beta"), "users").await.len(), 1);
}

#[tokio::test]
async fn test_round_robin_default_for_tracked_models() {
    let env = TestEnv::new().await.unwrap();

    let mut placed = Vec::new();
    for mut event in TestDataGenerator::events(1..=6) {
        placed.push(env.proxy.save(&mut event).await.unwrap());
    }

    assert_eq!(placed, shards(&["alpha", "beta", "gamma", "alpha", "beta", "gamma"]));
}

#[tokio::test]
async fn test_attribute_column_routes_where_queries() {
    let env = TestEnv::new().await.unwrap();

    let mut item = Record::new("items").with("id", 1).with("shard_name", "gamma");
    assert_eq!(env.proxy.save(&mut item).await.unwrap(), shard("gamma"));

    let found = env.proxy.where_eq("items", "shard_name", "gamma").await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].current_shard(), Some(&shard("gamma")));
}

#[tokio::test]
async fn test_untracked_models_default_to_master() {
    let env = TestEnv::new().await.unwrap();

    let mut setting = Record::new("settings").with("id", 1).with("value", "dark");
    assert_eq!(env.proxy.save(&mut setting).await.unwrap(), ShardName::master());

    let result = env.proxy.execute(Statement::raw("SELECT 1")).await.unwrap();
    assert_eq!(result.affected(), 0);
    assert_eq!(env.memory.raw_statements(&ShardName::master()).await, vec!["SELECT 1"]);
}

#[tokio::test]
async fn test_update_stays_on_assigned_shard() {
    let env = TestEnv::new().await.unwrap();

    let mut event = Record::new("events").with("id", 1).with("kind", "login");
    let shard = env.proxy.save(&mut event).await.unwrap();

    event.set_attribute("kind", Datum::from("logout"));
    let updated_on = env.proxy.save(&mut event).await.unwrap();
    assert_eq!(updated_on, shard);

    let rows = env.memory.rows(&shard, "events").await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("kind"), Some(&Datum::from("logout")));
}

#[tokio::test]
async fn test_delete_is_pinned_and_evicts_placement() {
    let env = TestEnv::new().await.unwrap();

    let mut event = Record::new("events").with("id", 42);
    let shard = env.proxy.save(&mut event).await.unwrap();

    assert_eq!(env.proxy.delete(&mut event).await.unwrap(), 1);
    assert!(!event.is_persisted());
    assert!(env.memory.rows(&shard, "events").await.is_empty());
    assert!(env.proxy.on_shard(shard).find("events", 42).await.unwrap().is_none());
}

#[tokio::test]
async fn test_shard_scope_keeps_affinity() {
    let env = TestEnv::new().await.unwrap();
    let beta = env.proxy.on_shard("beta");

    let mut setting = Record::new("settings").with("id", 1);
    assert_eq!(beta.save(&mut setting).await.unwrap(), shard("beta"));

    assert!(beta.find("settings", 1).await.unwrap().is_some());
    assert_eq!(beta.all("settings").await.unwrap().len(), 1);
    assert!(env.proxy.find("settings", 1).await.unwrap().is_none());
}

#[tokio::test]
async fn test_unknown_shard_scope() {
    let env = TestEnv::new().await.unwrap();

    let err = env.proxy.on_shard("omega").find("settings", 1).await.unwrap_err();
    assert!(matches!(err, ShardRelayError::UnknownShard { .. }));
}

#[tokio::test]
async fn test_tracker_failure_names_the_record() {
    let proxy = RoutingProxy::builder(sharded_config(&SHARDS))
        .model(ModelBinding::new("orders").tracked_by(ShardTracker::dynamic(|record: &dyn Routable| {
            match record.attribute("region") {
                Some(_) => Ok(Some(ShardName::from("alpha"))),
                None => Err("order has no region".into()),
            }
        })))
        .build()
        .unwrap();

    let mut order = Record::new("orders").with("id", 11);
    let err = proxy.save(&mut order).await.unwrap_err();

    match err {
        ShardRelayError::Tracker { model, record, .. } => {
            assert_eq!(model, "orders");
            assert_eq!(record, "11");
        }
        other => panic!("unexpected error: {}", other),
    }
}

#[tokio::test]
async fn test_disabled_environment_routes_to_master() {
    let mut config = sharded_config(&SHARDS);
    config.environment = "development".to_string();
    let env = TestEnv::with_config(config).await.unwrap();

    assert!(!env.proxy.enabled().await);
    assert_eq!(env.proxy.shards().await, vec![ShardName::master()]);

    let mut user = Record::new("users").with("id", 1);
    assert_eq!(env.proxy.save(&mut user).await.unwrap(), ShardName::master());

    let inside = env
        .proxy
        .using("alpha", async { env.proxy.current_shard().await })
        .await
        .unwrap();
    assert_eq!(inside, ShardName::master());
}

#[tokio::test]
async fn test_transaction_commits_and_rolls_back() {
    let env = TestEnv::new().await.unwrap();
    let proxy = env.proxy.as_ref();

    let committed = proxy
        .using(
            "beta",
            proxy.transaction(|shard| async move {
                let mut setting = Record::new("settings").with("id", 1);
                proxy.save(&mut setting).await?;
                Ok(shard)
            }),
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(committed, shard("beta"));
    assert_eq!(env.memory.rows(&shard("beta"), "settings").await.len(), 1);

    let aborted = proxy
        .on_shard("gamma")
        .transaction(|_shard| async move {
            let mut setting = Record::new("settings").with("id", 2);
            proxy.save(&mut setting).await?;
            Err::<(), _>(ShardRelayError::internal("abort"))
        })
        .await;
    assert!(aborted.is_err());
    assert!(env.memory.rows(&shard("gamma"), "settings").await.is_empty());
}

#[tokio::test]
async fn test_same_key_on_two_shards_is_never_confused() {
    let memory = Arc::new(MemoryConnector::new());
    let proxy = two_shard_proxy(
        memory.clone(),
        ModelBinding::new("accounts").tracked_by(ShardTracker::attribute("shard")),
    );

    // Each shard assigns key 1 on its own
    let mut first = Record::new("accounts").with("name", "A");
    let mut second = Record::new("accounts").with("name", "B");
    assert_eq!(proxy.save(&mut first).await.unwrap(), shard("alpha"));
    assert_eq!(proxy.save(&mut second).await.unwrap(), shard("beta"));
    assert_eq!(first.primary_key(), Some(&Datum::from(1)));
    assert_eq!(second.primary_key(), Some(&Datum::from(1)));

    for _ in 0..3 {
        let err = proxy.find("accounts", 1).await.unwrap_err();
        assert!(matches!(err, ShardRelayError::Routing { .. }));
        assert!(err.to_string().contains("alpha, beta"));
    }

    let found = proxy.on_shard("beta").find("accounts", 1).await.unwrap().unwrap();
    assert_eq!(found.attribute("name"), Some(&Datum::from("B")));
    let found = proxy.where_eq("accounts", "shard", "beta").await.unwrap();
    assert_eq!(found[0].attribute("name"), Some(&Datum::from("B")));

    // Still refused once placements are forgotten
    proxy.teardown().await;
    assert!(proxy.find("accounts", 1).await.is_err());

    // With one copy left the key is unique again
    assert_eq!(proxy.delete(&mut first).await.unwrap(), 1);
    let found = proxy.find("accounts", 1).await.unwrap().unwrap();
    assert_eq!(found.current_shard(), Some(&shard("beta")));
    assert_eq!(found.attribute("name"), Some(&Datum::from("B")));
}

#[tokio::test]
async fn test_find_after_teardown_locates_the_only_copy() {
    let env = TestEnv::new().await.unwrap();

    let mut event = Record::new("events").with("id", 7).with("kind", "login");
    let placed = env.proxy.save(&mut event).await.unwrap();
    env.proxy.teardown().await;

    for _ in 0..3 {
        let found = env.proxy.find("events", 7).await.unwrap().unwrap();
        assert_eq!(found.current_shard(), Some(&placed));
    }
    assert!(env.proxy.find("events", 8).await.unwrap().is_none());
}

#[tokio::test]
async fn test_modulo_tracker_needs_a_key_before_saving() {
    let env = TestEnv::new().await.unwrap();

    let mut user = Record::new("users").with("name", "nobody");
    let err = env.proxy.save(&mut user).await.unwrap_err();

    assert!(matches!(err, ShardRelayError::Tracker { .. }));
    assert!(!user.is_persisted());
    for name in SHARDS {
        assert!(env.memory.rows(&shard(name), "users").await.is_empty());
    }
}

#[tokio::test]
async fn test_assigned_key_must_lead_back_to_its_shard() {
    let memory = Arc::new(MemoryConnector::new());
    let by_parity = ShardTracker::dynamic(|record: &dyn Routable| {
        Ok(record.primary_key().and_then(Datum::as_int).map(|key| {
            if key % 2 == 0 {
                ShardName::from("alpha")
            } else {
                ShardName::from("beta")
            }
        }))
    });
    let proxy = two_shard_proxy(memory.clone(), ModelBinding::new("orders").tracked_by(by_parity));

    // alpha hands out key 1, which belongs on beta
    let mut misplaced = Record::new("orders").with("total", 10);
    let err = proxy.save(&mut misplaced).await.unwrap_err();
    assert!(matches!(err, ShardRelayError::Tracker { .. }));
    assert!(misplaced.primary_key().is_none());
    assert!(!misplaced.is_persisted());
    assert!(memory.rows(&shard("alpha"), "orders").await.is_empty());

    // beta hands out key 1 too, which stays there
    let mut order = Record::new("orders").with("total", 20);
    assert_eq!(proxy.save(&mut order).await.unwrap(), shard("beta"));
    order.set_attribute("total", Datum::from(25));
    assert_eq!(proxy.save(&mut order).await.unwrap(), shard("beta"));

    proxy.teardown().await;
    let found = proxy.find("orders", 1).await.unwrap().unwrap();
    assert_eq!(found.current_shard(), Some(&shard("beta")));
    assert_eq!(found.attribute("total"), Some(&Datum::from(25)));
}

#[tokio::test]
async fn test_placements_stay_within_capacity() {
    let mut config = sharded_config(&SHARDS);
    config.routing.placement_capacity = 4;
    let env = TestEnv::with_config(config).await.unwrap();

    for mut event in TestDataGenerator::events(1..=20) {
        env.proxy.save(&mut event).await.unwrap();
    }
    assert!(!env.proxy.all("events").await.unwrap().is_empty());
    assert_eq!(env.proxy.placement().len().await, 4);

    // A forgotten key is found again on its shard
    let found = env.proxy.find("events", 1).await.unwrap().unwrap();
    assert_eq!(found.current_shard(), Some(&shard("alpha")));
    assert_eq!(env.proxy.placement().len().await, 4);
}
