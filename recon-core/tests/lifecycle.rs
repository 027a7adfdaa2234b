mod common;

use std::time::Duration;

use common::{Harness, association, asg_id, cache, cache_resource_id, nic_id, subnet_id};
use recon_core::resources::CacheSku;
use recon_core::{
    Action, Error, LifecycleState, LockKey, LockRegistry, ParseError, ResourceState, Timeouts,
};
use serde_json::json;

use LifecycleState::*;

// ============================================================================
// Cache
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_create_then_apply_is_idempotent() {
    let h = Harness::new();
    let engine = h.cache_engine();
    let desired = cache("cache1", CacheSku::Standard, 1);

    let created = engine.apply(None, &desired).await.unwrap();
    assert_eq!(created.action, Action::Created);
    assert_eq!(created.lifecycle, vec![NotCreated, Creating, Present]);
    assert_eq!(
        created.state.id,
        "/subscriptions/sub1/resourceGroups/rg1/providers/Microsoft.Cache/redis/cache1"
    );
    assert_eq!(created.state.schema_version, 2);
    assert_eq!(h.remote.calls().await.puts, 1);

    let again = engine.apply(Some(created.state.clone()), &desired).await.unwrap();
    assert_eq!(again.action, Action::Unchanged);
    assert!(again.changes.is_empty());
    assert_eq!(again.state, created.state);
    assert_eq!(h.remote.calls().await.puts, 1);
}

#[tokio::test(start_paused = true)]
async fn test_create_over_existing_requires_import() {
    let h = Harness::new();
    h.remote
        .insert(
            &cache_resource_id("cache1"),
            json!({
                "location": "westeurope",
                "properties": {"sku": {"name": "Basic", "family": "C", "capacity": 0}}
            }),
        )
        .await;

    let err = h
        .cache_engine()
        .apply(None, &cache("cache1", CacheSku::Standard, 1))
        .await
        .unwrap_err();
    assert!(err.is_requires_import(), "got {err:?}");
    assert_eq!(h.remote.calls().await.puts, 0);
}

#[tokio::test(start_paused = true)]
async fn test_update_patches_only_changed_fields() {
    let h = Harness::new();
    let engine = h.cache_engine();
    let created = engine
        .apply(None, &cache("cache1", CacheSku::Standard, 1))
        .await
        .unwrap();

    // A server-side setting this engine does not manage.
    let id = cache_resource_id("cache1");
    let mut body = h.remote.object(&id).await.unwrap();
    body["properties"]["redisConfiguration"] = json!({"maxmemory-policy": "allkeys-lru"});
    h.remote.insert(&id, body).await;

    let mut desired = cache("cache1", CacheSku::Standard, 2);
    desired.tags.insert("env".into(), "prod".into());
    let updated = engine.apply(Some(created.state), &desired).await.unwrap();

    assert_eq!(updated.action, Action::Updated);
    assert_eq!(updated.changes.iter().collect::<Vec<_>>(), vec!["capacity", "tags"]);
    assert_eq!(updated.lifecycle, vec![Present, Updating, Present]);

    let body = h.remote.object(&id).await.unwrap();
    assert_eq!(body["properties"]["sku"]["capacity"], 2);
    assert_eq!(body["tags"], json!({"env": "prod"}));
    assert_eq!(
        body["properties"]["redisConfiguration"],
        json!({"maxmemory-policy": "allkeys-lru"})
    );
}

#[tokio::test(start_paused = true)]
async fn test_out_of_band_change_is_reverted() {
    let h = Harness::new();
    let engine = h.cache_engine();
    let desired = cache("cache1", CacheSku::Standard, 1);
    let created = engine.apply(None, &desired).await.unwrap();

    let id = cache_resource_id("cache1");
    let mut body = h.remote.object(&id).await.unwrap();
    body["properties"]["sku"]["capacity"] = json!(4);
    h.remote.insert(&id, body).await;

    let outcome = engine.apply(Some(created.state), &desired).await.unwrap();
    assert_eq!(outcome.action, Action::Updated);
    assert_eq!(h.remote.object(&id).await.unwrap()["properties"]["sku"]["capacity"], 1);
}

#[tokio::test(start_paused = true)]
async fn test_downgrade_rejected_before_mutation() {
    let h = Harness::new();
    let engine = h.cache_engine();
    let mut desired = cache("cache1", CacheSku::Standard, 1);
    desired.replicas_per_primary = Some(1);
    let created = engine.apply(None, &desired).await.unwrap();
    let before = h.remote.calls().await;

    desired.sku = CacheSku::Basic;
    let err = engine.apply(Some(created.state), &desired).await.unwrap_err();

    assert!(matches!(err, Error::Invariant { .. }), "got {err:?}");
    assert_eq!(h.remote.calls().await, before);
    let body = h.remote.object(&cache_resource_id("cache1")).await.unwrap();
    assert_eq!(body["properties"]["sku"]["name"], "Standard");
}

#[tokio::test(start_paused = true)]
async fn test_valid_downgrade_replaces() {
    let h = Harness::new();
    let engine = h.cache_engine();
    let created = engine
        .apply(None, &cache("cache1", CacheSku::Premium, 1))
        .await
        .unwrap();

    let outcome = engine
        .apply(Some(created.state), &cache("cache1", CacheSku::Standard, 1))
        .await
        .unwrap();

    assert_eq!(outcome.action, Action::Replaced);
    assert_eq!(
        outcome.lifecycle,
        vec![Present, Deleting, Gone, Creating, Present]
    );
    let calls = h.remote.calls().await;
    assert_eq!(calls.deletes, 1);
    assert_eq!(calls.puts, 2);
}

#[tokio::test(start_paused = true)]
async fn test_location_change_forces_new() {
    let h = Harness::new();
    let engine = h.cache_engine();
    let created = engine
        .apply(None, &cache("cache1", CacheSku::Basic, 1))
        .await
        .unwrap();

    let mut same = cache("cache1", CacheSku::Basic, 1);
    same.location = "WestEurope".into();
    let outcome = engine.apply(Some(created.state.clone()), &same).await.unwrap();
    assert_eq!(outcome.action, Action::Unchanged);

    let mut moved = cache("cache1", CacheSku::Basic, 1);
    moved.location = "northeurope".into();
    let outcome = engine.apply(Some(created.state), &moved).await.unwrap();
    assert_eq!(outcome.action, Action::Replaced);
    assert!(outcome.changes.contains("location"));
}

#[tokio::test(start_paused = true)]
async fn test_gone_on_drift() {
    let h = Harness::new();
    let engine = h.cache_engine();
    let desired = cache("cache1", CacheSku::Basic, 1);
    let created = engine.apply(None, &desired).await.unwrap();

    h.remote.remove(&cache_resource_id("cache1")).await;

    assert!(engine.refresh(created.state.clone()).await.unwrap().is_none());
    assert!(!engine.exists(&created.state).await.unwrap());

    let recreated = engine.apply(Some(created.state), &desired).await.unwrap();
    assert_eq!(recreated.action, Action::Created);
    assert_eq!(recreated.lifecycle, vec![Present, Gone, Creating, Present]);
}

#[tokio::test(start_paused = true)]
async fn test_destroy_is_idempotent() {
    let h = Harness::new();
    let engine = h.cache_engine();
    let created = engine
        .apply(None, &cache("cache1", CacheSku::Basic, 1))
        .await
        .unwrap();

    engine.destroy(created.state.clone()).await.unwrap();
    engine.destroy(created.state).await.unwrap();
    assert!(h.remote.object(&cache_resource_id("cache1")).await.is_none());
    // The second pass finds nothing to delete.
    assert_eq!(h.remote.calls().await.deletes, 1);
}

#[tokio::test(start_paused = true)]
async fn test_import() {
    let h = Harness::new();
    let engine = h.cache_engine();

    let err = engine.import("not-an-id").await.unwrap_err();
    assert!(matches!(err, Error::Parse(ParseError::MalformedId { .. })));

    let err = engine
        .import("/subscriptions/sub1/resourceGroups/rg1/providers/Microsoft.Cache/redis/missing")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ImportNotFound { .. }), "got {err:?}");

    h.remote
        .insert(
            &cache_resource_id("existing"),
            json!({
                "location": "westeurope",
                "tags": {"team": "data"},
                "properties": {
                    "sku": {"name": "Premium", "family": "P", "capacity": 2},
                    "shardCount": 3,
                    "enableNonSslPort": false
                }
            }),
        )
        .await;
    let state = engine
        .import("/subscriptions/sub1/resourcegroups/rg1/providers/microsoft.cache/Redis/existing")
        .await
        .unwrap();

    assert_eq!(
        state.id,
        "/subscriptions/sub1/resourceGroups/rg1/providers/Microsoft.Cache/redis/existing"
    );
    let config = engine.config_of(&state).unwrap();
    assert_eq!(config.sku, CacheSku::Premium);
    assert_eq!(config.shard_count, Some(3));
    assert_eq!(config.tags.get("team").map(String::as_str), Some("data"));
}

#[tokio::test(start_paused = true)]
async fn test_old_state_is_migrated_before_refresh() {
    let h = Harness::new();
    let engine = h.cache_engine();
    let desired = cache("cache1", CacheSku::Standard, 1);
    engine.apply(None, &desired).await.unwrap();

    let v0 = ResourceState {
        schema_version: 0,
        id: "/subscriptions/sub1/resourcegroups/rg1/providers/microsoft.cache/redis/cache1".into(),
        attributes: json!({
            "name": "cache1",
            "resource_group_name": "rg1",
            "location": "westeurope",
            "sku_name": "Standard",
            "family": "C",
            "capacity": 1
        }),
    };

    let refreshed = engine.refresh(v0.clone()).await.unwrap().unwrap();
    assert_eq!(refreshed.schema_version, 2);
    assert_eq!(
        refreshed.id,
        "/subscriptions/sub1/resourceGroups/rg1/providers/Microsoft.Cache/redis/cache1"
    );

    let outcome = engine.apply(Some(v0), &desired).await.unwrap();
    assert_eq!(outcome.action, Action::Unchanged);
}

#[tokio::test(start_paused = true)]
async fn test_exists_reads_old_state() {
    let h = Harness::new();
    let engine = h.cache_engine();
    engine
        .apply(None, &cache("cache1", CacheSku::Standard, 1))
        .await
        .unwrap();

    let v0 = ResourceState {
        schema_version: 0,
        id: "/SUBSCRIPTIONS/sub1/resourcegroups/rg1/providers/microsoft.cache/Redis/cache1".into(),
        attributes: json!({
            "name": "cache1",
            "resource_group_name": "rg1",
            "location": "westeurope",
            "sku_name": "Standard",
            "family": "C",
            "capacity": 1
        }),
    };
    assert!(engine.exists(&v0).await.unwrap());

    let newer = ResourceState {
        schema_version: 9,
        ..v0
    };
    assert!(matches!(
        engine.exists(&newer).await.unwrap_err(),
        Error::Parse(ParseError::UnsupportedVersion { found: 9, .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn test_apply_waits_for_provisioning() {
    let h = Harness::new();
    h.remote.set_provisioning_reads(3).await;
    let engine = h.cache_engine();

    let created = engine
        .apply(None, &cache("cache1", CacheSku::Standard, 1))
        .await
        .unwrap();
    assert_eq!(created.action, Action::Created);
    let body = h.remote.object(&cache_resource_id("cache1")).await.unwrap();
    assert_eq!(body["properties"]["provisioningState"], "Succeeded");

    let outcome = engine
        .apply(Some(created.state), &cache("cache1", CacheSku::Standard, 2))
        .await
        .unwrap();
    assert_eq!(outcome.action, Action::Updated);
    let body = h.remote.object(&cache_resource_id("cache1")).await.unwrap();
    assert_eq!(body["properties"]["provisioningState"], "Succeeded");
    assert_eq!(body["properties"]["sku"]["capacity"], 2);
}

#[tokio::test(start_paused = true)]
async fn test_injected_cache_serializes_on_subnet() {
    let h = Harness::new().with_timeouts(Timeouts::uniform(Duration::from_secs(30)));
    let engine = h.cache_engine();
    let mut desired = cache("cache1", CacheSku::Premium, 1);
    desired.subnet_id = Some(subnet_id("redis"));

    let held = h.locks.acquire(&LockKey::named("azurerm_subnet", "redis")).await;
    let err = engine.apply(None, &desired).await.unwrap_err();
    assert!(err.is_timeout(), "got {err:?}");
    assert_eq!(h.remote.calls().await.puts, 0);

    drop(held);
    let created = engine.apply(None, &desired).await.unwrap();
    assert_eq!(created.action, Action::Created);
    let config = engine.config_of(&created.state).unwrap();
    assert_eq!(config.subnet_id, Some(subnet_id("redis")));
    assert!(h.locks.is_empty());

    let mut moved = desired.clone();
    moved.subnet_id = Some(subnet_id("other"));
    let outcome = engine.apply(Some(created.state), &moved).await.unwrap();
    assert_eq!(outcome.action, Action::Replaced);
}

#[tokio::test(start_paused = true)]
async fn test_newer_state_is_refused() {
    let engine = Harness::new().cache_engine();
    let state = ResourceState {
        schema_version: 9,
        id: cache_resource_id("cache1").to_string(),
        attributes: json!({}),
    };
    let err = engine.refresh(state).await.unwrap_err();
    assert!(matches!(
        err,
        Error::Parse(ParseError::UnsupportedVersion { found: 9, .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn test_timeout_leaves_remote_state_unknown() {
    let h = Harness::new().with_timeouts(Timeouts::uniform(Duration::from_secs(5)));
    h.remote.set_lro_polls(u32::MAX).await;
    let engine = h.cache_engine();
    let desired = cache("cache1", CacheSku::Basic, 1);

    let err = engine.apply(None, &desired).await.unwrap_err();
    assert!(err.is_timeout(), "got {err:?}");

    // The create may still land; the next pass must not blindly create again.
    let err = engine.apply(None, &desired).await.unwrap_err();
    assert!(err.is_requires_import(), "got {err:?}");
}

// ============================================================================
// NIC application security group association
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_association_create_preserves_parent() {
    let h = Harness::new();
    let nic = h.seed_nic("nic1", &[asg_id("a")]).await;
    let engine = h.association_engine();

    let created = engine.apply(None, &association("nic1", "b")).await.unwrap();
    assert_eq!(created.action, Action::Created);
    assert_eq!(created.state.id, format!("{}|{}", nic_id("nic1"), asg_id("b")));
    assert_eq!(h.nic_groups(&nic).await, vec![asg_id("a"), asg_id("b")]);

    let body = h.remote.object(&nic).await.unwrap();
    assert_eq!(body["location"], "westeurope");
    assert_eq!(body["properties"]["enableAcceleratedNetworking"], true);
    assert_eq!(
        body["properties"]["ipConfigurations"][0]["properties"]["privateIPAddress"],
        "10.0.0.4"
    );

    let puts = h.remote.calls().await.puts;
    let again = engine
        .apply(Some(created.state), &association("nic1", "b"))
        .await
        .unwrap();
    assert_eq!(again.action, Action::Unchanged);
    assert_eq!(h.remote.calls().await.puts, puts);
}

#[tokio::test(start_paused = true)]
async fn test_association_matches_ids_case_insensitively() {
    let h = Harness::new();
    let nic = h.seed_nic("nic1", &[asg_id("a").to_uppercase()]).await;
    let engine = h.association_engine();

    let err = engine.apply(None, &association("nic1", "a")).await.unwrap_err();
    assert!(err.is_requires_import(), "got {err:?}");
    assert_eq!(h.nic_groups(&nic).await.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_association_parent_must_exist() {
    let h = Harness::new();
    let err = h
        .association_engine()
        .apply(None, &association("missing", "a"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ParentNotFound { .. }), "got {err:?}");
}

#[tokio::test(start_paused = true)]
async fn test_association_gone_when_element_removed() {
    let h = Harness::new();
    h.seed_nic("nic1", &[]).await;
    let engine = h.association_engine();
    let created = engine.apply(None, &association("nic1", "a")).await.unwrap();

    // Someone else rewrote the NIC without the group.
    h.seed_nic("nic1", &[asg_id("b")]).await;
    assert!(engine.refresh(created.state).await.unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_association_delete_is_idempotent() {
    let h = Harness::new();
    let nic = h.seed_nic("nic1", &[asg_id("a")]).await;
    let engine = h.association_engine();
    let created = engine.apply(None, &association("nic1", "b")).await.unwrap();

    engine.destroy(created.state.clone()).await.unwrap();
    engine.destroy(created.state.clone()).await.unwrap();
    assert_eq!(h.nic_groups(&nic).await, vec![asg_id("a")]);

    h.remote.remove(&nic).await;
    engine.destroy(created.state).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_association_import() {
    let h = Harness::new();
    h.seed_nic("nic1", &[asg_id("a")]).await;
    let engine = h.association_engine();

    let state = engine
        .import(&format!("{}|{}", nic_id("nic1"), asg_id("a")))
        .await
        .unwrap();
    assert_eq!(engine.config_of(&state).unwrap(), association("nic1", "a"));

    let err = engine
        .import(&format!("{}|{}", nic_id("nic1"), asg_id("b")))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ImportNotFound { .. }));

    let err = engine.import(&nic_id("nic1")).await.unwrap_err();
    assert!(matches!(err, Error::Parse(_)));
}

#[tokio::test(start_paused = true)]
async fn test_association_replace_on_group_change() {
    let h = Harness::new();
    let nic = h.seed_nic("nic1", &[]).await;
    let engine = h.association_engine();
    let created = engine.apply(None, &association("nic1", "a")).await.unwrap();

    let outcome = engine
        .apply(Some(created.state), &association("nic1", "b"))
        .await
        .unwrap();
    assert_eq!(outcome.action, Action::Replaced);
    assert_eq!(h.nic_groups(&nic).await, vec![asg_id("b")]);
}
