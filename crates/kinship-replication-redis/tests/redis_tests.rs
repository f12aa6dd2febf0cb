//! Tests against a live Redis server
//!
//! Run with `REDIS_URL=redis://... cargo test -- --ignored`

use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;

use kinship_core::domain::repository::memory::MemoryFamilyRepository;
use kinship_core::{
    CoreError, EntityKey, FamilyService, FamilySettings, GroupId, ReplicationChannel, UserId,
    ENTITY_UPDATE_TOPIC,
};
use kinship_replication_redis::{RedisChannelConfig, RedisReplicationChannel};

fn config() -> RedisChannelConfig {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
    RedisChannelConfig {
        prefix: format!("kinship-test-{}:", std::process::id()),
        ..RedisChannelConfig::new(url)
    }
}

#[tokio::test]
#[ignore]
async fn test_publish_reaches_subscriber() -> Result<(), CoreError> {
    let channel = RedisReplicationChannel::connect(&config()).await?;
    assert!(channel.health_check().await?);

    let mut stream = channel.subscribe(&[ENTITY_UPDATE_TOPIC.to_string()]).await?;
    channel.publish(ENTITY_UPDATE_TOPIC, "{\"id\":1}".to_string()).await?;

    let message = tokio::time::timeout(Duration::from_secs(2), stream.next())
        .await
        .expect("message should arrive")
        .expect("stream should stay open");
    assert_eq!(message.topic, ENTITY_UPDATE_TOPIC);
    assert_eq!(message.payload, "{\"id\":1}");
    Ok(())
}

#[tokio::test]
#[ignore]
async fn test_two_services_converge_over_redis() -> Result<(), CoreError> {
    let repo = MemoryFamilyRepository::new();
    let a = FamilyService::with_repository(
        Arc::new(repo.clone()),
        Arc::new(RedisReplicationChannel::connect(&config()).await?),
        FamilySettings::default(),
    );
    let b = FamilyService::with_repository(
        Arc::new(repo.clone()),
        Arc::new(RedisReplicationChannel::connect(&config()).await?),
        FamilySettings::default(),
    );
    let _subscriber = b.replicator().clone().spawn().await?;

    a.force_union(UserId(1), UserId(2), GroupId(5)).await?;

    let key = EntityKey::new(UserId(2), GroupId(5));
    for _ in 0..100 {
        if b.cache().peek(key).and_then(|entity| entity.partner_id) == Some(UserId(1)) {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("union never reached the second service");
}
