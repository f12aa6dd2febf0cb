//! Durable store and channel failures injected through mocks

use async_trait::async_trait;
use futures::StreamExt;
use mockall::mock;
use mockall::predicate::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use kinship_core::domain::replication::memory::MemoryReplicationHub;
use kinship_core::{
    ChannelMessage, CoreError, EntityKey, FamilyRepository, FamilyService, FamilySettings, GroupId,
    MessageStream, ReplicationChannel, ResubscribeBackoff, UserId, ENTITY_UPDATE_TOPIC,
};

mock! {
    pub Repository {}

    #[async_trait]
    impl FamilyRepository for Repository {
        async fn find_parent(&self, child: UserId, group_id: GroupId) -> Result<Option<UserId>, CoreError>;
        async fn find_children(&self, parent: UserId, group_id: GroupId) -> Result<Vec<UserId>, CoreError>;
        async fn find_partner(&self, user: UserId, group_id: GroupId) -> Result<Option<UserId>, CoreError>;
        async fn insert_parent_edge(&self, parent: UserId, child: UserId, group_id: GroupId) -> Result<(), CoreError>;
        async fn delete_parent_edge(&self, parent: UserId, child: UserId, group_id: GroupId) -> Result<(), CoreError>;
        async fn insert_partner_edge(&self, a: UserId, b: UserId, group_id: GroupId) -> Result<(), CoreError>;
        async fn delete_partner_edge(&self, a: UserId, b: UserId, group_id: GroupId) -> Result<(), CoreError>;
    }
}

mock! {
    pub Channel {}

    #[async_trait]
    impl ReplicationChannel for Channel {
        async fn publish(&self, topic: &str, payload: String) -> Result<(), CoreError>;
        async fn subscribe(&self, topics: &[String]) -> Result<MessageStream, CoreError>;
    }
}

const GROUP: GroupId = GroupId(3);

/// A repository with no rows whose reads always succeed
fn empty_repository() -> MockRepository {
    let mut repo = MockRepository::new();
    repo.expect_find_parent().returning(|_, _| Ok(None));
    repo.expect_find_children().returning(|_, _| Ok(Vec::new()));
    repo.expect_find_partner().returning(|_, _| Ok(None));
    repo
}

#[tokio::test]
async fn test_unreachable_store_never_publishes() {
    let mut repo = empty_repository();
    repo.expect_insert_parent_edge()
        .with(eq(UserId(1)), eq(UserId(2)), eq(GROUP))
        .times(1)
        .returning(|_, _, _| Err(CoreError::StateStoreError("connection refused".to_string())));

    let mut channel = MockChannel::new();
    channel.expect_publish().times(0);

    let service = FamilyService::with_repository(Arc::new(repo), Arc::new(channel), FamilySettings::default());
    let result = service.force_adopt(UserId(1), UserId(2), GROUP).await;

    assert!(matches!(result, Err(CoreError::StateStoreError(_))));
    let child = service.cache().peek(EntityKey::new(UserId(2), GROUP)).unwrap();
    assert_eq!(child.parent_id, None);
}

#[tokio::test]
async fn test_failed_conflict_fallback_is_surfaced() {
    let mut repo = empty_repository();
    repo.expect_insert_partner_edge()
        .times(1)
        .returning(|_, _, _| Err(CoreError::DurableWriteConflict("update after duplicate key failed".to_string())));

    let mut channel = MockChannel::new();
    channel.expect_publish().times(0);

    let service = FamilyService::with_repository(Arc::new(repo), Arc::new(channel), FamilySettings::default());
    let result = service.force_union(UserId(1), UserId(2), GROUP).await;

    let err = result.unwrap_err();
    assert!(matches!(err, CoreError::DurableWriteConflict(_)));
    assert!(err.is_infrastructure());
}

#[tokio::test]
async fn test_publish_happens_after_write() {
    let mut repo = empty_repository();
    repo.expect_insert_partner_edge().times(1).returning(|_, _, _| Ok(()));

    let mut channel = MockChannel::new();
    channel
        .expect_publish()
        .with(eq(ENTITY_UPDATE_TOPIC), always())
        .times(2)
        .returning(|_, _| Ok(()));

    let service = FamilyService::with_repository(Arc::new(repo), Arc::new(channel), FamilySettings::default());
    let touched = service.force_union(UserId(1), UserId(2), GROUP).await.unwrap();
    assert_eq!(touched.len(), 2);
}

#[tokio::test]
async fn test_channel_failure_reports_but_keeps_commit() {
    let mut repo = empty_repository();
    repo.expect_insert_parent_edge().times(1).returning(|_, _, _| Ok(()));

    let mut channel = MockChannel::new();
    channel
        .expect_publish()
        .returning(|_, _| Err(CoreError::ReplicationError("broker gone".to_string())));

    let service = FamilyService::with_repository(Arc::new(repo), Arc::new(channel), FamilySettings::default());
    let result = service.force_adopt(UserId(1), UserId(2), GROUP).await;

    assert!(matches!(result, Err(CoreError::ReplicationError(_))));
    let child = service.cache().peek(EntityKey::new(UserId(2), GROUP)).unwrap();
    assert_eq!(child.parent_id, Some(UserId(1)));
}

#[tokio::test]
async fn test_seed_failure_is_not_cached() {
    let mut repo = MockRepository::new();
    let mut calls = 0;
    repo.expect_find_parent().returning(move |_, _| {
        calls += 1;
        if calls == 1 {
            Err(CoreError::StateStoreError("timeout".to_string()))
        } else {
            Ok(Some(UserId(9)))
        }
    });
    repo.expect_find_children().returning(|_, _| Ok(Vec::new()));
    repo.expect_find_partner().returning(|_, _| Ok(None));

    let service = FamilyService::with_repository(
        Arc::new(repo),
        Arc::new(MemoryReplicationHub::new()),
        FamilySettings::default(),
    );

    assert!(service.get(UserId(2), GROUP).await.is_err());
    assert!(!service.cache().contains(EntityKey::new(UserId(2), GROUP)));
    assert_eq!(service.get(UserId(2), GROUP).await.unwrap().parent_id, Some(UserId(9)));
}

#[tokio::test]
async fn test_lost_subscription_is_restored_with_a_cleared_cache() {
    let subscriptions = Arc::new(AtomicUsize::new(0));
    let mut channel = MockChannel::new();
    {
        let subscriptions = Arc::clone(&subscriptions);
        channel.expect_subscribe().returning(move |_| {
            if subscriptions.fetch_add(1, Ordering::SeqCst) == 0 {
                // First connection delivers one snapshot, then drops
                let update = ChannelMessage {
                    topic: ENTITY_UPDATE_TOPIC.to_string(),
                    payload: r#"{"id":4,"group_id":3,"parent_id":1,"children":[],"partner_id":null}"#.to_string(),
                };
                Ok(futures::stream::iter(vec![update]).boxed())
            } else {
                Ok(futures::stream::pending::<ChannelMessage>().boxed())
            }
        });
    }

    let service = FamilyService::with_repository(Arc::new(empty_repository()), Arc::new(channel), FamilySettings::default());
    let supervisor = Arc::clone(service.replicator()).supervise(ResubscribeBackoff {
        initial_delay: Duration::from_millis(10),
        multiplier: 2.0,
        max_delay: Duration::from_millis(50),
    });

    let mut restored = false;
    for _ in 0..100 {
        if subscriptions.load(Ordering::SeqCst) >= 2 && service.replicator().is_live() {
            restored = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    supervisor.abort();

    assert!(restored, "subscription was not re-established");
    assert!(!service.cache().contains(EntityKey::new(UserId(4), GROUP)));
    assert_eq!(service.get(UserId(4), GROUP).await.unwrap().parent_id, None);
}

#[tokio::test]
async fn test_subscribe_failures_are_retried() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let mut channel = MockChannel::new();
    {
        let attempts = Arc::clone(&attempts);
        channel.expect_subscribe().returning(move |_| {
            if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(CoreError::ReplicationError("connection refused".to_string()))
            } else {
                Ok(futures::stream::pending::<ChannelMessage>().boxed())
            }
        });
    }

    let service = FamilyService::with_repository(Arc::new(empty_repository()), Arc::new(channel), FamilySettings::default());
    assert!(!service.replicator().is_live());
    let supervisor = Arc::clone(service.replicator()).supervise(ResubscribeBackoff {
        initial_delay: Duration::from_millis(5),
        multiplier: 1.0,
        max_delay: Duration::from_millis(5),
    });

    let mut live = false;
    for _ in 0..100 {
        if service.replicator().is_live() {
            live = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    supervisor.abort();
    assert!(supervisor.await.unwrap_err().is_cancelled());

    assert!(live);
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert!(!service.replicator().is_live());
}
