//! Several processes sharing one durable store and one replication channel

use std::sync::Arc;
use std::time::Duration;

use kinship_core::domain::replication::memory::MemoryReplicationHub;
use kinship_core::domain::repository::memory::MemoryFamilyRepository;
use kinship_core::{
    CoreError, EntityKey, EntityUpdate, FamilyRepository, FamilyService, FamilySettings, GroupId,
    RelationshipEntity, ReplicationChannel, UserId, ENTITY_UPDATE_TOPIC,
};
use tokio::task::JoinHandle;

const GROUP: GroupId = GroupId(42);
const PARENT: UserId = UserId(100);
const CHILD: UserId = UserId(200);

struct Process {
    service: Arc<FamilyService>,
    _subscriber: JoinHandle<usize>,
}

async fn start_process(repo: &MemoryFamilyRepository, hub: &MemoryReplicationHub) -> Result<Process, CoreError> {
    let service = Arc::new(FamilyService::with_repository(
        Arc::new(repo.clone()),
        Arc::new(hub.clone()),
        FamilySettings::default(),
    ));
    let subscriber = service.replicator().clone().spawn().await?;
    Ok(Process {
        service,
        _subscriber: subscriber,
    })
}

/// Poll the process's cache until `check` holds for the cached entity
async fn eventually<F>(process: &Process, user_id: UserId, check: F) -> RelationshipEntity
where
    F: Fn(&RelationshipEntity) -> bool,
{
    let key = EntityKey::new(user_id, GROUP);
    for _ in 0..200 {
        if let Some(entity) = process.service.cache().peek(key) {
            if check(&entity) {
                return entity;
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("entity {} never converged", key);
}

#[tokio::test]
async fn test_committed_edge_reaches_other_process() -> Result<(), CoreError> {
    let repo = MemoryFamilyRepository::new();
    let hub = MemoryReplicationHub::new();
    let a = start_process(&repo, &hub).await?;
    let b = start_process(&repo, &hub).await?;

    // B caches the old, empty state first
    assert!(b.service.get(CHILD, GROUP).await?.is_empty());

    a.service.force_adopt(PARENT, CHILD, GROUP).await?;
    assert_eq!(a.service.get(CHILD, GROUP).await?.parent_id, Some(PARENT));

    let published: Vec<EntityUpdate> = hub
        .published()
        .iter()
        .filter(|message| message.topic == ENTITY_UPDATE_TOPIC)
        .map(|message| serde_json::from_str(&message.payload))
        .collect::<Result<_, _>>()?;
    assert!(published.iter().any(|update| update.id == CHILD && update.parent_id == Some(PARENT)));
    assert!(published.iter().any(|update| update.id == PARENT && update.children == vec![CHILD]));

    let child = eventually(&b, CHILD, |entity| entity.parent_id == Some(PARENT)).await;
    assert_eq!(child.group_id, GROUP);
    eventually(&b, PARENT, |entity| entity.children.contains(&CHILD)).await;
    Ok(())
}

#[tokio::test]
async fn test_eviction_forces_reseed_elsewhere() -> Result<(), CoreError> {
    let repo = MemoryFamilyRepository::new();
    let hub = MemoryReplicationHub::new();
    let a = start_process(&repo, &hub).await?;
    let b = start_process(&repo, &hub).await?;

    b.service.get(CHILD, GROUP).await?;

    // Written behind every cache's back
    repo.insert_parent_edge(PARENT, CHILD, GROUP).await?;
    assert_eq!(b.service.get(CHILD, GROUP).await?.parent_id, None);

    a.service.evict(CHILD, Some(GROUP)).await?;

    let key = EntityKey::new(CHILD, GROUP);
    for _ in 0..200 {
        if !b.service.cache().contains(key) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(!b.service.cache().contains(key));
    assert_eq!(b.service.get(CHILD, GROUP).await?.parent_id, Some(PARENT));
    Ok(())
}

#[tokio::test]
async fn test_subscriber_survives_malformed_messages() -> Result<(), CoreError> {
    let repo = MemoryFamilyRepository::new();
    let hub = MemoryReplicationHub::new();
    let b = start_process(&repo, &hub).await?;

    hub.publish(ENTITY_UPDATE_TOPIC, "{\"id\":".to_string()).await?;
    hub.publish(ENTITY_UPDATE_TOPIC, "{\"unexpected\":true}".to_string()).await?;
    hub.publish(
        ENTITY_UPDATE_TOPIC,
        serde_json::to_string(&EntityUpdate {
            id: CHILD,
            group_id: GROUP,
            parent_id: Some(PARENT),
            children: vec![],
            partner_id: None,
        })?,
    )
    .await?;

    eventually(&b, CHILD, |entity| entity.parent_id == Some(PARENT)).await;
    Ok(())
}

#[tokio::test]
async fn test_last_writer_wins_across_processes() -> Result<(), CoreError> {
    let repo = MemoryFamilyRepository::new();
    let hub = MemoryReplicationHub::new();
    let a = start_process(&repo, &hub).await?;
    let b = start_process(&repo, &hub).await?;

    a.service.force_union(UserId(1), UserId(2), GROUP).await?;
    eventually(&b, UserId(1), |entity| entity.partner_id == Some(UserId(2))).await;

    b.service.dissolve_union(UserId(2), GROUP).await?;
    eventually(&a, UserId(1), |entity| entity.partner_id.is_none()).await;
    eventually(&a, UserId(2), |entity| entity.partner_id.is_none()).await;
    assert_eq!(repo.find_partner(UserId(1), GROUP).await?, None);
    Ok(())
}
