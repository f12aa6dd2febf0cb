//! Admin API: cache maintenance and forced mutations
//!
//! Forced mutations skip the consent step but still run the structural checks.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use kinship_core::{GroupId, UserId};

use super::errors::ApiResult;
use super::family::MutationResponse;
use crate::server::KinshipServer;

/// Restrict an eviction to one group
#[derive(Debug, Default, Deserialize)]
pub struct EvictQuery {
    pub group: Option<u64>,
}

/// Recache the whole family instead of one member
#[derive(Debug, Default, Deserialize)]
pub struct RecacheQuery {
    #[serde(default)]
    pub family: bool,
}

/// Cache entries dropped locally by an eviction
#[derive(Debug, Serialize, Deserialize)]
pub struct EvictResponse {
    pub removed: usize,
}

/// Members re-read from the durable store
#[derive(Debug, Serialize, Deserialize)]
pub struct RecacheResponse {
    pub recached: usize,
}

/// Two members to partner
#[derive(Debug, Serialize, Deserialize)]
pub struct ForceUnionRequest {
    pub a: UserId,
    pub b: UserId,
}

/// Parent edge to create
#[derive(Debug, Serialize, Deserialize)]
pub struct ForceAdoptRequest {
    pub parent: UserId,
    pub child: UserId,
}

/// Member whose edge is removed
#[derive(Debug, Serialize, Deserialize)]
pub struct ForceMemberRequest {
    pub user: UserId,
}

pub async fn evict_handler(
    State(server): State<Arc<KinshipServer>>,
    Path(user): Path<u64>,
    Query(query): Query<EvictQuery>,
) -> ApiResult<Json<EvictResponse>> {
    let removed = server
        .service()
        .evict(UserId(user), query.group.map(GroupId))
        .await?;
    Ok(Json(EvictResponse { removed }))
}

pub async fn recache_handler(
    State(server): State<Arc<KinshipServer>>,
    Path((group, user)): Path<(u64, u64)>,
    Query(query): Query<RecacheQuery>,
) -> ApiResult<Json<RecacheResponse>> {
    let service = server.service();
    let recached = if query.family {
        service.recache_family(UserId(user), GroupId(group)).await?
    } else {
        service.recache(UserId(user), GroupId(group)).await?;
        1
    };

    info!(user_id = user, group_id = group, recached, "Admin recache");
    Ok(Json(RecacheResponse { recached }))
}

pub async fn force_union_handler(
    State(server): State<Arc<KinshipServer>>,
    Path(group): Path<u64>,
    Json(request): Json<ForceUnionRequest>,
) -> ApiResult<Json<MutationResponse>> {
    let updated = server
        .service()
        .force_union(request.a, request.b, GroupId(group))
        .await?;
    Ok(Json(MutationResponse { updated }))
}

pub async fn force_adopt_handler(
    State(server): State<Arc<KinshipServer>>,
    Path(group): Path<u64>,
    Json(request): Json<ForceAdoptRequest>,
) -> ApiResult<Json<MutationResponse>> {
    let updated = server
        .service()
        .force_adopt(request.parent, request.child, GroupId(group))
        .await?;
    Ok(Json(MutationResponse { updated }))
}

pub async fn force_emancipate_handler(
    State(server): State<Arc<KinshipServer>>,
    Path(group): Path<u64>,
    Json(request): Json<ForceMemberRequest>,
) -> ApiResult<Json<MutationResponse>> {
    let updated = server
        .service()
        .force_emancipate(request.user, GroupId(group))
        .await?;
    Ok(Json(MutationResponse { updated }))
}

pub async fn force_divorce_handler(
    State(server): State<Arc<KinshipServer>>,
    Path(group): Path<u64>,
    Json(request): Json<ForceMemberRequest>,
) -> ApiResult<Json<MutationResponse>> {
    let updated = server
        .service()
        .force_dissolve_union(request.user, GroupId(group))
        .await?;
    Ok(Json(MutationResponse { updated }))
}
