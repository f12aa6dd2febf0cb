//! Member queries, direct mutations and proposals

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use kinship_core::{
    GroupId, ProposalContext, ProposalKind, ProposalOutcome, ProposalRecord, ProposalReply,
    Relation, RelationshipEntity, SpanOptions, UserId,
};

use super::errors::ApiResult;
use crate::error::ServerError;
use crate::server::KinshipServer;

/// A relation plus its label from the first member's side
#[derive(Debug, Serialize, Deserialize)]
pub struct RelationResponse {
    pub relation: Relation,
    pub label: String,
}

/// Members of a span, in traversal order
#[derive(Debug, Serialize, Deserialize)]
pub struct SpanResponse {
    pub members: Vec<UserId>,
}

/// Query string for span requests
#[derive(Debug, Default, Deserialize)]
pub struct SpanQuery {
    #[serde(default)]
    pub expand_upwards: bool,
    #[serde(default)]
    pub add_parent: bool,
}

/// Request body starting a proposal
#[derive(Debug, Serialize, Deserialize)]
pub struct ProposalRequest {
    pub kind: ProposalKind,
    pub initiator: UserId,
    pub target: UserId,
    pub channel_id: u64,
}

/// Terminal state of a finished proposal
#[derive(Debug, Serialize, Deserialize)]
pub struct ProposalResponse {
    pub outcome: ProposalOutcome,
}

/// Request body answering a proposal
#[derive(Debug, Serialize, Deserialize)]
pub struct RespondRequest {
    pub channel_id: u64,
    pub reply: ProposalReply,
}

/// Entities rewritten by a mutation
#[derive(Debug, Serialize, Deserialize)]
pub struct MutationResponse {
    pub updated: Vec<RelationshipEntity>,
}

pub async fn get_member_handler(
    State(server): State<Arc<KinshipServer>>,
    Path((group, user)): Path<(u64, u64)>,
) -> ApiResult<Json<RelationshipEntity>> {
    let entity = server.service().get(UserId(user), GroupId(group)).await?;
    Ok(Json(entity))
}

pub async fn relation_handler(
    State(server): State<Arc<KinshipServer>>,
    Path((group, user, other)): Path<(u64, u64, u64)>,
) -> ApiResult<Json<RelationResponse>> {
    let relation = server
        .service()
        .relation(UserId(user), UserId(other), GroupId(group))
        .await?;
    Ok(Json(RelationResponse {
        label: relation.label(),
        relation,
    }))
}

pub async fn span_handler(
    State(server): State<Arc<KinshipServer>>,
    Path((group, user)): Path<(u64, u64)>,
    Query(query): Query<SpanQuery>,
) -> ApiResult<Json<SpanResponse>> {
    let options = SpanOptions {
        expand_upwards: query.expand_upwards,
        add_parent: query.add_parent,
    };
    let members = server
        .service()
        .span(UserId(user), GroupId(group), options)
        .await?;
    Ok(Json(SpanResponse { members }))
}

pub async fn root_handler(
    State(server): State<Arc<KinshipServer>>,
    Path((group, user)): Path<(u64, u64)>,
) -> ApiResult<impl IntoResponse> {
    let root = server.service().root(UserId(user), GroupId(group)).await?;
    Ok(Json(serde_json::json!({ "root": root })))
}

pub async fn family_size_handler(
    State(server): State<Arc<KinshipServer>>,
    Path((group, user)): Path<(u64, u64)>,
) -> ApiResult<impl IntoResponse> {
    let size = server.service().family_size(UserId(user), GroupId(group)).await?;
    Ok(Json(serde_json::json!({ "size": size })))
}

pub async fn divorce_handler(
    State(server): State<Arc<KinshipServer>>,
    Path((group, user)): Path<(u64, u64)>,
) -> ApiResult<Json<MutationResponse>> {
    let updated = server
        .service()
        .dissolve_union(UserId(user), GroupId(group))
        .await?;
    Ok(Json(MutationResponse { updated }))
}

pub async fn disown_handler(
    State(server): State<Arc<KinshipServer>>,
    Path((group, user, child)): Path<(u64, u64, u64)>,
) -> ApiResult<Json<MutationResponse>> {
    let updated = server
        .service()
        .disown(UserId(user), UserId(child), GroupId(group))
        .await?;
    Ok(Json(MutationResponse { updated }))
}

pub async fn emancipate_handler(
    State(server): State<Arc<KinshipServer>>,
    Path((group, user)): Path<(u64, u64)>,
) -> ApiResult<Json<MutationResponse>> {
    let updated = server
        .service()
        .emancipate(UserId(user), GroupId(group))
        .await?;
    Ok(Json(MutationResponse { updated }))
}

/// Start a proposal and hold the request open until it settles
pub async fn propose_handler(
    State(server): State<Arc<KinshipServer>>,
    Path(group): Path<u64>,
    Json(request): Json<ProposalRequest>,
) -> ApiResult<Json<ProposalResponse>> {
    let context = ProposalContext {
        group_id: GroupId(group),
        channel_id: request.channel_id,
    };
    info!(
        kind = request.kind.as_str(),
        initiator = %request.initiator,
        target = %request.target,
        group_id = group,
        "Proposal requested"
    );

    let service = server.service();
    let outcome = match request.kind {
        ProposalKind::Union => service.propose_union(request.initiator, request.target, context).await?,
        ProposalKind::Adoption => service.adopt(request.initiator, request.target, context).await?,
        ProposalKind::ParentRequest => {
            service.request_parent(request.initiator, request.target, context).await?
        }
    };
    Ok(Json(ProposalResponse { outcome }))
}

pub async fn lookup_proposal_handler(
    State(server): State<Arc<KinshipServer>>,
    Path(user): Path<u64>,
) -> ApiResult<Json<ProposalRecord>> {
    server
        .service()
        .lookup_proposal(UserId(user))
        .map(Json)
        .ok_or_else(|| ServerError::NotFound("Proposal".to_string()).into())
}

pub async fn respond_handler(
    State(server): State<Arc<KinshipServer>>,
    Path(user): Path<u64>,
    Json(request): Json<RespondRequest>,
) -> ApiResult<StatusCode> {
    server
        .service()
        .respond(UserId(user), request.channel_id, request.reply)?;
    Ok(StatusCode::ACCEPTED)
}

pub async fn cancel_handler(
    State(server): State<Arc<KinshipServer>>,
    Path(user): Path<u64>,
) -> ApiResult<StatusCode> {
    server.service().cancel(UserId(user))?;
    Ok(StatusCode::ACCEPTED)
}
