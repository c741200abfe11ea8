//! Notification rule CRUD API (management).
//!
//! - POST /v1/rules - create a rule, returns its webhook URL
//! - GET /v1/rules - list rules
//! - GET /v1/rules/:id - get a rule
//! - PATCH /v1/rules/:id - update name, target, or active flag
//! - DELETE /v1/rules/:id - delete a rule

use super::ApiError;
use crate::db::{NewRule, Rule, RuleUpdate};
use crate::server::AppState;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::{delete, get, patch, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/rules", post(create_rule_handler))
        .route("/v1/rules", get(list_rules_handler))
        .route("/v1/rules/:id", get(get_rule_handler))
        .route("/v1/rules/:id", patch(update_rule_handler))
        .route("/v1/rules/:id", delete(delete_rule_handler))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRuleRequest {
    pub rule_name: String,
    pub target_id: String,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct UpdateRuleRequest {
    pub rule_name: Option<String>,
    pub target_id: Option<String>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleResponse {
    pub id: String,
    pub rule_name: String,
    pub target_id: String,
    pub webhook_token: String,
    /// Ready-to-paste webhook URL for the sender's configuration.
    pub webhook_url: String,
    pub is_active: bool,
    pub created_at: String,
    pub updated_at: String,
}

impl RuleResponse {
    fn from_rule(rule: Rule, state: &AppState) -> Self {
        let webhook_url = state.config.webhook_url(&rule.webhook_token);
        Self {
            id: rule.id,
            rule_name: rule.rule_name,
            target_id: rule.target_id,
            webhook_token: rule.webhook_token,
            webhook_url,
            is_active: rule.is_active,
            created_at: rule.created_at,
            updated_at: rule.updated_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ListRulesResponse {
    pub rules: Vec<RuleResponse>,
    pub total: usize,
}

/// POST /v1/rules
async fn create_rule_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateRuleRequest>,
) -> Result<(StatusCode, Json<RuleResponse>), ApiError> {
    if request.rule_name.trim().is_empty() {
        return Err(ApiError::InvalidInput("ruleName must not be empty".into()));
    }
    if request.target_id.trim().is_empty() {
        return Err(ApiError::InvalidInput("targetId must not be empty".into()));
    }

    let rule = state
        .rules
        .create(NewRule {
            rule_name: request.rule_name.trim().to_string(),
            target_id: request.target_id.trim().to_string(),
        })
        .await?;

    info!(rule_name = %rule.rule_name, rule_id = %rule.id, "rule created");
    Ok((
        StatusCode::CREATED,
        Json(RuleResponse::from_rule(rule, &state)),
    ))
}

/// GET /v1/rules
async fn list_rules_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ListRulesResponse>, ApiError> {
    let rules = state.rules.list().await?;
    let rules: Vec<RuleResponse> = rules
        .into_iter()
        .map(|rule| RuleResponse::from_rule(rule, &state))
        .collect();
    let total = rules.len();
    Ok(Json(ListRulesResponse { rules, total }))
}

/// GET /v1/rules/:id
async fn get_rule_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<RuleResponse>, ApiError> {
    let rule = state
        .rules
        .get(&id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("no rule with id {id}")))?;
    Ok(Json(RuleResponse::from_rule(rule, &state)))
}

/// PATCH /v1/rules/:id
async fn update_rule_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(request): Json<UpdateRuleRequest>,
) -> Result<Json<RuleResponse>, ApiError> {
    if matches!(&request.rule_name, Some(name) if name.trim().is_empty()) {
        return Err(ApiError::InvalidInput("ruleName must not be empty".into()));
    }
    if matches!(&request.target_id, Some(target) if target.trim().is_empty()) {
        return Err(ApiError::InvalidInput("targetId must not be empty".into()));
    }

    let update = RuleUpdate {
        rule_name: request.rule_name,
        target_id: request.target_id,
        is_active: request.is_active,
    };

    let rule = state
        .rules
        .update(&id, update)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("no rule with id {id}")))?;

    info!(rule_id = %rule.id, "rule updated");
    Ok(Json(RuleResponse::from_rule(rule, &state)))
}

/// DELETE /v1/rules/:id
async fn delete_rule_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    if state.rules.delete(&id).await? {
        info!(rule_id = %id, "rule deleted");
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("no rule with id {id}")))
    }
}
