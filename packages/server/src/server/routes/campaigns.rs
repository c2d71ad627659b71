//! Campaign REST surface.

use axum::extract::{Extension, Path, Query};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::common::phone::validate_e164;
use crate::common::{CampaignId, CoreError, CoreResult, PageParams};
use crate::domains::campaigns::models::{
    CallLog, Campaign, CampaignContact, CampaignStatus, ContactStatus, NewContact, PriorityMode,
};
use crate::domains::campaigns::models::campaign::NewCampaign;
use crate::kernel::ServerDeps;
use crate::server::middleware::AuthUser;

const CREATE_LIMIT_MAX: i32 = 50;
const LIVE_LIMIT_MAX: i32 = 100;

fn parse_campaign_id(raw: &str) -> CoreResult<CampaignId> {
    raw.parse()
        .map_err(|_| CoreError::Validation(format!("'{}' is not a valid campaign id", raw)))
}

// =============================================================================
// Create / list / get / patch / delete
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateCampaignBody {
    pub name: String,
    #[serde(default)]
    pub agent_id: Option<Uuid>,
    #[serde(default)]
    pub concurrent_calls_limit: Option<i32>,
    #[serde(default)]
    pub priority_mode: Option<PriorityMode>,
    #[serde(default)]
    pub exclude_voicemail: Option<bool>,
    #[serde(default)]
    pub max_retry_attempts: Option<i32>,
    #[serde(default)]
    pub retry_delay_minutes: Option<i32>,
    #[serde(default)]
    pub business_hours_only: Option<bool>,
}

pub async fn create_campaign(
    Extension(deps): Extension<ServerDeps>,
    Extension(auth): Extension<AuthUser>,
    Json(body): Json<CreateCampaignBody>,
) -> CoreResult<(StatusCode, Json<Campaign>)> {
    if body.name.trim().is_empty() {
        return Err(CoreError::Validation("name must not be empty".to_string()));
    }
    let limit = body.concurrent_calls_limit.unwrap_or(1);
    if !(1..=CREATE_LIMIT_MAX).contains(&limit) {
        return Err(CoreError::Validation(format!(
            "concurrentCallsLimit must be between 1 and {}",
            CREATE_LIMIT_MAX
        )));
    }
    let max_retry_attempts = body.max_retry_attempts.unwrap_or(3);
    if !(0..=10).contains(&max_retry_attempts) {
        return Err(CoreError::Validation(
            "maxRetryAttempts must be between 0 and 10".to_string(),
        ));
    }

    let campaign = Campaign::create(
        NewCampaign {
            user_id: auth.user_id,
            agent_id: body.agent_id,
            name: body.name.trim().to_string(),
            concurrent_calls_limit: limit,
            priority_mode: body.priority_mode.unwrap_or(PriorityMode::Fifo),
            exclude_voicemail: body.exclude_voicemail.unwrap_or(false),
            max_retry_attempts,
            retry_delay_minutes: body.retry_delay_minutes.unwrap_or(30).max(1),
            business_hours_only: body.business_hours_only.unwrap_or(false),
        },
        &deps.db_pool,
    )
    .await?;
    Ok((StatusCode::CREATED, Json(campaign)))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListCampaignsQuery {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub agent_id: Option<Uuid>,
    #[serde(default)]
    pub search: Option<String>,
    #[serde(default)]
    pub page: Option<i64>,
    #[serde(default)]
    pub limit: Option<i64>,
}

impl ListCampaignsQuery {
    fn page_params(&self) -> PageParams {
        PageParams {
            page: self.page,
            limit: self.limit,
        }
    }
}

pub async fn list_campaigns(
    Extension(deps): Extension<ServerDeps>,
    Extension(auth): Extension<AuthUser>,
    Query(query): Query<ListCampaignsQuery>,
) -> CoreResult<Json<Vec<Campaign>>> {
    let status = match query.status.as_deref() {
        Some(raw) => Some(
            raw.parse::<CampaignStatus>()
                .map_err(|_| CoreError::Validation(format!("unknown status '{}'", raw)))?,
        ),
        None => None,
    };
    let campaigns = Campaign::list_owned(
        auth.user_id,
        status,
        query.agent_id,
        query.search.as_deref(),
        &query.page_params(),
        &deps.db_pool,
    )
    .await?;
    Ok(Json(campaigns))
}

pub async fn get_campaign(
    Extension(deps): Extension<ServerDeps>,
    Extension(auth): Extension<AuthUser>,
    Path(id): Path<String>,
) -> CoreResult<Json<Campaign>> {
    let id = parse_campaign_id(&id)?;
    let campaign = Campaign::find_owned(id, auth.user_id, &deps.db_pool).await?;
    Ok(Json(campaign))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchCampaignBody {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub exclude_voicemail: Option<bool>,
    #[serde(default)]
    pub max_retry_attempts: Option<i32>,
    #[serde(default)]
    pub retry_delay_minutes: Option<i32>,
    #[serde(default)]
    pub priority_mode: Option<PriorityMode>,
}

pub async fn patch_campaign(
    Extension(deps): Extension<ServerDeps>,
    Extension(auth): Extension<AuthUser>,
    Path(id): Path<String>,
    Json(body): Json<PatchCampaignBody>,
) -> CoreResult<Json<Campaign>> {
    let id = parse_campaign_id(&id)?;
    let campaign = Campaign::find_owned(id, auth.user_id, &deps.db_pool).await?;
    if let Some(name) = &body.name {
        if name.trim().is_empty() {
            return Err(CoreError::Validation("name must not be empty".to_string()));
        }
    }
    if let Some(attempts) = body.max_retry_attempts {
        if !(0..=10).contains(&attempts) {
            return Err(CoreError::Validation(
                "maxRetryAttempts must be between 0 and 10".to_string(),
            ));
        }
    }
    let updated = Campaign::update_settings(
        campaign.id,
        body.name.as_deref().map(str::trim),
        body.exclude_voicemail,
        body.max_retry_attempts,
        body.retry_delay_minutes,
        body.priority_mode,
        &deps.db_pool,
    )
    .await?;
    Ok(Json(updated))
}

pub async fn delete_campaign(
    Extension(deps): Extension<ServerDeps>,
    Extension(auth): Extension<AuthUser>,
    Path(id): Path<String>,
) -> CoreResult<StatusCode> {
    let id = parse_campaign_id(&id)?;
    let campaign = Campaign::find_owned(id, auth.user_id, &deps.db_pool).await?;
    deps.lifecycle.delete(&campaign).await?;
    Ok(StatusCode::NO_CONTENT)
}

// =============================================================================
// Contacts / calls / stats
// =============================================================================

pub async fn add_contacts(
    Extension(deps): Extension<ServerDeps>,
    Extension(auth): Extension<AuthUser>,
    Path(id): Path<String>,
    Json(contacts): Json<Vec<NewContact>>,
) -> CoreResult<(StatusCode, Json<serde_json::Value>)> {
    let id = parse_campaign_id(&id)?;
    let campaign = Campaign::find_owned(id, auth.user_id, &deps.db_pool).await?;
    if campaign.status().is_terminal() {
        return Err(CoreError::Conflict(
            "cannot add contacts to a finished campaign".to_string(),
        ));
    }
    if contacts.is_empty() {
        return Err(CoreError::Validation("contacts array is empty".to_string()));
    }
    for contact in &contacts {
        validate_e164(&contact.phone_number)?;
    }

    let inserted = CampaignContact::insert_batch(campaign.id, &contacts, &deps.db_pool).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "inserted": inserted.len(),
            "skipped": contacts.len() - inserted.len(),
        })),
    ))
}

#[derive(Debug, Deserialize)]
pub struct ListContactsQuery {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub page: Option<i64>,
    #[serde(default)]
    pub limit: Option<i64>,
}

pub async fn list_contacts(
    Extension(deps): Extension<ServerDeps>,
    Extension(auth): Extension<AuthUser>,
    Path(id): Path<String>,
    Query(query): Query<ListContactsQuery>,
) -> CoreResult<Json<Vec<CampaignContact>>> {
    let id = parse_campaign_id(&id)?;
    let campaign = Campaign::find_owned(id, auth.user_id, &deps.db_pool).await?;
    let status = match query.status.as_deref() {
        Some(raw) => Some(
            raw.parse::<ContactStatus>()
                .map_err(|_| CoreError::Validation(format!("unknown status '{}'", raw)))?,
        ),
        None => None,
    };
    let page = PageParams {
        page: query.page,
        limit: query.limit,
    };
    let contacts =
        CampaignContact::list_for_campaign(campaign.id, status, &page, &deps.db_pool).await?;
    Ok(Json(contacts))
}

pub async fn list_calls(
    Extension(deps): Extension<ServerDeps>,
    Extension(auth): Extension<AuthUser>,
    Path(id): Path<String>,
    Query(page): Query<PageParams>,
) -> CoreResult<Json<Vec<CallLog>>> {
    let id = parse_campaign_id(&id)?;
    let campaign = Campaign::find_owned(id, auth.user_id, &deps.db_pool).await?;
    let calls = CallLog::list_for_campaign(campaign.id, &page, &deps.db_pool).await?;
    Ok(Json(calls))
}

pub async fn campaign_stats(
    Extension(deps): Extension<ServerDeps>,
    Extension(auth): Extension<AuthUser>,
    Path(id): Path<String>,
) -> CoreResult<Json<serde_json::Value>> {
    let id = parse_campaign_id(&id)?;
    let campaign = Campaign::find_owned(id, auth.user_id, &deps.db_pool).await?;
    let stats = Campaign::stats(campaign.id, &deps.db_pool).await?;
    let snapshot = deps.tracker.snapshot(campaign.id).await.unwrap_or_default();
    Ok(Json(json!({
        "contacts": stats,
        "activeCalls": snapshot.active,
        "pendingReservations": snapshot.reserved + snapshot.predial,
        "concurrencyLimit": campaign.concurrent_calls_limit,
    })))
}

pub async fn campaign_progress(
    Extension(deps): Extension<ServerDeps>,
    Extension(auth): Extension<AuthUser>,
    Path(id): Path<String>,
) -> CoreResult<Json<serde_json::Value>> {
    let id = parse_campaign_id(&id)?;
    let campaign = Campaign::find_owned(id, auth.user_id, &deps.db_pool).await?;
    let stats = Campaign::stats(campaign.id, &deps.db_pool).await?;
    Ok(Json(json!({
        "status": campaign.status,
        "totalContacts": stats.total_contacts,
        "finished": stats.terminal(),
        "percentComplete": stats.percent_complete(),
    })))
}

// =============================================================================
// Lifecycle operations
// =============================================================================

pub async fn start_campaign(
    Extension(deps): Extension<ServerDeps>,
    Extension(auth): Extension<AuthUser>,
    Path(id): Path<String>,
) -> CoreResult<Json<Campaign>> {
    let id = parse_campaign_id(&id)?;
    let campaign = Campaign::find_owned(id, auth.user_id, &deps.db_pool).await?;
    Ok(Json(deps.lifecycle.start(&campaign).await?))
}

pub async fn pause_campaign(
    Extension(deps): Extension<ServerDeps>,
    Extension(auth): Extension<AuthUser>,
    Path(id): Path<String>,
) -> CoreResult<Json<Campaign>> {
    let id = parse_campaign_id(&id)?;
    let campaign = Campaign::find_owned(id, auth.user_id, &deps.db_pool).await?;
    Ok(Json(deps.lifecycle.pause(&campaign).await?))
}

pub async fn resume_campaign(
    Extension(deps): Extension<ServerDeps>,
    Extension(auth): Extension<AuthUser>,
    Path(id): Path<String>,
) -> CoreResult<Json<Campaign>> {
    let id = parse_campaign_id(&id)?;
    let campaign = Campaign::find_owned(id, auth.user_id, &deps.db_pool).await?;
    Ok(Json(deps.lifecycle.resume(&campaign).await?))
}

pub async fn cancel_campaign(
    Extension(deps): Extension<ServerDeps>,
    Extension(auth): Extension<AuthUser>,
    Path(id): Path<String>,
) -> CoreResult<Json<Campaign>> {
    let id = parse_campaign_id(&id)?;
    let campaign = Campaign::find_owned(id, auth.user_id, &deps.db_pool).await?;
    Ok(Json(deps.lifecycle.cancel(&campaign).await?))
}

pub async fn retry_campaign(
    Extension(deps): Extension<ServerDeps>,
    Extension(auth): Extension<AuthUser>,
    Path(id): Path<String>,
) -> CoreResult<Json<serde_json::Value>> {
    let id = parse_campaign_id(&id)?;
    let campaign = Campaign::find_owned(id, auth.user_id, &deps.db_pool).await?;
    let scheduled = deps.lifecycle.retry_failed(&campaign).await?;
    Ok(Json(json!({ "retriesScheduled": scheduled })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConcurrentLimitBody {
    pub concurrent_calls_limit: i32,
}

pub async fn update_concurrent_limit(
    Extension(deps): Extension<ServerDeps>,
    Extension(auth): Extension<AuthUser>,
    Path(id): Path<String>,
    Json(body): Json<ConcurrentLimitBody>,
) -> CoreResult<Json<Campaign>> {
    let id = parse_campaign_id(&id)?;
    if !(1..=LIVE_LIMIT_MAX).contains(&body.concurrent_calls_limit) {
        return Err(CoreError::Validation(format!(
            "concurrentCallsLimit must be between 1 and {}",
            LIVE_LIMIT_MAX
        )));
    }
    let campaign = Campaign::find_owned(id, auth.user_id, &deps.db_pool).await?;
    Ok(Json(
        deps.lifecycle
            .update_limit(&campaign, body.concurrent_calls_limit)
            .await?,
    ))
}

pub async fn purge_campaign(
    Extension(deps): Extension<ServerDeps>,
    Extension(auth): Extension<AuthUser>,
    Path(id): Path<String>,
) -> CoreResult<Json<serde_json::Value>> {
    let id = parse_campaign_id(&id)?;
    let campaign = Campaign::find_owned(id, auth.user_id, &deps.db_pool).await?;
    deps.lifecycle.purge(&campaign).await?;
    Ok(Json(json!({ "purged": true })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_campaign_id_rejects_non_uuid() {
        assert!(parse_campaign_id("not-a-uuid").is_err());
        assert!(parse_campaign_id("5f2b8c9d1a3e4f5061728394").is_err());
        let id = CampaignId::new();
        assert_eq!(parse_campaign_id(&id.to_string()).unwrap(), id);
    }

    #[test]
    fn test_create_body_accepts_minimal_payload() {
        let body: CreateCampaignBody =
            serde_json::from_value(json!({ "name": "Spring outreach" })).unwrap();
        assert_eq!(body.name, "Spring outreach");
        assert!(body.concurrent_calls_limit.is_none());
        assert!(body.priority_mode.is_none());
    }

    #[test]
    fn test_limit_bounds() {
        assert!((1..=CREATE_LIMIT_MAX).contains(&1));
        assert!(!(1..=CREATE_LIMIT_MAX).contains(&51));
        assert!((1..=LIVE_LIMIT_MAX).contains(&100));
        assert!(!(1..=LIVE_LIMIT_MAX).contains(&0));
    }
}
