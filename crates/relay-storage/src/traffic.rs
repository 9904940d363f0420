#![allow(clippy::needless_update)]

use sea_orm::entity::prelude::*;
use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{
    ActiveValue, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, FromQueryResult,
    PaginatorTrait, QueryFilter, QueryOrder, QuerySelect, Schema,
};
use sea_orm::ExprTrait;
use time::OffsetDateTime;

use crate::entities;
use crate::db::connect_shared;
pub use relay_provider_core::{DownstreamTrafficEvent, UpstreamTrafficEvent};
use relay_common::{GlobalModelPricing, PricingTier};
use relay_provider_core::{BillingSnapshot, compute_billing, usage_dimensions};
use serde::{Deserialize, Serialize};


#[derive(Debug, Clone)]
pub struct AdminProviderInput {
    pub id: Option<i64>,
    pub name: String,
    pub config_json: Json,
    pub enabled: bool,
}

#[derive(Debug, Clone)]
pub struct AdminCredentialInput {
    pub id: Option<i64>,
    pub provider_id: i64,
    pub name: Option<String>,
    pub secret: Json,
    pub meta_json: Json,
    pub weight: i32,
    pub enabled: bool,
}

#[derive(Debug, Clone)]
pub struct AdminDisallowInput {
    pub credential_id: i64,
    pub scope_kind: String,
    pub scope_value: Option<String>,
    pub level: String,
    pub until_at: Option<OffsetDateTime>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AdminUserInput {
    pub id: Option<i64>,
    pub name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AdminKeyInput {
    pub id: Option<i64>,
    pub user_id: i64,
    pub key_value: String,
    pub label: Option<String>,
    pub enabled: bool,
}

#[derive(Debug, Clone)]
pub struct AdminGlobalModelInput {
    pub id: Option<i64>,
    pub name: String,
    pub tiered_pricing_json: Json,
}

/// Billing knobs stored in `credentials.settings` (spec §3 `Endpoint`/`Key`
/// rate overrides). Unknown keys are ignored; missing keys take the default.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CredentialBillingSettings {
    #[serde(default = "default_rate_multiplier")]
    rate_multiplier: f64,
    #[serde(default)]
    is_free_tier: bool,
}

impl Default for CredentialBillingSettings {
    fn default() -> Self {
        Self {
            rate_multiplier: default_rate_multiplier(),
            is_free_tier: false,
        }
    }
}

fn default_rate_multiplier() -> f64 {
    1.0
}

/// Terminal status for a finished attempt. `streaming` (the interim state
/// between `pending` and one of these) is set directly by
/// [`TrafficStorage::insert_upstream_streaming`], not by this function.
fn request_status_for(response_status: i32, cancelled: bool) -> &'static str {
    if cancelled {
        "cancelled"
    } else if (200..400).contains(&response_status) {
        "completed"
    } else {
        "failed"
    }
}

#[derive(Clone)]
pub struct TrafficStorage {
    db: DatabaseConnection,
}

#[derive(Debug, Clone, Default, FromQueryResult)]
pub struct UpstreamUsageAggregate {
    pub count: Option<i64>,
    pub claude_input_tokens: Option<i64>,
    pub claude_output_tokens: Option<i64>,
    pub claude_total_tokens: Option<i64>,
    pub claude_cache_creation_input_tokens: Option<i64>,
    pub claude_cache_read_input_tokens: Option<i64>,
    pub gemini_prompt_tokens: Option<i64>,
    pub gemini_candidates_tokens: Option<i64>,
    pub gemini_total_tokens: Option<i64>,
    pub gemini_cached_tokens: Option<i64>,
    pub openai_chat_prompt_tokens: Option<i64>,
    pub openai_chat_completion_tokens: Option<i64>,
    pub openai_chat_total_tokens: Option<i64>,
    pub openai_responses_input_tokens: Option<i64>,
    pub openai_responses_output_tokens: Option<i64>,
    pub openai_responses_total_tokens: Option<i64>,
    pub openai_responses_input_cached_tokens: Option<i64>,
    pub openai_responses_output_reasoning_tokens: Option<i64>,
}

impl TrafficStorage {
    pub async fn connect(database_url: &str) -> Result<Self, DbErr> {
        let db = connect_shared(database_url).await?;
        Ok(Self { db })
    }

    pub async fn from_connection(db: DatabaseConnection) -> Result<Self, DbErr> {
        Ok(Self { db })
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }

    pub async fn sync(&self) -> Result<(), DbErr> {
        Schema::new(self.db.get_database_backend())
            .builder()
            .register(entities::Users)
            .register(entities::ApiKeys)
            .register(entities::Providers)
            .register(entities::Credentials)
            .register(entities::CredentialDisallow)
            .register(entities::GlobalConfig)
            .register(entities::DownstreamTraffic)
            .register(entities::UpstreamTraffic)
            .register(entities::GlobalModels)
            .register(entities::MonthlyUsage)
            .sync(&self.db)
            .await
    }

    pub async fn ensure_providers(
        &self,
        defaults: &[AdminProviderInput],
    ) -> Result<(), DbErr> {
        let existing = self.list_providers().await?;
        let mut existing_names = std::collections::HashSet::new();
        for provider in existing {
            existing_names.insert(provider.name);
        }

        for default in defaults {
            if existing_names.contains(&default.name) {
                continue;
            }
            let mut input = default.clone();
            input.id = None;
            let _ = self.upsert_provider(input).await?;
        }

        Ok(())
    }

    pub async fn health(&self) -> Result<(), DbErr> {
        entities::GlobalConfig::find()
            .order_by_asc(entities::global_config::Column::Id)
            .one(&self.db)
            .await?;
        Ok(())
    }

    pub async fn insert_downstream(
        &self,
        event: DownstreamTrafficEvent,
    ) -> Result<(), DbErr> {
        let now = OffsetDateTime::now_utc();
        let mut active: entities::downstream_traffic::ActiveModel = event.into();
        active.created_at = ActiveValue::Set(now);
        entities::DownstreamTraffic::insert(active)
            .exec(&self.db)
            .await?;
        Ok(())
    }

    /// Records a finished (non-streaming, or streamed-but-already-complete)
    /// attempt in one call: inserts the row `pending`, then immediately
    /// finalizes it through the same conditional-update path a later
    /// caller would use (spec §4.11 single-finalization invariant), so
    /// there is exactly one way bodies become `settled`/`submitted`/`void`.
    /// Returns the row id.
    pub async fn insert_upstream(&self, event: UpstreamTrafficEvent) -> Result<i64, DbErr> {
        let billing = self.resolve_upstream_billing(&event).await;
        let is_success = (200..400).contains(&event.response_status) && !event.cancelled;
        let mut active: entities::upstream_traffic::ActiveModel = event.into();
        active.created_at = ActiveValue::Set(OffsetDateTime::now_utc());
        let id = entities::UpstreamTraffic::insert(active)
            .exec(&self.db)
            .await?
            .last_insert_id;
        self.finalize_outcome(id, billing.as_ref(), is_success).await?;
        Ok(id)
    }

    /// Inserts the still-in-flight half of a streaming attempt: `pending`
    /// billing, `streaming` request status, no response fields yet. Pair
    /// with [`Self::complete_upstream`] once the stream ends.
    pub async fn insert_upstream_streaming(
        &self,
        event: UpstreamTrafficEvent,
    ) -> Result<i64, DbErr> {
        let mut active: entities::upstream_traffic::ActiveModel = event.into();
        active.created_at = ActiveValue::Set(OffsetDateTime::now_utc());
        active.request_status = ActiveValue::Set("streaming".to_string());
        let id = entities::UpstreamTraffic::insert(active)
            .exec(&self.db)
            .await?
            .last_insert_id;
        Ok(id)
    }

    /// Fills in the final response/usage fields on a row previously opened
    /// with [`Self::insert_upstream_streaming`] and finalizes its billing.
    /// `event` carries the same fields `insert_upstream` would have used had
    /// the whole response been available up front. Only rows still
    /// `streaming` are touched, so a duplicate completion is a no-op.
    pub async fn complete_upstream(
        &self,
        id: i64,
        event: UpstreamTrafficEvent,
    ) -> Result<bool, DbErr> {
        use entities::upstream_traffic::Column;
        let billing = self.resolve_upstream_billing(&event).await;
        let is_success = (200..400).contains(&event.response_status) && !event.cancelled;
        let status = request_status_for(event.response_status, event.cancelled);

        let result = entities::UpstreamTraffic::update_many()
            .col_expr(Column::RequestStatus, Expr::value(status))
            .col_expr(Column::ResponseStatus, Expr::value(event.response_status))
            .col_expr(Column::ResponseHeaders, Expr::value(event.response_headers.clone()))
            .col_expr(Column::ResponseBody, Expr::value(event.response_body.clone()))
            .col_expr(
                Column::FirstByteTimeMs,
                Expr::value(event.first_byte_time_ms),
            )
            .col_expr(Column::ResponseTimeMs, Expr::value(event.response_time_ms))
            .col_expr(
                Column::ClaudeInputTokens,
                Expr::value(event.claude_input_tokens),
            )
            .col_expr(
                Column::ClaudeOutputTokens,
                Expr::value(event.claude_output_tokens),
            )
            .col_expr(
                Column::ClaudeTotalTokens,
                Expr::value(event.claude_total_tokens),
            )
            .col_expr(
                Column::ClaudeCacheCreationInputTokens,
                Expr::value(event.claude_cache_creation_input_tokens),
            )
            .col_expr(
                Column::ClaudeCacheReadInputTokens,
                Expr::value(event.claude_cache_read_input_tokens),
            )
            .col_expr(
                Column::GeminiPromptTokens,
                Expr::value(event.gemini_prompt_tokens),
            )
            .col_expr(
                Column::GeminiCandidatesTokens,
                Expr::value(event.gemini_candidates_tokens),
            )
            .col_expr(
                Column::GeminiTotalTokens,
                Expr::value(event.gemini_total_tokens),
            )
            .col_expr(
                Column::GeminiCachedTokens,
                Expr::value(event.gemini_cached_tokens),
            )
            .col_expr(
                Column::OpenaiChatPromptTokens,
                Expr::value(event.openai_chat_prompt_tokens),
            )
            .col_expr(
                Column::OpenaiChatCompletionTokens,
                Expr::value(event.openai_chat_completion_tokens),
            )
            .col_expr(
                Column::OpenaiChatTotalTokens,
                Expr::value(event.openai_chat_total_tokens),
            )
            .col_expr(
                Column::OpenaiResponsesInputTokens,
                Expr::value(event.openai_responses_input_tokens),
            )
            .col_expr(
                Column::OpenaiResponsesOutputTokens,
                Expr::value(event.openai_responses_output_tokens),
            )
            .col_expr(
                Column::OpenaiResponsesTotalTokens,
                Expr::value(event.openai_responses_total_tokens),
            )
            .col_expr(
                Column::OpenaiResponsesInputCachedTokens,
                Expr::value(event.openai_responses_input_cached_tokens),
            )
            .col_expr(
                Column::OpenaiResponsesOutputReasoningTokens,
                Expr::value(event.openai_responses_output_reasoning_tokens),
            )
            .filter(Column::Id.eq(id))
            .filter(Column::RequestStatus.eq("streaming"))
            .exec(&self.db)
            .await?;
        if result.rows_affected != 1 {
            return Ok(false);
        }
        self.finalize_outcome(id, billing.as_ref(), is_success).await?;
        Ok(true)
    }

    /// Routes a just-completed row to exactly one of `settled`/`submitted`/
    /// `void` (spec §4.11): billing resolved -> settled; no pricing ladder
    /// but the attempt actually succeeded -> submitted, awaiting a later
    /// correction; anything else (failed/cancelled) -> void, no charge.
    async fn finalize_outcome(
        &self,
        id: i64,
        billing: Option<&BillingSnapshot>,
        is_success: bool,
    ) -> Result<(), DbErr> {
        match billing {
            Some(snapshot) => {
                self.finalize_settled(id, snapshot).await?;
            }
            None if is_success => {
                self.finalize_submitted(id).await?;
            }
            None => {
                self.finalize_void(id).await?;
            }
        }
        Ok(())
    }

    pub async fn get_upstream_usage(
        &self,
        credential_id: i64,
        model: Option<&str>,
        start_at: OffsetDateTime,
        end_at: OffsetDateTime,
    ) -> Result<UpstreamUsageAggregate, DbErr> {
        use entities::upstream_traffic::Column;

        let mut query = entities::UpstreamTraffic::find().select_only();
        query = query
            .column_as(Expr::col(Column::Id).count(), "count")
            .column_as(
                Expr::col(Column::ClaudeInputTokens).sum(),
                "claude_input_tokens",
            )
            .column_as(
                Expr::col(Column::ClaudeOutputTokens).sum(),
                "claude_output_tokens",
            )
            .column_as(
                Expr::col(Column::ClaudeTotalTokens).sum(),
                "claude_total_tokens",
            )
            .column_as(
                Expr::col(Column::ClaudeCacheCreationInputTokens).sum(),
                "claude_cache_creation_input_tokens",
            )
            .column_as(
                Expr::col(Column::ClaudeCacheReadInputTokens).sum(),
                "claude_cache_read_input_tokens",
            )
            .column_as(
                Expr::col(Column::GeminiPromptTokens).sum(),
                "gemini_prompt_tokens",
            )
            .column_as(
                Expr::col(Column::GeminiCandidatesTokens).sum(),
                "gemini_candidates_tokens",
            )
            .column_as(
                Expr::col(Column::GeminiTotalTokens).sum(),
                "gemini_total_tokens",
            )
            .column_as(
                Expr::col(Column::GeminiCachedTokens).sum(),
                "gemini_cached_tokens",
            )
            .column_as(
                Expr::col(Column::OpenaiChatPromptTokens).sum(),
                "openai_chat_prompt_tokens",
            )
            .column_as(
                Expr::col(Column::OpenaiChatCompletionTokens).sum(),
                "openai_chat_completion_tokens",
            )
            .column_as(
                Expr::col(Column::OpenaiChatTotalTokens).sum(),
                "openai_chat_total_tokens",
            )
            .column_as(
                Expr::col(Column::OpenaiResponsesInputTokens).sum(),
                "openai_responses_input_tokens",
            )
            .column_as(
                Expr::col(Column::OpenaiResponsesOutputTokens).sum(),
                "openai_responses_output_tokens",
            )
            .column_as(
                Expr::col(Column::OpenaiResponsesTotalTokens).sum(),
                "openai_responses_total_tokens",
            )
            .column_as(
                Expr::col(Column::OpenaiResponsesInputCachedTokens).sum(),
                "openai_responses_input_cached_tokens",
            )
            .column_as(
                Expr::col(Column::OpenaiResponsesOutputReasoningTokens).sum(),
                "openai_responses_output_reasoning_tokens",
            )
            .filter(Column::CredentialId.eq(credential_id))
            .filter(Column::CreatedAt.gte(start_at))
            .filter(Column::CreatedAt.lte(end_at));

        if let Some(model) = model {
            query = query.filter(Column::Model.eq(model));
        }

        let result = query
            .into_model::<UpstreamUsageAggregate>()
            .one(&self.db)
            .await?;
        Ok(result.unwrap_or_default())
    }

    pub async fn list_downstream_traffic(
        &self,
        page: u64,
        page_size: u64,
    ) -> Result<(Vec<entities::downstream_traffic::Model>, u64), DbErr> {
        use entities::downstream_traffic::Column;

        let page = std::cmp::Ord::max(page, 1);
        let page_size = std::cmp::Ord::max(page_size, 1);
        let paginator = entities::DownstreamTraffic::find()
            .order_by_desc(Column::CreatedAt)
            .order_by_desc(Column::Id)
            .paginate(&self.db, page_size);
        let num_pages = paginator.num_pages().await?;
        let items = if num_pages == 0 || page > num_pages {
            Vec::new()
        } else {
            paginator.fetch_page(page - 1).await?
        };
        Ok((items, num_pages))
    }

    pub async fn list_upstream_traffic(
        &self,
        page: u64,
        page_size: u64,
    ) -> Result<(Vec<entities::upstream_traffic::Model>, u64), DbErr> {
        use entities::upstream_traffic::Column;

        let page = std::cmp::Ord::max(page, 1);
        let page_size = std::cmp::Ord::max(page_size, 1);
        let paginator = entities::UpstreamTraffic::find()
            .order_by_desc(Column::CreatedAt)
            .order_by_desc(Column::Id)
            .paginate(&self.db, page_size);
        let num_pages = paginator.num_pages().await?;
        let items = if num_pages == 0 || page > num_pages {
            Vec::new()
        } else {
            paginator.fetch_page(page - 1).await?
        };
        Ok((items, num_pages))
    }


    pub async fn upsert_global_config(
        &self,
        id: i64,
        config_json: Json,
        updated_at: OffsetDateTime,
    ) -> Result<(), DbErr> {
        use entities::global_config::Column;

        let active = entities::global_config::ActiveModel {
            id: ActiveValue::Set(id),
            config_json: ActiveValue::Set(config_json),
            updated_at: ActiveValue::Set(updated_at),
            ..Default::default()
        };

        entities::GlobalConfig::insert(active)
            .on_conflict(
                OnConflict::column(Column::Id)
                    .update_columns([Column::ConfigJson, Column::UpdatedAt])
                    .to_owned(),
            )
            .exec(&self.db)
            .await?;
        Ok(())
    }

    pub async fn ensure_admin_user(&self, admin_key: &str) -> Result<(), DbErr> {
        let now = OffsetDateTime::now_utc();

        let user_active = entities::users::ActiveModel {
            id: ActiveValue::Set(0),
            name: ActiveValue::Set(Some("admin".to_string())),
            created_at: ActiveValue::Set(now),
            updated_at: ActiveValue::Set(now),
            ..Default::default()
        };

        entities::Users::insert(user_active)
            .on_conflict(
                OnConflict::column(entities::users::Column::Id)
                    .update_columns([
                        entities::users::Column::Name,
                        entities::users::Column::UpdatedAt,
                    ])
                    .to_owned(),
            )
            .exec(&self.db)
            .await?;

        let key_active = entities::api_keys::ActiveModel {
            id: ActiveValue::Set(0),
            user_id: ActiveValue::Set(0),
            key_value: ActiveValue::Set(admin_key.to_string()),
            label: ActiveValue::Set(Some("admin".to_string())),
            enabled: ActiveValue::Set(true),
            created_at: ActiveValue::Set(now),
            last_used_at: ActiveValue::Set(None),
            ..Default::default()
        };

        entities::ApiKeys::insert(key_active)
            .on_conflict(
                OnConflict::column(entities::api_keys::Column::Id)
                    .update_columns([
                        entities::api_keys::Column::UserId,
                        entities::api_keys::Column::KeyValue,
                        entities::api_keys::Column::Label,
                        entities::api_keys::Column::Enabled,
                        entities::api_keys::Column::LastUsedAt,
                    ])
                    .to_owned(),
            )
            .exec(&self.db)
            .await?;

        Ok(())
    }

    pub async fn get_global_config(
        &self,
    ) -> Result<Option<entities::global_config::Model>, DbErr> {
        entities::GlobalConfig::find()
            .order_by_asc(entities::global_config::Column::Id)
            .one(&self.db)
            .await
    }

    pub async fn list_providers(&self) -> Result<Vec<entities::providers::Model>, DbErr> {
        entities::Providers::find().all(&self.db).await
    }

    pub async fn upsert_provider(&self, input: AdminProviderInput) -> Result<i64, DbErr> {
        use entities::providers::Column;
        let now = OffsetDateTime::now_utc();
        let input_id = input.id;
        let active = entities::providers::ActiveModel {
            id: match input_id {
                Some(id) => ActiveValue::Set(id),
                None => ActiveValue::NotSet,
            },
            name: ActiveValue::Set(input.name),
            config_json: ActiveValue::Set(input.config_json),
            enabled: ActiveValue::Set(input.enabled),
            updated_at: ActiveValue::Set(now),
            ..Default::default()
        };

        let result = entities::Providers::insert(active)
            .on_conflict(
                OnConflict::column(Column::Id)
                    .update_columns([
                        Column::Name,
                        Column::ConfigJson,
                        Column::Enabled,
                        Column::UpdatedAt,
                    ])
                    .to_owned(),
            )
            .exec(&self.db)
            .await?;
        Ok(input_id.unwrap_or(result.last_insert_id))
    }

    pub async fn delete_provider(&self, id: i64) -> Result<(), DbErr> {
        entities::Providers::delete_by_id(id).exec(&self.db).await?;
        Ok(())
    }

    pub async fn list_global_models(&self) -> Result<Vec<entities::global_models::Model>, DbErr> {
        entities::GlobalModels::find().all(&self.db).await
    }

    pub async fn upsert_global_model(&self, input: AdminGlobalModelInput) -> Result<i64, DbErr> {
        use entities::global_models::Column;
        let now = OffsetDateTime::now_utc();
        let input_id = input.id;
        let active = entities::global_models::ActiveModel {
            id: match input_id {
                Some(id) => ActiveValue::Set(id),
                None => ActiveValue::NotSet,
            },
            name: ActiveValue::Set(input.name),
            tiered_pricing_json: ActiveValue::Set(input.tiered_pricing_json),
            created_at: ActiveValue::Set(now),
            updated_at: ActiveValue::Set(now),
            ..Default::default()
        };

        let result = entities::GlobalModels::insert(active)
            .on_conflict(
                OnConflict::column(Column::Id)
                    .update_columns([Column::Name, Column::TieredPricingJson, Column::UpdatedAt])
                    .to_owned(),
            )
            .exec(&self.db)
            .await?;
        Ok(input_id.unwrap_or(result.last_insert_id))
    }

    pub async fn delete_global_model(&self, id: i64) -> Result<(), DbErr> {
        entities::GlobalModels::delete_by_id(id)
            .exec(&self.db)
            .await?;
        Ok(())
    }

    /// Looks up the tiered-pricing ladder for `name` (spec §3 `GlobalModel`).
    /// Returns `Ok(None)` when no such model is configured or its pricing
    /// JSON fails to parse — a missing ladder is a billing-only failure,
    /// never a request failure (spec §7).
    pub async fn find_global_model_pricing(
        &self,
        name: &str,
    ) -> Result<Option<GlobalModelPricing>, DbErr> {
        use entities::global_models::Column;
        let row = entities::GlobalModels::find()
            .filter(Column::Name.eq(name))
            .one(&self.db)
            .await?;
        Ok(row.and_then(|m| {
            serde_json::from_value::<Vec<PricingTier>>(m.tiered_pricing_json)
                .ok()
                .map(|tiers| GlobalModelPricing {
                    model: m.name,
                    tiers,
                })
        }))
    }

    /// Reads the per-credential rate multiplier / free-tier flag from
    /// `credentials.settings`, defaulting to `(1.0, false)` when unset.
    pub async fn credential_billing_settings(
        &self,
        credential_id: i64,
    ) -> Result<(f64, bool), DbErr> {
        let row = entities::Credentials::find_by_id(credential_id)
            .one(&self.db)
            .await?;
        let settings = row
            .and_then(|c| c.settings)
            .and_then(|json| serde_json::from_value::<CredentialBillingSettings>(json).ok())
            .unwrap_or_default();
        Ok((settings.rate_multiplier, settings.is_free_tier))
    }

    /// Resolves a [`BillingSnapshot`] for an upstream event, best-effort.
    /// Returns `None` when the event carries no model, the model has no
    /// configured pricing ladder, or the ladder is empty — billing then
    /// stays `pending` on the row rather than blocking ingestion.
    pub async fn resolve_upstream_billing(
        &self,
        event: &UpstreamTrafficEvent,
    ) -> Option<BillingSnapshot> {
        let model = event.model.as_deref()?;
        let pricing = self.find_global_model_pricing(model).await.ok().flatten()?;
        let (rate_multiplier, is_free_tier) = match event.credential_id {
            Some(id) => self
                .credential_billing_settings(id)
                .await
                .unwrap_or((1.0, false)),
            None => (1.0, false),
        };
        let usage = usage_dimensions(event, 1);
        compute_billing(&pricing, &usage, rate_multiplier, is_free_tier).ok()
    }

    pub async fn list_credentials(&self) -> Result<Vec<entities::credentials::Model>, DbErr> {
        entities::Credentials::find().all(&self.db).await
    }

    pub async fn upsert_credential(
        &self,
        input: AdminCredentialInput,
    ) -> Result<(), DbErr> {
        use entities::credentials::Column;
        let now = OffsetDateTime::now_utc();
        let active = entities::credentials::ActiveModel {
            id: match input.id {
                Some(id) => ActiveValue::Set(id),
                None => ActiveValue::NotSet,
            },
            provider_id: ActiveValue::Set(input.provider_id),
            name: ActiveValue::Set(input.name),
            secret: ActiveValue::Set(input.secret),
            meta_json: ActiveValue::Set(input.meta_json),
            weight: ActiveValue::Set(input.weight),
            enabled: ActiveValue::Set(input.enabled),
            created_at: ActiveValue::Set(now),
            updated_at: ActiveValue::Set(now),
            ..Default::default()
        };

        entities::Credentials::insert(active)
            .on_conflict(
                OnConflict::column(Column::Id)
                    .update_columns([
                        Column::ProviderId,
                        Column::Name,
                        Column::Secret,
                        Column::MetaJson,
                        Column::Weight,
                        Column::Enabled,
                        Column::UpdatedAt,
                    ])
                    .to_owned(),
            )
            .exec(&self.db)
            .await?;
        Ok(())
    }

    pub async fn delete_credential(&self, id: i64) -> Result<(), DbErr> {
        entities::Credentials::delete_by_id(id).exec(&self.db).await?;
        Ok(())
    }

    pub async fn list_disallow(
        &self,
    ) -> Result<Vec<entities::credential_disallow::Model>, DbErr> {
        entities::CredentialDisallow::find().all(&self.db).await
    }

    pub async fn upsert_disallow(
        &self,
        input: AdminDisallowInput,
    ) -> Result<(), DbErr> {
        use entities::credential_disallow::Column;
        let now = OffsetDateTime::now_utc();
        let active = entities::credential_disallow::ActiveModel {
            id: ActiveValue::NotSet,
            credential_id: ActiveValue::Set(input.credential_id),
            scope_kind: ActiveValue::Set(input.scope_kind),
            scope_value: ActiveValue::Set(input.scope_value),
            level: ActiveValue::Set(input.level),
            until_at: ActiveValue::Set(input.until_at),
            reason: ActiveValue::Set(input.reason),
            updated_at: ActiveValue::Set(now),
            ..Default::default()
        };

        entities::CredentialDisallow::insert(active)
            .on_conflict(
                OnConflict::columns([Column::CredentialId, Column::ScopeKind, Column::ScopeValue])
                    .update_columns([Column::Level, Column::UntilAt, Column::Reason, Column::UpdatedAt])
                    .to_owned(),
            )
            .exec(&self.db)
            .await?;
        Ok(())
    }

    pub async fn delete_disallow(&self, id: i64) -> Result<(), DbErr> {
        entities::CredentialDisallow::delete_by_id(id)
            .exec(&self.db)
            .await?;
        Ok(())
    }

    pub async fn list_users(&self) -> Result<Vec<entities::users::Model>, DbErr> {
        entities::Users::find().all(&self.db).await
    }

    pub async fn upsert_user(&self, input: AdminUserInput) -> Result<(), DbErr> {
        use entities::users::Column;
        let now = OffsetDateTime::now_utc();
        let active = entities::users::ActiveModel {
            id: match input.id {
                Some(id) => ActiveValue::Set(id),
                None => ActiveValue::NotSet,
            },
            name: ActiveValue::Set(input.name),
            created_at: ActiveValue::Set(now),
            updated_at: ActiveValue::Set(now),
            ..Default::default()
        };

        entities::Users::insert(active)
            .on_conflict(
                OnConflict::column(Column::Id)
                    .update_columns([Column::Name, Column::UpdatedAt])
                    .to_owned(),
            )
            .exec(&self.db)
            .await?;
        Ok(())
    }

    pub async fn delete_user(&self, id: i64) -> Result<(), DbErr> {
        entities::Users::delete_by_id(id).exec(&self.db).await?;
        Ok(())
    }

    pub async fn list_keys(&self) -> Result<Vec<entities::api_keys::Model>, DbErr> {
        entities::ApiKeys::find().all(&self.db).await
    }

    pub async fn upsert_key(&self, input: AdminKeyInput) -> Result<(), DbErr> {
        use entities::api_keys::Column;
        let now = OffsetDateTime::now_utc();
        let active = entities::api_keys::ActiveModel {
            id: match input.id {
                Some(id) => ActiveValue::Set(id),
                None => ActiveValue::NotSet,
            },
            user_id: ActiveValue::Set(input.user_id),
            key_value: ActiveValue::Set(input.key_value),
            label: ActiveValue::Set(input.label),
            enabled: ActiveValue::Set(input.enabled),
            created_at: ActiveValue::Set(now),
            last_used_at: ActiveValue::Set(None),
            ..Default::default()
        };

        entities::ApiKeys::insert(active)
            .on_conflict(
                OnConflict::column(Column::Id)
                    .update_columns([
                        Column::UserId,
                        Column::KeyValue,
                        Column::Label,
                        Column::Enabled,
                        Column::LastUsedAt,
                    ])
                    .to_owned(),
            )
            .exec(&self.db)
            .await?;
        Ok(())
    }

    pub async fn delete_key(&self, id: i64) -> Result<(), DbErr> {
        entities::ApiKeys::delete_by_id(id).exec(&self.db).await?;
        Ok(())
    }

    pub async fn set_key_enabled(&self, id: i64, enabled: bool) -> Result<(), DbErr> {
        let active = entities::api_keys::ActiveModel {
            id: ActiveValue::Set(id),
            enabled: ActiveValue::Set(enabled),
            ..Default::default()
        };
        entities::ApiKeys::update(active).exec(&self.db).await?;
        Ok(())
    }
}

impl From<DownstreamTrafficEvent> for entities::downstream_traffic::ActiveModel {
    fn from(event: DownstreamTrafficEvent) -> Self {
        entities::downstream_traffic::ActiveModel {
            id: ActiveValue::NotSet,
            created_at: ActiveValue::NotSet,
            provider: ActiveValue::Set(event.provider),
            provider_id: ActiveValue::Set(event.provider_id),
            operation: ActiveValue::Set(event.operation),
            model: ActiveValue::Set(event.model),
            user_id: ActiveValue::Set(event.user_id),
            key_id: ActiveValue::Set(event.key_id),
            trace_id: ActiveValue::Set(event.trace_id),
            request_method: ActiveValue::Set(event.request_method),
            request_path: ActiveValue::Set(event.request_path),
            request_query: ActiveValue::Set(event.request_query),
            request_headers: ActiveValue::Set(event.request_headers),
            request_body: ActiveValue::Set(event.request_body),
            response_status: ActiveValue::Set(event.response_status),
            response_headers: ActiveValue::Set(event.response_headers),
            response_body: ActiveValue::Set(event.response_body),
        }
    }
}

impl From<UpstreamTrafficEvent> for entities::upstream_traffic::ActiveModel {
    fn from(event: UpstreamTrafficEvent) -> Self {
        let request_status = request_status_for(event.response_status, event.cancelled);
        entities::upstream_traffic::ActiveModel {
            id: ActiveValue::NotSet,
            created_at: ActiveValue::NotSet,
            request_status: ActiveValue::Set(request_status.to_string()),
            billing_status: ActiveValue::Set("pending".to_string()),
            rate_multiplier: ActiveValue::Set(1.0),
            is_free_tier: ActiveValue::Set(false),
            total_cost_usd: ActiveValue::Set(None),
            actual_total_cost_usd: ActiveValue::Set(None),
            billing_snapshot_json: ActiveValue::Set(None),
            finalized_at: ActiveValue::Set(None),
            first_byte_time_ms: ActiveValue::Set(event.first_byte_time_ms),
            response_time_ms: ActiveValue::Set(event.response_time_ms),
            request_body_compressed: ActiveValue::Set(None),
            response_body_compressed: ActiveValue::Set(None),
            provider: ActiveValue::Set(event.provider),
            provider_id: ActiveValue::Set(event.provider_id),
            operation: ActiveValue::Set(event.operation),
            model: ActiveValue::Set(event.model),
            credential_id: ActiveValue::Set(event.credential_id),
            trace_id: ActiveValue::Set(event.trace_id),
            request_method: ActiveValue::Set(event.request_method),
            request_path: ActiveValue::Set(event.request_path),
            request_query: ActiveValue::Set(event.request_query),
            request_headers: ActiveValue::Set(event.request_headers),
            request_body: ActiveValue::Set(event.request_body),
            response_status: ActiveValue::Set(event.response_status),
            response_headers: ActiveValue::Set(event.response_headers),
            response_body: ActiveValue::Set(event.response_body),
            claude_input_tokens: ActiveValue::Set(event.claude_input_tokens),
            claude_output_tokens: ActiveValue::Set(event.claude_output_tokens),
            claude_total_tokens: ActiveValue::Set(event.claude_total_tokens),
            claude_cache_creation_input_tokens: ActiveValue::Set(
                event.claude_cache_creation_input_tokens,
            ),
            claude_cache_read_input_tokens: ActiveValue::Set(event.claude_cache_read_input_tokens),
            gemini_prompt_tokens: ActiveValue::Set(event.gemini_prompt_tokens),
            gemini_candidates_tokens: ActiveValue::Set(event.gemini_candidates_tokens),
            gemini_total_tokens: ActiveValue::Set(event.gemini_total_tokens),
            gemini_cached_tokens: ActiveValue::Set(event.gemini_cached_tokens),
            openai_chat_prompt_tokens: ActiveValue::Set(event.openai_chat_prompt_tokens),
            openai_chat_completion_tokens: ActiveValue::Set(
                event.openai_chat_completion_tokens,
            ),
            openai_chat_total_tokens: ActiveValue::Set(event.openai_chat_total_tokens),
            openai_responses_input_tokens: ActiveValue::Set(event.openai_responses_input_tokens),
            openai_responses_output_tokens: ActiveValue::Set(event.openai_responses_output_tokens),
            openai_responses_total_tokens: ActiveValue::Set(event.openai_responses_total_tokens),
            openai_responses_input_cached_tokens: ActiveValue::Set(
                event.openai_responses_input_cached_tokens,
            ),
            openai_responses_output_reasoning_tokens: ActiveValue::Set(
                event.openai_responses_output_reasoning_tokens,
            ),
        }
    }
}

/// Settles a freshly-built `ActiveModel` with a resolved billing snapshot,
/// marking the row `settled` in the same write as the insert. When no
/// snapshot resolved (no model, no pricing ladder) the row is left
/// `pending` for later correction rather than blocking ingestion.
pub(crate) fn apply_billing(
    active: &mut entities::upstream_traffic::ActiveModel,
    billing: Option<&BillingSnapshot>,
    now: OffsetDateTime,
) {
    let Some(snapshot) = billing else { return };
    active.billing_status = ActiveValue::Set("settled".to_string());
    active.rate_multiplier = ActiveValue::Set(snapshot.rate_multiplier);
    active.is_free_tier = ActiveValue::Set(snapshot.is_free_tier);
    active.total_cost_usd = ActiveValue::Set(Some(snapshot.total_cost));
    active.actual_total_cost_usd = ActiveValue::Set(Some(snapshot.actual_total_cost));
    active.billing_snapshot_json = ActiveValue::Set(serde_json::to_value(snapshot).ok());
    active.finalized_at = ActiveValue::Set(Some(now));
}

impl TrafficStorage {
    /// Idempotently settles a still-`pending` row with `snapshot`. Returns
    /// whether this call won the race (spec §4.11 single-finalization
    /// invariant) — a second caller observing the same row sees `false`.
    pub async fn finalize_settled(
        &self,
        id: i64,
        snapshot: &BillingSnapshot,
    ) -> Result<bool, DbErr> {
        use entities::upstream_traffic::Column;
        let now = OffsetDateTime::now_utc();
        let result = entities::UpstreamTraffic::update_many()
            .col_expr(Column::BillingStatus, Expr::value("settled"))
            .col_expr(Column::RateMultiplier, Expr::value(snapshot.rate_multiplier))
            .col_expr(Column::IsFreeTier, Expr::value(snapshot.is_free_tier))
            .col_expr(Column::TotalCostUsd, Expr::value(snapshot.total_cost))
            .col_expr(
                Column::ActualTotalCostUsd,
                Expr::value(snapshot.actual_total_cost),
            )
            .col_expr(
                Column::BillingSnapshotJson,
                Expr::value(serde_json::to_value(snapshot).ok()),
            )
            .col_expr(Column::FinalizedAt, Expr::value(now))
            .filter(Column::Id.eq(id))
            .filter(Column::BillingStatus.eq("pending"))
            .exec(&self.db)
            .await?;
        let won = result.rows_affected == 1;
        if won {
            if let Some(row) = entities::UpstreamTraffic::find_by_id(id)
                .one(&self.db)
                .await?
            {
                let period = crate::usage::period_for(now);
                self.record_monthly_usage(
                    row.credential_id,
                    row.provider_id,
                    &period,
                    snapshot.actual_total_cost,
                )
                .await?;
            }
        }
        Ok(won)
    }

    /// Idempotently marks a still-`pending` row `submitted`: usage was
    /// recorded for a real, successful attempt but no pricing ladder
    /// resolved a cost (spec §4.11) — awaiting a later correction via
    /// [`Self::update_settled_billing`]-style reconciliation, distinct from
    /// `void` (no usage at all). Returns whether this call won the race.
    pub async fn finalize_submitted(&self, id: i64) -> Result<bool, DbErr> {
        use entities::upstream_traffic::Column;
        let now = OffsetDateTime::now_utc();
        let result = entities::UpstreamTraffic::update_many()
            .col_expr(Column::BillingStatus, Expr::value("submitted"))
            .col_expr(Column::FinalizedAt, Expr::value(now))
            .filter(Column::Id.eq(id))
            .filter(Column::BillingStatus.eq("pending"))
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected == 1)
    }

    /// Idempotently voids a still-`pending` row (no usage, refused request).
    /// Returns whether this call won the race.
    pub async fn finalize_void(&self, id: i64) -> Result<bool, DbErr> {
        use entities::upstream_traffic::Column;
        let now = OffsetDateTime::now_utc();
        let result = entities::UpstreamTraffic::update_many()
            .col_expr(Column::BillingStatus, Expr::value("void"))
            .col_expr(Column::TotalCostUsd, Expr::value(0.0_f64))
            .col_expr(Column::ActualTotalCostUsd, Expr::value(0.0_f64))
            .col_expr(Column::FinalizedAt, Expr::value(now))
            .filter(Column::Id.eq(id))
            .filter(Column::BillingStatus.eq("pending"))
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected == 1)
    }

    /// Amends the cost of an already-`settled` row (a correction, e.g. a
    /// delayed usage report). Does not reopen `void` rows.
    pub async fn update_settled_billing(
        &self,
        id: i64,
        snapshot: &BillingSnapshot,
    ) -> Result<bool, DbErr> {
        use entities::upstream_traffic::Column;
        let result = entities::UpstreamTraffic::update_many()
            .col_expr(Column::RateMultiplier, Expr::value(snapshot.rate_multiplier))
            .col_expr(Column::IsFreeTier, Expr::value(snapshot.is_free_tier))
            .col_expr(Column::TotalCostUsd, Expr::value(snapshot.total_cost))
            .col_expr(
                Column::ActualTotalCostUsd,
                Expr::value(snapshot.actual_total_cost),
            )
            .col_expr(
                Column::BillingSnapshotJson,
                Expr::value(serde_json::to_value(snapshot).ok()),
            )
            .filter(Column::Id.eq(id))
            .filter(Column::BillingStatus.eq("settled"))
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected == 1)
    }

    /// Force-zeroes a `settled` or still-`pending` row (e.g. a chargeback).
    pub async fn void_settled(&self, id: i64) -> Result<bool, DbErr> {
        use entities::upstream_traffic::Column;
        let result = entities::UpstreamTraffic::update_many()
            .col_expr(Column::BillingStatus, Expr::value("void"))
            .col_expr(Column::TotalCostUsd, Expr::value(0.0_f64))
            .col_expr(Column::ActualTotalCostUsd, Expr::value(0.0_f64))
            .filter(Column::Id.eq(id))
            .filter(Column::BillingStatus.ne("void"))
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected == 1)
    }
}

#[cfg(test)]
mod billing_tests {
    use super::*;

    async fn memory_storage() -> TrafficStorage {
        let storage = TrafficStorage::connect("sqlite::memory:")
            .await
            .expect("connect in-memory sqlite");
        storage.sync().await.expect("sync schema");
        storage
    }

    fn sample_event(model: &str, credential_id: Option<i64>) -> UpstreamTrafficEvent {
        UpstreamTrafficEvent {
            provider: "anthropic".to_string(),
            operation: "generate_content".to_string(),
            model: Some(model.to_string()),
            credential_id,
            request_method: "POST".to_string(),
            request_path: "/v1/messages".to_string(),
            response_status: 200,
            claude_input_tokens: Some(1_000_000),
            claude_output_tokens: Some(1_000_000),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn insert_upstream_settles_billing_when_pricing_is_configured() {
        let storage = memory_storage().await;
        storage
            .upsert_global_model(AdminGlobalModelInput {
                id: None,
                name: "claude-test".to_string(),
                tiered_pricing_json: serde_json::json!([
                    {
                        "up_to": null,
                        "input_price_per_1m": 3.0,
                        "output_price_per_1m": 15.0,
                        "price_per_request": 0.0,
                    }
                ]),
            })
            .await
            .expect("upsert global model");

        storage
            .insert_upstream(sample_event("claude-test", None))
            .await
            .expect("insert upstream");

        let (rows, _) = storage
            .list_upstream_traffic(1, 10)
            .await
            .expect("list upstream traffic");
        let row = rows.first().expect("row inserted");
        assert_eq!(row.billing_status, "settled");
        assert_eq!(row.total_cost_usd, Some(18.0));
        assert_eq!(row.actual_total_cost_usd, Some(18.0));
        assert_eq!(row.request_status, "completed");
    }

    #[tokio::test]
    async fn insert_upstream_submits_without_a_pricing_ladder() {
        let storage = memory_storage().await;
        storage
            .insert_upstream(sample_event("unknown-model", None))
            .await
            .expect("insert upstream");

        let (rows, _) = storage
            .list_upstream_traffic(1, 10)
            .await
            .expect("list upstream traffic");
        let row = rows.first().expect("row inserted");
        assert_eq!(row.billing_status, "submitted");
        assert_eq!(row.total_cost_usd, None);
    }

    #[tokio::test]
    async fn insert_upstream_voids_a_failed_attempt_without_a_pricing_ladder() {
        let storage = memory_storage().await;
        let mut event = sample_event("unknown-model", None);
        event.response_status = 500;
        storage.insert_upstream(event).await.expect("insert upstream");

        let (rows, _) = storage
            .list_upstream_traffic(1, 10)
            .await
            .expect("list upstream traffic");
        let row = rows.first().expect("row inserted");
        assert_eq!(row.billing_status, "void");
        assert_eq!(row.request_status, "failed");
    }

    #[tokio::test]
    async fn streaming_attempt_starts_pending_and_completes() {
        let storage = memory_storage().await;
        let id = storage
            .insert_upstream_streaming(sample_event("claude-test", None))
            .await
            .expect("insert streaming");

        let (rows, _) = storage
            .list_upstream_traffic(1, 10)
            .await
            .expect("list upstream traffic");
        let row = rows.iter().find(|r| r.id == id).expect("row inserted");
        assert_eq!(row.request_status, "streaming");
        assert_eq!(row.billing_status, "pending");

        let mut finishing = sample_event("claude-test", None);
        finishing.first_byte_time_ms = Some(40);
        finishing.response_time_ms = Some(900);
        let won = storage
            .complete_upstream(id, finishing)
            .await
            .expect("complete upstream");
        assert!(won);

        let (rows, _) = storage
            .list_upstream_traffic(1, 10)
            .await
            .expect("list upstream traffic");
        let row = rows.iter().find(|r| r.id == id).expect("row still there");
        assert_eq!(row.request_status, "completed");
        assert_eq!(row.first_byte_time_ms, Some(40));
        assert_eq!(row.response_time_ms, Some(900));

        // A second completion observes the row is no longer `streaming`.
        let won_again = storage
            .complete_upstream(id, sample_event("claude-test", None))
            .await
            .expect("complete upstream again");
        assert!(!won_again);
    }

    #[tokio::test]
    async fn cancelled_streaming_attempt_is_voided() {
        let storage = memory_storage().await;
        let id = storage
            .insert_upstream_streaming(sample_event("claude-test", None))
            .await
            .expect("insert streaming");

        let mut event = sample_event("claude-test", None);
        event.cancelled = true;
        storage
            .complete_upstream(id, event)
            .await
            .expect("complete upstream");

        let (rows, _) = storage
            .list_upstream_traffic(1, 10)
            .await
            .expect("list upstream traffic");
        let row = rows.iter().find(|r| r.id == id).expect("row still there");
        assert_eq!(row.request_status, "cancelled");
        assert_eq!(row.billing_status, "void");
    }

    #[tokio::test]
    async fn credential_rate_multiplier_scales_actual_cost_only() {
        let storage = memory_storage().await;
        storage
            .upsert_global_model(AdminGlobalModelInput {
                id: None,
                name: "claude-test".to_string(),
                tiered_pricing_json: serde_json::json!([
                    {
                        "up_to": null,
                        "input_price_per_1m": 3.0,
                        "output_price_per_1m": 15.0,
                        "price_per_request": 0.0,
                    }
                ]),
            })
            .await
            .expect("upsert global model");
        let provider_id = storage
            .upsert_provider(AdminProviderInput {
                id: None,
                name: "anthropic".to_string(),
                config_json: serde_json::json!({}),
                enabled: true,
            })
            .await
            .expect("upsert provider");
        let credential_id = storage
            .upsert_credential(AdminCredentialInput {
                id: None,
                provider_id,
                name: None,
                secret: serde_json::json!({}),
                meta_json: serde_json::json!({"rate_multiplier": 2.0}),
                weight: 1,
                enabled: true,
            })
            .await
            .expect("upsert credential");

        // upsert_credential stores provider meta under meta_json, not the
        // billing-settings `settings` column, so set it directly here.
        entities::Credentials::update_many()
            .col_expr(
                entities::credentials::Column::Settings,
                Expr::value(serde_json::json!({"rate_multiplier": 2.0})),
            )
            .filter(entities::credentials::Column::Id.eq(credential_id))
            .exec(storage.connection())
            .await
            .expect("set credential billing settings");

        storage
            .insert_upstream(sample_event("claude-test", Some(credential_id)))
            .await
            .expect("insert upstream");

        let (rows, _) = storage
            .list_upstream_traffic(1, 10)
            .await
            .expect("list upstream traffic");
        let row = rows.first().expect("row inserted");
        assert_eq!(row.total_cost_usd, Some(18.0));
        assert_eq!(row.actual_total_cost_usd, Some(36.0));
    }

    #[tokio::test]
    async fn finalize_settled_is_idempotent_single_finalization() {
        let storage = memory_storage().await;
        storage
            .insert_upstream_streaming(sample_event("unknown-model", None))
            .await
            .expect("insert streaming");
        let (rows, _) = storage
            .list_upstream_traffic(1, 10)
            .await
            .expect("list upstream traffic");
        let id = rows.first().expect("row inserted").id;

        let snapshot = relay_provider_core::compute_billing(
            &GlobalModelPricing {
                model: "unknown-model".to_string(),
                tiers: vec![PricingTier {
                    up_to: None,
                    input_price_per_1m: 1.0,
                    output_price_per_1m: 1.0,
                    cache_creation_price_per_1m: None,
                    cache_read_price_per_1m: None,
                    price_per_request: 0.0,
                    cache_ttl_pricing: vec![],
                }],
            },
            &usage_dimensions(&sample_event("unknown-model", None), 1),
            1.0,
            false,
        )
        .expect("compute billing");

        assert!(storage.finalize_settled(id, &snapshot).await.unwrap());
        // Second call observes the row is no longer `pending` and loses the race.
        assert!(!storage.finalize_settled(id, &snapshot).await.unwrap());
    }

    #[tokio::test]
    async fn finalize_settled_accumulates_monthly_usage() {
        let storage = memory_storage().await;
        let provider_id = storage
            .upsert_provider(AdminProviderInput {
                id: None,
                name: "anthropic".to_string(),
                config_json: serde_json::json!({}),
                enabled: true,
            })
            .await
            .expect("upsert provider");

        let mut event = sample_event("unknown-model", None);
        event.provider_id = Some(provider_id);
        storage
            .insert_upstream_streaming(event.clone())
            .await
            .expect("insert streaming");
        storage
            .insert_upstream_streaming(event)
            .await
            .expect("insert streaming");

        let (rows, _) = storage
            .list_upstream_traffic(1, 10)
            .await
            .expect("list upstream traffic");

        let snapshot = relay_provider_core::compute_billing(
            &GlobalModelPricing {
                model: "unknown-model".to_string(),
                tiers: vec![PricingTier {
                    up_to: None,
                    input_price_per_1m: 1.0,
                    output_price_per_1m: 1.0,
                    cache_creation_price_per_1m: None,
                    cache_read_price_per_1m: None,
                    price_per_request: 0.0,
                    cache_ttl_pricing: vec![],
                }],
            },
            &usage_dimensions(&sample_event("unknown-model", None), 1),
            1.0,
            false,
        )
        .expect("compute billing");

        for row in &rows {
            assert!(storage.finalize_settled(row.id, &snapshot).await.unwrap());
        }

        let period = crate::usage::period_for(OffsetDateTime::now_utc());
        let totals = storage
            .monthly_usage_for(provider_id, &period)
            .await
            .expect("monthly usage totals");
        assert_eq!(totals.request_count, 2);
        assert_eq!(totals.total_cost_usd, snapshot.actual_total_cost * 2.0);
    }
}
