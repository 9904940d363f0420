//! Monthly usage aggregation, layered on top of [`crate::traffic::TrafficStorage`]'s
//! per-request finalize state machine. One row per `(credential_id, provider_id, period)`,
//! incremented as upstream traffic settles.

use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{ColumnTrait, DbErr, EntityTrait, ExprTrait, QueryFilter, QueryOrder};
use time::OffsetDateTime;

use crate::entities;
use crate::traffic::TrafficStorage;
use entities::monthly_usage::Column;

/// `YYYY-MM`, the natural billing period boundary.
pub fn period_for(at: OffsetDateTime) -> String {
    format!("{:04}-{:02}", at.year(), u8::from(at.month()))
}

#[derive(Debug, Clone, Default, sea_orm::FromQueryResult)]
pub struct MonthlyUsageTotals {
    pub request_count: i64,
    pub total_cost_usd: f64,
}

impl TrafficStorage {
    /// Upserts the running total for a billing period in one statement, so
    /// concurrent finalizers never need to take out a row lock themselves —
    /// the database's own conflict-resolution serializes the increment.
    pub async fn record_monthly_usage(
        &self,
        credential_id: Option<i64>,
        provider_id: Option<i64>,
        period: &str,
        cost_usd: f64,
    ) -> Result<(), DbErr> {
        let now = OffsetDateTime::now_utc();
        let active = entities::monthly_usage::ActiveModel {
            id: sea_orm::ActiveValue::NotSet,
            credential_id: sea_orm::ActiveValue::Set(credential_id),
            provider_id: sea_orm::ActiveValue::Set(provider_id),
            period: sea_orm::ActiveValue::Set(period.to_string()),
            request_count: sea_orm::ActiveValue::Set(1),
            total_cost_usd: sea_orm::ActiveValue::Set(cost_usd),
            updated_at: sea_orm::ActiveValue::Set(now),
        };

        entities::MonthlyUsage::insert(active)
            .on_conflict(
                OnConflict::columns([Column::CredentialId, Column::ProviderId, Column::Period])
                    .value(Column::RequestCount, Expr::col(Column::RequestCount).add(1))
                    .value(
                        Column::TotalCostUsd,
                        Expr::col(Column::TotalCostUsd).add(cost_usd),
                    )
                    .update_column(Column::UpdatedAt)
                    .to_owned(),
            )
            .exec(&self.db)
            .await?;
        Ok(())
    }

    pub async fn monthly_usage_for(
        &self,
        provider_id: i64,
        period: &str,
    ) -> Result<MonthlyUsageTotals, DbErr> {
        let rows = entities::MonthlyUsage::find()
            .filter(Column::ProviderId.eq(provider_id))
            .filter(Column::Period.eq(period))
            .order_by_asc(Column::CredentialId)
            .all(&self.db)
            .await?;

        Ok(rows.into_iter().fold(
            MonthlyUsageTotals::default(),
            |mut acc, row| {
                acc.request_count += row.request_count;
                acc.total_cost_usd += row.total_cost_usd;
                acc
            },
        ))
    }
}
