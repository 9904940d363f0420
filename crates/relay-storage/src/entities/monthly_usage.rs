use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "monthly_usage")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    #[sea_orm(unique_key = "monthly_usage_period")]
    pub credential_id: Option<i64>,
    #[sea_orm(unique_key = "monthly_usage_period")]
    pub provider_id: Option<i64>,
    #[sea_orm(unique_key = "monthly_usage_period")]
    pub period: String,
    pub request_count: i64,
    pub total_cost_usd: f64,
    pub updated_at: OffsetDateTime,
}

impl ActiveModelBehavior for ActiveModel {}
