use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "usage_records")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub api_key_id: i64,
    pub user_id: i64,
    pub endpoint: String,
    pub tokens_in: i64,
    pub tokens_out: i64,
    pub model_used: String,
    pub backend_used: String,
    pub at: OffsetDateTime,
}

impl ActiveModelBehavior for ActiveModel {}
