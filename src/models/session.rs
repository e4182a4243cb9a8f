//! Session entity model
//!
//! One row per active login. `expires_at` is fixed at creation; only
//! `last_activity_at` moves afterwards.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "sessions")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub tenant_id: Uuid,

    pub user_id: Uuid,

    /// SHA-256 of the bearer access token
    #[sea_orm(unique)]
    #[serde(skip_serializing)]
    pub token_fingerprint: String,

    pub ip_address: Option<String>,

    pub user_agent: Option<String>,

    pub device_type: Option<String>,

    pub browser: Option<String>,

    pub os: Option<String>,

    pub remember_me: bool,

    pub last_activity_at: DateTimeUtc,

    pub expires_at: DateTimeUtc,

    pub created_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::user::Entity",
        from = "Column::UserId",
        to = "super::user::Column::Id"
    )]
    User,
}

impl Related<super::user::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::User.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
