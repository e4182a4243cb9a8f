//! Invitation entity model
//!
//! A pending offer to join a tenant with a predetermined role set. At most one
//! invitation per (tenant, email) is pending at a time.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "Text")]
#[serde(rename_all = "snake_case")]
pub enum InvitationStatus {
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "accepted")]
    Accepted,
    #[sea_orm(string_value = "revoked")]
    Revoked,
    #[sea_orm(string_value = "expired")]
    Expired,
}

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "invitations")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub tenant_id: Uuid,

    pub email: String,

    /// JSON array of role ids granted on acceptance
    pub role_ids: String,

    #[sea_orm(unique)]
    #[serde(skip_serializing)]
    pub token: String,

    pub status: InvitationStatus,

    pub invited_by: Option<Uuid>,

    pub expires_at: DateTimeUtc,

    pub accepted_at: Option<DateTimeUtc>,

    pub created_at: DateTimeUtc,

    pub updated_at: DateTimeUtc,
}

impl Model {
    pub fn role_ids(&self) -> Result<Vec<Uuid>, serde_json::Error> {
        serde_json::from_str(&self.role_ids)
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
