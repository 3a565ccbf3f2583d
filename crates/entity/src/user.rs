use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Registered account. `email` is the identity used by sessions and OTP codes.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq, Serialize, Deserialize)]
#[sea_orm(table_name = "users")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,

    #[sea_orm(unique)]
    pub email: String,

    pub full_name: String,

    /// Encoded PBKDF2 hash (`pbkdf2-sha256$<iter>$<salt>$<hash>`). Never plaintext.
    #[serde(skip_serializing)]
    pub password_hash: String,

    /// Authorization tier code: 0 participant, 1 administrator, 2 committee.
    pub role: i32,

    pub instance: Option<String>,

    /// Unix timestamp (seconds).
    pub created_at: i64,

    /// Unix timestamp (seconds).
    pub updated_at: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
