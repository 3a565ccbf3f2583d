use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// One-time passcodes, keyed by identity.
///
/// The primary key on `email` is what keeps a single record per identity: writers insert
/// with `ON CONFLICT DO NOTHING` and rotate codes with a conditional update.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq, Serialize, Deserialize)]
#[sea_orm(table_name = "otp_codes")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub email: String,

    #[serde(skip_serializing)]
    pub code: String,

    /// Unix timestamp (seconds).
    pub created_at: i64,

    /// Wrong guesses against this code so far.
    pub attempts: i32,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
