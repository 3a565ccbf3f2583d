use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

pub const ROLE_NORMAL: &str = "normal";
pub const ROLE_COMMITTEE: &str = "committee";

/// A user's registration to one event.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq, Serialize, Deserialize)]
#[sea_orm(table_name = "event_participants")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,

    pub event_id: i32,

    pub user_id: String,

    /// `ROLE_NORMAL` or `ROLE_COMMITTEE`.
    pub role: String,

    pub attended: bool,

    /// Opaque participation code used for attendance and certificate lookup.
    #[sea_orm(unique)]
    pub code: String,

    /// Unix timestamp (seconds).
    pub created_at: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
