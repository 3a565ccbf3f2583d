use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
    Set, SqlErr,
};

use entity::event_participant::{self, ROLE_COMMITTEE, ROLE_NORMAL};
use entity::{event, user};

use crate::error::{AuthError, Error, NotFound, Result, ValidationError};
use crate::jwt::{SessionClaims, Tier};
use crate::util::{now_ts, random_code, CODE_ALPHABET};

pub const PARTICIPATION_CODE_LEN: usize = 10;

/// A participation code collision is astronomically rare; give up after a few.
const MAX_CODE_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventRole {
    Normal,
    Committee,
}

impl EventRole {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim() {
            ROLE_NORMAL => Ok(EventRole::Normal),
            ROLE_COMMITTEE => Ok(EventRole::Committee),
            other => Err(ValidationError::InvalidRole(other.to_string()).into()),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EventRole::Normal => ROLE_NORMAL,
            EventRole::Committee => ROLE_COMMITTEE,
        }
    }
}

/// Whether the identity holds the committee role on `event_id`.
pub async fn is_committee_for<C: ConnectionTrait>(db: &C, email: &str, event_id: i32) -> Result<bool> {
    let Some(u) = user::Entity::find()
        .filter(user::Column::Email.eq(email))
        .one(db)
        .await?
    else {
        return Ok(false);
    };

    let row = event_participant::Entity::find()
        .filter(event_participant::Column::EventId.eq(event_id))
        .filter(event_participant::Column::UserId.eq(u.id))
        .filter(event_participant::Column::Role.eq(ROLE_COMMITTEE))
        .one(db)
        .await?;
    Ok(row.is_some())
}

#[derive(Clone)]
pub struct ParticipationService {
    db: DatabaseConnection,
}

impl ParticipationService {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// Register the caller to an event and hand out a fresh participation code.
    pub async fn register_participation(
        &self,
        claims: &SessionClaims,
        event_id: i32,
        role: EventRole,
    ) -> Result<event_participant::Model> {
        if role == EventRole::Committee && claims.tier == Tier::Participant {
            tracing::info!(email = %claims.email, event_id, "committee registration refused for participant");
            return Err(AuthError::Forbidden.into());
        }

        if event::Entity::find_by_id(event_id).one(&self.db).await?.is_none() {
            return Err(NotFound::Event.into());
        }

        let Some(u) = user::Entity::find()
            .filter(user::Column::Email.eq(claims.email.as_str()))
            .one(&self.db)
            .await?
        else {
            return Err(NotFound::User.into());
        };

        if self.participation_of(event_id, &u.id).await?.is_some() {
            return Err(ValidationError::AlreadyParticipating.into());
        }

        for _ in 0..MAX_CODE_ATTEMPTS {
            let code = random_code(CODE_ALPHABET, PARTICIPATION_CODE_LEN)
                .map_err(|e| Error::Hashing(e.to_string()))?;

            let active = event_participant::ActiveModel {
                event_id: Set(event_id),
                user_id: Set(u.id.clone()),
                role: Set(role.as_str().to_string()),
                attended: Set(false),
                code: Set(code),
                created_at: Set(now_ts()),
                ..Default::default()
            };

            match active.insert(&self.db).await {
                Ok(model) => {
                    tracing::info!(user_id = %u.id, event_id, role = role.as_str(), "participation registered");
                    return Ok(model);
                }
                // Either a concurrent registration for the same pair or a code collision.
                Err(e) if matches!(e.sql_err(), Some(SqlErr::UniqueConstraintViolation(_))) => {
                    if self.participation_of(event_id, &u.id).await?.is_some() {
                        return Err(ValidationError::AlreadyParticipating.into());
                    }
                    tracing::warn!(event_id, "participation code collision, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(Error::Hashing("could not allocate a unique participation code".to_string()))
    }

    async fn participation_of(&self, event_id: i32, user_id: &str) -> Result<Option<event_participant::Model>> {
        Ok(event_participant::Entity::find()
            .filter(event_participant::Column::EventId.eq(event_id))
            .filter(event_participant::Column::UserId.eq(user_id))
            .one(&self.db)
            .await?)
    }

    /// Record attendance for a participation code. Idempotent.
    ///
    /// Only administrators and committee members of the code's event may do this.
    pub async fn mark_attendance(
        &self,
        claims: &SessionClaims,
        code: &str,
    ) -> Result<event_participant::Model> {
        let code = code.trim();
        if code.is_empty() {
            return Err(ValidationError::MissingField("code").into());
        }

        let Some(part) = event_participant::Entity::find()
            .filter(event_participant::Column::Code.eq(code))
            .one(&self.db)
            .await?
        else {
            return Err(NotFound::Participation.into());
        };

        if !claims.tier.is_admin() && !is_committee_for(&self.db, &claims.email, part.event_id).await? {
            return Err(AuthError::Forbidden.into());
        }

        if part.attended {
            return Ok(part);
        }

        let mut active: event_participant::ActiveModel = part.into();
        active.attended = Set(true);
        Ok(active.update(&self.db).await?)
    }
}
