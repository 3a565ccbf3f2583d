use std::sync::Arc;

use sea_orm::sea_query::OnConflict;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set, SqlErr,
};
use tokio::sync::OnceCell;

use entity::user;

use crate::crypto::Hasher;
use crate::error::{AuthError, Error, NotFound, Result, ValidationError};
use crate::jwt::{SessionClaims, Tier, TokenIssuer};
use crate::otp::OtpManager;
use crate::util::{generate_user_id, hex_encode, is_email_valid, normalize_email, now_ts, random_bytes};

/// Reserved identity re-secreted from `SECRET_KEY` on every start.
pub const ADMIN_EMAIL: &str = "admin@wowadmin.com";

pub fn tier_of(u: &user::Model) -> Tier {
    Tier::from_code(u.role).unwrap_or_else(|| {
        tracing::warn!(user_id = %u.id, role = u.role, "unknown role code, treating as participant");
        Tier::Participant
    })
}

#[derive(Clone)]
pub struct CredentialService {
    db: DatabaseConnection,
    hasher: Hasher,
    issuer: TokenIssuer,
    otp: OtpManager,
    /// Hash of a random secret, verified against when the identity is unknown so that
    /// both login failure paths pay for one key derivation.
    dummy_hash: Arc<OnceCell<String>>,
}

fn require_admin(caller: &SessionClaims) -> Result<()> {
    if caller.tier.is_admin() {
        Ok(())
    } else {
        tracing::warn!(target: "security", email = %caller.email, "administrator operation refused");
        Err(AuthError::Forbidden.into())
    }
}

impl CredentialService {
    pub fn new(db: DatabaseConnection, hasher: Hasher, issuer: TokenIssuer, otp: OtpManager) -> Self {
        Self {
            db,
            hasher,
            issuer,
            otp,
            dummy_hash: Arc::new(OnceCell::new()),
        }
    }

    async fn dummy_hash(&self) -> Result<String> {
        let hash = self
            .dummy_hash
            .get_or_try_init(|| async {
                let secret = random_bytes(32).map_err(|e| Error::Hashing(e.to_string()))?;
                self.hasher.hash(hex_encode(&secret)).await
            })
            .await?;
        Ok(hash.clone())
    }

    pub async fn find_user(&self, email: &str) -> Result<Option<user::Model>> {
        Ok(user::Entity::find()
            .filter(user::Column::Email.eq(normalize_email(email)))
            .one(&self.db)
            .await?)
    }

    /// Self-service registration. Always creates a participant.
    pub async fn register(
        &self,
        email: &str,
        full_name: &str,
        password: &str,
        instance: Option<String>,
    ) -> Result<user::Model> {
        self.create_user(email, full_name, password, instance, Tier::Participant)
            .await
    }

    /// Administrator-only registration of an account with an explicit tier.
    pub async fn register_with_tier(
        &self,
        caller: &SessionClaims,
        email: &str,
        full_name: &str,
        password: &str,
        instance: Option<String>,
        tier: Tier,
    ) -> Result<user::Model> {
        require_admin(caller)?;
        let u = self
            .create_user(email, full_name, password, instance, tier)
            .await?;
        tracing::info!(by = %caller.email, user_id = %u.id, tier = tier.code(), "account created with tier");
        Ok(u)
    }

    async fn create_user(
        &self,
        email: &str,
        full_name: &str,
        password: &str,
        instance: Option<String>,
        tier: Tier,
    ) -> Result<user::Model> {
        let email = normalize_email(email);
        let full_name = full_name.trim();
        if email.is_empty() {
            return Err(ValidationError::MissingField("email").into());
        }
        if full_name.is_empty() {
            return Err(ValidationError::MissingField("name").into());
        }
        if password.is_empty() {
            return Err(ValidationError::MissingField("pass").into());
        }
        if !is_email_valid(&email) {
            return Err(ValidationError::InvalidEmail.into());
        }

        if self.find_user(&email).await?.is_some() {
            return Err(ValidationError::AlreadyRegistered.into());
        }

        let password_hash = self.hasher.hash(password.to_string()).await?;
        let id = generate_user_id().map_err(|e| Error::Hashing(e.to_string()))?;
        let now = now_ts();

        let active = user::ActiveModel {
            id: Set(id),
            email: Set(email),
            full_name: Set(full_name.to_string()),
            password_hash: Set(password_hash),
            role: Set(tier.code()),
            instance: Set(instance.filter(|s| !s.trim().is_empty())),
            created_at: Set(now),
            updated_at: Set(now),
        };

        match active.insert(&self.db).await {
            Ok(u) => Ok(u),
            // Lost a race with a concurrent registration for the same email.
            Err(e) if matches!(e.sql_err(), Some(SqlErr::UniqueConstraintViolation(_))) => {
                Err(ValidationError::AlreadyRegistered.into())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Verify a password and mint a session token.
    ///
    /// Unknown identities and wrong passwords produce the same error.
    pub async fn login(&self, email: &str, password: &str) -> Result<(user::Model, String)> {
        let email = normalize_email(email);
        if email.is_empty() || password.is_empty() {
            return Err(AuthError::InvalidCredentials.into());
        }

        let Some(u) = self.find_user(&email).await? else {
            let dummy = self.dummy_hash().await?;
            self.hasher.verify(dummy, password.to_string()).await?;
            tracing::info!(%email, "login rejected: unknown identity");
            return Err(AuthError::InvalidCredentials.into());
        };

        if !self
            .hasher
            .verify(u.password_hash.clone(), password.to_string())
            .await?
        {
            tracing::info!(%email, "login rejected: password mismatch");
            return Err(AuthError::InvalidCredentials.into());
        }

        let token = self.issuer.issue(&u.email, tier_of(&u))?;
        Ok((u, token))
    }

    /// Replace a password after proving control of the mailbox with a one-time code.
    ///
    /// An unknown identity is reported exactly like a wrong code.
    pub async fn reset_password(&self, email: &str, code: &str, new_password: &str) -> Result<()> {
        if new_password.is_empty() {
            return Err(ValidationError::MissingField("pass").into());
        }
        let Some(u) = self.find_user(email).await? else {
            tracing::info!(email = %normalize_email(email), "reset rejected: unknown identity");
            return Err(AuthError::InvalidOtp.into());
        };

        self.otp.consume_code(&u.email, code).await?;

        let password_hash = self.hasher.hash(new_password.to_string()).await?;
        let mut active: user::ActiveModel = u.into();
        active.password_hash = Set(password_hash);
        active.updated_at = Set(now_ts());
        active.update(&self.db).await?;
        Ok(())
    }

    /// Change the caller's own password, proving knowledge of the current one.
    pub async fn change_password(&self, email: &str, old_password: &str, new_password: &str) -> Result<()> {
        if new_password.is_empty() {
            return Err(ValidationError::MissingField("pass").into());
        }
        let Some(u) = self.find_user(email).await? else {
            return Err(NotFound::User.into());
        };

        if !self
            .hasher
            .verify(u.password_hash.clone(), old_password.to_string())
            .await?
        {
            tracing::info!(user_id = %u.id, "password change rejected: current password mismatch");
            return Err(AuthError::InvalidCredentials.into());
        }

        let password_hash = self.hasher.hash(new_password.to_string()).await?;
        let user_id = u.id.clone();
        let mut active: user::ActiveModel = u.into();
        active.password_hash = Set(password_hash);
        active.updated_at = Set(now_ts());
        active.update(&self.db).await?;
        tracing::info!(%user_id, "password changed");
        Ok(())
    }

    /// Administrator-only tier change. The reserved administrator keeps its tier.
    pub async fn set_tier(&self, caller: &SessionClaims, email: &str, tier: Tier) -> Result<user::Model> {
        require_admin(caller)?;
        let Some(u) = self.find_user(email).await? else {
            return Err(NotFound::User.into());
        };
        if u.email == ADMIN_EMAIL {
            return Err(AuthError::Forbidden.into());
        }

        let mut active: user::ActiveModel = u.into();
        active.role = Set(tier.code());
        active.updated_at = Set(now_ts());
        let updated = active.update(&self.db).await?;
        tracing::info!(by = %caller.email, user_id = %updated.id, tier = tier.code(), "tier changed");
        Ok(updated)
    }

    /// Create or re-secret the reserved administrator in a single upsert.
    pub async fn ensure_admin(&self, secret: &str) -> Result<()> {
        let password_hash = self.hasher.hash(secret.to_string()).await?;
        let id = generate_user_id().map_err(|e| Error::Hashing(e.to_string()))?;
        let now = now_ts();

        user::Entity::insert(user::ActiveModel {
            id: Set(id),
            email: Set(ADMIN_EMAIL.to_string()),
            full_name: Set("admin".to_string()),
            password_hash: Set(password_hash),
            role: Set(Tier::Administrator.code()),
            instance: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        })
        .on_conflict(
            OnConflict::column(user::Column::Email)
                .update_columns([
                    user::Column::PasswordHash,
                    user::Column::Role,
                    user::Column::UpdatedAt,
                ])
                .to_owned(),
        )
        .exec_without_returning(&self.db)
        .await?;

        tracing::info!(email = ADMIN_EMAIL, "administrator account ensured");
        Ok(())
    }
}
