//! One-time passcodes bound to an identity.
//!
//! Each identity has at most one record. A request inside the expiry window returns the
//! stored code untouched; after the window the code is rotated in place. Both transitions
//! are single conditional statements against the `otp_codes` primary key, so concurrent
//! callers for the same identity always converge on one live code.

use std::sync::Arc;

use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter, Set};
use subtle::ConstantTimeEq;

use entity::otp_code;

use crate::error::{AuthError, Error, Result, ValidationError};
use crate::notify::{deliver, Notifier};
use crate::util::{normalize_email, now_ts, random_code, CODE_ALPHABET};

/// Lifetime of a code: 5 minutes.
pub const OTP_EXPIRY_SECS: i64 = 5 * 60;

pub const DEFAULT_OTP_LENGTH: usize = 4;

/// Wrong guesses a live code tolerates before it is destroyed.
pub const MAX_OTP_ATTEMPTS: i32 = 5;

/// Insert/rotate rounds before giving up on a contended identity.
const MAX_ROUNDS: usize = 4;

/// A code is dead once strictly more than `OTP_EXPIRY_SECS` have passed since creation.
pub fn is_expired(record: &otp_code::Model, now: i64) -> bool {
    now - record.created_at > OTP_EXPIRY_SECS
}

fn generate(len: usize) -> Result<String> {
    random_code(CODE_ALPHABET, len)
        .map_err(|e| Error::Hashing(format!("entropy source unavailable: {e}")))
}

#[derive(Clone)]
pub struct OtpManager {
    db: DatabaseConnection,
    notifier: Arc<dyn Notifier>,
}

impl OtpManager {
    pub fn new(db: DatabaseConnection, notifier: Arc<dyn Notifier>) -> Self {
        Self { db, notifier }
    }

    pub async fn request_code(&self, email: &str, len: usize) -> Result<otp_code::Model> {
        self.request_code_at(email, len, now_ts()).await
    }

    pub async fn request_code_at(&self, email: &str, len: usize, now: i64) -> Result<otp_code::Model> {
        if len == 0 {
            return Err(ValidationError::InvalidLength.into());
        }
        let email = normalize_email(email);

        for _ in 0..MAX_ROUNDS {
            // Absent -> Live. Loses silently to any existing row.
            let code = generate(len)?;
            let inserted = otp_code::Entity::insert(otp_code::ActiveModel {
                email: Set(email.clone()),
                code: Set(code.clone()),
                created_at: Set(now),
                attempts: Set(0),
            })
            .on_conflict(
                OnConflict::column(otp_code::Column::Email)
                    .do_nothing()
                    .to_owned(),
            )
            .exec_without_returning(&self.db)
            .await?;

            if inserted == 1 {
                tracing::debug!(%email, "issued new one-time code");
                return Ok(otp_code::Model {
                    email,
                    code,
                    created_at: now,
                    attempts: 0,
                });
            }

            let Some(current) = otp_code::Entity::find_by_id(email.clone()).one(&self.db).await? else {
                // Consumed or cleaned up between the two statements.
                continue;
            };

            if !is_expired(&current, now) {
                return Ok(current);
            }

            // Expired -> Live, only if nobody rotated it since we read it.
            let code = generate(len)?;
            let rotated = otp_code::Entity::update_many()
                .col_expr(otp_code::Column::Code, Expr::value(code.clone()))
                .col_expr(otp_code::Column::CreatedAt, Expr::value(now))
                .col_expr(otp_code::Column::Attempts, Expr::value(0))
                .filter(otp_code::Column::Email.eq(email.as_str()))
                .filter(otp_code::Column::CreatedAt.eq(current.created_at))
                .exec(&self.db)
                .await?;

            if rotated.rows_affected == 1 {
                tracing::debug!(%email, "rotated expired one-time code");
                return Ok(otp_code::Model {
                    email,
                    code,
                    created_at: now,
                    attempts: 0,
                });
            }
        }

        Err(Error::Persistence(DbErr::Custom(format!(
            "one-time code for {email} is under contention"
        ))))
    }

    /// Request a code and hand it to the notifier without waiting for delivery.
    pub async fn request_and_deliver(&self, email: &str, len: usize) -> Result<otp_code::Model> {
        let record = self.request_code(email, len).await?;
        deliver(
            self.notifier.clone(),
            record.email.clone(),
            "Your verification code".to_string(),
            format!(
                "Your one-time code is {}. It expires {} minutes after it was issued.",
                record.code,
                OTP_EXPIRY_SECS / 60
            ),
        );
        Ok(record)
    }

    pub async fn find(&self, email: &str) -> Result<Option<otp_code::Model>> {
        Ok(otp_code::Entity::find_by_id(normalize_email(email))
            .one(&self.db)
            .await?)
    }

    pub async fn consume_code(&self, email: &str, code: &str) -> Result<()> {
        self.consume_code_at(email, code, now_ts()).await
    }

    /// Accept a live, matching code exactly once.
    pub async fn consume_code_at(&self, email: &str, code: &str, now: i64) -> Result<()> {
        let email = normalize_email(email);
        let Some(current) = otp_code::Entity::find_by_id(email.clone()).one(&self.db).await? else {
            return Err(AuthError::InvalidOtp.into());
        };

        if is_expired(&current, now) {
            return Err(AuthError::InvalidOtp.into());
        }

        let matches: bool = current.code.as_bytes().ct_eq(code.trim().as_bytes()).into();
        if !matches {
            self.record_failed_attempt(&current).await?;
            return Err(AuthError::InvalidOtp.into());
        }

        let deleted = otp_code::Entity::delete_many()
            .filter(otp_code::Column::Email.eq(email.as_str()))
            .filter(otp_code::Column::Code.eq(current.code.as_str()))
            .filter(otp_code::Column::CreatedAt.eq(current.created_at))
            .filter(otp_code::Column::Attempts.lt(MAX_OTP_ATTEMPTS))
            .exec(&self.db)
            .await?;

        if deleted.rows_affected != 1 {
            return Err(AuthError::InvalidOtp.into());
        }
        Ok(())
    }

    /// Count a wrong guess against the live code; destroy the code once it runs out.
    async fn record_failed_attempt(&self, current: &otp_code::Model) -> Result<()> {
        otp_code::Entity::update_many()
            .col_expr(
                otp_code::Column::Attempts,
                Expr::col(otp_code::Column::Attempts).add(1),
            )
            .filter(otp_code::Column::Email.eq(current.email.as_str()))
            .filter(otp_code::Column::CreatedAt.eq(current.created_at))
            .exec(&self.db)
            .await?;

        let burned = otp_code::Entity::delete_many()
            .filter(otp_code::Column::Email.eq(current.email.as_str()))
            .filter(otp_code::Column::Attempts.gte(MAX_OTP_ATTEMPTS))
            .exec(&self.db)
            .await?;
        if burned.rows_affected > 0 {
            tracing::warn!(
                target: "security",
                email = %current.email,
                "one-time code destroyed after too many wrong guesses"
            );
        }
        Ok(())
    }

    /// Delete every expired record. Returns the number removed.
    pub async fn cleanup_expired(&self, now: i64) -> Result<u64> {
        let res = otp_code::Entity::delete_many()
            .filter(otp_code::Column::CreatedAt.lt(now - OTP_EXPIRY_SECS))
            .exec(&self.db)
            .await?;
        Ok(res.rows_affected)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use sea_orm::PaginatorTrait;

    use super::*;
    use crate::db::testing::memory_db;
    use crate::notify::testing::RecordingNotifier;
    use crate::notify::LogNotifier;

    async fn manager() -> OtpManager {
        OtpManager::new(memory_db().await, Arc::new(LogNotifier))
    }

    const T0: i64 = 1_750_000_000;

    #[tokio::test]
    async fn zero_length_is_rejected() {
        let otp = manager().await;
        let err = otp.request_code_at("a@b.com", 0, T0).await.unwrap_err();
        assert!(matches!(err, Error::Validation(ValidationError::InvalidLength)));
        assert!(otp.find("a@b.com").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn codes_have_requested_length_and_alphabet() {
        let otp = manager().await;
        let rec = otp.request_code_at("a@b.com", 12, T0).await.unwrap();
        assert_eq!(rec.code.len(), 12);
        assert!(rec.code.bytes().all(|c| c.is_ascii_alphanumeric()));
    }

    #[tokio::test]
    async fn expiry_boundary() {
        let rec = otp_code::Model {
            email: "a@b.com".to_string(),
            code: "abcd".to_string(),
            created_at: T0,
            attempts: 0,
        };
        assert!(!is_expired(&rec, T0));
        assert!(!is_expired(&rec, T0 + OTP_EXPIRY_SECS));
        assert!(is_expired(&rec, T0 + OTP_EXPIRY_SECS + 1));
    }

    #[tokio::test]
    async fn re_request_within_window_returns_same_code() {
        let otp = manager().await;
        let first = otp.request_code_at("a@b.com", 4, T0).await.unwrap();
        let second = otp.request_code_at("A@B.com ", 4, T0 + 120).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(second.created_at, T0);
    }

    /// a@b.com asks twice within two minutes, waits six, asks again.
    #[tokio::test]
    async fn rotates_after_expiry() {
        let otp = manager().await;
        let first = otp.request_code_at("a@b.com", 4, T0).await.unwrap();
        let again = otp.request_code_at("a@b.com", 4, T0 + 120).await.unwrap();
        assert_eq!(first.code, again.code);

        let later = T0 + 6 * 60;
        assert!(is_expired(&first, later));

        let rotated = otp.request_code_at("a@b.com", 4, later).await.unwrap();
        assert_ne!(rotated.code, first.code);
        assert_eq!(rotated.created_at, later);
        assert!(!is_expired(&rotated, later));

        let stored = otp.find("a@b.com").await.unwrap().unwrap();
        assert_eq!(stored, rotated);
    }

    #[tokio::test]
    async fn concurrent_first_requests_share_one_record() {
        let otp = manager().await;

        let mut handles = Vec::new();
        for _ in 0..16 {
            let otp = otp.clone();
            handles.push(tokio::spawn(async move {
                otp.request_code_at("race@b.com", 6, T0).await.unwrap()
            }));
        }

        let mut codes = Vec::new();
        for h in handles {
            codes.push(h.await.unwrap().code);
        }
        codes.dedup();
        assert_eq!(codes.len(), 1);

        let rows = otp_code::Entity::find().count(&otp.db).await.unwrap();
        assert_eq!(rows, 1);
    }

    #[tokio::test]
    async fn concurrent_rotation_converges() {
        let otp = manager().await;
        otp.request_code_at("race@b.com", 6, T0).await.unwrap();

        let later = T0 + OTP_EXPIRY_SECS + 10;
        let mut handles = Vec::new();
        for _ in 0..8 {
            let otp = otp.clone();
            handles.push(tokio::spawn(async move {
                otp.request_code_at("race@b.com", 6, later).await.unwrap()
            }));
        }

        let mut codes = Vec::new();
        for h in handles {
            codes.push(h.await.unwrap().code);
        }
        codes.dedup();
        assert_eq!(codes.len(), 1);
    }

    #[tokio::test]
    async fn codes_are_single_use() {
        let otp = manager().await;
        let rec = otp.request_code_at("a@b.com", 4, T0).await.unwrap();

        let wrong = if rec.code == "zzzz" { "yyyy" } else { "zzzz" };
        assert!(matches!(
            otp.consume_code_at("a@b.com", wrong, T0 + 1).await,
            Err(Error::Auth(AuthError::InvalidOtp))
        ));

        otp.consume_code_at("a@b.com", &rec.code, T0 + 1).await.unwrap();
        assert!(matches!(
            otp.consume_code_at("a@b.com", &rec.code, T0 + 2).await,
            Err(Error::Auth(AuthError::InvalidOtp))
        ));
        assert!(otp.find("a@b.com").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn repeated_wrong_guesses_destroy_the_code() {
        let otp = manager().await;
        let rec = otp.request_code_at("a@b.com", 4, T0).await.unwrap();
        let wrong = if rec.code == "zzzz" { "yyyy" } else { "zzzz" };

        for _ in 0..MAX_OTP_ATTEMPTS {
            assert!(matches!(
                otp.consume_code_at("a@b.com", wrong, T0 + 1).await,
                Err(Error::Auth(AuthError::InvalidOtp))
            ));
        }
        assert!(otp.find("a@b.com").await.unwrap().is_none());
        assert!(matches!(
            otp.consume_code_at("a@b.com", &rec.code, T0 + 2).await,
            Err(Error::Auth(AuthError::InvalidOtp))
        ));
    }

    #[tokio::test]
    async fn guesses_below_the_limit_keep_the_code_alive() {
        let otp = manager().await;
        let rec = otp.request_code_at("a@b.com", 4, T0).await.unwrap();
        let wrong = if rec.code == "zzzz" { "yyyy" } else { "zzzz" };

        for _ in 1..MAX_OTP_ATTEMPTS {
            otp.consume_code_at("a@b.com", wrong, T0 + 1).await.unwrap_err();
        }
        assert_eq!(
            otp.find("a@b.com").await.unwrap().unwrap().attempts,
            MAX_OTP_ATTEMPTS - 1
        );
        otp.consume_code_at("a@b.com", &rec.code, T0 + 2).await.unwrap();
    }

    #[tokio::test]
    async fn rotation_resets_the_attempt_count() {
        let otp = manager().await;
        let rec = otp.request_code_at("a@b.com", 4, T0).await.unwrap();
        let wrong = if rec.code == "zzzz" { "yyyy" } else { "zzzz" };
        otp.consume_code_at("a@b.com", wrong, T0 + 1).await.unwrap_err();

        let rotated = otp
            .request_code_at("a@b.com", 4, T0 + OTP_EXPIRY_SECS + 1)
            .await
            .unwrap();
        assert_eq!(rotated.attempts, 0);
        assert_eq!(otp.find("a@b.com").await.unwrap(), Some(rotated));
    }

    #[tokio::test]
    async fn expired_codes_cannot_be_consumed() {
        let otp = manager().await;
        let rec = otp.request_code_at("a@b.com", 4, T0).await.unwrap();
        assert!(matches!(
            otp.consume_code_at("a@b.com", &rec.code, T0 + OTP_EXPIRY_SECS + 1).await,
            Err(Error::Auth(AuthError::InvalidOtp))
        ));
    }

    #[tokio::test]
    async fn cleanup_removes_only_expired() {
        let otp = manager().await;
        otp.request_code_at("old@b.com", 4, T0).await.unwrap();
        otp.request_code_at("new@b.com", 4, T0 + 400).await.unwrap();

        let removed = otp.cleanup_expired(T0 + 450).await.unwrap();
        assert_eq!(removed, 1);
        assert!(otp.find("old@b.com").await.unwrap().is_none());
        assert!(otp.find("new@b.com").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn delivery_failure_keeps_the_record() {
        let notifier = Arc::new(RecordingNotifier {
            fail: true,
            ..Default::default()
        });
        let otp = OtpManager::new(memory_db().await, notifier.clone());

        let rec = otp.request_and_deliver("a@b.com", 4).await.unwrap();
        for _ in 0..50 {
            if !notifier.sent.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let sent = notifier.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "a@b.com");
        assert!(sent[0].2.contains(&rec.code));
        assert_eq!(otp.find("a@b.com").await.unwrap(), Some(rec));
    }
}
