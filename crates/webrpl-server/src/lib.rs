//! Credential and certificate-issuance backend.
//!
//! Services are plain cloneable structs over a shared SeaORM connection; `handlers`
//! wires them into an axum router through [`AppState`].

pub mod assets;
pub mod brevo;
pub mod credentials;
pub mod crypto;
pub mod db;
pub mod env;
pub mod error;
pub mod handlers;
pub mod http;
pub mod jwt;
pub mod notify;
pub mod otp;
pub mod participation;
pub mod render;
pub mod store;
pub mod util;

use std::sync::Arc;

use sea_orm::DatabaseConnection;

use assets::AssetPipeline;
use credentials::CredentialService;
use crypto::Hasher;
use env::Config;
use error::Result;
use jwt::TokenIssuer;
use notify::Notifier;
use otp::OtpManager;
use participation::ParticipationService;
use render::{RenderEngine, TemplateCache};
use store::{BlobStore, FsBlobStore};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub issuer: TokenIssuer,
    pub credentials: CredentialService,
    pub otp: OtpManager,
    pub participation: ParticipationService,
    pub assets: AssetPipeline,
    pub renderer: RenderEngine,
    pub store: Arc<dyn BlobStore>,
}

impl AppState {
    /// Wire every service over one connection. Fails only on an unusable secret.
    pub fn build(config: Config, db: DatabaseConnection, notifier: Arc<dyn Notifier>) -> Result<Self> {
        let issuer = TokenIssuer::new(&config.secret_key)?;
        let hasher = Hasher::new(config.hash_workers, config.password_iterations);
        let store: Arc<dyn BlobStore> = Arc::new(FsBlobStore::new(config.static_dir.clone()));
        let cache = TemplateCache::new();

        let otp = OtpManager::new(db.clone(), notifier);
        let credentials = CredentialService::new(db.clone(), hasher, issuer.clone(), otp.clone());
        let participation = ParticipationService::new(db.clone());
        let assets = AssetPipeline::new(
            db.clone(),
            store.clone(),
            cache.clone(),
            config.public_base_url.clone(),
        );
        let renderer = RenderEngine::new(db, store.clone(), cache);

        Ok(Self {
            config: Arc::new(config),
            issuer,
            credentials,
            otp,
            participation,
            assets,
            renderer,
            store,
        })
    }
}
