pub use sea_orm_migration::prelude::*;

mod m20260301_000001_users_and_otp;
mod m20260301_000002_events_and_participants;
mod m20260301_000003_cert_templates;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20260301_000001_users_and_otp::Migration),
            Box::new(m20260301_000002_events_and_participants::Migration),
            Box::new(m20260301_000003_cert_templates::Migration),
        ]
    }
}
