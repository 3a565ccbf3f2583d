//! Certificate rendering.
//!
//! Templates are admin-uploaded and can change between any two requests. Every render
//! reads the current bytes from the store and looks the parsed form up by SHA-256 of
//! those bytes, so a re-upload is picked up immediately while unchanged templates are
//! parsed only once.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex};

use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter};
use sha2::{Digest, Sha256};

use entity::{cert_template, event, event_participant, user};

use crate::error::{Error, NotFound, Result};
use crate::store::BlobStore;
use crate::util::now_ts;

const TEMPLATE_SUFFIX: &str = ".html";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    UniqueId,
    EventName,
    UserName,
}

impl Field {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "UniqueID" => Some(Field::UniqueId),
            "EventName" => Some(Field::EventName),
            "UserName" => Some(Field::UserName),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Text(String),
    Field(Field),
}

/// A template split into literal text and `{{.Field}}` placeholders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedTemplate {
    segments: Vec<Segment>,
}

impl ParsedTemplate {
    /// Unknown placeholders are kept verbatim.
    pub fn parse(source: &str) -> Self {
        let mut segments = Vec::new();
        let mut text = String::new();
        let mut rest = source;

        while let Some(open) = rest.find("{{") {
            let after_open = &rest[open + 2..];
            let Some(close) = after_open.find("}}") else {
                break;
            };
            let inner = after_open[..close].trim();
            let name = inner.strip_prefix('.').unwrap_or(inner).trim();

            text.push_str(&rest[..open]);
            match Field::parse(name) {
                Some(field) => {
                    if !text.is_empty() {
                        segments.push(Segment::Text(std::mem::take(&mut text)));
                    }
                    segments.push(Segment::Field(field));
                }
                None => text.push_str(&rest[open..open + 2 + close + 2]),
            }
            rest = &after_open[close + 2..];
        }

        text.push_str(rest);
        if !text.is_empty() {
            segments.push(Segment::Text(text));
        }
        Self { segments }
    }

    pub fn render(&self, ctx: &RenderContext) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Text(t) => out.push_str(t),
                Segment::Field(Field::UniqueId) => push_escaped(&mut out, &ctx.unique_id),
                Segment::Field(Field::EventName) => push_escaped(&mut out, &ctx.event_name),
                Segment::Field(Field::UserName) => push_escaped(&mut out, &ctx.user_name),
            }
        }
        out
    }
}

fn push_escaped(out: &mut String, value: &str) {
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&#34;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
}

struct CachedTemplate {
    digest: [u8; 32],
    template: Arc<ParsedTemplate>,
}

/// Parsed templates keyed by store path and validated by content digest.
#[derive(Clone, Default)]
pub struct TemplateCache {
    entries: Arc<Mutex<HashMap<String, CachedTemplate>>>,
}

impl TemplateCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_parse(&self, path: &str, bytes: &[u8]) -> Arc<ParsedTemplate> {
        let digest: [u8; 32] = Sha256::digest(bytes).into();

        // A poisoned lock only means another render panicked; the map is still usable.
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(hit) = entries.get(path) {
            if hit.digest == digest {
                return hit.template.clone();
            }
        }

        let template = Arc::new(ParsedTemplate::parse(&String::from_utf8_lossy(bytes)));
        entries.insert(
            path.to_string(),
            CachedTemplate {
                digest,
                template: template.clone(),
            },
        );
        template
    }

    pub fn invalidate_path(&self, path: &str) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(path);
    }

    pub fn invalidate(&self) {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Everything needed to render one participant's certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderContext {
    pub unique_id: String,
    pub event_name: String,
    pub user_name: String,
    pub template_path: String,
}

#[derive(Clone)]
pub struct RenderEngine {
    db: DatabaseConnection,
    store: Arc<dyn BlobStore>,
    cache: TemplateCache,
}

impl RenderEngine {
    pub fn new(db: DatabaseConnection, store: Arc<dyn BlobStore>, cache: TemplateCache) -> Self {
        Self { db, store, cache }
    }

    pub async fn resolve(&self, participation_code: &str) -> Result<RenderContext> {
        self.resolve_at(participation_code, now_ts()).await
    }

    /// Look up an attended participation whose event has ended.
    ///
    /// Absent and not-attended participations both report `NotFound::Participation`.
    pub async fn resolve_at(&self, participation_code: &str, now: i64) -> Result<RenderContext> {
        let Some(part) = event_participant::Entity::find()
            .filter(event_participant::Column::Code.eq(participation_code))
            .filter(event_participant::Column::Attended.eq(true))
            .one(&self.db)
            .await?
        else {
            return Err(NotFound::Participation.into());
        };

        let Some(ev) = event::Entity::find_by_id(part.event_id).one(&self.db).await? else {
            return Err(NotFound::Event.into());
        };
        if ev.ends_at > now {
            return Err(Error::NotYetEligible { ends_at: ev.ends_at });
        }

        let Some(u) = user::Entity::find_by_id(part.user_id.clone()).one(&self.db).await? else {
            return Err(NotFound::User.into());
        };

        let Some(tpl) = cert_template::Entity::find()
            .filter(cert_template::Column::EventId.eq(ev.id))
            .one(&self.db)
            .await?
        else {
            return Err(NotFound::Template.into());
        };

        Ok(RenderContext {
            unique_id: part.code,
            event_name: ev.name,
            user_name: u.full_name,
            template_path: tpl.template_path,
        })
    }

    pub async fn render(&self, template_path: &str, ctx: &RenderContext) -> Result<String> {
        let stem = template_path
            .strip_suffix(TEMPLATE_SUFFIX)
            .unwrap_or(template_path);
        let file = format!("{stem}{TEMPLATE_SUFFIX}");

        let bytes = match self.store.read(&file).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return Err(NotFound::TemplateFile(file).into()),
            Err(e) if e.kind() == io::ErrorKind::InvalidInput => {
                return Err(NotFound::TemplateFile(file).into())
            }
            Err(e) => return Err(e.into()),
        };

        Ok(self.cache.get_or_parse(&file, &bytes).render(ctx))
    }

    /// Resolve and render in one step.
    pub async fn certificate(&self, participation_code: &str) -> Result<String> {
        let ctx = self.resolve(participation_code).await?;
        self.render(&ctx.template_path, &ctx).await
    }
}

#[cfg(test)]
mod tests {
    use sea_orm::{ActiveModelTrait, Set};

    use super::*;
    use crate::db::testing::{insert_event, insert_participant, insert_user, memory_db};
    use crate::store::FsBlobStore;

    const NOW: i64 = 1_750_000_000;

    fn ctx() -> RenderContext {
        RenderContext {
            unique_id: "Xy12".to_string(),
            event_name: "Rust & You".to_string(),
            user_name: "<Alice>".to_string(),
            template_path: "sertifikat/1/index.html".to_string(),
        }
    }

    async fn add_template(db: &DatabaseConnection, event_id: i32, path: &str) {
        cert_template::ActiveModel {
            event_id: Set(event_id),
            template_path: Set(path.to_string()),
            created_at: Set(0),
            updated_at: Set(0),
            ..Default::default()
        }
        .insert(db)
        .await
        .unwrap();
    }

    #[test]
    fn substitutes_and_escapes() {
        let tpl = ParsedTemplate::parse(
            "<p>{{.UserName}}</p><p>{{ .EventName }}</p><small>{{UniqueID}}</small>{{.Other}}",
        );
        assert_eq!(
            tpl.render(&ctx()),
            "<p>&lt;Alice&gt;</p><p>Rust &amp; You</p><small>Xy12</small>{{.Other}}"
        );
    }

    #[test]
    fn unterminated_braces_are_literal() {
        let tpl = ParsedTemplate::parse("a {{.UserName b");
        assert_eq!(tpl.render(&ctx()), "a {{.UserName b");
    }

    #[test]
    fn cache_reuses_until_content_changes() {
        let cache = TemplateCache::new();
        let a = cache.get_or_parse("t.html", b"{{.UserName}}");
        let b = cache.get_or_parse("t.html", b"{{.UserName}}");
        assert!(Arc::ptr_eq(&a, &b));

        let c = cache.get_or_parse("t.html", b"Hi {{.UserName}}");
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(c.render(&ctx()), "Hi &lt;Alice&gt;");
        assert_eq!(cache.len(), 1);

        cache.invalidate();
        assert!(cache.is_empty());
    }

    async fn engine() -> (RenderEngine, DatabaseConnection, tempfile::TempDir) {
        let db = memory_db().await;
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn BlobStore> = Arc::new(FsBlobStore::new(dir.path()));
        (RenderEngine::new(db.clone(), store, TemplateCache::new()), db, dir)
    }

    #[tokio::test]
    async fn eligibility_rules() {
        let (engine, db, _dir) = engine().await;
        let u = insert_user(&db, "u1", "a@b.com", 0).await;
        let absent = insert_user(&db, "u2", "z@b.com", 0).await;
        let past = insert_event(&db, "Past", NOW - 60).await;
        let future = insert_event(&db, "Future", NOW + 3600).await;
        add_template(&db, past.id, "sertifikat/1/index.html").await;
        add_template(&db, future.id, "sertifikat/2/index.html").await;

        insert_participant(&db, past.id, &absent.id, "normal", false, "absent").await;
        insert_participant(&db, future.id, &u.id, "normal", true, "early").await;
        insert_participant(&db, past.id, &u.id, "normal", true, "ok").await;

        assert!(matches!(
            engine.resolve_at("absent", NOW).await,
            Err(Error::NotFound(NotFound::Participation))
        ));
        assert!(matches!(
            engine.resolve_at("missing", NOW).await,
            Err(Error::NotFound(NotFound::Participation))
        ));
        assert!(matches!(
            engine.resolve_at("early", NOW).await,
            Err(Error::NotYetEligible { .. })
        ));

        let ctx = engine.resolve_at("ok", NOW).await.unwrap();
        assert_eq!(ctx.unique_id, "ok");
        assert_eq!(ctx.event_name, "Past");
        assert_eq!(ctx.user_name, "User u1");
        assert_eq!(ctx.template_path, "sertifikat/1/index.html");

        // Eligibility is evaluated per call.
        assert!(engine.resolve_at("early", NOW + 7200).await.is_ok());
    }

    #[tokio::test]
    async fn missing_template_row_and_file_are_distinct() {
        let (engine, db, _dir) = engine().await;
        let u = insert_user(&db, "u1", "a@b.com", 0).await;
        let ev = insert_event(&db, "Past", NOW - 60).await;
        insert_participant(&db, ev.id, &u.id, "normal", true, "code").await;

        assert!(matches!(
            engine.resolve_at("code", NOW).await,
            Err(Error::NotFound(NotFound::Template))
        ));

        add_template(&db, ev.id, "sertifikat/9/index.html").await;
        let ctx = engine.resolve_at("code", NOW).await.unwrap();
        assert!(matches!(
            engine.render(&ctx.template_path, &ctx).await,
            Err(Error::NotFound(NotFound::TemplateFile(_)))
        ));
    }

    #[tokio::test]
    async fn render_always_serves_latest_upload() {
        let (engine, _db, dir) = engine().await;
        let file = dir.path().join("sertifikat/1/index.html");
        std::fs::create_dir_all(file.parent().unwrap()).unwrap();

        std::fs::write(&file, "v1 {{.UserName}}").unwrap();
        assert_eq!(
            engine.render("sertifikat/1/index.html", &ctx()).await.unwrap(),
            "v1 &lt;Alice&gt;"
        );

        std::fs::write(&file, "v2 {{.EventName}}").unwrap();
        assert_eq!(
            engine.render("sertifikat/1/index", &ctx()).await.unwrap(),
            "v2 Rust &amp; You"
        );
    }
}
