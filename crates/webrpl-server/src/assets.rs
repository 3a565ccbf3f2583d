//! Certificate template uploads.
//!
//! Every payload is decoded and sniffed before anything touches the store. Archives are
//! vetted entry-by-entry first and then written as one batch, so a rejected archive
//! leaves no files behind.

use std::io::{Cursor, Read};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use sea_orm::sea_query::OnConflict;
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set};
use serde::Serialize;

use entity::{cert_template, event};

use crate::error::{AuthError, Error, IntegrityError, NotFound, Result, ValidationError};
use crate::jwt::SessionClaims;
use crate::participation::is_committee_for;
use crate::render::TemplateCache;
use crate::store::BlobStore;
use crate::util::now_ts;

pub const TEMPLATE_ROOT: &str = "sertifikat";
pub const TEMPLATE_FILE: &str = "index.html";
pub const BACKGROUND_FILE: &str = "bg.png";

/// Placeholder in uploaded HTML that is rewritten to the background image URL.
pub const IMAGE_PLACEHOLDER: &str = "@@";

pub const PNG_SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];

const HTML_PREFIXES: [&str; 10] = [
    "<!doctype html",
    "<html",
    "<head",
    "<body",
    "<!--",
    "<meta",
    "<style",
    "<div",
    "<title",
    "<p",
];

const MAX_ARCHIVE_ENTRIES: usize = 64;
const MAX_ENTRY_BYTES: u64 = 8 * 1024 * 1024;
const MAX_ARCHIVE_BYTES: u64 = 32 * 1024 * 1024;

/// Store paths written by an upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredPaths {
    pub saved_html: String,
    /// `None` when the upload carried no background image.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub saved_image: Option<String>,
}

pub fn template_dir(event_id: i32) -> String {
    format!("{TEMPLATE_ROOT}/{event_id}")
}

pub fn template_path(event_id: i32) -> String {
    format!("{}/{TEMPLATE_FILE}", template_dir(event_id))
}

pub fn background_path(event_id: i32) -> String {
    format!("{}/{BACKGROUND_FILE}", template_dir(event_id))
}

/// Drop a `data:<mime>;base64,` prefix if present.
pub fn strip_data_uri(payload: &str) -> &str {
    match payload.find(',') {
        Some(i) => &payload[i + 1..],
        None => payload,
    }
}

pub fn decode_payload(payload: &str) -> Result<Vec<u8>> {
    let body = strip_data_uri(payload.trim()).trim();
    if body.is_empty() {
        return Err(ValidationError::Base64.into());
    }
    STANDARD
        .decode(body.as_bytes())
        .map_err(|_| ValidationError::Base64.into())
}

pub fn sniff_png(bytes: &[u8]) -> std::result::Result<(), IntegrityError> {
    if bytes.starts_with(&PNG_SIGNATURE) {
        Ok(())
    } else {
        Err(IntegrityError::NotPng)
    }
}

pub fn sniff_html(bytes: &[u8]) -> std::result::Result<&str, IntegrityError> {
    let text = std::str::from_utf8(bytes).map_err(|_| IntegrityError::NotHtml)?;
    let head = text.trim_start_matches('\u{feff}').trim_start();

    let accepted = HTML_PREFIXES.iter().any(|prefix| {
        head.get(..prefix.len())
            .is_some_and(|h| h.eq_ignore_ascii_case(prefix))
    });
    if accepted {
        Ok(text)
    } else {
        Err(IntegrityError::NotHtml)
    }
}

fn security_reject(event_id: i32, err: IntegrityError) -> Error {
    tracing::warn!(target: "security", event_id, error = %err, "template upload rejected");
    err.into()
}

/// Entry names must be plain relative paths.
fn check_entry_name(name: &str) -> std::result::Result<(), IntegrityError> {
    let bad = name.is_empty()
        || name.contains("..")
        || name.starts_with('/')
        || name.starts_with('\\')
        || name.contains(':')
        || name.contains('\0');
    if bad {
        Err(IntegrityError::PathTraversal(name.to_string()))
    } else {
        Ok(())
    }
}

/// Vet and decompress an archive. Nothing is written here.
fn read_archive(event_id: i32, bytes: Vec<u8>) -> Result<Vec<(String, Vec<u8>)>> {
    let invalid = |e: zip::result::ZipError| ValidationError::Archive(e.to_string());
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).map_err(invalid)?;

    if archive.len() > MAX_ARCHIVE_ENTRIES {
        return Err(ValidationError::Archive(format!(
            "too many entries ({} > {MAX_ARCHIVE_ENTRIES})",
            archive.len()
        ))
        .into());
    }

    // Names first: one bad entry rejects the archive before any decompression.
    let mut names = Vec::with_capacity(archive.len());
    let mut declared = 0u64;
    for i in 0..archive.len() {
        let entry = archive.by_index_raw(i).map_err(invalid)?;
        check_entry_name(entry.name()).map_err(|e| security_reject(event_id, e))?;
        let name = entry.name().replace('\\', "/");
        if entry.enclosed_name().is_none() {
            return Err(security_reject(event_id, IntegrityError::PathTraversal(name)));
        }

        declared = declared.saturating_add(entry.size());
        if entry.is_dir() {
            continue;
        }
        names.push((i, name));
    }
    if declared > MAX_ARCHIVE_BYTES {
        return Err(ValidationError::Archive("archive expands beyond the size limit".to_string()).into());
    }
    if !names.iter().any(|(_, n)| n == TEMPLATE_FILE) {
        return Err(ValidationError::Archive(format!("missing {TEMPLATE_FILE}")).into());
    }

    let mut out = Vec::with_capacity(names.len());
    let mut total = 0u64;
    for (i, name) in names {
        let entry = archive.by_index(i).map_err(invalid)?;
        let mut data = Vec::new();
        entry
            .take(MAX_ENTRY_BYTES + 1)
            .read_to_end(&mut data)
            .map_err(|e| ValidationError::Archive(e.to_string()))?;
        if data.len() as u64 > MAX_ENTRY_BYTES {
            return Err(ValidationError::Archive(format!("{name} exceeds the entry size limit")).into());
        }
        total += data.len() as u64;
        if total > MAX_ARCHIVE_BYTES {
            return Err(ValidationError::Archive("archive expands beyond the size limit".to_string()).into());
        }

        let lower = name.to_ascii_lowercase();
        if lower.ends_with(".html") || lower.ends_with(".htm") {
            sniff_html(&data).map_err(|e| security_reject(event_id, e))?;
        } else if lower.ends_with(".png") {
            sniff_png(&data).map_err(|e| security_reject(event_id, e))?;
        }
        out.push((name, data));
    }
    Ok(out)
}

#[derive(Clone)]
pub struct AssetPipeline {
    db: DatabaseConnection,
    store: Arc<dyn BlobStore>,
    cache: TemplateCache,
    public_base_url: String,
}

impl AssetPipeline {
    pub fn new(
        db: DatabaseConnection,
        store: Arc<dyn BlobStore>,
        cache: TemplateCache,
        public_base_url: impl Into<String>,
    ) -> Self {
        Self {
            db,
            store,
            cache,
            public_base_url: public_base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Public URL of an event's background image, as substituted for `@@`.
    pub fn background_url(&self, event_id: i32) -> String {
        format!("{}/static/{}", self.public_base_url, background_path(event_id))
    }

    /// Administrators, or committee members of this specific event.
    pub async fn authorize_template_access(&self, claims: &SessionClaims, event_id: i32) -> Result<()> {
        if claims.tier.is_admin() || is_committee_for(&self.db, &claims.email, event_id).await? {
            return Ok(());
        }
        tracing::info!(email = %claims.email, event_id, "template access denied");
        Err(AuthError::Forbidden.into())
    }

    async fn ensure_event(&self, event_id: i32) -> Result<()> {
        match event::Entity::find_by_id(event_id).one(&self.db).await? {
            Some(_) => Ok(()),
            None => Err(NotFound::Event.into()),
        }
    }

    fn prepare_html(&self, event_id: i32, payload: &str) -> Result<Vec<u8>> {
        let bytes = decode_payload(payload)?;
        let text = sniff_html(&bytes).map_err(|e| security_reject(event_id, e))?;
        Ok(text
            .replace(IMAGE_PLACEHOLDER, &self.background_url(event_id))
            .into_bytes())
    }

    fn prepare_image(&self, event_id: i32, payload: &str) -> Result<Vec<u8>> {
        let bytes = decode_payload(payload)?;
        sniff_png(&bytes).map_err(|e| security_reject(event_id, e))?;
        Ok(bytes)
    }

    /// Make sure the event has a template row, creating one that points at the default
    /// template path when it has none. Returns the row and whether it was created.
    pub async fn create_template_record(&self, event_id: i32) -> Result<(cert_template::Model, bool)> {
        self.ensure_event(event_id).await?;

        let now = now_ts();
        let inserted = cert_template::Entity::insert(cert_template::ActiveModel {
            event_id: Set(event_id),
            template_path: Set(template_path(event_id)),
            created_at: Set(now),
            updated_at: Set(now),
            ..Default::default()
        })
        .on_conflict(
            OnConflict::column(cert_template::Column::EventId)
                .do_nothing()
                .to_owned(),
        )
        .exec_without_returning(&self.db)
        .await?;

        let Some(row) = cert_template::Entity::find()
            .filter(cert_template::Column::EventId.eq(event_id))
            .one(&self.db)
            .await?
        else {
            return Err(NotFound::Template.into());
        };
        if inserted == 1 {
            tracing::info!(event_id, template_id = row.id, "certificate template record created");
        }
        Ok((row, inserted == 1))
    }

    async fn record_template(&self, event_id: i32) -> Result<()> {
        let now = now_ts();
        cert_template::Entity::insert(cert_template::ActiveModel {
            event_id: Set(event_id),
            template_path: Set(template_path(event_id)),
            created_at: Set(now),
            updated_at: Set(now),
            ..Default::default()
        })
        .on_conflict(
            OnConflict::column(cert_template::Column::EventId)
                .update_columns([cert_template::Column::TemplatePath, cert_template::Column::UpdatedAt])
                .to_owned(),
        )
        .exec_without_returning(&self.db)
        .await?;

        self.cache.invalidate_path(&template_path(event_id));
        Ok(())
    }

    /// Store an HTML template with its PNG background and point the event at it.
    pub async fn upload_template(
        &self,
        event_id: i32,
        html_b64: &str,
        image_b64: &str,
    ) -> Result<StoredPaths> {
        self.ensure_event(event_id).await?;
        let html = self.prepare_html(event_id, html_b64)?;
        let image = self.prepare_image(event_id, image_b64)?;

        let saved_html = template_path(event_id);
        let saved_image = background_path(event_id);
        // Image first: a template must never reference a background that is not there yet.
        self.store.write(&saved_image, &image).await?;
        self.store.write(&saved_html, &html).await?;
        self.record_template(event_id).await?;

        tracing::info!(event_id, "certificate template uploaded");
        Ok(StoredPaths {
            saved_html,
            saved_image: Some(saved_image),
        })
    }

    pub async fn upload_html(&self, event_id: i32, html_b64: &str) -> Result<String> {
        self.ensure_event(event_id).await?;
        let html = self.prepare_html(event_id, html_b64)?;

        let saved_html = template_path(event_id);
        self.store.write(&saved_html, &html).await?;
        self.record_template(event_id).await?;

        tracing::info!(event_id, "certificate html uploaded");
        Ok(saved_html)
    }

    pub async fn upload_image(&self, event_id: i32, image_b64: &str) -> Result<String> {
        self.ensure_event(event_id).await?;
        let image = self.prepare_image(event_id, image_b64)?;

        let saved_image = background_path(event_id);
        self.store.write(&saved_image, &image).await?;

        tracing::info!(event_id, "certificate background uploaded");
        Ok(saved_image)
    }

    /// Install a zipped template directory. The archive must contain `index.html` at its root.
    pub async fn upload_archive(&self, event_id: i32, zip_bytes: Vec<u8>) -> Result<StoredPaths> {
        self.ensure_event(event_id).await?;

        let entries = tokio::task::spawn_blocking(move || read_archive(event_id, zip_bytes))
            .await
            .map_err(|e| Error::Io(std::io::Error::other(e.to_string())))??;

        let has_background = entries.iter().any(|(name, _)| name == BACKGROUND_FILE);
        let dir = template_dir(event_id);
        let url = self.background_url(event_id);
        let blobs: Vec<(String, Vec<u8>)> = entries
            .into_iter()
            .map(|(name, data)| {
                let data = if name == TEMPLATE_FILE {
                    String::from_utf8_lossy(&data)
                        .replace(IMAGE_PLACEHOLDER, &url)
                        .into_bytes()
                } else {
                    data
                };
                (format!("{dir}/{name}"), data)
            })
            .collect();

        self.store.write_all(&blobs).await?;
        self.record_template(event_id).await?;

        tracing::info!(event_id, files = blobs.len(), "certificate archive installed");
        Ok(StoredPaths {
            saved_html: template_path(event_id),
            saved_image: has_background.then(|| background_path(event_id)),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use sea_orm::PaginatorTrait;
    use zip::write::SimpleFileOptions;

    use super::*;
    use crate::db::testing::{insert_event, insert_participant, insert_user, memory_db};
    use crate::jwt::Tier;
    use crate::store::FsBlobStore;

    const HTML: &str = "<!DOCTYPE html><html><body style=\"background:url(@@)\">{{.UserName}}</body></html>";

    fn png() -> Vec<u8> {
        let mut bytes = PNG_SIGNATURE.to_vec();
        bytes.extend_from_slice(b"\0\0\0\rIHDR");
        bytes
    }

    fn b64(bytes: &[u8]) -> String {
        STANDARD.encode(bytes)
    }

    fn zip_of(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        for (name, data) in entries {
            writer.start_file(*name, SimpleFileOptions::default()).unwrap();
            writer.write_all(data).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    fn files_under(root: &std::path::Path) -> usize {
        fn walk(dir: &std::path::Path, n: &mut usize) {
            if let Ok(rd) = std::fs::read_dir(dir) {
                for e in rd.flatten() {
                    let p = e.path();
                    if p.is_dir() {
                        walk(&p, n);
                    } else {
                        *n += 1;
                    }
                }
            }
        }
        let mut n = 0;
        walk(root, &mut n);
        n
    }

    async fn pipeline() -> (AssetPipeline, DatabaseConnection, tempfile::TempDir, i32) {
        let db = memory_db().await;
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn BlobStore> = Arc::new(FsBlobStore::new(dir.path().join("static")));
        let ev = insert_event(&db, "Ev", 0).await;
        let p = AssetPipeline::new(db.clone(), store, TemplateCache::new(), "http://h:3000/");
        (p, db, dir, ev.id)
    }

    #[test]
    fn data_uri_prefix_is_optional() {
        assert_eq!(strip_data_uri("data:image/png;base64,AAAA"), "AAAA");
        assert_eq!(strip_data_uri("AAAA"), "AAAA");
        assert!(matches!(
            decode_payload("data:text/html;base64,!!!"),
            Err(Error::Validation(ValidationError::Base64))
        ));
    }

    #[test]
    fn sniffing_uses_magic_bytes() {
        assert!(sniff_png(&png()).is_ok());
        assert_eq!(sniff_png(b"image/png but not really"), Err(IntegrityError::NotPng));

        assert!(sniff_html(b"\xEF\xBB\xBF  \n<!doctype HTML><p>x</p>").is_ok());
        assert!(sniff_html(b"<P>hello</P>").is_ok());
        assert_eq!(sniff_html(b"text/html"), Err(IntegrityError::NotHtml));
        assert_eq!(sniff_html(&png()), Err(IntegrityError::NotHtml));
    }

    #[test]
    fn entry_names_are_checked() {
        assert!(check_entry_name("index.html").is_ok());
        assert!(check_entry_name("img/bg.png").is_ok());
        for bad in ["../../etc/passwd", "/abs", "C:/x", "\\x", "a/../b", ""] {
            assert!(check_entry_name(bad).is_err(), "{bad}");
        }
    }

    #[tokio::test]
    async fn template_upload_writes_and_records() {
        let (p, db, dir, id) = pipeline().await;
        let paths = p.upload_template(id, &format!("data:text/html;base64,{}", b64(HTML.as_bytes())), &b64(&png()))
            .await
            .unwrap();
        assert_eq!(paths.saved_html, format!("sertifikat/{id}/index.html"));
        assert_eq!(paths.saved_image, Some(format!("sertifikat/{id}/bg.png")));

        let html = std::fs::read_to_string(dir.path().join("static").join(&paths.saved_html)).unwrap();
        assert!(html.contains(&format!("url(http://h:3000/static/sertifikat/{id}/bg.png)")));
        assert!(!html.contains("@@"));
        assert_eq!(
            std::fs::read(dir.path().join("static").join(paths.saved_image.unwrap())).unwrap(),
            png()
        );

        // Re-upload keeps one row per event.
        p.upload_html(id, &b64(HTML.as_bytes())).await.unwrap();
        let rows = cert_template::Entity::find()
            .filter(cert_template::Column::EventId.eq(id))
            .count(&db)
            .await
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[tokio::test]
    async fn invalid_payloads_write_nothing() {
        let (p, _db, dir, id) = pipeline().await;
        assert!(matches!(
            p.upload_template(id, &b64(b"hello"), &b64(&png())).await,
            Err(Error::Integrity(IntegrityError::NotHtml))
        ));
        assert!(matches!(
            p.upload_template(id, &b64(HTML.as_bytes()), &b64(b"GIF89a")).await,
            Err(Error::Integrity(IntegrityError::NotPng))
        ));
        assert!(matches!(
            p.upload_image(id, "not base64 at all").await,
            Err(Error::Validation(ValidationError::Base64))
        ));
        assert!(matches!(
            p.upload_html(id + 1, &b64(HTML.as_bytes())).await,
            Err(Error::NotFound(NotFound::Event))
        ));
        assert_eq!(files_under(dir.path()), 0);
    }

    #[tokio::test]
    async fn archive_with_traversal_is_rejected_wholesale() {
        let (p, db, dir, id) = pipeline().await;
        let zip = zip_of(&[
            ("index.html", HTML.as_bytes()),
            ("bg.png", png().as_slice()),
            ("../../etc/passwd", &b"root:x:0:0"[..]),
        ]);

        assert!(matches!(
            p.upload_archive(id, zip).await,
            Err(Error::Integrity(IntegrityError::PathTraversal(_)))
        ));
        assert_eq!(files_under(dir.path()), 0);
        assert_eq!(cert_template::Entity::find().count(&db).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn archive_installs_every_entry() {
        let (p, db, dir, id) = pipeline().await;
        let zip = zip_of(&[
            ("index.html", HTML.as_bytes()),
            ("bg.png", png().as_slice()),
            ("fonts/readme.txt", &b"fonts"[..]),
        ]);

        let paths = p.upload_archive(id, zip).await.unwrap();
        let root = dir.path().join("static");
        assert!(root.join(&paths.saved_html).is_file());
        assert!(root.join(paths.saved_image.unwrap()).is_file());
        assert!(root.join(format!("sertifikat/{id}/fonts/readme.txt")).is_file());
        assert_eq!(cert_template::Entity::find().count(&db).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn archive_without_background_reports_only_the_html() {
        let (p, _db, dir, id) = pipeline().await;
        let zip = zip_of(&[
            ("index.html", HTML.as_bytes()),
            ("img/other.png", png().as_slice()),
        ]);

        let paths = p.upload_archive(id, zip).await.unwrap();
        assert_eq!(paths.saved_image, None);
        assert!(!dir.path().join("static").join(background_path(id)).exists());
        let body = serde_json::to_value(&paths).unwrap();
        assert_eq!(body, serde_json::json!({ "saved_html": template_path(id) }));
    }

    #[tokio::test]
    async fn template_record_is_created_once() {
        let (p, db, _dir, id) = pipeline().await;

        let (row, created) = p.create_template_record(id).await.unwrap();
        assert!(created);
        assert_eq!(row.event_id, id);
        assert_eq!(row.template_path, template_path(id));

        let (again, created) = p.create_template_record(id).await.unwrap();
        assert!(!created);
        assert_eq!(again.id, row.id);
        assert_eq!(cert_template::Entity::find().count(&db).await.unwrap(), 1);

        assert!(matches!(
            p.create_template_record(id + 1).await,
            Err(Error::NotFound(NotFound::Event))
        ));
    }

    #[tokio::test]
    async fn archive_requires_template_and_valid_entries() {
        let (p, _db, dir, id) = pipeline().await;
        assert!(matches!(
            p.upload_archive(id, zip_of(&[("bg.png", png().as_slice())])).await,
            Err(Error::Validation(ValidationError::Archive(_)))
        ));
        assert!(matches!(
            p.upload_archive(id, zip_of(&[("index.html", HTML.as_bytes()), ("bg.png", &b"nope"[..])])).await,
            Err(Error::Integrity(IntegrityError::NotPng))
        ));
        assert!(matches!(
            p.upload_archive(id, b"not a zip".to_vec()).await,
            Err(Error::Validation(ValidationError::Archive(_)))
        ));
        assert_eq!(files_under(dir.path()), 0);
    }

    #[tokio::test]
    async fn template_access_is_admin_or_event_committee() {
        let (p, db, _dir, id) = pipeline().await;
        let other = insert_event(&db, "Other", 0).await;
        let c = insert_user(&db, "c1", "c@b.com", Tier::Committee.code()).await;
        insert_participant(&db, id, &c.id, "committee", false, "cmt-code").await;

        let claims = |email: &str, tier| SessionClaims {
            email: email.to_string(),
            tier,
            iat: 0,
            exp: i64::MAX,
        };

        assert!(p.authorize_template_access(&claims("x@b.com", Tier::Administrator), id).await.is_ok());
        assert!(p.authorize_template_access(&claims("c@b.com", Tier::Committee), id).await.is_ok());
        assert!(matches!(
            p.authorize_template_access(&claims("c@b.com", Tier::Committee), other.id).await,
            Err(Error::Auth(AuthError::Forbidden))
        ));
        assert!(matches!(
            p.authorize_template_access(&claims("p@b.com", Tier::Participant), id).await,
            Err(Error::Auth(AuthError::Forbidden))
        ));
    }
}
