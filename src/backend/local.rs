use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, Row};
use serde::Deserialize;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use uuid::Uuid;

use super::{AuthService, BlobStore, CaptchaVerifier, NoteStore, Subscription};
use crate::error::{ServiceError, ServiceResult};
use crate::model::{AuthProvider, NewNote, Note, NotePatch, User};

pub const LOCAL_UID: &str = "local";
const SITEVERIFY_URL: &str = "https://www.google.com/recaptcha/api/siteverify";

enum DbRequest {
    ListNotes {
        uid: String,
        reply: oneshot::Sender<ServiceResult<Vec<Note>>>,
    },
    GetNote {
        id: String,
        reply: oneshot::Sender<ServiceResult<Option<Note>>>,
    },
    CreateNote {
        note: NewNote,
        reply: oneshot::Sender<ServiceResult<String>>,
    },
    UpdateNote {
        id: String,
        patch: NotePatch,
        reply: oneshot::Sender<ServiceResult<()>>,
    },
    DeleteNote {
        id: String,
        reply: oneshot::Sender<ServiceResult<()>>,
    },
    ClearAllData {
        reply: oneshot::Sender<ServiceResult<()>>,
    },
}

/// Handle to the SQLite note store. Requests are served by a dedicated
/// thread that owns the connection.
#[derive(Clone)]
pub struct Repo {
    tx: mpsc::UnboundedSender<DbRequest>,
    revision: Arc<watch::Sender<u64>>,
}

impl Repo {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).context("Failed to create data directory")?;
        }
        let conn = Connection::open(path).context("Failed to open database")?;
        Self::spawn(conn)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::spawn(conn)
    }

    fn spawn(conn: Connection) -> anyhow::Result<Self> {
        // Fail early if the schema cannot be created.
        let mut actor = RepoInternal::new(conn).context("Failed to initialize database actor")?;
        let (tx, rx) = mpsc::unbounded_channel();

        std::thread::spawn(move || {
            actor.run(rx);
        });

        let (revision, _) = watch::channel(0);
        Ok(Self {
            tx,
            revision: Arc::new(revision),
        })
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<ServiceResult<T>>) -> DbRequest,
    ) -> ServiceResult<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .map_err(|_| ServiceError::Internal("DB actor shutdown".to_string()))?;
        rx.await
            .map_err(|_| ServiceError::Internal("DB actor dropped reply".to_string()))?
    }

    fn bump_revision(&self) {
        self.revision.send_modify(|r| *r += 1);
    }

    pub async fn list_notes(&self, uid: &str) -> ServiceResult<Vec<Note>> {
        let uid = uid.to_string();
        self.request(|reply| DbRequest::ListNotes { uid, reply }).await
    }

    pub async fn get_note(&self, id: &str) -> ServiceResult<Option<Note>> {
        let id = id.to_string();
        self.request(|reply| DbRequest::GetNote { id, reply }).await
    }

    pub async fn create_note(&self, note: NewNote) -> ServiceResult<String> {
        let id = self
            .request(|reply| DbRequest::CreateNote { note, reply })
            .await?;
        self.bump_revision();
        Ok(id)
    }

    pub async fn update_note(&self, id: &str, patch: NotePatch) -> ServiceResult<()> {
        let id = id.to_string();
        self.request(|reply| DbRequest::UpdateNote { id, patch, reply })
            .await?;
        self.bump_revision();
        Ok(())
    }

    pub async fn delete_note(&self, id: &str) -> ServiceResult<()> {
        let id = id.to_string();
        self.request(|reply| DbRequest::DeleteNote { id, reply })
            .await?;
        self.bump_revision();
        Ok(())
    }

    pub async fn clear_all_data(&self) -> ServiceResult<()> {
        self.request(|reply| DbRequest::ClearAllData { reply })
            .await?;
        self.bump_revision();
        Ok(())
    }
}

#[async_trait]
impl NoteStore for Repo {
    fn subscribe(&self, owner: &str) -> Subscription {
        let (tx, rx) = mpsc::channel(16);
        let repo = self.clone();
        let uid = owner.to_string();
        let mut revision = self.revision.subscribe();

        let producer = tokio::spawn(async move {
            loop {
                // Mark before reading so a write during the query triggers another round.
                revision.borrow_and_update();
                match repo.list_notes(&uid).await {
                    Ok(notes) => {
                        if tx.send(notes).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => tracing::error!("Local snapshot for {} failed: {}", uid, e),
                }
                if revision.changed().await.is_err() {
                    break;
                }
            }
        });

        Subscription::new(owner, rx, producer)
    }

    async fn create(&self, note: NewNote) -> ServiceResult<String> {
        self.create_note(note).await
    }

    async fn update(&self, id: &str, patch: NotePatch) -> ServiceResult<()> {
        self.update_note(id, patch).await
    }

    async fn delete(&self, id: &str) -> ServiceResult<()> {
        self.delete_note(id).await
    }
}

struct RepoInternal {
    conn: Connection,
}

impl RepoInternal {
    fn new(conn: Connection) -> rusqlite::Result<Self> {
        let internal = Self { conn };
        internal.create_tables()?;
        Ok(internal)
    }

    fn create_tables(&self) -> rusqlite::Result<()> {
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS notes (
                id TEXT PRIMARY KEY,
                uid TEXT NOT NULL,
                title TEXT NOT NULL DEFAULT '',
                content TEXT NOT NULL DEFAULT '',
                file_url TEXT,
                file_path TEXT,
                ai_summary TEXT,
                created_at TEXT,
                updated_at TEXT
            );",
            [],
        )?;
        self.conn.execute(
            "CREATE INDEX IF NOT EXISTS notes_by_owner ON notes (uid, updated_at DESC);",
            [],
        )?;
        Ok(())
    }

    fn run(&mut self, mut rx: mpsc::UnboundedReceiver<DbRequest>) {
        while let Some(req) = rx.blocking_recv() {
            match req {
                DbRequest::ListNotes { uid, reply } => {
                    let _ = reply.send(self.list_notes(&uid));
                }
                DbRequest::GetNote { id, reply } => {
                    let _ = reply.send(self.get_note(&id));
                }
                DbRequest::CreateNote { note, reply } => {
                    let _ = reply.send(self.create_note(&note));
                }
                DbRequest::UpdateNote { id, patch, reply } => {
                    let _ = reply.send(self.update_note(&id, &patch));
                }
                DbRequest::DeleteNote { id, reply } => {
                    let _ = reply.send(self.delete_note(&id));
                }
                DbRequest::ClearAllData { reply } => {
                    let _ = reply.send(self.clear_all_data());
                }
            }
        }
    }

    fn row_to_note(row: &Row<'_>) -> rusqlite::Result<Note> {
        let created_at: Option<String> = row.get(7)?;
        let updated_at: Option<String> = row.get(8)?;
        Ok(Note {
            id: row.get(0)?,
            uid: row.get(1)?,
            title: row.get(2)?,
            content: row.get(3)?,
            file_url: row.get(4)?,
            file_path: row.get(5)?,
            ai_summary: row.get(6)?,
            created_at: created_at.as_deref().and_then(parse_timestamp),
            updated_at: updated_at.as_deref().and_then(parse_timestamp),
        })
    }

    fn list_notes(&self, uid: &str) -> ServiceResult<Vec<Note>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, uid, title, content, file_url, file_path, ai_summary, created_at, updated_at
             FROM notes
             WHERE uid = ?1
             ORDER BY updated_at DESC, rowid DESC",
        )?;
        let notes = stmt
            .query_map(params![uid], Self::row_to_note)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(notes)
    }

    fn get_note(&self, id: &str) -> ServiceResult<Option<Note>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, uid, title, content, file_url, file_path, ai_summary, created_at, updated_at
             FROM notes WHERE id = ?1",
        )?;
        let mut rows = stmt.query(params![id])?;
        match rows.next()? {
            Some(row) => Ok(Some(Self::row_to_note(row)?)),
            None => Ok(None),
        }
    }

    fn create_note(&self, note: &NewNote) -> ServiceResult<String> {
        let id = Uuid::new_v4().to_string();
        let now = now_timestamp();
        self.conn.execute(
            "INSERT INTO notes (id, uid, title, content, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
            params![id, note.uid, note.title, note.content, now],
        )?;
        Ok(id)
    }

    fn update_note(&self, id: &str, patch: &NotePatch) -> ServiceResult<()> {
        let changed = self.conn.execute(
            "UPDATE notes SET
                title = COALESCE(?1, title),
                content = COALESCE(?2, content),
                file_url = COALESCE(?3, file_url),
                file_path = COALESCE(?4, file_path),
                ai_summary = COALESCE(?5, ai_summary),
                updated_at = ?6
             WHERE id = ?7",
            params![
                patch.title,
                patch.content,
                patch.file_url,
                patch.file_path,
                patch.ai_summary,
                now_timestamp(),
                id
            ],
        )?;
        if changed == 0 {
            return Err(ServiceError::NotFound(format!("No note with id {}", id)));
        }
        Ok(())
    }

    fn delete_note(&self, id: &str) -> ServiceResult<()> {
        self.conn
            .execute("DELETE FROM notes WHERE id = ?1", params![id])?;
        Ok(())
    }

    fn clear_all_data(&self) -> ServiceResult<()> {
        self.conn.execute("DELETE FROM notes", [])?;
        Ok(())
    }
}

// Fixed-width UTC timestamps so that text order matches time order.
fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Single-identity auth for offline use.
pub struct LocalAuth {
    state: watch::Sender<Option<User>>,
    user: User,
}

impl LocalAuth {
    pub fn new() -> Self {
        let display_name = std::env::var("USER")
            .ok()
            .filter(|u| !u.is_empty())
            .unwrap_or_else(|| "Local user".to_string());
        Self::with_user(User {
            uid: LOCAL_UID.to_string(),
            display_name: Some(display_name),
            email: None,
        })
    }

    pub fn with_user(user: User) -> Self {
        let (state, _) = watch::channel(None);
        Self { state, user }
    }
}

impl Default for LocalAuth {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AuthService for LocalAuth {
    fn listen(&self) -> watch::Receiver<Option<User>> {
        self.state.subscribe()
    }

    async fn sign_in(&self, provider: AuthProvider) -> ServiceResult<()> {
        tracing::info!("Local sign-in ({} requested)", provider);
        self.state.send_replace(Some(self.user.clone()));
        Ok(())
    }

    async fn sign_out(&self) -> ServiceResult<()> {
        tracing::info!("Local sign-out");
        self.state.send_replace(None);
        Ok(())
    }
}

/// Attachments written below a directory on disk.
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> ServiceResult<PathBuf> {
        let relative = Path::new(path);
        let safe = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if path.is_empty() || !safe {
            return Err(ServiceError::InvalidArgument(format!(
                "Invalid storage path: {}",
                path
            )));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn upload(&self, path: &str, bytes: Vec<u8>) -> ServiceResult<String> {
        let full = self.resolve(path)?;
        if let Some(dir) = full.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        tokio::fs::write(&full, &bytes).await?;
        tracing::info!("Stored {} bytes at {:?}", bytes.len(), full);
        Ok(format!("file://{}", full.display()))
    }
}

/// reCAPTCHA `siteverify` client.
pub struct SiteVerify {
    client: reqwest::Client,
    url: String,
    secret: String,
}

impl SiteVerify {
    pub fn new(secret: &str) -> Self {
        Self::with_url(secret, SITEVERIFY_URL)
    }

    pub fn with_url(secret: &str, url: &str) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            client,
            url: url.to_string(),
            secret: secret.to_string(),
        }
    }

    pub async fn check(&self, token: &str) -> ServiceResult<bool> {
        #[derive(Deserialize)]
        struct SiteVerifyRes {
            success: bool,
        }

        let resp = self
            .client
            .post(&self.url)
            .form(&[("secret", self.secret.as_str()), ("response", token)])
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(ServiceError::Unavailable(format!(
                "siteverify failed: {}",
                resp.status()
            )));
        }
        let res: SiteVerifyRes = resp.json().await?;
        Ok(res.success)
    }
}

/// Bot verification for offline use. Without a configured secret every
/// non-empty token passes.
pub struct LocalCaptcha {
    site_verify: Option<SiteVerify>,
}

impl LocalCaptcha {
    pub fn new(secret: Option<&str>) -> Self {
        let site_verify = secret
            .filter(|s| !s.trim().is_empty())
            .map(SiteVerify::new);
        if site_verify.is_none() {
            tracing::warn!("captcha.secret not set; local bot verification accepts any token");
        }
        Self { site_verify }
    }

    #[cfg(test)]
    pub fn with_site_verify(site_verify: SiteVerify) -> Self {
        Self {
            site_verify: Some(site_verify),
        }
    }
}

#[async_trait]
impl CaptchaVerifier for LocalCaptcha {
    async fn verify(&self, token: &str) -> ServiceResult<()> {
        if token.trim().is_empty() {
            return Err(ServiceError::InvalidArgument(
                "Missing reCAPTCHA token.".to_string(),
            ));
        }
        let Some(site_verify) = &self.site_verify else {
            return Ok(());
        };
        if site_verify.check(token).await? {
            Ok(())
        } else {
            Err(ServiceError::PermissionDenied(
                "reCAPTCHA check failed. Try again.".to_string(),
            ))
        }
    }
}
