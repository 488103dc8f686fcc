//! User commands against the backend.
//!
//! Commands never touch `notes` directly: the store's next snapshot is the
//! only way a change becomes visible. Each command reports a single status
//! line on completion.

use chrono::Utc;
use std::fmt;

use crate::error::{ServiceError, ServiceResult};
use crate::model::{upload_path, AuthProvider, FileUpload, NewNote, NotePatch};
use crate::session::{Session, SessionEvent, SessionState};

pub const DEFAULT_TITLE: &str = "New note";
pub const DEFAULT_CONTENT: &str = "Write here...";
pub const CAPTCHA_REJECTED: &str = "❌ reCAPTCHA invalid. Try again.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Created,
    Saved,
    Deleted,
    Uploaded,
    Summarized,
    Failed {
        message: String,
        fallback: &'static str,
    },
}

impl Outcome {
    fn failed(err: &ServiceError, fallback: &'static str) -> Self {
        Outcome::Failed {
            message: err.message().to_string(),
            fallback,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Created => write!(f, "✅ Note created"),
            Outcome::Saved => write!(f, "✅ Saved"),
            Outcome::Deleted => write!(f, "🗑️ Deleted"),
            Outcome::Uploaded => write!(f, "📦 File uploaded"),
            Outcome::Summarized => write!(f, "🤖 Summary generated"),
            Outcome::Failed { message, fallback } => {
                if message.trim().is_empty() {
                    write!(f, "❌ {}", fallback)
                } else {
                    write!(f, "❌ {}", message)
                }
            }
        }
    }
}

fn busy_flag(state: &mut SessionState) -> &mut bool {
    &mut state.busy
}

fn captcha_flag(state: &mut SessionState) -> &mut bool {
    &mut state.captcha_loading
}

/// Raises a session flag for the lifetime of a command and lowers it on
/// drop, however the command ends.
struct InFlight<'a> {
    session: &'a Session,
    flag: fn(&mut SessionState) -> &mut bool,
}

impl<'a> InFlight<'a> {
    fn busy(session: &'a Session) -> Self {
        session.modify(|s| {
            s.busy = true;
            s.status.clear();
        });
        Self {
            session,
            flag: busy_flag,
        }
    }

    fn captcha(session: &'a Session) -> Self {
        session.modify(|s| {
            s.captcha_loading = true;
            s.captcha_ok = false;
        });
        Self {
            session,
            flag: captcha_flag,
        }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let flag = self.flag;
        self.session.modify(move |s| *flag(s) = false);
    }
}

impl Session {
    fn report<T>(&self, action: &str, result: ServiceResult<T>, success: Outcome, fallback: &'static str) {
        let outcome = match result {
            Ok(_) => success,
            Err(e) => {
                tracing::warn!("{} failed ({}): {}", action, e.code(), e);
                Outcome::failed(&e, fallback)
            }
        };
        self.modify(|s| s.status = outcome.to_string());
    }

    /// Creates a default note for the signed-in user. It shows up, and is
    /// selected, once the store echoes it back.
    pub async fn create(&self) {
        let Some(user) = self.state().user else {
            return;
        };
        let _busy = InFlight::busy(self);
        let note = NewNote {
            uid: user.uid,
            title: DEFAULT_TITLE.to_string(),
            content: DEFAULT_CONTENT.to_string(),
        };
        let result = self.backend().notes.create(note).await;
        if let Ok(id) = &result {
            tracing::info!("Created note {}", id);
        }
        self.report("create", result, Outcome::Created, "Error");
    }

    /// Writes the edit buffer to the selected note.
    pub async fn save(&self) {
        let state = self.state();
        let Some(note) = state.selected() else {
            return;
        };
        let id = note.id.clone();
        let patch = NotePatch::text(state.draft.title.clone(), state.draft.content.clone());

        let _busy = InFlight::busy(self);
        let result = self.backend().notes.update(&id, patch).await;
        self.report("save", result, Outcome::Saved, "Error");
    }

    pub async fn delete(&self) {
        let Some(id) = self.state().selected().map(|n| n.id.clone()) else {
            return;
        };
        let _busy = InFlight::busy(self);
        match self.backend().notes.delete(&id).await {
            Ok(()) => {
                tracing::info!("Deleted note {}", id);
                self.modify(|s| {
                    s.apply(SessionEvent::Select(None));
                    s.status = Outcome::Deleted.to_string();
                });
            }
            Err(e) => self.report::<()>("delete", Err(e), Outcome::Deleted, "Error"),
        }
    }

    /// Uploads `file` under the owner's folder for the selected note and
    /// records its URL and path on the note.
    pub async fn upload_file(&self, file: Option<FileUpload>) {
        let Some(file) = file else {
            return;
        };
        let state = self.state();
        let (Some(user), Some(note)) = (state.user.as_ref(), state.selected()) else {
            return;
        };
        let path = upload_path(&user.uid, &note.id, Utc::now().timestamp_millis(), &file.name);
        let note_id = note.id.clone();

        let _busy = InFlight::busy(self);
        tracing::info!("Uploading {} bytes to {}", file.bytes.len(), path);
        let result = match self.backend().blobs.upload(&path, file.bytes).await {
            Ok(url) => {
                self.backend()
                    .notes
                    .update(&note_id, NotePatch::attachment(url, path))
                    .await
            }
            Err(e) => Err(e),
        };
        self.report("upload", result, Outcome::Uploaded, "Upload error");
    }

    /// Asks the summarizer for the selected note. The summary itself arrives
    /// through the next snapshot.
    pub async fn summarize(&self) {
        let Some(id) = self.state().selected().map(|n| n.id.clone()) else {
            return;
        };
        let _busy = InFlight::busy(self);
        let result = self.backend().summarizer.summarize(&id).await;
        if let Ok(summary) = &result {
            tracing::info!("Summary for {} ({} chars)", id, summary.len());
        }
        self.report("summarize", result, Outcome::Summarized, "Summarization error");
    }

    /// Starts sign-in once the captcha has passed. Failures are logged only;
    /// success is observed through the auth feed.
    pub async fn login(&self, provider: AuthProvider) {
        if !self.state().can_login() {
            tracing::debug!("Login with {} ignored; captcha not passed", provider);
            return;
        }
        if let Err(e) = self.backend().auth.sign_in(provider).await {
            tracing::warn!("Sign-in with {} failed: {}", provider, e);
        }
    }

    pub async fn logout(&self) {
        if let Err(e) = self.backend().auth.sign_out().await {
            tracing::warn!("Sign-out failed: {}", e);
        }
    }

    /// Verifies a captcha token. Any failure leaves `captcha_ok` false and
    /// sets the rejection status.
    pub async fn verify_captcha(&self, token: &str) {
        if token.trim().is_empty() {
            return;
        }
        let _loading = InFlight::captcha(self);
        match self.backend().captcha.verify(token).await {
            Ok(()) => {
                tracing::info!("Captcha verified");
                self.modify(|s| s.captcha_ok = true);
            }
            Err(e) => {
                tracing::warn!("Captcha rejected ({}): {}", e.code(), e);
                self.modify(|s| {
                    s.captcha_ok = false;
                    s.status = CAPTCHA_REJECTED.to_string();
                });
            }
        }
    }
}
