//! Session state and the controller that keeps it in step with the backend.
//!
//! All state lives in one [`SessionState`] value held by a `watch` channel.
//! Every event is applied to it atomically and readers only ever see whole
//! snapshots.

use tokio::sync::watch;

use crate::backend::{Backend, Subscription};
use crate::model::{Note, User};

/// Editable copy of the selected note's fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EditBuffer {
    pub title: String,
    pub content: String,
}

impl EditBuffer {
    fn seeded_from(note: Option<&Note>) -> Self {
        match note {
            Some(note) => Self {
                title: note.title.clone(),
                content: note.content.clone(),
            },
            None => Self::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    AuthChanged(Option<User>),
    Snapshot(Vec<Note>),
    Select(Option<String>),
    EditTitle(String),
    EditContent(String),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionState {
    pub user: Option<User>,
    /// Latest snapshot, newest first. Never patched locally.
    pub notes: Vec<Note>,
    pub selected_id: Option<String>,
    pub draft: EditBuffer,
    /// Bumped whenever `draft` is re-seeded from the store.
    pub draft_revision: u64,
    pub busy: bool,
    pub status: String,
    pub captcha_ok: bool,
    pub captcha_loading: bool,
}

impl SessionState {
    /// The selected note, if the selection still refers to a note in `notes`.
    pub fn selected(&self) -> Option<&Note> {
        let id = self.selected_id.as_deref()?;
        self.notes.iter().find(|n| n.id == id)
    }

    pub fn can_login(&self) -> bool {
        self.user.is_none() && self.captcha_ok && !self.captcha_loading
    }

    fn reseed_draft(&mut self) {
        self.draft = EditBuffer::seeded_from(self.selected());
        self.draft_revision += 1;
    }

    pub fn apply(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::AuthChanged(user) => {
                let signed_out = user.is_none();
                self.user = user;
                if signed_out {
                    self.notes.clear();
                    self.selected_id = None;
                    self.reseed_draft();
                }
            }
            SessionEvent::Snapshot(notes) => {
                let was_visible = self.selected().is_some();
                self.notes = notes;
                if self.selected_id.is_none() {
                    if let Some(first) = self.notes.first() {
                        self.selected_id = Some(first.id.clone());
                        self.reseed_draft();
                    }
                } else if was_visible != self.selected().is_some() {
                    // A stale selection keeps its id but shows an empty editor
                    // until the note comes back or something else is selected.
                    self.reseed_draft();
                }
            }
            SessionEvent::Select(id) => {
                self.selected_id = id;
                self.reseed_draft();
            }
            SessionEvent::EditTitle(title) => {
                if self.selected().is_some() {
                    self.draft.title = title;
                }
            }
            SessionEvent::EditContent(content) => {
                if self.selected().is_some() {
                    self.draft.content = content;
                }
            }
        }
    }
}

pub struct Session {
    backend: Backend,
    state: watch::Sender<SessionState>,
}

enum Step {
    AuthChanged,
    AuthClosed,
    Snapshot(Option<Vec<Note>>),
    Shutdown,
}

async fn next_snapshot(subscription: &mut Option<Subscription>) -> Option<Vec<Note>> {
    match subscription {
        Some(sub) => sub.next().await,
        None => std::future::pending().await,
    }
}

impl Session {
    pub fn new(backend: Backend) -> Self {
        let (state, _) = watch::channel(SessionState::default());
        Self { backend, state }
    }

    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn apply(&self, event: SessionEvent) {
        self.state.send_modify(move |s| s.apply(event));
    }

    pub fn select(&self, id: Option<String>) {
        self.apply(SessionEvent::Select(id));
    }

    pub fn edit_title(&self, title: String) {
        self.apply(SessionEvent::EditTitle(title));
    }

    pub fn edit_content(&self, content: String) {
        self.apply(SessionEvent::EditContent(content));
    }

    pub(crate) fn backend(&self) -> &Backend {
        &self.backend
    }

    pub(crate) fn modify(&self, f: impl FnOnce(&mut SessionState)) {
        self.state.send_modify(f);
    }

    /// Follows the auth feed and the signed-in user's note feed until
    /// `shutdown` flips or its sender goes away. The note subscription only
    /// exists while a user is signed in and is released on the way out.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut auth = self.backend.auth.listen();
        let mut subscription: Option<Subscription> = None;

        let initial = auth.borrow_and_update().clone();
        self.on_auth_changed(initial, &mut subscription);

        loop {
            let step = tokio::select! {
                changed = auth.changed() => match changed {
                    Ok(()) => Step::AuthChanged,
                    Err(_) => Step::AuthClosed,
                },
                snapshot = next_snapshot(&mut subscription) => Step::Snapshot(snapshot),
                _ = shutdown.changed() => Step::Shutdown,
            };

            match step {
                Step::AuthChanged => {
                    let user = auth.borrow_and_update().clone();
                    self.on_auth_changed(user, &mut subscription);
                }
                Step::Snapshot(Some(notes)) => {
                    tracing::debug!("Snapshot with {} notes", notes.len());
                    self.apply(SessionEvent::Snapshot(notes));
                }
                Step::Snapshot(None) => {
                    tracing::warn!("Note feed ended");
                    subscription = None;
                }
                Step::AuthClosed => {
                    tracing::warn!("Auth feed closed; stopping session");
                    break;
                }
                Step::Shutdown => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }

            if shutdown.has_changed().is_err() {
                break;
            }
        }

        drop(subscription);
        tracing::info!("Session stopped");
    }

    fn on_auth_changed(&self, user: Option<User>, subscription: &mut Option<Subscription>) {
        match &user {
            Some(u) => {
                let current_owner = subscription.as_ref().map(|s| s.owner().to_string());
                if current_owner.as_deref() != Some(u.uid.as_str()) {
                    *subscription = None;
                    *subscription = Some(self.backend.notes.subscribe(&u.uid));
                    tracing::info!("Subscribed to notes of {}", u.uid);
                }
            }
            None => {
                if subscription.take().is_some() {
                    tracing::info!("Signed out; note feed released");
                }
            }
        }
        self.apply(SessionEvent::AuthChanged(user));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fake_backend, note, user, wait_for};
    use std::sync::Arc;
    use std::time::Duration;

    fn signed_in() -> SessionState {
        let mut state = SessionState::default();
        state.apply(SessionEvent::AuthChanged(Some(user("u1"))));
        state
    }

    #[test]
    fn snapshot_replaces_notes_wholesale() {
        let mut state = signed_in();
        let first = vec![note("a", "u1", "A"), note("b", "u1", "B")];
        state.apply(SessionEvent::Snapshot(first.clone()));
        assert_eq!(state.notes, first);

        let second = vec![note("c", "u1", "C")];
        state.apply(SessionEvent::Snapshot(second.clone()));
        assert_eq!(state.notes, second);

        state.apply(SessionEvent::Snapshot(Vec::new()));
        assert!(state.notes.is_empty());
    }

    #[test]
    fn first_snapshot_selects_head_only_when_nothing_selected() {
        let mut state = signed_in();
        state.apply(SessionEvent::Snapshot(Vec::new()));
        assert!(state.selected_id.is_none());

        state.apply(SessionEvent::Snapshot(vec![note("a", "u1", "A"), note("b", "u1", "B")]));
        assert_eq!(state.selected_id.as_deref(), Some("a"));
        assert_eq!(state.draft.title, "A");

        state.apply(SessionEvent::Snapshot(vec![note("b", "u1", "B"), note("a", "u1", "A")]));
        assert_eq!(state.selected_id.as_deref(), Some("a"));
    }

    #[test]
    fn selecting_reseeds_the_draft() {
        let mut state = signed_in();
        let mut b = note("b", "u1", "B");
        b.content = "body of b".into();
        state.apply(SessionEvent::Snapshot(vec![note("a", "u1", "A"), b]));
        state.apply(SessionEvent::EditTitle("scratch".into()));
        assert_eq!(state.draft.title, "scratch");

        let revision = state.draft_revision;
        state.apply(SessionEvent::Select(Some("b".into())));
        assert_eq!(
            state.draft,
            EditBuffer {
                title: "B".into(),
                content: "body of b".into()
            }
        );
        assert!(state.draft_revision > revision);

        state.apply(SessionEvent::Select(Some("missing".into())));
        assert_eq!(state.draft, EditBuffer::default());
        assert!(state.selected().is_none());
    }

    #[test]
    fn snapshots_keep_unsaved_edits() {
        let mut state = signed_in();
        state.apply(SessionEvent::Snapshot(vec![note("a", "u1", "A")]));
        state.apply(SessionEvent::EditContent("draft text".into()));

        let mut updated = note("a", "u1", "A (server)");
        updated.ai_summary = Some("summary".into());
        state.apply(SessionEvent::Snapshot(vec![updated]));
        assert_eq!(state.draft.content, "draft text");
        assert_eq!(state.draft.title, "A");
        assert_eq!(state.selected().unwrap().ai_summary.as_deref(), Some("summary"));
    }

    #[test]
    fn vanished_selection_is_kept_but_blanked() {
        let mut state = signed_in();
        state.apply(SessionEvent::Snapshot(vec![note("a", "u1", "A"), note("b", "u1", "B")]));
        state.apply(SessionEvent::Select(Some("b".into())));

        state.apply(SessionEvent::Snapshot(vec![note("a", "u1", "A")]));
        assert_eq!(state.selected_id.as_deref(), Some("b"));
        assert!(state.selected().is_none());
        assert_eq!(state.draft, EditBuffer::default());

        state.apply(SessionEvent::EditTitle("ignored".into()));
        assert_eq!(state.draft.title, "");

        state.apply(SessionEvent::Snapshot(vec![note("b", "u1", "B again"), note("a", "u1", "A")]));
        assert_eq!(state.draft.title, "B again");
    }

    #[test]
    fn sign_out_clears_everything_but_captcha() {
        let mut state = signed_in();
        state.captcha_ok = true;
        state.apply(SessionEvent::Snapshot(vec![note("a", "u1", "A")]));
        state.apply(SessionEvent::AuthChanged(None));
        assert!(state.user.is_none());
        assert!(state.notes.is_empty());
        assert!(state.selected_id.is_none());
        assert_eq!(state.draft, EditBuffer::default());
        assert!(state.captcha_ok);
    }

    #[test]
    fn login_requires_passed_captcha() {
        let mut state = SessionState::default();
        assert!(!state.can_login());
        state.captcha_ok = true;
        assert!(state.can_login());
        state.captcha_loading = true;
        assert!(!state.can_login());
        state.captcha_loading = false;
        state.user = Some(user("u1"));
        assert!(!state.can_login());
    }

    fn start(session: &Arc<Session>) -> (watch::Sender<bool>, tokio::task::JoinHandle<()>) {
        let (stop_tx, stop_rx) = watch::channel(false);
        let runner = Arc::clone(session);
        let handle = tokio::spawn(async move { runner.run(stop_rx).await });
        (stop_tx, handle)
    }

    #[tokio::test]
    async fn subscribes_while_signed_in() {
        let (backend, fakes) = fake_backend();
        let session = Arc::new(Session::new(backend));
        let mut rx = session.watch();
        let (stop, handle) = start(&session);

        fakes.auth.push(Some(user("u1")));
        fakes.store.wait_for_feed("u1").await;
        fakes.store.push("u1", vec![note("n2", "u1", "Two"), note("n1", "u1", "One")]);

        let state = wait_for(&mut rx, |s| s.notes.len() == 2).await;
        assert_eq!(state.selected_id.as_deref(), Some("n2"));
        assert_eq!(state.draft.title, "Two");

        fakes.auth.push(None);
        let state = wait_for(&mut rx, |s| s.user.is_none()).await;
        assert!(state.notes.is_empty());
        fakes.store.wait_for_no_feeds().await;
        assert!(!fakes.store.push("u1", vec![note("late", "u1", "Late")]));

        stop.send_replace(true);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn switching_user_resubscribes() {
        let (backend, fakes) = fake_backend();
        let session = Arc::new(Session::new(backend));
        let (stop, handle) = start(&session);

        fakes.auth.push(Some(user("u1")));
        fakes.store.wait_for_feed("u1").await;
        fakes.auth.push(Some(user("u2")));
        fakes.store.wait_for_feed("u2").await;
        assert_eq!(fakes.store.open_feeds(), vec!["u2".to_string()]);

        stop.send_replace(true);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_releases_the_subscription() {
        let (backend, fakes) = fake_backend();
        fakes.auth.push(Some(user("u1")));
        let session = Arc::new(Session::new(backend));
        let (stop, handle) = start(&session);

        fakes.store.wait_for_feed("u1").await;
        stop.send_replace(true);
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(fakes.store.open_feeds().is_empty());
    }
}
