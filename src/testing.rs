//! In-memory collaborators for session and dispatcher tests.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Semaphore};

use crate::backend::{
    AuthService, Backend, BlobStore, CaptchaVerifier, NoteStore, Subscription, Summarizer,
};
use crate::error::{ServiceError, ServiceResult};
use crate::model::{AuthProvider, NewNote, Note, NotePatch, User};
use crate::session::SessionState;

const WAIT: Duration = Duration::from_secs(2);

pub fn user(uid: &str) -> User {
    User {
        uid: uid.to_string(),
        display_name: Some(format!("User {}", uid)),
        email: None,
    }
}

pub fn note(id: &str, uid: &str, title: &str) -> Note {
    Note {
        id: id.to_string(),
        uid: uid.to_string(),
        title: title.to_string(),
        content: String::new(),
        file_url: None,
        file_path: None,
        ai_summary: None,
        created_at: None,
        updated_at: None,
    }
}

pub async fn wait_for(
    rx: &mut watch::Receiver<SessionState>,
    pred: impl FnMut(&SessionState) -> bool,
) -> SessionState {
    tokio::time::timeout(WAIT, rx.wait_for(pred))
        .await
        .expect("timed out waiting for session state")
        .expect("session dropped")
        .clone()
}

/// Holds backend calls in flight until opened.
#[derive(Default)]
pub struct Gate(Mutex<Option<Arc<Semaphore>>>);

impl Gate {
    pub fn close(&self) {
        *self.0.lock().unwrap() = Some(Arc::new(Semaphore::new(0)));
    }

    pub fn open(&self) {
        if let Some(sem) = self.0.lock().unwrap().take() {
            sem.add_permits(Semaphore::MAX_PERMITS / 2);
        }
    }

    async fn pass(&self) {
        let sem = self.0.lock().unwrap().clone();
        if let Some(sem) = sem {
            let _permit = sem.acquire().await.expect("gate closed");
        }
    }
}

#[derive(Default)]
struct Failure(Mutex<Option<ServiceError>>);

impl Failure {
    fn set(&self, err: ServiceError) {
        *self.0.lock().unwrap() = Some(err);
    }

    fn take(&self) -> ServiceResult<()> {
        match self.0.lock().unwrap().take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

pub struct FakeAuth {
    state: watch::Sender<Option<User>>,
    sign_in_as: User,
    failure: Failure,
    pub sign_ins: Mutex<Vec<AuthProvider>>,
}

impl FakeAuth {
    pub fn push(&self, user: Option<User>) {
        self.state.send_replace(user);
    }

    pub fn fail_next(&self, err: ServiceError) {
        self.failure.set(err);
    }
}

#[async_trait]
impl AuthService for FakeAuth {
    fn listen(&self) -> watch::Receiver<Option<User>> {
        self.state.subscribe()
    }

    async fn sign_in(&self, provider: AuthProvider) -> ServiceResult<()> {
        self.sign_ins.lock().unwrap().push(provider);
        self.failure.take()?;
        self.state.send_replace(Some(self.sign_in_as.clone()));
        Ok(())
    }

    async fn sign_out(&self) -> ServiceResult<()> {
        self.failure.take()?;
        self.state.send_replace(None);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreCall {
    Create(NewNote),
    Update(String, NotePatch),
    Delete(String),
}

pub struct FakeStore {
    feeds: Mutex<Vec<(String, mpsc::Sender<Vec<Note>>)>>,
    gate: Arc<Gate>,
    failure: Failure,
    next_id: Mutex<u32>,
    pub calls: Mutex<Vec<StoreCall>>,
}

impl FakeStore {
    pub fn fail_next(&self, err: ServiceError) {
        self.failure.set(err);
    }

    pub fn calls(&self) -> Vec<StoreCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Owners with a live subscription.
    pub fn open_feeds(&self) -> Vec<String> {
        self.feeds
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, tx)| !tx.is_closed())
            .map(|(owner, _)| owner.clone())
            .collect()
    }

    /// Delivers a snapshot to `owner`'s live subscription, if there is one.
    pub fn push(&self, owner: &str, notes: Vec<Note>) -> bool {
        let feeds = self.feeds.lock().unwrap();
        feeds
            .iter()
            .rev()
            .find(|(o, tx)| o == owner && !tx.is_closed())
            .map(|(_, tx)| tx.try_send(notes).is_ok())
            .unwrap_or(false)
    }

    pub async fn wait_for_feed(&self, owner: &str) {
        let deadline = tokio::time::Instant::now() + WAIT;
        while !self.open_feeds().iter().any(|o| o == owner) {
            assert!(tokio::time::Instant::now() < deadline, "no feed for {}", owner);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    pub async fn wait_for_no_feeds(&self) {
        let deadline = tokio::time::Instant::now() + WAIT;
        while !self.open_feeds().is_empty() {
            assert!(tokio::time::Instant::now() < deadline, "feeds still open");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn record(&self, call: StoreCall) -> ServiceResult<()> {
        self.gate.pass().await;
        self.calls.lock().unwrap().push(call);
        self.failure.take()
    }
}

#[async_trait]
impl NoteStore for FakeStore {
    fn subscribe(&self, owner: &str) -> Subscription {
        let (tx, rx) = mpsc::channel(16);
        self.feeds.lock().unwrap().push((owner.to_string(), tx));
        let producer = tokio::spawn(std::future::pending::<()>());
        Subscription::new(owner, rx, producer)
    }

    async fn create(&self, note: NewNote) -> ServiceResult<String> {
        self.record(StoreCall::Create(note)).await?;
        let mut next = self.next_id.lock().unwrap();
        *next += 1;
        Ok(format!("created-{}", next))
    }

    async fn update(&self, id: &str, patch: NotePatch) -> ServiceResult<()> {
        self.record(StoreCall::Update(id.to_string(), patch)).await
    }

    async fn delete(&self, id: &str) -> ServiceResult<()> {
        self.record(StoreCall::Delete(id.to_string())).await
    }
}

pub struct FakeBlobs {
    gate: Arc<Gate>,
    failure: Failure,
    pub uploads: Mutex<Vec<(String, usize)>>,
}

impl FakeBlobs {
    pub fn fail_next(&self, err: ServiceError) {
        self.failure.set(err);
    }
}

#[async_trait]
impl BlobStore for FakeBlobs {
    async fn upload(&self, path: &str, bytes: Vec<u8>) -> ServiceResult<String> {
        self.gate.pass().await;
        self.failure.take()?;
        self.uploads
            .lock()
            .unwrap()
            .push((path.to_string(), bytes.len()));
        Ok(format!("https://files.test/{}", path))
    }
}

pub struct FakeSummarizer {
    gate: Arc<Gate>,
    failure: Failure,
    pub requests: Mutex<Vec<String>>,
}

impl FakeSummarizer {
    pub fn fail_next(&self, err: ServiceError) {
        self.failure.set(err);
    }
}

#[async_trait]
impl Summarizer for FakeSummarizer {
    async fn summarize(&self, note_id: &str) -> ServiceResult<String> {
        self.gate.pass().await;
        self.requests.lock().unwrap().push(note_id.to_string());
        self.failure.take()?;
        Ok(format!("summary of {}", note_id))
    }
}

/// Accepts exactly the token `"ok"`.
pub struct FakeCaptcha {
    gate: Arc<Gate>,
}

#[async_trait]
impl CaptchaVerifier for FakeCaptcha {
    async fn verify(&self, token: &str) -> ServiceResult<()> {
        self.gate.pass().await;
        if token == "ok" {
            Ok(())
        } else {
            Err(ServiceError::PermissionDenied("bad token".to_string()))
        }
    }
}

pub struct Fakes {
    pub auth: Arc<FakeAuth>,
    pub store: Arc<FakeStore>,
    pub blobs: Arc<FakeBlobs>,
    pub summarizer: Arc<FakeSummarizer>,
    pub gate: Arc<Gate>,
}

pub fn fake_backend() -> (Backend, Fakes) {
    let gate = Arc::new(Gate::default());
    let (state, _) = watch::channel(None);
    let auth = Arc::new(FakeAuth {
        state,
        sign_in_as: user("u1"),
        failure: Failure::default(),
        sign_ins: Mutex::new(Vec::new()),
    });
    let store = Arc::new(FakeStore {
        feeds: Mutex::new(Vec::new()),
        gate: Arc::clone(&gate),
        failure: Failure::default(),
        next_id: Mutex::new(0),
        calls: Mutex::new(Vec::new()),
    });
    let blobs = Arc::new(FakeBlobs {
        gate: Arc::clone(&gate),
        failure: Failure::default(),
        uploads: Mutex::new(Vec::new()),
    });
    let summarizer = Arc::new(FakeSummarizer {
        gate: Arc::clone(&gate),
        failure: Failure::default(),
        requests: Mutex::new(Vec::new()),
    });
    let captcha = Arc::new(FakeCaptcha {
        gate: Arc::clone(&gate),
    });

    let backend = Backend {
        auth: auth.clone(),
        notes: store.clone(),
        blobs: blobs.clone(),
        summarizer: summarizer.clone(),
        captcha,
    };
    (
        backend,
        Fakes {
            auth,
            store,
            blobs,
            summarizer,
            gate,
        },
    )
}
