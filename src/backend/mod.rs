//! Collaborator seams between the session and the services behind it.
//!
//! The session only talks to these traits; `remote` implements them over
//! the hosted REST facade and `local` over SQLite and the filesystem.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::error::ServiceResult;
use crate::model::{AuthProvider, NewNote, Note, NotePatch, User};

pub mod local;
pub mod remote;

#[async_trait]
pub trait AuthService: Send + Sync {
    /// Auth-state feed; the current value is the signed-in user, if any.
    fn listen(&self) -> watch::Receiver<Option<User>>;

    /// Starts sign-in. Completion is observed through `listen`.
    async fn sign_in(&self, provider: AuthProvider) -> ServiceResult<()>;

    async fn sign_out(&self) -> ServiceResult<()>;
}

#[async_trait]
pub trait NoteStore: Send + Sync {
    /// Live feed of `owner`'s notes, newest `updatedAt` first.
    fn subscribe(&self, owner: &str) -> Subscription;

    async fn create(&self, note: NewNote) -> ServiceResult<String>;

    async fn update(&self, id: &str, patch: NotePatch) -> ServiceResult<()>;

    async fn delete(&self, id: &str) -> ServiceResult<()>;
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Stores `bytes` at `path` and returns a retrieval URL.
    async fn upload(&self, path: &str, bytes: Vec<u8>) -> ServiceResult<String>;
}

#[async_trait]
pub trait Summarizer: Send + Sync {
    /// Summarizes a note owned by the caller and persists it as `aiSummary`.
    async fn summarize(&self, note_id: &str) -> ServiceResult<String>;
}

#[async_trait]
pub trait CaptchaVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> ServiceResult<()>;
}

/// An active snapshot feed. Dropping it stops the producer.
pub struct Subscription {
    owner: String,
    snapshots: mpsc::Receiver<Vec<Note>>,
    producer: JoinHandle<()>,
}

impl Subscription {
    pub fn new(owner: &str, snapshots: mpsc::Receiver<Vec<Note>>, producer: JoinHandle<()>) -> Self {
        Self {
            owner: owner.to_string(),
            snapshots,
            producer,
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Next snapshot, or `None` once the producer has stopped.
    pub async fn next(&mut self) -> Option<Vec<Note>> {
        self.snapshots.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.producer.abort();
        tracing::debug!("Unsubscribed from notes of {}", self.owner);
    }
}

/// The full set of collaborators one session runs against.
#[derive(Clone)]
pub struct Backend {
    pub auth: Arc<dyn AuthService>,
    pub notes: Arc<dyn NoteStore>,
    pub blobs: Arc<dyn BlobStore>,
    pub summarizer: Arc<dyn Summarizer>,
    pub captcha: Arc<dyn CaptchaVerifier>,
}
