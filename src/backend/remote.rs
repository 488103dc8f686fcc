use async_trait::async_trait;
use reqwest::{Client, Method, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

use super::{AuthService, BlobStore, CaptchaVerifier, NoteStore, Subscription, Summarizer};
use crate::attestation;
use crate::config::{self, TokenStore};
use crate::error::{ServiceError, ServiceResult};
use crate::model::{AuthProvider, NewNote, Note, NotePatch, User};

const MAX_ATTEMPTS: u64 = 3;
const LOGIN_POLL_LIMIT: u32 = 300;
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

enum Payload<'a> {
    Empty,
    Json(&'a serde_json::Value),
    Bytes(&'a [u8]),
}

/// HTTP client for the hosted backend's REST facade.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    tokens: TokenStore,
    poll_interval: Duration,
}

impl ApiClient {
    pub fn new(base_url: &str, tokens: TokenStore, poll_interval: Duration) -> anyhow::Result<Self> {
        if poll_interval < MIN_POLL_INTERVAL {
            tracing::warn!(
                "poll interval {:?} is too short; using {:?}",
                poll_interval,
                MIN_POLL_INTERVAL
            );
        }
        Ok(Self {
            client: Client::builder().timeout(Duration::from_secs(10)).build()?,
            base_url: base_url.trim_end_matches('/').to_string(),
            tokens,
            poll_interval: poll_interval.max(MIN_POLL_INTERVAL),
        })
    }

    /// Builds `base_url/seg/...`, percent-encoding each segment.
    fn endpoint<'s>(&self, segments: impl IntoIterator<Item = &'s str>) -> ServiceResult<Url> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| ServiceError::Internal(format!("Invalid API URL: {}", e)))?;
        url.path_segments_mut()
            .map_err(|_| ServiceError::Internal(format!("Invalid API URL: {}", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    pub fn tokens(&self) -> &TokenStore {
        &self.tokens
    }

    async fn authenticated_request(
        &self,
        method: Method,
        url: Url,
        payload: Payload<'_>,
    ) -> ServiceResult<Response> {
        // A POST may have been applied before the failure was seen.
        let max_attempts = if method == Method::POST { 1 } else { MAX_ATTEMPTS };
        let mut attempts = 0;

        loop {
            attempts += 1;
            let mut builder = self.client.request(method.clone(), url.clone());

            let token = self.tokens.id_token();
            if !token.is_empty() {
                builder = builder.bearer_auth(token);
            }
            if let Some(app_check) = attestation::header_value() {
                builder = builder.header("X-App-Check", app_check);
            }

            builder = match &payload {
                Payload::Empty => builder,
                Payload::Json(body) => builder.json(body),
                Payload::Bytes(bytes) => builder
                    .header("Content-Type", "application/octet-stream")
                    .body(bytes.to_vec()),
            };

            match builder.send().await {
                Ok(resp) => {
                    if resp.status() == StatusCode::UNAUTHORIZED
                        && attempts == 1
                        && self.refresh_token().await.is_ok()
                    {
                        continue;
                    }

                    if resp.status().is_server_error() && attempts < max_attempts {
                        time::sleep(Duration::from_millis(500 * attempts)).await;
                        continue;
                    }

                    return Ok(resp);
                }
                Err(e) if attempts < max_attempts => {
                    tracing::debug!("{} {} failed (attempt {}): {}", method, url.path(), attempts, e);
                    time::sleep(Duration::from_millis(500 * attempts)).await;
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn refresh_token(&self) -> anyhow::Result<()> {
        let data = self.tokens.load();
        if data.refresh_token.is_empty() {
            anyhow::bail!("No refresh token");
        }

        let resp = self
            .client
            .post(format!("{}/auth/refresh", self.base_url))
            .json(&serde_json::json!({ "refresh_token": data.refresh_token }))
            .send()
            .await?;

        if resp.status() != StatusCode::OK {
            anyhow::bail!("Refresh failed: {}", resp.status());
        }

        #[derive(Deserialize)]
        struct RefreshRes {
            id_token: String,
            refresh_token: String,
        }
        let res: RefreshRes = resp.json().await?;
        self.tokens.save(&res.id_token, &res.refresh_token)?;
        tracing::info!("ID token refreshed");
        Ok(())
    }

    pub async fn start_login_session(&self, provider: AuthProvider) -> ServiceResult<LoginSession> {
        let resp = self
            .client
            .post(format!("{}/auth/init", self.base_url))
            .json(&serde_json::json!({ "provider": provider.as_str() }))
            .send()
            .await?;
        if resp.status() != StatusCode::OK {
            return Err(error_from_response(resp).await);
        }
        Ok(resp.json().await?)
    }

    pub async fn poll_login_session(&self, session_id: &str) -> ServiceResult<PollResult> {
        let mut poll_url = self.endpoint(["auth", "poll"])?;
        poll_url.query_pairs_mut().append_pair("session", session_id);
        let resp = self.client.get(poll_url).send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(PollResult {
                status: "not_found".to_string(),
                token: String::new(),
                refresh_token: String::new(),
            });
        }
        if resp.status() != StatusCode::OK {
            return Err(error_from_response(resp).await);
        }
        Ok(resp.json().await?)
    }

    pub async fn list_notes(&self, uid: &str) -> ServiceResult<Vec<Note>> {
        let mut url = self.endpoint(["notes"])?;
        url.query_pairs_mut().append_pair("uid", uid);
        let resp = self
            .authenticated_request(Method::GET, url, Payload::Empty)
            .await?;
        if !resp.status().is_success() {
            return Err(error_from_response(resp).await);
        }
        #[derive(Deserialize)]
        struct ListRes {
            notes: Vec<Note>,
        }
        let res: ListRes = resp.json().await?;
        Ok(res.notes)
    }

    /// Invokes a callable function: `{data}` in, `{result}` or `{error}` out.
    pub async fn call_function<T: DeserializeOwned>(
        &self,
        name: &str,
        data: serde_json::Value,
    ) -> ServiceResult<T> {
        let body = serde_json::json!({ "data": data });
        let url = self.endpoint(["functions", name])?;
        let resp = self
            .authenticated_request(Method::POST, url, Payload::Json(&body))
            .await?;
        let status = resp.status();
        let bytes = resp.bytes().await?;

        #[derive(Deserialize)]
        struct CallableRes<T> {
            result: Option<T>,
            error: Option<CallableError>,
        }
        match serde_json::from_slice::<CallableRes<T>>(&bytes) {
            Ok(CallableRes {
                error: Some(err), ..
            }) => Err(ServiceError::from_code(&err.status, err.message)),
            Ok(CallableRes {
                result: Some(result),
                ..
            }) if status.is_success() => Ok(result),
            Ok(_) if status.is_success() => Err(ServiceError::Internal(format!(
                "Malformed response from {}",
                name
            ))),
            _ => Err(error_from_status(status, &String::from_utf8_lossy(&bytes))),
        }
    }
}

#[derive(Deserialize)]
struct CallableError {
    #[serde(default)]
    status: String,
    #[serde(default)]
    message: String,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: CallableError,
}

async fn error_from_response(resp: Response) -> ServiceError {
    let status = resp.status();
    let text = resp.text().await.unwrap_or_default();
    error_from_status(status, &text)
}

fn error_from_status(status: StatusCode, body: &str) -> ServiceError {
    if let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) {
        if !parsed.error.status.is_empty() {
            return ServiceError::from_code(&parsed.error.status, parsed.error.message);
        }
    }
    let message = if body.trim().is_empty() {
        format!("Request failed: {}", status)
    } else {
        body.trim().to_string()
    };
    match status {
        StatusCode::UNAUTHORIZED => ServiceError::Unauthenticated(message),
        StatusCode::BAD_REQUEST => ServiceError::InvalidArgument(message),
        StatusCode::FORBIDDEN => ServiceError::PermissionDenied(message),
        StatusCode::NOT_FOUND => ServiceError::NotFound(message),
        s if s.is_server_error() => ServiceError::Unavailable(message),
        _ => ServiceError::Internal(message),
    }
}

#[derive(Deserialize)]
pub struct LoginSession {
    pub session_id: String,
    pub url: String,
}

#[derive(Deserialize)]
pub struct PollResult {
    pub status: String,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub refresh_token: String,
}

#[async_trait]
impl NoteStore for ApiClient {
    fn subscribe(&self, owner: &str) -> Subscription {
        let (tx, rx) = mpsc::channel(16);
        let api = self.clone();
        let uid = owner.to_string();

        let producer = tokio::spawn(async move {
            let mut ticker = time::interval(api.poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut last: Option<Vec<Note>> = None;

            loop {
                ticker.tick().await;
                match api.list_notes(&uid).await {
                    Ok(notes) => {
                        if last.as_ref() == Some(&notes) {
                            continue;
                        }
                        if tx.send(notes.clone()).await.is_err() {
                            break;
                        }
                        last = Some(notes);
                    }
                    Err(e) => tracing::warn!("Notes poll failed: {}", e),
                }
            }
        });

        Subscription::new(owner, rx, producer)
    }

    async fn create(&self, note: NewNote) -> ServiceResult<String> {
        let body = serde_json::to_value(&note).map_err(|e| ServiceError::Internal(e.to_string()))?;
        let url = self.endpoint(["notes"])?;
        let resp = self
            .authenticated_request(Method::POST, url, Payload::Json(&body))
            .await?;
        if !resp.status().is_success() {
            return Err(error_from_response(resp).await);
        }
        #[derive(Deserialize)]
        struct CreateRes {
            id: String,
        }
        let res: CreateRes = resp.json().await?;
        Ok(res.id)
    }

    async fn update(&self, id: &str, patch: NotePatch) -> ServiceResult<()> {
        let body = serde_json::to_value(&patch).map_err(|e| ServiceError::Internal(e.to_string()))?;
        let url = self.endpoint(["notes", id])?;
        let resp = self
            .authenticated_request(Method::PATCH, url, Payload::Json(&body))
            .await?;
        if !resp.status().is_success() {
            return Err(error_from_response(resp).await);
        }
        Ok(())
    }

    async fn delete(&self, id: &str) -> ServiceResult<()> {
        let url = self.endpoint(["notes", id])?;
        let resp = self
            .authenticated_request(Method::DELETE, url, Payload::Empty)
            .await?;
        if !resp.status().is_success() {
            return Err(error_from_response(resp).await);
        }
        Ok(())
    }
}

#[async_trait]
impl BlobStore for ApiClient {
    async fn upload(&self, path: &str, bytes: Vec<u8>) -> ServiceResult<String> {
        let url = self.endpoint(std::iter::once("storage").chain(path.split('/')))?;
        let resp = self
            .authenticated_request(Method::PUT, url, Payload::Bytes(&bytes))
            .await?;
        if !resp.status().is_success() {
            return Err(error_from_response(resp).await);
        }
        #[derive(Deserialize)]
        struct UploadRes {
            url: String,
        }
        let res: UploadRes = resp.json().await?;
        Ok(res.url)
    }
}

#[derive(Serialize, Deserialize)]
struct SummaryRes {
    summary: String,
}

#[async_trait]
impl Summarizer for ApiClient {
    async fn summarize(&self, note_id: &str) -> ServiceResult<String> {
        let res: SummaryRes = self
            .call_function("summarizeNote", serde_json::json!({ "noteId": note_id }))
            .await?;
        Ok(res.summary)
    }
}

#[async_trait]
impl CaptchaVerifier for ApiClient {
    async fn verify(&self, token: &str) -> ServiceResult<()> {
        #[derive(Deserialize)]
        struct VerifyRes {
            ok: bool,
        }
        let res: VerifyRes = self
            .call_function("verifyRecaptchaV2", serde_json::json!({ "token": token }))
            .await?;
        if res.ok {
            Ok(())
        } else {
            Err(ServiceError::PermissionDenied(
                "reCAPTCHA check failed. Try again.".to_string(),
            ))
        }
    }
}

#[cfg(test)]
fn no_browser(_url: &str) {}

fn open_browser(url: &str) {
    if let Err(e) = webbrowser::open(url) {
        tracing::warn!("Could not open browser: {}", e);
    }
}

/// Browser-based sign-in against the hosted identity providers.
pub struct RemoteAuth {
    api: ApiClient,
    state: Arc<watch::Sender<Option<User>>>,
    login_task: Mutex<Option<JoinHandle<()>>>,
    poll_every: Duration,
    open_url: fn(&str),
}

impl RemoteAuth {
    pub fn new(api: ApiClient) -> Self {
        let (state, _) = watch::channel(api.tokens().current_user());
        Self {
            api,
            state: Arc::new(state),
            login_task: Mutex::new(None),
            poll_every: Duration::from_secs(1),
            open_url: open_browser,
        }
    }

    #[cfg(test)]
    fn headless(api: ApiClient, poll_every: Duration) -> Self {
        let mut auth = Self::new(api);
        auth.poll_every = poll_every;
        auth.open_url = no_browser;
        auth
    }
}

impl Drop for RemoteAuth {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.login_task.lock() {
            if let Some(task) = guard.take() {
                task.abort();
            }
        }
    }
}

#[async_trait]
impl AuthService for RemoteAuth {
    fn listen(&self) -> watch::Receiver<Option<User>> {
        self.state.subscribe()
    }

    async fn sign_in(&self, provider: AuthProvider) -> ServiceResult<()> {
        let session = self.api.start_login_session(provider).await?;
        tracing::info!("Login session {} started with {}", session.session_id, provider);
        (self.open_url)(&session.url);

        let api = self.api.clone();
        let state = Arc::clone(&self.state);
        let poll_every = self.poll_every;

        let task = tokio::spawn(async move {
            for _ in 0..LOGIN_POLL_LIMIT {
                time::sleep(poll_every).await;
                match api.poll_login_session(&session.session_id).await {
                    Ok(res) if res.status == "success" => {
                        if let Err(e) = api.tokens().save(&res.token, &res.refresh_token) {
                            tracing::error!("Failed to persist login: {:#}", e);
                            return;
                        }
                        match config::user_from_token(&res.token) {
                            Ok(user) => {
                                tracing::info!("Signed in as {}", user.uid);
                                state.send_replace(Some(user));
                            }
                            Err(e) => tracing::error!("Unreadable ID token: {:#}", e),
                        }
                        return;
                    }
                    Ok(res) if res.status == "not_found" => {
                        tracing::warn!("Login session expired");
                        return;
                    }
                    // Still pending, or a transient polling error.
                    Ok(_) | Err(_) => {}
                }
            }
            tracing::warn!("Login timed out");
        });

        if let Ok(mut guard) = self.login_task.lock() {
            if let Some(previous) = guard.replace(task) {
                previous.abort();
            }
        }
        Ok(())
    }

    async fn sign_out(&self) -> ServiceResult<()> {
        self.api
            .tokens()
            .clear()
            .map_err(|e| ServiceError::Internal(e.to_string()))?;
        self.state.send_replace(None);
        tracing::info!("Signed out");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer, dir: &tempfile::TempDir) -> ApiClient {
        ApiClient::new(
            &server.uri(),
            TokenStore::new(dir.path()),
            Duration::from_millis(20),
        )
        .unwrap()
    }

    fn jwt(sub: &str) -> String {
        let payload = URL_SAFE_NO_PAD.encode(format!(r#"{{"sub":"{}","name":"Ada"}}"#, sub));
        format!("h.{}.s", payload)
    }

    fn note_json(id: &str, title: &str) -> serde_json::Value {
        serde_json::json!({
            "id": id,
            "uid": "u1",
            "title": title,
            "content": "",
            "updatedAt": "2026-03-01T10:00:00Z"
        })
    }

    #[tokio::test]
    async fn lists_notes_with_bearer_token() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let api = client(&server, &dir);
        api.tokens().save("id-token", "refresh").unwrap();

        Mock::given(method("GET"))
            .and(path("/notes"))
            .and(query_param("uid", "u1"))
            .and(header("authorization", "Bearer id-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "notes": [note_json("b", "B"), note_json("a", "A")]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let notes = api.list_notes("u1").await.unwrap();
        assert_eq!(notes.len(), 2);
        assert_eq!(notes[0].id, "b");
    }

    #[tokio::test]
    async fn create_and_patch_use_wire_names() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let api = client(&server, &dir);

        Mock::given(method("POST"))
            .and(path("/notes"))
            .and(body_json(serde_json::json!({
                "uid": "u1", "title": "New note", "content": "Write here..."
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "id": "n9" })))
            .mount(&server)
            .await;
        Mock::given(method("PATCH"))
            .and(path("/notes/n9"))
            .and(body_json(serde_json::json!({ "fileURL": "https://f", "filePath": "uploads/p" })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let id = api
            .create(NewNote {
                uid: "u1".into(),
                title: "New note".into(),
                content: "Write here...".into(),
            })
            .await
            .unwrap();
        assert_eq!(id, "n9");
        api.update(&id, NotePatch::attachment("https://f", "uploads/p"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn http_statuses_map_to_service_errors() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let api = client(&server, &dir);

        Mock::given(method("PATCH"))
            .and(path("/notes/gone"))
            .respond_with(ResponseTemplate::new(404).set_body_string("no such note"))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/notes/locked"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        assert_eq!(
            api.update("gone", NotePatch::text("t", "c")).await.unwrap_err(),
            ServiceError::NotFound("no such note".into())
        );
        assert!(matches!(
            api.delete("locked").await.unwrap_err(),
            ServiceError::PermissionDenied(_)
        ));
    }

    #[tokio::test]
    async fn callable_errors_are_mapped() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let api = client(&server, &dir);

        Mock::given(method("POST"))
            .and(path("/functions/summarizeNote"))
            .and(body_json(serde_json::json!({ "data": { "noteId": "mine" } })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "result": { "summary": "Short version." }
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/functions/summarizeNote"))
            .and(body_json(serde_json::json!({ "data": { "noteId": "theirs" } })))
            .respond_with(ResponseTemplate::new(403).set_body_json(serde_json::json!({
                "error": { "status": "PERMISSION_DENIED", "message": "Access denied." }
            })))
            .mount(&server)
            .await;

        assert_eq!(api.summarize("mine").await.unwrap(), "Short version.");
        assert_eq!(
            api.summarize("theirs").await.unwrap_err(),
            ServiceError::PermissionDenied("Access denied.".into())
        );
    }

    #[tokio::test]
    async fn captcha_verification_uses_callable() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let api = client(&server, &dir);

        Mock::given(method("POST"))
            .and(path("/functions/verifyRecaptchaV2"))
            .and(body_json(serde_json::json!({ "data": { "token": "good" } })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "result": { "ok": true }
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/functions/verifyRecaptchaV2"))
            .and(body_json(serde_json::json!({ "data": { "token": "bad" } })))
            .respond_with(ResponseTemplate::new(403).set_body_json(serde_json::json!({
                "error": { "status": "PERMISSION_DENIED", "message": "reCAPTCHA failed." }
            })))
            .mount(&server)
            .await;

        assert!(api.verify("good").await.is_ok());
        assert!(matches!(
            api.verify("bad").await,
            Err(ServiceError::PermissionDenied(_))
        ));
    }

    #[tokio::test]
    async fn server_errors_are_retried() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let api = client(&server, &dir);

        Mock::given(method("PUT"))
            .and(path("/storage/uploads/u1/n1/1_a.txt"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/storage/uploads/u1/n1/1_a.txt"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "url": "https://cdn/a.txt"
            })))
            .mount(&server)
            .await;

        let url = api
            .upload("uploads/u1/n1/1_a.txt", b"abc".to_vec())
            .await
            .unwrap();
        assert_eq!(url, "https://cdn/a.txt");
    }

    #[tokio::test]
    async fn writes_that_may_have_landed_are_not_retried() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let api = client(&server, &dir);

        Mock::given(method("POST"))
            .and(path("/notes"))
            .respond_with(ResponseTemplate::new(503))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/functions/summarizeNote"))
            .respond_with(ResponseTemplate::new(503))
            .expect(1)
            .mount(&server)
            .await;

        let created = api
            .create(NewNote {
                uid: "u1".into(),
                title: "New note".into(),
                content: "Write here...".into(),
            })
            .await;
        assert!(matches!(created, Err(ServiceError::Unavailable(_))));
        assert!(matches!(
            api.summarize("n1").await,
            Err(ServiceError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn blob_paths_are_percent_encoded() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let api = client(&server, &dir);

        Mock::given(method("PUT"))
            .and(path("/storage/uploads/u1/n1/5_lab%232%3F.pdf"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "url": "https://cdn/lab.pdf"
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/notes"))
            .and(query_param("uid", "a&b"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "notes": [note_json("a", "A")]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let blob = crate::model::upload_path("u1", "n1", 5, "lab#2?.pdf");
        assert_eq!(blob, "uploads/u1/n1/5_lab#2?.pdf");
        assert_eq!(api.upload(&blob, b"%PDF".to_vec()).await.unwrap(), "https://cdn/lab.pdf");
        assert_eq!(api.list_notes("a&b").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn zero_poll_interval_still_delivers() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let api = ApiClient::new(&server.uri(), TokenStore::new(dir.path()), Duration::ZERO).unwrap();

        Mock::given(method("GET"))
            .and(path("/notes"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "notes": [note_json("a", "A")]
            })))
            .mount(&server)
            .await;

        let mut sub = api.subscribe("u1");
        let first = time::timeout(Duration::from_secs(2), sub.next())
            .await
            .expect("feed produced nothing");
        assert_eq!(first.unwrap()[0].id, "a");
    }

    #[tokio::test]
    async fn unauthorized_refreshes_once() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let api = client(&server, &dir);
        api.tokens().save("stale", "refresh-1").unwrap();

        Mock::given(method("DELETE"))
            .and(path("/notes/n1"))
            .and(header("authorization", "Bearer stale"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/auth/refresh"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id_token": "fresh", "refresh_token": "refresh-2"
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/notes/n1"))
            .and(header("authorization", "Bearer fresh"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        api.delete("n1").await.unwrap();
        assert_eq!(api.tokens().load().refresh_token, "refresh-2");
    }

    #[tokio::test]
    async fn subscription_emits_only_changes() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let api = client(&server, &dir);

        Mock::given(method("GET"))
            .and(path("/notes"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "notes": [note_json("a", "A")]
            })))
            .mount(&server)
            .await;

        let mut sub = api.subscribe("u1");
        let first = sub.next().await.unwrap();
        assert_eq!(first[0].title, "A");

        let repeat = time::timeout(Duration::from_millis(150), sub.next()).await;
        assert!(repeat.is_err(), "unchanged list must not be re-emitted");
    }

    #[tokio::test]
    async fn sign_in_publishes_user_after_poll() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let api = client(&server, &dir);
        let token = jwt("uid-7");

        Mock::given(method("POST"))
            .and(path("/auth/init"))
            .and(body_json(serde_json::json!({ "provider": "github" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "session_id": "s1", "url": "https://login"
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/auth/poll"))
            .and(query_param("session", "s1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "success", "token": token, "refresh_token": "r"
            })))
            .mount(&server)
            .await;

        let auth = RemoteAuth::headless(api, Duration::from_millis(10));
        let mut rx = auth.listen();
        assert!(rx.borrow().is_none());

        auth.sign_in(AuthProvider::GitHub).await.unwrap();
        time::timeout(Duration::from_secs(2), rx.changed())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rx.borrow().as_ref().unwrap().uid, "uid-7");

        auth.sign_out().await.unwrap();
        assert!(rx.borrow_and_update().is_none());
        assert!(TokenStore::new(dir.path()).current_user().is_none());
    }
}
