//! Shared fixtures for handler and pipeline tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::http::{header, Method, Request};
use axum::response::Response;
use tokio::sync::{Mutex, Notify};
use tower::ServiceExt;

use crate::accounts::{Account, AccountStore, KvAccountStore};
use crate::billing::{CheckoutError, CheckoutLinks};
use crate::config::Config;
use crate::feedback::FeedbackLog;
use crate::interactions::InteractionLog;
use crate::metrics::Metrics;
use crate::onboarding::Onboarding;
use crate::pipeline::{ChatMessage, CompletionService, LlmError, ReplyPipeline, SpeechSynth, TtsError};
use crate::session::{CallStateStore, JobResult, JobStore};
use crate::store::{KvStore, MemoryStore};
use crate::twilio::{SmsError, SmsSender};
use crate::{build_router, AppState};

pub const ONBOARDING_LINE: &str = "+15550009999";
pub const MAIN_LINE: &str = "+15550008888";

pub fn config() -> Config {
    let mut config = Config::from_toml(
        r#"
[server]
host = "127.0.0.1"
port = 0
external_url = "https://voice.example.com/"

[twilio]
account_sid = "ACtest"
auth_token = "secret"
phone_number = "+15550008888"

[voice]
gather_timeout_secs = 10
poll_pause_secs = 2
hold_message_after_secs = 10
max_reply_wait_secs = 60
"#,
    )
    .unwrap();
    config.lines.onboarding_number = Some(ONBOARDING_LINE.to_string());
    config
        .voice
        .voices
        .insert("joanna".into(), "voice-joanna".into());
    config
}

pub async fn body_text(resp: Response) -> String {
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

/// Job id from a `<Redirect>` to the polling endpoint.
pub fn redirect_job(xml: &str) -> Option<String> {
    let start = xml.find("/play?job=")? + "/play?job=".len();
    let rest = &xml[start..];
    let end = rest.find('&').unwrap_or(rest.len());
    Some(rest[..end].to_string())
}

enum LlmBehavior {
    Reply(String),
    Fail,
}

pub struct FakeLlm {
    behavior: LlmBehavior,
    gate: Option<Notify>,
    released: AtomicBool,
    seen: Mutex<Vec<ChatMessage>>,
}

impl FakeLlm {
    fn build(behavior: LlmBehavior, gated: bool) -> Self {
        Self {
            behavior,
            gate: gated.then(Notify::new),
            released: AtomicBool::new(false),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn replying(text: &str) -> Self {
        Self::build(LlmBehavior::Reply(text.to_string()), false)
    }

    pub fn failing() -> Self {
        Self::build(LlmBehavior::Fail, false)
    }

    /// Replies only after [`FakeLlm::release`].
    pub fn gated(text: &str) -> Self {
        Self::build(LlmBehavior::Reply(text.to_string()), true)
    }

    pub fn release(&self) {
        self.released.store(true, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.notify_waiters();
        }
    }

    pub async fn last_messages(&self) -> Vec<ChatMessage> {
        self.seen.lock().await.clone()
    }
}

#[async_trait]
impl CompletionService for FakeLlm {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, LlmError> {
        *self.seen.lock().await = messages.to_vec();
        if let Some(gate) = &self.gate {
            loop {
                let notified = gate.notified();
                if self.released.load(Ordering::SeqCst) {
                    break;
                }
                notified.await;
            }
        }
        match &self.behavior {
            LlmBehavior::Reply(text) => Ok(text.clone()),
            LlmBehavior::Fail => Err(LlmError::Api("500: upstream down".into())),
        }
    }

    fn model(&self) -> &str {
        "fake-model"
    }
}

pub struct FakeSynth {
    fail: bool,
}

impl FakeSynth {
    pub fn working() -> Self {
        Self { fail: false }
    }

    pub fn failing() -> Self {
        Self { fail: true }
    }
}

#[async_trait]
impl SpeechSynth for FakeSynth {
    async fn synthesize(&self, text: &str, voice_id: &str) -> Result<String, TtsError> {
        if self.fail {
            return Err(TtsError::Api("401: bad key".into()));
        }
        Ok(format!("audio/{}-{}.mp3", voice_id, text.len()))
    }
}

#[derive(Default)]
pub struct RecordingSms {
    sent: Mutex<Vec<(String, String)>>,
}

impl RecordingSms {
    /// Messages sent so far, once at least `n` have arrived or a second has passed.
    pub async fn wait_for(&self, n: usize) -> Vec<(String, String)> {
        for _ in 0..100 {
            {
                let sent = self.sent.lock().await;
                if sent.len() >= n {
                    return sent.clone();
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl SmsSender for RecordingSms {
    async fn send(&self, to: &str, body: &str) -> Result<(), SmsError> {
        self.sent
            .lock()
            .await
            .push((to.to_string(), body.to_string()));
        Ok(())
    }
}

pub struct FakeCheckout;

#[async_trait]
impl CheckoutLinks for FakeCheckout {
    async fn create_checkout(
        &self,
        phone: &str,
        plan: &str,
        crypto: bool,
    ) -> Result<String, CheckoutError> {
        let suffix = if crypto { "?crypto" } else { "" };
        Ok(format!("https://checkout.test/{phone}/{plan}{suffix}"))
    }
}

/// Full router over in-memory storage and fake providers.
pub struct Harness {
    pub state: AppState,
    pub kv: Arc<dyn KvStore>,
    pub llm: Arc<FakeLlm>,
    pub sms: Arc<RecordingSms>,
}

impl Harness {
    /// The LLM is gated so dispatched jobs stay pending until released.
    pub fn new() -> Self {
        Self::with_llm(FakeLlm::gated("Here you go."))
    }

    pub fn with_llm(llm: FakeLlm) -> Self {
        let config = Arc::new(config());
        let kv: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let llm = Arc::new(llm);
        let sms = Arc::new(RecordingSms::default());
        let accounts: Arc<dyn AccountStore> = Arc::new(KvAccountStore::new(Arc::clone(&kv)));
        let jobs = JobStore::new(Arc::clone(&kv));
        let metrics = Metrics::new().unwrap();

        let replies = ReplyPipeline::new(
            Arc::clone(&config),
            llm.clone(),
            Arc::new(FakeSynth::working()),
            jobs.clone(),
            InteractionLog::new(Arc::clone(&kv)),
            metrics.tts_failures.clone(),
        );
        let state = AppState {
            config,
            calls: CallStateStore::new(Arc::clone(&kv)),
            jobs,
            onboarding: Onboarding::new(
                Arc::clone(&kv),
                Arc::clone(&accounts),
                metrics.onboarding_starts.clone(),
            ),
            accounts,
            replies,
            sms: sms.clone(),
            checkout: Arc::new(FakeCheckout),
            feedback: FeedbackLog::new(Arc::clone(&kv)),
            metrics,
        };

        Self {
            state,
            kv,
            llm,
            sms,
        }
    }

    async fn send(&self, request: Request<Body>) -> (u16, String) {
        let resp = build_router(self.state.clone())
            .oneshot(request)
            .await
            .unwrap();
        let status = resp.status().as_u16();
        (status, body_text(resp).await)
    }

    /// Form-encoded POST, as Twilio sends webhooks.
    pub async fn post(&self, path: &str, fields: &[(&str, String)]) -> String {
        let body = fields
            .iter()
            .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&");
        let (status, text) = self
            .raw_post(path, "application/x-www-form-urlencoded", &body)
            .await;
        assert_eq!(status, 200, "POST {path} failed: {text}");
        text
    }

    pub async fn get(&self, path: &str) -> String {
        let request = Request::builder()
            .method(Method::GET)
            .uri(path)
            .body(Body::empty())
            .unwrap();
        let (status, text) = self.send(request).await;
        assert_eq!(status, 200, "GET {path} failed: {text}");
        text
    }

    pub async fn raw_post(&self, path: &str, content_type: &str, body: &str) -> (u16, String) {
        let request = Request::builder()
            .method(Method::POST)
            .uri(path)
            .header(header::CONTENT_TYPE, content_type)
            .body(Body::from(body.to_string()))
            .unwrap();
        self.send(request).await
    }

    pub async fn add_account(&self, account: Account) {
        self.state.accounts.upsert(&account).await.unwrap();
    }

    pub async fn account(&self, phone: &str) -> Option<Account> {
        self.state.accounts.by_phone(phone).await.unwrap()
    }

    /// Poll until a dispatched job publishes, giving up after two seconds.
    pub async fn wait_for_job(&self, job_id: &str) -> Option<JobResult> {
        for _ in 0..200 {
            if let Some(result) = self.state.jobs.get(job_id).await {
                return Some(result);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        None
    }
}
