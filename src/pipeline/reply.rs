//! Background reply jobs: LLM completion, speech synthesis, result publication.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::Utc;
use futures_util::FutureExt;
use prometheus::IntCounter;
use tokio::task::JoinHandle;

use super::llm::{self, CompletionService, LlmError};
use super::tts::SpeechSynth;
use crate::accounts::Account;
use crate::config::Config;
use crate::interactions::{Interaction, InteractionLog};
use crate::onboarding::Channel;
use crate::session::{JobResult, JobStore};
use crate::voices;

/// Everything the background task needs; owned so it can outlive the request.
#[derive(Debug, Clone)]
pub struct ReplyRequest {
    pub job_id: String,
    pub call_sid: String,
    pub caller: String,
    pub utterance: String,
    /// Owner of the line, for voice preference only. History stays with the caller.
    pub account: Option<Account>,
}

#[derive(Clone)]
pub struct ReplyPipeline {
    config: Arc<Config>,
    llm: Arc<dyn CompletionService>,
    tts: Arc<dyn SpeechSynth>,
    jobs: JobStore,
    interactions: InteractionLog,
    tts_failures: IntCounter,
}

impl ReplyPipeline {
    pub fn new(
        config: Arc<Config>,
        llm: Arc<dyn CompletionService>,
        tts: Arc<dyn SpeechSynth>,
        jobs: JobStore,
        interactions: InteractionLog,
        tts_failures: IntCounter,
    ) -> Self {
        Self {
            config,
            llm,
            tts,
            jobs,
            interactions,
            tts_failures,
        }
    }

    /// Run the job detached from the calling request.
    pub fn dispatch(&self, request: ReplyRequest) -> JoinHandle<()> {
        tracing::info!(job_id = %request.job_id, call_sid = %request.call_sid, "Reply job dispatched");
        let pipeline = self.clone();
        tokio::spawn(async move { pipeline.run(request).await })
    }

    /// Produce and publish exactly one result for `request.job_id`.
    pub async fn run(&self, request: ReplyRequest) {
        let job_id = request.job_id.as_str();
        if self.jobs.exists(job_id).await {
            tracing::warn!(job_id, "Reply job already has a result, not running it again");
            return;
        }
        let produced = AssertUnwindSafe(self.produce(&request))
            .catch_unwind()
            .await;

        let (result, reply) = match produced {
            Ok(Ok((result, text, voice))) => (result, Some((text, voice))),
            Ok(Err(e)) => {
                tracing::warn!(job_id, "Reply job failed: {e}");
                (
                    JobResult::Error {
                        message: e.to_string(),
                    },
                    None,
                )
            }
            Err(_) => {
                tracing::error!(job_id, "Reply job panicked");
                (
                    JobResult::Error {
                        message: "reply task panicked".into(),
                    },
                    None,
                )
            }
        };

        match self.jobs.publish(job_id, &result).await {
            Ok(()) => tracing::info!(job_id, result = ?result, "Reply job completed"),
            Err(e) => tracing::warn!(job_id, "Reply job result not stored: {e}"),
        }

        // Bookkeeping happens after publication and cannot change the result.
        if let Some((text, voice)) = reply {
            self.record(
                &request.caller,
                Channel::Voice,
                &request.utterance,
                &text,
                Some(voice),
            )
            .await;
        }
    }

    async fn produce(
        &self,
        request: &ReplyRequest,
    ) -> Result<(JobResult, String, String), LlmError> {
        let text = self
            .complete(&request.caller, &request.utterance)
            .await?;
        let voice = voices::resolve_voice(&self.config, request.account.as_ref());

        let result = match self.tts.synthesize(&text, &voice).await {
            Ok(audio_ref) => JobResult::Ready { audio_ref },
            Err(e) => {
                self.tts_failures.inc();
                tracing::warn!(job_id = %request.job_id, "TTS failed, replying with text: {e}");
                JobResult::ReadyText { text: text.clone() }
            }
        };
        Ok((result, text, voice))
    }

    /// LLM reply with the phone's recent history as context.
    pub async fn complete(&self, phone: &str, utterance: &str) -> Result<String, LlmError> {
        let history = self
            .interactions
            .recent(phone, self.config.openai.history_turns)
            .await
            .unwrap_or_else(|e| {
                tracing::warn!(phone, "History unavailable: {e}");
                Vec::new()
            });
        let messages = llm::conversation(&self.system_prompt(), &history, utterance);
        self.llm.complete(&messages).await
    }

    /// Text-only exchange for the SMS channel. Logged like a voice turn.
    pub async fn text_reply(&self, phone: &str, body: &str) -> Result<String, LlmError> {
        let reply = self.complete(phone, body).await?;
        self.record(phone, Channel::Sms, body, &reply, None).await;
        Ok(reply)
    }

    async fn record(
        &self,
        phone: &str,
        channel: Channel,
        transcript: &str,
        response: &str,
        voice_id: Option<String>,
    ) {
        tracing::info!(
            target: "aicon::transcript",
            phone,
            ?channel,
            transcript,
            response,
            "Exchange"
        );
        let entry = Interaction {
            phone: phone.to_string(),
            channel,
            transcript: transcript.to_string(),
            response: response.to_string(),
            model: self.llm.model().to_string(),
            voice_id,
            at: Utc::now(),
        };
        if let Err(e) = self.interactions.append(&entry).await {
            tracing::warn!(phone, "Interaction not recorded: {e}");
        }
    }

    fn system_prompt(&self) -> String {
        match &self.config.openai.system_prompt {
            Some(prompt) if !prompt.trim().is_empty() => prompt.clone(),
            _ => format!(
                "You are {}, a warm and concise phone assistant. Replies are read aloud \
                 or sent by text, so keep them to a few short sentences with no markdown.",
                self.config.voice.assistant_name
            ),
        }
    }
}
