use std::path::PathBuf;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::config::ElevenLabsConfig;

/// Public path prefix for synthesized files, relative to the external URL.
pub const AUDIO_ROUTE: &str = "audio";

#[async_trait]
pub trait SpeechSynth: Send + Sync {
    /// Synthesize `text` and return an audio reference relative to the
    /// public base URL, e.g. `audio/<hash>.mp3`.
    async fn synthesize(&self, text: &str, voice_id: &str) -> Result<String, TtsError>;
}

/// ElevenLabs text-to-speech client.
///
/// Output is MP3 cached on disk under the audio directory, named by a hash of
/// voice and text, so repeated prompts are only synthesized once.
pub struct ElevenLabsClient {
    client: reqwest::Client,
    api_key: String,
    model: String,
    audio_dir: PathBuf,
}

/// ElevenLabs' per-request character limit for turbo models.
const MAX_CHARS: usize = 2500;

impl ElevenLabsClient {
    pub fn new(config: &ElevenLabsConfig, audio_dir: PathBuf) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            audio_dir,
        }
    }

    /// Synthesize a single chunk (must be <= MAX_CHARS).
    async fn synthesize_chunk(&self, text: &str, voice_id: &str) -> Result<Vec<u8>, TtsError> {
        let url = format!("https://api.elevenlabs.io/v1/text-to-speech/{voice_id}");
        let body = serde_json::json!({
            "text": text,
            "model_id": &self.model,
        });

        let resp = self
            .client
            .post(&url)
            .header("xi-api-key", &self.api_key)
            .header("Accept", "audio/mpeg")
            .json(&body)
            .send()
            .await
            .map_err(|e| TtsError::Request(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(TtsError::Api(format!("{status}: {body}")));
        }

        let audio = resp
            .bytes()
            .await
            .map_err(|e| TtsError::Request(e.to_string()))?;
        Ok(audio.to_vec())
    }

    async fn write_atomic(&self, name: &str, audio: &[u8]) -> Result<(), TtsError> {
        tokio::fs::create_dir_all(&self.audio_dir).await?;
        let tmp = self.audio_dir.join(format!(".tmp-{name}"));
        tokio::fs::write(&tmp, audio).await?;
        tokio::fs::rename(&tmp, self.audio_dir.join(name)).await?;
        Ok(())
    }
}

#[async_trait]
impl SpeechSynth for ElevenLabsClient {
    async fn synthesize(&self, text: &str, voice_id: &str) -> Result<String, TtsError> {
        if self.api_key.is_empty() {
            return Err(TtsError::Disabled);
        }
        if text.trim().is_empty() {
            return Err(TtsError::Api("Nothing to synthesize".into()));
        }

        let name = format!("{}.mp3", cache_key(voice_id, text));
        let audio_ref = format!("{AUDIO_ROUTE}/{name}");

        if tokio::fs::try_exists(self.audio_dir.join(&name))
            .await
            .unwrap_or(false)
        {
            tracing::debug!(%audio_ref, "TTS cache hit");
            return Ok(audio_ref);
        }

        // MP3 frames concatenate cleanly, so chunks are joined byte-wise.
        let mut all_audio = Vec::new();
        for chunk in split_text(text, MAX_CHARS) {
            let audio = self.synthesize_chunk(chunk, voice_id).await?;
            all_audio.extend_from_slice(&audio);
        }

        self.write_atomic(&name, &all_audio).await?;
        tracing::info!(%audio_ref, bytes = all_audio.len(), "Synthesized speech");
        Ok(audio_ref)
    }
}

fn cache_key(voice_id: &str, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(voice_id.as_bytes());
    hasher.update(b"|");
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

/// Split text at sentence boundaries to stay under the character limit.
///
/// Splits on `. `, `! `, `? ` boundaries. If a single sentence exceeds the
/// limit, falls back to splitting at the limit, backing off to a char boundary.
fn split_text(text: &str, max_chars: usize) -> Vec<&str> {
    if text.len() <= max_chars {
        return vec![text];
    }

    let mut chunks = Vec::new();
    let mut remaining = text;

    while !remaining.is_empty() {
        if remaining.len() <= max_chars {
            chunks.push(remaining);
            break;
        }

        let mut limit = max_chars;
        while !remaining.is_char_boundary(limit) {
            limit -= 1;
        }

        // Find the last sentence boundary within the limit
        let search_slice = &remaining[..limit];
        let split_pos = search_slice
            .rmatch_indices(". ")
            .chain(search_slice.rmatch_indices("! "))
            .chain(search_slice.rmatch_indices("? "))
            .map(|(i, s)| i + s.len())
            .max();

        let pos = split_pos.unwrap_or(limit);
        chunks.push(&remaining[..pos]);
        remaining = remaining[pos..].trim_start();
    }

    chunks
}

#[derive(Debug, thiserror::Error)]
pub enum TtsError {
    #[error("speech synthesis is not configured")]
    Disabled,
    #[error("HTTP request failed: {0}")]
    Request(String),
    #[error("API error: {0}")]
    Api(String),
    #[error("Failed to store audio: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_not_split() {
        let chunks = split_text("Hello world.", 2000);
        assert_eq!(chunks, vec!["Hello world."]);
    }

    #[test]
    fn splits_at_sentence_boundary() {
        let text = "First sentence. Second sentence. Third sentence.";
        let chunks = split_text(text, 35);
        assert_eq!(chunks[0], "First sentence. Second sentence. ");
        assert_eq!(chunks[1], "Third sentence.");
    }

    #[test]
    fn falls_back_to_hard_split() {
        let text = "A".repeat(3000);
        let chunks = split_text(&text, 2000);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].len(), 2000);
        assert_eq!(chunks[1].len(), 1000);
    }

    #[test]
    fn hard_split_respects_char_boundaries() {
        let text = "é".repeat(10);
        let chunks = split_text(&text, 5);
        assert!(chunks.iter().all(|c| c.len() <= 5));
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn cache_key_depends_on_voice_and_text() {
        assert_eq!(cache_key("v1", "hi"), cache_key("v1", "hi"));
        assert_ne!(cache_key("v1", "hi"), cache_key("v2", "hi"));
        assert_ne!(cache_key("v1", "hi"), cache_key("v1", "hi!"));
    }

    #[tokio::test]
    async fn cached_file_skips_the_request() {
        let dir = tempfile::tempdir().unwrap();
        let config = ElevenLabsConfig {
            api_key: "key".into(),
            ..ElevenLabsConfig::default()
        };
        let client = ElevenLabsClient::new(&config, dir.path().to_path_buf());
        let name = format!("{}.mp3", cache_key("voice", "Hello."));
        std::fs::write(dir.path().join(&name), b"ID3").unwrap();

        let audio_ref = client.synthesize("Hello.", "voice").await.unwrap();
        assert_eq!(audio_ref, format!("audio/{name}"));
    }

    #[tokio::test]
    async fn empty_key_disables_synthesis() {
        let dir = tempfile::tempdir().unwrap();
        let client = ElevenLabsClient::new(&ElevenLabsConfig::default(), dir.path().to_path_buf());
        let err = client.synthesize("Hello.", "voice").await.unwrap_err();
        assert!(matches!(err, TtsError::Disabled));
    }
}
