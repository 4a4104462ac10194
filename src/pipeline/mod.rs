pub mod llm;
pub mod reply;
pub mod tts;

pub use llm::{ChatMessage, CompletionService, LlmError, OpenAiClient};
pub use reply::{ReplyPipeline, ReplyRequest};
pub use tts::{ElevenLabsClient, SpeechSynth, TtsError};
