use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub twilio: TwilioConfig,
    #[serde(default)]
    pub openai: OpenAiConfig,
    #[serde(default)]
    pub elevenlabs: ElevenLabsConfig,
    #[serde(default)]
    pub stripe: StripeConfig,
    #[serde(default)]
    pub voice: VoiceConfig,
    #[serde(default)]
    pub lines: LinesConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub external_url: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TwilioConfig {
    pub account_sid: String,
    pub auth_token: String,
    pub phone_number: String,
    /// Payment connector name used by `<Pay>`. Twilio's default connector when unset.
    #[serde(default)]
    pub pay_connector: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct OpenAiConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_openai_model")]
    pub model: String,
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// How many earlier exchanges with the same phone are sent as context.
    #[serde(default = "default_history_turns")]
    pub history_turns: usize,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: default_openai_model(),
            system_prompt: None,
            history_turns: default_history_turns(),
        }
    }
}

fn default_openai_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_history_turns() -> usize {
    6
}

#[derive(Debug, Deserialize, Clone)]
pub struct ElevenLabsConfig {
    /// Empty disables synthesis; replies are then read out with `<Say>`.
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_voice_id")]
    pub voice_id: String,
    #[serde(default = "default_tts_model")]
    pub model: String,
}

impl Default for ElevenLabsConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            voice_id: default_voice_id(),
            model: default_tts_model(),
        }
    }
}

fn default_voice_id() -> String {
    "EXAVITQu4vr4xnSDxMaL".to_string()
}

fn default_tts_model() -> String {
    "eleven_turbo_v2_5".to_string()
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct StripeConfig {
    #[serde(default)]
    pub api_key: String,
    /// Plan name (lowercase) to Stripe price id.
    #[serde(default)]
    pub prices: HashMap<String, String>,
    #[serde(default)]
    pub success_url: Option<String>,
    #[serde(default)]
    pub cancel_url: Option<String>,
    #[serde(default)]
    pub crypto_coupon: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct VoiceConfig {
    #[serde(default = "default_assistant_name")]
    pub assistant_name: String,
    /// Extra greeting variants, placed ahead of the built-in ones.
    #[serde(default)]
    pub greetings: Vec<String>,
    #[serde(default = "default_gather_timeout")]
    pub gather_timeout_secs: u32,
    #[serde(default = "default_poll_pause")]
    pub poll_pause_secs: u32,
    #[serde(default = "default_hold_after")]
    pub hold_message_after_secs: u32,
    #[serde(default = "default_max_reply_wait")]
    pub max_reply_wait_secs: u32,
    #[serde(default = "default_say_voice")]
    pub say_voice: String,
    /// Voice keyword (lowercase) to ElevenLabs voice id.
    #[serde(default)]
    pub voices: HashMap<String, String>,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            assistant_name: default_assistant_name(),
            greetings: Vec::new(),
            gather_timeout_secs: default_gather_timeout(),
            poll_pause_secs: default_poll_pause(),
            hold_message_after_secs: default_hold_after(),
            max_reply_wait_secs: default_max_reply_wait(),
            say_voice: default_say_voice(),
            voices: HashMap::new(),
        }
    }
}

fn default_assistant_name() -> String {
    "Sparkles".to_string()
}

fn default_gather_timeout() -> u32 {
    10
}

fn default_poll_pause() -> u32 {
    2
}

fn default_hold_after() -> u32 {
    10
}

fn default_max_reply_wait() -> u32 {
    60
}

fn default_say_voice() -> String {
    "Polly.Joanna".to_string()
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct LinesConfig {
    /// Dedicated sign-up number. Calls and texts to it start onboarding.
    #[serde(default)]
    pub onboarding_number: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    #[serde(default = "default_call_state_ttl")]
    pub call_state_ttl_secs: u64,
    #[serde(default = "default_job_ttl")]
    pub job_ttl_secs: u64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            call_state_ttl_secs: default_call_state_ttl(),
            job_ttl_secs: default_job_ttl(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

fn default_call_state_ttl() -> u64 {
    2 * 60 * 60
}

fn default_job_ttl() -> u64 {
    30 * 60
}

fn default_sweep_interval() -> u64 {
    300
}

impl Config {
    pub fn load() -> Result<Self, Box<dyn std::error::Error>> {
        // Load .env file from same directory as config.toml
        let env_path = config_dir().join(".env");
        match dotenvy::from_path(&env_path) {
            Ok(()) => tracing::info!("Loaded .env from {}", env_path.display()),
            Err(dotenvy::Error::Io(_)) => {
                tracing::debug!(
                    "No .env file at {}, using environment only",
                    env_path.display()
                );
            }
            Err(e) => tracing::warn!("Failed to parse .env: {e}"),
        }

        let path = config_path();
        tracing::info!("Loading config from {}", path.display());

        let contents = std::fs::read_to_string(&path).map_err(|e| {
            format!(
                "Failed to read config at {}: {}. Copy config.example.toml to {}",
                path.display(),
                e,
                path.display()
            )
        })?;

        let mut config = Self::from_toml(&contents)?;
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    // Secrets may live in the environment instead of config.toml.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("TWILIO_ACCOUNT_SID") {
            self.twilio.account_sid = v;
        }
        if let Ok(v) = std::env::var("TWILIO_AUTH_TOKEN") {
            self.twilio.auth_token = v;
        }
        if let Ok(v) = std::env::var("OPENAI_API_KEY") {
            self.openai.api_key = v;
        }
        if let Ok(v) = std::env::var("ELEVENLABS_API_KEY") {
            self.elevenlabs.api_key = v;
        }
        if let Ok(v) = std::env::var("STRIPE_API_KEY") {
            self.stripe.api_key = v;
        }
        if let Ok(v) = std::env::var("SERVER_EXTERNAL_URL") {
            self.server.external_url = v;
        }
        if let Ok(v) = std::env::var("ONBOARDING_PHONE_NUMBER") {
            self.lines.onboarding_number = Some(v);
        }
    }

    /// Problems that let the server start but disable a feature.
    pub fn warnings(&self) -> Vec<String> {
        let mut out = Vec::new();
        if self.openai.api_key.is_empty() {
            out.push("openai.api_key is empty: every reply will be an apology".to_string());
        }
        if self.elevenlabs.api_key.is_empty() {
            out.push("elevenlabs.api_key is empty: replies fall back to <Say>".to_string());
        }
        if self.stripe.api_key.is_empty() {
            out.push("stripe.api_key is empty: payment links are unavailable".to_string());
        }
        if self.server.external_url.is_empty() {
            out.push("server.external_url is empty: synthesized audio cannot be played".to_string());
        }
        if self.voice.poll_pause_secs == 0 {
            out.push("voice.poll_pause_secs is 0: polling will hammer the server".to_string());
        }
        out
    }

    pub fn data_dir(&self) -> PathBuf {
        self.storage
            .data_dir
            .clone()
            .unwrap_or_else(|| config_dir().join("data"))
    }

    pub fn is_onboarding_line(&self, number: &str) -> bool {
        matches!(&self.lines.onboarding_number, Some(n) if !n.is_empty() && n == number)
    }

    /// Absolute URL Twilio can fetch a stored audio reference from.
    pub fn audio_url(&self, audio_ref: &str) -> String {
        format!(
            "{}/{}",
            self.server.external_url.trim_end_matches('/'),
            audio_ref.trim_start_matches('/')
        )
    }

    pub fn call_state_ttl(&self) -> Duration {
        Duration::from_secs(self.storage.call_state_ttl_secs)
    }

    pub fn job_ttl(&self) -> Duration {
        Duration::from_secs(self.storage.job_ttl_secs)
    }
}

fn config_dir() -> PathBuf {
    if let Ok(p) = std::env::var("AICON_CONFIG") {
        // If pointing to a file, use its parent directory
        let path = PathBuf::from(p);
        return path.parent().map(|p| p.to_path_buf()).unwrap_or(path);
    }

    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".aicon")
}

fn config_path() -> PathBuf {
    if let Ok(p) = std::env::var("AICON_CONFIG") {
        return PathBuf::from(p);
    }

    config_dir().join("config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[server]
host = "127.0.0.1"
port = 5050
external_url = "https://voice.example.com/"

[twilio]
account_sid = "AC123"
auth_token = "secret"
phone_number = "+15550000000"
"#;

    #[test]
    fn minimal_config_gets_defaults() {
        let config = Config::from_toml(MINIMAL).unwrap();
        assert_eq!(config.voice.gather_timeout_secs, 10);
        assert_eq!(config.voice.poll_pause_secs, 2);
        assert_eq!(config.voice.hold_message_after_secs, 10);
        assert_eq!(config.voice.assistant_name, "Sparkles");
        assert_eq!(config.openai.model, "gpt-4o-mini");
        assert_eq!(config.storage.job_ttl_secs, 1800);
        assert!(config.lines.onboarding_number.is_none());
    }

    #[test]
    fn partial_section_keeps_other_defaults() {
        let toml = format!("{MINIMAL}\n[voice]\ngather_timeout_secs = 8\n");
        let config = Config::from_toml(&toml).unwrap();
        assert_eq!(config.voice.gather_timeout_secs, 8);
        assert_eq!(config.voice.say_voice, "Polly.Joanna");
    }

    #[test]
    fn audio_url_joins_without_double_slash() {
        let config = Config::from_toml(MINIMAL).unwrap();
        assert_eq!(
            config.audio_url("/audio/abc.mp3"),
            "https://voice.example.com/audio/abc.mp3"
        );
    }

    #[test]
    fn onboarding_line_requires_exact_match() {
        let toml = format!("{MINIMAL}\n[lines]\nonboarding_number = \"+15551112222\"\n");
        let config = Config::from_toml(&toml).unwrap();
        assert!(config.is_onboarding_line("+15551112222"));
        assert!(!config.is_onboarding_line("+15550000000"));
        assert!(!config.is_onboarding_line(""));
    }

    #[test]
    fn missing_keys_are_reported() {
        let config = Config::from_toml(MINIMAL).unwrap();
        let warnings = config.warnings();
        assert!(warnings.iter().any(|w| w.contains("openai")));
        assert!(warnings.iter().any(|w| w.contains("elevenlabs")));
    }
}
