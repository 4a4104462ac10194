use crate::accounts::Account;
use crate::config::Config;

/// Voice id for synthesis: the account's preference (keyword or raw id),
/// else the configured default.
pub fn resolve_voice(config: &Config, account: Option<&Account>) -> String {
    account
        .and_then(|a| a.voice.as_deref())
        .map(|pref| lookup_keyword(config, pref))
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| config.elevenlabs.voice_id.clone())
}

fn lookup_keyword(config: &Config, pref: &str) -> String {
    let key = pref.trim().to_lowercase();
    config
        .voice
        .voices
        .iter()
        .find(|(k, _)| k.to_lowercase() == key)
        .map(|(_, id)| id.clone())
        .unwrap_or_else(|| pref.trim().to_string())
}

/// Keywords callers can pick from, sorted for stable SMS output.
pub fn keywords(config: &Config) -> Vec<String> {
    let mut keys: Vec<String> = config.voice.voices.keys().map(|k| k.to_lowercase()).collect();
    keys.sort();
    keys.dedup();
    keys
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support;

    fn config() -> Config {
        let mut config = test_support::config();
        config
            .voice
            .voices
            .insert("Sparkles".into(), "voice-sparkles".into());
        config.voice.voices.insert("joanna".into(), "voice-joanna".into());
        config
    }

    #[test]
    fn keyword_resolves_case_insensitively() {
        let mut account = Account::new("+1");
        account.voice = Some("SPARKLES".into());
        assert_eq!(resolve_voice(&config(), Some(&account)), "voice-sparkles");
    }

    #[test]
    fn raw_id_passes_through() {
        let mut account = Account::new("+1");
        account.voice = Some("abc123".into());
        assert_eq!(resolve_voice(&config(), Some(&account)), "abc123");
    }

    #[test]
    fn no_preference_uses_default() {
        let config = config();
        assert_eq!(resolve_voice(&config, None), config.elevenlabs.voice_id);
        let mut blank = Account::new("+1");
        blank.voice = Some("  ".into());
        assert_eq!(resolve_voice(&config, Some(&blank)), config.elevenlabs.voice_id);
    }

    #[test]
    fn keywords_are_sorted() {
        assert_eq!(keywords(&config()), vec!["joanna", "sparkles"]);
    }
}
