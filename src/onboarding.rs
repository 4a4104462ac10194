//! Sign-up conversation shared by the voice and SMS channels.
//!
//! [`advance`] is the only transition function. It returns what happened;
//! [`Onboarding`] persists the result and [`prompt_text`] turns the resulting
//! [`Reply`] into channel-specific wording.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use prometheus::IntCounter;
use serde::{Deserialize, Serialize};

use crate::accounts::{Account, AccountStore};
use crate::store::{KvStore, StoreError, Table};

pub const NAMESPACE: &str = "onboarding";
pub const FLOW: &str = "onboard";

const TRIGGERS: &[&str] = &["signup", "sign up", "onboard"];
const YES: &[&str] = &[
    "yes",
    "y",
    "yeah",
    "yep",
    "yup",
    "sure",
    "affirmative",
    "correct",
    "1",
    "one",
];
const NO: &[&str] = &["no", "n", "nope", "nah", "negative", "2", "two"];
const NO_CODE: &[&str] = &["none", "no", "nope", "nah", "skip", "n a"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    AskHasAccount,
    AskName,
    AskPrisonId,
    AskAffiliate,
    AskSupport,
}

/// Which number the flow was started on. Existing customers on the sign-up
/// line are offered support instead of being told they are done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Line {
    Onboarding,
    Main,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Answers {
    pub name: Option<String>,
    pub prison_id: Option<String>,
    pub affiliate_code: Option<String>,
    pub line: Line,
}

impl Answers {
    fn new(line: Line) -> Self {
        Self {
            name: None,
            prison_id: None,
            affiliate_code: None,
            line,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OnboardingState {
    pub step: Step,
    pub data: Answers,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupportChoice {
    Number,
    Agent,
    Decline,
}

/// Result of feeding one answer to the state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Next(Step, Answers),
    /// Answer not understood; stay on the current step.
    Retry,
    AlreadySetUp,
    Support(SupportChoice),
    Finish(Answers),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum YesNo {
    Yes,
    No,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Voice,
    Sms,
}

/// What to say back. Rendered per channel by [`prompt_text`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Ask(Step),
    Retry(Step),
    AlreadySetUp,
    AssignedNumber(Option<String>),
    SupportRequested,
    Declined,
    Completed,
}

impl Reply {
    /// The flow is over after this reply.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Reply::Ask(_) | Reply::Retry(_))
    }
}

/// Lowercase, punctuation to spaces, collapse whitespace.
pub fn normalize(input: &str) -> String {
    input
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn is_trigger(input: &str) -> bool {
    TRIGGERS.contains(&normalize(input).as_str())
}

pub fn parse_yes_no(input: &str) -> Option<YesNo> {
    let norm = normalize(input);
    if YES.contains(&norm.as_str()) {
        return Some(YesNo::Yes);
    }
    if NO.contains(&norm.as_str()) {
        return Some(YesNo::No);
    }
    if norm.starts_with('y') {
        Some(YesNo::Yes)
    } else if norm.starts_with('n') {
        Some(YesNo::No)
    } else {
        None
    }
}

/// First matching category wins: number, then support, then decline.
pub fn parse_support(input: &str) -> Option<SupportChoice> {
    let norm = normalize(input);
    let words: Vec<&str> = norm.split(' ').collect();
    let has = |set: &[&str]| words.iter().any(|w| set.contains(w));

    if has(&["number", "assigned", "retrieve"]) || words.iter().any(|w| w.starts_with("num")) {
        Some(SupportChoice::Number)
    } else if has(&["support", "help", "agent"]) {
        Some(SupportChoice::Agent)
    } else if NO[..5].contains(&norm.as_str()) {
        Some(SupportChoice::Decline)
    } else {
        None
    }
}

/// Transition function for one answer.
pub fn advance(state: &OnboardingState, input: &str) -> Outcome {
    let answer = input.trim();
    let mut data = state.data.clone();

    match state.step {
        Step::AskHasAccount => match parse_yes_no(answer) {
            Some(YesNo::Yes) if data.line == Line::Onboarding => Outcome::Next(Step::AskSupport, data),
            Some(YesNo::Yes) => Outcome::AlreadySetUp,
            Some(YesNo::No) => Outcome::Next(Step::AskName, data),
            None => Outcome::Retry,
        },
        Step::AskName => {
            if normalize(answer).is_empty() {
                return Outcome::Retry;
            }
            data.name = Some(answer.to_string());
            Outcome::Next(Step::AskPrisonId, data)
        }
        Step::AskPrisonId => {
            if normalize(answer).is_empty() {
                return Outcome::Retry;
            }
            data.prison_id = Some(answer.to_string());
            Outcome::Next(Step::AskAffiliate, data)
        }
        Step::AskAffiliate => {
            let norm = normalize(answer);
            data.affiliate_code = if norm.is_empty() || NO_CODE.contains(&norm.as_str()) {
                None
            } else {
                Some(answer.trim_matches(|c: char| !c.is_alphanumeric()).to_string())
            };
            Outcome::Finish(data)
        }
        Step::AskSupport => match parse_support(answer) {
            Some(choice) => Outcome::Support(choice),
            None => Outcome::Retry,
        },
    }
}

pub fn prompt_text(reply: &Reply, channel: Channel) -> String {
    match reply {
        Reply::Ask(step) => ask_text(*step, channel).to_string(),
        Reply::Retry(step) => {
            let sorry = match channel {
                Channel::Voice => "Sorry, I didn't catch that.",
                Channel::Sms => "Sorry, I didn't understand that.",
            };
            format!("{sorry} {}", ask_text(*step, channel))
        }
        Reply::AlreadySetUp => match channel {
            Channel::Voice => "Great, you're already set up. How can I help you today?".into(),
            Channel::Sms => "Great, you're already set up. Text any question to get started.".into(),
        },
        Reply::AssignedNumber(Some(number)) => match channel {
            Channel::Voice => format!(
                "Your assigned number is {}. I've also texted it to you.",
                spell_digits(number)
            ),
            Channel::Sms => format!("Your assigned number is {number}."),
        },
        Reply::AssignedNumber(None) => match channel {
            Channel::Voice => "I couldn't find an assigned number on your account. \
                 Our support team will follow up by text."
                .into(),
            Channel::Sms => "No assigned number is on file for this phone. \
                 Support will follow up shortly."
                .into(),
        },
        Reply::SupportRequested => match channel {
            Channel::Voice => "Okay, I've let our support team know. Someone will text you shortly.".into(),
            Channel::Sms => "Thanks! A member of our support team will text you shortly.".into(),
        },
        Reply::Declined => match channel {
            Channel::Voice => "No problem. If you need anything else, just ask.".into(),
            Channel::Sms => "No problem. Text us any time if you need help.".into(),
        },
        Reply::Completed => match channel {
            Channel::Voice => {
                "You're all set up. To pay now, say pay, or you can text pay for a link.".into()
            }
            Channel::Sms => {
                "All set! Reply 'pay' to get a billing link or say 'pay' on a call to pay by phone."
                    .into()
            }
        },
    }
}

fn ask_text(step: Step, channel: Channel) -> &'static str {
    match (step, channel) {
        (Step::AskHasAccount, Channel::Voice) => {
            "Do you already have an account? Say yes or no, or press 1 for yes and 2 for no."
        }
        (Step::AskHasAccount, Channel::Sms) => {
            "Welcome! Do you already have an account? Reply YES or NO."
        }
        (Step::AskName, Channel::Voice) => "Okay, let's get you set up. Please say your full name.",
        (Step::AskName, Channel::Sms) => "Let's get you set up. What's your full name?",
        (Step::AskPrisonId, Channel::Voice) => "Thanks. Please say your prison I D.",
        (Step::AskPrisonId, Channel::Sms) => "Got it. What's your prison ID?",
        (Step::AskAffiliate, Channel::Voice) => {
            "If you have an affiliate referral code, say it now. Otherwise say none."
        }
        (Step::AskAffiliate, Channel::Sms) => {
            "Thanks. If you have an affiliate code, reply with it now. If not, reply 'none'."
        }
        (Step::AskSupport, Channel::Voice) => {
            "I can read you your assigned number or get you to support. \
             Say number, support, or no."
        }
        (Step::AskSupport, Channel::Sms) => {
            "Since you already have an account: reply NUMBER for your assigned number, \
             SUPPORT to reach our team, or NO."
        }
    }
}

// Separate digits so text-to-speech reads them one at a time.
fn spell_digits(number: &str) -> String {
    number
        .chars()
        .filter(|c| c.is_ascii_digit())
        .map(String::from)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Persisted onboarding conversations, one per phone.
#[derive(Clone)]
pub struct Onboarding {
    table: Table<OnboardingState>,
    accounts: Arc<dyn AccountStore>,
    starts: IntCounter,
}

/// How a call on the onboarding line picks up the flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opening {
    Started,
    /// A flow was already running; its pending question is asked again.
    Resumed(Step),
}

impl Onboarding {
    pub fn new(
        store: Arc<dyn KvStore>,
        accounts: Arc<dyn AccountStore>,
        starts: IntCounter,
    ) -> Self {
        Self {
            table: Table::new(store, NAMESPACE),
            accounts,
            starts,
        }
    }

    fn key(phone: &str) -> String {
        format!("{FLOW}:{phone}")
    }

    pub async fn state(&self, phone: &str) -> Result<Option<OnboardingState>, StoreError> {
        self.table.get(&Self::key(phone)).await
    }

    /// Begin (or restart) the flow at the first question.
    pub async fn start(&self, phone: &str, line: Line) -> Result<Reply, StoreError> {
        self.save(phone, Step::AskHasAccount, Answers::new(line))
            .await?;
        self.starts.inc();
        tracing::info!(phone, ?line, "Onboarding started");
        Ok(Reply::Ask(Step::AskHasAccount))
    }

    /// Start the flow unless one is already running.
    pub async fn resume_or_start(&self, phone: &str, line: Line) -> Result<Opening, StoreError> {
        match self.state(phone).await? {
            Some(state) => {
                tracing::info!(phone, step = ?state.step, "Onboarding resumed");
                Ok(Opening::Resumed(state.step))
            }
            None => {
                self.start(phone, line).await?;
                Ok(Opening::Started)
            }
        }
    }

    pub async fn abandon(&self, phone: &str) -> Result<(), StoreError> {
        self.table.delete(&Self::key(phone)).await?;
        Ok(())
    }

    /// Feed one answer. `None` when no flow is active for `phone`.
    pub async fn handle(&self, phone: &str, input: &str) -> Result<Option<Reply>, StoreError> {
        let Some(state) = self.state(phone).await? else {
            return Ok(None);
        };

        let reply = match advance(&state, input) {
            Outcome::Next(step, data) => {
                tracing::info!(phone, from = ?state.step, to = ?step, "Onboarding advanced");
                self.save(phone, step, data).await?;
                Reply::Ask(step)
            }
            Outcome::Retry => {
                tracing::debug!(phone, step = ?state.step, "Onboarding answer not understood");
                Reply::Retry(state.step)
            }
            Outcome::AlreadySetUp => {
                self.abandon(phone).await?;
                Reply::AlreadySetUp
            }
            Outcome::Support(choice) => {
                self.abandon(phone).await?;
                self.support(phone, choice).await?
            }
            Outcome::Finish(data) => {
                self.create_account(phone, &data).await?;
                self.abandon(phone).await?;
                tracing::info!(phone, "Onboarding completed");
                Reply::Completed
            }
        };
        Ok(Some(reply))
    }

    async fn save(&self, phone: &str, step: Step, data: Answers) -> Result<(), StoreError> {
        let state = OnboardingState {
            step,
            data,
            updated_at: Utc::now(),
        };
        self.table.put(&Self::key(phone), &state).await
    }

    async fn support(&self, phone: &str, choice: SupportChoice) -> Result<Reply, StoreError> {
        Ok(match choice {
            SupportChoice::Number => {
                let number = self
                    .accounts
                    .by_phone(phone)
                    .await?
                    .and_then(|a| a.assigned_number);
                if number.is_none() {
                    tracing::info!(phone, "Support requested: no assigned number on file");
                }
                Reply::AssignedNumber(number)
            }
            SupportChoice::Agent => {
                tracing::info!(phone, "Support requested");
                Reply::SupportRequested
            }
            SupportChoice::Decline => Reply::Declined,
        })
    }

    async fn create_account(&self, phone: &str, data: &Answers) -> Result<(), StoreError> {
        // Resolve before writing so a caller never refers themselves.
        let referrer = match data.affiliate_code.as_deref() {
            Some(code) => self
                .accounts
                .find_by_affiliate_code(code)
                .await?
                .filter(|a| a.phone != phone)
                .map(|a| a.phone),
            None => None,
        };

        let mut account = self
            .accounts
            .by_phone(phone)
            .await?
            .unwrap_or_else(|| Account::new(phone));
        account.name = data.name.clone();
        account.prison_id = data.prison_id.clone();
        account.affiliate_code = data.affiliate_code.clone();
        if referrer.is_some() {
            account.referrer_phone = referrer;
        }
        self.accounts.upsert(&account).await
    }
}
