//! Minimal TwiML document builder.
//!
//! Only the verbs the call flow emits are modelled. All text and attribute
//! values are XML-escaped on render, so caller speech and LLM output can be
//! placed in a `<Say>` without further care.

use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};

/// Rendered when every other path has failed. Contains no dynamic content.
pub const FALLBACK: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<Response><Pause length="1"/><Redirect method="POST">/voice/idle</Redirect></Response>"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatherInput {
    Dtmf,
    SpeechDtmf,
}

impl GatherInput {
    fn as_str(self) -> &'static str {
        match self {
            GatherInput::Dtmf => "dtmf",
            GatherInput::SpeechDtmf => "speech dtmf",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Verb {
    Say { text: String, voice: String },
    Play { url: String },
    Pause { length: u32 },
    Redirect { url: String },
    Hangup,
    Gather(Gather),
    Pay(Pay),
    Message(String),
}

/// Anything verbs can be appended to: the document itself or a `<Gather>`.
pub trait VerbSink {
    fn push(&mut self, verb: Verb);

    fn say(&mut self, text: impl Into<String>, voice: &str) -> &mut Self
    where
        Self: Sized,
    {
        self.push(Verb::Say {
            text: text.into(),
            voice: voice.to_string(),
        });
        self
    }

    fn play(&mut self, url: impl Into<String>) -> &mut Self
    where
        Self: Sized,
    {
        self.push(Verb::Play { url: url.into() });
        self
    }

    fn pause(&mut self, length: u32) -> &mut Self
    where
        Self: Sized,
    {
        self.push(Verb::Pause { length });
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Gather {
    pub input: GatherInput,
    pub action: String,
    pub timeout: u32,
    pub num_digits: Option<u32>,
    pub nested: Vec<Verb>,
}

impl Gather {
    pub fn new(input: GatherInput, action: impl Into<String>, timeout: u32) -> Self {
        Self {
            input,
            action: action.into(),
            timeout,
            num_digits: None,
            nested: Vec::new(),
        }
    }

    pub fn num_digits(mut self, digits: u32) -> Self {
        self.num_digits = Some(digits);
        self
    }
}

impl VerbSink for Gather {
    fn push(&mut self, verb: Verb) {
        self.nested.push(verb);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Pay {
    pub action: String,
    pub connector: Option<String>,
    /// `(for, prompt text)` pairs, spoken in order.
    pub prompts: Vec<(String, String)>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Twiml {
    verbs: Vec<Verb>,
}

impl VerbSink for Twiml {
    fn push(&mut self, verb: Verb) {
        self.verbs.push(verb);
    }
}

impl Twiml {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn gather(&mut self, gather: Gather) -> &mut Self {
        self.verbs.push(Verb::Gather(gather));
        self
    }

    pub fn redirect(&mut self, url: impl Into<String>) -> &mut Self {
        self.verbs.push(Verb::Redirect { url: url.into() });
        self
    }

    pub fn hangup(&mut self) -> &mut Self {
        self.verbs.push(Verb::Hangup);
        self
    }

    pub fn pay(&mut self, pay: Pay) -> &mut Self {
        self.verbs.push(Verb::Pay(pay));
        self
    }

    pub fn message(&mut self, body: impl Into<String>) -> &mut Self {
        self.verbs.push(Verb::Message(body.into()));
        self
    }

    pub fn render(&self) -> String {
        let mut out = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<Response>");
        for verb in &self.verbs {
            render_verb(verb, &mut out);
        }
        out.push_str("</Response>");
        out
    }
}

impl IntoResponse for Twiml {
    fn into_response(self) -> Response {
        ([(CONTENT_TYPE, "text/xml")], self.render()).into_response()
    }
}

fn render_verb(verb: &Verb, out: &mut String) {
    match verb {
        Verb::Say { text, voice } => {
            out.push_str(&format!(
                "<Say voice=\"{}\">{}</Say>",
                escape(voice),
                escape(text)
            ));
        }
        Verb::Play { url } => out.push_str(&format!("<Play>{}</Play>", escape(url))),
        Verb::Pause { length } => out.push_str(&format!("<Pause length=\"{length}\"/>")),
        Verb::Redirect { url } => {
            out.push_str(&format!(
                "<Redirect method=\"POST\">{}</Redirect>",
                escape(url)
            ));
        }
        Verb::Hangup => out.push_str("<Hangup/>"),
        Verb::Gather(g) => {
            out.push_str(&format!(
                "<Gather input=\"{}\" action=\"{}\" method=\"POST\" timeout=\"{}\"",
                g.input.as_str(),
                escape(&g.action),
                g.timeout
            ));
            if g.input != GatherInput::Dtmf {
                out.push_str(" speechTimeout=\"auto\"");
            }
            if let Some(n) = g.num_digits {
                out.push_str(&format!(" numDigits=\"{n}\""));
            }
            out.push('>');
            for nested in &g.nested {
                render_verb(nested, out);
            }
            out.push_str("</Gather>");
        }
        Verb::Pay(p) => {
            out.push_str(&format!("<Pay action=\"{}\"", escape(&p.action)));
            if let Some(ref c) = p.connector {
                out.push_str(&format!(" paymentConnector=\"{}\"", escape(c)));
            }
            out.push('>');
            for (for_, text) in &p.prompts {
                out.push_str(&format!(
                    "<Prompt for=\"{}\"><Say>{}</Say></Prompt>",
                    escape(for_),
                    escape(text)
                ));
            }
            out.push_str("</Pay>");
        }
        Verb::Message(body) => out.push_str(&format!("<Message>{}</Message>", escape(body))),
    }
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}
