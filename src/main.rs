mod accounts;
mod billing;
mod config;
mod feedback;
mod greeting;
mod interactions;
mod metrics;
mod onboarding;
mod pipeline;
mod security;
mod session;
mod store;
mod twilio;
mod twiml;
mod voice;
mod voices;
mod watchdog;

#[cfg(test)]
mod test_support;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use accounts::{AccountStore, KvAccountStore};
use billing::{CheckoutLinks, StripeCheckout};
use config::Config;
use feedback::FeedbackLog;
use interactions::InteractionLog;
use metrics::Metrics;
use onboarding::Onboarding;
use pipeline::{ElevenLabsClient, OpenAiClient, ReplyPipeline};
use session::{CallStateStore, JobStore};
use store::{FileStore, KvStore, Retention};
use twilio::{SmsSender, TwilioSms};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Shared application state accessible from all handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub calls: CallStateStore,
    pub jobs: JobStore,
    pub onboarding: Onboarding,
    pub accounts: Arc<dyn AccountStore>,
    /// Background LLM + speech jobs, and direct SMS replies.
    pub replies: ReplyPipeline,
    pub sms: Arc<dyn SmsSender>,
    pub checkout: Arc<dyn CheckoutLinks>,
    pub feedback: FeedbackLog,
    pub metrics: Metrics,
}

fn main() {
    let args: Vec<String> = std::env::args().collect();

    match args.get(1).map(|s| s.as_str()) {
        Some("--version") => println!("aicon {VERSION}"),
        Some("--help") | Some("-h") => print_usage(),
        Some("--check-config") => check_config(),
        Some(other) => {
            eprintln!("Unknown option: {other}");
            print_usage();
            std::process::exit(1);
        }
        None => match tokio::runtime::Runtime::new() {
            Ok(rt) => rt.block_on(server()),
            Err(e) => {
                eprintln!("Failed to create tokio runtime: {e}");
                std::process::exit(1);
            }
        },
    }
}

fn print_usage() {
    println!("aicon {VERSION}");
    println!("Twilio voice and SMS assistant");
    println!();
    println!("Usage: aicon [OPTIONS]");
    println!();
    println!("Options:");
    println!("  --check-config  Load and validate config, then exit");
    println!("  --version       Print version");
    println!("  --help, -h      Print this help message");
    println!();
    println!("Without options, starts the webhook server.");
}

fn load_config() -> Config {
    match Config::load() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config: {e}");
            std::process::exit(1);
        }
    }
}

fn check_config() {
    let config = load_config();
    println!("Config OK");
    println!("  listen:          {}:{}", config.server.host, config.server.port);
    println!("  external url:    {}", config.server.external_url);
    println!("  twilio number:   {}", config.twilio.phone_number);
    println!(
        "  onboarding line: {}",
        config.lines.onboarding_number.as_deref().unwrap_or("(none)")
    );
    println!("  model:           {}", config.openai.model);
    println!("  data dir:        {}", config.data_dir().display());

    let warnings = config.warnings();
    if !warnings.is_empty() {
        println!();
        for w in &warnings {
            println!("warning: {w}");
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    let audio_dir = state.config.data_dir().join(pipeline::tts::AUDIO_ROUTE);

    Router::new()
        // Voice call webhooks
        .route(voice::VOICE_PATH, post(voice::turn::handle_voice))
        .route(voice::IDLE_PATH, post(voice::idle::handle_idle))
        .route(
            "/play",
            get(voice::playback::handle_play).post(voice::playback::handle_play),
        )
        .route(
            voice::SECURITY_SET_PATH,
            post(voice::subflows::handle_security_set),
        )
        .route(
            voice::SECURITY_VERIFY_PATH,
            post(voice::subflows::handle_security_verify),
        )
        .route(
            voice::SUSPENDED_ACTION_PATH,
            post(voice::subflows::handle_suspended_action),
        )
        .route(
            voice::PAY_RESULT_PATH,
            post(voice::subflows::handle_pay_result),
        )
        // Messaging, and the single-number webhook for both
        .route("/sms", post(twilio::sms::handle_sms))
        .route("/twilio", post(twilio::webhook::handle_unified))
        .route("/onboard", post(twilio::webhook::handle_unified))
        // Synthesized replies fetched by Twilio's <Play>
        .nest_service("/audio", ServeDir::new(audio_dir))
        .route("/health", get(health))
        .route("/metrics", get(metrics::handle_metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn server() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "aicon=info,tower_http=info".into()),
        )
        .init();

    let config = Arc::new(load_config());
    for w in config.warnings() {
        tracing::warn!("{w}");
    }

    tracing::info!(
        host = %config.server.host,
        port = config.server.port,
        "Starting aicon"
    );

    let data_dir = config.data_dir();
    let kv: Arc<dyn KvStore> = match FileStore::open(&data_dir).await {
        Ok(store) => Arc::new(store),
        Err(e) => {
            tracing::error!(path = %data_dir.display(), "Failed to open data dir: {e}");
            std::process::exit(1);
        }
    };
    tracing::info!(path = %data_dir.display(), "Storage ready");

    let shutdown = CancellationToken::new();
    let sweeper = store::spawn_sweeper(
        Arc::clone(&kv),
        vec![
            Retention {
                namespace: session::call_state::NAMESPACE,
                max_age: config.call_state_ttl(),
            },
            Retention {
                namespace: session::jobs::NAMESPACE,
                max_age: config.job_ttl(),
            },
        ],
        std::time::Duration::from_secs(config.storage.sweep_interval_secs.max(1)),
        shutdown.clone(),
    );

    let metrics = match Metrics::new() {
        Ok(m) => m,
        Err(e) => {
            tracing::error!("Failed to register metrics: {e}");
            std::process::exit(1);
        }
    };

    let accounts: Arc<dyn AccountStore> = Arc::new(KvAccountStore::new(Arc::clone(&kv)));
    let jobs = JobStore::new(Arc::clone(&kv));
    let replies = ReplyPipeline::new(
        Arc::clone(&config),
        Arc::new(OpenAiClient::new(&config.openai)),
        Arc::new(ElevenLabsClient::new(
            &config.elevenlabs,
            data_dir.join(pipeline::tts::AUDIO_ROUTE),
        )),
        jobs.clone(),
        InteractionLog::new(Arc::clone(&kv)),
        metrics.tts_failures.clone(),
    );

    let state = AppState {
        calls: CallStateStore::new(Arc::clone(&kv)),
        jobs,
        onboarding: Onboarding::new(
            Arc::clone(&kv),
            Arc::clone(&accounts),
            metrics.onboarding_starts.clone(),
        ),
        accounts,
        replies,
        sms: Arc::new(TwilioSms::new(&config.twilio)),
        checkout: Arc::new(StripeCheckout::new(&config)),
        feedback: FeedbackLog::new(Arc::clone(&kv)),
        metrics,
        config: Arc::clone(&config),
    };

    let app = build_router(state);

    let addr: SocketAddr = match format!("{}:{}", config.server.host, config.server.port).parse() {
        Ok(addr) => addr,
        Err(e) => {
            tracing::error!("Invalid server address: {e}");
            std::process::exit(1);
        }
    };
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!(%addr, "Failed to bind: {e}");
            std::process::exit(1);
        }
    };
    tracing::info!(%addr, "Listening");

    let stop = shutdown.clone();
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!("Failed to listen for ctrl-c: {e}");
                std::future::pending::<()>().await;
            }
            tracing::info!("Shutting down");
            stop.cancel();
        })
        .await;
    if let Err(e) = served {
        tracing::error!("Server error: {e}");
    }

    shutdown.cancel();
    store::join_sweeper(sweeper).await;
}

async fn health() -> &'static str {
    "ok"
}
