use dotenvy::dotenv;
use oxide_music::bot::handlers::{self, Command};
use oxide_music::chat::{ChatClient, TelegramChat};
use oxide_music::config::Settings;
use oxide_music::pipeline::{DeliveryService, DEFAULT_DOWNLOAD_TIMEOUT};
use oxide_music::platform::{DirectLinkPlatform, PlatformRegistry};
use oxide_music::storage::{MemorySongCache, SongCache};
use regex::Regex;
use std::io::{self, Write};
use std::sync::Arc;
use teloxide::dispatching::UpdateHandler;
use teloxide::prelude::*;
use tracing::{error, info};
use tracing_subscriber::{prelude::*, EnvFilter};

/// Regex patterns for redacting bot tokens
struct RedactionPatterns {
    token_url: Regex,
    token_bare: Regex,
    token_prefixed: Regex,
}

impl RedactionPatterns {
    /// Initialize all regex patterns
    ///
    /// # Errors
    ///
    /// Returns an error if any regex pattern is invalid
    fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            token_url: Regex::new(r"(https?://[^/]+/(?:file/)?bot)([0-9]+:[A-Za-z0-9_-]+)(/['\s]*)")?,
            token_bare: Regex::new(r"([0-9]{8,10}:[A-Za-z0-9_-]{35})")?,
            token_prefixed: Regex::new(r"(bot[0-9]{8,10}:)[A-Za-z0-9_-]+")?,
        })
    }

    fn redact(&self, input: &str) -> String {
        let output = self.token_url.replace_all(input, "$1[TELEGRAM_TOKEN]$3");
        let output = self.token_bare.replace_all(&output, "[TELEGRAM_TOKEN]");
        self.token_prefixed
            .replace_all(&output, "$1[TELEGRAM_TOKEN]")
            .into_owned()
    }
}

struct RedactingWriter<W: Write> {
    inner: W,
    patterns: Arc<RedactionPatterns>,
}

impl<W: Write> Write for RedactingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let s = String::from_utf8_lossy(buf);
        self.inner.write_all(self.patterns.redact(&s).as_bytes())?;
        // report the original length even though the redacted text may differ
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

struct RedactingMakeWriter<F> {
    make_inner: F,
    patterns: Arc<RedactionPatterns>,
}

impl<'a, F, W> tracing_subscriber::fmt::MakeWriter<'a> for RedactingMakeWriter<F>
where
    F: Fn() -> W + 'static,
    W: Write,
{
    type Writer = RedactingWriter<W>;

    fn make_writer(&'a self) -> Self::Writer {
        RedactingWriter {
            inner: (self.make_inner)(),
            patterns: Arc::clone(&self.patterns),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    let patterns = Arc::new(RedactionPatterns::new().map_err(|e| {
        eprintln!("Failed to compile regex patterns: {e}");
        e
    })?);
    init_logging(patterns);

    info!("Starting Oxide Music bot...");

    let settings = init_settings();
    let bot = Bot::new(settings.telegram_token.clone());

    let service = init_service(&settings, bot.clone())?;

    info!("Bot is running...");

    Dispatcher::builder(bot, setup_handler())
        .dependencies(dptree::deps![Arc::clone(&service), settings])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    service.shutdown().await;
    Ok(())
}

fn init_logging(patterns: Arc<RedactionPatterns>) {
    let make_writer = RedactingMakeWriter {
        make_inner: io::stderr,
        patterns,
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(make_writer))
        .init();
}

fn init_settings() -> Arc<Settings> {
    match Settings::new() {
        Ok(s) => {
            info!("Configuration loaded successfully.");
            Arc::new(s)
        }
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    }
}

fn init_service(settings: &Settings, bot: Bot) -> anyhow::Result<Arc<DeliveryService>> {
    let config = settings.pipeline_config();

    let chat: Arc<dyn ChatClient> = Arc::new(TelegramChat::new(bot));
    let mut platforms = PlatformRegistry::new();
    platforms.register(Arc::new(DirectLinkPlatform::new(DEFAULT_DOWNLOAD_TIMEOUT)));
    let songs: Arc<dyn SongCache> = Arc::new(MemorySongCache::new(settings.song_cache_capacity));

    let service = DeliveryService::start(&config, chat, platforms, songs)?;
    info!(
        download_dir = %config.download_dir.display(),
        pool = config.download_pool_size,
        queue = config.upload_queue_capacity,
        "Delivery pipeline initialized."
    );
    Ok(service)
}

fn setup_handler() -> UpdateHandler<teloxide::RequestError> {
    dptree::entry().branch(
        Update::filter_message()
            .branch(
                dptree::entry()
                    .filter_command::<Command>()
                    .endpoint(handle_command),
            )
            .branch(
                dptree::filter(|msg: Message| msg.text().is_some()).endpoint(handle_text),
            ),
    )
}

async fn handle_command(
    bot: Bot,
    msg: Message,
    cmd: Command,
    service: Arc<DeliveryService>,
    settings: Arc<Settings>,
) -> Result<(), teloxide::RequestError> {
    if !handlers::is_allowed(&settings.allowed_users(), handlers::get_user_id_safe(&msg)) {
        return respond(());
    }
    if let Err(e) = handlers::handle_command(bot, msg, cmd, service).await {
        error!("Command error: {}", e);
    }
    respond(())
}

async fn handle_text(
    bot: Bot,
    msg: Message,
    service: Arc<DeliveryService>,
    settings: Arc<Settings>,
) -> Result<(), teloxide::RequestError> {
    if let Err(e) = handlers::handle_text(bot, msg, service, settings).await {
        error!("Text handler error: {}", e);
    }
    respond(())
}
