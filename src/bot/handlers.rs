use crate::config::Settings;
use crate::pipeline::{DeliveryRequest, DeliveryService};
use crate::platform::direct::DIRECT_PLATFORM;
use anyhow::Result;
use lazy_regex::regex_find;
use std::collections::HashSet;
use std::sync::Arc;
use teloxide::{prelude::*, types::ParseMode, utils::command::BotCommands};
use tracing::info;

/// Supported commands for the bot
#[derive(BotCommands, Clone)]
#[command(rename_rule = "lowercase", description = "Supported commands:")]
pub enum Command {
    /// Show the welcome message
    #[command(description = "Start the bot.")]
    Start,
    /// Show the command list
    #[command(description = "Show help.")]
    Help,
    /// Show pipeline load
    #[command(description = "Show download and upload queues.")]
    Stats,
}

const WELCOME: &str = "🎵 Send me a link to an audio file and I will deliver it here.";
const NO_LINK: &str = "🔗 I need an http(s) link to an audio file.";

/// Safe extraction of user ID from a message.
/// Returns 0 if the user information is missing.
pub fn get_user_id_safe(msg: &Message) -> i64 {
    msg.from.as_ref().map_or(0, |u| u.id.0.cast_signed())
}

/// Whether `user_id` may use the bot; an empty allow-list admits everyone
#[must_use]
pub fn is_allowed(allowed: &HashSet<i64>, user_id: i64) -> bool {
    allowed.is_empty() || allowed.contains(&user_id)
}

/// First http(s) link in a message
#[must_use]
pub fn extract_url(text: &str) -> Option<&str> {
    regex_find!(r#"https?://[^\s<>"']+"#, text)
}

/// Turn a text message into a delivery request, if it carries a link
#[must_use]
pub fn request_from_text(chat_id: i64, text: &str) -> Option<DeliveryRequest> {
    extract_url(text).map(|url| DeliveryRequest::new(chat_id, DIRECT_PLATFORM, url))
}

/// Human-readable pipeline load
#[must_use]
pub fn stats_text(service: &DeliveryService) -> String {
    let admission = service.admission();
    format!(
        "📊 <b>Pipeline</b>\nFree download slots: {} of {}\nWaiting for a slot: {}\nWaiting for upload: {} of {}\nTracked chats: {}",
        admission.available(),
        admission.pool_size(),
        admission.queue_len(),
        service.uploads().len(),
        service.uploads().capacity(),
        service.governor().tracked_destinations(),
    )
}

/// Handle a bot command
///
/// # Errors
///
/// Returns an error if the reply cannot be sent.
pub async fn handle_command(
    bot: Bot,
    msg: Message,
    cmd: Command,
    service: Arc<DeliveryService>,
) -> Result<()> {
    let text = match cmd {
        Command::Start => WELCOME.to_string(),
        Command::Help => Command::descriptions().to_string(),
        Command::Stats => stats_text(&service),
    };
    bot.send_message(msg.chat.id, text)
        .parse_mode(ParseMode::Html)
        .await?;
    Ok(())
}

/// Handle a plain text message: links are dispatched for delivery
///
/// # Errors
///
/// Returns an error if the hint reply cannot be sent.
pub async fn handle_text(
    bot: Bot,
    msg: Message,
    service: Arc<DeliveryService>,
    settings: Arc<Settings>,
) -> Result<()> {
    let user_id = get_user_id_safe(&msg);
    if !is_allowed(&settings.allowed_users(), user_id) {
        info!(user_id, "Ignoring message from unauthorized user");
        return Ok(());
    }

    let text = msg.text().unwrap_or_default();
    match request_from_text(msg.chat.id.0, text) {
        Some(request) => {
            info!(user_id, chat_id = request.chat_id, "Dispatching delivery request");
            service.dispatch(request);
        }
        None => {
            bot.send_message(msg.chat.id, NO_LINK).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn links_are_extracted() {
        assert_eq!(
            extract_url("listen: https://cdn.example.com/a.mp3 now"),
            Some("https://cdn.example.com/a.mp3")
        );
        assert_eq!(extract_url("no link here"), None);
        assert_eq!(extract_url("ftp://example.com/a.mp3"), None);
    }

    #[test]
    fn requests_use_direct_platform() {
        let request = request_from_text(5, "http://x.test/song.ogg").expect("request");
        assert_eq!(request.chat_id, 5);
        assert_eq!(request.platform, DIRECT_PLATFORM);
        assert_eq!(request.track_id, "http://x.test/song.ogg");
    }

    #[test]
    fn empty_allow_list_admits_everyone() {
        assert!(is_allowed(&HashSet::new(), 1));
        let allowed = HashSet::from([7]);
        assert!(is_allowed(&allowed, 7));
        assert!(!is_allowed(&allowed, 8));
    }

    #[test]
    fn commands_are_described() {
        let help = Command::descriptions().to_string();
        assert!(help.contains("/start"));
        assert!(help.contains("/stats"));
    }
}
