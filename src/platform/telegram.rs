use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use futures::future::BoxFuture;
use teloxide::dispatching::ShutdownToken;
use teloxide::error_handlers::ErrorHandler;
use teloxide::prelude::*;
use teloxide::types::{ChatAction, ParseMode, ReactionType};
use teloxide::update_listeners::{webhooks, Polling};
use teloxide::{ApiError, RequestError};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::agent::Agent;
use crate::config::TelegramConfig;
use crate::platform::IncomingMessage;

const MAX_CONFLICT_BACKOFF: Duration = Duration::from_secs(30);

/// How long to keep retrying when another process polls with the same token.
#[derive(Debug, Clone, Copy)]
pub struct ConflictPolicy {
    /// Consecutive conflicts tolerated before giving up.
    pub max_attempts: u32,
    /// First startup retry delay; doubles per attempt, capped at 30s.
    pub base_delay: Duration,
    /// A conflict this long after the previous one starts a new count.
    pub reset_after: Duration,
}

impl Default for ConflictPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            reset_after: Duration::from_secs(300),
        }
    }
}

impl ConflictPolicy {
    fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(1 << attempt.min(5))
            .min(MAX_CONFLICT_BACKOFF)
    }
}

fn conflict_error(attempts: u32) -> anyhow::Error {
    anyhow::anyhow!(
        "Another process is already polling Telegram with this bot token \
         ({} attempts failed). Stop the other instance, or set WEBHOOK_URL \
         to run in webhook mode.",
        attempts
    )
}

fn is_conflict(err: &RequestError) -> bool {
    matches!(err, RequestError::Api(ApiError::TerminatedByOtherGetUpdates))
}

#[derive(Debug, Default)]
struct ConflictState {
    consecutive: u32,
    last_conflict: Option<Instant>,
    tripped: bool,
}

/// Error handler for the long-poll listener. Counts consecutive
/// `getUpdates` conflicts and stops the dispatcher once the policy's
/// ceiling is reached; any delivered update resets the count.
struct ConflictGuard {
    policy: ConflictPolicy,
    state: Mutex<ConflictState>,
    shutdown: OnceLock<ShutdownToken>,
}

impl ConflictGuard {
    fn new(policy: ConflictPolicy) -> Self {
        Self {
            policy,
            state: Mutex::new(ConflictState::default()),
            shutdown: OnceLock::new(),
        }
    }

    fn arm(&self, token: ShutdownToken) {
        let _ = self.shutdown.set(token);
    }

    /// Returns the running count and whether the ceiling was hit.
    async fn record_conflict(&self) -> (u32, bool) {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        if state
            .last_conflict
            .is_some_and(|last| now.duration_since(last) > self.policy.reset_after)
        {
            state.consecutive = 0;
        }
        state.consecutive += 1;
        state.last_conflict = Some(now);
        if state.consecutive >= self.policy.max_attempts {
            state.tripped = true;
        }
        (state.consecutive, state.tripped)
    }

    async fn record_success(&self) {
        let mut state = self.state.lock().await;
        state.consecutive = 0;
        state.last_conflict = None;
    }

    async fn tripped(&self) -> Option<u32> {
        let state = self.state.lock().await;
        state.tripped.then_some(state.consecutive)
    }
}

impl ErrorHandler<RequestError> for ConflictGuard {
    fn handle_error(self: Arc<Self>, error: RequestError) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            if !is_conflict(&error) {
                error!("Polling error: {}", error);
                return;
            }

            let (attempt, tripped) = self.record_conflict().await;
            if !tripped {
                warn!(
                    attempt,
                    max_attempts = self.policy.max_attempts,
                    "Polling conflict with another bot instance"
                );
                return;
            }

            error!(attempt, "Polling conflicts exceeded the retry ceiling, stopping");
            if let Some(token) = self.shutdown.get() {
                if let Err(e) = token.shutdown() {
                    warn!("Dispatcher was idle at shutdown: {}", e);
                }
            }
        })
    }
}

/// Split long messages for Telegram's 4096 char limit
fn split_message(text: &str, max_len: usize) -> Vec<String> {
    if text.len() <= max_len {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut start = 0;

    while start < text.len() {
        let mut end = (start + max_len).min(text.len());
        // Walk back to a valid UTF-8 char boundary so slicing doesn't panic
        while end > start && !text.is_char_boundary(end) {
            end -= 1;
        }
        let actual_end = if end < text.len() {
            text[start..end]
                .rfind('\n')
                .or_else(|| text[start..end].rfind(' '))
                .map(|pos| start + pos + 1)
                .unwrap_or(end)
        } else {
            end
        };

        chunks.push(text[start..actual_end].to_string());
        start = actual_end;
    }

    chunks
}

/// `/help@my_bot extra` -> `/help`
fn command_name(text: &str) -> Option<&str> {
    let first = text.split_whitespace().next()?;
    if !first.starts_with('/') {
        return None;
    }
    Some(first.split('@').next().unwrap_or(first))
}

/// Make sure no other process is long-polling with the same token.
async fn claim_polling_session(bot: &Bot, policy: &ConflictPolicy) -> Result<()> {
    bot.delete_webhook()
        .await
        .context("Failed to remove an existing webhook before polling")?;

    let mut attempt = 0;
    loop {
        match bot.get_updates().timeout(0).limit(1).await {
            Ok(_) => return Ok(()),
            Err(e) if is_conflict(&e) => {
                attempt += 1;
                if attempt >= policy.max_attempts {
                    return Err(conflict_error(attempt));
                }
                let delay = policy.backoff(attempt - 1);
                warn!(
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay = ?delay,
                    "Polling conflict with another bot instance, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e).context("Failed to reach the Telegram API"),
        }
    }
}

/// Run the Telegram bot platform
pub async fn run(agent: Arc<Agent>, config: &TelegramConfig) -> Result<()> {
    let bot = Bot::new(&config.bot_token);
    serve(bot, agent, config, ConflictPolicy::default()).await
}

async fn serve(
    bot: Bot,
    agent: Arc<Agent>,
    config: &TelegramConfig,
    policy: ConflictPolicy,
) -> Result<()> {
    info!("Starting Telegram platform...");

    let guard = Arc::new(ConflictGuard::new(policy));
    let handler = Update::filter_message().endpoint(handle_message);

    let default_guard = Arc::clone(&guard);
    let mut dispatcher = Dispatcher::builder(bot.clone(), handler)
        .dependencies(dptree::deps![agent, Arc::clone(&guard)])
        .default_handler(move |upd| {
            let guard = Arc::clone(&default_guard);
            async move {
                guard.record_success().await;
                warn!("Unhandled update: {:?}", upd.id);
            }
        })
        .error_handler(LoggingErrorHandler::with_custom_text("telegram"))
        .enable_ctrlc_handler()
        .build();

    match &config.webhook_url {
        Some(url) => {
            let address = SocketAddr::from(([0, 0, 0, 0], config.webhook_port));
            info!(url = %url, %address, "Receiving updates by webhook");
            let listener = webhooks::axum(bot, webhooks::Options::new(address, url.clone()))
                .await
                .context("Failed to register webhook")?;
            dispatcher
                .dispatch_with_listener(
                    listener,
                    LoggingErrorHandler::with_custom_text("webhook listener"),
                )
                .await;
        }
        None => {
            claim_polling_session(&bot, &policy).await?;
            guard.arm(dispatcher.shutdown_token());
            let listener = Polling::builder(bot)
                .timeout(Duration::from_secs(10))
                .backoff_strategy(move |errors| policy.backoff(errors))
                .build();
            info!("Receiving updates by long polling");
            dispatcher
                .try_dispatch_with_listener(listener, Arc::clone(&guard))
                .await
                .context("Failed to reach the Telegram API")?;

            if let Some(attempts) = guard.tripped().await {
                return Err(conflict_error(attempts));
            }
        }
    }

    Ok(())
}

async fn handle_message(
    bot: Bot,
    msg: Message,
    agent: Arc<Agent>,
    guard: Arc<ConflictGuard>,
) -> ResponseResult<()> {
    guard.record_success().await;

    let user = match msg.from.as_ref() {
        Some(user) => user,
        None => return Ok(()),
    };

    let user_id = user.id.0;
    let text = match msg.text() {
        Some(t) => t.to_string(),
        None => return Ok(()),
    };

    let user_name = user.first_name.clone();

    info!(user_id, user_name = %user_name, "Telegram message received");

    match command_name(&text) {
        Some("/start") => {
            bot.send_message(msg.chat.id, agent.welcome_text()).await?;
            return Ok(());
        }
        Some("/help") => {
            bot.send_message(msg.chat.id, agent.help_text())
                .parse_mode(ParseMode::Html)
                .await?;
            return Ok(());
        }
        _ => {}
    }

    // Thinking reaction and "typing" indicator; chats may forbid reactions
    bot.set_message_reaction(msg.chat.id, msg.id)
        .reaction(vec![ReactionType::Emoji {
            emoji: "🤔".to_string(),
        }])
        .await
        .ok();
    bot.send_chat_action(msg.chat.id, ChatAction::Typing)
        .await
        .ok();

    let incoming = IncomingMessage {
        platform: "telegram".to_string(),
        user_id: user_id.to_string(),
        chat_id: msg.chat.id.0.to_string(),
        user_name,
        text,
    };

    let response = agent.process_message(&incoming).await;
    for chunk in split_message(&response, 4000) {
        if let Err(e) = bot.send_message(msg.chat.id, chunk).await {
            error!("Failed to send reply: {}", e);
        }
    }

    Ok(())
}
