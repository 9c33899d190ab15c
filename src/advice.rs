use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use rand::Rng;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::llm::{ChatMessage, CompletionBackend, CompletionError, CompletionRequest};

const SYSTEM_PROMPT: &str = "\
Ты помощник для принятия решений. Твоя задача - помочь пользователю выбрать один из предложенных вариантов.

Требования к ответу:
1. Выбери ОДИН конкретный вариант из предложенных
2. Дай 1-2 кратких предложения с обоснованием выбора
3. Будь лаконичен и конкретен
4. Используй дружелюбный тон
5. Отвечай на русском языке

Формат ответа: \"Рекомендую [выбранный вариант]. [Краткое обоснование].\"
";

/// Generic, option-agnostic reasons used when no model answer is available.
pub const FALLBACK_REASONS: &[&str] = &[
    "Иногда лучше положиться на интуицию!",
    "Этот вариант кажется наиболее универсальным.",
    "Попробуй этот - а если не понравится, всегда можно выбрать другой!",
    "Мой случайный выбор - но он может оказаться самым правильным!",
    "Этот вариант выглядит интересно, почему бы не попробовать?",
];

/// Why the model could not supply advice.
#[derive(Debug, Error)]
pub enum Unavailable {
    #[error("rate limit exceeded")]
    RateLimited,
    #[error("completion API error")]
    ApiError,
    #[error("completion request timed out")]
    Timeout,
    #[error("unexpected completion failure")]
    Unexpected,
    #[error("completion returned no text")]
    Empty,
}

impl Unavailable {
    /// Localized notice shown above the fallback advice. `Empty` is silent.
    pub fn apology(&self) -> Option<&'static str> {
        match self {
            Unavailable::RateLimited => {
                Some("🚫 Извините, превышен лимит запросов к AI. Попробуйте позже.")
            }
            Unavailable::ApiError => Some("🚫 Ошибка AI сервиса. Попробуйте позже."),
            Unavailable::Timeout => {
                Some("⏰ Превышено время ожидания ответа AI. Попробуйте позже.")
            }
            Unavailable::Unexpected => {
                Some("🚫 Произошла ошибка при генерации совета. Попробуйте позже.")
            }
            Unavailable::Empty => None,
        }
    }
}

impl From<CompletionError> for Unavailable {
    fn from(err: CompletionError) -> Self {
        match err {
            CompletionError::RateLimited(_) => Unavailable::RateLimited,
            CompletionError::Api { .. } => Unavailable::ApiError,
            CompletionError::Timeout(_) => Unavailable::Timeout,
            CompletionError::Transport(_) | CompletionError::Malformed(_) => {
                Unavailable::Unexpected
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdviceSource {
    Model,
    Fallback,
}

/// Final advice for one request.
#[derive(Debug, Clone)]
pub struct Advice {
    pub text: String,
    pub source: AdviceSource,
    /// Apology to show alongside fallback advice, if the model failed loudly.
    pub notice: Option<&'static str>,
}

/// Turns a list of options into a one-line recommendation, asking the
/// completion backend first and falling back to a random pick.
pub struct AdviceGenerator {
    backend: Arc<dyn CompletionBackend>,
    model: String,
    max_tokens: u32,
    temperature: f32,
    timeout: Duration,
}

impl AdviceGenerator {
    pub fn new(backend: Arc<dyn CompletionBackend>, config: &Config) -> Self {
        Self {
            backend,
            model: config.llm.model.clone(),
            max_tokens: config.llm.max_tokens,
            temperature: config.llm.temperature,
            timeout: config.bot.response_timeout,
        }
    }

    pub fn system_prompt(&self) -> &'static str {
        SYSTEM_PROMPT
    }

    /// User turn: numbered options, then optional vote tally and context.
    pub fn build_prompt(
        &self,
        options: &[String],
        context: Option<&str>,
        votes: Option<&[(String, u32)]>,
    ) -> String {
        let mut parts = vec!["Помоги выбрать из следующих вариантов:".to_string()];
        for (i, option) in options.iter().enumerate() {
            parts.push(format!("{}. {}", i + 1, option));
        }

        if let Some(votes) = votes.filter(|v| !v.is_empty()) {
            parts.push("\nРезультаты голосования друзей:".to_string());
            let total: u64 = votes.iter().map(|(_, n)| u64::from(*n)).sum();
            let mut sorted: Vec<&(String, u32)> = votes.iter().collect();
            // stable: equal counts keep insertion order
            sorted.sort_by(|a, b| b.1.cmp(&a.1));
            for (option, count) in sorted {
                let percentage = if total > 0 {
                    f64::from(*count) / total as f64 * 100.0
                } else {
                    0.0
                };
                parts.push(format!("• {}: {} голосов ({:.1}%)", option, count, percentage));
            }
        }

        if let Some(context) = context.map(str::trim).filter(|c| !c.is_empty()) {
            parts.push(format!("\nДополнительный контекст: {}", context));
        }

        parts.join("\n")
    }

    /// Ask the backend once. Failures come back as an [`Unavailable`] kind,
    /// never as a panic or raw error text.
    pub async fn request_advice(
        &self,
        options: &[String],
        context: Option<&str>,
        votes: Option<&[(String, u32)]>,
    ) -> Result<String, Unavailable> {
        let request = CompletionRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage::system(self.system_prompt()),
                ChatMessage::user(self.build_prompt(options, context, votes)),
            ],
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            timeout: self.timeout,
        };

        info!(
            model = %self.model,
            options_count = options.len(),
            "Requesting decision advice"
        );

        let completion = match tokio::time::timeout(self.timeout, self.backend.complete(request))
            .await
        {
            Ok(Ok(completion)) => completion,
            Ok(Err(e)) => {
                let message = e.to_string();
                let kind = Unavailable::from(e);
                error!(category = %kind, error = %message, "Completion failed");
                return Err(kind);
            }
            Err(_) => {
                error!(timeout = ?self.timeout, "Completion request timed out");
                return Err(Unavailable::Timeout);
            }
        };

        let advice = completion
            .choices
            .into_iter()
            .next()
            .map(|text| text.trim().to_string())
            .filter(|text| !text.is_empty());

        match advice {
            Some(advice) => {
                info!(
                    advice_length = advice.len(),
                    tokens_used = ?completion.total_tokens,
                    "Generated decision advice"
                );
                Ok(advice)
            }
            None => {
                warn!("Completion contained no usable text");
                Err(Unavailable::Empty)
            }
        }
    }

    /// Model advice when possible, otherwise a random pick. Never fails.
    pub async fn advise<R: Rng + ?Sized>(
        &self,
        options: &[String],
        context: Option<&str>,
        votes: Option<&[(String, u32)]>,
        rng: &mut R,
    ) -> Advice {
        match self.request_advice(options, context, votes).await {
            Ok(text) => Advice {
                text,
                source: AdviceSource::Model,
                notice: None,
            },
            Err(kind) => {
                warn!(reason = %kind, options_count = options.len(), "Using fallback advice");
                Advice {
                    text: fallback_advice(options, rng),
                    source: AdviceSource::Fallback,
                    notice: kind.apology(),
                }
            }
        }
    }
}

/// Pick an option and a reason uniformly at random, in the same
/// "Рекомендую X. reason" shape the model is asked to use.
pub fn fallback_advice<R: Rng + ?Sized>(options: &[String], rng: &mut R) -> String {
    let chosen = options.choose(rng);
    let reason = FALLBACK_REASONS
        .choose(rng)
        .copied()
        .unwrap_or(FALLBACK_REASONS[0]);
    match chosen {
        Some(option) => format!("Рекомендую {}. {}", option, reason),
        None => reason.to_string(),
    }
}
