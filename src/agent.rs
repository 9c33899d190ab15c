use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, warn};

use crate::advice::{AdviceGenerator, AdviceSource};
use crate::parser::OptionParser;
use crate::platform::IncomingMessage;

const PARSE_FAILURE_TEXT: &str = "🤷‍♂️ Не могу найти варианты для выбора в твоём сообщении.\n\n\
Попробуй написать так:\n\
• Пицца или суши?\n\
• Кино, театр или дом\n\
• 1. Вариант А\n2. Вариант Б\n\n\
Отправь /help для получения примеров.";

const WELCOME_TEXT: &str = "👋 Привет! Я бот-помощник для принятия решений.\n\n\
Просто отправь мне варианты, между которыми сомневаешься, \
и я помогу выбрать лучший!\n\n\
Примеры:\n\
• Пицца или суши?\n\
• Посмотреть фильм, почитать книгу или поиграть в игру\n\
• 1. Пойти в спортзал\n2. Остаться дома\n\n\
Отправь /help для получения дополнительной информации.";

/// The core pipeline: text in, reply text out.
/// Platform-agnostic — receives IncomingMessage, returns response text.
pub struct Agent {
    parser: OptionParser,
    advisor: AdviceGenerator,
}

impl Agent {
    pub fn new(parser: OptionParser, advisor: AdviceGenerator) -> Self {
        Self { parser, advisor }
    }

    pub fn welcome_text(&self) -> &'static str {
        WELCOME_TEXT
    }

    /// HTML-formatted usage text.
    pub fn help_text(&self) -> String {
        format!(
            "🤖 <b>Как пользоваться ботом:</b>\n\n\
             1️⃣ Отправь мне сообщение с вариантами выбора\n\
             2️⃣ Я проанализирую их и дам совет\n\n\
             <b>Поддерживаемые форматы:</b>\n\
             • Через «или»: <i>Пицца или суши?</i>\n\
             • Через запятую: <i>Кино, театр, дом</i>\n\
             • По строкам:\n\
             <i>Кофе\nЧай\nКакао</i>\n\
             • Нумерованный список:\n\
             <i>1. Утренняя пробежка\n2. Йога дома</i>\n\n\
             <b>Ограничения:</b>\n\
             • Минимум 2 варианта\n\
             • Максимум {} вариантов\n\n\
             Просто напиши свои варианты, и я помогу выбрать! 🎯",
            self.parser.max_options()
        )
    }

    /// Process an incoming message and return the reply text.
    pub async fn process_message(&self, incoming: &IncomingMessage) -> String {
        let mut rng = StdRng::from_entropy();
        self.process_with_rng(incoming, &mut rng).await
    }

    pub async fn process_with_rng<R: Rng + ?Sized>(
        &self,
        incoming: &IncomingMessage,
        rng: &mut R,
    ) -> String {
        info!(
            platform = %incoming.platform,
            user_id = %incoming.user_id,
            chat_id = %incoming.chat_id,
            message_length = incoming.text.len(),
            "Processing decision request"
        );
        debug!(user_name = %incoming.user_name, text = %incoming.text, "Raw request text");

        let Some(options) = self.parser.parse(&incoming.text) else {
            info!(user_id = %incoming.user_id, "No options found in message");
            return PARSE_FAILURE_TEXT.to_string();
        };

        let advice = self.advisor.advise(&options, None, None, rng).await;

        match advice.source {
            AdviceSource::Model => info!(
                user_id = %incoming.user_id,
                options_count = options.len(),
                advice_length = advice.text.len(),
                "Decision advice ready"
            ),
            AdviceSource::Fallback => warn!(
                user_id = %incoming.user_id,
                options_count = options.len(),
                "Used fallback advice"
            ),
        }

        match advice.notice {
            Some(notice) => format!("{}\n\n🎯 {}", notice, advice.text),
            None => format!("🎯 {}", advice.text),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::llm::{Completion, CompletionBackend, CompletionError, CompletionRequest};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct FixedBackend {
        reply: Result<&'static str, u16>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CompletionBackend for FixedBackend {
        async fn complete(&self, _: CompletionRequest) -> Result<Completion, CompletionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.reply {
                Ok(text) => Ok(Completion {
                    choices: vec![text.to_string()],
                    total_tokens: None,
                }),
                Err(status) => Err(CompletionError::Api {
                    status,
                    body: "internal details".to_string(),
                }),
            }
        }
    }

    fn test_config() -> Config {
        let env: HashMap<&str, &str> = [
            ("BOT_TOKEN", "123456789:AAHdqTcvCH1vGWJxfSeofSAs0K5PALDsaw_x"),
            ("LLM_API_KEY", "sk-test"),
            ("MAX_OPTIONS", "4"),
        ]
        .into_iter()
        .collect();
        Config::from_sources(None, &|key: &str| env.get(key).map(|v| v.to_string())).unwrap()
    }

    fn agent(reply: Result<&'static str, u16>) -> (Agent, Arc<FixedBackend>) {
        let config = test_config();
        let backend = Arc::new(FixedBackend {
            reply,
            calls: AtomicUsize::new(0),
        });
        let agent = Agent::new(
            OptionParser::new(config.bot.max_options),
            AdviceGenerator::new(backend.clone(), &config),
        );
        (agent, backend)
    }

    fn incoming(text: &str) -> IncomingMessage {
        IncomingMessage {
            platform: "test".to_string(),
            user_id: "1".to_string(),
            chat_id: "1".to_string(),
            user_name: "tester".to_string(),
            text: text.to_string(),
        }
    }

    #[tokio::test]
    async fn test_model_advice_is_prefixed() {
        let (agent, backend) = agent(Ok("Рекомендую суши. Свежо и легко."));
        let reply = agent.process_message(&incoming("Пицца или суши?")).await;
        assert_eq!(reply, "🎯 Рекомендую суши. Свежо и легко.");
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unparseable_text_skips_backend() {
        let (agent, backend) = agent(Ok("unused"));
        let reply = agent.process_message(&incoming("Only one option")).await;
        assert_eq!(reply, PARSE_FAILURE_TEXT);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_backend_failure_yields_notice_and_fallback() {
        let (agent, _) = agent(Err(503));
        let mut rng = StdRng::seed_from_u64(3);
        let reply = agent
            .process_with_rng(&incoming("Coffee, tea, water"), &mut rng)
            .await;

        assert!(reply.starts_with("🚫 Ошибка AI сервиса. Попробуйте позже.\n\n🎯 Рекомендую "));
        assert!(["Coffee", "tea", "water"].iter().any(|o| reply.contains(o)));
        assert!(!reply.contains("internal details"));
    }

    #[test]
    fn test_help_mentions_configured_limit() {
        let (agent, _) = agent(Ok("unused"));
        assert!(agent.help_text().contains("Максимум 4 вариантов"));
        assert!(agent.welcome_text().contains("/help"));
    }
}
