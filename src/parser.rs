use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, info, warn};

static TRAILING_PUNCT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[?!]+$").expect("Invalid trailing punctuation regex"));

static OR_SPLIT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\s+(?:or|или)\s+").expect("Invalid disjunction regex"));

static OR_TAIL_EN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i),?\s+or\s+").expect("Invalid 'or' tail regex"));

static OR_TAIL_RU: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i),?\s+или\s+").expect("Invalid 'или' tail regex"));

static LINE_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[\d\-*+•]+[.)]?\s*").expect("Invalid line marker regex"));

static NUMBERED_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+[.)]\s*(.+)$").expect("Invalid numbered line regex"));

static TRAILING_SEPARATORS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[,;]+$").expect("Invalid trailing separator regex"));

type Strategy = fn(&str) -> Vec<String>;

/// Extraction strategies in priority order. The first one producing at least
/// two options wins; later ones are never consulted.
const STRATEGIES: &[(&str, Strategy)] = &[
    ("or_separated", split_on_disjunction),
    ("comma_separated", split_on_commas),
    ("line_separated", split_on_lines),
    ("numbered_list", split_numbered_list),
];

/// Recovers a list of choices from free-form chat text.
///
/// Supported phrasings:
/// - `Pizza or sushi?` / `Пицца или суши?`
/// - `Coffee, tea, water`
/// - one option per line, optionally bulleted
/// - `1. Gym` / `2) Stay home`
#[derive(Debug, Clone)]
pub struct OptionParser {
    max_options: usize,
}

impl OptionParser {
    pub fn new(max_options: usize) -> Self {
        Self { max_options }
    }

    pub fn max_options(&self) -> usize {
        self.max_options
    }

    /// Returns `None` when fewer than two options can be recovered.
    pub fn parse(&self, text: &str) -> Option<Vec<String>> {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }

        let (strategy, mut options) = STRATEGIES
            .iter()
            .map(|(name, split)| (*name, split(text)))
            .find(|(_, options)| options.len() >= 2)
            .or_else(|| {
                warn!(length = text.len(), "Could not parse options from text");
                None
            })?;

        debug!(strategy, count = options.len(), "Strategy matched");

        if options.len() > self.max_options {
            info!(
                max_options = self.max_options,
                original_count = options.len(),
                "Truncated options to maximum"
            );
            options.truncate(self.max_options);
        }

        let options: Vec<String> = options
            .iter()
            .map(|opt| clean_option(opt))
            .filter(|opt| !opt.is_empty())
            .collect();

        if options.len() < 2 {
            warn!(strategy, "Fewer than two options left after cleaning");
            return None;
        }

        info!(count = options.len(), ?options, "Parsed options successfully");
        Some(options)
    }
}

/// Normalizes a single option: surrounding whitespace, one pair of wrapping
/// quotes and trailing `,`/`;` are removed. Repeated until stable, so
/// `clean_option(&clean_option(x)) == clean_option(x)`.
pub fn clean_option(option: &str) -> String {
    let mut current = option.trim().to_string();
    loop {
        let next = clean_once(&current);
        if next == current {
            return current;
        }
        current = next;
    }
}

fn clean_once(option: &str) -> String {
    let mut option = option.trim();

    for quote in ['"', '\''] {
        if option.chars().count() >= 2 && option.starts_with(quote) && option.ends_with(quote) {
            option = option[quote.len_utf8()..option.len() - quote.len_utf8()].trim();
            break;
        }
    }

    TRAILING_SEPARATORS.replace(option, "").trim().to_string()
}

fn strip_trailing_punctuation(text: &str) -> String {
    TRAILING_PUNCT.replace(text, "").trim().to_string()
}

fn non_empty_trimmed<'a>(parts: impl Iterator<Item = &'a str>) -> Vec<String> {
    parts
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect()
}

/// `A or B`, `A или B`
fn split_on_disjunction(text: &str) -> Vec<String> {
    let text = strip_trailing_punctuation(text);
    non_empty_trimmed(OR_SPLIT.split(&text))
}

/// `A, B, C` and `A, B or C`
fn split_on_commas(text: &str) -> Vec<String> {
    let text = OR_TAIL_EN.replace_all(text, ", ");
    let text = OR_TAIL_RU.replace_all(&text, ", ");
    let text = strip_trailing_punctuation(&text);
    non_empty_trimmed(text.split(','))
}

/// One option per line; leading digits, dashes and bullets are dropped.
/// The marker may end in `.` or `)`, so `1) Run` lists come out as `Run`
/// here rather than `) Run`.
fn split_on_lines(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| LINE_MARKER.replace(line, "").trim().to_string())
        .filter(|line| !line.is_empty())
        .collect()
}

/// Only `N. text` / `N) text` lines count; anything else is skipped rather
/// than failing the whole block.
fn split_numbered_list(text: &str) -> Vec<String> {
    text.lines()
        .filter_map(|line| {
            NUMBERED_LINE
                .captures(line.trim())
                .and_then(|caps| caps.get(1))
                .map(|m| m.as_str().trim().to_string())
        })
        .filter(|opt| !opt.is_empty())
        .collect()
}
