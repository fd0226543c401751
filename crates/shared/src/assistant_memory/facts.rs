use std::sync::LazyLock;

use regex::{Captures, Regex};

const FACT_VALUE_MAX_CHARS: usize = 60;
const VALUE_STOP_WORDS: [&str; 4] = [" and ", " but ", " because ", " so "];

#[derive(Debug, Clone, Copy)]
enum FactKey {
    Fixed(&'static str),
    Prefixed { prefix: &'static str, group: usize },
}

#[derive(Debug)]
struct FactRule {
    key: FactKey,
    value_group: usize,
    pattern: Regex,
}

impl FactRule {
    fn new(key: FactKey, value_group: usize, pattern: &str) -> Option<Self> {
        Regex::new(pattern).ok().map(|pattern| Self {
            key,
            value_group,
            pattern,
        })
    }

    fn apply(&self, text: &str) -> Option<(String, String)> {
        let captures = self.pattern.captures(text)?;
        let key = self.key_for(&captures)?;
        let value = clean_value(captures.get(self.value_group)?.as_str())?;
        Some((key, value))
    }

    fn key_for(&self, captures: &Captures<'_>) -> Option<String> {
        match self.key {
            FactKey::Fixed(key) => Some(key.to_string()),
            FactKey::Prefixed { prefix, group } => {
                let suffix = captures
                    .get(group)?
                    .as_str()
                    .trim()
                    .to_lowercase()
                    .split_whitespace()
                    .collect::<Vec<_>>()
                    .join("_");
                if suffix.is_empty() {
                    None
                } else {
                    Some(format!("{prefix}{suffix}"))
                }
            }
        }
    }
}

// Order matters: later rules overwrite earlier ones that produce the same key.
static FACT_RULES: LazyLock<Vec<FactRule>> = LazyLock::new(|| {
    [
        (FactKey::Fixed("name"), 1, r"(?i)\bmy name is ([a-z][\w'-]*)"),
        (
            FactKey::Fixed("job"),
            1,
            r"(?i)\bi work as (?:an? )?([a-z][a-z '-]*)",
        ),
        (
            FactKey::Fixed("job"),
            1,
            r"(?i)\bmy job is (?:an? )?([a-z][a-z '-]*)",
        ),
        (FactKey::Fixed("location"), 1, r"(?i)\bi live in ([a-z][a-z .'-]*)"),
        (
            FactKey::Fixed("hometown"),
            1,
            r"(?i)\bi(?: am|'m) from ([a-z][a-z .'-]*)",
        ),
        (
            FactKey::Fixed("birthday"),
            1,
            r"(?i)\bmy birthday is (?:on )?([a-z0-9][a-z0-9 ,'-]*)",
        ),
        (
            FactKey::Prefixed {
                prefix: "relationship_",
                group: 1,
            },
            2,
            r"(?i)\bmy (girlfriend|boyfriend|partner|wife|husband|best friend)(?:'s name)? is ([a-z][\w'-]*)",
        ),
        (
            FactKey::Prefixed {
                prefix: "favorite_",
                group: 1,
            },
            2,
            r"(?i)\bmy favou?rite ([a-z]+) is ([a-z0-9][a-z0-9 '-]*)",
        ),
        (
            FactKey::Prefixed {
                prefix: "compliment_",
                group: 1,
            },
            2,
            r"(?i)\b(abhay|piram|you)(?: is| are|'re) (?:so |really |very )?(beautiful|handsome|cute|amazing|sweet|kind|smart|funny|lovely|wonderful|gorgeous)\b",
        ),
    ]
    .into_iter()
    .filter_map(|(key, value_group, pattern)| FactRule::new(key, value_group, pattern))
    .collect()
});

/// Runs every rule against `text` and returns `(key, value)` pairs in rule
/// order.
pub(crate) fn extract(text: &str) -> Vec<(String, String)> {
    FACT_RULES
        .iter()
        .filter_map(|rule| rule.apply(text))
        .collect()
}

fn clean_value(raw: &str) -> Option<String> {
    let mut value = raw.split_whitespace().collect::<Vec<_>>().join(" ");

    let lowered = value.to_ascii_lowercase();
    if let Some(cut) = VALUE_STOP_WORDS
        .iter()
        .filter_map(|word| lowered.find(word))
        .min()
    {
        value.truncate(cut);
    }

    let trimmed = value
        .trim()
        .trim_end_matches(['.', ',', '!', '?', ';', ':'])
        .trim();
    if trimmed.is_empty() {
        return None;
    }

    Some(trimmed.chars().take(FACT_VALUE_MAX_CHARS).collect())
}
