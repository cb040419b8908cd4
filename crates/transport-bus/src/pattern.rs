use std::fmt;

use crate::{BusError, BusResult};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Level {
    Exact(String),
    /// `+`: exactly one level.
    Single,
    /// `#`: zero or more trailing levels.
    Rest,
}

/// MQTT-style subscription filter over `/`-separated topics.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicPattern {
    raw: String,
    levels: Vec<Level>,
}

impl TopicPattern {
    pub fn parse(raw: &str) -> BusResult<Self> {
        if raw.is_empty() {
            return Err(BusError::InvalidPattern("empty pattern".into()));
        }
        let parts: Vec<&str> = raw.split('/').collect();
        let last = parts.len() - 1;
        let mut levels = Vec::with_capacity(parts.len());
        for (idx, part) in parts.into_iter().enumerate() {
            let level = match part {
                "#" if idx == last => Level::Rest,
                "#" => {
                    return Err(BusError::InvalidPattern(format!(
                        "'#' must be the final level in {raw}"
                    )));
                }
                "+" => Level::Single,
                other if other.contains('#') || other.contains('+') => {
                    return Err(BusError::InvalidPattern(format!(
                        "wildcard mixed into level '{other}' of {raw}"
                    )));
                }
                other => Level::Exact(other.to_string()),
            };
            levels.push(level);
        }
        Ok(Self {
            raw: raw.to_string(),
            levels,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn is_literal(&self) -> bool {
        self.levels.iter().all(|level| matches!(level, Level::Exact(_)))
    }

    pub fn matches(&self, topic: &str) -> bool {
        let mut segments = topic.split('/');
        for level in &self.levels {
            match level {
                Level::Rest => return true,
                Level::Single => {
                    if segments.next().is_none() {
                        return false;
                    }
                }
                Level::Exact(expected) => match segments.next() {
                    Some(segment) if segment == expected => {}
                    _ => return false,
                },
            }
        }
        segments.next().is_none()
    }

    /// Glob understood by Redis `PSUBSCRIBE`. It over-approximates `+`, so
    /// deliveries are re-checked with [`TopicPattern::matches`].
    pub fn to_glob(&self) -> String {
        let mut out = String::with_capacity(self.raw.len());
        for (idx, level) in self.levels.iter().enumerate() {
            if idx > 0 {
                out.push('/');
            }
            match level {
                Level::Exact(text) => {
                    for ch in text.chars() {
                        if matches!(ch, '*' | '?' | '[' | ']' | '\\') {
                            out.push('\\');
                        }
                        out.push(ch);
                    }
                }
                Level::Single | Level::Rest => out.push('*'),
            }
        }
        if matches!(self.levels.last(), Some(Level::Rest)) && self.levels.len() > 1 {
            // `a/#` also matches the parent topic `a`.
            out.truncate(out.len() - 2);
            out.push('*');
        }
        out
    }
}

impl fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    TopicPattern::parse(pattern)
        .map(|pattern| pattern.matches(topic))
        .unwrap_or(false)
}
