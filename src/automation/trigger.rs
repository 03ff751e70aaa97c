//! Trigger kinds and trigger configuration shared by flows and rules.
//!
//! A flow or rule names one [`TriggerKind`] and carries a [`TriggerConfig`]
//! whose relevant fields depend on the kind (keywords for `keyword`,
//! a command plus aliases for `command`, a similarity threshold for `faq`).

use std::fmt;
use std::str::FromStr;

use regex::RegexBuilder;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// What condition selects a flow or rule for an inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    AnyMessage,
    Keyword,
    ExactMatch,
    Welcome,
    Away,
    Command,
    Faq,
    AiChat,
    Default,
}

impl TriggerKind {
    /// The string tag stored in the DB.
    pub fn type_tag(&self) -> &'static str {
        match self {
            Self::AnyMessage => "any_message",
            Self::Keyword => "keyword",
            Self::ExactMatch => "exact_match",
            Self::Welcome => "welcome",
            Self::Away => "away",
            Self::Command => "command",
            Self::Faq => "faq",
            Self::AiChat => "ai_chat",
            Self::Default => "default",
        }
    }

    /// Tie-break order among candidates sharing a priority: the more specific
    /// trigger wins, fallbacks come last.
    pub fn semantic_rank(&self) -> u8 {
        match self {
            Self::Welcome => 0,
            Self::Away => 1,
            Self::Command => 2,
            Self::ExactMatch => 3,
            Self::Keyword => 4,
            Self::Faq => 5,
            Self::AnyMessage => 6,
            Self::AiChat => 7,
            Self::Default => 8,
        }
    }
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.type_tag())
    }
}

impl FromStr for TriggerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "any_message" => Ok(Self::AnyMessage),
            "keyword" => Ok(Self::Keyword),
            "exact_match" => Ok(Self::ExactMatch),
            "welcome" => Ok(Self::Welcome),
            "away" => Ok(Self::Away),
            "command" => Ok(Self::Command),
            "faq" => Ok(Self::Faq),
            "ai_chat" | "ai" => Ok(Self::AiChat),
            "default" => Ok(Self::Default),
            other => Err(format!("unknown trigger type: {other}")),
        }
    }
}

/// How keywords are compared against the message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMode {
    #[default]
    Contains,
    Exact,
    StartsWith,
    Regex,
}

/// Trigger-specific configuration, stored as JSON next to the trigger type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TriggerConfig {
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub match_mode: MatchMode,
    #[serde(default)]
    pub case_sensitive: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default)]
    pub aliases: Vec<String>,
    /// Minimum knowledge-base similarity for `faq` triggers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f32>,
}

impl TriggerConfig {
    pub fn keywords<I, S>(keywords: I, match_mode: MatchMode) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            keywords: keywords.into_iter().map(Into::into).collect(),
            match_mode,
            ..Self::default()
        }
    }

    pub fn command<I, S>(command: &str, aliases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            command: Some(command.to_string()),
            aliases: aliases.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Return the first configured keyword matching `text` under the
    /// configured mode and case sensitivity.
    pub fn match_keyword(&self, text: &str) -> Option<String> {
        let text = text.trim();
        self.keywords
            .iter()
            .filter(|k| !k.trim().is_empty())
            .find(|keyword| self.keyword_matches(keyword, text))
            .cloned()
    }

    fn keyword_matches(&self, keyword: &str, text: &str) -> bool {
        if self.match_mode == MatchMode::Regex {
            return match RegexBuilder::new(keyword)
                .case_insensitive(!self.case_sensitive)
                .build()
            {
                Ok(re) => re.is_match(text),
                Err(e) => {
                    warn!(pattern = %keyword, error = %e, "Invalid keyword regex, skipping");
                    false
                }
            };
        }

        let (keyword, text) = if self.case_sensitive {
            (keyword.trim().to_string(), text.to_string())
        } else {
            (keyword.trim().to_lowercase(), text.to_lowercase())
        };

        match self.match_mode {
            MatchMode::Contains => text.contains(&keyword),
            MatchMode::Exact => text == keyword,
            MatchMode::StartsWith => text.starts_with(&keyword),
            MatchMode::Regex => false,
        }
    }

    /// `exact_match` triggers compare the whole trimmed message, ignoring the
    /// configured mode.
    pub fn match_exact(&self, text: &str) -> Option<String> {
        let text = text.trim();
        self.keywords
            .iter()
            .find(|keyword| {
                let keyword = keyword.trim();
                !keyword.is_empty()
                    && if self.case_sensitive {
                        keyword == text
                    } else {
                        keyword.to_lowercase() == text.to_lowercase()
                    }
            })
            .cloned()
    }

    /// The trimmed, lower-cased message must equal the command (or an alias)
    /// or start with it followed by a space.
    pub fn match_command(&self, text: &str) -> Option<String> {
        let normalized = text.trim().to_lowercase();
        self.command
            .iter()
            .chain(self.aliases.iter())
            .map(|c| c.trim().to_lowercase())
            .filter(|c| !c.is_empty())
            .find(|c| normalized == *c || normalized.starts_with(&format!("{c} ")))
    }
}
