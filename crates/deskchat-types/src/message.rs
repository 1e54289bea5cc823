use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which native automation library variant is driving the desktop client.
///
/// Selected once at startup; immutable for the process lifetime unless an
/// explicit reconfigure + reinitialize happens.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Variant {
    Standard,
    Plus,
}

impl Variant {
    pub fn as_str(self) -> &'static str {
        match self {
            Variant::Standard => "standard",
            Variant::Plus => "plus",
        }
    }
}

impl std::str::FromStr for Variant {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "standard" | "a" => Ok(Variant::Standard),
            "plus" | "b" => Ok(Variant::Plus),
            other => Err(format!("unknown backend variant: {other}")),
        }
    }
}

/// Kind of one inbound message event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Image,
    File,
    Voice,
    Video,
    System,
    Time,
    Recall,
    /// Normalization or attachment persistence failed; content carries detail.
    Error,
}

impl MessageKind {
    pub fn is_attachment(self) -> bool {
        matches!(
            self,
            MessageKind::Image | MessageKind::File | MessageKind::Voice | MessageKind::Video
        )
    }
}

/// Normalized representation of one asynchronously delivered inbound message.
///
/// Produced only by the inbound dispatch callback, never by a polling call.
/// Within one target's queue arrival order is preserved and `id` is unique;
/// no global uniqueness is guaranteed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedMessage {
    pub target: String,
    pub kind: MessageKind,
    pub sender: String,
    /// Display-remark alias for the sender, where the variant exposes one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_remark: Option<String>,
    pub id: String,
    /// Text content, or detail for `kind = error`.
    pub content: String,
    /// Resolved local path for persisted attachments. `None` when persistence
    /// was skipped, disabled, or timed out.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_path: Option<String>,
    pub received_at: DateTime<Utc>,
}

/// Which attachment kinds to persist for a watched target.
///
/// Option availability is variant-dependent; the capability shim drops flags
/// the active variant does not accept.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct WatchOptions {
    #[serde(default)]
    pub save_images: bool,
    #[serde(default)]
    pub save_files: bool,
    #[serde(default)]
    pub save_voice: bool,
    #[serde(default)]
    pub save_video: bool,
    #[serde(default)]
    pub parse_links: bool,
}

/// One watched conversation, owned exclusively by the listen registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenTarget {
    pub target: String,
    pub options: WatchOptions,
    pub registered_at: DateTime<Utc>,
    pub last_ok_at: DateTime<Utc>,
}

impl ListenTarget {
    pub fn new(target: impl Into<String>, options: WatchOptions) -> Self {
        let now = Utc::now();
        Self {
            target: target.into(),
            options,
            registered_at: now,
            last_ok_at: now,
        }
    }
}

/// Group chat names arrive suffixed with a member count, e.g. `"Team (12)"`.
/// Cache keys and registry lookups use the bare name.
pub fn normalize_target_name(raw: &str) -> String {
    let trimmed = raw.trim_end();
    if let Some(open) = trimmed.rfind(" (") {
        let tail = &trimmed[open + 2..];
        if let Some(inner) = tail.strip_suffix(')') {
            if !inner.is_empty() && inner.chars().all(|c| c.is_ascii_digit()) {
                return trimmed[..open].trim_end().to_string();
            }
        }
    }
    trimmed.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variant_parses_aliases() {
        assert_eq!("plus".parse::<Variant>().unwrap(), Variant::Plus);
        assert_eq!("B".parse::<Variant>().unwrap(), Variant::Plus);
        assert_eq!("standard".parse::<Variant>().unwrap(), Variant::Standard);
        assert!("deluxe".parse::<Variant>().is_err());
    }

    #[test]
    fn normalize_strips_member_count_suffix() {
        assert_eq!(normalize_target_name("Team (12)"), "Team");
        assert_eq!(normalize_target_name("Team (12) "), "Team");
        assert_eq!(normalize_target_name("Alice"), "Alice");
    }

    #[test]
    fn normalize_keeps_non_numeric_parens() {
        assert_eq!(normalize_target_name("Bob (sales)"), "Bob (sales)");
        assert_eq!(normalize_target_name("Ops ()"), "Ops ()");
    }

    #[test]
    fn cached_message_serializes_without_empty_optionals() {
        let msg = CachedMessage {
            target: "Alice".into(),
            kind: MessageKind::Text,
            sender: "Alice".into(),
            sender_remark: None,
            id: "m1".into(),
            content: "hi".into(),
            artifact_path: None,
            received_at: Utc::now(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert!(json.get("sender_remark").is_none());
        assert!(json.get("artifact_path").is_none());
        assert_eq!(json["kind"], "text");
    }
}
