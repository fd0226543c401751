use std::fmt;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: UserId,
    pub name: String,
    pub display_name: String,
    pub relationship: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Ai,
}

impl MessageRole {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Ai => "ai",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonalMessage {
    pub role: MessageRole,
    pub text: String,
}

/// Image bytes plus their MIME type. Serialized with base64 data so it can
/// travel inside JSON blobs and remote records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InlineImage {
    pub mime_type: String,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

impl InlineImage {
    pub fn new(mime_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            mime_type: mime_type.into(),
            data,
        }
    }

    pub fn file_extension(&self) -> &'static str {
        match self.mime_type.as_str() {
            "image/png" => "png",
            "image/webp" => "webp",
            "image/gif" => "gif",
            _ => "jpg",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SharedEntryKind {
    UserMessage,
    AiResponse,
    Fact,
    SharedImage,
}

impl SharedEntryKind {
    pub const fn is_history(self) -> bool {
        !matches!(self, Self::Fact)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedMemoryEntry {
    pub id: String,
    pub speaker_id: UserId,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub kind: SharedEntryKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fact_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<InlineImage>,
}

impl SharedMemoryEntry {
    pub fn new(
        speaker_id: UserId,
        kind: SharedEntryKind,
        text: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let timestamp = timestamp.trunc_subsecs(3);
        Self {
            id: memory_record_id(timestamp),
            speaker_id,
            text: text.into(),
            timestamp,
            kind,
            fact_key: None,
            image: None,
        }
    }

    pub fn fact(
        speaker_id: UserId,
        key: impl Into<String>,
        value: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let mut entry = Self::new(speaker_id, SharedEntryKind::Fact, value, timestamp);
        entry.fact_key = Some(key.into());
        entry
    }

    pub fn with_image(mut self, image: InlineImage) -> Self {
        self.image = Some(image);
        self
    }

    /// Two records describe the same utterance when both timestamp and text
    /// match, regardless of their ids.
    pub fn is_duplicate_of(&self, other: &SharedMemoryEntry) -> bool {
        self.timestamp == other.timestamp && self.text == other.text
    }
}

pub fn memory_record_id(timestamp: DateTime<Utc>) -> String {
    format!(
        "memory_{}_{}",
        timestamp.timestamp_millis(),
        Uuid::new_v4().simple()
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    PlainChat,
    ShowCamera,
    ShareCamera,
    GenerateImage,
}

impl Intent {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PlainChat => "plain_chat",
            Self::ShowCamera => "show_camera",
            Self::ShareCamera => "share_camera",
            Self::GenerateImage => "generate_image",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssistantStatus {
    Idle,
    Listening,
    Processing,
    Speaking,
}

impl AssistantStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Listening => "listening",
            Self::Processing => "processing",
            Self::Speaking => "speaking",
        }
    }
}

mod base64_bytes {
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub(super) fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn entries_with_same_timestamp_and_text_are_duplicates() {
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 9, 30, 0).unwrap();
        let first = SharedMemoryEntry::new(
            UserId::new("abhay"),
            SharedEntryKind::UserMessage,
            "good morning",
            at,
        );
        let second = SharedMemoryEntry::new(
            UserId::new("piram"),
            SharedEntryKind::AiResponse,
            "good morning",
            at,
        );

        assert_ne!(first.id, second.id);
        assert!(first.is_duplicate_of(&second));
    }

    #[test]
    fn record_ids_carry_the_millisecond_timestamp() {
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 9, 30, 0).unwrap();
        let id = memory_record_id(at);
        assert!(id.starts_with(&format!("memory_{}_", at.timestamp_millis())));
    }

    #[test]
    fn inline_images_serialize_as_base64() {
        let image = InlineImage::new("image/png", vec![1, 2, 3]);
        let value = serde_json::to_value(&image).unwrap();
        assert_eq!(value["data"], "AQID");

        let parsed: InlineImage = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, image);
        assert_eq!(parsed.file_extension(), "png");
    }
}
