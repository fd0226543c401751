use std::future::Future;
use std::pin::Pin;

use thiserror::Error;

use crate::engine::TurnId;

pub type RecognitionFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Option<String>, RecognitionError>> + Send + 'a>>;
pub type SynthesisFuture<'a> = Pin<Box<dyn Future<Output = Result<(), SynthesisError>> + Send + 'a>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecognitionErrorKind {
    NoSpeech,
    Network,
    PermissionDenied,
    Aborted,
    Other(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("speech recognition failed: {kind:?}")]
pub struct RecognitionError {
    pub kind: RecognitionErrorKind,
}

impl RecognitionError {
    pub fn new(kind: RecognitionErrorKind) -> Self {
        Self { kind }
    }

    /// Permission denial and abort end the listening cycle until the user
    /// explicitly resumes.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.kind,
            RecognitionErrorKind::PermissionDenied | RecognitionErrorKind::Aborted
        )
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SynthesisError {
    #[error("speech synthesis was interrupted")]
    Interrupted,
    #[error("speech synthesis failed: {0}")]
    Failed(String),
}

/// One listening session. Resolves with the final transcript, or `None` when
/// recognition ended without producing one.
pub trait SpeechRecognizer: Send + Sync {
    fn listen(&self) -> RecognitionFuture<'_>;
    fn abort(&self);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Voice {
    pub name: String,
    pub lang: String,
    pub is_default: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Utterance {
    pub text: String,
    pub voice: Option<Voice>,
    pub rate: f32,
    pub pitch: f32,
    /// `None` for messages spoken outside a conversation turn.
    pub turn: Option<TurnId>,
}

pub trait SpeechSynthesizer: Send + Sync {
    fn voices(&self) -> Vec<Voice>;
    fn speak(&self, utterance: Utterance) -> SynthesisFuture<'_>;
    fn cancel(&self);
}

pub fn select_voice(voices: &[Voice], preferred: &str) -> Option<Voice> {
    voices
        .iter()
        .find(|voice| voice.name == preferred)
        .or_else(|| voices.iter().find(|voice| voice.is_default))
        .or_else(|| voices.first())
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn voice(name: &str, is_default: bool) -> Voice {
        Voice {
            name: name.to_string(),
            lang: "en-US".to_string(),
            is_default,
        }
    }

    #[test]
    fn prefers_the_named_voice_then_default_then_first() {
        let voices = vec![
            voice("Alex", false),
            voice("Samantha", true),
            voice("Google UK English Female", false),
        ];
        assert_eq!(
            select_voice(&voices, "Google UK English Female").map(|v| v.name),
            Some("Google UK English Female".to_string())
        );
        assert_eq!(
            select_voice(&voices, "Missing").map(|v| v.name),
            Some("Samantha".to_string())
        );
        assert_eq!(
            select_voice(&voices[..1], "Missing").map(|v| v.name),
            Some("Alex".to_string())
        );
        assert!(select_voice(&[], "Missing").is_none());
    }

    #[test]
    fn only_permission_and_abort_are_fatal() {
        assert!(RecognitionError::new(RecognitionErrorKind::PermissionDenied).is_fatal());
        assert!(RecognitionError::new(RecognitionErrorKind::Aborted).is_fatal());
        assert!(!RecognitionError::new(RecognitionErrorKind::NoSpeech).is_fatal());
        assert!(!RecognitionError::new(RecognitionErrorKind::Network).is_fatal());
    }
}
