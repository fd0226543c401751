use std::future::Future;
use std::pin::Pin;

use thiserror::Error;

use crate::models::{InlineImage, PersonalMessage};

pub type AiGatewayFuture<'a> =
    Pin<Box<dyn Future<Output = Result<AiResponse, AiGatewayError>> + Send + 'a>>;

#[derive(Debug, Clone, PartialEq)]
pub struct AiRequest {
    pub system_instruction: String,
    pub prior_turns: Vec<PersonalMessage>,
    pub text: String,
    pub image: Option<InlineImage>,
    pub image_output: bool,
}

impl AiRequest {
    pub fn chat(system_instruction: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            system_instruction: system_instruction.into(),
            prior_turns: Vec::new(),
            text: text.into(),
            image: None,
            image_output: false,
        }
    }

    pub fn with_prior_turns(mut self, prior_turns: Vec<PersonalMessage>) -> Self {
        self.prior_turns = prior_turns;
        self
    }

    pub fn with_image(mut self, image: InlineImage) -> Self {
        self.image = Some(image);
        self
    }

    pub fn with_image_output(mut self) -> Self {
        self.image_output = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AiResponse {
    pub model: String,
    pub text: String,
    pub image: Option<InlineImage>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AiGatewayError {
    #[error("ai provider request timed out")]
    Timeout,
    #[error("ai provider request failed: {0}")]
    ProviderFailure(String),
    #[error("ai provider returned an invalid payload: {0}")]
    InvalidProviderPayload(String),
}

pub trait AiGateway: Send + Sync {
    fn generate<'a>(&'a self, request: AiRequest) -> AiGatewayFuture<'a>;
}
