pub mod gateway;
pub mod gemini;
pub mod prompts;

pub use gateway::{AiGateway, AiGatewayError, AiGatewayFuture, AiRequest, AiResponse};
pub use gemini::{GeminiConfigError, GeminiGateway, GeminiGatewayConfig, GeminiModelRoute};
