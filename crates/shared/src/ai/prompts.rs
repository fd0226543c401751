pub const PROCESSING_APOLOGY: &str = "Sorry, I encountered an error processing your request.";
pub const EMPTY_RESPONSE_FALLBACK: &str = "Sorry, I could not process that request.";
pub const CAMERA_APOLOGY: &str = "Sorry, I couldn't access your camera right now.";
pub const SHARE_REQUIRES_LOGIN: &str = "Sorry, you need to be logged in to share your picture.";
pub const SHARE_ACKNOWLEDGEMENT: &str = "Your picture has been shared with your partner.";
pub const IMAGE_GENERATION_APOLOGY: &str = "Sorry, I couldn't generate that image right now.";
pub const IMAGE_GENERATION_DONE: &str = "Here is the image you asked for.";
pub const MICROPHONE_UNAVAILABLE: &str =
    "I can't access the microphone. Please allow microphone access and try again.";

pub fn system_instruction(memory_context: &str) -> String {
    format!(
        "You are NOVA, an AI assistant with shared memory. Here's your memory context:\n{memory_context}\n\nRespond naturally and conversationally. Keep responses concise but helpful."
    )
}

pub fn image_generation_prompt(transcript: &str) -> String {
    format!("Generate an image based on this request: {transcript}")
}
