use crate::engine::TurnId;
use crate::models::InlineImage;

/// Visual side of a turn. Layout is up to the implementation; calls are
/// fire-and-forget.
pub trait TurnPresenter: Send + Sync {
    /// Fades in a captured camera frame for the duration of the reply.
    fn show_captured_image(&self, turn: TurnId, image: &InlineImage);
    fn fade_out_captured_image(&self, turn: TurnId);
    fn show_processing_indicator(&self, turn: TurnId);
    fn hide_processing_indicator(&self, turn: TurnId);
    /// Full-screen result with close and download actions.
    fn show_generated_image(&self, turn: TurnId, image: &InlineImage);
}
