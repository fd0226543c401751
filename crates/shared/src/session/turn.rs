use std::sync::Arc;

use tracing::{info, warn};

use crate::ai::prompts::{
    CAMERA_APOLOGY, IMAGE_GENERATION_APOLOGY, IMAGE_GENERATION_DONE, PROCESSING_APOLOGY,
    SHARE_ACKNOWLEDGEMENT, SHARE_REQUIRES_LOGIN, image_generation_prompt, system_instruction,
};
use crate::ai::{AiGateway, AiRequest};
use crate::assistant_memory::SharedMemory;
use crate::camera::Camera;
use crate::engine::{TurnId, TurnReply};
use crate::models::{InlineImage, Intent, SharedMemoryEntry};
use crate::sync::SyncService;

use super::presenter::TurnPresenter;

/// Everything an intent handler may touch. Handlers never change
/// `AssistantState`; they only produce a reply for the session loop.
#[derive(Clone)]
pub(crate) struct TurnContext {
    pub(crate) gateway: Arc<dyn AiGateway>,
    pub(crate) camera: Arc<Camera>,
    pub(crate) presenter: Arc<dyn TurnPresenter>,
    pub(crate) memory: SharedMemory,
    pub(crate) sync: Arc<SyncService>,
    pub(crate) prior_turns: usize,
}

pub(crate) async fn process_turn(
    ctx: TurnContext,
    turn: TurnId,
    transcript: String,
    intent: Intent,
) -> TurnReply {
    match intent {
        Intent::PlainChat => plain_chat(&ctx, turn, &transcript).await,
        Intent::ShowCamera => show_camera(&ctx, turn, &transcript).await,
        Intent::ShareCamera => share_camera(&ctx, turn).await,
        Intent::GenerateImage => generate_image(&ctx, turn, &transcript).await,
    }
}

async fn plain_chat(ctx: &TurnContext, turn: TurnId, transcript: &str) -> TurnReply {
    let (request, updates) = ctx.memory.update(|memory| {
        let prior_turns = memory.prior_turns(ctx.prior_turns);
        let mut updates = Vec::new();
        updates.extend(memory.append_user_message(transcript));
        updates.extend(memory.extract_facts(transcript));
        let request = AiRequest::chat(system_instruction(&memory.build_context()), transcript)
            .with_prior_turns(prior_turns);
        (request, updates)
    });
    ctx.sync.push_all(updates).await;

    let text = ask_model(ctx, turn, request).await;
    record_reply(ctx, &text).await;
    TurnReply {
        text,
        ..TurnReply::default()
    }
}

async fn show_camera(ctx: &TurnContext, turn: TurnId, transcript: &str) -> TurnReply {
    let Some(image) = capture(ctx, turn).await else {
        return TurnReply {
            text: CAMERA_APOLOGY.to_string(),
            ..TurnReply::default()
        };
    };

    let (request, updates) = ctx.memory.update(|memory| {
        let prior_turns = memory.prior_turns(ctx.prior_turns);
        let updates = memory.append_user_message(transcript);
        let request = AiRequest::chat(system_instruction(&memory.build_context()), transcript)
            .with_prior_turns(prior_turns)
            .with_image(image.clone());
        (request, updates)
    });
    ctx.sync.push_all(updates.into_iter().collect()).await;

    let text = ask_model(ctx, turn, request).await;
    record_reply(ctx, &text).await;
    TurnReply {
        text,
        captured_image: Some(image),
        generated_image: None,
    }
}

async fn share_camera(ctx: &TurnContext, turn: TurnId) -> TurnReply {
    if ctx.memory.lock().current_user().is_none() {
        info!(turn_id = %turn, "share requested without a logged in user");
        return TurnReply {
            text: SHARE_REQUIRES_LOGIN.to_string(),
            ..TurnReply::default()
        };
    }

    let Some(image) = capture(ctx, turn).await else {
        return TurnReply {
            text: CAMERA_APOLOGY.to_string(),
            ..TurnReply::default()
        };
    };

    let recorded = ctx.memory.update(|memory| memory.record_shared_image(image));
    let Some(entry) = recorded else {
        return TurnReply {
            text: SHARE_REQUIRES_LOGIN.to_string(),
            ..TurnReply::default()
        };
    };
    info!(turn_id = %turn, record_id = %entry.id, "picture shared");
    ctx.sync.push(entry).await;

    TurnReply {
        text: SHARE_ACKNOWLEDGEMENT.to_string(),
        ..TurnReply::default()
    }
}

async fn generate_image(ctx: &TurnContext, turn: TurnId, transcript: &str) -> TurnReply {
    ctx.presenter.show_processing_indicator(turn);

    let (request, updates) = ctx.memory.update(|memory| {
        let updates = memory.append_user_message(transcript);
        let request = AiRequest::chat(
            system_instruction(&memory.build_context()),
            image_generation_prompt(transcript),
        )
        .with_image_output();
        (request, updates)
    });
    ctx.sync.push_all(updates.into_iter().collect()).await;

    let generated = match ctx.gateway.generate(request).await {
        Ok(response) => response.image,
        Err(err) => {
            warn!(turn_id = %turn, error = %err, "image generation failed");
            None
        }
    };
    ctx.presenter.hide_processing_indicator(turn);

    let text = match &generated {
        Some(_) => IMAGE_GENERATION_DONE,
        None => IMAGE_GENERATION_APOLOGY,
    }
    .to_string();
    record_reply(ctx, &text).await;

    TurnReply {
        text,
        captured_image: None,
        generated_image: generated,
    }
}

async fn capture(ctx: &TurnContext, turn: TurnId) -> Option<InlineImage> {
    match ctx.camera.capture().await {
        Ok(image) => Some(image),
        Err(err) => {
            warn!(turn_id = %turn, error = %err, "camera capture failed");
            None
        }
    }
}

async fn ask_model(ctx: &TurnContext, turn: TurnId, request: AiRequest) -> String {
    match ctx.gateway.generate(request).await {
        Ok(response) => {
            info!(turn_id = %turn, model = %response.model, "model replied");
            response.text
        }
        Err(err) => {
            warn!(turn_id = %turn, error = %err, "model request failed, using fallback reply");
            PROCESSING_APOLOGY.to_string()
        }
    }
}

async fn record_reply(ctx: &TurnContext, text: &str) {
    let updates: Vec<SharedMemoryEntry> = ctx
        .memory
        .update(|memory| memory.append_ai_response(text))
        .into_iter()
        .collect();
    ctx.sync.push_all(updates).await;
}
