use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::intent::IntentRouter;
use crate::models::{AssistantStatus, InlineImage, Intent, UserId};
use crate::speech::{RecognitionError, Voice};


#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TurnId(u64);

impl TurnId {
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TurnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "turn-{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConversationTurn {
    pub id: TurnId,
    pub transcript: String,
    pub intent: Intent,
    pub captured_image: Option<InlineImage>,
    pub response: Option<String>,
    pub generated_image: Option<InlineImage>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AssistantState {
    pub status: AssistantStatus,
    pub current_user: Option<UserId>,
    pub voice_ready: bool,
    pub selected_voice: Option<Voice>,
}

impl Default for AssistantState {
    fn default() -> Self {
        Self {
            status: AssistantStatus::Idle,
            current_user: None,
            voice_ready: false,
            selected_voice: None,
        }
    }
}

/// What the handlers produced for a turn, applied only if the turn is still
/// the active one.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TurnReply {
    pub text: String,
    pub captured_image: Option<InlineImage>,
    pub generated_image: Option<InlineImage>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDelay {
    /// After a completed turn, so presentation transitions can finish.
    Settle,
    /// After recognition ended without a transcript or failed transiently.
    Retry,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorOutcome {
    Restart(RestartDelay),
    /// Listening stays off until explicitly resumed; the user must be told.
    Halted,
    Ignored,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SpeechEndOutcome {
    /// A turn finished; listening restarts after the settle delay.
    TurnCompleted(ConversationTurn),
    /// A message spoken outside any turn finished. Carries a restart when
    /// listening was resumed while the message was still playing.
    NoticeCompleted(Option<RestartDelay>),
    Ignored,
}

/// The turn state machine. It owns `AssistantState` and is driven by one
/// writer; every method is a guarded transition that ignores calls which do
/// not apply to the current state.
#[derive(Debug)]
pub struct ConversationEngine {
    state: AssistantState,
    router: IntentRouter,
    active_turn: Option<ConversationTurn>,
    speaking_notice: bool,
    turn_in_flight: bool,
    restart_pending: bool,
    listening_halted: bool,
    torn_down: bool,
    next_turn: u64,
}

impl Default for ConversationEngine {
    fn default() -> Self {
        Self::new(IntentRouter::default())
    }
}

impl ConversationEngine {
    pub fn new(router: IntentRouter) -> Self {
        Self {
            state: AssistantState::default(),
            router,
            active_turn: None,
            speaking_notice: false,
            turn_in_flight: false,
            restart_pending: false,
            listening_halted: false,
            torn_down: false,
            next_turn: 1,
        }
    }

    pub fn state(&self) -> &AssistantState {
        &self.state
    }

    pub fn status(&self) -> AssistantStatus {
        self.state.status
    }

    pub fn active_turn(&self) -> Option<&ConversationTurn> {
        self.active_turn.as_ref()
    }

    pub fn turn_in_flight(&self) -> bool {
        self.turn_in_flight
    }

    pub fn restart_pending(&self) -> bool {
        self.restart_pending
    }

    pub fn listening_halted(&self) -> bool {
        self.listening_halted
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }

    pub fn set_current_user(&mut self, user: Option<UserId>) {
        self.state.current_user = user;
    }

    pub fn set_voice(&mut self, voice: Option<Voice>) {
        self.state.voice_ready = voice.is_some();
        self.state.selected_voice = voice;
    }

    /// Idle to Listening. Returns `false` (and changes nothing) when a turn is
    /// in flight, listening was halted, or the engine is not idle.
    pub fn on_recognition_start(&mut self) -> bool {
        if self.torn_down
            || self.listening_halted
            || self.turn_in_flight
            || !self.state.voice_ready
            || self.state.status != AssistantStatus::Idle
        {
            return false;
        }

        self.state.status = AssistantStatus::Listening;
        true
    }

    /// Listening to Processing. Opens a new turn and returns its id; a second
    /// transcript while a turn is in flight is rejected.
    pub fn on_transcript_final(&mut self, text: &str) -> Option<TurnId> {
        if self.torn_down || self.turn_in_flight || self.state.status != AssistantStatus::Listening
        {
            debug!(status = self.state.status.as_str(), "transcript rejected");
            return None;
        }

        let transcript = text.trim();
        if transcript.is_empty() {
            return None;
        }

        let id = TurnId(self.next_turn);
        self.next_turn += 1;
        let intent = self.router.classify(transcript);
        info!(turn_id = %id, intent = intent.as_str(), "turn started");

        self.active_turn = Some(ConversationTurn {
            id,
            transcript: transcript.to_string(),
            intent,
            captured_image: None,
            response: None,
            generated_image: None,
        });
        self.turn_in_flight = true;
        self.state.status = AssistantStatus::Processing;
        Some(id)
    }

    /// Recognition ended without a usable transcript.
    pub fn on_recognition_ended(&mut self) -> Option<RestartDelay> {
        if self.torn_down || self.state.status != AssistantStatus::Listening {
            return None;
        }

        self.state.status = AssistantStatus::Idle;
        Some(RestartDelay::Retry)
    }

    /// Processing to Speaking for the active turn. Replies for any other turn
    /// are stale and discarded.
    pub fn on_ai_result(&mut self, turn: TurnId, reply: TurnReply) -> Option<&ConversationTurn> {
        if self.torn_down || self.state.status != AssistantStatus::Processing {
            debug!(turn_id = %turn, "reply arrived outside processing, discarded");
            return None;
        }

        let active = self.active_turn.as_mut().filter(|active| active.id == turn)?;
        active.response = Some(reply.text);
        active.captured_image = reply.captured_image;
        active.generated_image = reply.generated_image;
        self.state.status = AssistantStatus::Speaking;
        Some(active)
    }

    /// Idle to Speaking for a message that is not part of a turn.
    pub fn begin_notice(&mut self) -> bool {
        if self.torn_down || self.state.status != AssistantStatus::Idle || self.turn_in_flight {
            return false;
        }

        self.speaking_notice = true;
        self.state.status = AssistantStatus::Speaking;
        true
    }

    /// Speaking to Idle. Clears the in-flight flag and hands back the
    /// finished turn.
    pub fn on_speech_end(&mut self, turn: Option<TurnId>) -> SpeechEndOutcome {
        if self.torn_down || self.state.status != AssistantStatus::Speaking {
            return SpeechEndOutcome::Ignored;
        }

        match turn {
            None if self.speaking_notice => {
                self.speaking_notice = false;
                self.state.status = AssistantStatus::Idle;
                let restart = (!self.listening_halted).then_some(RestartDelay::Settle);
                SpeechEndOutcome::NoticeCompleted(restart)
            }
            Some(id) if self.active_turn.as_ref().is_some_and(|active| active.id == id) => {
                self.turn_in_flight = false;
                self.state.status = AssistantStatus::Idle;
                match self.active_turn.take() {
                    Some(finished) => {
                        info!(turn_id = %finished.id, "turn completed");
                        SpeechEndOutcome::TurnCompleted(finished)
                    }
                    None => SpeechEndOutcome::Ignored,
                }
            }
            _ => SpeechEndOutcome::Ignored,
        }
    }

    /// Any state to Idle. The active turn is abandoned so a late reply for it
    /// is discarded. Fatal errors halt listening until `resume_listening`.
    pub fn on_error(&mut self, error: &RecognitionError) -> ErrorOutcome {
        if self.torn_down {
            return ErrorOutcome::Ignored;
        }

        if let Some(abandoned) = self.active_turn.take() {
            warn!(turn_id = %abandoned.id, "turn abandoned after error");
        }
        self.turn_in_flight = false;
        self.speaking_notice = false;
        self.state.status = AssistantStatus::Idle;

        if error.is_fatal() {
            warn!(error = %error, "recognition failed permanently, listening halted");
            self.listening_halted = true;
            self.restart_pending = false;
            ErrorOutcome::Halted
        } else {
            debug!(error = %error, "transient recognition error");
            ErrorOutcome::Restart(RestartDelay::Retry)
        }
    }

    /// Claims the single restart slot. Returns `false` when a restart is
    /// already scheduled or listening cannot resume.
    pub fn request_restart(&mut self) -> bool {
        if self.torn_down || self.listening_halted || self.restart_pending {
            return false;
        }

        self.restart_pending = true;
        true
    }

    /// The restart delay elapsed; attempts to start listening.
    pub fn on_restart_timer(&mut self) -> bool {
        if !self.restart_pending {
            return false;
        }

        self.restart_pending = false;
        self.on_recognition_start()
    }

    /// Clears a fatal halt so listening may start again. Returns `false` when
    /// listening cannot start right away; a notice still being spoken then
    /// hands back a restart from `on_speech_end`.
    pub fn resume_listening(&mut self) -> bool {
        if self.torn_down {
            return false;
        }

        self.listening_halted = false;
        self.on_recognition_start()
    }

    /// Ends the session. All further calls are ignored.
    pub fn teardown(&mut self) -> Option<ConversationTurn> {
        self.torn_down = true;
        self.turn_in_flight = false;
        self.restart_pending = false;
        self.speaking_notice = false;
        self.state.status = AssistantStatus::Idle;
        self.state.current_user = None;
        self.active_turn.take()
    }
}
