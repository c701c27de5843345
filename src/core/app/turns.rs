//! One turn's lifecycle: placeholders, stream subscription, backend call,
//! reconciliation, teardown.

use std::future::{pending, Future};
use std::time::Duration;

use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{is_abort_message, ActiveTurn, ChatController, TurnError};
use crate::core::app::actions::TurnAction;
use crate::core::app::state::{ActiveRequest, StateHandle};
use crate::core::backend::{
    BackendError, ContinueTurnRequest, RegenerateRequest, SendTurnRequest,
};
use crate::core::batcher::StreamBatcher;
use crate::core::chat_stream::{FormatLatch, LegacyChunk, LegacyStreamParser};
use crate::core::ids::{new_id, now_ms};
use crate::core::message::{Attachment, EntryId, Message, Placeholder, Role, TranscriptEntry};
use crate::core::stream_bus::{NormalizedEvent, Subscription};

/// How a turn ended. Backend failures are reported here rather than as
/// errors: by the time a turn returns, the state has already been repaired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    Completed,
    /// The backend failed; `message` is also shown as the error banner.
    Failed { message: String },
    Aborted,
    /// Preconditions for the operation did not hold; nothing happened.
    Skipped,
}

struct TurnPlan {
    request_id: String,
    /// Entry the streamed deltas accrete into.
    stream_target: EntryId,
    /// Every entry the turn created or cleared.
    targets: Vec<EntryId>,
    restore: Option<Message>,
}

struct TurnContext {
    session_id: String,
    character_id: String,
    persona_id: Option<String>,
}

async fn next_event<T>(subscription: &mut Option<Subscription<T>>) -> Option<T> {
    match subscription {
        Some(subscription) => subscription.recv().await,
        None => pending().await,
    }
}

async fn frame_tick(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}

/// Stream side of one turn: both channels, the format latch and frame
/// batching for the entry being streamed into.
struct StreamIntake<'a> {
    state: &'a StateHandle,
    request_id: &'a str,
    target: EntryId,
    frame_interval: Duration,
    normalized: Option<Subscription<NormalizedEvent>>,
    raw: Option<Subscription<String>>,
    latch: FormatLatch,
    parser: LegacyStreamParser,
    batcher: StreamBatcher,
    frame_deadline: Option<Instant>,
}

impl StreamIntake<'_> {
    fn on_normalized(&mut self, event: NormalizedEvent) {
        if self.latch.observe_normalized() {
            debug!(request_id = %self.request_id, "normalized stream active, raw channel disabled");
            self.raw = None;
        }
        match event {
            NormalizedEvent::Delta { text } => self.push_delta(&text),
            NormalizedEvent::Error { message } => {
                warn!(request_id = %self.request_id, %message, "stream reported an error");
                self.state.dispatch(TurnAction::SetError(Some(message)));
            }
        }
    }

    fn on_raw(&mut self, chunk: &str) {
        for event in self.parser.feed(chunk) {
            match event {
                LegacyChunk::Text(text) => self.push_delta(&text),
                LegacyChunk::Error(message) => {
                    warn!(request_id = %self.request_id, %message, "legacy stream reported an error");
                    self.state.dispatch(TurnAction::SetError(Some(message)));
                }
                LegacyChunk::Usage(_) | LegacyChunk::Done => {}
            }
        }
    }

    fn push_delta(&mut self, text: &str) {
        if self.batcher.update(self.target.clone(), text) {
            self.frame_deadline = Some(Instant::now() + self.frame_interval);
        }
    }

    fn on_frame(&mut self) {
        self.frame_deadline = None;
        if let Some(action) = self.batcher.flush() {
            self.state.dispatch(action);
        }
    }

    /// Take in events that were delivered but not yet polled.
    fn drain_queued(&mut self) {
        while let Some(event) = self.normalized.as_mut().and_then(Subscription::try_recv) {
            self.on_normalized(event);
        }
        while self.latch.accepts_legacy() {
            let Some(chunk) = self.raw.as_mut().and_then(Subscription::try_recv) else {
                break;
            };
            self.on_raw(&chunk);
        }
    }

    /// Land any pending text, then unsubscribe.
    fn finish(mut self) {
        self.on_frame();
        self.batcher.cancel();
    }
}

impl ChatController {
    /// Send a user turn. Fails only on validation or missing context; backend
    /// failures are absorbed and reported through [`TurnOutcome::Failed`].
    pub async fn send(
        &self,
        text: String,
        attachments: Vec<Attachment>,
    ) -> Result<TurnOutcome, TurnError> {
        if text.trim().is_empty() && attachments.is_empty() {
            return Err(TurnError::Validation(
                "Message text or an attachment is required",
            ));
        }
        let context = self.turn_context()?;
        let request_id = new_id();
        let created_at = self.next_created_at();

        let mut user = Placeholder::new(Role::User, text.clone(), created_at);
        user.attachments = attachments.clone();
        let assistant = Placeholder::new(Role::Assistant, "", created_at + 1);
        let user_id = user.id.clone();
        let assistant_id = assistant.id.clone();
        let targets = vec![
            EntryId::Placeholder(user_id.clone()),
            EntryId::Placeholder(assistant_id.clone()),
        ];

        self.state.dispatch(TurnAction::Batch(vec![
            TurnAction::SetError(None),
            TurnAction::SetSending(true),
            TurnAction::SetActiveRequest(Some(ActiveRequest {
                request_id: request_id.clone(),
                targets: targets.clone(),
            })),
            TurnAction::AppendEntry(TranscriptEntry::Placeholder(user)),
            TurnAction::AppendEntry(TranscriptEntry::Placeholder(assistant)),
        ]));
        info!(request_id = %request_id, session_id = %context.session_id, "turn started");

        let backend = self.backend.clone();
        let request = SendTurnRequest {
            session_id: context.session_id,
            character_id: context.character_id,
            text,
            persona_id: context.persona_id,
            attachments,
            stream: self.settings.stream,
            request_id: request_id.clone(),
        };
        let call = async move {
            let response = backend.send_turn(request).await?;
            Ok::<_, BackendError>(vec![
                TurnAction::ReplacePlaceholder {
                    placeholder: user_id,
                    message: response.user_message,
                },
                TurnAction::ReplacePlaceholder {
                    placeholder: assistant_id,
                    message: response.assistant_message,
                },
            ])
        };

        let plan = TurnPlan {
            request_id,
            stream_target: targets[1].clone(),
            targets,
            restore: None,
        };
        Ok(self.run_turn(plan, call).await)
    }

    /// Ask the character to keep going without new user input.
    pub async fn continue_turn(&self) -> Result<TurnOutcome, TurnError> {
        let context = self.turn_context()?;
        let request_id = new_id();
        let assistant = Placeholder::new(Role::Assistant, "", self.next_created_at());
        let assistant_id = assistant.id.clone();
        let target = EntryId::Placeholder(assistant_id.clone());

        self.state.dispatch(TurnAction::Batch(vec![
            TurnAction::SetError(None),
            TurnAction::SetSending(true),
            TurnAction::SetActiveRequest(Some(ActiveRequest {
                request_id: request_id.clone(),
                targets: vec![target.clone()],
            })),
            TurnAction::AppendEntry(TranscriptEntry::Placeholder(assistant)),
        ]));
        info!(request_id = %request_id, "continue started");

        let backend = self.backend.clone();
        let request = ContinueTurnRequest {
            session_id: context.session_id,
            character_id: context.character_id,
            persona_id: context.persona_id,
            stream: self.settings.stream,
            request_id: request_id.clone(),
        };
        let call = async move {
            let response = backend.continue_turn(request).await?;
            Ok::<_, BackendError>(vec![TurnAction::ReplacePlaceholder {
                placeholder: assistant_id,
                message: response.assistant_message,
            }])
        };

        let plan = TurnPlan {
            request_id,
            stream_target: target.clone(),
            targets: vec![target],
            restore: None,
        };
        Ok(self.run_turn(plan, call).await)
    }

    /// Generate a new variant for the last assistant message. Any other target
    /// is skipped without touching state.
    pub async fn regenerate(&self, message_id: &str) -> Result<TurnOutcome, TurnError> {
        let context = self.turn_context()?;
        let snapshot = self.state.read(|state| {
            if state.regenerating_message_id.is_some() {
                return None;
            }
            match state.last_entry() {
                Some(TranscriptEntry::Persisted(message))
                    if message.id == message_id && message.is_assistant() =>
                {
                    Some(message.clone())
                }
                _ => None,
            }
        });
        let Some(snapshot) = snapshot else {
            debug!(message_id, "regenerate skipped");
            return Ok(TurnOutcome::Skipped);
        };

        let request_id = new_id();
        let target = EntryId::Persisted(message_id.to_string());
        self.state.dispatch(TurnAction::Batch(vec![
            TurnAction::SetError(None),
            TurnAction::SetRegenerating(Some(message_id.to_string())),
            TurnAction::SetActiveRequest(Some(ActiveRequest {
                request_id: request_id.clone(),
                targets: vec![target.clone()],
            })),
            TurnAction::ClearContent {
                target: target.clone(),
            },
        ]));
        info!(request_id = %request_id, message_id, "regeneration started");

        let backend = self.backend.clone();
        let request = RegenerateRequest {
            session_id: context.session_id,
            message_id: message_id.to_string(),
            stream: self.settings.stream,
            request_id: request_id.clone(),
        };
        let replaced_id = message_id.to_string();
        let call = async move {
            let response = backend.regenerate(request).await?;
            Ok::<_, BackendError>(vec![TurnAction::ReplaceMessage {
                message_id: replaced_id,
                message: response.assistant_message,
            }])
        };

        let plan = TurnPlan {
            request_id,
            stream_target: target.clone(),
            targets: vec![target],
            restore: Some(snapshot),
        };
        Ok(self.run_turn(plan, call).await)
    }

    /// Cancel the turn streaming under `request_id`. Never fails: backend
    /// cancellation is best effort and local cleanup always runs.
    pub async fn abort(&self, request_id: &str) {
        let targets = self.state.read(|state| {
            state
                .active_request
                .as_ref()
                .filter(|request| request.request_id == request_id)
                .map(|request| request.targets.clone())
                .unwrap_or_default()
        });
        let (restore, drained) = {
            let active = self.lock_active_turn();
            let turn = active
                .as_ref()
                .filter(|turn| turn.request_id == request_id);
            if let Some(turn) = turn {
                turn.cancel.cancel();
            }
            (
                turn.and_then(|turn| turn.restore.clone()),
                turn.map(|turn| turn.drained.clone()),
            )
        };

        if let Err(err) = self.backend.abort_request(request_id).await {
            warn!(request_id, error = %err, "backend abort failed");
        }
        if let Some(drained) = drained {
            drained.cancelled().await;
        }
        self.cleanup_aborted(request_id, &targets, restore).await;
        self.clear_active_turn(request_id);
    }

    async fn run_turn<F>(&self, plan: TurnPlan, call: F) -> TurnOutcome
    where
        F: Future<Output = Result<Vec<TurnAction>, BackendError>>,
    {
        let cancel = CancellationToken::new();
        let drained = CancellationToken::new();
        let drained_guard = drained.clone().drop_guard();
        *self.lock_active_turn() = Some(ActiveTurn {
            request_id: plan.request_id.clone(),
            cancel: cancel.clone(),
            drained,
            restore: plan.restore.clone(),
        });

        let mut intake = StreamIntake {
            state: &self.state,
            request_id: &plan.request_id,
            target: plan.stream_target.clone(),
            frame_interval: self.settings.frame_interval,
            normalized: Some(self.bus.subscribe_normalized(&plan.request_id)),
            raw: Some(self.bus.subscribe_raw(&plan.request_id)),
            latch: FormatLatch::default(),
            parser: LegacyStreamParser::new(self.settings.legacy_format),
            batcher: StreamBatcher::new(),
            frame_deadline: None,
        };
        tokio::pin!(call);

        let result = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break None,
                result = &mut call => break Some(result),
                event = next_event(&mut intake.normalized) => match event {
                    Some(event) => intake.on_normalized(event),
                    None => intake.normalized = None,
                },
                chunk = next_event(&mut intake.raw), if intake.latch.accepts_legacy() => match chunk {
                    Some(chunk) => intake.on_raw(&chunk),
                    None => intake.raw = None,
                },
                _ = frame_tick(intake.frame_deadline) => intake.on_frame(),
            }
        };

        if result.is_none() {
            intake.drain_queued();
        }
        intake.finish();
        // Abort cleanup reads the placeholders only after this point.
        drop(drained_guard);

        let outcome = match result {
            // `abort` owns the cleanup for a local cancellation.
            None => TurnOutcome::Aborted,
            Some(Ok(actions)) => {
                self.state.dispatch(TurnAction::Batch(actions));
                info!(request_id = %plan.request_id, "turn reconciled");
                TurnOutcome::Completed
            }
            Some(Err(err)) => {
                let message = err.to_string();
                if matches!(err, BackendError::Aborted)
                    || is_abort_message(&message, &self.settings.aborted_phrases)
                {
                    info!(request_id = %plan.request_id, "backend reported the turn as aborted");
                    self.cleanup_aborted(&plan.request_id, &plan.targets, plan.restore.clone())
                        .await;
                    TurnOutcome::Aborted
                } else {
                    warn!(request_id = %plan.request_id, error = %message, "turn failed");
                    self.recover(&plan, &message).await;
                    TurnOutcome::Failed { message }
                }
            }
        };

        self.state.dispatch(TurnAction::FinishTurn {
            request_id: plan.request_id.clone(),
        });
        self.clear_active_turn(&plan.request_id);
        outcome
    }

    /// Show the failure and resync. When the store is unreachable too, undo
    /// the turn's in-memory traces instead.
    async fn recover(&self, plan: &TurnPlan, message: &str) {
        self.state
            .dispatch(TurnAction::SetError(Some(message.to_string())));
        match self.synchronizer().reload().await {
            Ok(()) => info!(request_id = %plan.request_id, "resynced after failed turn"),
            Err(err) => {
                warn!(request_id = %plan.request_id, error = %err, "resync failed");
                let action = match &plan.restore {
                    Some(snapshot) => TurnAction::ReplaceMessage {
                        message_id: snapshot.id.clone(),
                        message: snapshot.clone(),
                    },
                    None => TurnAction::RemoveEntry(plan.stream_target.clone()),
                };
                self.state.dispatch(action);
            }
        }
    }

    /// Keep what was streamed, drop what was not. Safe to run more than once.
    async fn cleanup_aborted(&self, request_id: &str, targets: &[EntryId], restore: Option<Message>) {
        let mut actions = Vec::new();
        let mut promoted = 0usize;
        let mut cleared_persisted = false;
        self.state.read(|state| {
            for target in targets {
                match state.entry(target) {
                    Some(TranscriptEntry::Placeholder(placeholder)) => {
                        if placeholder.content.is_empty() && placeholder.attachments.is_empty() {
                            actions.push(TurnAction::RemoveEntry(target.clone()));
                        } else {
                            promoted += 1;
                            actions.push(TurnAction::PromotePlaceholder {
                                placeholder: placeholder.id.clone(),
                                message_id: new_id(),
                            });
                        }
                    }
                    Some(TranscriptEntry::Persisted(_)) => cleared_persisted = true,
                    None => {}
                }
            }
        });
        actions.push(TurnAction::FinishTurn {
            request_id: request_id.to_string(),
        });
        self.state.dispatch(TurnAction::Batch(actions));

        if promoted > 0 {
            match self.state.read(|state| state.persistable_session()) {
                Some(session) => match self.store.save(&session).await {
                    Ok(()) => info!(request_id, promoted, "partial response saved after abort"),
                    Err(err) => {
                        warn!(request_id, error = %err, "could not save after abort, keeping in-memory copy")
                    }
                },
                None => warn!(request_id, "no session loaded during abort cleanup"),
            }
        }

        if cleared_persisted {
            if let Err(err) = self.synchronizer().reload().await {
                warn!(request_id, error = %err, "resync after abort failed");
                if let Some(snapshot) = restore {
                    self.state.dispatch(TurnAction::ReplaceMessage {
                        message_id: snapshot.id.clone(),
                        message: snapshot,
                    });
                }
            }
        }
    }

    fn turn_context(&self) -> Result<TurnContext, TurnError> {
        self.state.read(|state| {
            let session = state.session.as_ref().ok_or(TurnError::NoSession)?;
            let character = state.character.as_ref().ok_or(TurnError::NoCharacter)?;
            Ok(TurnContext {
                session_id: session.id.clone(),
                character_id: character.id.clone(),
                persona_id: state
                    .persona
                    .as_ref()
                    .map(|persona| persona.id.clone())
                    .or_else(|| session.persona_id.clone()),
            })
        })
    }

    /// A timestamp that sorts after everything already in the transcript.
    fn next_created_at(&self) -> i64 {
        let last = self
            .state
            .read(|state| state.last_entry().map(TranscriptEntry::created_at));
        match last {
            Some(last) => now_ms().max(last + 1),
            None => now_ms(),
        }
    }

    fn clear_active_turn(&self, request_id: &str) {
        let mut active = self.lock_active_turn();
        if active
            .as_ref()
            .is_some_and(|turn| turn.request_id == request_id)
        {
            *active = None;
        }
    }
}
