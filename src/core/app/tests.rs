use std::sync::Arc;
use std::time::Duration;

use super::*;
use crate::core::message::{Attachment, EntryId, Message, Role, TranscriptEntry};
use crate::core::store::MemorySessionStore;
use crate::utils::test_utils::{
    assistant_with_variants, create_test_character, create_test_session, delta, raw_delta,
    wait_for, Emission, ScriptedBackend, ScriptedOutcome,
};

struct Harness {
    controller: Arc<ChatController>,
    store: Arc<MemorySessionStore>,
    backend: Arc<ScriptedBackend>,
    session_id: String,
}

async fn harness(
    messages: Vec<Message>,
    configure: impl FnOnce(ScriptedBackend) -> ScriptedBackend,
) -> Harness {
    harness_with_frames(messages, Duration::from_millis(5), configure).await
}

async fn harness_with_frames(
    messages: Vec<Message>,
    frame_interval: Duration,
    configure: impl FnOnce(ScriptedBackend) -> ScriptedBackend,
) -> Harness {
    let session = create_test_session(messages);
    let session_id = session.id.clone();
    let store = Arc::new(MemorySessionStore::with_sessions([session]));
    let bus = StreamEventBus::new();
    let backend = Arc::new(configure(ScriptedBackend::new(bus.clone(), store.clone())));

    let settings = TurnSettings {
        frame_interval,
        ..TurnSettings::default()
    };
    let store_handle: Arc<dyn SessionStore> = store.clone();
    let backend_handle: Arc<dyn CompletionService> = backend.clone();
    let controller = Arc::new(ChatController::new(store_handle, backend_handle, bus, settings));
    controller.load_character(create_test_character());
    controller
        .open_session(&session_id)
        .await
        .expect("open session");

    Harness {
        controller,
        store,
        backend,
        session_id,
    }
}

fn contents(state: &TurnState) -> Vec<String> {
    state
        .transcript
        .iter()
        .map(|entry| entry.display_content().to_string())
        .collect()
}

fn last_content_is(expected: &'static str) -> impl Fn(&TurnState) -> bool {
    move |state| {
        state
            .last_entry()
            .is_some_and(|entry| entry.display_content() == expected)
    }
}

#[tokio::test]
async fn send_on_empty_session_yields_two_messages_and_clears_sending() {
    let h = harness(vec![], |backend| backend.with_emissions(vec![delta("Hello"), delta(" world")]))
        .await;

    let outcome = h
        .controller
        .send("Hi".into(), vec![])
        .await
        .expect("send");
    assert_eq!(outcome, TurnOutcome::Completed);

    let state = h.controller.snapshot();
    assert!(!state.sending);
    assert!(state.active_request.is_none());
    assert_eq!(contents(&state), vec!["Hi", "Hello world"]);
    assert!(state.transcript.iter().all(|entry| !entry.is_placeholder()));

    let stored = h.store.snapshot(&h.session_id).expect("stored");
    let ids: Vec<_> = stored.messages.iter().map(|m| m.id.clone()).collect();
    let state_ids: Vec<_> = state
        .transcript
        .iter()
        .filter_map(TranscriptEntry::as_persisted)
        .map(|m| m.id.clone())
        .collect();
    assert_eq!(ids, state_ids);
}

#[tokio::test]
async fn continue_appends_one_reply_in_place_of_its_placeholder() {
    let earlier = vec![Message::user("hi"), Message::assistant("Hello.")];
    let h = harness(earlier, |backend| {
        backend
            .with_emissions(vec![delta("And"), delta(" more")])
            .with_reply("And more.")
    })
    .await;

    let outcome = h.controller.continue_turn().await.expect("continue");
    assert_eq!(outcome, TurnOutcome::Completed);

    let state = h.controller.snapshot();
    assert!(!state.sending);
    assert!(state.active_request.is_none());
    assert_eq!(contents(&state), vec!["hi", "Hello.", "And more."]);
    assert!(state.transcript.iter().all(|entry| !entry.is_placeholder()));
    assert_eq!(state.transcript[2].role(), Role::Assistant);

    let stored = h.store.snapshot(&h.session_id).expect("stored");
    let ids: Vec<_> = stored.messages.iter().map(|m| m.id.clone()).collect();
    let state_ids: Vec<_> = state
        .transcript
        .iter()
        .filter_map(TranscriptEntry::as_persisted)
        .map(|m| m.id.clone())
        .collect();
    assert_eq!(ids, state_ids);
}

#[tokio::test]
async fn empty_send_is_rejected_before_any_side_effect() {
    let h = harness(vec![], |backend| backend).await;
    let before = h.controller.snapshot().revision;

    let result = h.controller.send("   ".into(), vec![]).await;
    assert!(matches!(result, Err(TurnError::Validation(_))));
    assert_eq!(h.controller.snapshot().revision, before);
}

#[tokio::test]
async fn send_without_session_reports_no_session() {
    let store: Arc<dyn SessionStore> = Arc::new(MemorySessionStore::new());
    let bus = StreamEventBus::new();
    let backend: Arc<dyn CompletionService> = Arc::new(ScriptedBackend::new(
        bus.clone(),
        Arc::new(MemorySessionStore::new()),
    ));
    let controller = ChatController::new(store, backend, bus, TurnSettings::default());
    let result = controller.send("hi".into(), vec![]).await;
    assert!(matches!(result, Err(TurnError::NoSession)));
}

#[tokio::test]
async fn streamed_deltas_accrete_into_the_assistant_placeholder() {
    let h = harness(vec![], |backend| {
        backend
            .with_emissions(vec![delta("Hel"), delta("lo"), delta(" wor")])
            .with_outcome(ScriptedOutcome::HangUntilAborted)
    })
    .await;
    let mut rx = h.controller.subscribe();

    let controller = h.controller.clone();
    let turn = tokio::spawn(async move { controller.send("Hi".into(), vec![]).await });

    let state = wait_for(&mut rx, last_content_is("Hello wor")).await;
    assert!(state.sending);
    assert!(state.last_entry().is_some_and(TranscriptEntry::is_placeholder));

    let request_id = h.controller.active_request_id().expect("active request");
    h.controller.abort(&request_id).await;
    assert_eq!(
        turn.await.expect("join").expect("turn"),
        TurnOutcome::Aborted
    );
}

#[tokio::test]
async fn abort_keeps_partial_text_under_a_permanent_id() {
    let h = harness(vec![], |backend| {
        backend
            .with_emissions(vec![delta("Hello"), delta(" wor")])
            .with_outcome(ScriptedOutcome::HangUntilAborted)
    })
    .await;
    let mut rx = h.controller.subscribe();

    let controller = h.controller.clone();
    let turn = tokio::spawn(async move { controller.send("Hi".into(), vec![]).await });
    wait_for(&mut rx, last_content_is("Hello wor")).await;

    let request_id = h.controller.active_request_id().expect("active request");
    h.controller.abort(&request_id).await;
    let outcome = turn.await.expect("join").expect("turn");
    assert_eq!(outcome, TurnOutcome::Aborted);
    assert_eq!(h.backend.abort_calls(), vec![request_id]);

    let state = h.controller.snapshot();
    assert!(!state.sending);
    assert!(state.error.is_none());
    let kept = state
        .last_entry()
        .and_then(TranscriptEntry::as_persisted)
        .expect("promoted message");
    assert_eq!(kept.content, "Hello wor");
    assert_eq!(kept.role, Role::Assistant);
    assert!(!kept.id.starts_with("pending-"));

    let stored = h.store.snapshot(&h.session_id).expect("stored");
    assert_eq!(
        stored.messages.iter().map(|m| m.content.as_str()).collect::<Vec<_>>(),
        vec!["Hi", "Hello wor"]
    );
}

#[tokio::test]
async fn abort_before_any_delta_drops_the_empty_placeholder() {
    let h = harness(vec![], |backend| {
        backend.with_outcome(ScriptedOutcome::HangUntilAborted)
    })
    .await;
    let mut rx = h.controller.subscribe();

    let controller = h.controller.clone();
    let turn = tokio::spawn(async move { controller.continue_turn().await });
    wait_for(&mut rx, |state| state.sending).await;

    let request_id = h.controller.active_request_id().expect("active request");
    h.controller.abort(&request_id).await;
    assert_eq!(turn.await.expect("join").expect("turn"), TurnOutcome::Aborted);

    let state = h.controller.snapshot();
    assert!(state.transcript.is_empty());
    assert!(!state.sending);
}

#[tokio::test]
async fn abort_keeps_deltas_that_never_reached_a_frame() {
    let h = harness_with_frames(vec![], Duration::from_secs(10), |backend| {
        backend
            .with_emissions(vec![delta("Hello"), delta(" wor")])
            .with_outcome(ScriptedOutcome::HangUntilAborted)
    })
    .await;

    let controller = h.controller.clone();
    let turn = tokio::spawn(async move { controller.continue_turn().await });
    h.backend.emitted().await;
    assert!(h
        .controller
        .snapshot()
        .last_entry()
        .is_some_and(|entry| entry.display_content().is_empty()));

    let request_id = h.controller.active_request_id().expect("active request");
    h.controller.abort(&request_id).await;
    assert_eq!(turn.await.expect("join").expect("turn"), TurnOutcome::Aborted);

    let state = h.controller.snapshot();
    assert_eq!(contents(&state), vec!["Hello wor"]);
    assert!(!state.transcript[0].is_placeholder());
    assert_eq!(
        h.store.snapshot(&h.session_id).expect("stored").messages[0].content,
        "Hello wor"
    );
}

#[tokio::test]
async fn abort_survives_a_failing_save() {
    let h = harness(vec![], |backend| {
        backend
            .with_emissions(vec![delta("partial")])
            .with_outcome(ScriptedOutcome::HangUntilAborted)
    })
    .await;
    let mut rx = h.controller.subscribe();

    let controller = h.controller.clone();
    let turn = tokio::spawn(async move { controller.continue_turn().await });
    wait_for(&mut rx, last_content_is("partial")).await;

    h.store.set_fail_saves(true);
    let request_id = h.controller.active_request_id().expect("active request");
    h.controller.abort(&request_id).await;
    turn.await.expect("join").expect("turn");

    let state = h.controller.snapshot();
    assert_eq!(contents(&state), vec!["partial"]);
    assert!(!state.transcript[0].is_placeholder());
    assert!(h
        .store
        .snapshot(&h.session_id)
        .expect("stored")
        .messages
        .is_empty());
}

#[tokio::test]
async fn backend_failure_resyncs_from_the_store() {
    let earlier = vec![Message::user("earlier"), Message::assistant("reply")];
    let h = harness(earlier, |backend| {
        backend.with_outcome(ScriptedOutcome::Fail("API Error: model overloaded".into()))
    })
    .await;

    let outcome = h
        .controller
        .send("Hi".into(), vec![])
        .await
        .expect("send");
    assert_eq!(
        outcome,
        TurnOutcome::Failed {
            message: "API Error: model overloaded".into()
        }
    );

    let state = h.controller.snapshot();
    assert_eq!(state.error.as_deref(), Some("API Error: model overloaded"));
    assert_eq!(contents(&state), vec!["earlier", "reply"]);
    assert!(!state.sending);
}

#[tokio::test]
async fn failed_resync_drops_only_the_assistant_placeholder() {
    let h = harness(vec![], |backend| {
        backend.with_outcome(ScriptedOutcome::Fail("boom".into()))
    })
    .await;
    h.store.set_fail_gets(true);

    let outcome = h
        .controller
        .send("Hi".into(), vec![])
        .await
        .expect("send");
    assert!(matches!(outcome, TurnOutcome::Failed { .. }));

    let state = h.controller.snapshot();
    assert_eq!(contents(&state), vec!["Hi"]);
    assert_eq!(state.transcript[0].role(), Role::User);
    assert!(!state.sending);
}

#[tokio::test]
async fn aborted_error_text_is_a_clean_exit_without_banner() {
    let h = harness(vec![], |backend| {
        backend
            .with_emissions(vec![delta("Hel")])
            .with_outcome(ScriptedOutcome::Fail("Request Aborted by user".into()))
    })
    .await;

    let outcome = h
        .controller
        .send("Hi".into(), vec![])
        .await
        .expect("send");
    assert_eq!(outcome, TurnOutcome::Aborted);

    let state = h.controller.snapshot();
    assert!(state.error.is_none());
    assert!(!state.sending);
    assert!(state.transcript.iter().all(|entry| !entry.is_placeholder()));
}

#[tokio::test]
async fn legacy_channel_is_parsed_until_a_normalized_event_arrives() {
    let h = harness(vec![], |backend| {
        backend
            .with_emissions(vec![
                Emission::Raw(raw_delta("Hel")[..10].to_string()),
                Emission::Raw(raw_delta("Hel")[10..].to_string()),
                Emission::Raw(raw_delta("lo")),
            ])
            .with_outcome(ScriptedOutcome::HangUntilAborted)
    })
    .await;
    let mut rx = h.controller.subscribe();

    let controller = h.controller.clone();
    let turn = tokio::spawn(async move { controller.continue_turn().await });
    wait_for(&mut rx, last_content_is("Hello")).await;

    let request_id = h.controller.active_request_id().expect("active request");
    h.controller.abort(&request_id).await;
    turn.await.expect("join").expect("turn");
}

#[tokio::test]
async fn normalized_events_disable_the_legacy_channel() {
    let h = harness(vec![], |backend| {
        backend
            .with_emissions(vec![delta("A"), Emission::Raw(raw_delta("B"))])
            .with_outcome(ScriptedOutcome::HangUntilAborted)
    })
    .await;
    let mut rx = h.controller.subscribe();

    let controller = h.controller.clone();
    let turn = tokio::spawn(async move { controller.continue_turn().await });
    wait_for(&mut rx, last_content_is("A")).await;
    tokio::time::sleep(Duration::from_millis(30)).await;

    let request_id = h.controller.active_request_id().expect("active request");
    h.controller.abort(&request_id).await;
    turn.await.expect("join").expect("turn");
    assert_eq!(contents(&h.controller.snapshot()), vec!["A"]);
}

#[tokio::test]
async fn regenerate_replaces_the_last_message_with_a_variant() {
    let h = harness(
        vec![Message::user("hi"), Message::assistant("first take")],
        |backend| backend.with_reply("second take"),
    )
    .await;
    let message_id = h.controller.snapshot().transcript[1]
        .as_persisted()
        .expect("persisted")
        .id
        .clone();

    let outcome = h.controller.regenerate(&message_id).await.expect("regenerate");
    assert_eq!(outcome, TurnOutcome::Completed);

    let state = h.controller.snapshot();
    let message = state.message(&message_id).expect("message");
    assert_eq!(message.display_content(), "second take");
    assert_eq!(message.variants.len(), 2);
    assert!(state.regenerating_message_id.is_none());
}

#[tokio::test]
async fn regenerate_of_a_non_last_message_is_a_no_op() {
    let h = harness(
        vec![
            Message::assistant("old"),
            Message::user("hi"),
            Message::assistant("latest"),
        ],
        |backend| backend,
    )
    .await;
    let state = h.controller.snapshot();
    let first_id = state.transcript[0].as_persisted().expect("persisted").id.clone();
    let user_id = state.transcript[1].as_persisted().expect("persisted").id.clone();

    assert_eq!(
        h.controller.regenerate(&first_id).await.expect("regenerate"),
        TurnOutcome::Skipped
    );
    assert_eq!(
        h.controller.regenerate(&user_id).await.expect("regenerate"),
        TurnOutcome::Skipped
    );
    assert_eq!(h.controller.snapshot().revision, state.revision);
}

#[tokio::test]
async fn failed_regeneration_restores_the_stored_message() {
    let h = harness(
        vec![Message::user("hi"), Message::assistant("keep me")],
        |backend| backend.with_outcome(ScriptedOutcome::Fail("boom".into())),
    )
    .await;
    let message_id = h.controller.snapshot().transcript[1]
        .as_persisted()
        .expect("persisted")
        .id
        .clone();

    let outcome = h.controller.regenerate(&message_id).await.expect("regenerate");
    assert!(matches!(outcome, TurnOutcome::Failed { .. }));
    let state = h.controller.snapshot();
    assert_eq!(contents(&state), vec!["hi", "keep me"]);
    assert!(state.regenerating_message_id.is_none());
}

#[tokio::test]
async fn aborted_regeneration_resyncs_the_cleared_message() {
    let h = harness(
        vec![Message::user("hi"), Message::assistant("original")],
        |backend| {
            backend
                .with_emissions(vec![delta("new tex")])
                .with_outcome(ScriptedOutcome::HangUntilAborted)
        },
    )
    .await;
    let message_id = h.controller.snapshot().transcript[1]
        .as_persisted()
        .expect("persisted")
        .id
        .clone();
    let mut rx = h.controller.subscribe();

    let controller = h.controller.clone();
    let target = message_id.clone();
    let turn = tokio::spawn(async move { controller.regenerate(&target).await });
    wait_for(&mut rx, last_content_is("new tex")).await;

    let request_id = h.controller.active_request_id().expect("active request");
    h.controller.abort(&request_id).await;
    assert_eq!(turn.await.expect("join").expect("turn"), TurnOutcome::Aborted);

    let state = h.controller.snapshot();
    assert_eq!(
        state.message(&message_id).map(Message::display_content),
        Some("original")
    );
    assert!(state.regenerating_message_id.is_none());
}

#[tokio::test]
async fn reload_sorts_messages_by_creation_time() {
    let h = harness(vec![], |backend| backend).await;
    let mut session = h.store.snapshot(&h.session_id).expect("stored");
    let mut late = Message::user("late");
    late.created_at = 30;
    let mut early = Message::user("early");
    early.created_at = 10;
    let mut tie = Message::assistant("tie");
    tie.created_at = 10;
    session.messages = vec![late, early, tie];
    h.store.save(&session).await.expect("save");

    h.controller.synchronizer().reload().await.expect("reload");
    assert_eq!(
        contents(&h.controller.snapshot()),
        vec!["early", "tie", "late"]
    );
}

#[tokio::test]
async fn pinned_messages_block_delete_and_rewind() {
    let h = harness(
        vec![
            Message::user("one"),
            Message::assistant("two"),
            Message::user("three"),
        ],
        |backend| backend,
    )
    .await;
    let ids: Vec<String> = h
        .controller
        .snapshot()
        .transcript
        .iter()
        .filter_map(TranscriptEntry::as_persisted)
        .map(|m| m.id.clone())
        .collect();
    let sync = h.controller.synchronizer();

    assert!(sync.toggle_pin(&ids[1]).await.expect("pin"));
    assert!(matches!(
        sync.delete(&ids[1]).await,
        Err(TurnError::Pinned { .. })
    ));
    assert!(matches!(
        sync.rewind_to(&ids[0]).await,
        Err(TurnError::Pinned { message_id }) if message_id == ids[1]
    ));

    sync.rewind_to(&ids[1]).await.expect("rewind past pin");
    assert_eq!(contents(&h.controller.snapshot()), vec!["one", "two"]);
    assert_eq!(
        h.store.snapshot(&h.session_id).expect("stored").messages.len(),
        2
    );

    assert!(!sync.toggle_pin(&ids[1]).await.expect("unpin"));
    sync.delete(&ids[1]).await.expect("delete");
    assert_eq!(contents(&h.controller.snapshot()), vec!["one"]);
}

#[tokio::test]
async fn rewind_to_last_message_changes_nothing() {
    let h = harness(vec![Message::user("only")], |backend| backend).await;
    let state = h.controller.snapshot();
    let id = state.transcript[0].as_persisted().expect("persisted").id.clone();

    h.controller
        .synchronizer()
        .rewind_to(&id)
        .await
        .expect("rewind");
    assert_eq!(h.controller.snapshot().revision, state.revision);
}

#[tokio::test]
async fn edit_rewrites_content_and_current_variant() {
    let h = harness(
        vec![assistant_with_variants(&["a", "b"])],
        |backend| backend,
    )
    .await;
    let id = h.controller.snapshot().transcript[0]
        .as_persisted()
        .expect("persisted")
        .id
        .clone();

    h.controller
        .synchronizer()
        .edit(&id, "b, revised".into())
        .await
        .expect("edit");

    let state = h.controller.snapshot();
    let message = state.message(&id).expect("message");
    assert_eq!(message.content, "b, revised");
    assert_eq!(message.display_content(), "b, revised");
    assert_eq!(message.variants[0].content, "a");
}

#[tokio::test]
async fn failed_save_leaves_the_transcript_untouched() {
    let h = harness(vec![Message::user("keep")], |backend| backend).await;
    let id = h.controller.snapshot().transcript[0]
        .as_persisted()
        .expect("persisted")
        .id
        .clone();
    h.store.set_fail_saves(true);

    let result = h.controller.synchronizer().edit(&id, "changed".into()).await;
    assert!(matches!(result, Err(TurnError::Store(_))));
    assert_eq!(contents(&h.controller.snapshot()), vec!["keep"]);
}

#[tokio::test]
async fn swipes_clamp_at_both_ends() {
    let h = harness(
        vec![Message::user("hi"), assistant_with_variants(&["a", "b", "c"])],
        |backend| backend,
    )
    .await;
    let id = h.controller.snapshot().transcript[1]
        .as_persisted()
        .expect("persisted")
        .id
        .clone();
    let variants = h.controller.variants();
    let shown = |controller: &ChatController| {
        controller
            .snapshot()
            .message(&id)
            .map(|m| m.display_content().to_string())
    };

    assert!(!variants.swipe(&id, SwipeDirection::Next).await.expect("swipe"));
    assert_eq!(shown(&h.controller).as_deref(), Some("c"));

    assert!(variants.swipe(&id, SwipeDirection::Prev).await.expect("swipe"));
    assert!(variants.swipe(&id, SwipeDirection::Prev).await.expect("swipe"));
    assert_eq!(shown(&h.controller).as_deref(), Some("a"));
    assert!(!variants.swipe(&id, SwipeDirection::Prev).await.expect("swipe"));

    let stored = h.store.snapshot(&h.session_id).expect("stored");
    assert_eq!(stored.messages[1].display_content(), "a");
}

#[tokio::test]
async fn swipe_on_a_non_last_message_is_ignored() {
    let h = harness(
        vec![assistant_with_variants(&["a", "b"]), Message::user("hi")],
        |backend| backend,
    )
    .await;
    let id = h.controller.snapshot().transcript[0]
        .as_persisted()
        .expect("persisted")
        .id
        .clone();
    assert!(!h
        .controller
        .variants()
        .swipe(&id, SwipeDirection::Prev)
        .await
        .expect("swipe"));
}

#[tokio::test]
async fn scene_swipes_move_through_the_character_scenes() {
    let h = harness(vec![], |backend| backend).await;
    h.controller
        .start_session(create_test_character(), "Scenes", None, None)
        .await
        .expect("start session");
    let state = h.controller.snapshot();
    let scene_id = state.transcript[0].as_persisted().expect("scene").id.clone();

    let variants = h.controller.variants();
    assert!(variants.drag(&scene_id, -120.0).await.expect("drag"));
    let state = h.controller.snapshot();
    assert_eq!(contents(&state), vec!["A stormy harbor."]);
    assert_eq!(
        state.session.as_ref().and_then(|s| s.selected_scene_id.as_deref()),
        Some("scene-b")
    );

    assert!(!variants.drag(&scene_id, 10.0).await.expect("drag"));
    assert!(variants.swipe(&scene_id, SwipeDirection::Next).await.expect("swipe"));
    assert!(!variants.swipe(&scene_id, SwipeDirection::Next).await.expect("swipe"));
    assert_eq!(contents(&h.controller.snapshot()), vec!["A moonlit garden."]);
}

#[tokio::test]
async fn variant_selection_is_refused_while_regenerating() {
    let message = assistant_with_variants(&["a", "b"]);
    let first_variant = message.variants[0].id.clone();
    let h = harness(vec![Message::user("hi"), message], |backend| {
        backend.with_outcome(ScriptedOutcome::HangUntilAborted)
    })
    .await;
    let id = h.controller.snapshot().transcript[1]
        .as_persisted()
        .expect("persisted")
        .id
        .clone();
    let mut rx = h.controller.subscribe();

    let controller = h.controller.clone();
    let target = id.clone();
    let turn = tokio::spawn(async move { controller.regenerate(&target).await });
    wait_for(&mut rx, |state| state.regenerating_message_id.is_some()).await;

    let result = h
        .controller
        .variants()
        .apply_variant_selection(&id, &first_variant)
        .await;
    assert!(matches!(result, Err(TurnError::Busy)));

    let request_id = h.controller.active_request_id().expect("active request");
    h.controller.abort(&request_id).await;
    turn.await.expect("join").expect("turn");
}

#[tokio::test]
async fn edits_during_regeneration_cannot_persist_the_cleared_target() {
    let h = harness(
        vec![Message::user("q"), assistant_with_variants(&["A", "B"])],
        |backend| backend.with_outcome(ScriptedOutcome::HangUntilAborted),
    )
    .await;
    let state = h.controller.snapshot();
    let question = state.transcript[0].as_persisted().expect("persisted").id.clone();
    let target = state.transcript[1].as_persisted().expect("persisted").id.clone();
    let mut rx = h.controller.subscribe();

    let controller = h.controller.clone();
    let regenerated = target.clone();
    let turn = tokio::spawn(async move { controller.regenerate(&regenerated).await });
    wait_for(&mut rx, |state| state.regenerating_message_id.is_some()).await;

    let sync = h.controller.synchronizer();
    assert!(matches!(sync.toggle_pin(&question).await, Err(TurnError::Busy)));
    assert!(matches!(
        sync.edit(&question, "changed".into()).await,
        Err(TurnError::Busy)
    ));
    assert_eq!(
        h.store.snapshot(&h.session_id).expect("stored").messages[1].variants.len(),
        2
    );

    let request_id = h.controller.active_request_id().expect("active request");
    h.controller.abort(&request_id).await;
    turn.await.expect("join").expect("turn");

    let state = h.controller.snapshot();
    let message = state.message(&target).expect("target");
    assert_eq!(message.variants.len(), 2);
    assert_eq!(message.display_content(), "B");
    assert!(!state.message(&question).expect("question").is_pinned);
}

#[tokio::test]
async fn variant_selection_refreshes_the_open_panel() {
    let message = assistant_with_variants(&["a", "b"]);
    let first_variant = message.variants[0].id.clone();
    let h = harness(vec![message], |backend| backend).await;
    let id = h.controller.snapshot().transcript[0]
        .as_persisted()
        .expect("persisted")
        .id
        .clone();

    h.controller.open_message_action(&id).expect("open panel");
    h.controller
        .variants()
        .apply_variant_selection(&id, &first_variant)
        .await
        .expect("select");

    let state = h.controller.snapshot();
    let panel = state.message_action.as_ref().expect("panel");
    assert_eq!(panel.message.display_content(), "a");
    assert_eq!(panel.draft, "a");
    assert_eq!(panel.message.selected_variant_id.as_deref(), Some(first_variant.as_str()));
}

#[tokio::test]
async fn variant_selection_brings_the_variant_attachments_along() {
    let mut message = assistant_with_variants(&["sketch", "text only"]);
    message.variants[0].attachments = vec![Attachment {
        id: "img-1".into(),
        mime_type: "image/png".into(),
        data: "data:image/png;base64,AAAA".into(),
        filename: Some("sketch.png".into()),
    }];
    let first_variant = message.variants[0].id.clone();
    let expected = message.variants[0].attachments.clone();
    let h = harness(vec![message], |backend| backend).await;
    let id = h.controller.snapshot().transcript[0]
        .as_persisted()
        .expect("persisted")
        .id
        .clone();

    h.controller
        .variants()
        .apply_variant_selection(&id, &first_variant)
        .await
        .expect("select");

    let state = h.controller.snapshot();
    assert_eq!(state.message(&id).expect("message").attachments, expected);
    assert_eq!(
        h.store.snapshot(&h.session_id).expect("stored").messages[0].attachments,
        expected
    );
}

#[tokio::test]
async fn panel_edit_commits_through_the_store() {
    let h = harness(vec![Message::user("typo")], |backend| backend).await;
    let id = h.controller.snapshot().transcript[0]
        .as_persisted()
        .expect("persisted")
        .id
        .clone();

    h.controller.open_message_action(&id).expect("open panel");
    h.controller.set_message_action_mode(MessageActionMode::Edit);
    h.controller.set_message_action_draft("fixed");
    h.controller.commit_message_edit().await.expect("commit");

    let state = h.controller.snapshot();
    let panel = state.message_action.as_ref().expect("panel");
    assert_eq!(panel.mode, MessageActionMode::View);
    assert_eq!(panel.message.content, "fixed");
    assert_eq!(
        h.store.snapshot(&h.session_id).expect("stored").messages[0].content,
        "fixed"
    );

    h.controller.close_message_action();
    assert!(h.controller.snapshot().message_action.is_none());
}

#[tokio::test]
async fn reconciliation_after_abort_cleanup_is_a_no_op() {
    let h = harness(vec![], |backend| backend).await;
    let placeholder = crate::core::message::Placeholder::new(Role::Assistant, "", 1);
    let pid = placeholder.id.clone();
    h.controller.state().dispatch(TurnAction::AppendEntry(
        TranscriptEntry::Placeholder(placeholder),
    ));
    h.controller
        .state()
        .dispatch(TurnAction::RemoveEntry(EntryId::Placeholder(pid.clone())));

    h.controller.state().dispatch(TurnAction::ReplacePlaceholder {
        placeholder: pid,
        message: Message::assistant("late"),
    });
    assert!(h.controller.snapshot().transcript.is_empty());
}

#[test]
fn abort_phrases_match_case_insensitively() {
    let phrases = TurnSettings::default().aborted_phrases;
    assert!(is_abort_message("Error: Request Aborted by user", &phrases));
    assert!(!is_abort_message("API Error: rate limited", &phrases));
    assert!(!is_abort_message("anything", &[String::new()]));
}
