//! End-to-end orchestrator scenarios against an in-process mock switch.

mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use common::mock_switch::MockSwitch;
use voxbridge_app::allowlist::Allowlist;
use voxbridge_app::calls::{CallManager, CallsConfig, OriginateRequest, SpeakParams};
use voxbridge_app::registry::{CallEvent, CallRegistry, CallState};
use voxbridge_switch::SwitchClient;
use voxbridge_tts::{TtsClient, TtsConfig};

struct Harness {
    switch: MockSwitch,
    manager: CallManager,
    _dispatch: tokio::task::JoinHandle<()>,
}

async fn harness_with_tts(tts_url: Option<String>) -> Harness {
    let mock = MockSwitch::start().await;
    let client = Arc::new(SwitchClient::new(mock.config()));
    let registry = CallRegistry::new();
    let tts = TtsClient::new(TtsConfig {
        url: tts_url,
        ..TtsConfig::default()
    });
    let manager = CallManager::new(
        client.clone(),
        registry,
        Allowlist::allow_all(),
        tts,
        None,
        CallsConfig {
            ring_delay: Duration::from_millis(100),
            transfer_timeout: Duration::from_millis(500),
            ..CallsConfig::default()
        },
    );
    let events = client.start_events();
    let dispatch_manager = manager.clone();
    let dispatch = tokio::spawn(async move { dispatch_manager.run(events).await });
    mock.wait_for_event_client().await;

    Harness {
        switch: mock,
        manager,
        _dispatch: dispatch,
    }
}

async fn harness() -> Harness {
    harness_with_tts(None).await
}

/// Collect events of the given kinds until `until` shows up or the timeout
/// elapses.
async fn collect_until(
    mut rx: broadcast::Receiver<CallEvent>,
    until: &str,
    timeout: Duration,
) -> Vec<CallEvent> {
    let mut seen = Vec::new();
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Ok(event)) => {
                let done = event.kind == until;
                seen.push(event);
                if done {
                    return seen;
                }
            }
            Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
            Ok(Err(broadcast::error::RecvError::Closed)) | Err(_) => return seen,
        }
    }
}

fn count(events: &[CallEvent], kind: &str) -> usize {
    events.iter().filter(|e| e.kind == kind).count()
}

/// A 16 kHz mono WAV of `seconds` of quiet noise, as the synthesizer would
/// return it.
fn test_wav(seconds: f64) -> Vec<u8> {
    let n = (16_000.0 * seconds) as usize;
    let samples: Vec<i16> = (0..n).map(|i| ((i % 64) as i16) - 32).collect();
    voxbridge_audio::write_wav(&samples, 16_000).unwrap()
}

async fn start_tts_server(wav: Vec<u8>) -> String {
    use axum::{routing::post, Router};
    let app = Router::new().route("/synthesize", post(move || async move { wav.clone() }));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    format!("http://{addr}/synthesize")
}

/// Bring one inbound call all the way to ready and return its id.
async fn ready_inbound_call(h: &Harness, channel_id: &str, caller: &str) -> String {
    let rx = h.manager.registry().subscribe();
    h.switch.push_inbound_channel(channel_id, caller);
    let events = collect_until(rx, "call.ready", Duration::from_secs(5)).await;
    assert!(
        count(&events, "call.ready") == 1,
        "call never became ready: {:?}",
        events.iter().map(|e| &e.kind).collect::<Vec<_>>()
    );
    events
        .iter()
        .find(|e| e.kind == "call.ready")
        .unwrap()
        .call_id
        .clone()
}

#[tokio::test]
async fn inbound_happy_path() {
    let h = harness().await;
    let rx = h.manager.registry().subscribe();

    h.switch.push_inbound_channel("ch-abc", "5551234");

    // Ring delay (100 ms) + greeting + beep (50 ms autofinish each) +
    // capture setup, with margin.
    let events = collect_until(rx, "call.audio_capture_started", Duration::from_secs(5)).await;

    assert_eq!(count(&events, "call.inbound"), 1);
    assert_eq!(count(&events, "call.answered"), 1);
    assert_eq!(count(&events, "call.ready"), 1);
    assert_eq!(count(&events, "call.audio_capture_error"), 0);
    assert_eq!(count(&events, "call.audio_capture_started"), 1);

    // The answer flow ran against the switch in order.
    assert_eq!(h.switch.requests_matching("/ring"), 1);
    assert_eq!(h.switch.requests_matching("/answer"), 1);
    assert_eq!(h.switch.requests_matching("sound%3Ahello-world"), 1);
    assert_eq!(h.switch.requests_matching("sound%3Abeep"), 1);

    // Capture acquired a snoop, an external-media channel and a bridge.
    assert_eq!(h.switch.requests_matching("/snoop/snoop-"), 1);
    assert_eq!(h.switch.requests_matching("externalMedia"), 1);
    assert!(h.switch.requests_matching("addChannel") >= 2);

    let record = &h.manager.registry().active()[0];
    assert_eq!(record.state, CallState::Ready);
    assert!(record.capture.is_some());
    assert_eq!(record.caller_number, "5551234");
}

#[tokio::test]
async fn inbound_denied_by_allowlist_is_released() {
    let mock = MockSwitch::start().await;
    let client = Arc::new(SwitchClient::new(mock.config()));
    let allow_file = tempfile::NamedTempFile::new().unwrap();
    std::fs::write(allow_file.path(), r#"{"inbound": ["5550000"], "outbound": []}"#).unwrap();
    let manager = CallManager::new(
        client.clone(),
        CallRegistry::new(),
        Allowlist::load(allow_file.path()).unwrap(),
        TtsClient::new(TtsConfig::default()),
        None,
        CallsConfig {
            ring_delay: Duration::from_millis(50),
            ..CallsConfig::default()
        },
    );
    let events = client.start_events();
    let m = manager.clone();
    tokio::spawn(async move { m.run(events).await });
    mock.wait_for_event_client().await;

    mock.push_inbound_channel("ch-bad", "5551234");
    tokio::time::sleep(Duration::from_millis(300)).await;

    // Released immediately: hangup sent, never answered.
    assert_eq!(mock.requests_matching("DELETE /ari/channels/ch-bad"), 1);
    assert_eq!(mock.requests_matching("/answer"), 0);
    let snapshot = manager.registry().snapshot();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].state, CallState::Failed);
}

#[tokio::test]
async fn outbound_rejected_endpoint_leaves_no_record() {
    let h = harness().await;

    let result = h
        .manager
        .originate(OriginateRequest {
            endpoint: "PJSIP/9999".into(),
            ..OriginateRequest::default()
        })
        .await;
    assert!(
        matches!(result, Err(voxbridge_app::CallError::NotFound("endpoint"))),
        "expected endpoint not-found, got {result:?}"
    );

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(h.manager.registry().snapshot().is_empty());
    // No channel was ever created.
    assert_eq!(h.switch.requests_matching("POST /ari/channels"), 0);
}

#[tokio::test]
async fn outbound_happy_path_reaches_ringing() {
    let h = harness().await;
    h.switch.add_endpoint("PJSIP", "alice");

    let record = h
        .manager
        .originate(OriginateRequest {
            endpoint: "PJSIP/alice".into(),
            caller_id: Some("7000".into()),
            ..OriginateRequest::default()
        })
        .await
        .unwrap();
    assert_eq!(record.state, CallState::Ringing);
    assert!(!record.channel_id.is_empty());

    // The switch reports the far end answering.
    h.switch.push_event(serde_json::json!({
        "type": "StasisStart",
        "args": [],
        "channel": { "id": record.channel_id, "state": "Up" },
    }));
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(
        h.manager.registry().get(&record.call_id).unwrap().state,
        CallState::Answered
    );
}

#[tokio::test]
async fn speak_without_tts_returns_not_implemented() {
    let h = harness().await;
    let call_id = ready_inbound_call(&h, "ch-tts", "5551234").await;

    let result = h
        .manager
        .speak(
            &call_id,
            SpeakParams {
                text: "hello".into(),
                voice: None,
                language: None,
                speed: None,
            },
        )
        .await;
    assert!(matches!(
        result,
        Err(voxbridge_app::CallError::NotImplemented(_))
    ));
    // No speaking state may persist.
    assert_eq!(
        h.manager.registry().get(&call_id).unwrap().state,
        CallState::Ready
    );
}

#[tokio::test]
async fn speak_streams_paced_pcm_to_the_media_socket() {
    let tts_url = start_tts_server(test_wav(0.5)).await;
    let h = harness_with_tts(Some(tts_url)).await;
    let call_id = ready_inbound_call(&h, "ch-speak", "5551234").await;

    let rx = h.manager.registry().subscribe();
    let result = h
        .manager
        .speak(
            &call_id,
            SpeakParams {
                text: "hello world".into(),
                voice: None,
                language: None,
                speed: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(result.voice, "alloy");
    let duration = result.duration_seconds.unwrap();
    assert!((duration - 0.5).abs() < 0.01, "duration {duration}");

    let events = collect_until(rx, "call.speak_finished", Duration::from_secs(2)).await;
    assert_eq!(count(&events, "call.playback_stream_started"), 1);
    assert_eq!(count(&events, "call.playback_stream_finished"), 1);
    assert_eq!(count(&events, "call.speak_error"), 0);

    // All PCM bytes arrived on the playback media socket; allow the mock a
    // moment to drain its receive loop.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let record = h.manager.registry().get(&call_id).unwrap();
    let playback = record.playback.expect("playback pipeline published");
    let conn = format!("conn-{}", playback.external_media_channel_id);
    assert_eq!(h.switch.media_bytes_received(&conn), 16_000);

    // Speaking reverted to ready.
    assert_eq!(record.state, CallState::Ready);
}

#[tokio::test]
async fn hangup_during_speak_cancels_and_tears_down_quickly() {
    let tts_url = start_tts_server(test_wav(5.0)).await;
    let h = harness_with_tts(Some(tts_url)).await;
    let call_id = ready_inbound_call(&h, "ch-hang", "5551234").await;

    let rx = h.manager.registry().subscribe();
    let speak_manager = h.manager.clone();
    let speak_call = call_id.clone();
    let speak = tokio::spawn(async move {
        speak_manager
            .speak(
                &speak_call,
                SpeakParams {
                    text: "a five second utterance".into(),
                    voice: None,
                    language: None,
                    speed: None,
                },
            )
            .await
    });

    tokio::time::sleep(Duration::from_millis(300)).await;
    let hangup_started = std::time::Instant::now();
    h.manager.hangup(&call_id, None).await.unwrap();
    let teardown_elapsed = hangup_started.elapsed();

    // The scheduler resolves without a speak error, and teardown of the
    // playback bridge and media channel completes within a second.
    assert!(
        teardown_elapsed < Duration::from_secs(1),
        "teardown took {teardown_elapsed:?}"
    );
    let _ = speak.await.unwrap();
    let events = collect_until(rx, "call.ended", Duration::from_secs(1)).await;
    assert_eq!(count(&events, "call.speak_error"), 0);
    assert_eq!(count(&events, "call.ended"), 1);

    assert!(h.switch.requests_matching("DELETE /ari/bridges/playbridge-") >= 1);
    assert!(h.switch.requests_matching("DELETE /ari/channels/ttsplay-") >= 1);
    assert_eq!(
        h.manager.registry().get(&call_id).unwrap().state,
        CallState::Ended
    );
}

#[tokio::test]
async fn back_to_back_speak_cancels_the_first() {
    let tts_url = start_tts_server(test_wav(3.0)).await;
    let h = harness_with_tts(Some(tts_url)).await;
    let call_id = ready_inbound_call(&h, "ch-twice", "5551234").await;

    let rx = h.manager.registry().subscribe();
    let first_manager = h.manager.clone();
    let first_call = call_id.clone();
    let first = tokio::spawn(async move {
        first_manager
            .speak(
                &first_call,
                SpeakParams {
                    text: "first".into(),
                    voice: None,
                    language: None,
                    speed: None,
                },
            )
            .await
    });
    tokio::time::sleep(Duration::from_millis(300)).await;

    h.manager
        .speak(
            &call_id,
            SpeakParams {
                text: "second".into(),
                voice: None,
                language: None,
                speed: None,
            },
        )
        .await
        .unwrap();
    let _ = first.await.unwrap();

    let events = collect_until(rx, "call.speak_finished", Duration::from_secs(2)).await;
    // Only the second utterance completed.
    assert_eq!(count(&events, "call.speak_finished"), 1);
    assert_eq!(count(&events, "call.speak_error"), 0);
    assert_eq!(
        h.manager.registry().get(&call_id).unwrap().state,
        CallState::Ready
    );
}

#[tokio::test]
async fn capture_start_on_ended_call_is_not_found_and_leaks_nothing() {
    let h = harness().await;
    let call_id = ready_inbound_call(&h, "ch-ended", "5551234").await;

    h.manager.hangup(&call_id, None).await.unwrap();
    let before = h.switch.requests_matching("/snoop/");

    let result = h.manager.start_capture(&call_id).await;
    assert!(
        matches!(result, Err(voxbridge_app::CallError::NotFound("call"))),
        "expected call-not-found, got {result:?}"
    );
    assert_eq!(h.switch.requests_matching("/snoop/"), before);
}

#[tokio::test]
async fn stop_capture_is_idempotent() {
    let h = harness().await;
    let call_id = ready_inbound_call(&h, "ch-stop", "5551234").await;

    // Let the auto-started capture finish installing first.
    for _ in 0..50 {
        if h.manager.registry().get(&call_id).unwrap().capture.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    h.manager.stop_capture(&call_id).await.unwrap();
    // A second stop on a call that is no longer capturing is a no-op.
    h.manager.stop_capture(&call_id).await.unwrap();
    assert!(h.manager.registry().get(&call_id).unwrap().capture.is_none());
}

#[tokio::test]
async fn transfer_timeout_orphans_no_bridge() {
    let h = harness().await;
    h.switch.add_endpoint("PJSIP", "bob");
    let call_id = ready_inbound_call(&h, "ch-xfer", "5551234").await;

    // The target never answers; the harness transfer timeout is 500 ms.
    let result = h
        .manager
        .transfer(&call_id, "PJSIP/bob".into(), None, None)
        .await;
    assert!(
        matches!(result, Err(voxbridge_app::CallError::Timeout(_))),
        "expected timeout, got {result:?}"
    );

    // No transfer bridge was ever created, and the target leg was hung up.
    assert_eq!(h.switch.requests_matching("bridgeId=transfer-"), 0);
    assert!(h.switch.requests_matching("DELETE /ari/channels/out-") >= 1);
}

#[tokio::test]
async fn remote_hangup_ends_the_call_and_releases_capture() {
    let h = harness().await;
    let call_id = ready_inbound_call(&h, "ch-bye", "5551234").await;
    for _ in 0..50 {
        if h.manager.registry().get(&call_id).unwrap().capture.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    h.switch.push_stasis_end("ch-bye");
    tokio::time::sleep(Duration::from_millis(500)).await;

    let record = h.manager.registry().get(&call_id).unwrap();
    assert_eq!(record.state, CallState::Ended);
    // Capture teardown released the mirror leg and the bridge.
    assert!(h.switch.requests_matching("DELETE /ari/channels/snoop-") >= 1);
    assert!(h.switch.requests_matching("DELETE /ari/channels/audiocap-") >= 1);
    assert!(h.switch.requests_matching("DELETE /ari/bridges/capbridge-") >= 1);
}

#[tokio::test]
async fn captured_frames_fan_out_to_the_event_stream() {
    let h = harness().await;
    let call_id = ready_inbound_call(&h, "ch-frames", "5551234").await;

    // Capture setup finishes shortly after ready.
    let mut capture = None;
    for _ in 0..50 {
        capture = h.manager.registry().get(&call_id).unwrap().capture;
        if capture.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    let capture = capture.expect("capture live");
    let conn = format!("conn-{}", capture.external_media_channel_id);

    let rx = h.manager.registry().subscribe();
    assert!(h.switch.send_media(&conn, vec![1u8; 640]));
    let events = collect_until(rx, "call.audio_frame", Duration::from_secs(2)).await;
    let frame = events.iter().find(|e| e.kind == "call.audio_frame").unwrap();
    assert_eq!(frame.call_id, call_id);
    assert_eq!(frame.data["sampleRate"], 16_000);
    assert_eq!(frame.data["sampleCount"], 320);
    // PCM rides along base64-encoded.
    let audio = frame.data["audio"].as_str().unwrap();
    assert!(!audio.is_empty());
}
