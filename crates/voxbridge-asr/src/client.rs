use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use crate::types::{AsrConfig, AsrError, AsrEvent, Transcription};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Bound on queued outbound audio frames. At 20 ms per frame this is over a
/// second of audio; a server that far behind is better served by dropping.
const AUDIO_QUEUE_FRAMES: usize = 64;

/// Safety deadline for the flush-and-wait close sequence.
const FLUSH_DEADLINE: Duration = Duration::from_secs(2);

enum Command {
    Audio(Vec<u8>),
    Flush,
    Reset,
    Close(oneshot::Sender<()>),
}

/// Cloneable handle the capture pipeline uses to feed PCM frames.
///
/// Frames are dropped (with a debug line) when the queue is full; the
/// capture pipeline must never stall on a slow recognizer.
#[derive(Clone)]
pub struct AsrAudioSender {
    cmd_tx: mpsc::Sender<Command>,
}

impl AsrAudioSender {
    pub fn send(&self, pcm: Vec<u8>) {
        if let Err(e) = self.cmd_tx.try_send(Command::Audio(pcm)) {
            debug!("dropping audio frame for recognizer: {e}");
        }
    }
}

/// A live recognition session for one call.
pub struct AsrSession {
    call_id: String,
    cmd_tx: mpsc::Sender<Command>,
    closed: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

impl AsrSession {
    /// Connect and start the session task. Events flow out on `event_tx`.
    pub async fn connect(
        cfg: AsrConfig,
        call_id: impl Into<String>,
        event_tx: mpsc::Sender<AsrEvent>,
    ) -> Result<Self, AsrError> {
        let call_id = call_id.into();
        let socket = open_socket(&cfg).await?;

        let (cmd_tx, cmd_rx) = mpsc::channel(AUDIO_QUEUE_FRAMES);
        let closed = Arc::new(AtomicBool::new(false));
        let task = tokio::spawn(run(
            socket,
            cfg,
            call_id.clone(),
            cmd_rx,
            event_tx,
            closed.clone(),
        ));

        Ok(Self {
            call_id,
            cmd_tx,
            closed,
            task: Some(task),
        })
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    /// Handle for the capture pipeline to push audio with.
    pub fn audio_sender(&self) -> AsrAudioSender {
        AsrAudioSender {
            cmd_tx: self.cmd_tx.clone(),
        }
    }

    /// Ask the server for a final result over whatever it has buffered.
    pub async fn flush(&self) -> Result<(), AsrError> {
        self.cmd_tx
            .send(Command::Flush)
            .await
            .map_err(|_| AsrError::Closed)
    }

    /// Ask the server to discard buffered audio state.
    pub async fn reset(&self) -> Result<(), AsrError> {
        self.cmd_tx
            .send(Command::Reset)
            .await
            .map_err(|_| AsrError::Closed)
    }

    /// Close the session without losing the last partial utterance: flush,
    /// wait (bounded) for a final transcription, emit it, then drop the
    /// socket. Resolves cleanly if the deadline elapses or the socket is
    /// already gone.
    pub async fn close(mut self) {
        self.closed.store(true, Ordering::SeqCst);
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Close(ack_tx)).await.is_ok() {
            // The task enforces FLUSH_DEADLINE internally; this outer bound
            // only guards against the task dying mid-close.
            let _ = tokio::time::timeout(FLUSH_DEADLINE + Duration::from_secs(1), ack_rx).await;
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for AsrSession {
    fn drop(&mut self) {
        // A session dropped without close() still stops streaming; the task
        // exits when the command channel closes.
        self.closed.store(true, Ordering::SeqCst);
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn open_socket(cfg: &AsrConfig) -> Result<Socket, AsrError> {
    let (mut socket, _resp) = connect_async(cfg.url.as_str())
        .await
        .map_err(|e| AsrError::Connect(e.to_string()))?;

    // Lock the language before any audio; otherwise the server auto-detects
    // per chunk and flips languages on silence.
    let config_msg = serde_json::json!({ "action": "config", "language": cfg.language });
    socket
        .send(Message::text(config_msg.to_string()))
        .await
        .map_err(|e| AsrError::Connect(e.to_string()))?;
    Ok(socket)
}

enum Driven {
    /// Session finished on purpose (close or owner dropped).
    Done,
    /// The socket died under us.
    SocketLost,
}

type SocketSink = futures_util::stream::SplitSink<Socket, Message>;
type SocketStream = futures_util::stream::SplitStream<Socket>;

async fn run(
    socket: Socket,
    cfg: AsrConfig,
    call_id: String,
    mut cmd_rx: mpsc::Receiver<Command>,
    event_tx: mpsc::Sender<AsrEvent>,
    closed: Arc<AtomicBool>,
) {
    let (mut sink, mut stream) = socket.split();
    let mut attempts: u32 = 0;
    loop {
        match drive(&mut sink, &mut stream, &call_id, &mut cmd_rx, &event_tx).await {
            Driven::Done => return,
            Driven::SocketLost => {
                if closed.load(Ordering::SeqCst) {
                    return;
                }
                warn!(call_id, "recognition socket lost, scheduling reconnect");
                loop {
                    attempts += 1;
                    if cfg.max_reconnect_attempts != 0 && attempts > cfg.max_reconnect_attempts {
                        let _ = event_tx.send(AsrEvent::Disconnected { attempts }).await;
                        return;
                    }
                    tokio::time::sleep(cfg.reconnect_delay).await;
                    if closed.load(Ordering::SeqCst) {
                        return;
                    }
                    match open_socket(&cfg).await {
                        Ok(s) => {
                            debug!(call_id, attempts, "recognition socket reconnected");
                            (sink, stream) = s.split();
                            attempts = 0;
                            break;
                        }
                        Err(e) => {
                            warn!(call_id, attempts, "recognition reconnect failed: {e}");
                        }
                    }
                }
            }
        }
    }
}

async fn drive(
    sink: &mut SocketSink,
    stream: &mut SocketStream,
    call_id: &str,
    cmd_rx: &mut mpsc::Receiver<Command>,
    event_tx: &mpsc::Sender<AsrEvent>,
) -> Driven {
    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                None => {
                    let _ = sink.close().await;
                    return Driven::Done;
                }
                Some(Command::Audio(pcm)) => {
                    if sink.send(Message::binary(pcm)).await.is_err() {
                        return Driven::SocketLost;
                    }
                }
                Some(Command::Flush) => {
                    if send_action(sink, "flush").await.is_err() {
                        return Driven::SocketLost;
                    }
                }
                Some(Command::Reset) => {
                    if send_action(sink, "reset").await.is_err() {
                        return Driven::SocketLost;
                    }
                }
                Some(Command::Close(ack)) => {
                    flush_and_wait(sink, stream, call_id, event_tx).await;
                    let _ = sink.close().await;
                    let _ = ack.send(());
                    return Driven::Done;
                }
            },
            msg = stream.next() => match msg {
                Some(Ok(m)) if m.is_text() => {
                    let text = m.into_text().unwrap_or_default();
                    handle_server_message(&text, call_id, event_tx).await;
                }
                Some(Ok(m)) if m.is_close() => return Driven::SocketLost,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(call_id, "recognition socket error: {e}");
                    return Driven::SocketLost;
                }
                None => return Driven::SocketLost,
            },
        }
    }
}

/// Close-path ordering: flush, then surface any final transcription the
/// server produces before the deadline.
async fn flush_and_wait(
    sink: &mut SocketSink,
    stream: &mut SocketStream,
    call_id: &str,
    event_tx: &mpsc::Sender<AsrEvent>,
) {
    if send_action(sink, "flush").await.is_err() {
        return;
    }
    let deadline = tokio::time::Instant::now() + FLUSH_DEADLINE;
    loop {
        let msg = match tokio::time::timeout_at(deadline, stream.next()).await {
            Ok(Some(Ok(m))) if m.is_text() => m.into_text().unwrap_or_default(),
            Ok(Some(Ok(m))) if m.is_close() => return,
            Ok(Some(Ok(_))) => continue,
            Ok(Some(Err(_))) | Ok(None) => return,
            // Deadline elapsed without a final result; resolve anyway.
            Err(_) => return,
        };
        if handle_server_message(&msg, call_id, event_tx).await {
            return;
        }
    }
}

async fn send_action(
    sink: &mut SocketSink,
    action: &str,
) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    let msg = serde_json::json!({ "action": action });
    sink.send(Message::text(msg.to_string())).await
}

/// One inbound server message. Returns true when it carried a final
/// transcription.
async fn handle_server_message(
    text: &str,
    call_id: &str,
    event_tx: &mpsc::Sender<AsrEvent>,
) -> bool {
    #[derive(Deserialize)]
    struct Raw {
        status: Option<String>,
        error: Option<String>,
        text: Option<String>,
        #[serde(default)]
        is_partial: bool,
        #[serde(default)]
        is_final: bool,
    }

    let raw: Raw = match serde_json::from_str(text) {
        Ok(r) => r,
        Err(e) => {
            warn!(call_id, "unparseable recognition message ({e}): {text}");
            return false;
        }
    };

    if let Some(status) = raw.status {
        debug!(call_id, status, "recognition status");
        return false;
    }
    if let Some(error) = raw.error {
        warn!(call_id, error, "recognition server error");
        let _ = event_tx.send(AsrEvent::ServerError(error)).await;
        return false;
    }
    if let Some(t) = raw.text {
        let transcription = Transcription {
            text: t,
            is_partial: raw.is_partial,
            is_final: raw.is_final,
        };
        let is_final = transcription.is_final;
        let _ = event_tx.send(AsrEvent::Transcription(transcription)).await;
        return is_final;
    }
    debug!(call_id, "recognition message with no known shape: {text}");
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    fn test_cfg(url: String) -> AsrConfig {
        AsrConfig {
            url,
            language: "English".into(),
            reconnect_delay: Duration::from_millis(50),
            max_reconnect_attempts: 3,
        }
    }

    async fn bind() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        (listener, url)
    }

    #[tokio::test]
    async fn config_action_arrives_before_audio() {
        let (listener, url) = bind().await;
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            let first = ws.next().await.unwrap().unwrap();
            let second = ws.next().await.unwrap().unwrap();
            (first, second)
        });

        let (event_tx, _event_rx) = mpsc::channel(8);
        let session = AsrSession::connect(test_cfg(url), "call-1", event_tx)
            .await
            .unwrap();
        session.audio_sender().send(vec![0u8; 640]);

        let (first, second) = server.await.unwrap();
        let cfg: serde_json::Value = serde_json::from_str(first.to_text().unwrap()).unwrap();
        assert_eq!(cfg["action"], "config");
        assert_eq!(cfg["language"], "English");
        assert!(second.is_binary());
        assert_eq!(second.into_data().len(), 640);
    }

    #[tokio::test]
    async fn transcriptions_are_forwarded() {
        let (listener, url) = bind().await;
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            let _config = ws.next().await;
            ws.send(Message::text(
                r#"{"text":"hel","is_partial":true,"is_final":false}"#,
            ))
            .await
            .unwrap();
            ws.send(Message::text(r#"{"status":"buffer_reset"}"#))
                .await
                .unwrap();
            ws.send(Message::text(r#"{"error":"decoder stalled"}"#))
                .await
                .unwrap();
            // Keep the socket open until the client goes away.
            while ws.next().await.is_some() {}
        });

        let (event_tx, mut event_rx) = mpsc::channel(8);
        let _session = AsrSession::connect(test_cfg(url), "call-1", event_tx)
            .await
            .unwrap();

        match event_rx.recv().await.unwrap() {
            AsrEvent::Transcription(t) => {
                assert_eq!(t.text, "hel");
                assert!(t.is_partial);
            }
            other => panic!("expected transcription, got {other:?}"),
        }
        // Status messages are logged, not forwarded; the error comes next.
        match event_rx.recv().await.unwrap() {
            AsrEvent::ServerError(e) => assert_eq!(e, "decoder stalled"),
            other => panic!("expected server error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn close_flushes_and_emits_final_before_returning() {
        let (listener, url) = bind().await;
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            let _config = ws.next().await;
            // Wait for the flush action, delay like a real decoder, then
            // answer with the final result.
            loop {
                match ws.next().await {
                    Some(Ok(m)) if m.is_text() => {
                        let v: serde_json::Value =
                            serde_json::from_str(m.to_text().unwrap()).unwrap();
                        if v["action"] == "flush" {
                            tokio::time::sleep(Duration::from_millis(200)).await;
                            ws.send(Message::text(
                                r#"{"text":"hello world","is_partial":false,"is_final":true}"#,
                            ))
                            .await
                            .unwrap();
                        }
                    }
                    _ => break,
                }
            }
        });

        let (event_tx, mut event_rx) = mpsc::channel(8);
        let session = AsrSession::connect(test_cfg(url), "call-1", event_tx)
            .await
            .unwrap();
        session.close().await;

        // The final transcription must already be in the channel once
        // close() has resolved.
        match event_rx.try_recv().expect("final emitted before close returned") {
            AsrEvent::Transcription(t) => {
                assert_eq!(t.text, "hello world");
                assert!(t.is_final);
            }
            other => panic!("expected transcription, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn close_resolves_when_server_never_answers_flush() {
        let (listener, url) = bind().await;
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            // Swallow everything, never answer.
            while ws.next().await.is_some() {}
        });

        let (event_tx, _event_rx) = mpsc::channel(8);
        let session = AsrSession::connect(test_cfg(url), "call-1", event_tx)
            .await
            .unwrap();

        let started = std::time::Instant::now();
        session.close().await;
        let elapsed = started.elapsed();
        assert!(
            elapsed >= FLUSH_DEADLINE && elapsed < FLUSH_DEADLINE + Duration::from_secs(1),
            "close should resolve at the flush deadline, took {elapsed:?}"
        );
    }

    #[tokio::test]
    async fn dropped_socket_reconnects_and_resumes() {
        let (listener, url) = bind().await;
        let server = tokio::spawn(async move {
            // First connection: accept the config, then slam the door.
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            let _config = ws.next().await;
            drop(ws);

            // Second connection: the reconnect. Expect config again, then
            // audio keeps flowing.
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            let config = ws.next().await.unwrap().unwrap();
            let audio = ws.next().await.unwrap().unwrap();
            (config, audio)
        });

        let (event_tx, _event_rx) = mpsc::channel(8);
        let session = AsrSession::connect(test_cfg(url), "call-1", event_tx)
            .await
            .unwrap();

        // Feed audio across the drop; frames sent into the dead socket are
        // allowed to be lost, so keep sending until the reconnect lands.
        let sender = session.audio_sender();
        let feeder = tokio::spawn(async move {
            for _ in 0..100 {
                sender.send(vec![0u8; 320]);
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        });

        let (config, audio) = server.await.unwrap();
        feeder.abort();
        let v: serde_json::Value = serde_json::from_str(config.to_text().unwrap()).unwrap();
        assert_eq!(v["action"], "config", "config must be re-sent on reconnect");
        assert!(audio.is_binary());
    }
}
