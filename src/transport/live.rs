//! WebSocket transport for live audio conversations
//!
//! Speaks the bidirectional streaming protocol of the Gemini Live API:
//! a `setup` message, base64 PCM chunks in `realtimeInput`, and
//! `serverContent` messages carrying synthesized audio and turn signals.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures::{SinkExt, StreamExt};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use super::{Connection, Connector, Transport, TransportEvent};
use crate::config::LiveConfig;
use crate::voice::{INPUT_SAMPLE_RATE, OUTPUT_SAMPLE_RATE};
use crate::{Error, Result};

/// Longest a close waits for queued frames and the close handshake
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Opens live conversations over WebSocket
pub struct LiveConnector {
    config: LiveConfig,
    input_sample_rate: u32,
}

impl LiveConnector {
    #[must_use]
    pub const fn new(config: LiveConfig) -> Self {
        Self {
            config,
            input_sample_rate: INPUT_SAMPLE_RATE,
        }
    }

    /// Override the rate advertised for outbound audio
    #[must_use]
    pub const fn with_input_sample_rate(mut self, sample_rate: u32) -> Self {
        self.input_sample_rate = sample_rate;
        self
    }

    /// Endpoint with the API key appended to any existing query
    fn endpoint(&self, api_key: &str) -> Result<Url> {
        let mut url = Url::parse(&self.config.url)
            .map_err(|e| Error::Connection(format!("invalid live url {}: {e}", self.config.url)))?;
        url.query_pairs_mut().append_pair("key", api_key);
        Ok(url)
    }

    fn setup_message(&self) -> ClientMessage {
        ClientMessage::Setup(Setup {
            model: self.config.model.clone(),
            generation_config: GenerationConfig {
                response_modalities: vec!["AUDIO".to_string()],
                speech_config: SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: self.config.voice.clone(),
                        },
                    },
                },
            },
            system_instruction: self.config.system_instruction.as_ref().map(|text| Content {
                parts: vec![Part {
                    text: Some(text.clone()),
                    inline_data: None,
                }],
            }),
        })
    }
}

#[async_trait]
impl Connector for LiveConnector {
    async fn connect(&self) -> Result<Connection> {
        let api_key = self
            .config
            .api_key
            .as_ref()
            .ok_or_else(|| Error::Connection("no API key configured".to_string()))?;

        let url = self.endpoint(api_key.expose_secret())?;
        tracing::debug!(endpoint = %self.config.url, model = %self.config.model, "connecting live transport");

        let (ws, _response) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| Error::Connection(format!("websocket handshake failed: {e}")))?;
        let (mut sink, mut stream) = ws.split();

        let setup = serde_json::to_string(&self.setup_message())?;
        sink.send(Message::Text(setup))
            .await
            .map_err(|e| Error::Connection(format!("failed to send setup: {e}")))?;

        // Nothing but setupComplete is expected before the conversation opens
        loop {
            let message = stream
                .next()
                .await
                .ok_or_else(|| Error::Connection("connection closed during setup".to_string()))?
                .map_err(|e| Error::Connection(e.to_string()))?;

            match message {
                Message::Text(text) => {
                    if is_setup_complete(text.as_bytes()) {
                        break;
                    }
                }
                Message::Binary(bytes) => {
                    if is_setup_complete(&bytes) {
                        break;
                    }
                }
                Message::Close(frame) => {
                    let reason = frame.map(|f| f.reason.to_string()).unwrap_or_default();
                    return Err(Error::Connection(format!("setup rejected: {reason}")));
                }
                _ => {}
            }
        }
        tracing::debug!("live transport setup complete");

        let (reader_tx, events_rx) = mpsc::unbounded_channel();
        let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<Outgoing>();
        let mime_type = format!("audio/pcm;rate={}", self.input_sample_rate);

        let writer = tokio::spawn(async move {
            while let Some(outgoing) = outgoing_rx.recv().await {
                match outgoing {
                    Outgoing::Audio(frame) => {
                        let message = ClientMessage::RealtimeInput(RealtimeInput {
                            media_chunks: vec![Blob {
                                mime_type: mime_type.clone(),
                                data: BASE64.encode(&frame),
                            }],
                        });
                        let text = match serde_json::to_string(&message) {
                            Ok(text) => text,
                            Err(e) => {
                                tracing::warn!(error = %e, "failed to encode audio message");
                                continue;
                            }
                        };
                        if let Err(e) = sink.send(Message::Text(text)).await {
                            tracing::warn!(error = %e, "live transport send failed");
                            break;
                        }
                    }
                    Outgoing::Close => {
                        let _ = sink.send(Message::Close(None)).await;
                        let _ = sink.close().await;
                        break;
                    }
                }
            }
        });

        let reader = tokio::spawn(async move {
            let _ = reader_tx.send(TransportEvent::Opened);
            while let Some(message) = stream.next().await {
                let bytes = match message {
                    Ok(Message::Text(text)) => text.into_bytes(),
                    Ok(Message::Binary(bytes)) => bytes,
                    Ok(Message::Close(frame)) => {
                        let reason = frame.map(|f| f.reason.to_string()).filter(|r| !r.is_empty());
                        let _ = reader_tx.send(TransportEvent::Closed { reason });
                        return;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        let _ = reader_tx.send(TransportEvent::Error(e.to_string()));
                        return;
                    }
                };

                match parse_server_message(&bytes) {
                    Ok(events) => {
                        for event in events {
                            if reader_tx.send(event).is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => tracing::trace!(error = %e, "ignoring unrecognized server message"),
                }
            }
            let _ = reader_tx.send(TransportEvent::Closed { reason: None });
        });

        let transport = LiveTransport {
            outgoing: outgoing_tx,
            closed: AtomicBool::new(false),
            tasks: Mutex::new(Some((writer, reader))),
        };

        Ok(Connection {
            transport: std::sync::Arc::new(transport),
            events: events_rx,
        })
    }
}

enum Outgoing {
    Audio(Vec<u8>),
    Close,
}

/// Outbound half of a live WebSocket conversation
struct LiveTransport {
    outgoing: mpsc::UnboundedSender<Outgoing>,
    closed: AtomicBool,
    tasks: Mutex<Option<(JoinHandle<()>, JoinHandle<()>)>>,
}

#[async_trait]
impl Transport for LiveTransport {
    async fn send(&self, frame: Vec<u8>) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Transport("transport is closed".to_string()));
        }
        self.outgoing
            .send(Outgoing::Audio(frame))
            .map_err(|_| Error::Transport("websocket writer has stopped".to_string()))
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.outgoing.send(Outgoing::Close);

        let tasks = self.tasks.lock().ok().and_then(|mut tasks| tasks.take());
        if let Some((mut writer, reader)) = tasks {
            reader.abort();
            match tokio::time::timeout(CLOSE_TIMEOUT, &mut writer).await {
                Ok(Err(e)) if e.is_panic() => {
                    tracing::warn!(error = %e, "websocket writer panicked");
                }
                Ok(_) => {}
                Err(_) => {
                    tracing::warn!(timeout = ?CLOSE_TIMEOUT, "websocket writer stalled, dropping connection");
                    writer.abort();
                }
            }
        }
        tracing::debug!("live transport closed");
    }
}

impl Drop for LiveTransport {
    fn drop(&mut self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            if let Some((writer, reader)) = tasks.take() {
                writer.abort();
                reader.abort();
            }
        }
    }
}

/// Map one server message onto transport events
///
/// A single message may carry audio and a turn signal together; audio is
/// emitted first.
///
/// # Errors
///
/// Returns `Serialization` if the message is not valid JSON
pub fn parse_server_message(bytes: &[u8]) -> Result<Vec<TransportEvent>> {
    let message: ServerMessage = serde_json::from_slice(bytes)?;
    let mut events = Vec::new();

    if let Some(content) = message.server_content {
        let parts = content.model_turn.map(|turn| turn.parts).unwrap_or_default();
        for inline in parts.into_iter().filter_map(|part| part.inline_data) {
            if !inline.mime_type.starts_with("audio/pcm") {
                continue;
            }
            match BASE64.decode(inline.data.as_bytes()) {
                Ok(data) => events.push(TransportEvent::AudioChunk {
                    data,
                    sample_rate: sample_rate_from_mime(&inline.mime_type),
                }),
                Err(e) => tracing::warn!(error = %e, "dropping audio chunk with invalid base64"),
            }
        }
        if content.interrupted {
            events.push(TransportEvent::Interrupted);
        }
        if content.turn_complete {
            events.push(TransportEvent::TurnComplete);
        }
    }

    if message.go_away.is_some() {
        tracing::debug!("server announced it will disconnect soon");
    }

    Ok(events)
}

fn is_setup_complete(bytes: &[u8]) -> bool {
    serde_json::from_slice::<ServerMessage>(bytes).is_ok_and(|m| m.setup_complete.is_some())
}

/// Parse `rate=` from a mime type such as `audio/pcm;rate=24000`
fn sample_rate_from_mime(mime_type: &str) -> u32 {
    mime_type
        .split(';')
        .filter_map(|param| param.trim().strip_prefix("rate="))
        .find_map(|rate| rate.parse().ok())
        .unwrap_or(OUTPUT_SAMPLE_RATE)
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
enum ClientMessage {
    Setup(Setup),
    RealtimeInput(RealtimeInput),
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Setup {
    model: String,
    generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    response_modalities: Vec<String>,
    speech_config: SpeechConfig,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SpeechConfig {
    voice_config: VoiceConfig,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct VoiceConfig {
    prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PrebuiltVoiceConfig {
    voice_name: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RealtimeInput {
    media_chunks: Vec<Blob>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Blob {
    mime_type: String,
    data: String,
}

#[derive(Serialize, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    inline_data: Option<Blob>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerMessage {
    #[serde(default)]
    setup_complete: Option<serde_json::Value>,
    #[serde(default)]
    server_content: Option<ServerContent>,
    #[serde(default)]
    go_away: Option<serde_json::Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerContent {
    #[serde(default)]
    model_turn: Option<Content>,
    #[serde(default)]
    interrupted: bool,
    #[serde(default)]
    turn_complete: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connector() -> LiveConnector {
        LiveConnector::new(LiveConfig {
            system_instruction: Some("be brief".to_string()),
            ..LiveConfig::default()
        })
    }

    fn endpoint(url: &str) -> String {
        LiveConnector::new(LiveConfig {
            url: url.to_string(),
            ..LiveConfig::default()
        })
        .endpoint("a b&c")
        .unwrap()
        .to_string()
    }

    #[test]
    fn test_endpoint_appends_encoded_key() {
        assert_eq!(endpoint("ws://127.0.0.1:9000"), "ws://127.0.0.1:9000/?key=a+b%26c");
        assert_eq!(
            endpoint("wss://host/live?alt=json"),
            "wss://host/live?alt=json&key=a+b%26c"
        );
    }

    #[test]
    fn test_endpoint_rejects_garbage() {
        let connector = LiveConnector::new(LiveConfig {
            url: "not a url".to_string(),
            ..LiveConfig::default()
        });
        assert!(matches!(connector.endpoint("k"), Err(Error::Connection(_))));
    }

    #[test]
    fn test_setup_message_shape() {
        let json = serde_json::to_value(connector().setup_message()).unwrap();
        let setup = &json["setup"];
        assert_eq!(setup["generationConfig"]["responseModalities"][0], "AUDIO");
        assert!(
            setup["generationConfig"]["speechConfig"]["voiceConfig"]["prebuiltVoiceConfig"]["voiceName"]
                .is_string()
        );
        assert_eq!(setup["systemInstruction"]["parts"][0]["text"], "be brief");
    }

    #[test]
    fn test_realtime_input_shape() {
        let message = ClientMessage::RealtimeInput(RealtimeInput {
            media_chunks: vec![Blob {
                mime_type: "audio/pcm;rate=16000".to_string(),
                data: BASE64.encode([1u8, 0]),
            }],
        });
        let json = serde_json::to_value(message).unwrap();
        assert_eq!(
            json["realtimeInput"]["mediaChunks"][0]["mimeType"],
            "audio/pcm;rate=16000"
        );
        assert_eq!(json["realtimeInput"]["mediaChunks"][0]["data"], "AQA=");
    }

    #[test]
    fn test_parse_audio_chunk() {
        let raw = br#"{"serverContent":{"modelTurn":{"parts":[{"inlineData":{"mimeType":"audio/pcm;rate=24000","data":"AQACAA=="}}]}}}"#;
        let events = parse_server_message(raw).unwrap();
        assert_eq!(
            events,
            vec![TransportEvent::AudioChunk {
                data: vec![1, 0, 2, 0],
                sample_rate: 24_000
            }]
        );
    }

    #[test]
    fn test_parse_interrupted_and_turn_complete() {
        let events = parse_server_message(br#"{"serverContent":{"interrupted":true}}"#).unwrap();
        assert_eq!(events, vec![TransportEvent::Interrupted]);

        let events = parse_server_message(br#"{"serverContent":{"turnComplete":true}}"#).unwrap();
        assert_eq!(events, vec![TransportEvent::TurnComplete]);
    }

    #[test]
    fn test_parse_audio_before_turn_complete() {
        let raw = br#"{"serverContent":{"modelTurn":{"parts":[{"inlineData":{"mimeType":"audio/pcm","data":"AAA="}}]},"turnComplete":true}}"#;
        let events = parse_server_message(raw).unwrap();
        assert_eq!(events.len(), 2);
        assert!(matches!(
            events[0],
            TransportEvent::AudioChunk { sample_rate: 24_000, .. }
        ));
        assert_eq!(events[1], TransportEvent::TurnComplete);
    }

    #[test]
    fn test_parse_skips_text_parts_and_bad_base64() {
        let raw = br#"{"serverContent":{"modelTurn":{"parts":[{"text":"hi"},{"inlineData":{"mimeType":"audio/pcm","data":"!!"}}]}}}"#;
        assert!(parse_server_message(raw).unwrap().is_empty());
    }

    #[test]
    fn test_parse_rejects_non_json() {
        assert!(parse_server_message(b"not json").is_err());
    }

    #[test]
    fn test_setup_complete_detection() {
        assert!(is_setup_complete(br#"{"setupComplete":{}}"#));
        assert!(!is_setup_complete(br#"{"serverContent":{}}"#));
    }

    #[test]
    fn test_sample_rate_from_mime() {
        assert_eq!(sample_rate_from_mime("audio/pcm;rate=16000"), 16_000);
        assert_eq!(sample_rate_from_mime("audio/pcm; rate=44100"), 44_100);
        assert_eq!(sample_rate_from_mime("audio/pcm"), OUTPUT_SAMPLE_RATE);
    }
}
