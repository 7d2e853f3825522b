//! WebSocket client of Supabase Realtime.
//!
//! Speaks the Phoenix channel protocol: one socket per channel, a `phx_join`
//! carrying the `postgres_changes` config, and a heartbeat on the `phoenix`
//! topic to keep the socket alive.

use std::time::Duration;

use async_stream::stream;
use futures::{stream::BoxStream, SinkExt, Stream, StreamExt};
use serde_json::{json, Value};
use tokio::time::{interval_at, sleep, timeout, Instant};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, info};

use crate::{
    client::SupabaseEndpoint,
    config::RealtimeConfig,
    error::FrameError,
    transport::{ChangeTransport, ChannelSpec, ChannelStatus, RawChange, TransportSignal},
};

const EVENT_JOIN: &str = "phx_join";
const EVENT_LEAVE: &str = "phx_leave";
const EVENT_REPLY: &str = "phx_reply";
const EVENT_ERROR: &str = "phx_error";
const EVENT_CLOSE: &str = "phx_close";
const EVENT_HEARTBEAT: &str = "heartbeat";
const EVENT_CHANGES: &str = "postgres_changes";
const EVENT_SYSTEM: &str = "system";
const TOPIC_PHOENIX: &str = "phoenix";

/////////////////////////////////////////////////////////////////////////////
// RealtimeClient
/////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Clone)]
pub struct RealtimeClient {
    endpoint: SupabaseEndpoint,
    schema: String,
    table: String,
    join_timeout: Duration,
    heartbeat_interval: Duration,
}

impl RealtimeClient {
    pub fn new(endpoint: SupabaseEndpoint, config: &RealtimeConfig) -> Self {
        Self {
            endpoint,
            schema: config.schema.clone(),
            table: config.table.clone(),
            join_timeout: config.join_timeout(),
            heartbeat_interval: config.heartbeat_interval(),
        }
    }

    fn join_payload(&self, spec: &ChannelSpec) -> Value {
        let changes: Vec<Value> = if spec.receives_all() {
            vec![json!({"event": "*", "schema": self.schema, "table": self.table})]
        } else {
            spec.filters
                .iter()
                .map(|filter| {
                    let mut config = json!({
                        "event": filter.event.to_string(),
                        "schema": self.schema,
                        "table": filter.table,
                    });
                    if let Some(column_filter) = &filter.filter {
                        config["filter"] = json!(column_filter.to_string());
                    }
                    config
                })
                .collect()
        };
        json!({
            "config": {
                "broadcast": {"ack": false, "self": false},
                "presence": {"key": ""},
                "postgres_changes": changes,
            },
            "access_token": self.endpoint.bearer_token(),
        })
    }

    fn channel(self, spec: ChannelSpec) -> impl Stream<Item = TransportSignal> + Send + 'static {
        stream! {
            let url = match self.endpoint.realtime_url() {
                Ok(url) => url,
                Err(e) => {
                    yield channel_error(e);
                    return;
                }
            };
            let mut socket = match timeout(self.join_timeout, connect_async(url.as_str())).await {
                Err(_) => {
                    debug!("Timed out connecting to {}", self.endpoint.url_prefix());
                    yield TransportSignal::Status(ChannelStatus::TimedOut);
                    return;
                }
                Ok(Err(e)) => {
                    yield channel_error(e);
                    return;
                }
                Ok(Ok((socket, _))) => socket,
            };

            let topic = format!("realtime:{}", spec.name);
            let mut refs = 0_u64;
            let mut next_ref = move || {
                refs += 1;
                refs.to_string()
            };
            let join_ref = next_ref();
            let join = PhoenixMessage::new(&topic, EVENT_JOIN, self.join_payload(&spec), Some(join_ref.clone()));
            if let Err(e) = socket.send(join.to_message()).await {
                yield channel_error(e);
                return;
            }
            debug!("Joining {topic} on {}", self.endpoint.url_prefix());

            let join_deadline = sleep(self.join_timeout);
            tokio::pin!(join_deadline);
            let mut heartbeat = interval_at(
                Instant::now() + self.heartbeat_interval,
                self.heartbeat_interval,
            );
            let mut joined = false;

            loop {
                let step = tokio::select! {
                    _ = &mut join_deadline, if !joined => Step::JoinTimedOut,
                    _ = heartbeat.tick() => Step::Heartbeat,
                    frame = socket.next() => Step::Frame(frame),
                };
                match step {
                    Step::JoinTimedOut => {
                        debug!("No reply to joining {topic} in {:?}", self.join_timeout);
                        yield TransportSignal::Status(ChannelStatus::TimedOut);
                        break;
                    }
                    Step::Heartbeat => {
                        let beat = PhoenixMessage::new(TOPIC_PHOENIX, EVENT_HEARTBEAT, json!({}), Some(next_ref()));
                        if let Err(e) = socket.send(beat.to_message()).await {
                            yield channel_error(e);
                            break;
                        }
                    }
                    Step::Frame(None) => {
                        yield TransportSignal::Status(ChannelStatus::ChannelError("socket closed".into()));
                        break;
                    }
                    Step::Frame(Some(Err(e))) => {
                        yield channel_error(e);
                        break;
                    }
                    Step::Frame(Some(Ok(Message::Close(frame)))) => {
                        let reason = frame.map(|f| f.reason.to_string()).unwrap_or_default();
                        yield TransportSignal::Status(ChannelStatus::ChannelError(format!("socket closed by server: {reason}")));
                        break;
                    }
                    Step::Frame(Some(Ok(Message::Text(text)))) => match decode_frame(text.as_str()) {
                        Ok(Inbound::Reply { reference, ok, reason }) if reference.as_deref() == Some(join_ref.as_str()) => {
                            if ok {
                                joined = true;
                                info!("Subscribed to {topic}");
                                yield TransportSignal::Status(ChannelStatus::Subscribed);
                            } else {
                                yield TransportSignal::Status(ChannelStatus::ChannelError(reason));
                                break;
                            }
                        }
                        Ok(Inbound::Change(change)) => {
                            yield TransportSignal::Change(change);
                        }
                        Ok(Inbound::ChannelError(reason)) => {
                            yield TransportSignal::Status(ChannelStatus::ChannelError(reason));
                            break;
                        }
                        Ok(Inbound::ChannelClosed) => {
                            yield TransportSignal::Status(ChannelStatus::Closed);
                            break;
                        }
                        Ok(Inbound::Reply { .. } | Inbound::Ignored) => (),
                        Err(e) => debug!("Ignoring a frame on {topic}: {e}"),
                    },
                    Step::Frame(Some(Ok(Message::Binary(bytes)))) => {
                        debug!("Ignoring a frame on {topic}: {}", FrameError::Binary(bytes.len()));
                    }
                    Step::Frame(Some(Ok(_))) => (), // ping/pong are answered by tungstenite
                }
            }

            let leave = PhoenixMessage::new(&topic, EVENT_LEAVE, json!({}), Some(next_ref()));
            socket.send(leave.to_message()).await.ok();
            socket.close(None).await.ok();
        }
    }
}

impl ChangeTransport for RealtimeClient {
    fn open(&self, spec: &ChannelSpec) -> BoxStream<'static, TransportSignal> {
        self.clone().channel(spec.clone()).boxed()
    }
}

enum Step<F> {
    JoinTimedOut,
    Heartbeat,
    Frame(Option<F>),
}

fn channel_error(e: impl std::fmt::Display) -> TransportSignal {
    TransportSignal::Status(ChannelStatus::ChannelError(e.to_string()))
}

/////////////////////////////////////////////////////////////////////////////
// Frames
/////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
struct PhoenixMessage {
    topic: String,
    event: String,
    #[serde(default)]
    payload: Value,
    #[serde(rename = "ref", default)]
    reference: Option<String>,
}

impl PhoenixMessage {
    fn new(topic: &str, event: &str, payload: Value, reference: Option<String>) -> Self {
        Self {
            topic: topic.into(),
            event: event.into(),
            payload,
            reference,
        }
    }

    fn to_message(&self) -> Message {
        // Serializing a struct of strings and a json Value cannot fail.
        Message::text(serde_json::to_string(self).unwrap_or_default())
    }
}

/// What a received frame means to the channel.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Reply {
        reference: Option<String>,
        ok: bool,
        reason: String,
    },
    Change(RawChange),
    ChannelError(String),
    ChannelClosed,
    Ignored,
}

pub fn decode_frame(text: &str) -> Result<Inbound, FrameError> {
    let message: PhoenixMessage = serde_json::from_str(text)?;
    let payload = &message.payload;
    let inbound = match message.event.as_str() {
        EVENT_REPLY => {
            let ok = payload["status"].as_str() == Some("ok");
            let reason = payload["response"]["reason"]
                .as_str()
                .unwrap_or("join rejected")
                .to_owned();
            Inbound::Reply {
                reference: message.reference,
                ok,
                reason,
            }
        }
        EVENT_CHANGES => {
            let data = &payload["data"];
            Inbound::Change(RawChange {
                event_type: data["type"].as_str().unwrap_or_default().to_owned(),
                record: non_empty(&data["record"]),
                old_record: non_empty(&data["old_record"]),
                commit_timestamp: data["commit_timestamp"].as_str().map(str::to_owned),
            })
        }
        EVENT_SYSTEM if payload["status"].as_str() == Some("error") => Inbound::ChannelError(
            payload["message"]
                .as_str()
                .unwrap_or("system error")
                .to_owned(),
        ),
        EVENT_ERROR => Inbound::ChannelError(format!("{} errored", message.topic)),
        EVENT_CLOSE => Inbound::ChannelClosed,
        _ => Inbound::Ignored,
    };
    Ok(inbound)
}

fn non_empty(value: &Value) -> Option<Value> {
    match value {
        Value::Null => None,
        Value::Object(map) if map.is_empty() => None,
        other => Some(other.clone()),
    }
}
