use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{RequestId, TraceId};
use crate::record::{Body, ErrorData, Headers, RequestRecord, ResponseData, TimingData};

/// Events pushed to viewer clients, tagged by `type` with the body under
/// `payload`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum WireEvent {
    #[serde(rename = "request:start")]
    RequestStart(RequestStartPayload),
    #[serde(rename = "request:complete")]
    RequestComplete(RequestCompletePayload),
    #[serde(rename = "request:error")]
    RequestError(RequestErrorPayload),
    #[serde(rename = "request:timing")]
    RequestTiming(RequestTimingPayload),
    /// Opaque trace data forwarded as-is.
    #[serde(rename = "server:trace")]
    ServerTrace(Value),
    /// Full snapshot sent to a late-joining viewer.
    #[serde(rename = "requests:initial")]
    RequestsInitial(Vec<RequestRecord>),
    #[serde(rename = "requests:clear")]
    RequestsClear,
    #[serde(rename = "control:pause")]
    ControlPause,
    #[serde(rename = "control:resume")]
    ControlResume,
}

impl WireEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::RequestStart(_) => "request:start",
            Self::RequestComplete(_) => "request:complete",
            Self::RequestError(_) => "request:error",
            Self::RequestTiming(_) => "request:timing",
            Self::ServerTrace(_) => "server:trace",
            Self::RequestsInitial(_) => "requests:initial",
            Self::RequestsClear => "requests:clear",
            Self::ControlPause => "control:pause",
            Self::ControlResume => "control:resume",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestStartPayload {
    pub id: RequestId,
    pub url: String,
    pub method: String,
    pub headers: Headers,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Body>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub body_truncated: bool,
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<TraceId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
}

impl From<&RequestRecord> for RequestStartPayload {
    fn from(record: &RequestRecord) -> Self {
        Self {
            id: record.id.clone(),
            url: record.url.clone(),
            method: record.method.clone(),
            headers: record.headers.clone(),
            body: record.body.clone(),
            body_truncated: record.body_truncated,
            timestamp: record.timestamp,
            trace_id: record.trace_id.clone(),
            stack_trace: record.stack_trace.clone(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestCompletePayload {
    pub id: RequestId,
    #[serde(flatten)]
    pub response: ResponseData,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestErrorPayload {
    pub id: RequestId,
    #[serde(flatten)]
    pub error: ErrorData,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestTimingPayload {
    pub id: RequestId,
    #[serde(flatten)]
    pub timing: TimingData,
}

/// Outer wire shape: `{ type, payload, timestamp }` with a ms-epoch stamp
/// taken at emission time.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(flatten)]
    pub event: WireEvent,
    pub timestamp: i64,
}

impl Envelope {
    pub fn now(event: WireEvent) -> Self {
        Self {
            event,
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    pub fn encode(&self) -> Option<String> {
        serde_json::to_string(self).ok()
    }
}

/// Control messages a viewer may send upstream. Any viewer's command
/// mutates the shared stream state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientCommand {
    #[serde(rename = "control:pause")]
    Pause,
    #[serde(rename = "control:resume")]
    Resume,
    #[serde(rename = "requests:clear")]
    Clear,
}

/// Decode an inbound viewer frame. Malformed JSON or an unrecognized type
/// yields `None`; the connection is never torn down over a bad message.
pub fn decode_client_message(raw: &str) -> Option<ClientCommand> {
    serde_json::from_str(raw).ok()
}
