use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use chrono::Utc;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::ids::{RequestId, TraceId};

/// Ordered header multimap. Insertion order and duplicate names are
/// preserved; lookups are ASCII-case-insensitive.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    /// First value for `name`, if any.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Every value for `name`, in insertion order.
    pub fn get_all(&self, name: &str) -> Vec<&str> {
        self.0
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, String)> for Headers {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Raw body bytes. Serialized as base64 on the wire; text access is a
/// separate, best-effort view.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Body(Bytes);

impl Body {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Strict UTF-8 view. `None` when the body is not valid text.
    pub fn as_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.0).ok()
    }

    pub fn to_text_lossy(&self) -> String {
        String::from_utf8_lossy(&self.0).into_owned()
    }

    /// Cut the body down to at most `max` bytes. Byte-exact: a multi-byte
    /// character on the boundary is split. Returns true if anything was cut.
    pub fn truncate_to(&mut self, max: usize) -> bool {
        if self.0.len() <= max {
            return false;
        }
        self.0 = self.0.slice(..max);
        true
    }
}

impl From<&str> for Body {
    fn from(s: &str) -> Self {
        Self(Bytes::copy_from_slice(s.as_bytes()))
    }
}

impl From<Vec<u8>> for Body {
    fn from(v: Vec<u8>) -> Self {
        Self(Bytes::from(v))
    }
}

impl Serialize for Body {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for Body {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        let decoded = BASE64.decode(encoded.as_bytes()).map_err(D::Error::custom)?;
        Ok(Self(Bytes::from(decoded)))
    }
}

/// One captured outbound call. Created pending, then settled exactly once
/// with either a response or an error, never both.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestRecord {
    pub id: RequestId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<TraceId>,
    pub url: String,
    pub method: String,
    pub headers: Headers,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Body>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub body_truncated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
    /// Capture time, ms since the epoch.
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<ResponseData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timing: Option<TimingData>,
}

impl RequestRecord {
    pub fn new(url: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            id: RequestId::new(),
            trace_id: None,
            url: url.into(),
            method: method.into(),
            headers: Headers::new(),
            body: None,
            body_truncated: false,
            stack_trace: None,
            timestamp: Utc::now().timestamp_millis(),
            response: None,
            error: None,
            timing: None,
        }
    }

    pub fn with_trace(mut self, trace_id: TraceId) -> Self {
        self.trace_id = Some(trace_id);
        self
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_body(mut self, body: impl Into<Body>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_stack_trace(mut self, stack_trace: impl Into<String>) -> Self {
        self.stack_trace = Some(stack_trace.into());
        self
    }

    /// Cap the request body to `max` bytes, flagging truncation.
    pub fn cap_body(&mut self, max: usize) {
        if let Some(body) = self.body.as_mut() {
            if body.truncate_to(max) {
                self.body_truncated = true;
            }
        }
    }

    pub fn state(&self) -> RequestState {
        match (&self.response, &self.error) {
            (Some(_), _) => RequestState::Completed,
            (None, Some(_)) => RequestState::Failed,
            (None, None) => RequestState::Pending,
        }
    }
}

/// Terminal state of a captured call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestState {
    Pending,
    Completed,
    Failed,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseData {
    pub status_code: u16,
    pub status_message: String,
    pub headers: Headers,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Body>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub body_truncated: bool,
}

impl ResponseData {
    pub fn new(status_code: u16, status_message: impl Into<String>) -> Self {
        Self {
            status_code,
            status_message: status_message.into(),
            headers: Headers::new(),
            body: None,
            body_truncated: false,
        }
    }

    pub fn with_body(mut self, body: impl Into<Body>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Cap the response body to `max` bytes, flagging truncation.
    pub fn cap_body(&mut self, max: usize) {
        if let Some(body) = self.body.as_mut() {
            if body.truncate_to(max) {
                self.body_truncated = true;
            }
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorData {
    pub code: String,
    pub message: String,
}

impl ErrorData {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// Phase breakdown for one call. All durations in milliseconds.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimingData {
    /// Ms-epoch instant the request was issued.
    pub start: i64,
    pub total: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connect: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_byte: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_case_insensitive_lookup() {
        let mut headers = Headers::new();
        headers.append("Content-Type", "application/json");
        assert_eq!(headers.get("content-type"), Some("application/json"));
        assert_eq!(headers.get("CONTENT-TYPE"), Some("application/json"));
        assert_eq!(headers.get("accept"), None);
    }

    #[test]
    fn headers_preserve_order_and_duplicates() {
        let mut headers = Headers::new();
        headers.append("Set-Cookie", "a=1");
        headers.append("X-Other", "x");
        headers.append("set-cookie", "b=2");
        assert_eq!(headers.get("Set-Cookie"), Some("a=1"));
        assert_eq!(headers.get_all("Set-Cookie"), vec!["a=1", "b=2"]);
        assert_eq!(headers.len(), 3);

        let names: Vec<&str> = headers.iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["Set-Cookie", "X-Other", "set-cookie"]);
    }

    #[test]
    fn headers_serialize_as_pairs() {
        let mut headers = Headers::new();
        headers.append("Accept", "*/*");
        let json = serde_json::to_string(&headers).unwrap();
        assert_eq!(json, r#"[["Accept","*/*"]]"#);
    }

    #[test]
    fn body_base64_roundtrip() {
        let body = Body::new(vec![0u8, 159, 146, 150]);
        let json = serde_json::to_string(&body).unwrap();
        let parsed: Body = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, body);
    }

    #[test]
    fn body_text_views() {
        let text = Body::from("hello");
        assert_eq!(text.as_text(), Some("hello"));
        assert_eq!(text.to_text_lossy(), "hello");

        let binary = Body::new(vec![0xff, 0xfe]);
        assert_eq!(binary.as_text(), None);
        assert!(!binary.to_text_lossy().is_empty());
    }

    #[test]
    fn body_truncate_is_byte_exact() {
        let mut body = Body::from("a".repeat(200).as_str());
        assert!(body.truncate_to(100));
        assert_eq!(body.len(), 100);

        // 4-byte chars: a 10-byte cut lands mid-character
        let mut emoji = Body::from("🦀".repeat(5).as_str());
        assert!(emoji.truncate_to(10));
        assert_eq!(emoji.len(), 10);
        assert_eq!(emoji.as_text(), None);
    }

    #[test]
    fn body_truncate_under_limit_is_noop() {
        let mut body = Body::from("short");
        assert!(!body.truncate_to(100));
        assert_eq!(body.as_text(), Some("short"));
    }

    #[test]
    fn record_starts_pending() {
        let record = RequestRecord::new("https://api.example.com/users", "GET");
        assert_eq!(record.state(), RequestState::Pending);
        assert!(record.id.as_str().starts_with("req_"));
        assert!(record.timestamp > 0);
    }

    #[test]
    fn record_state_transitions() {
        let mut record = RequestRecord::new("https://api.example.com/users", "GET");
        record.response = Some(ResponseData::new(200, "OK"));
        assert_eq!(record.state(), RequestState::Completed);

        let mut failed = RequestRecord::new("https://api.example.com/users", "GET");
        failed.error = Some(ErrorData::new("ECONNREFUSED", "connection refused"));
        assert_eq!(failed.state(), RequestState::Failed);
    }

    #[test]
    fn record_serializes_camel_case() {
        let mut headers = Headers::new();
        headers.append("Content-Type", "application/json");
        let record = RequestRecord::new("https://api.example.com", "POST")
            .with_trace(TraceId::from_raw("trace_1"))
            .with_headers(headers)
            .with_body("payload")
            .with_stack_trace("at fetch (app.js:10)");
        let json = serde_json::to_value(&record).unwrap();
        assert!(json.get("traceId").is_some());
        assert!(json.get("body").is_some());
        assert_eq!(json["stackTrace"], "at fetch (app.js:10)");
        // falsy bodyTruncated is omitted
        assert!(json.get("bodyTruncated").is_none());
    }

    #[test]
    fn record_deserializes_with_missing_optionals() {
        let json = r#"{"id":"req_1","url":"https://x.dev","method":"GET","headers":[],"timestamp":1}"#;
        let record: RequestRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.state(), RequestState::Pending);
        assert!(!record.body_truncated);
    }

    #[test]
    fn cap_body_sets_flag() {
        let mut record = RequestRecord::new("https://x.dev", "POST").with_body("a".repeat(50).as_str());
        record.cap_body(10);
        assert!(record.body_truncated);
        assert_eq!(record.body.as_ref().unwrap().len(), 10);

        let mut response = ResponseData::new(200, "OK").with_body("tiny");
        response.cap_body(100);
        assert!(!response.body_truncated);
    }
}
