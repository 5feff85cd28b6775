use netlens_core::record::RequestRecord;
use netlens_core::TraceId;

/// Criteria for [`crate::RequestStore::query`]. Unset fields are
/// unconstrained; set fields combine with AND semantics.
#[derive(Clone, Debug, Default)]
pub struct RequestFilter {
    /// Exact trace correlation key.
    pub trace_id: Option<TraceId>,
    /// Substring match against the request URL.
    pub url_pattern: Option<String>,
    /// Exact HTTP method.
    pub method: Option<String>,
    /// Exact response status code.
    pub status_code: Option<u16>,
    /// Inclusive lower bound on the response status code.
    pub status_code_min: Option<u16>,
}

impl RequestFilter {
    pub(crate) fn matches(&self, record: &RequestRecord) -> bool {
        if let Some(trace_id) = &self.trace_id {
            if record.trace_id.as_ref() != Some(trace_id) {
                return false;
            }
        }
        if let Some(pattern) = &self.url_pattern {
            if !record.url.contains(pattern.as_str()) {
                return false;
            }
        }
        if let Some(method) = &self.method {
            if record.method != *method {
                return false;
            }
        }
        if let Some(code) = self.status_code {
            match &record.response {
                Some(response) if response.status_code == code => {}
                _ => return false,
            }
        }
        if let Some(min) = self.status_code_min {
            match &record.response {
                Some(response) if response.status_code >= min => {}
                _ => return false,
            }
        }
        true
    }
}
