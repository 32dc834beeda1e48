//! CloudEvents envelope in binary (`ce-*` headers) or structured (`application/cloudevents+json`) mode.

use axum::http::{header::CONTENT_TYPE, HeaderMap};
use base64::Engine;
use serde::Deserialize;
use serde_json::Value;

use crate::error::IngressError;

const SPEC_VERSIONS: [&str; 2] = ["1.0", "0.3"];
const STRUCTURED: &str = "application/cloudevents+json";
const BATCH: &str = "application/cloudevents-batch+json";

#[derive(Debug, Clone, PartialEq)]
pub struct CloudEvent {
    pub id: String,
    pub event_type: String,
    pub source: String,
    pub subject: Option<String>,
    pub data_content_type: Option<String>,
    /// Decoded payload; `Null` when the event carries none.
    pub data: Value,
}

#[derive(Deserialize)]
struct Structured {
    #[serde(default)]
    specversion: String,
    #[serde(default)]
    id: String,
    #[serde(default, rename = "type")]
    event_type: String,
    #[serde(default)]
    source: String,
    #[serde(default)]
    subject: Option<String>,
    #[serde(default)]
    datacontenttype: Option<String>,
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    data_base64: Option<String>,
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(str::trim).filter(|v| !v.is_empty())
}

fn is_json(content_type: Option<&str>) -> bool {
    match content_type {
        None => true,
        Some(ct) => {
            let mime = ct.split(';').next().unwrap_or("").trim().to_ascii_lowercase();
            mime == "application/json" || mime == "text/json" || mime.ends_with("+json")
        }
    }
}

fn decode_data(bytes: &[u8], content_type: Option<&str>) -> Result<Value, IngressError> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Null);
    }
    if is_json(content_type) {
        return serde_json::from_slice(bytes).map_err(|e| IngressError::InvalidEvent(format!("data is not valid JSON: {e}")));
    }
    Ok(Value::String(String::from_utf8_lossy(bytes).into_owned()))
}

impl CloudEvent {
    /// Parse either transport mode. Nothing is mutated on failure.
    pub fn from_http(headers: &HeaderMap, body: &[u8]) -> Result<Self, IngressError> {
        let content_type = header(headers, CONTENT_TYPE.as_str());
        let mime = content_type.map(|c| c.split(';').next().unwrap_or("").trim().to_ascii_lowercase());
        match mime.as_deref() {
            Some(BATCH) => Err(IngressError::InvalidEvent("batched CloudEvents are not supported".into())),
            Some(STRUCTURED) => Self::structured(body),
            _ => Self::binary(headers, content_type, body),
        }
    }

    fn binary(headers: &HeaderMap, content_type: Option<&str>, body: &[u8]) -> Result<Self, IngressError> {
        let spec = header(headers, "ce-specversion")
            .ok_or_else(|| IngressError::InvalidEvent("missing ce-specversion header".into()))?;
        check_version(spec)?;
        let required = |name: &str| {
            header(headers, name).map(str::to_string).ok_or_else(|| IngressError::InvalidEvent(format!("missing {name} header")))
        };
        Ok(Self {
            id: required("ce-id")?,
            event_type: required("ce-type")?,
            source: required("ce-source")?,
            subject: header(headers, "ce-subject").map(str::to_string),
            data_content_type: content_type.map(str::to_string),
            data: decode_data(body, content_type)?,
        })
    }

    fn structured(body: &[u8]) -> Result<Self, IngressError> {
        let raw: Structured = serde_json::from_slice(body).map_err(|e| IngressError::InvalidEvent(format!("invalid structured event: {e}")))?;
        check_version(&raw.specversion)?;
        for (field, value) in [("id", &raw.id), ("type", &raw.event_type), ("source", &raw.source)] {
            if value.trim().is_empty() {
                return Err(IngressError::InvalidEvent(format!("missing {field} attribute")));
            }
        }
        let data = match (raw.data, raw.data_base64) {
            (Some(data), _) => data,
            (None, Some(encoded)) => {
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(encoded.trim())
                    .map_err(|e| IngressError::InvalidEvent(format!("data_base64: {e}")))?;
                decode_data(&bytes, raw.datacontenttype.as_deref())?
            }
            (None, None) => Value::Null,
        };
        Ok(Self {
            id: raw.id,
            event_type: raw.event_type,
            source: raw.source,
            subject: raw.subject.filter(|s| !s.trim().is_empty()),
            data_content_type: raw.datacontenttype,
            data,
        })
    }

    pub fn subject(&self) -> Option<&str> {
        self.subject.as_deref()
    }
}

fn check_version(v: &str) -> Result<(), IngressError> {
    if SPEC_VERSIONS.contains(&v) {
        Ok(())
    } else {
        Err(IngressError::InvalidEvent(format!("unsupported specversion '{v}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn binary_headers() -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert("ce-specversion", HeaderValue::from_static("1.0"));
        h.insert("ce-id", HeaderValue::from_static("evt-1"));
        h.insert("ce-type", HeaderValue::from_static("io.knative.lambda.command.build.start"));
        h.insert("ce-source", HeaderValue::from_static("/ci"));
        h.insert("ce-subject", HeaderValue::from_static("f1"));
        h.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        h
    }

    #[test]
    fn binary_mode_reads_headers_and_json_body() {
        let ev = CloudEvent::from_http(&binary_headers(), br#"{"forceRebuild": true}"#).unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(ev.id, "evt-1");
        assert_eq!(ev.subject(), Some("f1"));
        assert_eq!(ev.data["forceRebuild"], true);
        let empty = CloudEvent::from_http(&binary_headers(), b"").unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(empty.data, Value::Null);
    }

    #[test]
    fn structured_mode_accepts_base64_data() {
        let mut h = HeaderMap::new();
        h.insert(CONTENT_TYPE, HeaderValue::from_static("application/cloudevents+json; charset=utf-8"));
        let body = serde_json::json!({
            "specversion": "1.0", "id": "e2", "type": "io.knative.lambda.response.success", "source": "/fn",
            "datacontenttype": "application/json",
            "data_base64": base64::engine::general_purpose::STANDARD.encode(br#"{"functionName":"f1"}"#),
        });
        let ev = CloudEvent::from_http(&h, body.to_string().as_bytes()).unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(ev.data["functionName"], "f1");
        assert_eq!(ev.subject(), None);
    }

    #[test]
    fn missing_attributes_and_bad_json_are_malformed() {
        let mut h = binary_headers();
        h.remove("ce-type");
        assert!(matches!(CloudEvent::from_http(&h, b"{}"), Err(IngressError::InvalidEvent(_))));
        assert!(matches!(CloudEvent::from_http(&binary_headers(), b"{not json"), Err(IngressError::InvalidEvent(_))));
        assert!(matches!(CloudEvent::from_http(&HeaderMap::new(), b"{}"), Err(IngressError::InvalidEvent(_))));
    }
}
