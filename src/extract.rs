//! Payload parsing: marker-embedded JSON in HTML, versioned dotted-path
//! traversal, and the history response envelope.
//!
//! Everything here is a pure function of its input. Failures are typed by
//! stage so callers and logs can tell "the page lost its marker" apart from
//! "the hydration shape moved".

use std::fmt;

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::types::Record;

#[derive(Debug, Error)]
pub enum ParseError {
    /// The marker element is gone from the document.
    #[error("marker element {marker:?} not found")]
    MarkerNotFound { marker: String },
    /// The payload (marker text or response body) is not valid JSON.
    #[error("json decode failed: {detail}")]
    JsonDecode { detail: String },
    /// The documented path no longer matches the payload shape.
    #[error("path traversal failed at {segment:?}: {detail}")]
    PathTraversal { segment: String, detail: String },
    /// Well-formed envelope, non-success code.
    #[error("upstream rejected request: code {code:?}: {message}")]
    Api { code: String, message: String },
}

impl ParseError {
    pub fn stage(&self) -> &'static str {
        match self {
            ParseError::MarkerNotFound { .. } => "marker-not-found",
            ParseError::JsonDecode { .. } => "json-decode",
            ParseError::PathTraversal { .. } => "path-traversal",
            ParseError::Api { .. } => "api",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PathSeg {
    Key(String),
    Index(usize),
}

impl fmt::Display for PathSeg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathSeg::Key(k) => f.write_str(k),
            PathSeg::Index(i) => write!(f, "[{i}]"),
        }
    }
}

/// A dotted path into a JSON document, e.g.
/// `appState.loader.dataByRouteId.d6a9.dehydratedState.queries.1.state.data.data`.
/// The route-id segment is versioned upstream; the whole path comes from
/// config so a portal redeploy is a config edit, not a code change.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExtractPath {
    segments: Vec<PathSeg>,
}

impl ExtractPath {
    /// An all-digit segment indexes an array (`queries.1.state`); anything
    /// else is an object key. Empty segments are skipped.
    pub fn parse(path: &str) -> Self {
        let segments = path
            .split('.')
            .filter(|s| !s.is_empty())
            .map(|s| match s.parse::<usize>() {
                Ok(i) if s.bytes().all(|b| b.is_ascii_digit()) => PathSeg::Index(i),
                _ => PathSeg::Key(s.to_string()),
            })
            .collect();
        Self { segments }
    }

    pub fn segments(&self) -> &[PathSeg] {
        &self.segments
    }

    /// Follow the path through `root`. Stops with the failing segment and
    /// what was actually there; no partial results.
    pub fn walk<'a>(&self, root: &'a Value) -> Result<&'a Value, ParseError> {
        let mut cur = root;
        for seg in &self.segments {
            let next = match seg {
                PathSeg::Key(k) => cur.get(k.as_str()),
                PathSeg::Index(i) => cur.get(*i),
            };
            cur = next.ok_or_else(|| ParseError::PathTraversal {
                segment: seg.to_string(),
                detail: format!("not present in {}", value_kind(cur)),
            })?;
        }
        Ok(cur)
    }
}

fn value_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Read the required unsigned-integer metric off a leaf object. The path
/// contract includes the leaf's type: present-but-not-a-count means the page
/// shape changed, reported as a traversal failure naming the field.
pub fn require_u64(v: &Value, field: &str) -> Result<u64, ParseError> {
    let Some(raw) = v.get(field) else {
        return Err(ParseError::PathTraversal {
            segment: field.to_string(),
            detail: format!("missing key in {}", value_kind(v)),
        });
    };
    raw.as_u64().ok_or_else(|| ParseError::PathTraversal {
        segment: field.to_string(),
        detail: format!("expected unsigned integer, found {}", value_kind(raw)),
    })
}

/// Extract and decode the JSON text of the element carrying `id="{marker_id}"`.
///
/// The portal embeds its hydration state as the text of one
/// `<script id="__APP_DATA" ...>...</script>` element. Locating a single
/// marker does not need an HTML parser: scan for the id attribute, back up
/// to the enclosing tag, slice to the matching close tag.
pub fn marker_json(body: &str, marker_id: &str) -> Result<Value, ParseError> {
    let text = marker_text(body, marker_id).ok_or_else(|| ParseError::MarkerNotFound {
        marker: marker_id.to_string(),
    })?;
    serde_json::from_str(text).map_err(|e| ParseError::JsonDecode {
        detail: e.to_string(),
    })
}

fn marker_text<'a>(body: &'a str, marker_id: &str) -> Option<&'a str> {
    let at = find_id_attr(body, marker_id)?;
    let open = body[..at].rfind('<')?;
    let tag: String = body[open + 1..]
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric())
        .collect();
    if tag.is_empty() {
        return None;
    }
    let text_start = open + body[open..].find('>')? + 1;
    let close = format!("</{tag}");
    let rel = body[text_start..].find(&close)?;
    Some(&body[text_start..text_start + rel])
}

fn find_id_attr(body: &str, marker_id: &str) -> Option<usize> {
    // Either quoting style for the id attribute.
    for quote in ['"', '\''] {
        let needle = format!("id={quote}{marker_id}{quote}");
        if let Some(pos) = body.find(&needle) {
            return Some(pos);
        }
    }
    None
}

#[derive(Debug, Deserialize)]
struct Envelope {
    code: Option<String>,
    message: Option<String>,
    #[serde(rename = "messageDetail")]
    message_detail: Option<String>,
    data: Option<EnvelopeData>,
}

#[derive(Debug, Deserialize)]
struct EnvelopeData {
    list: Option<Vec<Record>>,
}

/// Decode a history page: check the envelope's success sentinel, return the
/// rows. A missing `data.list` on a success envelope is an empty page, not
/// an error.
pub fn decode_envelope(body: &str, success_code: &str) -> Result<Vec<Record>, ParseError> {
    let env: Envelope = serde_json::from_str(body).map_err(|e| ParseError::JsonDecode {
        detail: e.to_string(),
    })?;
    let code = env.code.unwrap_or_default();
    if code != success_code {
        let message = env
            .message
            .filter(|m| !m.is_empty())
            .or(env.message_detail)
            .unwrap_or_else(|| "no message".to_string());
        return Err(ParseError::Api { code, message });
    }
    Ok(env.data.and_then(|d| d.list).unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{decode_envelope, marker_json, require_u64, ExtractPath, ParseError, PathSeg};

    #[test]
    fn path_parse_splits_keys_and_indices() {
        let p = ExtractPath::parse("queries.1.state.data");
        assert_eq!(
            p.segments(),
            &[
                PathSeg::Key("queries".into()),
                PathSeg::Index(1),
                PathSeg::Key("state".into()),
                PathSeg::Key("data".into()),
            ]
        );
    }

    #[test]
    fn walk_reaches_nested_value() {
        let doc = json!({
            "queries": [
                {"state": {"data": {"currentCopyCount": 999}}},
                {"state": {"data": {"currentCopyCount": 1234}}},
            ]
        });
        let p = ExtractPath::parse("queries.1.state.data");
        let leaf = p.walk(&doc).unwrap();
        assert_eq!(require_u64(leaf, "currentCopyCount").unwrap(), 1234);
    }

    #[test]
    fn walk_failure_names_the_segment() {
        let doc = json!({"queries": [{"state": {}}]});
        let p = ExtractPath::parse("queries.3.state");
        let err = p.walk(&doc).unwrap_err();
        assert_eq!(err.stage(), "path-traversal");
        match err {
            ParseError::PathTraversal { segment, .. } => assert_eq!(segment, "[3]"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn non_integer_metric_is_a_shape_change() {
        let leaf = json!({"currentCopyCount": "many"});
        let err = require_u64(&leaf, "currentCopyCount").unwrap_err();
        assert_eq!(err.stage(), "path-traversal");
    }

    #[test]
    fn marker_json_double_and_single_quotes() {
        for html in [
            r#"<html><body><script id="__APP_DATA" type="application/json">{"a":1}</script></body></html>"#,
            r#"<html><body><script id='__APP_DATA'>{"a":1}</script></body></html>"#,
        ] {
            let v = marker_json(html, "__APP_DATA").unwrap();
            assert_eq!(v["a"], 1);
        }
    }

    #[test]
    fn missing_marker_is_its_own_stage() {
        let err = marker_json("<html><body>maintenance</body></html>", "__APP_DATA").unwrap_err();
        assert_eq!(err.stage(), "marker-not-found");
    }

    #[test]
    fn bad_marker_payload_is_a_decode_failure() {
        let html = r#"<script id="__APP_DATA">{"a": nope}</script>"#;
        let err = marker_json(html, "__APP_DATA").unwrap_err();
        assert_eq!(err.stage(), "json-decode");
    }

    #[test]
    fn envelope_success_returns_rows() {
        let body = r#"{"code":"000000","message":null,"messageDetail":null,
            "data":{"list":[{"symbol":"BTCUSDT"},{"symbol":"ETHUSDT"}]}}"#;
        let rows = decode_envelope(body, "000000").unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["symbol"], "BTCUSDT");
    }

    #[test]
    fn envelope_failure_carries_code_and_message() {
        let body = r#"{"code":"100001","message":"invalid entity","data":null}"#;
        match decode_envelope(body, "000000").unwrap_err() {
            ParseError::Api { code, message } => {
                assert_eq!(code, "100001");
                assert_eq!(message, "invalid entity");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn envelope_message_detail_is_the_fallback() {
        let body = r#"{"code":"100002","message":"","messageDetail":"rate limited"}"#;
        match decode_envelope(body, "000000").unwrap_err() {
            ParseError::Api { message, .. } => assert_eq!(message, "rate limited"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn envelope_success_with_no_list_is_an_empty_page() {
        assert!(decode_envelope(r#"{"code":"000000"}"#, "000000")
            .unwrap()
            .is_empty());
        assert!(decode_envelope(r#"{"code":"000000","data":{}}"#, "000000")
            .unwrap()
            .is_empty());
    }
}
