//! Podium session-sync wire protocol.
//!
//! Two envelope kinds travel between peers:
//!
//! - `state-request`: a student asks the host to republish its state.
//! - `state-update`: the host pushes its full shared state with a per-source
//!   sequence number.
//!
//! [`validate`] is the only way to turn untrusted data into a
//! [`SessionSyncEnvelope`]. The `create_*` constructors are its trusted mirror
//! and normalize their inputs the same way, so validating a constructed
//! envelope always yields the same envelope back.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

/// Protocol tag carried by every envelope. Anything else is rejected outright.
pub const PROTOCOL: &str = "podium.session-sync.v1";

/// Participant role as declared on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Host,
    Student,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Host => "host",
            Role::Student => "student",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "host" => Some(Role::Host),
            "student" => Some(Role::Student),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable identifier of one emitting client instance. Never empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SourceId(String);

impl SourceId {
    /// Trim `raw` and reject it if nothing is left.
    pub fn new(raw: impl AsRef<str>) -> Option<Self> {
        let trimmed = raw.as_ref().trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Self(trimmed.to_string()))
        }
    }

    /// Fresh random identifier for a new client instance.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for SourceId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        SourceId::new(&value).ok_or_else(|| "sourceId must not be empty".to_string())
    }
}

impl From<SourceId> for String {
    fn from(value: SourceId) -> Self {
        value.0
    }
}

impl AsRef<str> for SourceId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    fn normalized(self) -> Self {
        Self {
            x: finite_or(self.x, 0.0),
            y: finite_or(self.y, 0.0),
        }
    }
}

/// Zoom and pan shared by every participant.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SharedViewport {
    pub zoom_level: f64,
    pub pan_offset: Point,
}

impl Default for SharedViewport {
    fn default() -> Self {
        Self {
            zoom_level: 1.0,
            pan_offset: Point::default(),
        }
    }
}

/// Full shared state carried by a `state-update`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSyncStatePayload {
    pub global_step: u64,
    pub shared_viewport: SharedViewport,
    pub laser_position: Option<Point>,
}

impl SessionSyncStatePayload {
    fn normalized(self) -> Self {
        Self {
            global_step: self.global_step,
            shared_viewport: SharedViewport {
                zoom_level: finite_or(self.shared_viewport.zoom_level, 1.0),
                pan_offset: self.shared_viewport.pan_offset.normalized(),
            },
            laser_position: self.laser_position.map(Point::normalized),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum EnvelopeKind {
    StateRequest,
    StateUpdate,
}

impl EnvelopeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvelopeKind::StateRequest => "state-request",
            EnvelopeKind::StateUpdate => "state-update",
        }
    }
}

impl fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateRequestEnvelope {
    protocol: &'static str,
    source_id: SourceId,
    from_role: Role,
    sent_at: f64,
}

impl StateRequestEnvelope {
    pub fn source_id(&self) -> &SourceId {
        &self.source_id
    }

    pub fn from_role(&self) -> Role {
        self.from_role
    }

    pub fn sent_at(&self) -> f64 {
        self.sent_at
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateUpdateEnvelope {
    protocol: &'static str,
    source_id: SourceId,
    from_role: Role,
    seq: u64,
    sent_at: f64,
    payload: SessionSyncStatePayload,
}

impl StateUpdateEnvelope {
    pub fn source_id(&self) -> &SourceId {
        &self.source_id
    }

    pub fn from_role(&self) -> Role {
        self.from_role
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn sent_at(&self) -> f64 {
        self.sent_at
    }

    pub fn payload(&self) -> &SessionSyncStatePayload {
        &self.payload
    }

    pub fn into_payload(self) -> SessionSyncStatePayload {
        self.payload
    }
}

/// One validated unit of wire data.
///
/// There is deliberately no `Deserialize` impl: inbound data goes through
/// [`validate`] or [`validate_text`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum SessionSyncEnvelope {
    StateRequest(StateRequestEnvelope),
    StateUpdate(StateUpdateEnvelope),
}

impl SessionSyncEnvelope {
    pub fn kind(&self) -> EnvelopeKind {
        match self {
            SessionSyncEnvelope::StateRequest(_) => EnvelopeKind::StateRequest,
            SessionSyncEnvelope::StateUpdate(_) => EnvelopeKind::StateUpdate,
        }
    }

    pub fn source_id(&self) -> &SourceId {
        match self {
            SessionSyncEnvelope::StateRequest(e) => &e.source_id,
            SessionSyncEnvelope::StateUpdate(e) => &e.source_id,
        }
    }

    pub fn from_role(&self) -> Role {
        match self {
            SessionSyncEnvelope::StateRequest(e) => e.from_role,
            SessionSyncEnvelope::StateUpdate(e) => e.from_role,
        }
    }

    pub fn sent_at(&self) -> f64 {
        match self {
            SessionSyncEnvelope::StateRequest(e) => e.sent_at,
            SessionSyncEnvelope::StateUpdate(e) => e.sent_at,
        }
    }

    pub fn as_state_update(&self) -> Option<&StateUpdateEnvelope> {
        match self {
            SessionSyncEnvelope::StateUpdate(e) => Some(e),
            SessionSyncEnvelope::StateRequest(_) => None,
        }
    }

    pub fn to_value(&self) -> serde_json::Result<Value> {
        serde_json::to_value(self)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Current wall-clock time in epoch milliseconds, the unit of `sentAt`.
pub fn now_ms() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64
}

/// Trusted constructor for a `state-request`.
pub fn create_state_request_envelope(
    source_id: &SourceId,
    from_role: Role,
    sent_at: f64,
) -> SessionSyncEnvelope {
    SessionSyncEnvelope::StateRequest(StateRequestEnvelope {
        protocol: PROTOCOL,
        source_id: source_id.clone(),
        from_role,
        sent_at: finite_or(sent_at, 0.0),
    })
}

/// Trusted constructor for a `state-update`. A `seq` of zero is raised to 1.
pub fn create_state_update_envelope(
    source_id: &SourceId,
    from_role: Role,
    seq: u64,
    sent_at: f64,
    payload: SessionSyncStatePayload,
) -> SessionSyncEnvelope {
    SessionSyncEnvelope::StateUpdate(StateUpdateEnvelope {
        protocol: PROTOCOL,
        source_id: source_id.clone(),
        from_role,
        seq: seq.max(1),
        sent_at: finite_or(sent_at, 0.0),
        payload: payload.normalized(),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ValidationCode {
    MalformedJson,
    InvalidRoot,
    ProtocolMismatch,
    UnknownKind,
    InvalidSourceId,
    InvalidRole,
    InvalidSentAt,
    InvalidSeq,
    InvalidPayload,
}

impl ValidationCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationCode::MalformedJson => "malformed-json",
            ValidationCode::InvalidRoot => "invalid-root",
            ValidationCode::ProtocolMismatch => "protocol-mismatch",
            ValidationCode::UnknownKind => "unknown-kind",
            ValidationCode::InvalidSourceId => "invalid-source-id",
            ValidationCode::InvalidRole => "invalid-role",
            ValidationCode::InvalidSentAt => "invalid-sent-at",
            ValidationCode::InvalidSeq => "invalid-seq",
            ValidationCode::InvalidPayload => "invalid-payload",
        }
    }
}

impl fmt::Display for ValidationCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an inbound value was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("{code} at `{path}`: {message}")]
pub struct EnvelopeValidationError {
    pub code: ValidationCode,
    pub message: String,
    pub path: String,
}

impl EnvelopeValidationError {
    fn new(code: ValidationCode, path: &str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            path: path.to_string(),
        }
    }
}

/// Parse transport text and validate it.
pub fn validate_text(raw: &str) -> Result<SessionSyncEnvelope, EnvelopeValidationError> {
    let value: Value = serde_json::from_str(raw).map_err(|e| {
        EnvelopeValidationError::new(ValidationCode::MalformedJson, "$", e.to_string())
    })?;
    validate(&value)
}

/// Validate an untrusted value and normalize it into an envelope.
pub fn validate(raw: &Value) -> Result<SessionSyncEnvelope, EnvelopeValidationError> {
    let root = raw.as_object().ok_or_else(|| {
        EnvelopeValidationError::new(
            ValidationCode::InvalidRoot,
            "$",
            "envelope must be a JSON object",
        )
    })?;

    match root.get("protocol") {
        Some(Value::String(tag)) if tag == PROTOCOL => {}
        _ => {
            return Err(EnvelopeValidationError::new(
                ValidationCode::ProtocolMismatch,
                "protocol",
                format!("expected protocol `{PROTOCOL}`"),
            ));
        }
    }

    let kind = match root.get("kind").and_then(Value::as_str) {
        Some("state-request") => EnvelopeKind::StateRequest,
        Some("state-update") => EnvelopeKind::StateUpdate,
        _ => {
            return Err(EnvelopeValidationError::new(
                ValidationCode::UnknownKind,
                "kind",
                "kind must be `state-request` or `state-update`",
            ));
        }
    };

    let source_id = root
        .get("sourceId")
        .and_then(Value::as_str)
        .and_then(SourceId::new)
        .ok_or_else(|| {
            EnvelopeValidationError::new(
                ValidationCode::InvalidSourceId,
                "sourceId",
                "sourceId must be a non-empty string",
            )
        })?;

    let from_role = root
        .get("fromRole")
        .and_then(Value::as_str)
        .and_then(Role::parse)
        .ok_or_else(|| {
            EnvelopeValidationError::new(
                ValidationCode::InvalidRole,
                "fromRole",
                "fromRole must be `host` or `student`",
            )
        })?;

    let sent_at = finite_number(root.get("sentAt")).ok_or_else(|| {
        EnvelopeValidationError::new(
            ValidationCode::InvalidSentAt,
            "sentAt",
            "sentAt must be a finite number",
        )
    })?;

    match kind {
        EnvelopeKind::StateRequest => Ok(SessionSyncEnvelope::StateRequest(StateRequestEnvelope {
            protocol: PROTOCOL,
            source_id,
            from_role,
            sent_at,
        })),
        EnvelopeKind::StateUpdate => {
            let seq = parse_seq(root.get("seq"))?;
            let payload = parse_payload(root.get("payload"))?;
            Ok(SessionSyncEnvelope::StateUpdate(StateUpdateEnvelope {
                protocol: PROTOCOL,
                source_id,
                from_role,
                seq,
                sent_at,
                payload,
            }))
        }
    }
}

fn finite_or(value: f64, fallback: f64) -> f64 {
    if value.is_finite() { value } else { fallback }
}

fn finite_number(value: Option<&Value>) -> Option<f64> {
    value
        .and_then(Value::as_f64)
        .filter(|n| n.is_finite())
}

fn parse_seq(value: Option<&Value>) -> Result<u64, EnvelopeValidationError> {
    let invalid = || {
        EnvelopeValidationError::new(
            ValidationCode::InvalidSeq,
            "seq",
            "seq must be an integer >= 1",
        )
    };

    // Exact path first so counters above 2^53 keep their precision.
    if let Some(n) = value.and_then(Value::as_u64) {
        return if n >= 1 { Ok(n) } else { Err(invalid()) };
    }

    let n = finite_number(value).ok_or_else(invalid)?;
    // u64::MAX as f64 rounds up to 2^64, which is already out of range.
    if n.fract() != 0.0 || n < 1.0 || n >= u64::MAX as f64 {
        return Err(invalid());
    }
    Ok(n as u64)
}

fn invalid_payload(path: &str, message: &str) -> EnvelopeValidationError {
    EnvelopeValidationError::new(ValidationCode::InvalidPayload, path, message)
}

fn parse_payload(
    value: Option<&Value>,
) -> Result<SessionSyncStatePayload, EnvelopeValidationError> {
    let payload = value
        .and_then(Value::as_object)
        .ok_or_else(|| invalid_payload("payload", "payload must be an object"))?;

    let global_step = finite_number(payload.get("globalStep")).ok_or_else(|| {
        invalid_payload("payload.globalStep", "globalStep must be a finite number")
    })?;

    let viewport = payload
        .get("sharedViewport")
        .and_then(Value::as_object)
        .ok_or_else(|| {
            invalid_payload("payload.sharedViewport", "sharedViewport must be an object")
        })?;

    let zoom_level = finite_number(viewport.get("zoomLevel")).ok_or_else(|| {
        invalid_payload(
            "payload.sharedViewport.zoomLevel",
            "zoomLevel must be a finite number",
        )
    })?;

    let pan_offset = parse_point(
        viewport.get("panOffset"),
        "payload.sharedViewport.panOffset",
    )?;

    let laser_position = match payload.get("laserPosition") {
        None | Some(Value::Null) => None,
        Some(v) => Some(parse_point(Some(v), "payload.laserPosition")?),
    };

    Ok(SessionSyncStatePayload {
        global_step: global_step.floor().max(0.0) as u64,
        shared_viewport: SharedViewport {
            zoom_level,
            pan_offset,
        },
        laser_position,
    })
}

fn parse_point(value: Option<&Value>, path: &str) -> Result<Point, EnvelopeValidationError> {
    let point: &Map<String, Value> = value
        .and_then(Value::as_object)
        .ok_or_else(|| invalid_payload(path, "expected an {x, y} object"))?;

    let x = finite_number(point.get("x"))
        .ok_or_else(|| invalid_payload(&format!("{path}.x"), "x must be a finite number"))?;
    let y = finite_number(point.get("y"))
        .ok_or_else(|| invalid_payload(&format!("{path}.y"), "y must be a finite number"))?;

    Ok(Point { x, y })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn update_json() -> Value {
        json!({
            "protocol": PROTOCOL,
            "kind": "state-update",
            "sourceId": "host-1",
            "fromRole": "host",
            "seq": 3,
            "sentAt": 1_700_000_000_000u64,
            "payload": {
                "globalStep": 4,
                "sharedViewport": { "zoomLevel": 1.5, "panOffset": { "x": 10, "y": -2.5 } },
                "laserPosition": { "x": 0.25, "y": 0.75 }
            }
        })
    }

    fn code_of(value: &Value) -> ValidationCode {
        validate(value).unwrap_err().code
    }

    #[test]
    fn test_validate_state_update() {
        let env = validate(&update_json()).unwrap();
        let update = env.as_state_update().unwrap();
        assert_eq!(update.source_id().as_str(), "host-1");
        assert_eq!(update.from_role(), Role::Host);
        assert_eq!(update.seq(), 3);
        assert_eq!(update.payload().global_step, 4);
        assert_eq!(update.payload().shared_viewport.zoom_level, 1.5);
        assert_eq!(update.payload().shared_viewport.pan_offset, Point::new(10.0, -2.5));
        assert_eq!(update.payload().laser_position, Some(Point::new(0.25, 0.75)));
    }

    #[test]
    fn test_validate_state_request() {
        let raw = json!({
            "protocol": PROTOCOL,
            "kind": "state-request",
            "sourceId": "  student-7  ",
            "fromRole": "student",
            "sentAt": 12.5
        });
        let env = validate(&raw).unwrap();
        assert_eq!(env.kind(), EnvelopeKind::StateRequest);
        assert_eq!(env.source_id().as_str(), "student-7");
        assert_eq!(env.sent_at(), 12.5);
        assert!(env.as_state_update().is_none());
    }

    #[test]
    fn test_rejects_non_object_root() {
        assert_eq!(code_of(&json!([1, 2, 3])), ValidationCode::InvalidRoot);
        assert_eq!(code_of(&json!("state-update")), ValidationCode::InvalidRoot);
        assert_eq!(code_of(&Value::Null), ValidationCode::InvalidRoot);
    }

    #[test]
    fn test_rejects_protocol_mismatch() {
        let mut raw = update_json();
        raw["protocol"] = json!("podium.session-sync.v2");
        let err = validate(&raw).unwrap_err();
        assert_eq!(err.code, ValidationCode::ProtocolMismatch);
        assert_eq!(err.path, "protocol");

        raw.as_object_mut().unwrap().remove("protocol");
        assert_eq!(code_of(&raw), ValidationCode::ProtocolMismatch);
    }

    #[test]
    fn test_rejects_unknown_kind() {
        let mut raw = update_json();
        raw["kind"] = json!("state-delete");
        assert_eq!(code_of(&raw), ValidationCode::UnknownKind);
    }

    #[test]
    fn test_rejects_blank_source_id() {
        let mut raw = update_json();
        raw["sourceId"] = json!("   ");
        assert_eq!(code_of(&raw), ValidationCode::InvalidSourceId);
        raw["sourceId"] = json!(42);
        assert_eq!(code_of(&raw), ValidationCode::InvalidSourceId);
    }

    #[test]
    fn test_rejects_unknown_role() {
        let mut raw = update_json();
        raw["fromRole"] = json!("admin");
        assert_eq!(code_of(&raw), ValidationCode::InvalidRole);
    }

    #[test]
    fn test_rejects_bad_sent_at() {
        let mut raw = update_json();
        raw["sentAt"] = json!("yesterday");
        assert_eq!(code_of(&raw), ValidationCode::InvalidSentAt);
        raw.as_object_mut().unwrap().remove("sentAt");
        assert_eq!(code_of(&raw), ValidationCode::InvalidSentAt);
    }

    #[test]
    fn test_rejects_bad_seq() {
        for seq in [json!(0), json!(-1), json!(2.5), json!("3"), Value::Null] {
            let mut raw = update_json();
            raw["seq"] = seq.clone();
            assert_eq!(code_of(&raw), ValidationCode::InvalidSeq, "seq = {seq}");
        }
    }

    #[test]
    fn test_rejects_float_seq_beyond_u64() {
        for seq in [json!(1e20), json!(18446744073709551616.0)] {
            let mut raw = update_json();
            raw["seq"] = seq.clone();
            assert_eq!(code_of(&raw), ValidationCode::InvalidSeq, "seq = {seq}");
        }

        let text = update_json().to_string().replace("\"seq\":3", "\"seq\":1e20");
        assert!(text.contains("1e20"));
        assert_eq!(validate_text(&text).unwrap_err().code, ValidationCode::InvalidSeq);

        // Exact integers keep the full range.
        let mut raw = update_json();
        raw["seq"] = json!(u64::MAX);
        let env = validate(&raw).unwrap();
        assert_eq!(env.as_state_update().unwrap().seq(), u64::MAX);
    }

    #[test]
    fn test_accepts_integral_float_seq() {
        let mut raw = update_json();
        raw["seq"] = json!(7.0);
        let env = validate(&raw).unwrap();
        assert_eq!(env.as_state_update().unwrap().seq(), 7);
    }

    #[test]
    fn test_rejects_malformed_payload() {
        let cases = [
            ("/payload", Value::Null, "payload"),
            ("/payload/globalStep", json!("two"), "payload.globalStep"),
            ("/payload/sharedViewport", json!(1), "payload.sharedViewport"),
            (
                "/payload/sharedViewport/zoomLevel",
                Value::Null,
                "payload.sharedViewport.zoomLevel",
            ),
            (
                "/payload/sharedViewport/panOffset",
                json!({ "x": 1 }),
                "payload.sharedViewport.panOffset.y",
            ),
            ("/payload/laserPosition", json!({ "x": "a", "y": 1 }), "payload.laserPosition.x"),
            ("/payload/laserPosition", json!(true), "payload.laserPosition"),
        ];

        for (pointer, replacement, path) in cases {
            let mut raw = update_json();
            *raw.pointer_mut(pointer).unwrap() = replacement;
            let err = validate(&raw).unwrap_err();
            assert_eq!(err.code, ValidationCode::InvalidPayload, "{pointer}");
            assert_eq!(err.path, path);
        }
    }

    #[test]
    fn test_missing_laser_is_none() {
        let mut raw = update_json();
        raw["payload"].as_object_mut().unwrap().remove("laserPosition");
        let env = validate(&raw).unwrap();
        assert_eq!(env.as_state_update().unwrap().payload().laser_position, None);

        raw["payload"]["laserPosition"] = Value::Null;
        let env = validate(&raw).unwrap();
        assert_eq!(env.as_state_update().unwrap().payload().laser_position, None);
    }

    #[test]
    fn test_global_step_is_floored_and_clamped() {
        let mut raw = update_json();
        raw["payload"]["globalStep"] = json!(6.9);
        let env = validate(&raw).unwrap();
        assert_eq!(env.as_state_update().unwrap().payload().global_step, 6);

        raw["payload"]["globalStep"] = json!(-3);
        let env = validate(&raw).unwrap();
        assert_eq!(env.as_state_update().unwrap().payload().global_step, 0);
    }

    #[test]
    fn test_validate_text_malformed_json() {
        let err = validate_text("{not json").unwrap_err();
        assert_eq!(err.code, ValidationCode::MalformedJson);
        assert_eq!(err.path, "$");
    }

    #[test]
    fn test_constructed_update_survives_the_wire() {
        let source = SourceId::new("host-a").unwrap();
        let payload = SessionSyncStatePayload {
            global_step: 12,
            shared_viewport: SharedViewport {
                zoom_level: 0.8,
                pan_offset: Point::new(-40.25, 17.0),
            },
            laser_position: Some(Point::new(0.1, 0.9)),
        };
        let env =
            create_state_update_envelope(&source, Role::Host, 9, 1_700_000_123_456.0, payload);

        let text = env.to_json().unwrap();
        let back = validate_text(&text).unwrap();
        assert_eq!(back, env);
    }

    #[test]
    fn test_constructors_normalize_like_validation() {
        let source = SourceId::new("host-a").unwrap();
        let payload = SessionSyncStatePayload {
            global_step: 1,
            shared_viewport: SharedViewport {
                zoom_level: f64::NAN,
                pan_offset: Point::new(f64::INFINITY, 2.0),
            },
            laser_position: Some(Point::new(f64::NEG_INFINITY, 1.0)),
        };
        let env = create_state_update_envelope(&source, Role::Host, 0, f64::NAN, payload);
        let update = env.as_state_update().unwrap();
        assert_eq!(update.seq(), 1);
        assert_eq!(update.sent_at(), 0.0);
        assert_eq!(update.payload().shared_viewport.zoom_level, 1.0);
        assert_eq!(update.payload().shared_viewport.pan_offset, Point::new(0.0, 2.0));
        assert_eq!(update.payload().laser_position, Some(Point::new(0.0, 1.0)));

        assert_eq!(validate(&env.to_value().unwrap()).unwrap(), env);
    }

    #[test]
    fn test_request_wire_shape() {
        let source = SourceId::new("student-1").unwrap();
        let env = create_state_request_envelope(&source, Role::Student, 5.0);
        let value = env.to_value().unwrap();
        assert_eq!(value["protocol"], PROTOCOL);
        assert_eq!(value["kind"], "state-request");
        assert_eq!(value["sourceId"], "student-1");
        assert_eq!(value["fromRole"], "student");
        assert!(value.get("seq").is_none());
    }

    #[test]
    fn test_source_id_rejects_blank() {
        assert!(SourceId::new("").is_none());
        assert!(SourceId::new(" \t ").is_none());
        assert_eq!(SourceId::new(" a ").unwrap().as_str(), "a");
        assert_ne!(SourceId::generate(), SourceId::generate());
        assert!(serde_json::from_value::<SourceId>(json!("  ")).is_err());
    }

    #[test]
    fn test_validation_error_display() {
        let err = validate(&json!({})).unwrap_err();
        assert_eq!(
            err.to_string(),
            format!("protocol-mismatch at `protocol`: expected protocol `{PROTOCOL}`")
        );
    }
}
