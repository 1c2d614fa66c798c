use std::fmt;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// Destination for requests the daemon answers itself.
pub const SYS_ROUTE: &str = "sys";

pub const DEFAULT_ROWS: u16 = 25;
pub const DEFAULT_COLS: u16 = 80;

pub mod commands {
    pub const HELLO: &str = "hello";
    /// Fire-and-forget notice; never answered with a no-route notice.
    pub const MESSAGE: &str = "message";
    pub const JOB_START: &str = "job.start";
    pub const JOB_ATTACH: &str = "job.attach";
    pub const JOB_DETACH: &str = "job.detach";
    pub const JOB_INPUT: &str = "job.input";
    pub const JOB_RESIZE: &str = "job.resize";
    pub const JOB_RESET_INPUT: &str = "job.resetinput";
    pub const JOB_STOP: &str = "job.stop";
    pub const JOB_STATUS: &str = "job.status";
    pub const JOB_OUTPUT: &str = "job.output";
    pub const CONN_CONNECT: &str = "conn.connect";
    pub const CONN_DISCONNECT: &str = "conn.disconnect";
    pub const CONN_ENSURE: &str = "conn.ensure";
    pub const CONN_STATUS: &str = "conn.status";
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid base64 input: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("invalid envelope: {0}")]
    Invalid(&'static str),
    #[error("frame of {len} bytes exceeds limit of {max}")]
    FrameTooLarge { len: usize, max: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RouteId(String);

impl RouteId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn sys() -> Self {
        Self(SYS_ROUTE.to_string())
    }

    pub fn conn(name: &str) -> Self {
        Self(format!("conn:{name}"))
    }

    pub fn controller(block_id: &str) -> Self {
        Self(format!("controller:{block_id}"))
    }

    pub fn job(job_id: &str) -> Self {
        Self(format!("job:{job_id}"))
    }

    pub fn proc(proc_id: &str) -> Self {
        Self(format!("proc:{proc_id}"))
    }

    pub fn tab(tab_id: &str) -> Self {
        Self(format!("tab:{tab_id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_proc(&self) -> bool {
        self.0.starts_with("proc:")
    }

    pub fn is_sys(&self) -> bool {
        self.0 == SYS_ROUTE
    }

    /// Routes the daemon binds itself; a peer may never claim one.
    pub fn is_reserved(&self) -> bool {
        matches!(self.kind(), SYS_ROUTE | "job" | "controller" | "conn")
    }

    /// Prefix before the first `:`, or `client` for bare generated ids.
    pub fn kind(&self) -> &str {
        match self.0.split_once(':') {
            Some((prefix, _)) => prefix,
            None if self.is_sys() => SYS_ROUTE,
            None => "client",
        }
    }
}

impl fmt::Display for RouteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RouteId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeKind {
    #[default]
    Request,
    Response,
    Event,
}

fn is_zero(value: &u64) -> bool {
    *value == 0
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// The unit the route table moves around.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "routeid", default, skip_serializing_if = "Option::is_none")]
    pub route_id: Option<RouteId>,
    #[serde(default)]
    pub kind: EnvelopeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reqid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<RouteId>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub cont: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
    #[serde(rename = "inputsessionid", default, skip_serializing_if = "Option::is_none")]
    pub input_session_id: Option<String>,
    #[serde(rename = "seqnum", default, skip_serializing_if = "is_zero")]
    pub seq_num: u64,
}

impl Envelope {
    /// Request that expects a response; gets a fresh `reqid`.
    pub fn request(dest: RouteId, command: &str, payload: Value) -> Self {
        Self {
            route_id: Some(dest),
            kind: EnvelopeKind::Request,
            command: Some(command.to_string()),
            reqid: Some(Uuid::new_v4().to_string()),
            payload,
            ..Self::default()
        }
    }

    pub fn event(dest: RouteId, command: &str, payload: Value) -> Self {
        Self {
            route_id: Some(dest),
            kind: EnvelopeKind::Event,
            command: Some(command.to_string()),
            payload,
            ..Self::default()
        }
    }

    /// Response addressed back along the request's correlation id.
    pub fn response_to(request: &Envelope, payload: Value) -> Self {
        Self {
            route_id: request.source.clone(),
            kind: EnvelopeKind::Response,
            resid: request.reqid.clone(),
            payload,
            ..Self::default()
        }
    }

    pub fn error_response(reqid: &str, dest: Option<RouteId>, message: impl Into<String>) -> Self {
        Self {
            route_id: dest,
            kind: EnvelopeKind::Response,
            resid: Some(reqid.to_string()),
            error: Some(message.into()),
            ..Self::default()
        }
    }

    /// Sequenced terminal input for a job route.
    pub fn input(dest: RouteId, session_id: &str, seq_num: u64, input: &InputPayload) -> Self {
        Self {
            route_id: Some(dest),
            kind: EnvelopeKind::Event,
            command: Some(commands::JOB_INPUT.to_string()),
            payload: serde_json::to_value(input).unwrap_or(Value::Null),
            input_session_id: Some(session_id.to_string()),
            seq_num,
            ..Self::default()
        }
    }

    pub fn with_source(mut self, source: RouteId) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_cont(mut self, cont: bool) -> Self {
        self.cont = cont;
        self
    }

    pub fn is_request(&self) -> bool {
        self.command.is_some() || self.reqid.is_some()
    }

    pub fn command(&self) -> Option<&str> {
        self.command.as_deref()
    }

    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.reqid.is_some() && self.resid.is_some() {
            return Err(ProtocolError::Invalid(
                "request packets may not have both reqid and resid set",
            ));
        }
        if self.command.is_none() && self.reqid.is_none() && self.resid.is_none() {
            return Err(ProtocolError::Invalid("envelope has no command, reqid or resid"));
        }
        Ok(())
    }

    pub fn payload_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

pub fn encode(envelope: &Envelope) -> Result<Bytes, ProtocolError> {
    Ok(Bytes::from(serde_json::to_vec(envelope)?))
}

pub fn decode(bytes: &[u8]) -> Result<Envelope, ProtocolError> {
    let envelope: Envelope = serde_json::from_slice(bytes)?;
    envelope.validate()?;
    Ok(envelope)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TermSize {
    pub rows: u16,
    pub cols: u16,
}

impl TermSize {
    pub fn new(rows: u16, cols: u16) -> Self {
        Self { rows, cols }
    }

    /// Zero dimensions fall back to 25x80.
    pub fn normalized(self) -> Self {
        Self {
            rows: if self.rows == 0 { DEFAULT_ROWS } else { self.rows },
            cols: if self.cols == 0 { DEFAULT_COLS } else { self.cols },
        }
    }
}

impl Default for TermSize {
    fn default() -> Self {
        Self::new(DEFAULT_ROWS, DEFAULT_COLS)
    }
}

/// Body of a `job.input` envelope. Every field is optional so resize and
/// signal requests ride the same ordered stream as keystrokes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data64: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub termsize: Option<TermSize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signame: Option<String>,
}

impl InputPayload {
    pub fn data(bytes: &[u8]) -> Self {
        Self {
            data64: Some(BASE64.encode(bytes)),
            ..Self::default()
        }
    }

    pub fn resize(size: TermSize) -> Self {
        Self {
            termsize: Some(size),
            ..Self::default()
        }
    }

    pub fn signal(name: &str) -> Self {
        Self {
            signame: Some(name.to_string()),
            ..Self::default()
        }
    }

    pub fn decode_data(&self) -> Result<Option<Vec<u8>>, ProtocolError> {
        match &self.data64 {
            Some(encoded) => Ok(Some(BASE64.decode(encoded)?)),
            None => Ok(None),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data64.is_none() && self.termsize.is_none() && self.signame.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloRequest {
    #[serde(rename = "routeid", default, skip_serializing_if = "Option::is_none")]
    pub route_id: Option<RouteId>,
    #[serde(rename = "procidentity", default, skip_serializing_if = "Option::is_none")]
    pub proc_identity: Option<String>,
    #[serde(rename = "clientid", default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloResponse {
    #[serde(rename = "routeid")]
    pub route_id: RouteId,
    #[serde(rename = "clientid")]
    pub client_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wire_field_names_are_stable() {
        let env = Envelope::input(
            RouteId::job("j1"),
            "sess-1",
            3,
            &InputPayload::data(b"ls\n"),
        );
        let value = serde_json::to_value(&env).unwrap();
        assert_eq!(value["routeid"], "job:j1");
        assert_eq!(value["inputsessionid"], "sess-1");
        assert_eq!(value["seqnum"], 3);
        assert_eq!(value["kind"], "event");
        assert_eq!(value["payload"]["data64"], "bHMK");
        assert!(value.get("cont").is_none());
    }

    #[test]
    fn decode_rejects_ambiguous_correlation() {
        let raw = json!({"reqid": "a", "resid": "b"}).to_string();
        assert!(matches!(
            decode(raw.as_bytes()),
            Err(ProtocolError::Invalid(_))
        ));
    }

    #[test]
    fn response_targets_request_source() {
        let req = Envelope::request(RouteId::sys(), commands::JOB_STATUS, Value::Null)
            .with_source(RouteId::new("client-a"));
        let resp = Envelope::response_to(&req, json!({"ok": true}));
        assert_eq!(resp.route_id, Some(RouteId::new("client-a")));
        assert_eq!(resp.resid, req.reqid);
        let bytes = encode(&resp).unwrap();
        assert_eq!(decode(&bytes).unwrap(), resp);
    }

    #[test]
    fn route_kinds() {
        assert_eq!(RouteId::conn("hostA").kind(), "conn");
        assert_eq!(RouteId::proc("p").kind(), "proc");
        assert!(RouteId::job("j").is_reserved());
        assert!(RouteId::sys().is_reserved());
        assert!(!RouteId::tab("t").is_reserved());
        assert!(!RouteId::generate().is_reserved());
        assert!(RouteId::proc("p").is_proc());
        assert_eq!(RouteId::sys().kind(), "sys");
        assert_eq!(RouteId::generate().kind(), "client");
    }

    #[test]
    fn zero_term_size_falls_back_to_defaults() {
        assert_eq!(TermSize::new(0, 120).normalized(), TermSize::new(25, 120));
        assert_eq!(TermSize::new(40, 0).normalized(), TermSize::new(40, 80));
    }

    #[test]
    fn input_payload_decodes_bytes() {
        let payload = InputPayload::data(&[0x1b, b'[', b'A']);
        assert_eq!(payload.decode_data().unwrap(), Some(vec![0x1b, b'[', b'A']));
        assert_eq!(InputPayload::signal("SIGINT").decode_data().unwrap(), None);
        assert!(InputPayload::default().is_empty());
    }
}
