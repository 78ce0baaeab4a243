//! Syscall transport: the messages exchanged between the supervisor and
//! an execution context
//!
//! One tagged union per direction. On the wire every message is a JSON
//! object whose `type` field names the variant (kebab-case); fields are
//! camelCase and binary payloads travel base64-encoded.
//!
//! Correlation discipline:
//! - a process-originated syscall carries an `id`; the supervisor answers
//!   with exactly one `syscall-response` for that id
//! - a loopback HTTP request carries a `requestId`; the serving process
//!   answers with one `http-response` for it
//! - responses may arrive in any order

use super::error::TransportError;
use crate::vfs::EntryKind;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::collections::BTreeMap;

/// Correlation id of a syscall or loopback request
pub type CallId = u64;

pub type Headers = BTreeMap<String, String>;

/// Supervisor → process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ToContext {
    /// Run `code` as the main module at `path`
    Execute { code: String, path: String },

    /// One node of the flattened host filesystem
    WriteVirtualEntry {
        path: String,
        kind: EntryKind,
        #[serde(
            default,
            with = "base64_opt",
            skip_serializing_if = "Option::is_none"
        )]
        content: Option<Vec<u8>>,
    },

    /// Answer to a syscall. Build with [`ToContext::response`].
    SyscallResponse {
        id: CallId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Json>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// Loopback HTTP request for a server listening in this process
    #[serde(rename_all = "camelCase")]
    NetRequest {
        port: u16,
        method: String,
        url: String,
        request_id: CallId,
        #[serde(default)]
        headers: Headers,
        #[serde(
            default,
            with = "base64_opt",
            skip_serializing_if = "Option::is_none"
        )]
        body: Option<Vec<u8>>,
    },

    /// Bytes received on a host-side stream
    #[serde(rename_all = "camelCase")]
    NetTcpData {
        stream_id: u64,
        data: String,
        #[serde(default)]
        encoding: DataEncoding,
    },

    /// A host-side stream closed
    #[serde(rename_all = "camelCase")]
    NetTcpClose {
        stream_id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// Keyboard input for the process's stdin
    TtyInput { data: String },
}

impl ToContext {
    /// Build a syscall response; carries a result or an error, never both
    pub fn response(id: CallId, result: Result<Json, String>) -> Self {
        match result {
            Ok(value) => ToContext::SyscallResponse {
                id,
                result: Some(value),
                error: None,
            },
            Err(message) => ToContext::SyscallResponse {
                id,
                result: None,
                error: Some(message),
            },
        }
    }

    /// Wire name of this message
    pub fn kind(&self) -> &'static str {
        match self {
            ToContext::Execute { .. } => "execute",
            ToContext::WriteVirtualEntry { .. } => "write-virtual-entry",
            ToContext::SyscallResponse { .. } => "syscall-response",
            ToContext::NetRequest { .. } => "net-request",
            ToContext::NetTcpData { .. } => "net-tcp-data",
            ToContext::NetTcpClose { .. } => "net-tcp-close",
            ToContext::TtyInput { .. } => "tty-input",
        }
    }
}

/// Settlement carried by a syscall response
///
/// A response without a result or an error settles with `null`.
pub fn settlement(
    result: Option<Json>,
    error: Option<String>,
) -> Result<Result<Json, String>, TransportError> {
    match (result, error) {
        (Some(_), Some(_)) => Err(TransportError::Malformed(
            "syscall-response carries both result and error".to_string(),
        )),
        (_, Some(error)) => Ok(Err(error)),
        (result, None) => Ok(Ok(result.unwrap_or(Json::Null))),
    }
}

/// Process → supervisor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum FromContext {
    Log {
        text: String,
        #[serde(default)]
        level: LogLevel,
    },

    /// Bind a port for loopback traffic. Never answered.
    NetListen { port: u16 },

    #[serde(rename_all = "camelCase")]
    FsRead {
        id: CallId,
        path: String,
        #[serde(default)]
        as_text: bool,
    },

    FsWrite {
        id: CallId,
        path: String,
        #[serde(with = "base64_bytes")]
        content: Vec<u8>,
    },

    FsList { id: CallId, path: String },

    FsMkdir { id: CallId, path: String },

    FsRemove { id: CallId, path: String },

    FsStat { id: CallId, path: String },

    /// Outbound HTTP, mediated by the supervisor
    NetFetch { id: CallId, request: FetchRequest },

    #[serde(rename_all = "camelCase")]
    NetTcpOpen {
        id: CallId,
        host: String,
        port: u16,
        #[serde(default)]
        tls: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        server_name: Option<String>,
        #[serde(default)]
        insecure: bool,
    },

    /// `data` is base64 text
    #[serde(rename_all = "camelCase")]
    NetTcpWrite {
        id: CallId,
        stream_id: u64,
        data: String,
    },

    #[serde(rename_all = "camelCase")]
    NetTcpClose { id: CallId, stream_id: u64 },

    /// Answer to a `net-request`
    #[serde(rename_all = "camelCase")]
    HttpResponse {
        request_id: CallId,
        status: u16,
        #[serde(default)]
        headers: Headers,
        #[serde(default, with = "base64_bytes")]
        body: Vec<u8>,
    },

    TtyWrite {
        data: String,
        #[serde(default)]
        stream: StdStream,
    },

    ProcExit { code: i32 },
}

impl FromContext {
    /// Correlation id when this message expects a `syscall-response`
    pub fn call_id(&self) -> Option<CallId> {
        match self {
            FromContext::FsRead { id, .. }
            | FromContext::FsWrite { id, .. }
            | FromContext::FsList { id, .. }
            | FromContext::FsMkdir { id, .. }
            | FromContext::FsRemove { id, .. }
            | FromContext::FsStat { id, .. }
            | FromContext::NetFetch { id, .. }
            | FromContext::NetTcpOpen { id, .. }
            | FromContext::NetTcpWrite { id, .. }
            | FromContext::NetTcpClose { id, .. } => Some(*id),
            _ => None,
        }
    }
}

/// Severity of a console line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    #[default]
    Log,
    Info,
    Warn,
    Error,
    Debug,
}

/// Which standard stream a TTY write targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StdStream {
    #[default]
    Stdout,
    Stderr,
}

/// Text encoding of a stream payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataEncoding {
    #[default]
    Base64,
    Utf8,
}

impl DataEncoding {
    pub fn decode(self, data: &str) -> Result<Vec<u8>, String> {
        match self {
            DataEncoding::Base64 => decode_base64(data),
            DataEncoding::Utf8 => Ok(data.as_bytes().to_vec()),
        }
    }
}

/// An outbound HTTP request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchRequest {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: Headers,
    #[serde(
        default,
        with = "base64_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub body: Option<Vec<u8>>,
}

fn default_method() -> String {
    "GET".to_string()
}

impl FetchRequest {
    pub fn get(url: &str) -> Self {
        Self {
            url: url.to_string(),
            method: default_method(),
            headers: Headers::new(),
            body: None,
        }
    }

    pub fn method(mut self, method: &str) -> Self {
        self.method = method.to_ascii_uppercase();
        self
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_string(), value.to_string());
        self
    }

    pub fn body(mut self, data: Vec<u8>) -> Self {
        self.body = Some(data);
        self
    }
}

/// An HTTP response, from the host network or a loopback server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchResponse {
    pub status: u16,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default, with = "base64_bytes")]
    pub body: Vec<u8>,
}

impl FetchResponse {
    /// Get body as UTF-8 string
    pub fn text(&self) -> Result<String, std::string::FromUtf8Error> {
        String::from_utf8(self.body.clone())
    }

    pub fn is_ok(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

// ============================================================================
// JSON codec
// ============================================================================

/// Serialize a message for the wire
pub fn encode<T: Serialize>(message: &T) -> Result<String, TransportError> {
    serde_json::to_string(message).map_err(|e| TransportError::Malformed(e.to_string()))
}

/// Decode a supervisor → process message
pub fn decode_to_context(text: &str) -> Result<ToContext, TransportError> {
    let message: ToContext = decode_tagged(text)?;
    if let ToContext::SyscallResponse { result, error, .. } = &message
        && result.is_some()
        && error.is_some()
    {
        return Err(TransportError::Malformed(
            "syscall-response carries both result and error".to_string(),
        ));
    }
    Ok(message)
}

/// Decode a process → supervisor message
pub fn decode_from_context(text: &str) -> Result<FromContext, TransportError> {
    decode_tagged(text)
}

fn decode_tagged<T: serde::de::DeserializeOwned>(text: &str) -> Result<T, TransportError> {
    let value: Json =
        serde_json::from_str(text).map_err(|e| TransportError::Malformed(e.to_string()))?;

    let kind = match value.get("type") {
        Some(Json::String(kind)) => kind.clone(),
        Some(_) => return Err(TransportError::Malformed("type is not a string".to_string())),
        None => return Err(TransportError::Malformed("missing type".to_string())),
    };

    serde_json::from_value(value).map_err(|e| {
        let message = e.to_string();
        if message.starts_with("unknown variant") {
            TransportError::UnknownType(kind)
        } else {
            TransportError::Malformed(message)
        }
    })
}

/// Numeric `id` of an undecodable message, so the sender can be answered
/// with an error envelope instead of waiting forever
pub fn salvage_call_id(text: &str) -> Option<CallId> {
    serde_json::from_str::<Json>(text)
        .ok()?
        .get("id")?
        .as_u64()
}

/// Error envelope for a message that could not be decoded, if it carried
/// an id
pub fn rejection(text: &str, error: &TransportError) -> Option<ToContext> {
    salvage_call_id(text).map(|id| ToContext::response(id, Err(error.to_string())))
}

pub fn encode_base64(data: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(data)
}

pub fn decode_base64(text: &str) -> Result<Vec<u8>, String> {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD
        .decode(text)
        .map_err(|e| format!("invalid base64: {}", e))
}

mod base64_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::encode_base64(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        super::decode_base64(&text).map_err(serde::de::Error::custom)
    }
}

mod base64_opt {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error> {
        match data {
            Some(bytes) => serializer.serialize_some(&super::encode_base64(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            Some(text) => super::decode_base64(&text)
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_names() {
        let text = encode(&ToContext::WriteVirtualEntry {
            path: "/a.txt".to_string(),
            kind: EntryKind::File,
            content: Some(b"hi".to_vec()),
        })
        .unwrap();
        let value: Json = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "write-virtual-entry");
        assert_eq!(value["kind"], "file");
        assert_eq!(value["content"], "aGk=");

        let text = encode(&FromContext::NetTcpWrite {
            id: 3,
            stream_id: 9,
            data: "AAE=".to_string(),
        })
        .unwrap();
        let value: Json = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "net-tcp-write");
        assert_eq!(value["streamId"], 9);
    }

    #[test]
    fn test_directory_entry_has_no_content() {
        let text = encode(&ToContext::WriteVirtualEntry {
            path: "/dir".to_string(),
            kind: EntryKind::Directory,
            content: None,
        })
        .unwrap();
        assert!(!text.contains("content"));

        let back = decode_to_context(&text).unwrap();
        assert_eq!(
            back,
            ToContext::WriteVirtualEntry {
                path: "/dir".to_string(),
                kind: EntryKind::Directory,
                content: None,
            }
        );
    }

    #[test]
    fn test_response_carries_one_side() {
        let ok = encode(&ToContext::response(1, Ok(json!({"a": 1})))).unwrap();
        assert!(ok.contains("result") && !ok.contains("error"));

        let err = encode(&ToContext::response(2, Err("boom".to_string()))).unwrap();
        assert!(err.contains("error") && !err.contains("result"));
    }

    #[test]
    fn test_response_with_both_sides_is_malformed() {
        let text = r#"{"type":"syscall-response","id":4,"result":1,"error":"x"}"#;
        assert!(matches!(
            decode_to_context(text),
            Err(TransportError::Malformed(_))
        ));
        assert!(settlement(Some(json!(1)), Some("x".to_string())).is_err());
    }

    #[test]
    fn test_empty_response_settles_null() {
        let text = r#"{"type":"syscall-response","id":4,"result":null}"#;
        match decode_to_context(text).unwrap() {
            ToContext::SyscallResponse { id, result, error } => {
                assert_eq!(id, 4);
                assert_eq!(settlement(result, error).unwrap(), Ok(Json::Null));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_decode_from_context_defaults() {
        let msg = decode_from_context(r#"{"type":"log","text":"hello"}"#).unwrap();
        assert_eq!(
            msg,
            FromContext::Log {
                text: "hello".to_string(),
                level: LogLevel::Log
            }
        );

        let msg = decode_from_context(
            r#"{"type":"net-fetch","id":7,"request":{"url":"http://localhost:3000/"}}"#,
        )
        .unwrap();
        assert_eq!(msg.call_id(), Some(7));
        match msg {
            FromContext::NetFetch { request, .. } => assert_eq!(request.method, "GET"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unknown_and_malformed() {
        assert_eq!(
            decode_from_context(r#"{"type":"teleport","id":1}"#),
            Err(TransportError::UnknownType("teleport".to_string()))
        );
        assert!(matches!(
            decode_from_context("{not json"),
            Err(TransportError::Malformed(_))
        ));
        assert!(matches!(
            decode_from_context(r#"{"id":1}"#),
            Err(TransportError::Malformed(_))
        ));
        assert!(matches!(
            decode_from_context(r#"{"type":"fs-read","id":1}"#),
            Err(TransportError::Malformed(_))
        ));
    }

    #[test]
    fn test_rejection_answers_salvaged_id() {
        let text = r#"{"type":"fs-read","id":12}"#;
        let err = decode_from_context(text).unwrap_err();
        match rejection(text, &err) {
            Some(ToContext::SyscallResponse { id, result, error }) => {
                assert_eq!(id, 12);
                assert!(result.is_none());
                assert!(error.unwrap().contains("malformed"));
            }
            other => panic!("unexpected {:?}", other),
        }

        assert!(rejection("garbage", &err).is_none());
    }

    #[test]
    fn test_invalid_base64_is_malformed() {
        let text = r#"{"type":"fs-write","id":1,"path":"/x","content":"@@@"}"#;
        assert!(matches!(
            decode_from_context(text),
            Err(TransportError::Malformed(_))
        ));
    }

    #[test]
    fn test_data_encoding_decode() {
        assert_eq!(DataEncoding::Base64.decode("aGk=").unwrap(), b"hi");
        assert_eq!(DataEncoding::Utf8.decode("hi").unwrap(), b"hi");
        assert!(DataEncoding::Base64.decode("!!").is_err());
    }
}
