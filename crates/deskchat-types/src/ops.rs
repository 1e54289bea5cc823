use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ErrorKind;

/// The uniform operation vocabulary exposed to the request layer.
///
/// Every facade/registry operation is reachable through this closed set; the
/// capability shim maps each entry to the active variant's native call.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum Op {
    Open,
    SendText,
    SendTyping,
    SendAttachment,
    AddWatch,
    RemoveWatch,
    Drain,
    PollNext,
    GetStatus,
}

impl Op {
    pub fn as_str(self) -> &'static str {
        match self {
            Op::Open => "open",
            Op::SendText => "sendText",
            Op::SendTyping => "sendTyping",
            Op::SendAttachment => "sendAttachment",
            Op::AddWatch => "addWatch",
            Op::RemoveWatch => "removeWatch",
            Op::Drain => "drain",
            Op::PollNext => "pollNext",
            Op::GetStatus => "getStatus",
        }
    }
}

/// Uniform response envelope returned to the request layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
}

impl BridgeResponse {
    pub fn ok(data: Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error_kind: None,
            error_detail: None,
        }
    }

    pub fn err(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error_kind: Some(kind),
            error_detail: Some(detail.into()),
        }
    }
}
