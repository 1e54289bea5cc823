//! The boundary to the native automation library.
//!
//! Everything below this trait — control lookup, clipboard interaction,
//! window clicking — belongs to the out-of-scope automation library. The
//! bridge only ever talks to it through [`Driver`], one method invocation at
//! a time, plus a single inbound dispatch loop that delivers new-message
//! events on a driver-owned task.

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::mpsc;

use deskchat_types::Variant;

/// A failure raised by the native layer. The session wraps this into the
/// bridge taxonomy; no other exception shape is allowed to escape.
#[derive(Debug, Clone, Error)]
#[error("{detail}")]
pub struct DriverError {
    pub detail: String,
}

impl DriverError {
    pub fn new(detail: impl Into<String>) -> Self {
        Self {
            detail: detail.into(),
        }
    }
}

/// One variant-native method invocation, produced by the capability shim.
#[derive(Debug, Clone)]
pub struct NativeCall {
    pub method: &'static str,
    pub args: Map<String, Value>,
}

impl NativeCall {
    pub fn new(method: &'static str, args: Map<String, Value>) -> Self {
        Self { method, args }
    }
}

/// A raw inbound message event as the native dispatch loop delivers it,
/// before normalization. `chat_name` may still carry a group member-count
/// suffix.
#[derive(Debug, Clone)]
pub struct RawInboundEvent {
    pub chat_name: String,
    pub kind: String,
    pub sender: String,
    pub sender_remark: Option<String>,
    pub id: String,
    pub content: String,
    /// Present when the event carries an attachment that still needs to be
    /// persisted to a local artifact path.
    pub attachment: Option<PendingArtifact>,
}

/// An attachment the out-of-scope persistence routine has yet to resolve.
#[derive(Debug, Clone)]
pub struct PendingArtifact {
    pub suggested_name: String,
}

/// Uniform surface of one native automation library variant.
///
/// The implementation is bound to a single OS-level window focus and is NOT
/// reentrant: callers must serialize `invoke` externally (the bridge does so
/// behind its session lock). `start_dispatch` is called at most once per
/// connection and spawns the driver-owned listener task.
#[async_trait]
pub trait Driver: Send + Sync {
    fn variant(&self) -> Variant;

    /// Acquire the live automation handle.
    async fn connect(&self) -> Result<(), DriverError>;

    /// Invoke one native method against the connected client.
    async fn invoke(&self, call: NativeCall) -> Result<Value, DriverError>;

    /// Start the single inbound dispatch loop, feeding raw events into `tx`.
    async fn start_dispatch(
        &self,
        tx: mpsc::UnboundedSender<RawInboundEvent>,
    ) -> Result<(), DriverError>;

    /// Best-effort label of the logged-in client window.
    async fn window_label(&self) -> Option<String>;

    /// Release the handle. Must be a no-op on an already-released handle.
    async fn disconnect(&self);
}

/// Native method names shared by both variants. The shim owns which uniform
/// operation maps to which of these for a given variant.
pub mod native {
    pub const CHAT_WITH: &str = "ChatWith";
    pub const SEND_MSG: &str = "SendMsg";
    pub const SEND_TYPING_TEXT: &str = "SendTypingText";
    pub const SEND_FILES: &str = "SendFiles";
    pub const ADD_LISTEN_CHAT: &str = "AddListenChat";
    pub const REMOVE_LISTEN_CHAT: &str = "RemoveListenChat";
    pub const GET_NEXT_NEW_MESSAGE: &str = "GetNextNewMessage";
    pub const GET_SESSION_LIST: &str = "GetSessionList";
}
