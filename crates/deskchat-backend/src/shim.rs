//! Per-variant capability table.
//!
//! The table is static: every uniform operation resolves to exactly one of
//! `Unsupported`, `Local` (handled by the bridge itself, never forwarded), or
//! a native method plus a deterministic parameter filter. There is no by-name
//! reflection at call time — an unsupported operation fails before anything
//! touches the backend session.

use serde_json::{Map, Value};

use deskchat_types::{BridgeError, Op, Variant};

use crate::driver::{native, NativeCall};
use crate::session::BackendSession;

type ParamFilter = fn(Map<String, Value>) -> Map<String, Value>;

/// How one uniform operation maps onto the active variant.
pub enum Capability {
    /// No native mapping exists for this variant.
    Unsupported,
    /// Served by the bridge (registry/cache); never reaches the driver.
    Local,
    Native {
        method: &'static str,
        filter: ParamFilter,
    },
}

/// Resolve the table entry for `(op, variant)`. Total over both enums.
pub fn capability(op: Op, variant: Variant) -> Capability {
    match (op, variant) {
        (Op::Open, Variant::Standard) => Capability::Native {
            method: native::CHAT_WITH,
            filter: drop_exact,
        },
        (Op::Open, Variant::Plus) => Capability::Native {
            method: native::CHAT_WITH,
            filter: identity,
        },

        (Op::SendText, Variant::Standard) => Capability::Native {
            method: native::SEND_MSG,
            filter: send_text_standard,
        },
        (Op::SendText, Variant::Plus) => Capability::Native {
            method: native::SEND_MSG,
            filter: send_text_plus,
        },

        // The standard library has no typing-simulation call; surfacing the
        // gap beats silently downgrading to a plain send.
        (Op::SendTyping, Variant::Standard) => Capability::Unsupported,
        (Op::SendTyping, Variant::Plus) => Capability::Native {
            method: native::SEND_TYPING_TEXT,
            filter: send_text_plus,
        },

        (Op::SendAttachment, _) => Capability::Native {
            method: native::SEND_FILES,
            filter: identity,
        },

        (Op::AddWatch, Variant::Standard) => Capability::Native {
            method: native::ADD_LISTEN_CHAT,
            filter: watch_options_standard,
        },
        (Op::AddWatch, Variant::Plus) => Capability::Native {
            method: native::ADD_LISTEN_CHAT,
            filter: watch_options_plus,
        },

        (Op::RemoveWatch, _) => Capability::Native {
            method: native::REMOVE_LISTEN_CHAT,
            filter: identity,
        },

        (Op::PollNext, Variant::Standard) => Capability::Native {
            method: native::GET_NEXT_NEW_MESSAGE,
            filter: poll_next_standard,
        },
        (Op::PollNext, Variant::Plus) => Capability::Native {
            method: native::GET_NEXT_NEW_MESSAGE,
            filter: poll_next_plus,
        },

        (Op::Drain, _) | (Op::GetStatus, _) => Capability::Local,
    }
}

// ---------------------------------------------------------------------------
// Parameter filters
// ---------------------------------------------------------------------------
//
// Each filter is deterministic and total: one uniform argument set maps to
// exactly one variant-native argument set.

fn identity(args: Map<String, Value>) -> Map<String, Value> {
    args
}

/// The standard variant's open call has no `exact` flag.
fn drop_exact(mut args: Map<String, Value>) -> Map<String, Value> {
    args.remove("exact");
    args
}

/// Rename uniform send args to their native names.
fn send_text_common(mut args: Map<String, Value>) -> Map<String, Value> {
    if let Some(text) = args.remove("text") {
        args.insert("msg".into(), text);
    }
    if let Some(mentions) = args.remove("mentions") {
        args.insert("at".into(), mentions);
    }
    args
}

fn send_text_plus(args: Map<String, Value>) -> Map<String, Value> {
    send_text_common(args)
}

/// The standard variant expects `clear` as a `"1"`/`"0"` string.
fn send_text_standard(args: Map<String, Value>) -> Map<String, Value> {
    let mut args = send_text_common(args);
    if let Some(Value::Bool(clear)) = args.get("clear").cloned() {
        args.insert("clear".into(), Value::String(if clear { "1" } else { "0" }.into()));
    }
    args
}

/// Map uniform watch options to native flag names.
fn watch_options_common(mut args: Map<String, Value>) -> Map<String, Value> {
    for (uniform, native_name) in [
        ("save_images", "savepic"),
        ("save_files", "savefile"),
        ("save_voice", "savevoice"),
        ("save_video", "savevideo"),
        ("parse_links", "parseurl"),
    ] {
        if let Some(v) = args.remove(uniform) {
            args.insert(native_name.into(), v);
        }
    }
    args
}

fn watch_options_plus(args: Map<String, Value>) -> Map<String, Value> {
    watch_options_common(args)
}

/// The standard variant rejects video persistence and link parsing.
fn watch_options_standard(args: Map<String, Value>) -> Map<String, Value> {
    let mut args = watch_options_common(args);
    args.remove("savevideo");
    args.remove("parseurl");
    args
}

fn poll_next_standard(args: Map<String, Value>) -> Map<String, Value> {
    let mut args = watch_options_standard(args);
    args.remove("filter_mute");
    args
}

/// Plus accepts only `filter_mute`, defaulted to false.
fn poll_next_plus(args: Map<String, Value>) -> Map<String, Value> {
    let mut out = Map::new();
    let filter_mute = args
        .get("filter_mute")
        .cloned()
        .unwrap_or(Value::Bool(false));
    out.insert("filter_mute".into(), filter_mute);
    out
}

// ---------------------------------------------------------------------------
// Shim
// ---------------------------------------------------------------------------

/// Translates the uniform vocabulary into variant-correct native calls.
#[derive(Debug, Clone, Copy)]
pub struct CapabilityShim {
    variant: Variant,
}

impl CapabilityShim {
    pub fn new(variant: Variant) -> Self {
        Self { variant }
    }

    pub fn variant(&self) -> Variant {
        self.variant
    }

    pub fn supports(&self, op: Op) -> bool {
        !matches!(capability(op, self.variant), Capability::Unsupported)
    }

    /// Resolve `op` to a native call, or fail without touching the session.
    pub fn translate(&self, op: Op, args: Map<String, Value>) -> Result<NativeCall, BridgeError> {
        match capability(op, self.variant) {
            Capability::Unsupported => Err(BridgeError::UnsupportedOperation {
                op,
                variant: self.variant,
            }),
            Capability::Local => Err(BridgeError::InvalidRequest {
                detail: format!("{} is served locally and has no native mapping", op.as_str()),
            }),
            Capability::Native { method, filter } => Ok(NativeCall::new(method, filter(args))),
        }
    }

    /// Translate and invoke in one step.
    pub async fn call(
        &self,
        session: &BackendSession,
        op: Op,
        args: Map<String, Value>,
    ) -> Result<Value, BridgeError> {
        let call = self.translate(op, args)?;
        session.invoke(call).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn args(value: Value) -> Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn open_drops_exact_for_standard_only() {
        let shim = CapabilityShim::new(Variant::Standard);
        let call = shim
            .translate(Op::Open, args(json!({"who": "Alice", "exact": true})))
            .unwrap();
        assert_eq!(call.method, native::CHAT_WITH);
        assert!(!call.args.contains_key("exact"));

        let shim = CapabilityShim::new(Variant::Plus);
        let call = shim
            .translate(Op::Open, args(json!({"who": "Alice", "exact": true})))
            .unwrap();
        assert_eq!(call.args["exact"], json!(true));
    }

    #[test]
    fn send_text_coerces_clear_flag_for_standard() {
        let shim = CapabilityShim::new(Variant::Standard);
        let call = shim
            .translate(
                Op::SendText,
                args(json!({"who": "Alice", "text": "hi", "clear": true})),
            )
            .unwrap();
        assert_eq!(call.method, native::SEND_MSG);
        assert_eq!(call.args["msg"], json!("hi"));
        assert_eq!(call.args["clear"], json!("1"));
        assert!(!call.args.contains_key("text"));

        let shim = CapabilityShim::new(Variant::Plus);
        let call = shim
            .translate(
                Op::SendText,
                args(json!({"who": "Alice", "text": "hi", "clear": true})),
            )
            .unwrap();
        assert_eq!(call.args["clear"], json!(true));
    }

    #[test]
    fn send_typing_is_gated_by_variant() {
        let standard = CapabilityShim::new(Variant::Standard);
        let err = standard
            .translate(Op::SendTyping, args(json!({"who": "Alice", "text": "hi"})))
            .unwrap_err();
        assert!(matches!(err, BridgeError::UnsupportedOperation { .. }));

        let plus = CapabilityShim::new(Variant::Plus);
        let call = plus
            .translate(Op::SendTyping, args(json!({"who": "Alice", "text": "hi"})))
            .unwrap();
        assert_eq!(call.method, native::SEND_TYPING_TEXT);
        assert_eq!(call.args["msg"], json!("hi"));
    }

    #[test]
    fn watch_options_map_to_native_flags() {
        let input = json!({
            "who": "Team",
            "save_images": true,
            "save_files": false,
            "save_voice": true,
            "save_video": true,
            "parse_links": true,
        });

        let standard = CapabilityShim::new(Variant::Standard)
            .translate(Op::AddWatch, args(input.clone()))
            .unwrap();
        assert_eq!(standard.args["savepic"], json!(true));
        assert_eq!(standard.args["savevoice"], json!(true));
        assert!(!standard.args.contains_key("savevideo"));
        assert!(!standard.args.contains_key("parseurl"));

        let plus = CapabilityShim::new(Variant::Plus)
            .translate(Op::AddWatch, args(input))
            .unwrap();
        assert_eq!(plus.args["savevideo"], json!(true));
        assert_eq!(plus.args["parseurl"], json!(true));
    }

    #[test]
    fn poll_next_plus_keeps_only_filter_mute() {
        let call = CapabilityShim::new(Variant::Plus)
            .translate(
                Op::PollNext,
                args(json!({"save_images": true, "filter_mute": true})),
            )
            .unwrap();
        assert_eq!(call.args.len(), 1);
        assert_eq!(call.args["filter_mute"], json!(true));

        // Defaulted when absent.
        let call = CapabilityShim::new(Variant::Plus)
            .translate(Op::PollNext, Map::new())
            .unwrap();
        assert_eq!(call.args["filter_mute"], json!(false));
    }

    #[test]
    fn local_ops_never_translate() {
        for op in [Op::Drain, Op::GetStatus] {
            let err = CapabilityShim::new(Variant::Standard)
                .translate(op, Map::new())
                .unwrap_err();
            assert!(matches!(err, BridgeError::InvalidRequest { .. }));
        }
    }

    #[test]
    fn filters_are_deterministic() {
        let input = args(json!({"who": "Alice", "text": "x", "clear": false}));
        let a = CapabilityShim::new(Variant::Standard)
            .translate(Op::SendText, input.clone())
            .unwrap();
        let b = CapabilityShim::new(Variant::Standard)
            .translate(Op::SendText, input)
            .unwrap();
        assert_eq!(a.args, b.args);
        assert_eq!(a.args["clear"], json!("0"));
    }
}
