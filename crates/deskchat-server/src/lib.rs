pub mod http;

pub use http::*;

use std::sync::Arc;

use deskchat_core::BridgeRuntime;

#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<BridgeRuntime>,
    pub api_token: Option<String>,
}

impl AppState {
    pub fn new(runtime: Arc<BridgeRuntime>) -> Self {
        let api_token = runtime.config().api_token.clone();
        Self { runtime, api_token }
    }
}
