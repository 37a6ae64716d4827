use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};

use infiniproxy_provider_core::{ModelResolver, UsageSink};
use infiniproxy_transform::TranslatorConfig;

use crate::auth::Authenticator;
use crate::handler::{
    CHAT_COMPLETIONS_ENDPOINT, MESSAGES_ENDPOINT, chat_completions, create_message, health,
    service_info,
};
use crate::invoker::CompletionInvoker;

pub struct CoreState {
    pub resolver: ModelResolver,
    pub invoker: CompletionInvoker,
    pub auth: Authenticator,
    pub usage: Arc<dyn UsageSink>,
    pub translator: TranslatorConfig,
}

pub struct Core {
    state: Arc<CoreState>,
}

impl Core {
    pub fn new(state: CoreState) -> Self {
        Self {
            state: Arc::new(state),
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/", get(service_info))
            .route("/health", get(health))
            .route(MESSAGES_ENDPOINT, post(create_message))
            .route(CHAT_COMPLETIONS_ENDPOINT, post(chat_completions))
            .with_state(self.state.clone())
    }

    pub fn state(&self) -> Arc<CoreState> {
        self.state.clone()
    }
}
