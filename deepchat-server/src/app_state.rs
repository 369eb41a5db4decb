use std::sync::Arc;

use shared::{config::Config, llm::LanguageModel};

use crate::{
    auth::session::SessionResolver,
    services::{chat_store::ChatStore, title_service::TitleSummarizer},
};

/// Application state shared across all routes. Every collaborator is an
/// injected trait object so tests can substitute fakes.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<dyn ChatStore>,
    pub model: Arc<dyn LanguageModel>,
    pub titles: Arc<dyn TitleSummarizer>,
    pub sessions: Arc<dyn SessionResolver>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState").finish_non_exhaustive()
    }
}
