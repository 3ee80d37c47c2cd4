use sqlx::PgPool;
use std::sync::Arc;

use crate::services::{analysis::OpenAiClient, queue::PgJobStore};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub store: Arc<PgJobStore>,
    pub engine: Arc<OpenAiClient>,
    pub max_images: usize,
}

impl AppState {
    pub fn new(store: Arc<PgJobStore>, engine: Arc<OpenAiClient>, max_images: usize) -> Self {
        Self {
            db: store.pool().clone(),
            store,
            engine,
            max_images,
        }
    }
}
