//! Application context
//!
//! Built once at startup from [`Settings`] and the configured providers,
//! then passed by reference to whatever serves requests.

use std::sync::Arc;

use dataflow_engine::{EventSink, LogEventSink};

use crate::error::Result;
use crate::instructions::InstructionsRetrieval;
use crate::providers::{DocumentStoreProvider, EmbedderProvider};
use crate::service::RetrievalService;
use crate::settings::Settings;
use crate::sql_pairs::SqlPairsRetrieval;

/// Collaborator factories for every pipeline
#[derive(Clone)]
pub struct Providers {
    pub embedder: Arc<dyn EmbedderProvider>,
    pub document_store: Arc<dyn DocumentStoreProvider>,
    pub event_sink: Arc<dyn EventSink>,
}

impl Providers {
    /// Providers reporting execution events to the log
    pub fn new(
        embedder: Arc<dyn EmbedderProvider>,
        document_store: Arc<dyn DocumentStoreProvider>,
    ) -> Self {
        Self {
            embedder,
            document_store,
            event_sink: Arc::new(LogEventSink),
        }
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }
}

/// The cached retrieval services of one process
pub struct AppContext {
    settings: Settings,
    sql_pairs: RetrievalService<SqlPairsRetrieval>,
    instructions: RetrievalService<InstructionsRetrieval>,
}

impl AppContext {
    pub fn new(settings: Settings, providers: &Providers) -> Result<Self> {
        settings.validate()?;

        let mut sql_pairs = SqlPairsRetrieval::new(
            providers.embedder.as_ref(),
            providers.document_store.as_ref(),
            settings.sql_pairs_filter(),
        )?
        .with_event_sink(Arc::clone(&providers.event_sink));

        let mut instructions = InstructionsRetrieval::new(
            providers.embedder.as_ref(),
            providers.document_store.as_ref(),
            settings.instructions_filter(),
        )?
        .with_event_sink(Arc::clone(&providers.event_sink));

        if let Some(timeout) = settings.node_timeout() {
            sql_pairs = sql_pairs.with_node_timeout(timeout);
            instructions = instructions.with_node_timeout(timeout);
        }

        let maxsize = settings.query_cache_maxsize;
        let ttl = settings.query_cache_ttl();
        log::info!(
            "Retrieval services ready (cache maxsize {}, ttl {:?})",
            maxsize,
            ttl
        );

        Ok(Self {
            sql_pairs: RetrievalService::new(sql_pairs, maxsize, ttl),
            instructions: RetrievalService::new(instructions, maxsize, ttl),
            settings,
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn sql_pairs(&self) -> &RetrievalService<SqlPairsRetrieval> {
        &self.sql_pairs
    }

    pub fn instructions(&self) -> &RetrievalService<InstructionsRetrieval> {
        &self.instructions
    }
}
