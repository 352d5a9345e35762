//! Retrieval Pipelines
//!
//! Conditional retrieval pipelines composed on the dataflow engine, and the
//! cached services that front them.
//!
//! Every pipeline follows the same chain: count the documents indexed for
//! the project, embed the query only if there are any, search, filter by
//! score, and format. An empty project never reaches the embedder or the
//! retriever.
//!
//! # Pipelines
//!
//! - **SQL pairs**: question/SQL pairs similar to the query
//! - **Instructions**: scope-aware user instructions, defaults first
//!
//! Collaborators (document stores, embedders, retrievers) are reached only
//! through the traits in [`providers`]; [`memory`] has in-process versions.

pub mod context;
pub mod error;
pub mod instructions;
pub mod memory;
pub mod nodes;
pub mod pipeline;
pub mod providers;
pub mod service;
pub mod settings;
pub mod sql_pairs;

pub use context::{AppContext, Providers};
pub use error::{PipelineError, ProviderError, Result, SettingsError};
pub use instructions::{Instruction, InstructionsRetrieval};
pub use memory::{HashingEmbedder, InMemoryDocumentStore, InMemoryProvider, StoredDocument};
pub use pipeline::{Documents, PipelineOutput, RetrievalPipeline, RetrievalRequest};
pub use providers::{
    DocumentStore, DocumentStoreProvider, Embedder, EmbedderProvider, MetadataFilter, Retriever,
};
pub use service::{RequestKey, RetrievalService};
pub use settings::Settings;
pub use sql_pairs::{SqlPair, SqlPairsRetrieval};
