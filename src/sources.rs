//! The document-source seam.
//!
//! Connectors (Slack, GitHub, Notion, and friends) live outside this crate.
//! They hand the pipeline values implementing [`SourceDocument`], the only
//! contract the indexing core needs from an origin system. Keeping
//! connectors behind a small `Send + Sync` trait lets custom sources plug
//! in without touching the pipeline.

use chrono::{DateTime, Utc};

use crate::chunk::{split_into_chunks, DEFAULT_MAX_TOKENS};
use crate::models::{EmbeddingChunk, Metadata};

/// A document produced by a source connector, ready for indexing.
///
/// # Example
///
/// ```rust
/// use docgraph::models::Metadata;
/// use docgraph::sources::SourceDocument;
///
/// struct IssueDoc {
///     id: String,
///     body: String,
///     number: u64,
/// }
///
/// impl SourceDocument for IssueDoc {
///     fn id(&self) -> &str {
///         &self.id
///     }
///     fn source(&self) -> &str {
///         "github"
///     }
///     fn content(&self) -> &str {
///         &self.body
///     }
///     fn metadata(&self) -> Metadata {
///         Metadata::new()
///     }
///     fn reference_id(&self) -> String {
///         format!("pr_{}", self.number)
///     }
///     fn permission_policy(&self) -> &str {
///         "org"
///     }
/// }
/// ```
pub trait SourceDocument: Send + Sync {
    /// Stable identifier, unique per tenant.
    fn id(&self) -> &str;

    /// Origin connector label (e.g. `"slack"`, `"github"`, `"notion"`).
    fn source(&self) -> &str;

    /// Full text content used for search and embedding.
    fn content(&self) -> &str;

    /// Source-specific metadata. Participates in the content hash, so the
    /// same logical document must always produce the same map.
    fn metadata(&self) -> Metadata;

    fn source_created_at(&self) -> Option<DateTime<Utc>> {
        None
    }

    fn source_updated_at(&self) -> Option<DateTime<Utc>> {
        None
    }

    /// Stable identifier used as the target key when other documents refer
    /// to this one. Defaults to `"{source}_{id}"`; sources with their own
    /// conventions (PR numbers, page slugs) override this.
    fn reference_id(&self) -> String {
        format!("{}_{}", self.source(), self.id())
    }

    /// Access-control policy cached alongside the document for query-time
    /// filtering.
    fn permission_policy(&self) -> &str;

    /// Tokens granted access under the policy.
    fn permission_allowed_tokens(&self) -> Vec<String> {
        Vec::new()
    }

    /// Materialize embedding-ready chunks for this document.
    ///
    /// The default implementation runs the paragraph chunker with the
    /// standard token budget, producing deterministic position-derived
    /// chunk IDs. Sources with structure of their own (message threads,
    /// page blocks) may override, but every chunk should carry a
    /// `deterministic_id` or the document loses incremental diffing.
    fn embedding_chunks(&self) -> Vec<EmbeddingChunk> {
        split_into_chunks(self.id(), self.content(), DEFAULT_MAX_TOKENS)
    }
}
