//! Field-aware token index with position-weighted scoring.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info};

use super::{DocId, PostingList, tokenize};
use crate::compaction::{CompactionStats, Decompressor};
use crate::partition::builder::PartitionBuilder;
use crate::partition::{CatalogPartition, FilePartition, PartitionError, sanitize_segment};
use crate::store::{Store, StoreError, StoreOptions};

type PostingStore = Store<String, DocId, PostingList, String>;

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors produced by the token index.
#[derive(Debug, Error)]
pub enum PostingsError {
    /// A field descriptor is unusable.
    #[error("invalid field: {0}")]
    InvalidField(String),

    #[error("{0}")]
    Store(#[from] StoreError),

    #[error("{0}")]
    Partition(#[from] PartitionError),
}

// ------------------------------------------------------------------------------------------------
// Fields
// ------------------------------------------------------------------------------------------------

/// One indexed field of a document type `D`.
pub struct FieldDescriptor<D> {
    /// Field name; also the name of the field's partition.
    pub name: String,

    /// Multiplier applied to the field's score.
    ///
    /// Default: 1.0. Must be finite and ≥ 0.
    pub boost: f64,

    /// Whether the field takes part in exact-match searches.
    ///
    /// Default: `false`.
    pub exact_match: bool,

    /// Extracts the field's text from a document.
    pub accessor: Arc<dyn Fn(&D) -> String + Send + Sync>,
}

impl<D> FieldDescriptor<D> {
    pub fn new(
        name: impl Into<String>,
        accessor: impl Fn(&D) -> String + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            boost: 1.0,
            exact_match: false,
            accessor: Arc::new(accessor),
        }
    }

    pub fn with_boost(mut self, boost: f64) -> Self {
        self.boost = boost;
        self
    }

    pub fn with_exact_match(mut self, exact_match: bool) -> Self {
        self.exact_match = exact_match;
        self
    }
}

impl<D> Clone for FieldDescriptor<D> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            boost: self.boost,
            exact_match: self.exact_match,
            accessor: Arc::clone(&self.accessor),
        }
    }
}

impl<D> fmt::Debug for FieldDescriptor<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldDescriptor")
            .field("name", &self.name)
            .field("boost", &self.boost)
            .field("exact_match", &self.exact_match)
            .finish_non_exhaustive()
    }
}

fn validate_fields<D>(fields: &[FieldDescriptor<D>]) -> Result<(), PostingsError> {
    if fields.is_empty() {
        return Err(PostingsError::InvalidField("at least one field is required".into()));
    }
    let mut seen = HashSet::new();
    for field in fields {
        let segment = sanitize_segment(&field.name, "field")
            .map_err(|e| PostingsError::InvalidField(e.to_string()))?;
        if !seen.insert(segment) {
            return Err(PostingsError::InvalidField(format!(
                "field '{}' is declared twice",
                field.name
            )));
        }
        if !field.boost.is_finite() || field.boost < 0.0 {
            return Err(PostingsError::InvalidField(format!(
                "field '{}' has boost {}, expected a finite value >= 0",
                field.name, field.boost
            )));
        }
    }
    Ok(())
}

// ------------------------------------------------------------------------------------------------
// Scoring
// ------------------------------------------------------------------------------------------------

/// One search result.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchHit {
    pub doc: DocId,
    pub score: f64,
}

/// Matches of one document within one field.
#[derive(Debug, Default)]
struct FieldMatch {
    accumulated: f64,
    occurrences: usize,
    last_position: Option<usize>,
}

impl FieldMatch {
    /// The document contains the query token at `position`.
    ///
    /// The first match counts 1.  Every later match counts `1 + 1/gap`,
    /// `gap` being the distance to the previous matching position, so
    /// tokens found close together score higher.
    fn record(&mut self, position: usize) {
        self.accumulated += match self.last_position {
            None => 1.0,
            Some(previous) => 1.0 + 1.0 / (position - previous) as f64,
        };
        self.occurrences += 1;
        self.last_position = Some(position);
    }

    fn score(&self, token_count: usize, boost: f64, exact_match: bool) -> f64 {
        if exact_match {
            return if self.occurrences == token_count { boost } else { 0.0 };
        }
        self.accumulated / token_count as f64 * self.occurrences as f64 * boost
    }
}

// ------------------------------------------------------------------------------------------------
// Index
// ------------------------------------------------------------------------------------------------

/// Token index over documents of type `D`.
pub struct TokenIndex<D> {
    store: PostingStore,
    fields: Vec<FieldDescriptor<D>>,
    doc_id: Arc<dyn Fn(&D) -> DocId + Send + Sync>,
}

impl<D> fmt::Debug for TokenIndex<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenIndex")
            .field("store", &self.store)
            .field("fields", &self.fields)
            .finish_non_exhaustive()
    }
}

impl<D> TokenIndex<D> {
    /// Open the index stored under `root` with default store settings.
    pub fn open(
        root: impl Into<PathBuf>,
        fields: Vec<FieldDescriptor<D>>,
        doc_id: impl Fn(&D) -> DocId + Send + Sync + 'static,
    ) -> Result<Self, PostingsError> {
        let options = StoreOptions {
            root_folder: root.into(),
            ..StoreOptions::default()
        };
        Self::with_options(options, fields, doc_id)
    }

    /// Open the index with custom store settings.
    ///
    /// The partitioning and merge settings of `options` are replaced by
    /// the index's own.
    pub fn with_options(
        mut options: StoreOptions<String, DocId, PostingList, String>,
        fields: Vec<FieldDescriptor<D>>,
        doc_id: impl Fn(&D) -> DocId + Send + Sync + 'static,
    ) -> Result<Self, PostingsError> {
        validate_fields(&fields)?;
        options.catalog_partitions = vec![CatalogPartition::new("field", |field: &String| {
            field.clone()
        })];
        options.file_partition = Some(FilePartition::new(
            "first_char",
            |token: &String, _: &String| {
                token
                    .chars()
                    .next()
                    .map_or_else(|| "_".to_string(), |c| c.to_string())
            },
        ));
        options.merge_function = Some(Arc::new(PostingList::from_ids));

        let store = Store::open(options)?;
        info!(fields = fields.len(), "token index opened");
        Ok(Self {
            store,
            fields,
            doc_id: Arc::new(doc_id),
        })
    }

    /// The underlying store.
    pub fn store(&self) -> &PostingStore {
        &self.store
    }

    pub fn fields(&self) -> &[FieldDescriptor<D>] {
        &self.fields
    }

    /// Writer that rebuilds the index from scratch.
    ///
    /// Existing postings are deleted when the writer is created.
    pub fn writer(&self) -> Result<TokenIndexWriter<'_, D>, PostingsError> {
        let mut builders = Vec::with_capacity(self.fields.len());
        for field in &self.fields {
            self.store.remove_partition(&field.name)?;
            builders.push(self.store.create_builder(field.name.clone())?);
        }
        Ok(TokenIndexWriter {
            index: self,
            builders,
        })
    }

    /// Add `docs` to an existing index.
    ///
    /// Only the buckets of the tokens found in `docs` are rewritten.
    pub fn append<'d>(
        &self,
        docs: impl IntoIterator<Item = &'d D>,
    ) -> Result<CompactionStats, PostingsError>
    where
        D: 'd,
    {
        let decompress: Decompressor<PostingList, DocId> =
            Arc::new(|list: &PostingList| list.ids().to_vec());
        let mut mergers = Vec::with_capacity(self.fields.len());
        for field in &self.fields {
            mergers.push(
                self.store
                    .create_merge_accessor(field.name.clone(), Arc::clone(&decompress))?,
            );
        }

        let mut documents = 0usize;
        for doc in docs {
            let id = (self.doc_id)(doc);
            for (field, merger) in self.fields.iter().zip(&mergers) {
                for token in tokenize(&(field.accessor)(doc)) {
                    merger.store(&token, &id)?;
                }
            }
            documents += 1;
        }

        let mut stats = CompactionStats::default();
        for merger in &mergers {
            stats += merger.compress()?;
        }
        info!(documents, buckets = stats.buckets, "documents appended");
        Ok(stats)
    }

    /// Rank documents against `text`.
    ///
    /// Each field scores a document by how many query tokens it contains
    /// and how close together they are, times the field's boost.  With
    /// `exact_match`, only fields marked for it take part, and a field
    /// scores its boost only for documents containing every query token.
    /// Field scores are summed; hits are ordered by descending score,
    /// then by document id.
    pub fn search(&self, text: &str, exact_match: bool) -> Result<Vec<SearchHit>, PostingsError> {
        let tokens = tokenize(text);
        if tokens.is_empty() {
            return Ok(Vec::new());
        }

        let mut totals: HashMap<DocId, f64> = HashMap::new();
        for field in &self.fields {
            if exact_match && !field.exact_match {
                continue;
            }
            let accessor = self.store.create_accessor(field.name.clone())?;
            let mut matches: HashMap<DocId, FieldMatch> = HashMap::new();
            for (position, token) in tokens.iter().enumerate() {
                let Some(list) = accessor.find(token)? else {
                    continue;
                };
                for &doc in list.ids() {
                    matches.entry(doc).or_default().record(position);
                }
            }
            for (doc, found) in matches {
                let score = found.score(tokens.len(), field.boost, exact_match);
                if score > 0.0 {
                    *totals.entry(doc).or_default() += score;
                }
            }
        }

        let mut hits: Vec<SearchHit> = totals
            .into_iter()
            .map(|(doc, score)| SearchHit { doc, score })
            .collect();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.doc.cmp(&b.doc)));
        debug!(tokens = tokens.len(), exact_match, hits = hits.len(), "search complete");
        Ok(hits)
    }

    /// Close the underlying store.
    pub fn close(&self) -> Result<(), PostingsError> {
        Ok(self.store.close()?)
    }
}

// ------------------------------------------------------------------------------------------------
// Writer
// ------------------------------------------------------------------------------------------------

/// Bulk writer returned by [`TokenIndex::writer`].
///
/// [`add`](Self::add) may be called from several threads at once.
pub struct TokenIndexWriter<'a, D> {
    index: &'a TokenIndex<D>,
    builders: Vec<PartitionBuilder<String, DocId, PostingList, String>>,
}

impl<D> TokenIndexWriter<'_, D> {
    /// Tokenize every field of `doc` and record its id under each token.
    pub fn add(&self, doc: &D) -> Result<(), PostingsError> {
        let id = (self.index.doc_id)(doc);
        for (field, builder) in self.index.fields.iter().zip(&self.builders) {
            for token in tokenize(&(field.accessor)(doc)) {
                builder.store(&token, &id)?;
            }
        }
        Ok(())
    }

    /// Compact every field and build its sparse index.
    pub fn complete(self) -> Result<CompactionStats, PostingsError> {
        let mut stats = CompactionStats::default();
        for builder in &self.builders {
            stats += builder.compress()?;
            builder.rebuild_index()?;
        }
        info!(
            fields = self.builders.len(),
            tokens = stats.records_written,
            "token index written"
        );
        Ok(stats)
    }
}
