//! Token posting-list search index built on the store.
//!
//! ## Design Overview
//!
//! Every indexed field of a document type gets its own partition, named
//! after the field.  Inside it the store maps each lowercase token to the
//! [`PostingList`] of the documents containing it:
//!
//! ```text
//! key   = token                 (String)
//! input = one document id       (DocId)
//! value = sorted, unique ids    (PostingList, delta + varint encoded)
//! ```
//!
//! Buckets are picked by the first character of the token, so a lookup
//! touches one small file per field.
//!
//! Indexing and scoring live in [`TokenIndex`]; this module holds the
//! value type and the tokenizer.

mod token_index;


pub use token_index::{FieldDescriptor, PostingsError, SearchHit, TokenIndex, TokenIndexWriter};

use crate::encoding::{
    Decode, Encode, EncodingError, MAX_VEC_ELEMENTS, decode_varint, encode_varint,
};

/// Document identifier.
pub type DocId = u64;

// ------------------------------------------------------------------------------------------------
// Posting list
// ------------------------------------------------------------------------------------------------

/// Sorted, duplicate-free list of document ids.
///
/// Encoded as `[varint count][varint first id][varint gap]...`, every gap
/// being the difference to the previous id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PostingList {
    ids: Vec<DocId>,
}

impl PostingList {
    /// Normalize `ids` into a posting list: sorted, duplicates removed.
    pub fn from_ids(mut ids: Vec<DocId>) -> Self {
        ids.sort_unstable();
        ids.dedup();
        Self { ids }
    }

    pub fn ids(&self) -> &[DocId] {
        &self.ids
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn contains(&self, id: DocId) -> bool {
        self.ids.binary_search(&id).is_ok()
    }

    pub fn into_ids(self) -> Vec<DocId> {
        self.ids
    }
}

impl FromIterator<DocId> for PostingList {
    fn from_iter<T: IntoIterator<Item = DocId>>(iter: T) -> Self {
        Self::from_ids(iter.into_iter().collect())
    }
}

impl Encode for PostingList {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        if self.ids.len() > MAX_VEC_ELEMENTS as usize {
            return Err(EncodingError::LengthOverflow(format!(
                "posting list of {} ids exceeds limit {MAX_VEC_ELEMENTS}",
                self.ids.len()
            )));
        }
        encode_varint(self.ids.len() as u64, buf);
        let mut previous = 0;
        for &id in &self.ids {
            encode_varint(id - previous, buf);
            previous = id;
        }
        Ok(())
    }
}

impl Decode for PostingList {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (count, mut offset) = decode_varint(buf)?;
        if count > u64::from(MAX_VEC_ELEMENTS) {
            return Err(EncodingError::LengthOverflow(format!(
                "posting list count {count} exceeds limit {MAX_VEC_ELEMENTS}"
            )));
        }
        // Every id takes at least one byte.
        let count = count as usize;
        let remaining = buf.len() - offset;
        if count > remaining {
            return Err(EncodingError::UnexpectedEof {
                needed: count,
                available: remaining,
            });
        }

        let mut ids = Vec::with_capacity(count);
        let mut previous: DocId = 0;
        for i in 0..count {
            let (gap, n) = decode_varint(&buf[offset..])?;
            offset += n;
            if i > 0 && gap == 0 {
                return Err(EncodingError::Custom(
                    "posting list ids are not strictly increasing".into(),
                ));
            }
            previous = previous.checked_add(gap).ok_or_else(|| {
                EncodingError::LengthOverflow("posting list id overflows u64".into())
            })?;
            ids.push(previous);
        }
        Ok((Self { ids }, offset))
    }
}

// ------------------------------------------------------------------------------------------------
// Tokenizer
// ------------------------------------------------------------------------------------------------

/// Split `text` on every non-alphanumeric character and lowercase the
/// pieces.  Empty pieces are dropped; order and repeats are kept.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|piece| !piece.is_empty())
        .map(str::to_lowercase)
        .collect()
}
