//! Index engine seam.
//!
//! The inverted-index machinery is an external collaborator; the cluster
//! only needs the operations behind [`IndexEngine`] and [`ShardReader`].
//! Two engines ship with the crate: [`MemoryEngine`] over registered
//! corpora (tests, embedded clusters) and [`JsonlEngine`], which treats a
//! `.jsonl` file of stored-field documents as one immutable shard.
//!
//! Scoring uses the *supplied* global document frequencies, never the
//! shard-local ones, so a document scores identically no matter which
//! replica serves it.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    #[error("malformed query: {0}")]
    Malformed(String),
    #[error("shard open failed: {0}")]
    Open(String),
}

/// A single query term. `field` is `*` for unfielded terms, which match
/// any text field.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Term {
    pub field: String,
    pub text: String,
}

pub const ANY_FIELD: &str = "*";

/// Disjunction of terms, the rewritten form used for frequency extraction
/// and scoring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedQuery {
    pub terms: Vec<Term>,
}

/// Document-frequency statistics summed across every shard participating
/// in a query. Sharing these across nodes is what makes scores comparable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GlobalFreqs {
    pub doc_freqs: HashMap<(String, String), u64>,
    pub num_docs: u64,
}

impl GlobalFreqs {
    pub fn add_term(&mut self, term: &Term, count: u64) {
        *self
            .doc_freqs
            .entry((term.field.clone(), term.text.clone()))
            .or_insert(0) += count;
    }

    pub fn add_num_docs(&mut self, count: u64) {
        self.num_docs += count;
    }

    pub fn merge(&mut self, other: GlobalFreqs) {
        for (key, count) in other.doc_freqs {
            *self.doc_freqs.entry(key).or_insert(0) += count;
        }
        self.num_docs += other.num_docs;
    }

    pub fn doc_freq(&self, term: &Term) -> u64 {
        self.doc_freqs
            .get(&(term.field.clone(), term.text.clone()))
            .copied()
            .unwrap_or(0)
    }
}

/// A stored field value. Text covers everything the bundled engines index;
/// opaque bytes pass through unmodified.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Text(String),
    Bytes(Vec<u8>),
}

pub type Document = BTreeMap<String, FieldValue>;

/// A sort key component with a total order across types: absent < number
/// < text. Numbers compare numerically, text lexicographically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SortValue {
    Absent,
    Number(f64),
    Text(String),
}

impl SortValue {
    fn rank(&self) -> u8 {
        match self {
            SortValue::Absent => 0,
            SortValue::Number(_) => 1,
            SortValue::Text(_) => 2,
        }
    }
}

impl Eq for SortValue {}

impl Ord for SortValue {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        match (self, other) {
            (SortValue::Number(a), SortValue::Number(b)) => a.total_cmp(b),
            (SortValue::Text(a), SortValue::Text(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for SortValue {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortField {
    pub field: String,
    #[serde(default)]
    pub reverse: bool,
}

/// Sort descriptor carried on the wire; per-shard result lists and the
/// final merge both follow it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortSpec {
    pub fields: Vec<SortField>,
}

#[derive(Debug, Clone)]
pub struct ScoredDoc {
    pub doc_id: u32,
    pub score: f32,
    pub sort_fields: Option<Vec<SortValue>>,
}

/// Result of one shard-local search. `docs` is ordered (score descending,
/// or by the sort spec) and capped at the requested limit; `total_hits`
/// counts every match seen before the deadline.
#[derive(Debug, Clone, Default)]
pub struct ShardSearchResult {
    pub total_hits: u64,
    pub docs: Vec<ScoredDoc>,
}

/// Cooperative deadline checked between documents; an expired deadline
/// stops collection but keeps what was already gathered.
pub trait Deadline: Send + Sync {
    fn expired(&self) -> bool;
}

/// Never expires; used by frequency extraction and detail fetches.
pub struct NoDeadline;

impl Deadline for NoDeadline {
    fn expired(&self) -> bool {
        false
    }
}

pub trait IndexEngine: Send + Sync + 'static {
    /// Open one shard replica from its source location. The analyzer name
    /// is opaque cluster metadata passed through to the engine.
    fn open_shard(
        &self,
        shard: &str,
        source: &str,
        analyzer: &str,
    ) -> Result<Arc<dyn ShardReader>, EngineError>;
}

pub trait ShardReader: Send + Sync + 'static {
    fn num_docs(&self) -> u64;

    /// Rewrite raw query bytes into the term disjunction used for
    /// frequency extraction and scoring.
    fn parse_query(&self, query: &[u8]) -> Result<ParsedQuery, EngineError>;

    fn doc_freq(&self, term: &Term) -> u64;

    /// Evaluate filter bytes into the matching doc-id set.
    fn evaluate_filter(&self, filter: &[u8]) -> Result<HashSet<u32>, EngineError>;

    fn search(
        &self,
        query: &ParsedQuery,
        freqs: &GlobalFreqs,
        limit: usize,
        sort: Option<&SortSpec>,
        filter: Option<&HashSet<u32>>,
        deadline: &dyn Deadline,
    ) -> ShardSearchResult;

    /// Stored fields of one document; `fields` restricts the projection.
    fn document(&self, doc_id: u32, fields: Option<&[String]>) -> Option<Document>;
}

// ---------------------------------------------------------------------------
// Shared inverted-index reader
// ---------------------------------------------------------------------------

/// Tokenize to lowercase alphanumeric runs.
fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
}

/// In-memory postings over a fixed document set.
pub struct InvertedShard {
    docs: Vec<Document>,
    postings: HashMap<Term, HashMap<u32, u32>>,
    /// Test hook: artificial delay applied per scored document.
    scan_delay: Duration,
}

impl InvertedShard {
    pub fn build(docs: Vec<Document>) -> Self {
        Self::build_with_delay(docs, Duration::ZERO)
    }

    pub fn build_with_delay(docs: Vec<Document>, scan_delay: Duration) -> Self {
        let mut postings: HashMap<Term, HashMap<u32, u32>> = HashMap::new();
        for (doc_id, doc) in docs.iter().enumerate() {
            let doc_id = doc_id as u32;
            for (field, value) in doc {
                let FieldValue::Text(text) = value else {
                    continue;
                };
                for token in tokenize(text) {
                    for key in [
                        Term {
                            field: field.clone(),
                            text: token.clone(),
                        },
                        Term {
                            field: ANY_FIELD.to_string(),
                            text: token.clone(),
                        },
                    ] {
                        *postings.entry(key).or_default().entry(doc_id).or_insert(0) += 1;
                    }
                }
            }
        }
        Self {
            docs,
            postings,
            scan_delay,
        }
    }

    fn sort_key(&self, doc: &Document, spec: &SortSpec) -> Vec<SortValue> {
        spec.fields
            .iter()
            .map(|sf| match doc.get(&sf.field) {
                Some(FieldValue::Text(text)) => match text.parse::<f64>() {
                    Ok(n) => SortValue::Number(n),
                    Err(_) => SortValue::Text(text.clone()),
                },
                Some(FieldValue::Bytes(_)) | None => SortValue::Absent,
            })
            .collect()
    }
}

/// Compare two sort-key tuples under a spec (per-field reverse flags).
pub fn compare_sort_keys(
    a: &[SortValue],
    b: &[SortValue],
    spec: &SortSpec,
) -> std::cmp::Ordering {
    for (idx, sf) in spec.fields.iter().enumerate() {
        let left = a.get(idx).unwrap_or(&SortValue::Absent);
        let right = b.get(idx).unwrap_or(&SortValue::Absent);
        let ord = if sf.reverse {
            right.cmp(left)
        } else {
            left.cmp(right)
        };
        if ord != std::cmp::Ordering::Equal {
            return ord;
        }
    }
    std::cmp::Ordering::Equal
}

impl ShardReader for InvertedShard {
    fn num_docs(&self) -> u64 {
        self.docs.len() as u64
    }

    fn parse_query(&self, query: &[u8]) -> Result<ParsedQuery, EngineError> {
        let text = std::str::from_utf8(query)
            .map_err(|_| EngineError::Malformed("query is not valid utf-8".to_string()))?;
        let mut terms = Vec::new();
        for raw in text.split_whitespace() {
            let term = match raw.split_once(':') {
                Some((field, text)) => {
                    if field.is_empty() || text.is_empty() {
                        return Err(EngineError::Malformed(format!(
                            "bad fielded term '{raw}'"
                        )));
                    }
                    Term {
                        field: field.to_string(),
                        text: text.to_lowercase(),
                    }
                }
                None => Term {
                    field: ANY_FIELD.to_string(),
                    text: raw.to_lowercase(),
                },
            };
            terms.push(term);
        }
        if terms.is_empty() {
            return Err(EngineError::Malformed("empty query".to_string()));
        }
        Ok(ParsedQuery { terms })
    }

    fn doc_freq(&self, term: &Term) -> u64 {
        self.postings
            .get(term)
            .map(|entry| entry.len() as u64)
            .unwrap_or(0)
    }

    fn evaluate_filter(&self, filter: &[u8]) -> Result<HashSet<u32>, EngineError> {
        let parsed = self.parse_query(filter)?;
        let mut docs = HashSet::new();
        for term in &parsed.terms {
            if let Some(entry) = self.postings.get(term) {
                docs.extend(entry.keys().copied());
            }
        }
        Ok(docs)
    }

    fn search(
        &self,
        query: &ParsedQuery,
        freqs: &GlobalFreqs,
        limit: usize,
        sort: Option<&SortSpec>,
        filter: Option<&HashSet<u32>>,
        deadline: &dyn Deadline,
    ) -> ShardSearchResult {
        // Candidate set: docs matching any term, scanned in doc-id order so
        // replicas of the same data behave identically.
        let mut tf_by_doc: BTreeMap<u32, f32> = BTreeMap::new();
        for term in &query.terms {
            let Some(entry) = self.postings.get(term) else {
                continue;
            };
            let df = freqs.doc_freq(term);
            // Classic tf-idf over the global statistics.
            let idf = 1.0 + ((freqs.num_docs as f32 + 1.0) / (df as f32 + 1.0)).ln();
            for (&doc_id, &tf) in entry {
                if let Some(allowed) = filter {
                    if !allowed.contains(&doc_id) {
                        continue;
                    }
                }
                *tf_by_doc.entry(doc_id).or_insert(0.0) += tf as f32 * idf * idf;
            }
        }

        let mut result = ShardSearchResult::default();
        let mut collected: Vec<ScoredDoc> = Vec::new();
        for (doc_id, score) in tf_by_doc {
            if deadline.expired() {
                tracing::warn!(doc_id, "shard search deadline exceeded, returning partial");
                break;
            }
            if !self.scan_delay.is_zero() {
                std::thread::sleep(self.scan_delay);
            }
            result.total_hits += 1;
            let sort_fields = sort.map(|spec| {
                self.sort_key(&self.docs[doc_id as usize], spec)
            });
            collected.push(ScoredDoc {
                doc_id,
                score,
                sort_fields,
            });
        }

        match sort {
            Some(spec) => collected.sort_by(|a, b| {
                compare_sort_keys(
                    a.sort_fields.as_deref().unwrap_or(&[]),
                    b.sort_fields.as_deref().unwrap_or(&[]),
                    spec,
                )
                .then_with(|| a.doc_id.cmp(&b.doc_id))
            }),
            None => collected.sort_by(|a, b| {
                b.score
                    .total_cmp(&a.score)
                    .then_with(|| a.doc_id.cmp(&b.doc_id))
            }),
        }
        collected.truncate(limit);
        result.docs = collected;
        result
    }

    fn document(&self, doc_id: u32, fields: Option<&[String]>) -> Option<Document> {
        let doc = self.docs.get(doc_id as usize)?;
        match fields {
            None => Some(doc.clone()),
            Some(wanted) => Some(
                doc.iter()
                    .filter(|(name, _)| wanted.iter().any(|w| w == *name))
                    .map(|(name, value)| (name.clone(), value.clone()))
                    .collect(),
            ),
        }
    }
}

// ---------------------------------------------------------------------------
// Engines
// ---------------------------------------------------------------------------

/// Engine over corpora registered in process. Tests and embedded clusters
/// use it; `poison_source` and `set_scan_delay` inject deploy failures and
/// slow shards.
#[derive(Default)]
pub struct MemoryEngine {
    corpora: RwLock<HashMap<String, Arc<Vec<Document>>>>,
    scan_delays: RwLock<HashMap<String, Duration>>,
    poisoned: RwLock<HashSet<String>>,
}

impl MemoryEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register_corpus(&self, source: &str, docs: Vec<Document>) {
        self.corpora
            .write()
            .unwrap()
            .insert(source.to_string(), Arc::new(docs));
    }

    /// Per-document artificial latency for shards opened from `source`.
    pub fn set_scan_delay(&self, source: &str, delay: Duration) {
        self.scan_delays
            .write()
            .unwrap()
            .insert(source.to_string(), delay);
    }

    /// Make every subsequent open of `source` fail.
    pub fn poison_source(&self, source: &str) {
        self.poisoned.write().unwrap().insert(source.to_string());
    }
}

impl IndexEngine for MemoryEngine {
    fn open_shard(
        &self,
        shard: &str,
        source: &str,
        _analyzer: &str,
    ) -> Result<Arc<dyn ShardReader>, EngineError> {
        if self.poisoned.read().unwrap().contains(source) {
            return Err(EngineError::Open(format!(
                "source '{source}' unreadable"
            )));
        }
        let docs = self
            .corpora
            .read()
            .unwrap()
            .get(source)
            .cloned()
            .ok_or_else(|| {
                EngineError::Open(format!("no corpus registered at '{source}'"))
            })?;
        let delay = self
            .scan_delays
            .read()
            .unwrap()
            .get(source)
            .copied()
            .unwrap_or(Duration::ZERO);
        tracing::debug!(shard, source, docs = docs.len(), "opened memory shard");
        Ok(Arc::new(InvertedShard::build_with_delay(
            docs.as_ref().clone(),
            delay,
        )))
    }
}

/// Engine reading one `.jsonl` file per shard: each line is a JSON object
/// of stored fields, all values indexed as text.
#[derive(Default)]
pub struct JsonlEngine;

impl JsonlEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

fn json_field(value: &serde_json::Value) -> FieldValue {
    match value {
        serde_json::Value::String(s) => FieldValue::Text(s.clone()),
        other => FieldValue::Text(other.to_string()),
    }
}

impl IndexEngine for JsonlEngine {
    fn open_shard(
        &self,
        shard: &str,
        source: &str,
        _analyzer: &str,
    ) -> Result<Arc<dyn ShardReader>, EngineError> {
        let raw = std::fs::read_to_string(source)
            .map_err(|err| EngineError::Open(format!("read '{source}': {err}")))?;
        let mut docs = Vec::new();
        for (line_no, line) in raw.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let value: serde_json::Map<String, serde_json::Value> =
                serde_json::from_str(line).map_err(|err| {
                    EngineError::Open(format!("'{source}' line {}: {err}", line_no + 1))
                })?;
            let doc: Document = value
                .iter()
                .map(|(name, value)| (name.clone(), json_field(value)))
                .collect();
            docs.push(doc);
        }
        tracing::debug!(shard, source, docs = docs.len(), "opened jsonl shard");
        Ok(Arc::new(InvertedShard::build(docs)))
    }
}

#[cfg(test)]
pub(crate) fn doc(fields: &[(&str, &str)]) -> Document {
    fields
        .iter()
        .map(|(name, value)| (name.to_string(), FieldValue::Text(value.to_string())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shard() -> InvertedShard {
        InvertedShard::build(vec![
            doc(&[("title", "Alice in Wonderland"), ("year", "1865")]),
            doc(&[("title", "Through the Looking Glass"), ("year", "1871")]),
            doc(&[("title", "Alice Returns"), ("body", "alice alice alice"), ("year", "1900")]),
        ])
    }

    fn freqs_for(reader: &InvertedShard, query: &ParsedQuery) -> GlobalFreqs {
        let mut freqs = GlobalFreqs::default();
        for term in &query.terms {
            freqs.add_term(term, reader.doc_freq(term));
        }
        freqs.add_num_docs(reader.num_docs());
        freqs
    }

    #[test]
    fn parses_plain_and_fielded_terms() {
        let reader = shard();
        let parsed = reader.parse_query(b"Alice title:Glass").unwrap();
        assert_eq!(
            parsed.terms,
            vec![
                Term {
                    field: ANY_FIELD.into(),
                    text: "alice".into()
                },
                Term {
                    field: "title".into(),
                    text: "glass".into()
                },
            ]
        );
    }

    #[test]
    fn rejects_malformed_queries() {
        let reader = shard();
        assert!(matches!(
            reader.parse_query(b""),
            Err(EngineError::Malformed(_))
        ));
        assert!(matches!(
            reader.parse_query(b"title:"),
            Err(EngineError::Malformed(_))
        ));
        assert!(matches!(
            reader.parse_query(b":alice"),
            Err(EngineError::Malformed(_))
        ));
    }

    #[test]
    fn doc_freq_counts_documents_not_occurrences() {
        let reader = shard();
        let alice = Term {
            field: ANY_FIELD.into(),
            text: "alice".into(),
        };
        // Doc 2 contains "alice" four times but counts once.
        assert_eq!(reader.doc_freq(&alice), 2);
    }

    #[test]
    fn search_ranks_by_global_tf_idf() {
        let reader = shard();
        let query = reader.parse_query(b"alice").unwrap();
        let freqs = freqs_for(&reader, &query);
        let result = reader.search(&query, &freqs, 10, None, None, &NoDeadline);
        assert_eq!(result.total_hits, 2);
        // Doc 2 has the higher term frequency.
        assert_eq!(result.docs[0].doc_id, 2);
        assert_eq!(result.docs[1].doc_id, 0);
        assert!(result.docs[0].score > result.docs[1].score);
    }

    #[test]
    fn scores_depend_on_supplied_freqs_not_local_ones() {
        let reader = shard();
        let query = reader.parse_query(b"alice").unwrap();
        let local = freqs_for(&reader, &query);
        let mut global = local.clone();
        global.add_num_docs(1000);
        let a = reader.search(&query, &local, 10, None, None, &NoDeadline);
        let b = reader.search(&query, &global, 10, None, None, &NoDeadline);
        assert!(b.docs[0].score > a.docs[0].score);
    }

    #[test]
    fn limit_zero_keeps_total_hits() {
        let reader = shard();
        let query = reader.parse_query(b"alice").unwrap();
        let freqs = freqs_for(&reader, &query);
        let result = reader.search(&query, &freqs, 0, None, None, &NoDeadline);
        assert_eq!(result.total_hits, 2);
        assert!(result.docs.is_empty());
    }

    #[test]
    fn filter_restricts_candidates() {
        let reader = shard();
        let query = reader.parse_query(b"alice").unwrap();
        let freqs = freqs_for(&reader, &query);
        let filter = reader.evaluate_filter(b"year:1900").unwrap();
        let result = reader.search(&query, &freqs, 10, None, None, &NoDeadline);
        assert_eq!(result.total_hits, 2);
        let filtered = reader.search(&query, &freqs, 10, None, Some(&filter), &NoDeadline);
        assert_eq!(filtered.total_hits, 1);
        assert_eq!(filtered.docs[0].doc_id, 2);
    }

    #[test]
    fn sort_orders_by_field_values() {
        let reader = shard();
        let query = reader.parse_query(b"alice glass looking").unwrap();
        let freqs = freqs_for(&reader, &query);
        let spec = SortSpec {
            fields: vec![SortField {
                field: "year".into(),
                reverse: true,
            }],
        };
        let result = reader.search(&query, &freqs, 10, Some(&spec), None, &NoDeadline);
        let years: Vec<u32> = result.docs.iter().map(|d| d.doc_id).collect();
        assert_eq!(years, vec![2, 1, 0]);
        assert!(result.docs[0].sort_fields.is_some());
    }

    #[test]
    fn expired_deadline_returns_partial() {
        struct Expired;
        impl Deadline for Expired {
            fn expired(&self) -> bool {
                true
            }
        }
        let reader = shard();
        let query = reader.parse_query(b"alice").unwrap();
        let freqs = freqs_for(&reader, &query);
        let result = reader.search(&query, &freqs, 10, None, None, &Expired);
        assert_eq!(result.total_hits, 0);
        assert!(result.docs.is_empty());
    }

    #[test]
    fn sort_value_total_order() {
        assert!(SortValue::Absent < SortValue::Number(0.0));
        assert!(SortValue::Number(f64::MAX) < SortValue::Text(String::new()));
        assert!(SortValue::Number(1.0) < SortValue::Number(2.0));
        assert!(SortValue::Text("a".into()) < SortValue::Text("b".into()));
    }

    #[test]
    fn jsonl_engine_reads_documents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("part-0.jsonl");
        std::fs::write(
            &path,
            "{\"title\": \"alice\", \"year\": 1865}\n\n{\"title\": \"glass\"}\n",
        )
        .unwrap();

        let engine = JsonlEngine::new();
        let reader = engine
            .open_shard("books#part-0", path.to_str().unwrap(), "standard")
            .unwrap();
        assert_eq!(reader.num_docs(), 2);
        let doc = reader.document(0, None).unwrap();
        assert_eq!(doc.get("year"), Some(&FieldValue::Text("1865".into())));
    }

    #[test]
    fn memory_engine_poisoning() {
        let engine = MemoryEngine::new();
        engine.register_corpus("mem://a", vec![doc(&[("t", "x")])]);
        assert!(engine.open_shard("i#a", "mem://a", "std").is_ok());
        engine.poison_source("mem://a");
        assert!(matches!(
            engine.open_shard("i#a", "mem://a", "std"),
            Err(EngineError::Open(_))
        ));
    }
}
