//! Per-shard document storage
//!
//! A collection is a `_id`-ordered map of JSON documents plus its unique
//! indexes. Every mutation is appended to the collection's [`ChangeLog`]
//! first; reopening a persistent collection replays the log.

use crate::common::keys::{document_id, Document, KeyPattern, KeyRange};
use crate::shard::change_log::{ChangeLog, Mutation, MutationOp};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

/// Index definition. Only unique indexes are enforced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSpec {
    pub name: String,
    pub fields: Vec<String>,
    #[serde(default)]
    pub unique: bool,
}

/// Schema and indexes of a collection
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionOptions {
    #[serde(default)]
    pub indexes: Vec<IndexSpec>,
    /// Fields every document must carry
    #[serde(default)]
    pub required_fields: Vec<String>,
}

impl CollectionOptions {
    pub fn validate(&self) -> Result<()> {
        let mut names = std::collections::HashSet::new();
        for index in &self.indexes {
            if index.name.is_empty() || index.fields.is_empty() {
                return Err(Error::InvalidOptions(format!(
                    "index {:?} must have a name and at least one field",
                    index.name
                )));
            }
            if !names.insert(index.name.as_str()) {
                return Err(Error::InvalidOptions(format!(
                    "duplicate index name: {}",
                    index.name
                )));
            }
        }
        Ok(())
    }

    /// Check a document against the required fields
    pub fn check_document(&self, doc: &Document) -> Result<()> {
        for field in &self.required_fields {
            if !doc.contains_key(field) {
                return Err(Error::SchemaValidation(format!(
                    "document {} is missing required field {:?}",
                    doc.get("_id").cloned().unwrap_or(Value::Null),
                    field
                )));
            }
        }
        Ok(())
    }
}

const META_FILE: &str = "collection.json";

#[derive(Serialize, Deserialize)]
struct CollectionMeta {
    name: String,
    options: CollectionOptions,
}

fn index_key(spec: &IndexSpec, doc: &Document) -> String {
    let values: Vec<&Value> = spec
        .fields
        .iter()
        .map(|f| doc.get(f).unwrap_or(&Value::Null))
        .collect();
    serde_json::to_string(&values).unwrap_or_default()
}

/// One physical collection on one shard
pub struct Collection {
    name: String,
    options: CollectionOptions,
    docs: BTreeMap<String, Document>,
    /// index name -> index key -> `_id`
    unique: HashMap<String, HashMap<String, String>>,
    log: ChangeLog,
    dir: Option<PathBuf>,
}

impl Collection {
    pub fn in_memory(name: impl Into<String>, options: CollectionOptions) -> Result<Self> {
        options.validate()?;
        Ok(Self::assemble(name.into(), options, ChangeLog::in_memory(), None))
    }

    /// Open (or create) a collection under `dir`, replaying its change log
    pub fn open(
        dir: impl AsRef<Path>,
        name: impl Into<String>,
        options: CollectionOptions,
    ) -> Result<Self> {
        options.validate()?;
        let name = name.into();
        let dir = dir.as_ref().join(file_stem(&name));
        std::fs::create_dir_all(&dir)?;

        let meta_path = dir.join(META_FILE);
        let options = match std::fs::read(&meta_path) {
            Ok(bytes) => {
                let meta: CollectionMeta = serde_json::from_slice(&bytes)
                    .map_err(|e| Error::Corrupted(format!("{}: {}", meta_path.display(), e)))?;
                meta.options
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let meta = CollectionMeta {
                    name: name.clone(),
                    options,
                };
                let bytes = serde_json::to_vec_pretty(&meta)
                    .map_err(|e| Error::Internal(e.to_string()))?;
                std::fs::write(&meta_path, bytes)?;
                meta.options
            }
            Err(e) => return Err(e.into()),
        };

        let log = ChangeLog::open(dir.join("changes.log"), false)?;
        let mut collection = Self::assemble(name, options, ChangeLog::in_memory(), Some(dir));
        for mutation in log.entries() {
            collection.replay_mutation(mutation);
        }
        collection.log = log;

        tracing::debug!(
            collection = %collection.name,
            documents = collection.docs.len(),
            last_seq = collection.log.last_seq(),
            "collection reopened"
        );
        Ok(collection)
    }

    /// Reopen every collection previously created under `dir`
    pub fn discover(dir: impl AsRef<Path>) -> Result<Vec<Collection>> {
        let entries = match std::fs::read_dir(dir.as_ref()) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut collections = Vec::new();
        for entry in entries {
            let meta_path = entry?.path().join(META_FILE);
            let bytes = match std::fs::read(&meta_path) {
                Ok(bytes) => bytes,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            let meta: CollectionMeta = serde_json::from_slice(&bytes)
                .map_err(|e| Error::Corrupted(format!("{}: {}", meta_path.display(), e)))?;
            collections.push(Self::open(dir.as_ref(), meta.name, meta.options)?);
        }
        Ok(collections)
    }

    fn assemble(
        name: String,
        options: CollectionOptions,
        log: ChangeLog,
        dir: Option<PathBuf>,
    ) -> Self {
        let unique = options
            .indexes
            .iter()
            .filter(|i| i.unique)
            .map(|i| (i.name.clone(), HashMap::new()))
            .collect();
        Self {
            name,
            options,
            docs: BTreeMap::new(),
            unique,
            log,
            dir,
        }
    }

    fn replay_mutation(&mut self, mutation: &Mutation) {
        match &mutation.op {
            MutationOp::Insert(doc) | MutationOp::Update(doc) => {
                if let Ok(id) = document_id(doc) {
                    self.unindex(&id);
                    self.index(&id, doc);
                    self.docs.insert(id, doc.clone());
                }
            }
            MutationOp::Delete(doc) => {
                if let Ok(id) = document_id(doc) {
                    self.unindex(&id);
                    self.docs.remove(&id);
                }
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &CollectionOptions {
        &self.options
    }

    pub fn get(&self, id: &str) -> Option<&Document> {
        self.docs.get(id)
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    /// Documents in `_id` order
    pub fn documents(&self) -> impl Iterator<Item = &Document> {
        self.docs.values()
    }

    /// Documents with `_id > after`, in `_id` order
    pub fn documents_after<'a>(&'a self, after: Option<&str>) -> Box<dyn Iterator<Item = &'a Document> + 'a> {
        match after {
            Some(after) => Box::new(
                self.docs
                    .range::<str, _>((std::ops::Bound::Excluded(after), std::ops::Bound::Unbounded))
                    .map(|(_, d)| d),
            ),
            None => Box::new(self.docs.values()),
        }
    }

    pub fn log(&self) -> &ChangeLog {
        &self.log
    }

    pub fn last_seq(&self) -> u64 {
        self.log.last_seq()
    }

    fn check_unique(&self, id: &str, doc: &Document) -> Result<()> {
        for spec in self.options.indexes.iter().filter(|i| i.unique) {
            let key = index_key(spec, doc);
            if let Some(owner) = self.unique.get(&spec.name).and_then(|m| m.get(&key)) {
                if owner != id {
                    return Err(Error::DuplicateKey {
                        index: spec.name.clone(),
                        key,
                    });
                }
            }
        }
        Ok(())
    }

    fn index(&mut self, id: &str, doc: &Document) {
        for spec in self.options.indexes.iter().filter(|i| i.unique) {
            if let Some(map) = self.unique.get_mut(&spec.name) {
                map.insert(index_key(spec, doc), id.to_string());
            }
        }
    }

    fn unindex(&mut self, id: &str) {
        let Some(old) = self.docs.get(id) else {
            return;
        };
        for spec in self.options.indexes.iter().filter(|i| i.unique) {
            let key = index_key(spec, old);
            if let Some(map) = self.unique.get_mut(&spec.name) {
                if map.get(&key).map(|o| o == id).unwrap_or(false) {
                    map.remove(&key);
                }
            }
        }
    }

    pub fn insert(&mut self, doc: Document) -> Result<Mutation> {
        let id = document_id(&doc)?;
        if self.docs.contains_key(&id) {
            return Err(Error::DuplicateKey {
                index: "_id_".into(),
                key: id,
            });
        }
        self.write(id, MutationOp::Insert(doc))
    }

    /// Replace an existing document
    pub fn replace(&mut self, doc: Document) -> Result<Mutation> {
        let id = document_id(&doc)?;
        if !self.docs.contains_key(&id) {
            return Err(Error::NotFound(format!("{} in {}", id, self.name)));
        }
        self.write(id, MutationOp::Update(doc))
    }

    /// Insert or replace, used by the applier
    pub fn upsert(&mut self, doc: Document) -> Result<Mutation> {
        let id = document_id(&doc)?;
        let op = if self.docs.contains_key(&id) {
            MutationOp::Update(doc)
        } else {
            MutationOp::Insert(doc)
        };
        self.write(id, op)
    }

    pub fn remove(&mut self, id: &str) -> Result<Option<Mutation>> {
        let Some(existing) = self.docs.get(id).cloned() else {
            return Ok(None);
        };
        let mutation = self.log.append(MutationOp::Delete(existing))?;
        self.unindex(id);
        self.docs.remove(id);
        Ok(Some(mutation))
    }

    fn write(&mut self, id: String, op: MutationOp) -> Result<Mutation> {
        let doc = op.document();
        self.options.check_document(doc)?;
        self.check_unique(&id, doc)?;

        let mutation = self.log.append(op)?;
        let doc = mutation.op.document().clone();
        self.unindex(&id);
        self.index(&id, &doc);
        self.docs.insert(id, doc);
        Ok(mutation)
    }

    /// Delete every document whose `pattern` key falls in one of `ranges`
    pub fn remove_ranges(&mut self, pattern: &KeyPattern, ranges: &[KeyRange]) -> Result<usize> {
        let mut doomed = Vec::new();
        for (id, doc) in &self.docs {
            if in_ranges(pattern, ranges, doc)? {
                doomed.push(id.clone());
            }
        }
        for id in &doomed {
            self.remove(id)?;
        }
        Ok(doomed.len())
    }

    /// Drop the collection and its files
    pub fn destroy(self) -> Result<()> {
        let dir = self.dir.clone();
        self.log.destroy()?;
        if let Some(dir) = dir {
            match std::fs::remove_dir_all(&dir) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

/// True if the document's `pattern` key lies in one of `ranges`. A
/// document with no valid key under `pattern` is an error.
pub fn in_ranges(pattern: &KeyPattern, ranges: &[KeyRange], doc: &Document) -> Result<bool> {
    let key = pattern.extract(doc).map_err(|e| match e {
        Error::InvalidKeyPattern(msg) => Error::InvalidKeyPattern(format!(
            "document {} has no valid {} key: {}",
            document_id(doc).unwrap_or_else(|_| "<no _id>".into()),
            pattern,
            msg
        )),
        other => other,
    })?;
    Ok(ranges.iter().any(|r| r.contains(&key)))
}

fn file_stem(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' { c } else { '_' })
        .collect()
}
