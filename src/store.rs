//! Normalized entity store
//!
//! Responses are walked against their endpoint's [`Schema`]. Every object that
//! matches a declared [`EntityType`] is merged into one table keyed by
//! (type, primary key) and replaced in the result tree by a reference, so a
//! record fetched through several endpoints exists exactly once.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tokio::time::Instant;
use tracing::debug;

use crate::error::CacheError;
use crate::schema::{describe, EntityType, Field, Schema, SchemaError};

/// Identity of a record in the store
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityKey {
    pub entity: &'static str,
    pub pk: String,
}

impl EntityKey {
    pub fn new(entity: &EntityType, pk: impl Into<String>) -> Self {
        Self {
            entity: entity.name,
            pk: pk.into(),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.entity, self.pk)
    }
}

/// A response tree with entity bodies replaced by references
#[derive(Debug, Clone, PartialEq)]
pub enum Normalized {
    Scalar(Value),
    Object(BTreeMap<String, Normalized>),
    List(Vec<Normalized>),
    Ref(EntityKey),
}

impl Normalized {
    /// Collects every reference that appears directly in this tree
    pub fn references(&self, out: &mut HashSet<EntityKey>) {
        match self {
            Normalized::Scalar(_) => {}
            Normalized::Ref(key) => {
                out.insert(key.clone());
            }
            Normalized::List(items) => items.iter().for_each(|item| item.references(out)),
            Normalized::Object(fields) => fields.values().for_each(|field| field.references(out)),
        }
    }
}

/// A stored entity
#[derive(Debug, Clone)]
struct Record {
    fields: BTreeMap<String, Normalized>,
    /// Store version of the last change to this record
    version: u64,
    /// Wall-clock time of the last change
    updated_at: DateTime<Utc>,
    /// Last time any response carried this record, used for retention
    touched_at: Instant,
}

/// What a call to [`EntityStore::normalize`] produced
#[derive(Debug, Clone)]
pub struct NormalizeOutcome {
    /// The response with entity bodies replaced by references
    pub tree: Normalized,
    /// Records created or modified by this merge
    pub changed: HashSet<EntityKey>,
    /// Store version after the merge
    pub version: u64,
}

/// Metadata about a stored record
#[derive(Debug, Clone, PartialEq)]
pub struct RecordInfo {
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

/// Normalized table of entity records
///
/// All writes go through [`normalize`](Self::normalize), which validates the
/// whole response before touching any record: a response that fails its
/// schema halfway through leaves the store exactly as it was.
#[derive(Debug, Default)]
pub struct EntityStore {
    records: HashMap<EntityKey, Record>,
    version: u64,
}

impl EntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Monotonic counter bumped whenever a merge changes at least one record
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains(&self, key: &EntityKey) -> bool {
        self.records.contains_key(key)
    }

    pub fn info(&self, key: &EntityKey) -> Option<RecordInfo> {
        self.records.get(key).map(|record| RecordInfo {
            version: record.version,
            updated_at: record.updated_at,
        })
    }

    /// Walks `data` according to `schema`, merges every entity found and
    /// returns the reference tree
    ///
    /// # Arguments
    /// * `data` - A response body
    /// * `schema` - The shape the endpoint declares for it
    ///
    /// # Returns
    /// * `Ok(NormalizeOutcome)` with the tree, the records that changed and
    ///   the store version after the merge
    /// * `Err(SchemaError)` naming the first offending path; nothing is merged
    pub fn normalize(&mut self, data: &Value, schema: &Schema) -> Result<NormalizeOutcome, SchemaError> {
        let mut merges = Vec::new();
        let tree = walk(data, schema, "$", &mut merges)?;

        let now = Instant::now();
        let mut changed = HashSet::new();
        for (key, fields) in merges {
            let record = self.records.entry(key.clone()).or_insert_with(|| {
                changed.insert(key.clone());
                Record {
                    fields: BTreeMap::new(),
                    version: 0,
                    updated_at: Utc::now(),
                    touched_at: now,
                }
            });
            if merge_fields(&mut record.fields, fields) {
                changed.insert(key);
            }
            record.touched_at = now;
        }

        if !changed.is_empty() {
            self.version += 1;
            for key in &changed {
                if let Some(record) = self.records.get_mut(key) {
                    record.version = self.version;
                    record.updated_at = Utc::now();
                }
            }
            debug!(
                event = "store.merged",
                changed = changed.len(),
                version = self.version
            );
        }

        Ok(NormalizeOutcome {
            tree,
            changed,
            version: self.version,
        })
    }

    /// Resolves every reference in `tree` against the current records
    ///
    /// Each record visited is added to `dependencies`. A reference to an
    /// absent record is a bookkeeping bug and reported as `EntityNotFound`.
    pub fn denormalize(
        &self,
        tree: &Normalized,
        dependencies: &mut HashSet<EntityKey>,
    ) -> Result<Value, CacheError> {
        let mut stack = Vec::new();
        self.resolve(tree, dependencies, &mut stack)
    }

    /// Denormalized view of a single record
    pub fn get(&self, entity: &EntityType, pk: &str) -> Result<Value, CacheError> {
        let tree = Normalized::Ref(EntityKey::new(entity, pk));
        self.denormalize(&tree, &mut HashSet::new())
    }

    /// Drops records that no live subscription references and that no
    /// response has carried within `retention`
    pub fn evict_unreferenced(&mut self, referenced: &HashSet<EntityKey>, retention: Duration) -> usize {
        let before = self.records.len();
        self.records
            .retain(|key, record| referenced.contains(key) || record.touched_at.elapsed() < retention);
        before - self.records.len()
    }

    /// Removes every record
    pub fn clear(&mut self) {
        self.records.clear();
    }

    fn resolve(
        &self,
        tree: &Normalized,
        dependencies: &mut HashSet<EntityKey>,
        stack: &mut Vec<EntityKey>,
    ) -> Result<Value, CacheError> {
        match tree {
            Normalized::Scalar(value) => Ok(value.clone()),
            Normalized::List(items) => items
                .iter()
                .map(|item| self.resolve(item, dependencies, stack))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Normalized::Object(fields) => self.resolve_fields(fields, dependencies, stack),
            Normalized::Ref(key) => {
                let record = self
                    .records
                    .get(key)
                    .ok_or_else(|| CacheError::EntityNotFound(key.clone()))?;
                dependencies.insert(key.clone());
                // A record that (indirectly) contains itself is rendered by key.
                if stack.contains(key) {
                    return Ok(Value::String(key.pk.clone()));
                }
                stack.push(key.clone());
                let value = self.resolve_fields(&record.fields, dependencies, stack);
                stack.pop();
                value
            }
        }
    }

    fn resolve_fields(
        &self,
        fields: &BTreeMap<String, Normalized>,
        dependencies: &mut HashSet<EntityKey>,
        stack: &mut Vec<EntityKey>,
    ) -> Result<Value, CacheError> {
        let mut object = Map::new();
        for (name, field) in fields {
            object.insert(name.clone(), self.resolve(field, dependencies, stack)?);
        }
        Ok(Value::Object(object))
    }
}

/// Merges `incoming` into `existing`, returning whether anything changed
///
/// Fields absent from `incoming` are kept. Nested plain objects merge
/// recursively; scalars, lists and references are replaced.
fn merge_fields(existing: &mut BTreeMap<String, Normalized>, incoming: BTreeMap<String, Normalized>) -> bool {
    let mut changed = false;
    for (name, value) in incoming {
        match (existing.get_mut(&name), value) {
            (Some(Normalized::Object(current)), Normalized::Object(update)) => {
                changed |= merge_fields(current, update);
            }
            (Some(current), update) => {
                if *current != update {
                    *current = update;
                    changed = true;
                }
            }
            (None, update) => {
                existing.insert(name, update);
                changed = true;
            }
        }
    }
    changed
}

type Merge = (EntityKey, BTreeMap<String, Normalized>);

fn walk(value: &Value, schema: &Schema, path: &str, merges: &mut Vec<Merge>) -> Result<Normalized, SchemaError> {
    match schema {
        Schema::Scalar(kind) => {
            if kind.accepts(value) {
                Ok(Normalized::Scalar(value.clone()))
            } else {
                Err(SchemaError::expected(path, *kind, value))
            }
        }
        Schema::Optional(inner) => match value {
            Value::Null => Ok(Normalized::Scalar(Value::Null)),
            _ => walk(value, inner, path, merges),
        },
        Schema::List(inner) => {
            let items = value
                .as_array()
                .ok_or_else(|| SchemaError::new(path, format!("expected an array, found {}", describe(value))))?;
            items
                .iter()
                .enumerate()
                .map(|(index, item)| walk(item, inner, &format!("{path}[{index}]"), merges))
                .collect::<Result<Vec<_>, _>>()
                .map(Normalized::List)
        }
        Schema::Object(fields) => walk_fields(value, fields, path, merges).map(Normalized::Object),
        Schema::Entity(entity) => {
            let object = value
                .as_object()
                .ok_or_else(|| SchemaError::new(path, format!("expected {} object, found {}", entity.name, describe(value))))?;
            let pk = entity.primary_key_of(object).ok_or_else(|| {
                SchemaError::new(
                    path,
                    format!("{} is missing its primary key `{}`", entity.name, entity.primary_key),
                )
            })?;
            let fields = walk_fields(value, entity.fields, path, merges)?;
            let key = EntityKey::new(entity, pk);
            merges.push((key.clone(), fields));
            Ok(Normalized::Ref(key))
        }
    }
}

fn walk_fields(
    value: &Value,
    fields: &[Field],
    path: &str,
    merges: &mut Vec<Merge>,
) -> Result<BTreeMap<String, Normalized>, SchemaError> {
    let object = value
        .as_object()
        .ok_or_else(|| SchemaError::new(path, format!("expected an object, found {}", describe(value))))?;

    let mut out = BTreeMap::new();
    for field in fields {
        // Partial responses simply omit fields; they are never cleared.
        if let Some(child) = object.get(field.name) {
            let child_path = format!("{path}.{}", field.name);
            out.insert(field.name.to_string(), walk(child, &field.schema, &child_path, merges)?);
        }
    }
    Ok(out)
}
