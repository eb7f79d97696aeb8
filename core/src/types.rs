use serde::{Deserialize, Serialize};

/// Name of the metadata row holding the persisted compaction horizon.
/// It never shows up in reads, counts or watches.
pub const COMPACT_REV_KEY: &str = "compact_rev_key";

/// One row of the `kine` table. Rows are only ever appended (and removed by compaction).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRow {
    pub id: i64,
    pub name: String,
    pub created: bool,
    pub deleted: bool,
    pub create_revision: i64,
    pub prev_revision: i64,
    pub lease: i64,
    pub value: Vec<u8>,
    pub old_value: Vec<u8>,
}

impl LogRow {
    /// The create revision as seen by clients. Creating rows store 0 and take their own id.
    pub fn effective_create_revision(&self) -> i64 {
        if self.created {
            self.id
        } else {
            self.create_revision
        }
    }

    pub fn is_metadata(&self) -> bool { self.name == COMPACT_REV_KEY }

    pub fn to_kv(&self) -> KeyValue {
        KeyValue {
            key: self.name.clone(),
            create_revision: self.effective_create_revision(),
            mod_revision: self.id,
            value: self.value.clone(),
            lease: self.lease,
        }
    }

    /// Projection of the chain predecessor, if the row has one.
    pub fn prev_kv(&self) -> Option<KeyValue> {
        if self.prev_revision <= 0 {
            return None;
        }
        Some(KeyValue {
            key: self.name.clone(),
            create_revision: self.create_revision,
            mod_revision: self.prev_revision,
            value: self.old_value.clone(),
            lease: self.lease,
        })
    }

    pub fn to_event(&self) -> Event {
        // A re-create chains from a tombstone; clients must not see that as a previous value.
        let prev_kv = if self.created { None } else { self.prev_kv() };
        Event { create: self.created, delete: self.deleted, kv: self.to_kv(), prev_kv }
    }
}

/// A row about to be appended. The engine assigns the id.
#[derive(Debug, Clone)]
pub struct NewRow {
    pub name: String,
    pub created: bool,
    pub deleted: bool,
    pub create_revision: i64,
    pub prev_revision: i64,
    pub lease: i64,
    pub value: Vec<u8>,
    pub old_value: Vec<u8>,
}

impl NewRow {
    pub fn create(name: &str, value: Vec<u8>, lease: i64, prev_revision: i64) -> Self {
        Self {
            name: name.to_owned(),
            created: true,
            deleted: false,
            create_revision: 0,
            prev_revision,
            lease,
            value,
            old_value: Vec::new(),
        }
    }

    pub fn update(current: &KeyValue, value: Vec<u8>, lease: i64) -> Self {
        Self {
            name: current.key.clone(),
            created: false,
            deleted: false,
            create_revision: current.create_revision,
            prev_revision: current.mod_revision,
            lease,
            value,
            old_value: current.value.clone(),
        }
    }

    pub fn tombstone(current: &KeyValue) -> Self {
        Self {
            name: current.key.clone(),
            created: false,
            deleted: true,
            create_revision: current.create_revision,
            prev_revision: current.mod_revision,
            lease: current.lease,
            value: Vec::new(),
            old_value: current.value.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    pub create_revision: i64,
    pub mod_revision: i64,
    pub value: Vec<u8>,
    pub lease: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub delete: bool,
    pub create: bool,
    pub kv: KeyValue,
    pub prev_kv: Option<KeyValue>,
}

impl Event {
    pub fn revision(&self) -> i64 { self.kv.mod_revision }
}

/// Outcome of a compare-and-swap write (update or delete).
///
/// `succeeded = false` is the optimistic-lock failure: `revision` and `kv` then describe the
/// key as it currently is, so the caller can re-read and recompute its write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateResult {
    pub revision: i64,
    pub kv: Option<KeyValue>,
    pub succeeded: bool,
}

/// The keys an operation applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyRange {
    /// A single key.
    Exact(String),
    /// `start <= key < end`; no end means unbounded.
    Range { start: String, end: Option<String> },
}

impl KeyRange {
    /// Interprets a key the way the apiserver uses it: a trailing `/` selects every key below
    /// that directory, anything else selects exactly that key.
    pub fn from_prefix(prefix: &str) -> Self {
        if prefix.is_empty() {
            KeyRange::Range { start: String::new(), end: None }
        } else if prefix.ends_with('/') {
            KeyRange::Range { start: prefix.to_owned(), end: prefix_end(prefix) }
        } else {
            KeyRange::Exact(prefix.to_owned())
        }
    }

    /// etcd-style `[key, range_end)`; an empty `range_end` means the single key.
    pub fn from_range(key: &str, range_end: &str) -> Self {
        if range_end.is_empty() {
            KeyRange::Exact(key.to_owned())
        } else {
            KeyRange::Range { start: key.to_owned(), end: Some(range_end.to_owned()) }
        }
    }

    /// Narrows the range so it starts no earlier than `start_key`.
    pub fn starting_at(self, start_key: &str) -> Self {
        match self {
            KeyRange::Range { start, end } if start_key > start.as_str() => KeyRange::Range { start: start_key.to_owned(), end },
            KeyRange::Exact(key) if !start_key.is_empty() && start_key > key.as_str() => {
                // Nothing at or after start_key can match.
                KeyRange::Range { start: start_key.to_owned(), end: Some(start_key.to_owned()) }
            }
            other => other,
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        match self {
            KeyRange::Exact(k) => k == key,
            KeyRange::Range { start, end } => key >= start.as_str() && end.as_deref().map_or(true, |end| key < end),
        }
    }
}

/// Smallest string greater than every string starting with `prefix`, if there is one.
pub fn prefix_end(prefix: &str) -> Option<String> {
    let mut chars: Vec<char> = prefix.chars().collect();
    while let Some(last) = chars.pop() {
        let mut next = last as u32 + 1;
        // skip the surrogate block
        if (0xD800..=0xDFFF).contains(&next) {
            next = 0xE000;
        }
        if let Some(c) = char::from_u32(next) {
            chars.push(c);
            return Some(chars.into_iter().collect());
        }
    }
    None
}
