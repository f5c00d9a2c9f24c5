//! Dispatch Table
//!
//! The fixed mapping from operation name to parameter list and handler.
//! The table is built once, on first use, from the `register` function of
//! every family in [`crate::ops`]; nothing is registered afterwards.

use std::sync::{Arc, OnceLock};

use indexmap::IndexMap;
use tracing::{debug, trace, warn};

use crate::args::{self, Args};
use crate::core::Core;
use crate::error::BridgeResult;
use crate::ops;
use crate::value::{Hash, Value};

pub type Handler = Arc<dyn Fn(&Core, &Args) -> BridgeResult<Value> + Send + Sync>;

/// One exposed operation
pub struct OpEntry {
    pub name: &'static str,
    pub params: &'static [&'static str],
    /// Whether the entry accepts a `stream:` keyword
    pub takes_stream: bool,
    handler: Handler,
}

impl std::fmt::Debug for OpEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpEntry")
            .field("name", &self.name)
            .field("params", &self.params)
            .field("takes_stream", &self.takes_stream)
            .finish()
    }
}

impl OpEntry {
    /// Whether every key of `kwargs` names a keyword of this entry
    pub fn accepts_keywords(&self, kwargs: &Hash) -> bool {
        kwargs
            .keys()
            .iter()
            .all(|k| args::is_keyword(self.params, self.takes_stream, k))
    }

    /// Bind the arguments, then run the handler
    pub fn invoke(&self, core: &Core, positional: Vec<Value>, kwargs: &Hash) -> BridgeResult<Value> {
        trace!(
            op = self.name,
            positional = positional.len(),
            keywords = ?kwargs.keys(),
            "dispatch"
        );
        let args = Args::bind(self.name, self.params, positional, kwargs, self.takes_stream)?;
        (self.handler)(core, &args)
    }
}

/// Collects entries while the table is built
#[derive(Default)]
pub struct TableBuilder {
    entries: IndexMap<&'static str, Arc<OpEntry>>,
}

impl TableBuilder {
    fn insert(&mut self, name: &'static str, entry: Arc<OpEntry>) {
        if self.entries.contains_key(name) {
            warn!(op = name, "duplicate registration ignored");
            return;
        }
        self.entries.insert(name, entry);
    }

    fn register(
        &mut self,
        name: &'static str,
        params: &'static [&'static str],
        takes_stream: bool,
        handler: impl Fn(&Core, &Args) -> BridgeResult<Value> + Send + Sync + 'static,
    ) {
        let entry = OpEntry {
            name,
            params,
            takes_stream,
            handler: Arc::new(handler),
        };
        self.insert(name, Arc::new(entry));
    }

    /// An operation taking an optional `stream:` keyword
    pub fn op(
        &mut self,
        name: &'static str,
        params: &'static [&'static str],
        handler: impl Fn(&Core, &Args) -> BridgeResult<Value> + Send + Sync + 'static,
    ) {
        self.register(name, params, true, handler);
    }

    /// An administrative entry without a stream
    pub fn admin(
        &mut self,
        name: &'static str,
        params: &'static [&'static str],
        handler: impl Fn(&Core, &Args) -> BridgeResult<Value> + Send + Sync + 'static,
    ) {
        self.register(name, params, false, handler);
    }

    /// Make `alias` reach the entry registered as `target`
    pub fn alias(&mut self, alias: &'static str, target: &'static str) {
        match self.entries.get(target).cloned() {
            Some(entry) => self.insert(alias, entry),
            None => warn!(alias, target, "alias of unknown operation ignored"),
        }
    }

    /// Whether `name` is already registered
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }
}

/// Operation name to entry, in registration order
#[derive(Debug)]
pub struct DispatchTable {
    entries: IndexMap<&'static str, Arc<OpEntry>>,
}

static TABLE: OnceLock<DispatchTable> = OnceLock::new();

impl DispatchTable {
    /// The process-wide table, built on first use
    pub fn global() -> &'static DispatchTable {
        TABLE.get_or_init(Self::build)
    }

    fn build() -> DispatchTable {
        let mut builder = TableBuilder::default();
        ops::register_all(&mut builder);
        debug!(entries = builder.entries.len(), "built dispatch table");
        DispatchTable {
            entries: builder.entries,
        }
    }

    pub fn get(&self, name: &str) -> Option<&OpEntry> {
        self.entries.get(name).map(Arc::as_ref)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.entries.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_is_populated() {
        let table = DispatchTable::global();
        assert!(table.len() > 180);
        assert!(table.contains("sum"));
        assert!(table.contains("asarray"));
        assert!(!table.contains("no_such_op"));
    }

    #[test]
    fn test_aliases_share_entries() {
        let table = DispatchTable::global();
        let (a, b) = (table.get("concatenate"), table.get("concat"));
        assert!(matches!((a, b), (Some(a), Some(b)) if std::ptr::eq(a, b)));
    }

    #[test]
    fn test_admin_entries_take_no_stream() {
        let table = DispatchTable::global();
        assert!(table.get("sum").is_some_and(|e| e.takes_stream));
        assert!(table.get("default_device").is_some_and(|e| !e.takes_stream));
    }

    #[test]
    fn test_accepts_keywords() {
        let entry = DispatchTable::global().get("sum");
        let keywords = Hash::from_pairs([("axis", Value::Int(0))]);
        let data = Hash::from_pairs([("weight", Value::Int(0))]);
        assert!(entry.is_some_and(|e| e.accepts_keywords(&keywords) && !e.accepts_keywords(&data)));
    }
}
