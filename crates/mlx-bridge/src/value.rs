//! Host Value Model
//!
//! [`Value`] is the dynamic value the host runtime hands to the bridge and
//! receives back. Lists and hashes are shared and mutable, like the host's
//! own containers; engine resources appear as handles.
//!
//! ## Equality
//!
//! - Numbers compare by value across `Int` and `Float`
//! - Dtypes compare by tag, devices by kind and index, and a device also
//!   equals the symbol or string naming its kind (`Device == :cpu`)
//! - Lists compare elementwise, hashes by entries in order
//! - Every other handle compares by identity

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use indexmap::IndexMap;
use mlx_engine::{Array, Device, Dtype, DtypeCategory, Stream};
use smol_str::SmolStr;

use crate::error::BridgeResult;
use crate::handles::{ArrayHandle, ExporterHandle, FunctionHandle, GroupHandle, KernelHandle, StreamContext};

// ============================================================================
// Value
// ============================================================================

/// Any value crossing the host boundary
#[derive(Debug, Clone, Default)]
pub enum Value {
    #[default]
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Complex(f64, f64),
    Str(SmolStr),
    Symbol(SmolStr),
    List(List),
    Hash(Hash),
    Range(RangeValue),
    Array(ArrayHandle),
    Dtype(Dtype),
    Category(DtypeCategory),
    Device(Device),
    Stream(Stream),
    Group(GroupHandle),
    Function(FunctionHandle),
    Exporter(ExporterHandle),
    Kernel(KernelHandle),
    Proc(Proc),
    StreamContext(StreamContext),
}

impl Value {
    /// Host class name of this value
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "NilClass",
            Value::Bool(_) => "Boolean",
            Value::Int(_) => "Integer",
            Value::Float(_) => "Float",
            Value::Complex(..) => "Complex",
            Value::Str(_) => "String",
            Value::Symbol(_) => "Symbol",
            Value::List(_) => "List",
            Value::Hash(_) => "Hash",
            Value::Range(_) => "Range",
            Value::Array(_) => "Array",
            Value::Dtype(_) => "Dtype",
            Value::Category(_) => "DtypeCategory",
            Value::Device(_) => "Device",
            Value::Stream(_) => "Stream",
            Value::Group(_) => "Group",
            Value::Function(_) => "Function",
            Value::Exporter(_) => "FunctionExporter",
            Value::Kernel(_) => "Kernel",
            Value::Proc(_) => "Proc",
            Value::StreamContext(_) => "StreamContext",
        }
    }

    pub fn sym(name: &str) -> Self {
        Value::Symbol(SmolStr::new(name))
    }

    pub fn str(text: &str) -> Self {
        Value::Str(SmolStr::new(text))
    }

    pub fn list(items: Vec<Value>) -> Self {
        Value::List(List::from_vec(items))
    }

    /// Hash from `(key, value)` pairs, keeping their order
    pub fn hash<K: Into<SmolStr>>(pairs: impl IntoIterator<Item = (K, Value)>) -> Self {
        Value::Hash(Hash::from_pairs(pairs))
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    /// Host truthiness: only `nil` and `false` are false
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Value::Nil | Value::Bool(false))
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// Integers and floats widened to `f64`
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(n) => Some(*n as f64),
            _ => None,
        }
    }

    /// Text of a string or symbol
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) | Value::Symbol(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&List> {
        match self {
            Value::List(list) => Some(list),
            _ => None,
        }
    }

    pub fn as_hash(&self) -> Option<&Hash> {
        match self {
            Value::Hash(hash) => Some(hash),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&ArrayHandle> {
        match self {
            Value::Array(handle) => Some(handle),
            _ => None,
        }
    }

    /// Whether the value is a boolean, integer, float or complex scalar
    pub fn is_scalar(&self) -> bool {
        matches!(self, Value::Bool(_) | Value::Int(_) | Value::Float(_) | Value::Complex(..))
    }

    /// Whether the value can be invoked (`Proc` or `Function`)
    pub fn is_callable(&self) -> bool {
        matches!(self, Value::Proc(_) | Value::Function(_))
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        use Value::*;
        match (self, other) {
            (Nil, Nil) => true,
            (Bool(a), Bool(b)) => a == b,
            (Int(a), Int(b)) => a == b,
            (Int(a), Float(b)) | (Float(b), Int(a)) => (*a as f64) == *b,
            (Float(a), Float(b)) => a == b,
            (Complex(ar, ai), Complex(br, bi)) => ar == br && ai == bi,
            (Str(a), Str(b)) | (Symbol(a), Symbol(b)) => a == b,
            (List(a), List(b)) => a.ptr_eq(b) || a.to_vec() == b.to_vec(),
            (Hash(a), Hash(b)) => a.ptr_eq(b) || a.entries() == b.entries(),
            (Range(a), Range(b)) => a == b,
            (Array(a), Array(b)) => a.ptr_eq(b),
            (Dtype(a), Dtype(b)) => a == b,
            (Category(a), Category(b)) => a == b,
            (Device(a), Device(b)) => a == b,
            (Device(d), Str(s)) | (Device(d), Symbol(s)) | (Str(s), Device(d)) | (Symbol(s), Device(d)) => {
                d.kind.name() == s.as_str()
            }
            (Stream(a), Stream(b)) => a == b,
            (Group(a), Group(b)) => a.ptr_eq(b),
            (Function(a), Function(b)) => a.ptr_eq(b),
            (Exporter(a), Exporter(b)) => a.ptr_eq(b),
            (Kernel(a), Kernel(b)) => a.ptr_eq(b),
            (Proc(a), Proc(b)) => a.ptr_eq(b),
            (StreamContext(a), StreamContext(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(n) => write!(f, "{}", n),
            Value::Float(x) => {
                if x.is_finite() && x.fract() == 0.0 {
                    write!(f, "{:.1}", x)
                } else {
                    write!(f, "{}", x)
                }
            }
            Value::Complex(re, im) => write!(f, "({}{:+}i)", re, im),
            Value::Str(s) => write!(f, "{:?}", s.as_str()),
            Value::Symbol(s) => write!(f, ":{}", s),
            Value::List(list) => write!(f, "{}", list),
            Value::Hash(hash) => write!(f, "{}", hash),
            Value::Range(r) => write!(f, "{}", r),
            Value::Array(a) => write!(f, "#<Array shape={:?} dtype={}>", a.get().shape(), a.get().dtype()),
            Value::Dtype(d) => write!(f, "{}", d),
            Value::Category(c) => write!(f, "{}", c),
            Value::Device(d) => write!(f, "{}", d),
            Value::Stream(s) => write!(f, "{}", s),
            Value::Group(_) => write!(f, "#<Group>"),
            Value::Function(func) => write!(f, "#<Function {}>", func.name()),
            Value::Exporter(_) => write!(f, "#<FunctionExporter>"),
            Value::Kernel(k) => write!(f, "#<Kernel {}>", k.name()),
            Value::Proc(p) => write!(f, "#<Proc {}>", p.name()),
            Value::StreamContext(_) => write!(f, "#<StreamContext>"),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Int(n as i64)
    }
}

impl From<usize> for Value {
    fn from(n: usize) -> Self {
        Value::Int(n as i64)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Float(x)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(SmolStr::new(s))
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::list(items)
    }
}

impl From<Array> for Value {
    fn from(a: Array) -> Self {
        Value::Array(ArrayHandle::new(a))
    }
}

impl From<Dtype> for Value {
    fn from(d: Dtype) -> Self {
        Value::Dtype(d)
    }
}

impl From<DtypeCategory> for Value {
    fn from(c: DtypeCategory) -> Self {
        Value::Category(c)
    }
}

impl From<Device> for Value {
    fn from(d: Device) -> Self {
        Value::Device(d)
    }
}

impl From<Stream> for Value {
    fn from(s: Stream) -> Self {
        Value::Stream(s)
    }
}

impl From<Proc> for Value {
    fn from(p: Proc) -> Self {
        Value::Proc(p)
    }
}

// ============================================================================
// List
// ============================================================================

/// Shared, mutable, ordered sequence
#[derive(Debug, Clone, Default)]
pub struct List {
    items: Rc<RefCell<Vec<Value>>>,
}

impl List {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_vec(items: Vec<Value>) -> Self {
        Self {
            items: Rc::new(RefCell::new(items)),
        }
    }

    pub fn len(&self) -> usize {
        self.items.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.borrow().is_empty()
    }

    pub fn get(&self, index: usize) -> Option<Value> {
        self.items.borrow().get(index).cloned()
    }

    pub fn push(&self, value: Value) {
        self.items.borrow_mut().push(value);
    }

    /// Snapshot of the items
    pub fn to_vec(&self) -> Vec<Value> {
        self.items.borrow().clone()
    }

    pub fn ptr_eq(&self, other: &List) -> bool {
        Rc::ptr_eq(&self.items, &other.items)
    }
}

impl fmt::Display for List {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, item) in self.items.borrow().iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", item)?;
        }
        write!(f, "]")
    }
}

// ============================================================================
// Hash
// ============================================================================

/// Shared, mutable, insertion-ordered map with string keys
#[derive(Debug, Clone, Default)]
pub struct Hash {
    entries: Rc<RefCell<IndexMap<SmolStr, Value>>>,
}

impl Hash {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<K: Into<SmolStr>>(pairs: impl IntoIterator<Item = (K, Value)>) -> Self {
        Self {
            entries: Rc::new(RefCell::new(pairs.into_iter().map(|(k, v)| (k.into(), v)).collect())),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.entries.borrow().get(key).cloned()
    }

    pub fn insert(&self, key: impl Into<SmolStr>, value: Value) {
        self.entries.borrow_mut().insert(key.into(), value);
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.borrow().contains_key(key)
    }

    pub fn keys(&self) -> Vec<SmolStr> {
        self.entries.borrow().keys().cloned().collect()
    }

    /// Snapshot of the entries in insertion order
    pub fn entries(&self) -> Vec<(SmolStr, Value)> {
        self.entries
            .borrow()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn ptr_eq(&self, other: &Hash) -> bool {
        Rc::ptr_eq(&self.entries, &other.entries)
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (k, v)) in self.entries.borrow().iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}: {}", k, v)?;
        }
        write!(f, "}}")
    }
}

// ============================================================================
// Range
// ============================================================================

/// Host range literal; either end may be open
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeValue {
    pub start: Option<i64>,
    pub end: Option<i64>,
    pub exclusive: bool,
}

impl RangeValue {
    /// `start..end`
    pub fn exclusive(start: i64, end: i64) -> Self {
        Self {
            start: Some(start),
            end: Some(end),
            exclusive: true,
        }
    }

    /// `start..=end`
    pub fn inclusive(start: i64, end: i64) -> Self {
        Self {
            start: Some(start),
            end: Some(end),
            exclusive: false,
        }
    }
}

impl fmt::Display for RangeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(start) = self.start {
            write!(f, "{}", start)?;
        }
        write!(f, "{}", if self.exclusive { "..." } else { ".." })?;
        if let Some(end) = self.end {
            write!(f, "{}", end)?;
        }
        Ok(())
    }
}

// ============================================================================
// Proc
// ============================================================================

type ProcBody = dyn Fn(&[Value]) -> BridgeResult<Value>;

/// A host callable.
///
/// Procs are deliberately not `Send`: the engine may only invoke them on
/// the thread that holds the host lock.
#[derive(Clone)]
pub struct Proc {
    name: SmolStr,
    body: Rc<ProcBody>,
}

impl Proc {
    pub fn new(name: &str, body: impl Fn(&[Value]) -> BridgeResult<Value> + 'static) -> Self {
        Self {
            name: SmolStr::new(name),
            body: Rc::new(body),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn call(&self, args: &[Value]) -> BridgeResult<Value> {
        (self.body)(args)
    }

    pub fn ptr_eq(&self, other: &Proc) -> bool {
        Rc::ptr_eq(&self.body, &other.body)
    }
}

impl fmt::Debug for Proc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Proc").field("name", &self.name).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_numeric_equality() {
        assert_eq!(Value::Int(2), Value::Float(2.0));
        assert_ne!(Value::Int(2), Value::Float(2.5));
        assert_ne!(Value::Int(1), Value::Bool(true));
    }

    #[test]
    fn test_device_equals_kind_symbol() {
        assert_eq!(Value::Device(Device::cpu()), Value::sym("cpu"));
        assert_eq!(Value::str("gpu"), Value::Device(Device::gpu()));
        assert_ne!(Value::Device(Device::cpu()), Value::sym("gpu"));
    }

    #[test]
    fn test_lists_are_shared() {
        let list = List::from_vec(vec![Value::Int(1)]);
        let alias = list.clone();
        alias.push(Value::Int(2));
        assert_eq!(list.len(), 2);
        assert!(list.ptr_eq(&alias));
        assert_eq!(Value::List(list), Value::list(vec![Value::Int(1), Value::Int(2)]));
    }

    #[test]
    fn test_hash_keeps_insertion_order() {
        let hash = Hash::from_pairs([("b", Value::Int(1)), ("a", Value::Int(2))]);
        hash.insert("c", Value::Nil);
        assert_eq!(hash.keys(), vec![SmolStr::new("b"), SmolStr::new("a"), SmolStr::new("c")]);
    }

    #[test]
    fn test_display() {
        assert_eq!(Value::list(vec![Value::Float(1.0), Value::Int(2)]).to_string(), "[1.0, 2]");
        assert_eq!(Value::sym("float32").to_string(), ":float32");
        assert_eq!(Value::Range(RangeValue::exclusive(1, 3)).to_string(), "1...3");
    }

    #[test]
    fn test_truthiness() {
        assert!(!Value::Nil.is_truthy());
        assert!(!Value::Bool(false).is_truthy());
        assert!(Value::Int(0).is_truthy());
    }
}
