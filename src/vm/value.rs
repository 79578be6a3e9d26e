use std::fmt::{Debug, Display};
use std::ops::Range;
use std::rc::Rc;

use super::scope::ScopeRef;
use super::Vm;
use crate::bytecode::Token;
use crate::error::GemError;
use crate::ffi::ForeignFunction;

/// The bare word bound to `null` in the root scope.
const NULL: &str = "null";

/// VM-internal representation of a Gem value.
#[derive(Debug, Clone)]
pub enum Value {
    /// Gem has a single number type, backed by f64.
    Number(f64),
    /// Boolean backed by Rust bool.
    Bool(bool),
    /// String literals keep their surrounding double quotes in the payload.
    /// An unquoted payload is a bare word, such as `null` or an ffi type name.
    String(String),
    /// The only composite type.
    Table(Table),
    /// A script function or a native one.
    Closure(Closure),
    /// A C function loaded by `DEFINE`.
    Foreign(Rc<ForeignFunction>),
}

impl Value {
    /// The `null` value.
    pub fn null() -> Value {
        Value::String(NULL.to_string())
    }

    /// A string value holding `text`.
    pub fn quoted(text: &str) -> Value {
        Value::String(format!("\"{}\"", text))
    }

    /// Whether this is the `null` sentinel, as opposed to the string literal `"null"`.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::String(s) if s == NULL)
    }

    /// Only `null` and `false` are falsy.
    pub fn is_falsy(&self) -> bool {
        self.is_null() || matches!(self, Value::Bool(false))
    }

    /// The name `typeof` reports for this value.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Number(_) => "number",
            Value::Bool(_) => "bool",
            Value::String(_) if self.is_null() => "null",
            Value::String(_) => "string",
            Value::Table(_) => "table",
            Value::Closure(_) => "function",
            Value::Foreign(_) => "foreign",
        }
    }

    pub(crate) fn to_float(&self) -> Result<f64, GemError> {
        if let Value::Number(f) = self {
            Ok(*f)
        } else {
            Err(GemError::Type(format!(
                "expected a number, got {}",
                self.type_name()
            )))
        }
    }

    /// The text of a string without its quotes.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(unquote(s)),
            _ => None,
        }
    }

    /// How `console.out` shows a value: strings lose their quotes, everything else as displayed.
    pub fn to_output_string(&self) -> String {
        match self {
            Value::String(s) => unquote(s).to_string(),
            other => other.to_string(),
        }
    }
}

/// Strips one pair of surrounding double quotes, if present.
pub fn unquote(text: &str) -> &str {
    if text.len() >= 2 && text.starts_with('"') && text.ends_with('"') {
        &text[1..text.len() - 1]
    } else {
        text
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Number(l0), Self::Number(r0)) => l0 == r0,
            (Self::Bool(l0), Self::Bool(r0)) => l0 == r0,
            (Self::String(l0), Self::String(r0)) => l0 == r0,
            (Self::Table(l0), Self::Table(r0)) => l0 == r0,
            (Self::Closure(l0), Self::Closure(r0)) => l0.same(r0),
            (Self::Foreign(l0), Self::Foreign(r0)) => Rc::ptr_eq(l0, r0),
            _ => false,
        }
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(val) => write!(f, "{}", val),
            Self::Bool(b) => write!(f, "{}", b),
            Self::String(s) => write!(f, "{}", s),
            Self::Table(t) => t.fmt_indented(f, 0),
            Self::Closure(c) => write!(f, "<function {}>", c.name()),
            Self::Foreign(ff) => write!(f, "<foreign {}>", ff.name()),
        }
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Number(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<Table> for Value {
    fn from(t: Table) -> Self {
        Value::Table(t)
    }
}

/// A table key. Integral numbers are always `Int`, so `1` and `1.0` name the same entry.
#[derive(Debug, Clone, PartialEq)]
pub enum Key {
    #[allow(missing_docs)]
    Int(i64),
    /// A number with a fractional part.
    Double(f64),
    /// Unquoted text.
    String(String),
}

// Integral doubles up to this magnitude convert to i64 exactly.
const MAX_EXACT_INT: f64 = 9_007_199_254_740_992.0;

impl Key {
    /// The key a value indexes with. Only numbers other than NaN and strings can be keys.
    pub fn from_value(value: &Value) -> Result<Key, GemError> {
        match value {
            Value::Number(n) if n.is_nan() => {
                Err(GemError::Type("NaN cannot be a table key".to_string()))
            }
            Value::Number(n) => Ok(Key::from(*n)),
            Value::String(s) => Ok(Key::String(unquote(s).to_string())),
            other => Err(GemError::Type(format!(
                "a {} cannot be a table key",
                other.type_name()
            ))),
        }
    }

    /// The value a key reads back as.
    pub fn to_value(&self) -> Value {
        match self {
            Key::Int(i) => Value::Number(*i as f64),
            Key::Double(d) => Value::Number(*d),
            Key::String(s) => Value::quoted(s),
        }
    }
}

impl From<f64> for Key {
    fn from(n: f64) -> Self {
        if n.fract() == 0.0 && n.abs() <= MAX_EXACT_INT {
            Key::Int(n as i64)
        } else {
            Key::Double(n)
        }
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Key::String(s.to_string())
    }
}

impl Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Key::Int(i) => write!(f, "{}", i),
            Key::Double(d) => write!(f, "{}", d),
            Key::String(s) => write!(f, "{}", s),
        }
    }
}

/// An ordered sequence of entries with unique keys.
/// Inserting an existing key replaces its value in place.
#[derive(Debug, Clone, Default)]
pub struct Table {
    entries: Vec<(Key, Value)>,
}

impl Table {
    /// A new table is empty.
    pub fn new() -> Self {
        Table {
            entries: Vec::new(),
        }
    }

    #[allow(missing_docs)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[allow(missing_docs)]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[allow(missing_docs)]
    pub fn get(&self, key: &Key) -> Option<&Value> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    #[allow(missing_docs)]
    pub fn get_mut(&mut self, key: &Key) -> Option<&mut Value> {
        self.entries
            .iter_mut()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    /// Replace the value under `key`, or append a new entry.
    pub fn insert(&mut self, key: Key, value: Value) {
        match self.get_mut(&key) {
            Some(slot) => *slot = value,
            None => self.entries.push((key, value)),
        }
    }

    #[allow(missing_docs)]
    pub fn remove(&mut self, key: &Key) -> Option<Value> {
        let idx = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(idx).1)
    }

    /// The entry at a position, in insertion order.
    pub fn entry(&self, idx: usize) -> Option<&(Key, Value)> {
        self.entries.get(idx)
    }

    #[allow(missing_docs)]
    pub fn iter(&self) -> impl Iterator<Item = &(Key, Value)> + '_ {
        self.entries.iter()
    }

    /// One past the largest non-negative integer key, or 0.
    pub fn next_index(&self) -> i64 {
        self.entries
            .iter()
            .filter_map(|(k, _)| match k {
                Key::Int(i) if *i >= 0 => Some(*i + 1),
                _ => None,
            })
            .max()
            .unwrap_or(0)
    }

    fn fmt_indented(&self, f: &mut std::fmt::Formatter<'_>, depth: usize) -> std::fmt::Result {
        if self.entries.is_empty() {
            return write!(f, "{{}}");
        }
        writeln!(f, "{{")?;
        for (key, value) in &self.entries {
            write!(f, "{:width$}{}: ", "", key, width = (depth + 1) * 2)?;
            match value {
                Value::Table(inner) => inner.fmt_indented(f, depth + 1)?,
                other => write!(f, "{}", other)?,
            }
            writeln!(f)?;
        }
        write!(f, "{:width$}}}", "", width = depth * 2)
    }
}

// Equal tables hold the same keys with equal values, in any order.
impl PartialEq for Table {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len()
            && self
                .entries
                .iter()
                .all(|(k, v)| other.get(k).map_or(false, |o| o == v))
    }
}

impl FromIterator<(Key, Value)> for Table {
    fn from_iter<I: IntoIterator<Item = (Key, Value)>>(iter: I) -> Self {
        let mut table = Table::new();
        for (k, v) in iter {
            table.insert(k, v);
        }
        table
    }
}

/// Signature of host functions callable from Gem. Arguments are popped from the scope's
/// stack, first argument on top, and the callback pushes its result.
pub type NativeCallback = Rc<dyn Fn(&mut Vm, &ScopeRef) -> Result<(), GemError>>;

/// A callable value.
#[derive(Debug, Clone)]
pub enum Closure {
    /// A function compiled from Gem source.
    Script(Rc<ScriptFunction>),
    /// A function implemented by the host.
    Native(NativeFunction),
}

impl Closure {
    #[allow(missing_docs)]
    pub fn name(&self) -> &str {
        match self {
            Closure::Script(f) => &f.name,
            Closure::Native(f) => &f.name,
        }
    }

    fn same(&self, other: &Closure) -> bool {
        match (self, other) {
            (Closure::Script(a), Closure::Script(b)) => Rc::ptr_eq(a, b),
            (Closure::Native(a), Closure::Native(b)) => {
                Rc::as_ptr(&a.callback) as *const () == Rc::as_ptr(&b.callback) as *const ()
            }
            _ => false,
        }
    }
}

/// A script function: its parameters, its body as a range of the program it was compiled in,
/// and the scope it was declared in.
pub struct ScriptFunction {
    #[allow(missing_docs)]
    pub name: String,
    #[allow(missing_docs)]
    pub params: Vec<String>,
    /// The program the body lives in.
    pub code: Rc<[Token]>,
    /// Token range of the body, between the header's colon and `RET`.
    pub body: Range<usize>,
    /// Parent of every call's scope.
    pub scope: ScopeRef,
}

// The declaring scope can reach this function again, so it is left out.
impl Debug for ScriptFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptFunction")
            .field("name", &self.name)
            .field("params", &self.params)
            .field("body", &self.body)
            .finish()
    }
}

/// A named host callback.
#[derive(Clone)]
pub struct NativeFunction {
    #[allow(missing_docs)]
    pub name: String,
    #[allow(missing_docs)]
    pub callback: NativeCallback,
}

impl NativeFunction {
    #[allow(missing_docs)]
    pub fn new<F>(name: &str, callback: F) -> Self
    where
        F: Fn(&mut Vm, &ScopeRef) -> Result<(), GemError> + 'static,
    {
        NativeFunction {
            name: name.to_string(),
            callback: Rc::new(callback),
        }
    }
}

impl Debug for NativeFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NativeFunction({})", self.name)
    }
}
