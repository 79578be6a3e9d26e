//! Functions the root scope starts with.
//!
//! Natives take their arguments from the calling scope's stack, first argument on top, and push
//! exactly one result. Methods reached through `value.method()` get the receiver as their first
//! argument.

use std::cell::Cell;
use std::rc::Rc;

use super::scope::ScopeRef;
use super::value::{Closure, Key, NativeFunction, Table, Value};
use super::Vm;
use crate::error::GemError;

fn native<F>(name: &str, callback: F) -> Value
where
    F: Fn(&mut Vm, &ScopeRef) -> Result<(), GemError> + 'static,
{
    Value::Closure(Closure::Native(NativeFunction::new(name, callback)))
}

fn library(entries: Vec<(&str, Value)>) -> Value {
    Value::Table(entries.into_iter().map(|(k, v)| (Key::from(k), v)).collect())
}

/// Bind the literals and the standard library in `root`.
pub fn install(root: &ScopeRef) {
    root.declare("null", Value::null());
    root.declare("true", Value::Bool(true));
    root.declare("false", Value::Bool(false));
    root.declare("console", library(vec![("out", native("out", console_out))]));
    root.declare(
        "string",
        library(vec![
            ("length", native("length", string_length)),
            ("upper", native("upper", |_, scope| {
                let text = pop_text(scope)?;
                scope.push(Value::quoted(&text.to_uppercase()))
            })),
            ("lower", native("lower", |_, scope| {
                let text = pop_text(scope)?;
                scope.push(Value::quoted(&text.to_lowercase()))
            })),
            ("iterator", native("iterator", string_iterator)),
        ]),
    );
    root.declare(
        "table",
        library(vec![
            ("length", native("length", |_, scope| {
                let table = pop_table(scope)?;
                scope.push(Value::Number(table.len() as f64))
            })),
            ("insert", native("insert", table_insert)),
            ("remove", native("remove", table_remove)),
            ("keys", native("keys", table_keys)),
            ("iterator", native("iterator", table_iterator)),
        ]),
    );
    root.declare(
        "typeof",
        native("typeof", |_, scope| {
            let value = scope.pop_or_null();
            scope.push(Value::quoted(value.type_name()))
        }),
    );
}

// Prints every argument it was given. Called from a compiled call site, the stack holds
// exactly the call's arguments; a bare CALL hands it everything the caller has pending.
fn console_out(vm: &mut Vm, scope: &ScopeRef) -> Result<(), GemError> {
    let line: String = scope
        .drain()
        .iter()
        .map(Value::to_output_string)
        .collect();
    writeln!(vm.output(), "{}", line)?;
    scope.push(Value::null())
}

fn pop_text(scope: &ScopeRef) -> Result<String, GemError> {
    match scope.pop()? {
        Value::String(s) if s.starts_with('"') => Ok(super::value::unquote(&s).to_string()),
        other => Err(GemError::Type(format!(
            "expected a string, got a {}",
            other.type_name()
        ))),
    }
}

fn pop_table(scope: &ScopeRef) -> Result<Table, GemError> {
    match scope.pop()? {
        Value::Table(table) => Ok(table),
        other => Err(GemError::Type(format!(
            "expected a table, got a {}",
            other.type_name()
        ))),
    }
}

fn string_length(_: &mut Vm, scope: &ScopeRef) -> Result<(), GemError> {
    let text = pop_text(scope)?;
    scope.push(Value::Number(text.chars().count() as f64))
}

fn table_insert(_: &mut Vm, scope: &ScopeRef) -> Result<(), GemError> {
    let mut table = pop_table(scope)?;
    let value = scope.pop()?;
    table.insert(Key::Int(table.next_index()), value);
    scope.push(Value::Table(table))
}

fn table_remove(_: &mut Vm, scope: &ScopeRef) -> Result<(), GemError> {
    let mut table = pop_table(scope)?;
    let key = Key::from_value(&scope.pop()?)?;
    table.remove(&key);
    scope.push(Value::Table(table))
}

fn table_keys(_: &mut Vm, scope: &ScopeRef) -> Result<(), GemError> {
    let table = pop_table(scope)?;
    let keys: Table = table
        .iter()
        .enumerate()
        .map(|(i, (key, _))| (Key::Int(i as i64), key.to_value()))
        .collect();
    scope.push(Value::Table(keys))
}

// An iterator walks a snapshot; later changes to the table are not seen.
fn table_iterator(_: &mut Vm, scope: &ScopeRef) -> Result<(), GemError> {
    let table = pop_table(scope)?;
    let cursor = Rc::new(Cell::new(0usize));
    scope.push(native("table_iterator", move |_, scope| {
        let next = table.entry(cursor.get()).map(|(key, value)| (key.to_value(), value.clone()));
        cursor.set(cursor.get() + 1);
        push_pair(scope, next)
    }))
}

fn string_iterator(_: &mut Vm, scope: &ScopeRef) -> Result<(), GemError> {
    let chars: Vec<char> = pop_text(scope)?.chars().collect();
    let cursor = Rc::new(Cell::new(0usize));
    scope.push(native("string_iterator", move |_, scope| {
        let idx = cursor.get();
        let next = chars
            .get(idx)
            .map(|c| (Value::Number(idx as f64), Value::quoted(&c.to_string())));
        cursor.set(idx + 1);
        push_pair(scope, next)
    }))
}

fn push_pair(scope: &ScopeRef, pair: Option<(Value, Value)>) -> Result<(), GemError> {
    let (key, value) = pair.unwrap_or_else(|| (Value::null(), Value::null()));
    scope.push(value)?;
    scope.push(key)
}
