//! The C layout tables cross the library boundary in.
//!
//! A table is a malloc'd array of nodes plus its length. Strings are NUL-terminated heap copies
//! and nested tables are stored inline in the value. Whoever allocated a table hands ownership to
//! the other side: tables passed as arguments are freed by us after the call, tables returned by
//! a library are converted and then freed by us as well, so libraries must allocate them with
//! `malloc`.
#![allow(missing_docs, missing_debug_implementations)]

use std::ffi::{CStr, CString};
use std::mem::size_of;
use std::os::raw::{c_char, c_int};
use std::ptr;

use crate::error::GemError;
use crate::vm::{Key, Table, Value};

pub const KEY_INT: c_int = 0;
pub const KEY_DOUBLE: c_int = 1;
pub const KEY_STRING: c_int = 2;

pub const VAL_INT: c_int = 0;
pub const VAL_DOUBLE: c_int = 1;
pub const VAL_BOOL: c_int = 2;
pub const VAL_STRING: c_int = 3;
pub const VAL_TABLE: c_int = 4;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct CTable {
    pub nodes: *mut CTableNode,
    pub len: usize,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct CTableNode {
    pub key: CKey,
    pub value: CValue,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct CKey {
    pub kind: c_int,
    pub data: CKeyData,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union CKeyData {
    pub i: c_int,
    pub d: f64,
    pub s: *mut c_char,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct CValue {
    pub kind: c_int,
    pub data: CValueData,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union CValueData {
    pub i: c_int,
    pub d: f64,
    pub b: bool,
    pub s: *mut c_char,
    pub table: CTable,
}

fn c_string(text: &str) -> Result<*mut c_char, GemError> {
    let owned = CString::new(text)
        .map_err(|_| GemError::Ffi(format!("string {:?} contains a NUL byte", text)))?;
    // SAFETY: `owned` is a valid NUL-terminated string for the duration of the call.
    let copy = unsafe { libc::strdup(owned.as_ptr()) };
    if copy.is_null() {
        Err(GemError::Ffi("out of memory".into()))
    } else {
        Ok(copy)
    }
}

fn to_key(key: &Key) -> Result<CKey, GemError> {
    Ok(match key {
        Key::Int(i) => match c_int::try_from(*i) {
            Ok(i) => CKey {
                kind: KEY_INT,
                data: CKeyData { i },
            },
            Err(_) => CKey {
                kind: KEY_DOUBLE,
                data: CKeyData { d: *i as f64 },
            },
        },
        Key::Double(d) => CKey {
            kind: KEY_DOUBLE,
            data: CKeyData { d: *d },
        },
        Key::String(s) => CKey {
            kind: KEY_STRING,
            data: CKeyData { s: c_string(s)? },
        },
    })
}

fn to_value(value: &Value) -> Result<CValue, GemError> {
    Ok(match value {
        Value::Number(d) => CValue {
            kind: VAL_DOUBLE,
            data: CValueData { d: *d },
        },
        Value::Bool(b) => CValue {
            kind: VAL_BOOL,
            data: CValueData { b: *b },
        },
        Value::String(_) if value.is_null() => {
            return Err(GemError::Ffi("null cannot be passed to C".into()))
        }
        Value::String(_) => CValue {
            kind: VAL_STRING,
            data: CValueData {
                s: c_string(value.as_text().unwrap_or_default())?,
            },
        },
        Value::Table(table) => CValue {
            kind: VAL_TABLE,
            data: CValueData {
                table: to_native_table(table)?,
            },
        },
        other => {
            return Err(GemError::Ffi(format!(
                "a {} cannot be passed to C",
                other.type_name()
            )))
        }
    })
}

/// Copy a table into C memory. Release it with [`free_native_table`].
pub fn to_native_table(table: &Table) -> Result<CTable, GemError> {
    let mut nodes = Vec::with_capacity(table.len());
    for (key, value) in table.iter() {
        let converted = to_key(key).and_then(|key| match to_value(value) {
            Ok(value) => Ok(CTableNode { key, value }),
            Err(e) => {
                // SAFETY: the key was just built by `to_key` and is owned by nobody else.
                unsafe { free_key(&key) };
                Err(e)
            }
        });
        match converted {
            Ok(node) => nodes.push(node),
            Err(e) => {
                for node in &nodes {
                    // SAFETY: every node in `nodes` was built above and not handed out.
                    unsafe { free_node(node) };
                }
                return Err(e);
            }
        }
    }
    // SAFETY: malloc of a non-zero size; a null result is checked below.
    let buffer = unsafe { libc::malloc(size_of::<CTableNode>() * nodes.len().max(1)) } as *mut CTableNode;
    if buffer.is_null() {
        for node in &nodes {
            // SAFETY: as above.
            unsafe { free_node(node) };
        }
        return Err(GemError::Ffi("out of memory".into()));
    }
    // SAFETY: `buffer` has room for `nodes.len()` nodes and does not overlap the vec.
    unsafe { ptr::copy_nonoverlapping(nodes.as_ptr(), buffer, nodes.len()) };
    Ok(CTable {
        nodes: buffer,
        len: nodes.len(),
    })
}

/// Read a C table back into a Gem table.
///
/// # Safety
/// `table` must point at `len` initialised nodes whose strings are NUL-terminated.
pub unsafe fn from_native_table(table: &CTable) -> Result<Table, GemError> {
    let mut out = Table::new();
    if table.nodes.is_null() {
        return Ok(out);
    }
    for i in 0..table.len {
        let node = &*table.nodes.add(i);
        let key = match node.key.kind {
            KEY_INT => Key::Int(node.key.data.i as i64),
            KEY_DOUBLE => Key::from_value(&Value::Number(node.key.data.d))?,
            KEY_STRING => Key::String(read_string(node.key.data.s)?),
            other => return Err(GemError::Ffi(format!("unknown key type {}", other))),
        };
        let value = match node.value.kind {
            VAL_INT => Value::Number(node.value.data.i as f64),
            VAL_DOUBLE => Value::Number(node.value.data.d),
            VAL_BOOL => Value::Bool(node.value.data.b),
            VAL_STRING if node.value.data.s.is_null() => Value::null(),
            VAL_STRING => Value::quoted(&read_string(node.value.data.s)?),
            VAL_TABLE => Value::Table(from_native_table(&node.value.data.table)?),
            other => return Err(GemError::Ffi(format!("unknown value type {}", other))),
        };
        out.insert(key, value);
    }
    Ok(out)
}

unsafe fn read_string(s: *const c_char) -> Result<String, GemError> {
    if s.is_null() {
        return Err(GemError::Ffi("null string in table".into()));
    }
    Ok(CStr::from_ptr(s).to_string_lossy().into_owned())
}

unsafe fn free_key(key: &CKey) {
    if key.kind == KEY_STRING {
        libc::free(key.data.s as *mut libc::c_void);
    }
}

unsafe fn free_node(node: &CTableNode) {
    free_key(&node.key);
    match node.value.kind {
        VAL_STRING => libc::free(node.value.data.s as *mut libc::c_void),
        VAL_TABLE => free_native_table(node.value.data.table),
        _ => {}
    }
}

/// Free the node array of a table and everything it owns.
///
/// # Safety
/// Every string and nested table must have been allocated with `malloc` and not freed yet.
pub unsafe fn free_native_table(table: CTable) {
    if table.nodes.is_null() {
        return;
    }
    for i in 0..table.len {
        free_node(&*table.nodes.add(i));
    }
    libc::free(table.nodes as *mut libc::c_void);
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn nested_tables_survive_the_trip() {
        let inner: Table = vec![(Key::Int(0), Value::quoted("deep"))].into_iter().collect();
        let table: Table = vec![
            (Key::from("name"), Value::quoted("gem")),
            (Key::Int(1), Value::Number(2.5)),
            (Key::Double(0.5), Value::Bool(true)),
            (Key::from("inner"), Value::Table(inner)),
        ]
        .into_iter()
        .collect();
        let native = to_native_table(&table).unwrap();
        assert_eq!(native.len, 4);
        let back = unsafe { from_native_table(&native) }.unwrap();
        unsafe { free_native_table(native) };
        assert_eq!(back, table);
    }

    #[test]
    fn null_is_rejected() {
        let table: Table = vec![(Key::Int(0), Value::null())].into_iter().collect();
        assert!(matches!(to_native_table(&table), Err(GemError::Ffi(_))));
    }

    #[test]
    fn empty_table() {
        let native = to_native_table(&Table::new()).unwrap();
        assert_eq!(native.len, 0);
        assert!(unsafe { from_native_table(&native) }.unwrap().is_empty());
        unsafe { free_native_table(native) };
    }
}
