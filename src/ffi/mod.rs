//! Foreign functions: C symbols named `gem_<name>` in shared libraries, loaded by `DEFINE`
//! and called through libffi.

use std::collections::HashMap;
use std::os::raw::c_void;
use std::path::PathBuf;
use std::str::FromStr;

use libloading::{Library, Symbol};
use log::debug;

use crate::error::GemError;
#[cfg(not(feature = "ffi"))]
use crate::vm::Value;

pub mod ctable;

/// The C types an `extern` declaration can name.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum CType {
    Double,
    Float,
    Int,
    UInt,
    /// `char *`, NUL-terminated.
    String,
    /// A pointer to a [`ctable::CTable`].
    Table,
    Void,
    Bool,
}

impl FromStr for CType {
    type Err = GemError;

    fn from_str(word: &str) -> Result<Self, Self::Err> {
        match word {
            "double" => Ok(CType::Double),
            "float" => Ok(CType::Float),
            "int" => Ok(CType::Int),
            "uint" => Ok(CType::UInt),
            "string" => Ok(CType::String),
            "table" => Ok(CType::Table),
            "void" => Ok(CType::Void),
            "bool" => Ok(CType::Bool),
            other => Err(GemError::Ffi(format!("unknown C type '{}'", other))),
        }
    }
}

/// A resolved C function and its signature.
#[derive(Debug)]
pub struct ForeignFunction {
    name: String,
    address: *const c_void,
    arg_types: Vec<CType>,
    return_type: CType,
}

impl ForeignFunction {
    /// Describe the function at `address`. Calling it is only sound if the signature matches
    /// and the code stays loaded.
    pub fn new(name: &str, address: *const c_void, arg_types: Vec<CType>, return_type: CType) -> Self {
        ForeignFunction {
            name: name.to_string(),
            address,
            arg_types,
            return_type,
        }
    }

    /// The name it was declared under, without the `gem_` prefix.
    pub fn name(&self) -> &str {
        &self.name
    }

    #[allow(missing_docs)]
    pub fn arg_types(&self) -> &[CType] {
        &self.arg_types
    }

    #[allow(missing_docs)]
    pub fn return_type(&self) -> CType {
        self.return_type
    }
}

/// Keeps every library loaded for as long as the vm lives, one load per path.
#[derive(Debug, Default)]
pub struct ForeignRegistry {
    libraries: HashMap<PathBuf, Library>,
}

impl ForeignRegistry {
    #[allow(missing_docs)]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load `path` unless it is loaded already and resolve `gem_<name>` in it.
    pub fn define(
        &mut self,
        name: &str,
        path: &str,
        arg_types: Vec<CType>,
        return_type: CType,
    ) -> Result<ForeignFunction, GemError> {
        if arg_types.contains(&CType::Void) {
            return Err(GemError::Ffi(format!("{} takes a void argument", name)));
        }
        let path = PathBuf::from(path);
        if !self.libraries.contains_key(&path) {
            // SAFETY: loading runs the library's initialisers, which we trust as much as its functions.
            let library = unsafe { Library::new(&path) }
                .map_err(|e| GemError::Ffi(format!("cannot load {}: {}", path.display(), e)))?;
            debug!("loaded library {}", path.display());
            self.libraries.insert(path.clone(), library);
        }
        let library = self
            .libraries
            .get(&path)
            .ok_or_else(|| GemError::Ffi(format!("{} is not loaded", path.display())))?;
        let symbol = format!("gem_{}", name);
        // SAFETY: the symbol is only used as an address; the declared signature is trusted at call time.
        let address = unsafe {
            let function: Symbol<'_, unsafe extern "C" fn()> = library
                .get(symbol.as_bytes())
                .map_err(|e| GemError::Ffi(format!("{} not found in {}: {}", symbol, path.display(), e)))?;
            *function as *const c_void
        };
        debug!(
            "bound {} ({:?}) -> {:?} from {}",
            symbol,
            arg_types,
            return_type,
            path.display()
        );
        Ok(ForeignFunction::new(name, address, arg_types, return_type))
    }
}

#[cfg(feature = "ffi")]
mod call {
    use std::ffi::{CStr, CString};
    use std::os::raw::{c_char, c_int, c_uint};

    use libffi::middle::{Arg, Cif, CodePtr, Type};

    use super::ctable::{self, CTable};
    use super::{CType, ForeignFunction};
    use crate::error::GemError;
    use crate::vm::Value;

    impl CType {
        fn ffi_type(self) -> Type {
            match self {
                CType::Double => Type::f64(),
                CType::Float => Type::f32(),
                CType::Int => Type::c_int(),
                CType::UInt => Type::c_uint(),
                CType::Bool => Type::u8(),
                CType::String | CType::Table => Type::pointer(),
                CType::Void => Type::void(),
            }
        }
    }

    // One marshalled argument. Pointer slots own what they point at until the call is over.
    enum Slot {
        Double(f64),
        Float(f32),
        Int(c_int),
        UInt(c_uint),
        Bool(u8),
        // `_owned` keeps the text alive while `ptr` is handed to C.
        Str { _owned: CString, ptr: *const c_char },
        Table(Box<CTable>, *const CTable),
    }

    impl Slot {
        fn new(typ: CType, value: &Value) -> Result<Slot, GemError> {
            let mismatch = || {
                GemError::Ffi(format!(
                    "cannot pass a {} as {:?}",
                    value.type_name(),
                    typ
                ))
            };
            Ok(match (typ, value) {
                (CType::Double, Value::Number(n)) => Slot::Double(*n),
                (CType::Float, Value::Number(n)) => Slot::Float(*n as f32),
                (CType::Int, Value::Number(n)) => Slot::Int(*n as c_int),
                (CType::UInt, Value::Number(n)) => Slot::UInt(*n as c_uint),
                (CType::Bool, Value::Bool(b)) => Slot::Bool(u8::from(*b)),
                (CType::String, Value::String(_)) if !value.is_null() => {
                    let text = CString::new(value.as_text().unwrap_or_default())
                        .map_err(|_| GemError::Ffi("string contains a NUL byte".into()))?;
                    let ptr = text.as_ptr();
                    Slot::Str { _owned: text, ptr }
                }
                (CType::Table, Value::Table(table)) => {
                    let native = Box::new(ctable::to_native_table(table)?);
                    let ptr: *const CTable = &*native;
                    Slot::Table(native, ptr)
                }
                _ => return Err(mismatch()),
            })
        }

        fn arg(&self) -> Arg {
            match self {
                Slot::Double(d) => Arg::new(d),
                Slot::Float(f) => Arg::new(f),
                Slot::Int(i) => Arg::new(i),
                Slot::UInt(u) => Arg::new(u),
                Slot::Bool(b) => Arg::new(b),
                Slot::Str { ptr, .. } => Arg::new(ptr),
                Slot::Table(_, ptr) => Arg::new(ptr),
            }
        }
    }

    impl Drop for Slot {
        fn drop(&mut self) {
            if let Slot::Table(native, _) = self {
                // SAFETY: the table was built by `to_native_table` and is freed once, here.
                unsafe { ctable::free_native_table(**native) };
            }
        }
    }

    /// Call `function` with one value per declared argument type, first argument first.
    pub fn call(function: &ForeignFunction, args: Vec<Value>) -> Result<Value, GemError> {
        if args.len() != function.arg_types.len() {
            return Err(GemError::Ffi(format!(
                "{} takes {} arguments, got {}",
                function.name,
                function.arg_types.len(),
                args.len()
            )));
        }
        let slots = function
            .arg_types
            .iter()
            .zip(&args)
            .map(|(typ, value)| Slot::new(*typ, value))
            .collect::<Result<Vec<_>, _>>()?;
        let cif = Cif::new(
            function.arg_types.iter().map(|typ| typ.ffi_type()),
            function.return_type.ffi_type(),
        );
        let ffi_args = slots.iter().map(Slot::arg).collect::<Vec<_>>();
        let code = CodePtr::from_ptr(function.address);

        // SAFETY: the cif matches the declared signature and every argument slot outlives the call.
        // Integer results come back widened to a full register, so they are read as 64 bits.
        let result = unsafe {
            match function.return_type {
                CType::Double => Value::Number(cif.call::<f64>(code, &ffi_args)),
                CType::Float => Value::Number(cif.call::<f32>(code, &ffi_args) as f64),
                CType::Int => Value::Number(cif.call::<i64>(code, &ffi_args) as c_int as f64),
                CType::UInt => Value::Number(cif.call::<u64>(code, &ffi_args) as c_uint as f64),
                CType::Bool => Value::Bool(cif.call::<u64>(code, &ffi_args) as u8 != 0),
                CType::Void => {
                    cif.call::<()>(code, &ffi_args);
                    Value::null()
                }
                CType::String => {
                    let ptr = cif.call::<*const c_char>(code, &ffi_args);
                    if ptr.is_null() {
                        Value::null()
                    } else {
                        Value::quoted(&CStr::from_ptr(ptr).to_string_lossy())
                    }
                }
                CType::Table => {
                    let ptr = cif.call::<*mut CTable>(code, &ffi_args);
                    if ptr.is_null() {
                        Value::null()
                    } else {
                        let table = ctable::from_native_table(&*ptr);
                        ctable::free_native_table(*ptr);
                        libc::free(ptr as *mut libc::c_void);
                        Value::Table(table?)
                    }
                }
            }
        };
        drop(slots);
        Ok(result)
    }
}

#[cfg(feature = "ffi")]
pub use call::call;

/// Without libffi there is no way to call a foreign function.
#[cfg(not(feature = "ffi"))]
pub fn call(function: &ForeignFunction, _args: Vec<Value>) -> Result<Value, GemError> {
    Err(GemError::Ffi(format!(
        "cannot call {}: built without the ffi feature",
        function.name
    )))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn type_names() {
        assert_eq!("uint".parse::<CType>().unwrap(), CType::UInt);
        assert_eq!("table".parse::<CType>().unwrap(), CType::Table);
        assert!(matches!("long".parse::<CType>(), Err(GemError::Ffi(_))));
    }

    #[test]
    fn missing_library() {
        let mut registry = ForeignRegistry::new();
        let result = registry.define("f", "/nonexistent/libnothing.so", vec![], CType::Void);
        assert!(matches!(result, Err(GemError::Ffi(_))));
    }

    #[test]
    fn void_arguments_are_rejected() {
        let mut registry = ForeignRegistry::new();
        let result = registry.define("f", "libm.so.6", vec![CType::Void], CType::Int);
        assert!(matches!(result, Err(GemError::Ffi(msg)) if msg.contains("void")));
    }

    #[cfg(feature = "ffi")]
    mod calls {
        use std::os::raw::{c_char, c_int, c_void};

        use super::super::ctable::CTable;
        use super::super::*;
        use crate::vm::{Key, Table, Value};

        extern "C" fn add(a: f64, b: f64) -> f64 {
            a + b
        }

        extern "C" fn count(table: *const CTable) -> c_int {
            unsafe { (*table).len as c_int }
        }

        extern "C" fn negate(b: bool) -> bool {
            !b
        }

        extern "C" fn greeting(n: c_int) -> *const c_char {
            if n > 0 {
                b"hello\0".as_ptr() as *const c_char
            } else {
                std::ptr::null()
            }
        }

        fn function(address: *const c_void, args: Vec<CType>, ret: CType) -> ForeignFunction {
            ForeignFunction::new("test", address, args, ret)
        }

        #[test]
        fn numbers() {
            let f = function(add as *const c_void, vec![CType::Double, CType::Double], CType::Double);
            let result = call(&f, vec![Value::Number(2.0), Value::Number(3.5)]).unwrap();
            assert_eq!(result, Value::Number(5.5));
        }

        #[test]
        fn tables_by_pointer() {
            let table: Table = vec![
                (Key::Int(0), Value::quoted("a")),
                (Key::from("b"), Value::Number(1.0)),
            ]
            .into_iter()
            .collect();
            let f = function(count as *const c_void, vec![CType::Table], CType::Int);
            assert_eq!(call(&f, vec![Value::Table(table)]).unwrap(), Value::Number(2.0));
        }

        #[test]
        fn bools_and_strings() {
            let f = function(negate as *const c_void, vec![CType::Bool], CType::Bool);
            assert_eq!(call(&f, vec![Value::Bool(true)]).unwrap(), Value::Bool(false));

            let f = function(greeting as *const c_void, vec![CType::Int], CType::String);
            assert_eq!(call(&f, vec![Value::Number(1.0)]).unwrap(), Value::quoted("hello"));
            assert!(call(&f, vec![Value::Number(0.0)]).unwrap().is_null());
        }

        #[test]
        fn argument_mismatch() {
            let f = function(add as *const c_void, vec![CType::Double, CType::Double], CType::Double);
            assert!(call(&f, vec![Value::quoted("x"), Value::Number(1.0)]).is_err());
            assert!(call(&f, vec![Value::Number(1.0)]).is_err());
        }
    }
}
