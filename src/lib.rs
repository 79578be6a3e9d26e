//! The lib crate for the Gem bytecode compiler and virtual machine.
#![warn(missing_debug_implementations, missing_docs, rust_2018_idioms)]

use std::path::Path;

/// scanner scans!
pub mod scanner;

/// The syntax tree the parser builds and the compiler walks.
pub mod ast;

/// Turns scanner tokens into a syntax tree.
pub mod parser;

/// Takes a syntax tree and emits mnemonic bytecode text.
pub mod compiler;

/// Re-tokenising and decoding of bytecode text.
pub mod bytecode;

/// vm is the bits about running code.
pub mod vm;

/// Calling into C shared libraries.
pub mod ffi;

/// Knobs for the compiler and the vm.
pub mod config;

/// The one error type everything returns.
pub mod error;

pub use config::{CompileOptions, VmConfig};
pub use error::GemError;
pub use vm::Vm;

/// Scan, parse and compile a source file's text into bytecode text.
/// `origin` is the path of the file the source came from; `reflect` and `extern`
/// paths are resolved against its directory.
pub fn compile_source(
    source: &str,
    origin: &Path,
    options: &CompileOptions,
) -> Result<String, GemError> {
    let tokens = scanner::Scanner::new(source);
    let program = parser::parse(tokens, origin)?;
    compiler::compile(&program, origin, options)
}

#[cfg(test)]
pub(crate) mod testing {
    use std::cell::RefCell;
    use std::io::Write;
    use std::path::Path;
    use std::rc::Rc;

    use crate::{compile_source, CompileOptions, Vm, VmConfig};

    /// A writer whose contents can be read back after the vm is done with it.
    #[derive(Debug, Clone, Default)]
    pub struct Capture(Rc<RefCell<Vec<u8>>>);

    impl Capture {
        pub fn contents(&self) -> String {
            String::from_utf8(self.0.borrow().clone()).unwrap()
        }
    }

    impl Write for Capture {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    pub fn run(source: &str) -> String {
        let bytecode =
            compile_source(source, Path::new("test.gem"), &CompileOptions::default()).unwrap();
        let capture = Capture::default();
        let mut vm = Vm::with_output(VmConfig::default(), Box::new(capture.clone()));
        vm.evaluate(&bytecode).unwrap();
        capture.contents()
    }
}
