use std::cell::RefCell;
use std::io::Write;
use std::path::Path;
use std::rc::Rc;

use gem::{compile_source, CompileOptions, GemError, Vm, VmConfig};

/// Collects everything the vm prints.
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

#[allow(dead_code)]
pub fn compile(source: &str) -> String {
    compile_source(source, Path::new("test.gem"), &CompileOptions::default()).unwrap()
}

/// Compile and run `source`, returning what it printed or the first error.
pub fn try_run_with(source: &str, config: VmConfig) -> Result<String, GemError> {
    let bytecode = compile_source(source, Path::new("test.gem"), &CompileOptions::default())?;
    let capture = Capture::default();
    let mut vm = Vm::with_output(config, Box::new(capture.clone()));
    vm.evaluate(&bytecode)?;
    Ok(capture.contents())
}

#[allow(dead_code)]
pub fn try_run(source: &str) -> Result<String, GemError> {
    try_run_with(source, VmConfig::default())
}

#[allow(dead_code)]
pub fn run(source: &str) -> String {
    try_run(source).unwrap()
}
