/// Options that change what the compiler emits.
#[derive(Debug, Clone, Default)]
pub struct CompileOptions {
    /// Fold arithmetic over numeric literals at compile time.
    pub optimize: bool,
}

/// Limits and modes for a [`crate::Vm`].
#[derive(Debug, Clone)]
pub struct VmConfig {
    /// Assigning to a name no scope declares is an error instead of an implicit declaration.
    pub strict: bool,
    /// How many script calls may be nested before the vm reports a stack overflow.
    pub max_call_depth: usize,
    /// How many values a single scope's operand stack may hold.
    pub max_stack_size: usize,
}

impl VmConfig {
    /// The default limits, with strict assignment turned on or off.
    pub fn new(strict: bool) -> Self {
        VmConfig {
            strict,
            ..Default::default()
        }
    }
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            strict: false,
            max_call_depth: 200,
            max_stack_size: 256,
        }
    }
}
