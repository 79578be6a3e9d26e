use std::path::PathBuf;

use thiserror::Error;

/// Errors that can be returned while compiling or running Gem code.
#[derive(Debug, Error)]
pub enum GemError {
    /// The scanner could not make sense of some characters.
    #[error("{file}:{line} -> Lexical Error: {message}")]
    Lexical {
        /// Source file the error is in.
        file: String,
        /// 1-based line.
        line: usize,
        /// 1-based column.
        column: usize,
        /// What went wrong.
        message: String,
    },
    /// The parser got a token it did not expect.
    #[error("{file}:{line} -> Parsing Error: {message}")]
    Parse {
        /// Source file the error is in.
        file: String,
        /// 1-based line.
        line: usize,
        /// 1-based column.
        column: usize,
        /// What went wrong.
        message: String,
    },
    /// Something went wrong while compiling a valid tree, e.g. a reflect cycle.
    #[error("compile error: {0}")]
    Compile(String),
    /// Mismatched operand types and similar runtime problems.
    #[error("runtime error: {0}")]
    Type(String),
    /// A load, store or delete of a name that no scope binds.
    #[error("runtime error: '{0}' is not defined")]
    UndefinedVariable(String),
    /// CALL on something that is not a closure or foreign function.
    #[error("runtime error: a value of type {0} is not callable")]
    NotCallable(&'static str),
    /// DIV with a zero divisor.
    #[error("runtime error: division by zero")]
    DivisionByZero,
    /// MOD with a zero divisor.
    #[error("runtime error: modulo by zero")]
    ModuloByZero,
    /// An operand stack or the call depth grew past its limit.
    #[error("stack overflow")]
    StackOverflow,
    /// Tried to get the top value from an empty stack
    #[error("popped from an empty stack")]
    StackUnderflow,
    /// Loading a library, resolving a symbol or marshalling a call failed.
    #[error("ffi error: {0}")]
    Ffi(String),
    /// The bytecode did not have the shape the vm expects.
    #[error("malformed bytecode: {0}")]
    MalformedBytecode(String),
    /// A source or library file could not be read.
    #[error("could not read '{path}': {source}")]
    Io {
        /// The file that failed.
        path: PathBuf,
        /// Why it failed.
        #[source]
        source: std::io::Error,
    },
    /// Writing program output failed.
    #[error("failed to write output: {0}")]
    Output(#[from] std::io::Error),
}

impl GemError {
    /// Render the error with the offending source line and a pointer under the column,
    /// when the error carries a position. Other errors render as their message.
    pub fn render(&self, source: &str) -> String {
        let (line, column) = match self {
            GemError::Lexical { line, column, .. } | GemError::Parse { line, column, .. } => {
                (*line, *column)
            }
            _ => return self.to_string(),
        };
        let text = source.lines().nth(line.saturating_sub(1)).unwrap_or("");
        let pad = " ".repeat(column.saturating_sub(1));
        format!("{}\n| {}\n| {}^~~", self, text, pad)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn render_points_at_column() {
        let err = GemError::Parse {
            file: "main.gem".into(),
            line: 2,
            column: 9,
            message: "Expected expression, got '='!".into(),
        };
        let rendered = err.render("var a = 1\nvar b = = 2\n");
        assert_eq!(
            rendered,
            "main.gem:2 -> Parsing Error: Expected expression, got '='!\n| var b = = 2\n|         ^~~"
        );
    }

    #[test]
    fn render_without_position() {
        assert_eq!(
            GemError::DivisionByZero.render("1 / 0"),
            "runtime error: division by zero"
        );
    }
}
