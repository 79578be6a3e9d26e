use std::fmt::{Display, Write};
use std::rc::Rc;
use std::str::FromStr;

use crate::error::GemError;

macro_rules! opcodes {
    ($($(#[$doc:meta])* $variant:ident => $mnemonic:literal,)*) => {
        /// A single bytecode instruction, as named in the textual bytecode.
        /// Operands follow the opcode as separate tokens.
        #[derive(Debug, Copy, Clone, PartialEq, Eq)]
        pub enum Opcode {
            $($(#[$doc])* $variant,)*
        }

        impl Opcode {
            /// The textual name of this opcode.
            pub fn mnemonic(&self) -> &'static str {
                match self {
                    $(Opcode::$variant => $mnemonic,)*
                }
            }
        }

        impl FromStr for Opcode {
            type Err = GemError;

            fn from_str(word: &str) -> Result<Self, Self::Err> {
                match word {
                    $($mnemonic => Ok(Opcode::$variant),)*
                    _ => Err(GemError::MalformedBytecode(format!("unknown instruction '{}'", word))),
                }
            }
        }
    };
}

opcodes! {
    /// Push a literal: a quoted string, a number, or a bare word.
    Push => "PUSH",
    /// Pop a value and bind it to the operand name in the current scope.
    DeclareLocal => "DECLARE_LOCAL",
    /// Pop a value and assign it to the nearest scope binding the operand name.
    StoreLocal => "STORE_LOCAL",
    /// Push a copy of the value bound to the operand name.
    LoadLocal => "LOAD_LOCAL",
    /// Remove the nearest binding of the operand name.
    Delete => "DELETE",
    /// Pop a type signature and bind a foreign function; operands are the name and library path.
    Define => "DEFINE",
    /// If stack is TOP: b, a ..., pop two and push (a+b)
    Add => "ADD",
    /// If stack is TOP: b, a ..., pop two and push (a-b)
    Sub => "SUB",
    /// If stack is TOP: b, a ..., pop two and push (a*b)
    Mul => "MUL",
    /// If stack is TOP: b, a ..., pop two and push (a/b)
    Div => "DIV",
    /// If stack is TOP: b, a ..., pop two and push a to the power of b
    Pow => "POW",
    /// If stack is TOP: b, a ..., pop two and push the float remainder of a/b
    Mod => "MOD",
    /// Pop two and push whether they are equal
    Eq => "EQ",
    /// Pop two and push whether they differ
    NotEq => "NOE",
    /// If stack is TOP: b, a, ..., push the bool a>b
    Greater => "GT",
    /// If stack is TOP: b, a, ..., push the bool a<b
    Less => "LT",
    /// If stack is TOP: b, a, ..., push the bool a>=b
    GreaterEq => "GTE",
    /// If stack is TOP: b, a, ..., push the bool a<=b
    LessEq => "LTE",
    /// Pop two; push a if it is falsy, else b
    And => "AND",
    /// Pop two; push b if a is falsy, else a
    Or => "OR",
    /// Logical negation of the top stack item
    Not => "NOT",
    /// Mark where a call's arguments start, so the CALL that follows them knows how many it got
    Args => "ARGS",
    /// Pop a callable and invoke it
    Call => "CALL",
    /// Pop a value and return it from the enclosing function
    Return => "RETURN",
    /// Push an empty table
    NewTable => "NEW_TABLE",
    /// If stack is TOP: key, value, table ..., pop key and value and store them in the table
    StoreKey => "STORE_KEY",
    /// If stack is TOP: key, object ..., pop both and push object[key]
    LoadKey => "LOAD_KEY",
    /// Pop a table, the operand's count of keys and a value; push the table with the value stored along the key path
    StoreNestedAssignment => "STORE_NESTED_ASSIGNMENT",
    /// Discard the top value
    Pop => "POP",
    #[allow(missing_docs)]
    If => "IF",
    #[allow(missing_docs)]
    Then => "THEN",
    #[allow(missing_docs)]
    Elif => "ELIF",
    #[allow(missing_docs)]
    Else => "ELSE",
    #[allow(missing_docs)]
    EndIf => "ENDIF",
    #[allow(missing_docs)]
    Loop => "LOOP",
    #[allow(missing_docs)]
    EndLoop => "ENDLOOP",
    #[allow(missing_docs)]
    Break => "BREAK",
    #[allow(missing_docs)]
    Continue => "CONTINUE",
    /// Start of a function: name and parameters follow, up to the colon
    Function => "function",
    /// Ends a function header
    Colon => ":",
    /// End of a function body
    Ret => "RET",
}

impl Opcode {
    /// How many operand tokens follow this opcode. Function headers are variable and handled apart.
    pub fn operand_count(&self) -> usize {
        match self {
            Opcode::Push
            | Opcode::DeclareLocal
            | Opcode::StoreLocal
            | Opcode::LoadLocal
            | Opcode::Delete
            | Opcode::StoreNestedAssignment => 1,
            Opcode::Define => 2,
            _ => 0,
        }
    }
}

impl Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.mnemonic())
    }
}

/// One decoded bytecode token.
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    /// An instruction.
    Op(Opcode),
    /// The raw text of an operand belonging to the instruction before it.
    Operand(String),
}

impl Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Token::Op(op) => write!(f, "{}", op),
            Token::Operand(text) => write!(f, "{}", text),
        }
    }
}

/// Split bytecode text on whitespace, keeping double-quoted strings (with their
/// backslash escapes) inside a single token.
pub fn split(source: &str) -> Result<Vec<String>, GemError> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut chars = source.chars();
    while let Some(c) = chars.next() {
        match c {
            c if c.is_whitespace() => {
                if !current.is_empty() {
                    words.push(std::mem::take(&mut current));
                }
            }
            '"' => {
                current.push('"');
                loop {
                    match chars.next() {
                        Some('\\') => {
                            current.push('\\');
                            match chars.next() {
                                Some(escaped) => current.push(escaped),
                                None => break,
                            }
                        }
                        Some('"') => {
                            current.push('"');
                            break;
                        }
                        Some(other) => current.push(other),
                        None => {
                            return Err(GemError::MalformedBytecode(format!(
                                "unterminated string {}",
                                current
                            )))
                        }
                    }
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        words.push(current);
    }
    Ok(words)
}

/// A program is the unit of execution for the VM: an immutable sequence of decoded tokens,
/// shared by every closure created from it.
#[derive(Debug, Clone)]
pub struct Program {
    code: Rc<[Token]>,
}

impl Program {
    /// Split and decode bytecode text. Every word must be an opcode or an operand an opcode asks for.
    pub fn parse(source: &str) -> Result<Self, GemError> {
        let mut code = Vec::new();
        let mut words = split(source)?.into_iter();
        while let Some(word) = words.next() {
            let op: Opcode = word.parse()?;
            code.push(Token::Op(op));
            if op == Opcode::Function {
                let name = words.next().ok_or_else(|| {
                    GemError::MalformedBytecode("function header without a name".to_string())
                })?;
                code.push(Token::Operand(name));
                loop {
                    match words.next() {
                        Some(word) if word == ":" => {
                            code.push(Token::Op(Opcode::Colon));
                            break;
                        }
                        Some(param) => code.push(Token::Operand(param)),
                        None => {
                            return Err(GemError::MalformedBytecode(
                                "function header without ':'".to_string(),
                            ))
                        }
                    }
                }
            } else {
                for _ in 0..op.operand_count() {
                    let operand = words.next().ok_or_else(|| {
                        GemError::MalformedBytecode(format!("{} is missing an operand", op))
                    })?;
                    code.push(Token::Operand(operand));
                }
            }
        }
        Ok(Program { code: code.into() })
    }

    /// The shared token array.
    pub fn code(&self) -> &Rc<[Token]> {
        &self.code
    }

    /// Return a human-readable listing: one instruction with its operands per line.
    pub fn disassemble(&self, title: &str) -> String {
        let mut ret = format!("== {} ==\n", title);
        for (i, token) in self.code.iter().enumerate() {
            match token {
                Token::Op(op) => {
                    if i > 0 {
                        ret.push('\n');
                    }
                    write!(&mut ret, "{:04} {}", i, op).expect("writing to string");
                }
                Token::Operand(text) => {
                    write!(&mut ret, " {}", text).expect("writing to string");
                }
            }
        }
        ret.push('\n');
        ret
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn split_keeps_quoted_strings_whole() {
        let words = split("PUSH \"a b\\\" c\"\n  PUSH 2\tADD").unwrap();
        assert_eq!(words, vec!["PUSH", "\"a b\\\" c\"", "PUSH", "2", "ADD"]);
    }

    #[test]
    fn unterminated_string() {
        assert!(matches!(
            split("PUSH \"oops"),
            Err(GemError::MalformedBytecode(_))
        ));
    }

    #[test]
    fn operands_are_attached_to_their_opcode() {
        let program = Program::parse("function RET a :\nLOAD_LOCAL IF\nRET\nDECLARE_LOCAL RET").unwrap();
        assert_eq!(
            &program.code()[..],
            &[
                Token::Op(Opcode::Function),
                Token::Operand("RET".into()),
                Token::Operand("a".into()),
                Token::Op(Opcode::Colon),
                Token::Op(Opcode::LoadLocal),
                Token::Operand("IF".into()),
                Token::Op(Opcode::Ret),
                Token::Op(Opcode::DeclareLocal),
                Token::Operand("RET".into()),
            ]
        );
    }

    #[test]
    fn malformed_programs() {
        assert!(Program::parse("JUMP 3").is_err());
        assert!(Program::parse("PUSH").is_err());
        assert!(Program::parse("function f a").is_err());
        assert!(Program::parse("DEFINE f").is_err());
    }

    #[test]
    fn disassemble_listing() {
        let program = Program::parse("PUSH 1 PUSH \"x\" STORE_NESTED_ASSIGNMENT 1 POP").unwrap();
        assert_eq!(
            program.disassemble("test"),
            "== test ==\n0000 PUSH 1\n0002 PUSH \"x\"\n0004 STORE_NESTED_ASSIGNMENT 1\n0006 POP\n"
        );
    }
}
