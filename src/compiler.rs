use std::fmt::Display;
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info};

use crate::ast::{BinaryOp, Expr, FunctionDecl, Program, Stmt, UnaryOp};
use crate::config::CompileOptions;
use crate::error::GemError;
use crate::parser;
use crate::scanner::Scanner;

// Compiler walks a Program and appends one mnemonic instruction per line to `out`.
// Indentation is cosmetic; the vm only cares about the whitespace separated tokens.
#[derive(Debug)]
struct Compiler<'o> {
    out: String,
    indentation: usize,
    options: &'o CompileOptions,
    // The file whose statements are being compiled. Changes while a reflect is inlined.
    origin: PathBuf,
    // Files currently being inlined, outermost first, to catch reflect cycles.
    reflecting: Vec<PathBuf>,
    hidden_names: usize,
}

type CompileResult = Result<(), GemError>;

impl<'o> Compiler<'o> {
    fn emit(&mut self, line: impl Display) {
        for _ in 0..self.indentation {
            self.out.push_str("  ");
        }
        self.out.push_str(&line.to_string());
        self.out.push('\n');
    }

    // Emits `line`, then whatever `inner` emits one level deeper.
    fn nested(&mut self, line: &str, inner: impl FnOnce(&mut Self) -> CompileResult) -> CompileResult {
        self.emit(line);
        self.indentation += 1;
        let result = inner(self);
        self.indentation -= 1;
        result
    }

    fn program(&mut self, program: &Program) -> CompileResult {
        self.nested("function main :", |c| c.statements(&program.body))?;
        self.emit("RET");
        self.emit("DECLARE_LOCAL main");
        Ok(())
    }

    fn statements(&mut self, body: &[Stmt]) -> CompileResult {
        body.iter().try_for_each(|stmt| self.statement(stmt))
    }

    fn statement(&mut self, stmt: &Stmt) -> CompileResult {
        match stmt {
            Stmt::Var { name, value } => {
                self.expression(value)?;
                self.emit(format_args!("DECLARE_LOCAL {}", name));
            }
            Stmt::Function(decl) => {
                self.function(decl)?;
                self.emit(format_args!("DECLARE_LOCAL {}", decl.name));
            }
            Stmt::Assign { target, value } => self.assignment(target, value)?,
            Stmt::If {
                branches,
                otherwise,
            } => {
                for (i, (condition, body)) in branches.iter().enumerate() {
                    let opener = if i == 0 { "IF" } else { "ELIF" };
                    self.nested(opener, |c| c.expression(condition))?;
                    self.nested("THEN", |c| c.statements(body))?;
                    self.emit("ENDIF");
                }
                if let Some(body) = otherwise {
                    self.nested("ELSE", |c| c.statements(body))?;
                    self.emit("ENDIF");
                }
            }
            Stmt::While { condition, body } => {
                self.nested("LOOP", |c| {
                    c.nested("IF", |c| c.expression(condition))?;
                    c.nested("THEN", |c| c.statements(body))?;
                    c.emit("ENDIF");
                    c.nested("ELSE", |c| {
                        c.emit("BREAK");
                        Ok(())
                    })?;
                    c.emit("ENDIF");
                    Ok(())
                })?;
                self.emit("ENDLOOP");
            }
            Stmt::ForRange {
                counter,
                start,
                end,
                step,
                body,
            } => self.range_loop(counter, start, end, step.as_ref(), body)?,
            Stmt::ForEach {
                key,
                value,
                iterator,
                body,
            } => self.each_loop(key, value, iterator, body)?,
            Stmt::Return(value) => {
                match value {
                    Some(value) => self.expression(value)?,
                    None => self.emit("LOAD_LOCAL null"),
                }
                self.emit("RETURN");
            }
            Stmt::Break => self.emit("BREAK"),
            Stmt::Continue => self.emit("CONTINUE"),
            Stmt::Reflect { path, names } => self.reflect(path, names)?,
            Stmt::Shine(inner) => self.statement(inner)?,
            Stmt::Extern {
                name,
                path,
                arg_types,
                return_type,
            } => {
                for typ in arg_types.iter().rev() {
                    self.emit(format_args!("PUSH {}", typ));
                }
                self.emit(format_args!("PUSH {}", return_type));
                self.emit(format_args!("PUSH {}", arg_types.len()));
                let library = self.resolve_library(path);
                self.emit(format_args!("DEFINE {} {}", name, library));
            }
            Stmt::Delete(name) => self.emit(format_args!("DELETE {}", name)),
            Stmt::Expr(expr) => {
                self.expression(expr)?;
                self.emit("POP");
            }
        }
        Ok(())
    }

    // `function NAME params :` body `RET`. Leaves the closure on the stack; statements
    // declare it afterwards.
    fn function(&mut self, decl: &FunctionDecl) -> CompileResult {
        let mut header = format!("function {}", decl.name);
        for param in &decl.params {
            header.push(' ');
            header.push_str(param);
        }
        header.push_str(" :");
        self.nested(&header, |c| c.statements(&decl.body))?;
        self.emit("RET");
        Ok(())
    }

    fn assignment(&mut self, target: &Expr, value: &Expr) -> CompileResult {
        self.expression(value)?;
        let mut object = target;
        let mut depth = 0;
        // Keys come out leaf first, so the root's own key ends up on top of the stack.
        while let Expr::Member {
            object: inner,
            property,
            ..
        } = object
        {
            self.expression(property)?;
            depth += 1;
            object = inner;
        }
        let Expr::Identifier(root) = object else {
            return Err(GemError::Compile(
                "only variables and their members can be assigned".to_string(),
            ));
        };
        if depth > 0 {
            self.emit(format_args!("LOAD_LOCAL {}", root));
            self.emit(format_args!("STORE_NESTED_ASSIGNMENT {}", depth));
        }
        self.emit(format_args!("STORE_LOCAL {}", root));
        Ok(())
    }

    // The counter starts one step early and is bumped at the top of every pass,
    // so CONTINUE never skips the increment. An always-taken IF gives the counter
    // a scope of its own, so a variable of the same name outside is untouched.
    fn range_loop(
        &mut self,
        counter: &str,
        start: &Expr,
        end: &Expr,
        step: Option<&Expr>,
        body: &[Stmt],
    ) -> CompileResult {
        self.nested("IF", |c| {
            c.emit("PUSH 1");
            Ok(())
        })?;
        self.nested("THEN", |c| c.counted_loop(counter, start, end, step, body))?;
        self.emit("ENDIF");
        Ok(())
    }

    fn counted_loop(
        &mut self,
        counter: &str,
        start: &Expr,
        end: &Expr,
        step: Option<&Expr>,
        body: &[Stmt],
    ) -> CompileResult {
        let one = Expr::Number(1.0);
        let step = step.unwrap_or(&one);
        self.expression(&Expr::Binary {
            op: BinaryOp::Sub,
            left: Box::new(start.clone()),
            right: Box::new(step.clone()),
        })?;
        self.emit(format_args!("DECLARE_LOCAL {}", counter));
        self.nested("LOOP", |c| {
            c.emit(format_args!("LOAD_LOCAL {}", counter));
            c.expression(step)?;
            c.emit("ADD");
            c.emit(format_args!("STORE_LOCAL {}", counter));
            c.nested("IF", |c| {
                c.emit(format_args!("LOAD_LOCAL {}", counter));
                c.expression(end)?;
                c.emit("GTE");
                Ok(())
            })?;
            c.nested("THEN", |c| {
                c.emit("BREAK");
                Ok(())
            })?;
            c.emit("ENDIF");
            c.statements(body)
        })?;
        self.emit("ENDLOOP");
        Ok(())
    }

    fn each_loop(&mut self, key: &str, value: &str, iterator: &Expr, body: &[Stmt]) -> CompileResult {
        self.hidden_names += 1;
        let hidden = format!("0x{:08}b", self.hidden_names);
        self.expression(iterator)?;
        self.emit(format_args!("DECLARE_LOCAL {}", hidden));
        self.nested("LOOP", |c| {
            c.emit(format_args!("LOAD_LOCAL {}", hidden));
            c.emit("CALL");
            c.emit(format_args!("DECLARE_LOCAL {}", key));
            c.emit(format_args!("DECLARE_LOCAL {}", value));
            c.nested("IF", |c| {
                c.emit(format_args!("LOAD_LOCAL {}", key));
                c.emit("LOAD_LOCAL null");
                c.emit("EQ");
                Ok(())
            })?;
            c.nested("THEN", |c| {
                c.emit("BREAK");
                Ok(())
            })?;
            c.emit("ENDIF");
            c.statements(body)
        })?;
        self.emit("ENDLOOP");
        self.emit(format_args!("DELETE {}", hidden));
        Ok(())
    }

    fn expression(&mut self, expr: &Expr) -> CompileResult {
        if self.options.optimize && !matches!(expr, Expr::Number(_)) {
            if let Some(folded) = fold(expr) {
                self.emit(format_args!("PUSH {}", folded));
                return Ok(());
            }
        }
        match expr {
            Expr::Number(n) => self.emit(format_args!("PUSH {}", n)),
            Expr::Str(s) => self.emit(format_args!("PUSH {}", quote(s))),
            Expr::Bool(b) => self.emit(format_args!("LOAD_LOCAL {}", b)),
            Expr::Identifier(name) => self.emit(format_args!("LOAD_LOCAL {}", name)),
            Expr::Binary { op, left, right } => {
                self.expression(left)?;
                self.expression(right)?;
                self.emit(op);
            }
            Expr::Unary {
                op: UnaryOp::Negate,
                operand,
            } => {
                self.emit("PUSH 0");
                self.expression(operand)?;
                self.emit("SUB");
            }
            Expr::Unary {
                op: UnaryOp::Not,
                operand,
            } => {
                self.expression(operand)?;
                self.emit("NOT");
            }
            Expr::Call { callee, args } => {
                self.emit("ARGS");
                for arg in args.iter().rev() {
                    self.expression(arg)?;
                }
                self.expression(callee)?;
                self.emit("CALL");
            }
            Expr::Member {
                object, property, ..
            } => {
                self.expression(object)?;
                self.expression(property)?;
                self.emit("LOAD_KEY");
            }
            Expr::Table(entries) => {
                self.emit("NEW_TABLE");
                for (key, value) in entries {
                    self.expression(value)?;
                    self.expression(key)?;
                    self.emit("STORE_KEY");
                }
            }
            Expr::Function(decl) => self.function(decl)?,
        }
        Ok(())
    }

    fn base_dir(&self) -> PathBuf {
        match self.origin.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }

    // Inlines the `shine` declarations of another file, optionally only the named ones.
    fn reflect(&mut self, path: &str, names: &[String]) -> CompileResult {
        let mut candidate = self.base_dir().join(path);
        if !candidate.is_file() {
            let mut with_extension = candidate.clone().into_os_string();
            with_extension.push(".gem");
            if Path::new(&with_extension).is_file() {
                candidate = PathBuf::from(with_extension);
            }
        }
        let resolved = canonical(&candidate);
        if self.reflecting.contains(&resolved) {
            return Err(GemError::Compile(format!(
                "'{}' reflects itself through '{}'",
                resolved.display(),
                self.origin.display()
            )));
        }
        debug!("reflecting {} into {}", resolved.display(), self.origin.display());
        let source = fs::read_to_string(&resolved).map_err(|source| GemError::Io {
            path: resolved.clone(),
            source,
        })?;
        let program = parser::parse(Scanner::new(&source), &resolved)?;

        let outer = std::mem::replace(&mut self.origin, resolved.clone());
        self.reflecting.push(resolved);
        // The file's own reflects come along so its exports can use what they import.
        let result = program
            .body
            .iter()
            .filter(|stmt| match stmt {
                Stmt::Reflect { .. } => true,
                Stmt::Shine(_) => {
                    names.is_empty()
                        || stmt
                            .declared_name()
                            .map_or(false, |name| names.iter().any(|n| n == name))
                }
                _ => false,
            })
            .try_for_each(|stmt| self.statement(stmt));
        self.reflecting.pop();
        self.origin = outer;
        result
    }

    // Relative library paths that exist next to the source are made absolute; anything else
    // is left for the dynamic loader to search.
    fn resolve_library(&self, path: &str) -> String {
        let mut resolved = PathBuf::from(path);
        if resolved.is_relative() {
            let local = self.base_dir().join(path);
            if local.exists() {
                resolved = canonical(&local);
            }
        }
        let text = resolved.display().to_string();
        if text.contains(char::is_whitespace) {
            quote(&text)
        } else {
            text
        }
    }
}

fn canonical(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Wraps text in double quotes, escaping what the bytecode reader would otherwise split on.
pub fn quote(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push('"');
    for c in text.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            '\0' => out.push_str("\\0"),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

// Evaluates arithmetic over number literals. Division and modulo by zero, and results
// that are not finite, are left for the vm.
fn fold(expr: &Expr) -> Option<f64> {
    match expr {
        Expr::Number(n) => Some(*n),
        Expr::Unary {
            op: UnaryOp::Negate,
            operand,
        } => fold(operand).map(|n| 0.0 - n),
        Expr::Binary { op, left, right } if op.is_arithmetic() => {
            let (a, b) = (fold(left)?, fold(right)?);
            let result = match op {
                BinaryOp::Add => a + b,
                BinaryOp::Sub => a - b,
                BinaryOp::Mul => a * b,
                BinaryOp::Div if b != 0.0 => a / b,
                BinaryOp::Mod if b != 0.0 => a % b,
                BinaryOp::Pow => a.powf(b),
                _ => return None,
            };
            result.is_finite().then_some(result)
        }
        _ => None,
    }
}

/// Compile a parsed program into bytecode text.
/// `origin` is the file the program came from; `reflect` and `extern` paths are relative to it.
pub fn compile(program: &Program, origin: &Path, options: &CompileOptions) -> Result<String, GemError> {
    info!("compiling {} to bytecode", origin.display());
    let mut compiler = Compiler {
        out: String::new(),
        indentation: 0,
        options,
        origin: origin.to_path_buf(),
        reflecting: vec![canonical(origin)],
        hidden_names: 0,
    };
    compiler.program(program)?;
    Ok(compiler.out)
}

#[cfg(test)]
mod test {
    use super::*;

    fn compile_str(text: &str, optimize: bool) -> Result<String, GemError> {
        let origin = Path::new("test.gem");
        let program = parser::parse(Scanner::new(text), origin).unwrap();
        compile(&program, origin, &CompileOptions { optimize })
    }

    fn ops(bytecode: &str) -> Vec<&str> {
        bytecode.lines().map(str::trim).collect()
    }

    #[test]
    fn wraps_program_in_main() {
        let bytecode = compile_str("var x = 1 + 2\nconsole.out(x)", false).unwrap();
        assert_eq!(
            bytecode,
            "function main :\n  PUSH 1\n  PUSH 2\n  ADD\n  DECLARE_LOCAL x\n  ARGS\n  LOAD_LOCAL x\n  LOAD_LOCAL console\n  PUSH \"out\"\n  LOAD_KEY\n  CALL\n  POP\nRET\nDECLARE_LOCAL main\n"
        );
    }

    #[test]
    fn nested_member_assignment() {
        let bytecode = compile_str("a.b[k] = 5", false).unwrap();
        assert_eq!(
            &ops(&bytecode)[1..7],
            &[
                "PUSH 5",
                "LOAD_LOCAL k",
                "PUSH \"b\"",
                "LOAD_LOCAL a",
                "STORE_NESTED_ASSIGNMENT 2",
                "STORE_LOCAL a",
            ]
        );
    }

    #[test]
    fn unary_and_logic() {
        let bytecode = compile_str("var y = -x && !true", false).unwrap();
        assert_eq!(
            &ops(&bytecode)[1..8],
            &[
                "PUSH 0",
                "LOAD_LOCAL x",
                "SUB",
                "LOAD_LOCAL true",
                "NOT",
                "AND",
                "DECLARE_LOCAL y",
            ]
        );
    }

    #[test]
    fn if_chain_layout() {
        let bytecode = compile_str("if a { b() } elif c { } else { return 1 }", false).unwrap();
        assert_eq!(
            ops(&bytecode)[1..],
            [
                "IF", "LOAD_LOCAL a", "THEN", "ARGS", "LOAD_LOCAL b", "CALL", "POP", "ENDIF", "ELIF",
                "LOAD_LOCAL c", "THEN", "ENDIF", "ELSE", "PUSH 1", "RETURN", "ENDIF", "RET",
                "DECLARE_LOCAL main",
            ]
        );
    }

    #[test]
    fn range_loop_layout() {
        let bytecode = compile_str("for (i) in (0, 5) { continue }", false).unwrap();
        assert_eq!(
            ops(&bytecode)[1..],
            [
                "IF",
                "PUSH 1",
                "THEN",
                "PUSH 0",
                "PUSH 1",
                "SUB",
                "DECLARE_LOCAL i",
                "LOOP",
                "LOAD_LOCAL i",
                "PUSH 1",
                "ADD",
                "STORE_LOCAL i",
                "IF",
                "LOAD_LOCAL i",
                "PUSH 5",
                "GTE",
                "THEN",
                "BREAK",
                "ENDIF",
                "CONTINUE",
                "ENDLOOP",
                "ENDIF",
                "RET",
                "DECLARE_LOCAL main",
            ]
        );
    }

    #[test]
    fn each_loop_uses_hidden_iterator() {
        let bytecode = compile_str("for (k, v) in it {}\nfor (k, v) in it {}", false).unwrap();
        let ops = ops(&bytecode);
        assert_eq!(ops[2], "DECLARE_LOCAL 0x00000001b");
        assert!(ops.contains(&"DELETE 0x00000002b"));
        assert_eq!(
            &ops[3..13],
            &[
                "LOOP",
                "LOAD_LOCAL 0x00000001b",
                "CALL",
                "DECLARE_LOCAL k",
                "DECLARE_LOCAL v",
                "IF",
                "LOAD_LOCAL k",
                "LOAD_LOCAL null",
                "EQ",
                "THEN",
            ]
        );
    }

    #[test]
    fn functions_as_statements_and_values() {
        let bytecode = compile_str("fn add(a, b) { return a + b }\nvar f = fn(x) { return x }", false).unwrap();
        let ops = ops(&bytecode);
        assert_eq!(
            &ops[1..7],
            &["function add a b :", "LOAD_LOCAL a", "LOAD_LOCAL b", "ADD", "RETURN", "RET"]
        );
        assert_eq!(ops[7], "DECLARE_LOCAL add");
        assert_eq!(
            &ops[8..12],
            &["function _ x :", "LOAD_LOCAL x", "RETURN", "RET"]
        );
        assert_eq!(ops[12], "DECLARE_LOCAL f");
    }

    #[test]
    fn call_arguments_are_reversed() {
        let bytecode = compile_str("f(1, 'two')", false).unwrap();
        assert_eq!(
            &ops(&bytecode)[1..7],
            &["ARGS", "PUSH \"two\"", "PUSH 1", "LOAD_LOCAL f", "CALL", "POP"]
        );
    }

    #[test]
    fn table_literal() {
        let bytecode = compile_str("var t = {x: 1, 'y'}", false).unwrap();
        assert_eq!(
            &ops(&bytecode)[1..9],
            &[
                "NEW_TABLE",
                "PUSH 1",
                "PUSH \"x\"",
                "STORE_KEY",
                "PUSH \"y\"",
                "PUSH 0",
                "STORE_KEY",
                "DECLARE_LOCAL t",
            ]
        );
    }

    #[test]
    fn extern_declaration() {
        let bytecode =
            compile_str("extern pow :: \"libm.so.6\" :: (double, int) -> double", false).unwrap();
        assert_eq!(
            &ops(&bytecode)[1..6],
            &[
                "PUSH int",
                "PUSH double",
                "PUSH double",
                "PUSH 2",
                "DEFINE pow libm.so.6",
            ]
        );
    }

    #[test]
    fn strings_are_requoted() {
        let bytecode = compile_str(r#"var s = "say \"hi\"\n""#, false).unwrap();
        assert_eq!(ops(&bytecode)[1], r#"PUSH "say \"hi\"\n""#);
    }

    #[test]
    fn optimize_folds_literals() {
        let bytecode = compile_str("var x = 2 * 3 + 4 - -1\nvar y = 1 / 0", true).unwrap();
        assert_eq!(
            &ops(&bytecode)[1..6],
            &["PUSH 11", "DECLARE_LOCAL x", "PUSH 1", "PUSH 0", "DIV"]
        );
    }

    #[test]
    fn reflect_inlines_exports() {
        let dir = std::env::temp_dir().join(format!("gem-reflect-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join("lib.gem"),
            "shine fn abs(x) { return x }\nshine var pi = 3\nvar hidden = 1\n",
        )
        .unwrap();
        fs::write(dir.join("loop.gem"), "reflect \"./loop\"\n").unwrap();
        let main = dir.join("main.gem");

        let program = parser::parse(Scanner::new("reflect \"./lib\" :: {pi}"), &main).unwrap();
        let bytecode = compile(&program, &main, &CompileOptions::default()).unwrap();
        assert_eq!(ops(&bytecode)[1..3], ["PUSH 3", "DECLARE_LOCAL pi"]);
        assert!(!bytecode.contains("hidden"));
        assert!(!bytecode.contains("abs"));

        let program = parser::parse(Scanner::new("reflect \"lib.gem\""), &main).unwrap();
        let bytecode = compile(&program, &main, &CompileOptions::default()).unwrap();
        assert!(bytecode.contains("DECLARE_LOCAL abs"));
        assert!(bytecode.contains("DECLARE_LOCAL pi"));

        let program = parser::parse(Scanner::new("reflect \"./loop\""), &main).unwrap();
        assert!(matches!(
            compile(&program, &main, &CompileOptions::default()),
            Err(GemError::Compile(_))
        ));
        fs::remove_dir_all(&dir).unwrap();
    }
}
