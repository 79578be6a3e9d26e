use std::io::Write;
use std::ops::Range;
use std::rc::Rc;

use log::info;
#[cfg(feature = "trace")]
use log::trace;

use crate::bytecode::{Opcode, Program, Token};
use crate::config::VmConfig;
use crate::error::GemError;
use crate::ffi::{self, CType, ForeignRegistry};

/// Allocation and teardown of scopes.
pub mod heap;
pub mod natives;
/// Scopes: operand stacks and name bindings.
pub mod scope;
/// Runtime values, table keys and callables.
pub mod value;

pub use heap::ScopeHeap;
pub use scope::{Scope, ScopeRef};
pub use value::{Closure, Key, NativeFunction, ScriptFunction, Table, Value};

macro_rules! binary_comparison {
    ($scope:ident, $op:tt) => {{
        let b = $scope.pop()?.to_float()?;
        let a = $scope.pop()?.to_float()?;
        $scope.push(Value::Bool(a $op b))?;
    }};
}

// How control leaves a block early. Loops consume Break and Continue, calls consume Return.
#[derive(Debug)]
enum Signal {
    Return(Value),
    Break,
    Continue,
}

type Flow = Result<Option<Signal>, GemError>;

// Opcodes that open a block closed by ENDIF.
const IF_OPENERS: &[Opcode] = &[Opcode::If, Opcode::Elif, Opcode::Else];

/// A Vm runs bytecode programs over a tree of scopes rooted at the globals.
pub struct Vm {
    root: ScopeRef,
    heap: ScopeHeap,
    ffi: ForeignRegistry,
    output: Box<dyn Write>,
    config: VmConfig,
    call_depth: usize,
    // Where each pending call's arguments start, innermost last.
    arg_marks: Vec<(ScopeRef, usize)>,
}

impl std::fmt::Debug for Vm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vm")
            .field("root", &self.root)
            .field("heap", &self.heap)
            .field("ffi", &self.ffi)
            .field("config", &self.config)
            .finish()
    }
}

impl Vm {
    /// A vm printing to stdout.
    pub fn new(config: VmConfig) -> Self {
        Self::with_output(config, Box::new(std::io::stdout()))
    }

    /// A vm whose natives print to `output`.
    pub fn with_output(config: VmConfig, output: Box<dyn Write>) -> Self {
        let mut heap = ScopeHeap::new(config.max_stack_size);
        let root = heap.new_root();
        natives::install(&root);
        Vm {
            root,
            heap,
            ffi: ForeignRegistry::new(),
            output,
            config,
            call_depth: 0,
            arg_marks: Vec::new(),
        }
    }

    /// The global scope.
    pub fn root(&self) -> &ScopeRef {
        &self.root
    }

    /// Where natives print.
    pub fn output(&mut self) -> &mut dyn Write {
        self.output.as_mut()
    }

    /// Run a compiled program: define everything it declares, then call its `main`.
    pub fn evaluate(&mut self, bytecode: &str) -> Result<(), GemError> {
        info!("vm started");
        self.arg_marks.clear();
        let program = Program::parse(&format!("{}\nLOAD_LOCAL main\nCALL", bytecode))?;
        let code = program.code().clone();
        let root = self.root.clone();
        let outcome = self.run(&code, 0..code.len(), &root);
        self.output.flush()?;
        match outcome? {
            Some(Signal::Break) | Some(Signal::Continue) => {
                return Err(GemError::Type("break or continue outside of a loop".into()))
            }
            Some(Signal::Return(_)) | None => {}
        }
        // main's result
        root.pop_or_null();
        info!("vm finished, {} scopes live", self.heap.live());
        Ok(())
    }

    // Run the interpreter over a range of the program until it ends, a signal leaves it,
    // or an error occurs.
    fn run(&mut self, code: &Rc<[Token]>, range: Range<usize>, scope: &ScopeRef) -> Flow {
        let mut ip = range.start;
        while ip < range.end {
            let op = match &code[ip] {
                Token::Op(op) => *op,
                Token::Operand(text) => {
                    return Err(GemError::MalformedBytecode(format!(
                        "stray operand '{}' at {}",
                        text, ip
                    )))
                }
            };
            #[cfg(feature = "trace")]
            trace!("{:04} {:<24} [ {} ]", ip, op, scope.describe_stack());
            ip += 1;
            if let Some(signal) = self.execute(op, code, &mut ip, range.end, scope)? {
                return Ok(Some(signal));
            }
        }
        Ok(None)
    }

    fn execute(
        &mut self,
        op: Opcode,
        code: &Rc<[Token]>,
        ip: &mut usize,
        end: usize,
        scope: &ScopeRef,
    ) -> Flow {
        match op {
            Opcode::Push => {
                let text = operand(code, ip, end)?;
                scope.push(literal(text)?)?;
            }
            Opcode::DeclareLocal => {
                let name = operand(code, ip, end)?;
                scope.declare(name, scope.pop()?);
            }
            Opcode::StoreLocal => {
                let name = operand(code, ip, end)?;
                if let Err(value) = scope.assign(name, scope.pop()?) {
                    if self.config.strict {
                        return Err(GemError::UndefinedVariable(name.to_string()));
                    }
                    scope.declare(name, value);
                }
            }
            Opcode::LoadLocal => {
                let name = operand(code, ip, end)?;
                let value = scope
                    .lookup(name)
                    .ok_or_else(|| GemError::UndefinedVariable(name.to_string()))?;
                scope.push(value)?;
            }
            Opcode::Delete => {
                let name = operand(code, ip, end)?;
                scope
                    .remove(name)
                    .ok_or_else(|| GemError::UndefinedVariable(name.to_string()))?;
            }
            Opcode::Define => {
                let name = operand(code, ip, end)?;
                let path = operand(code, ip, end)?;
                self.define(name, path, scope)?;
            }
            Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Div | Opcode::Pow | Opcode::Mod => {
                self.arithmetic(op, scope)?;
            }
            Opcode::Eq => {
                let b = scope.pop()?;
                let a = scope.pop()?;
                scope.push(Value::Bool(a == b))?;
            }
            Opcode::NotEq => {
                let b = scope.pop()?;
                let a = scope.pop()?;
                scope.push(Value::Bool(a != b))?;
            }
            Opcode::Greater => binary_comparison!(scope, >),
            Opcode::Less => binary_comparison!(scope, <),
            Opcode::GreaterEq => binary_comparison!(scope, >=),
            Opcode::LessEq => binary_comparison!(scope, <=),
            Opcode::And => {
                let y = scope.pop()?;
                let x = scope.pop()?;
                scope.push(if x.is_falsy() { x } else { y })?;
            }
            Opcode::Or => {
                let y = scope.pop()?;
                let x = scope.pop()?;
                scope.push(if x.is_falsy() { y } else { x })?;
            }
            Opcode::Not => {
                let value = scope.pop()?;
                scope.push(Value::Bool(value.is_falsy()))?;
            }
            Opcode::Args => self.arg_marks.push((scope.clone(), scope.depth())),
            Opcode::Call => self.call(scope)?,
            Opcode::Return => return Ok(Some(Signal::Return(scope.pop_or_null()))),
            Opcode::NewTable => scope.push(Value::Table(Table::new()))?,
            Opcode::StoreKey => {
                let key = Key::from_value(&scope.pop()?)?;
                let value = scope.pop()?;
                let mut table = expect_table(scope.pop()?)?;
                table.insert(key, value);
                scope.push(Value::Table(table))?;
            }
            Opcode::LoadKey => self.load_key(scope)?,
            Opcode::StoreNestedAssignment => {
                let depth: usize = operand(code, ip, end)?.parse().map_err(|_| {
                    GemError::MalformedBytecode("STORE_NESTED_ASSIGNMENT needs a count".into())
                })?;
                let mut table = expect_table(scope.pop()?)?;
                let mut keys = Vec::with_capacity(depth);
                for _ in 0..depth {
                    keys.push(Key::from_value(&scope.pop()?)?);
                }
                let value = scope.pop()?;
                store_path(&mut table, &keys, value)?;
                scope.push(Value::Table(table))?;
            }
            Opcode::Pop => {
                scope.pop()?;
            }
            Opcode::If => return self.branch(code, ip, end, scope),
            Opcode::Loop => return self.repeat(code, ip, end, scope),
            Opcode::Break => return Ok(Some(Signal::Break)),
            Opcode::Continue => return Ok(Some(Signal::Continue)),
            Opcode::Function => self.closure(code, ip, end, scope)?,
            Opcode::Then
            | Opcode::Elif
            | Opcode::Else
            | Opcode::EndIf
            | Opcode::EndLoop
            | Opcode::Colon
            | Opcode::Ret => {
                return Err(GemError::MalformedBytecode(format!(
                    "unexpected {} at {}",
                    op,
                    *ip - 1
                )))
            }
        }
        Ok(None)
    }

    fn arithmetic(&mut self, op: Opcode, scope: &ScopeRef) -> Result<(), GemError> {
        let b = scope.pop()?;
        let a = scope.pop()?;
        let result = match (op, a, b) {
            (Opcode::Add, Value::String(a), Value::String(b)) => {
                Value::quoted(&format!("{}{}", value::unquote(&a), value::unquote(&b)))
            }
            (op, Value::Number(a), Value::Number(b)) => Value::Number(match op {
                Opcode::Add => a + b,
                Opcode::Sub => a - b,
                Opcode::Mul => a * b,
                Opcode::Div if b == 0.0 => return Err(GemError::DivisionByZero),
                Opcode::Div => a / b,
                Opcode::Mod if b == 0.0 => return Err(GemError::ModuloByZero),
                Opcode::Mod => a % b,
                _ => a.powf(b),
            }),
            (op, a, b) => {
                return Err(GemError::Type(format!(
                    "cannot {} a {} and a {}",
                    op,
                    a.type_name(),
                    b.type_name()
                )))
            }
        };
        scope.push(result)
    }

    // IF cond THEN body ENDIF, then any ELIF cond THEN body ENDIF, then maybe ELSE body ENDIF.
    // `ip` is just past the IF. Conditions and bodies share one scope for the whole chain.
    fn branch(&mut self, code: &Rc<[Token]>, ip: &mut usize, end: usize, scope: &ScopeRef) -> Flow {
        let block = self.heap.new_child(scope);
        let mut signal = None;
        let mut taken = false;
        loop {
            let then = find_then(code, *ip, end)?;
            let endif = matching(code, then + 1, end, IF_OPENERS, Opcode::EndIf)?;
            if !taken {
                if let Some(early) = self.run(code, *ip..then, &block)? {
                    return Ok(Some(early));
                }
                if !block.pop()?.is_falsy() {
                    taken = true;
                    signal = self.run(code, then + 1..endif, &block)?;
                }
            }
            *ip = endif + 1;
            match next_op(code, *ip, end) {
                Some(Opcode::Elif) => *ip += 1,
                Some(Opcode::Else) => {
                    let endif = matching(code, *ip + 1, end, IF_OPENERS, Opcode::EndIf)?;
                    if !taken {
                        signal = self.run(code, *ip + 1..endif, &block)?;
                    }
                    *ip = endif + 1;
                    break;
                }
                _ => break,
            }
        }
        Ok(signal)
    }

    // LOOP body ENDLOOP; `ip` is just past the LOOP.
    fn repeat(&mut self, code: &Rc<[Token]>, ip: &mut usize, end: usize, scope: &ScopeRef) -> Flow {
        let close = matching(code, *ip, end, &[Opcode::Loop], Opcode::EndLoop)?;
        let body = *ip..close;
        *ip = close + 1;
        let block = self.heap.new_child(scope);
        loop {
            match self.run(code, body.clone(), &block)? {
                None | Some(Signal::Continue) => {}
                Some(Signal::Break) => return Ok(None),
                Some(signal) => return Ok(Some(signal)),
            }
        }
    }

    // `function NAME params : body RET`; `ip` is just past `function`. Pushes the closure.
    fn closure(
        &mut self,
        code: &Rc<[Token]>,
        ip: &mut usize,
        end: usize,
        scope: &ScopeRef,
    ) -> Result<(), GemError> {
        let name = operand(code, ip, end)?.to_string();
        let mut params = Vec::new();
        loop {
            match code[..end].get(*ip) {
                Some(Token::Operand(param)) => params.push(param.clone()),
                Some(Token::Op(Opcode::Colon)) => break,
                _ => {
                    return Err(GemError::MalformedBytecode(format!(
                        "bad header for function {}",
                        name
                    )))
                }
            }
            *ip += 1;
        }
        *ip += 1;
        let ret = matching(code, *ip, end, &[Opcode::Function], Opcode::Ret)?;
        let function = ScriptFunction {
            name,
            params,
            code: code.clone(),
            body: *ip..ret,
            scope: scope.clone(),
        };
        *ip = ret + 1;
        scope.push(Value::Closure(Closure::Script(Rc::new(function))))
    }

    // A CALL whose arguments were marked by ARGS gets exactly those. A bare CALL takes
    // whatever its callee wants from the stack.
    fn call(&mut self, scope: &ScopeRef) -> Result<(), GemError> {
        let callee = scope.pop()?;
        let args = self.argument_count(scope);
        match callee {
            Value::Closure(Closure::Native(native)) => match args {
                Some(count) => {
                    let frame = self.heap.new_child(scope);
                    for value in scope.take_top(count)? {
                        frame.push(value)?;
                    }
                    (native.callback)(self, &frame)?;
                    scope.push(frame.pop_or_null())
                }
                None => (native.callback)(self, scope),
            },
            Value::Closure(Closure::Script(function)) => {
                let result = self.call_script(&function, scope, args)?;
                scope.push(result)
            }
            Value::Foreign(function) => {
                let wanted = function.arg_types().len();
                if let Some(count) = args.filter(|&count| count != wanted) {
                    return Err(GemError::Ffi(format!(
                        "{} takes {} arguments, got {}",
                        function.name(),
                        wanted,
                        count
                    )));
                }
                let args = (0..wanted)
                    .map(|_| scope.pop())
                    .collect::<Result<Vec<_>, _>>()?;
                scope.push(ffi::call(&function, args)?)
            }
            other => Err(GemError::NotCallable(other.type_name())),
        }
    }

    // The number of values above the innermost ARGS mark, if that mark was made in `scope`.
    fn argument_count(&mut self, scope: &ScopeRef) -> Option<usize> {
        match self.arg_marks.last() {
            Some((marked, depth)) if Rc::ptr_eq(marked, scope) && *depth <= scope.depth() => {
                let count = scope.depth() - *depth;
                self.arg_marks.pop();
                Some(count)
            }
            _ => None,
        }
    }

    /// Call a script function with arguments taken from the top of `caller`'s stack,
    /// first argument on top. With `args` known, exactly that many values are taken:
    /// missing parameters are `null` and extra arguments are dropped. Without it, up to
    /// one value per parameter is taken from whatever the caller has pending.
    // Taking the arguments straight from the caller is what threading them through the
    // declaring scope's stack amounts to, minus the copies.
    pub fn call_script(
        &mut self,
        function: &ScriptFunction,
        caller: &ScopeRef,
        args: Option<usize>,
    ) -> Result<Value, GemError> {
        if self.call_depth >= self.config.max_call_depth {
            return Err(GemError::StackOverflow);
        }
        let frame = self.heap.new_child(&function.scope);
        let passed = args.unwrap_or_else(|| caller.depth());
        let provided = function.params.len().min(passed);
        for (i, param) in function.params.iter().enumerate() {
            let value = if i < provided {
                caller.pop()?
            } else {
                Value::null()
            };
            frame.declare(param, value);
        }
        if let Some(count) = args {
            caller.take_top(count - provided)?;
        }
        self.call_depth += 1;
        let outcome = self.run(&function.code, function.body.clone(), &frame);
        self.call_depth -= 1;
        match outcome? {
            Some(Signal::Return(value)) => Ok(value),
            None => Ok(frame.pop_or_null()),
            Some(_) => Err(GemError::Type(format!(
                "break or continue outside of a loop in function {}",
                function.name
            ))),
        }
    }

    // Own entries first. Strings and tables fall back to the global table named after their
    // type; the receiver goes back on the stack under the method so it becomes the first argument.
    fn load_key(&mut self, scope: &ScopeRef) -> Result<(), GemError> {
        let key_value = scope.pop()?;
        let object = scope.pop()?;
        let key = Key::from_value(&key_value)?;
        if object.is_null() {
            return Err(GemError::Type(format!("cannot index null with {}", key)));
        }
        if let Value::Table(table) = &object {
            if let Some(value) = table.get(&key) {
                return scope.push(value.clone());
            }
        }
        if let (Value::String(_), Key::Int(idx)) = (&object, &key) {
            let text = object.as_text().unwrap_or_default();
            let found = usize::try_from(*idx)
                .ok()
                .and_then(|i| text.chars().nth(i))
                .map(|c| Value::quoted(&c.to_string()));
            return scope.push(found.unwrap_or_else(Value::null));
        }
        let type_name = match &object {
            Value::Table(_) => "table",
            Value::String(_) => "string",
            other => {
                return Err(GemError::Type(format!(
                    "cannot index a {} with {}",
                    other.type_name(),
                    key
                )))
            }
        };
        let method = match self.root.lookup(type_name) {
            Some(Value::Table(methods)) => methods.get(&key).cloned(),
            _ => None,
        };
        match method {
            Some(method) => {
                scope.push(object)?;
                scope.push(method)
            }
            None => scope.push(Value::null()),
        }
    }

    fn define(&mut self, name: &str, path: &str, scope: &ScopeRef) -> Result<(), GemError> {
        let count = scope.pop()?.to_float()?;
        let return_type = type_word(&scope.pop()?)?;
        let mut arg_types = Vec::new();
        for _ in 0..(count.max(0.0) as usize) {
            arg_types.push(type_word(&scope.pop()?)?);
        }
        let path = if path.starts_with('"') {
            value::unquote(&decode_escapes(path)).to_string()
        } else {
            path.to_string()
        };
        let function = self.ffi.define(name, &path, arg_types, return_type)?;
        scope.declare(name, Value::Foreign(Rc::new(function)));
        Ok(())
    }
}

fn type_word(value: &Value) -> Result<CType, GemError> {
    match value {
        Value::String(word) => value::unquote(word).parse(),
        other => Err(GemError::Ffi(format!(
            "expected a type name, got a {}",
            other.type_name()
        ))),
    }
}

fn expect_table(value: Value) -> Result<Table, GemError> {
    match value {
        Value::Table(table) => Ok(table),
        other => Err(GemError::Type(format!(
            "expected a table, got a {}",
            other.type_name()
        ))),
    }
}

// Stores `value` at the end of a key path, making empty tables for missing steps.
fn store_path(table: &mut Table, keys: &[Key], value: Value) -> Result<(), GemError> {
    match keys {
        [] => Err(GemError::MalformedBytecode("empty assignment path".into())),
        [last] => {
            table.insert(last.clone(), value);
            Ok(())
        }
        [first, rest @ ..] => {
            if table.get(first).is_none() {
                table.insert(first.clone(), Value::Table(Table::new()));
            }
            match table.get_mut(first) {
                Some(Value::Table(inner)) => store_path(inner, rest, value),
                Some(other) => Err(GemError::Type(format!(
                    "cannot assign into a {} at key {}",
                    other.type_name(),
                    first
                ))),
                None => Err(GemError::Type(format!("missing key {}", first))),
            }
        }
    }
}

// Reads the operand at `ip`, which must be inside the block being run.
fn operand<'c>(code: &'c [Token], ip: &mut usize, end: usize) -> Result<&'c str, GemError> {
    match code[..end].get(*ip) {
        Some(Token::Operand(text)) => {
            *ip += 1;
            Ok(text)
        }
        _ => Err(GemError::MalformedBytecode(format!(
            "missing operand at {}",
            ip
        ))),
    }
}

fn next_op(code: &[Token], ip: usize, end: usize) -> Option<Opcode> {
    match code[..end].get(ip) {
        Some(Token::Op(op)) => Some(*op),
        _ => None,
    }
}

// Index of the THEN ending a condition that starts at `from`. Conditions can hold function
// literals with their own if-blocks, so nesting is counted.
fn find_then(code: &[Token], from: usize, end: usize) -> Result<usize, GemError> {
    let mut depth = 0usize;
    for (i, token) in code[..end].iter().enumerate().skip(from) {
        match token {
            Token::Op(Opcode::Then) if depth == 0 => return Ok(i),
            Token::Op(op) if IF_OPENERS.contains(op) => depth += 1,
            Token::Op(Opcode::EndIf) => depth = depth.saturating_sub(1),
            _ => {}
        }
    }
    Err(GemError::MalformedBytecode(format!(
        "no THEN after condition at {}",
        from
    )))
}

// Index of the `close` token ending a block whose body starts at `from`, counting nested `opens`.
fn matching(
    code: &[Token],
    from: usize,
    end: usize,
    opens: &[Opcode],
    close: Opcode,
) -> Result<usize, GemError> {
    let mut depth = 1usize;
    for (i, token) in code[..end].iter().enumerate().skip(from) {
        if let Token::Op(op) = token {
            if opens.contains(op) {
                depth += 1;
            } else if *op == close {
                depth -= 1;
                if depth == 0 {
                    return Ok(i);
                }
            }
        }
    }
    Err(GemError::MalformedBytecode(format!(
        "no {} closing the block at {}",
        close, from
    )))
}

// PUSH operands: quoted strings keep their quotes with escapes decoded,
// numbers become numbers, anything else is a bare word.
fn literal(text: &str) -> Result<Value, GemError> {
    if text.starts_with('"') {
        return Ok(Value::String(decode_escapes(text)));
    }
    let numeric = match text.as_bytes() {
        [b'0'..=b'9', ..] => true,
        [b'-' | b'.', b'0'..=b'9', ..] => true,
        [b'-', b'.', b'0'..=b'9', ..] => true,
        _ => false,
    };
    if numeric {
        text.parse()
            .map(Value::Number)
            .map_err(|_| GemError::MalformedBytecode(format!("bad number '{}'", text)))
    } else {
        Ok(Value::String(text.to_string()))
    }
}

fn decode_escapes(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('0') => out.push('\0'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testing::{run, Capture};

    fn eval(bytecode: &str) -> Result<String, GemError> {
        let capture = Capture::default();
        let mut vm = Vm::with_output(VmConfig::default(), Box::new(capture.clone()));
        vm.evaluate(bytecode)?;
        Ok(capture.contents())
    }

    fn main_of(body: &str) -> String {
        format!("function main :\n{}\nRET\nDECLARE_LOCAL main", body)
    }

    #[test]
    fn arithmetic_and_output() {
        let out = eval(&main_of(
            "PUSH 7 PUSH 2 SUB PUSH 3 MUL PUSH 4 DIV PUSH 2 POW \
             LOAD_LOCAL console PUSH \"out\" LOAD_KEY CALL POP",
        ))
        .unwrap();
        assert_eq!(out, "14.0625\n");
    }

    #[test]
    fn mod_is_fmod() {
        assert_eq!(run("console.out(7.5 % 2, ' ', -7 % 3)"), "1.5 -1\n");
    }

    #[test]
    fn division_by_zero_is_an_error() {
        assert!(matches!(
            eval(&main_of("PUSH 1 PUSH 0 DIV POP")),
            Err(GemError::DivisionByZero)
        ));
        assert!(matches!(
            eval(&main_of("PUSH 1 PUSH 0 MOD POP")),
            Err(GemError::ModuloByZero)
        ));
    }

    #[test]
    fn type_errors() {
        assert!(matches!(
            eval(&main_of("PUSH \"a\" PUSH 1 ADD POP")),
            Err(GemError::Type(_))
        ));
        assert!(matches!(
            eval(&main_of("PUSH 1 CALL")),
            Err(GemError::NotCallable("number"))
        ));
        assert!(matches!(
            eval(&main_of("LOAD_LOCAL nope")),
            Err(GemError::UndefinedVariable(_))
        ));
    }

    #[test]
    fn logic_returns_operands() {
        assert_eq!(
            run("console.out(null && 1, ' ', 0 && 2, ' ', false || 'x', ' ', 3 || 4)"),
            "null 2 x 3\n"
        );
    }

    #[test]
    fn nested_blocks_match_by_depth() {
        let source = r#"
var hits = 0
for (i) in (0, 3) {
  if i == 1 {
    var j = 0
    while j < 2 {
      if j == 0 { hits += 10 } else { hits += 100 }
      j += 1
    }
  } elif i == 2 {
    hits += 1000
  } else {
    hits += 1
  }
}
console.out(hits)
"#;
        assert_eq!(run(source), "1111\n");
    }

    #[test]
    fn keyword_named_operands_do_not_confuse_blocks() {
        let out = eval(&main_of(
            "PUSH 5 DECLARE_LOCAL ENDIF LOOP IF LOAD_LOCAL ENDIF PUSH 5 EQ THEN BREAK ENDIF ENDLOOP \
             LOAD_LOCAL ENDIF LOAD_LOCAL console PUSH \"out\" LOAD_KEY CALL POP",
        ))
        .unwrap();
        assert_eq!(out, "5\n");
    }

    #[test]
    fn strict_mode_rejects_undeclared_assignment() {
        let bytecode = main_of("PUSH 1 STORE_LOCAL fresh");
        assert_eq!(eval(&bytecode).unwrap(), "");
        let mut vm = Vm::with_output(VmConfig::new(true), Box::new(Capture::default()));
        assert!(matches!(
            vm.evaluate(&bytecode),
            Err(GemError::UndefinedVariable(name)) if name == "fresh"
        ));
    }

    #[test]
    fn store_nested_assignment() {
        let source = r#"
var t = {a: {b: 1}}
t.a.b = 2
t.a.c = 3
t.x.y = 4
console.out(t.a.b, t.a.c, t.x.y)
"#;
        assert_eq!(run(source), "234\n");
    }

    #[test]
    fn store_through_non_table_fails() {
        let mut vm = Vm::with_output(VmConfig::default(), Box::new(Capture::default()));
        let bytecode = crate::compile_source(
            "var t = {a: 1}\nt.a.b = 2",
            std::path::Path::new("t.gem"),
            &Default::default(),
        )
        .unwrap();
        assert!(matches!(vm.evaluate(&bytecode), Err(GemError::Type(_))));
    }

    #[test]
    fn closures_capture_declaring_scope() {
        let source = r#"
fn counter() {
  var n = 0
  return fn() {
    n += 1
    return n
  }
}
var c = counter()
c()
c()
console.out(c())
"#;
        assert_eq!(run(source), "3\n");
    }

    #[test]
    fn recursion_and_missing_arguments() {
        let source = r#"
fn fib(n) {
  if n < 2 { return n }
  return fib(n - 1) + fib(n - 2)
}
fn second(a, b) { return b }
console.out(fib(15), ' ', second(1))
"#;
        assert_eq!(run(source), "610 null\n");
    }

    #[test]
    fn calls_take_only_their_own_arguments() {
        let source = r#"
fn f(a) {
  if a == null { return 1 }
  return a
}
fn g(a) { return a }
console.out(10 + f(), ' ', 1 + g(2, 3))
"#;
        assert_eq!(run(source), "11 3\n");
    }

    #[test]
    fn bare_call_fills_parameters_from_pending_values() {
        // One value is meant for `a`; `b` picks up the 10 pending beneath it.
        let out = eval(&main_of(
            "PUSH 10 PUSH 5 \
             function pair a b : LOAD_LOCAL a LOAD_LOCAL b SUB RET \
             CALL LOAD_LOCAL console PUSH \"out\" LOAD_KEY CALL POP",
        ))
        .unwrap();
        assert_eq!(out, "-5\n");
    }

    #[test]
    fn argument_marks_belong_to_their_scope() {
        let mut vm = Vm::with_output(VmConfig::default(), Box::new(Capture::default()));
        let root = vm.root().clone();
        let inner = vm.heap.new_child(&root);
        vm.arg_marks.push((root.clone(), 0));
        root.push(Value::Number(1.0)).unwrap();
        assert_eq!(vm.argument_count(&inner), None);
        assert_eq!(vm.arg_marks.len(), 1);
        assert_eq!(vm.argument_count(&root), Some(1));
        assert!(vm.arg_marks.is_empty());
        assert_eq!(vm.argument_count(&root), None);
    }

    #[test]
    fn runaway_recursion_overflows() {
        let bytecode = crate::compile_source(
            "fn f(n) { return f(n + 1) }\nf(0)",
            std::path::Path::new("t.gem"),
            &Default::default(),
        )
        .unwrap();
        let config = VmConfig {
            max_call_depth: 32,
            ..VmConfig::default()
        };
        let mut vm = Vm::with_output(config, Box::new(Capture::default()));
        assert!(matches!(vm.evaluate(&bytecode), Err(GemError::StackOverflow)));
    }

    #[test]
    fn string_indexing_and_methods() {
        assert_eq!(
            run("var s = 'hey'\nconsole.out(s[1], s.length(), s.upper(), s[9])"),
            "e3HEYnull\n"
        );
    }

    #[test]
    fn missing_keys_load_null() {
        assert_eq!(run("var t = {}\nconsole.out(typeof(t.nothing))"), "null\n");
    }

    #[test]
    fn literals() {
        assert_eq!(literal("-2.5").unwrap(), Value::Number(-2.5));
        assert_eq!(literal(".5").unwrap(), Value::Number(0.5));
        assert_eq!(literal("\"a\\\"b\"").unwrap(), Value::String("\"a\"b\"".into()));
        assert_eq!(literal("double").unwrap(), Value::String("double".into()));
        assert!(literal("1x").is_err());
    }
}
