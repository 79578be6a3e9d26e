use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt::Debug;
use std::rc::Rc;

use super::value::Value;
use crate::error::GemError;

/// Scopes are shared: by their children, by the closures declared in them, and by the heap.
pub type ScopeRef = Rc<Scope>;

/// A lexical environment: an operand stack, the names declared here, and the enclosing scope.
/// Interior mutability lets closures and the vm hold the same scope at once.
pub struct Scope {
    stack: RefCell<Vec<Value>>,
    bindings: RefCell<HashMap<String, Value>>,
    parent: Option<ScopeRef>,
    max_stack: usize,
}

impl Scope {
    /// An empty scope under `parent`, whose stack holds at most `max_stack` values.
    pub fn new(parent: Option<ScopeRef>, max_stack: usize) -> Scope {
        Scope {
            stack: RefCell::new(Vec::new()),
            bindings: RefCell::new(HashMap::new()),
            parent,
            max_stack,
        }
    }

    #[allow(missing_docs)]
    pub fn parent(&self) -> Option<&ScopeRef> {
        self.parent.as_ref()
    }

    #[allow(missing_docs)]
    pub fn push(&self, value: Value) -> Result<(), GemError> {
        let mut stack = self.stack.borrow_mut();
        if stack.len() >= self.max_stack {
            Err(GemError::StackOverflow)
        } else {
            stack.push(value);
            Ok(())
        }
    }

    #[allow(missing_docs)]
    pub fn pop(&self) -> Result<Value, GemError> {
        self.stack.borrow_mut().pop().ok_or(GemError::StackUnderflow)
    }

    /// Pops the top value, or gives `null` when the stack is empty.
    pub fn pop_or_null(&self) -> Value {
        self.stack.borrow_mut().pop().unwrap_or_else(Value::null)
    }

    /// Number of values on the stack.
    pub fn depth(&self) -> usize {
        self.stack.borrow().len()
    }

    /// Removes the top `count` values, bottom one first.
    pub fn take_top(&self, count: usize) -> Result<Vec<Value>, GemError> {
        let mut stack = self.stack.borrow_mut();
        let split = stack
            .len()
            .checked_sub(count)
            .ok_or(GemError::StackUnderflow)?;
        Ok(stack.split_off(split))
    }

    /// Empties the stack, top value first.
    pub fn drain(&self) -> Vec<Value> {
        let mut stack = self.stack.borrow_mut();
        stack.drain(..).rev().collect()
    }

    /// Binds `name` in this scope, shadowing any outer binding.
    pub fn declare(&self, name: &str, value: Value) {
        self.bindings.borrow_mut().insert(name.to_string(), value);
    }

    /// A copy of the value bound to `name` here or in the nearest enclosing scope.
    pub fn lookup(&self, name: &str) -> Option<Value> {
        if let Some(value) = self.bindings.borrow().get(name) {
            return Some(value.clone());
        }
        self.parent.as_ref()?.lookup(name)
    }

    /// Overwrites the nearest binding of `name`. Gives the value back when no scope binds it.
    pub fn assign(&self, name: &str, value: Value) -> Result<(), Value> {
        if let Some(slot) = self.bindings.borrow_mut().get_mut(name) {
            *slot = value;
            return Ok(());
        }
        match &self.parent {
            Some(parent) => parent.assign(name, value),
            None => Err(value),
        }
    }

    /// Removes the nearest binding of `name`.
    pub fn remove(&self, name: &str) -> Option<Value> {
        if let Some(value) = self.bindings.borrow_mut().remove(name) {
            return Some(value);
        }
        self.parent.as_ref()?.remove(name)
    }

    /// Drops every binding and stacked value, breaking reference cycles through closures.
    pub(crate) fn clear(&self) {
        let bindings = std::mem::take(&mut *self.bindings.borrow_mut());
        let stack = std::mem::take(&mut *self.stack.borrow_mut());
        drop(bindings);
        drop(stack);
    }

    /// The stack bottom to top, for tracing.
    #[cfg(feature = "trace")]
    pub(crate) fn describe_stack(&self) -> String {
        let stack = self.stack.borrow();
        let parts: Vec<String> = stack.iter().map(|v| v.to_string()).collect();
        parts.join(" ")
    }
}

// Bindings can hold closures that point back at this scope, so only names are shown.
impl Debug for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<String> = self.bindings.borrow().keys().cloned().collect();
        names.sort();
        f.debug_struct("Scope")
            .field("bindings", &names)
            .field("depth", &self.depth())
            .field("has_parent", &self.parent.is_some())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn declare_shadows_and_assign_walks_up() {
        let root = Rc::new(Scope::new(None, 8));
        let child = Rc::new(Scope::new(Some(root.clone()), 8));
        root.declare("x", Value::Number(1.0));
        assert!(child.assign("x", Value::Number(2.0)).is_ok());
        assert_eq!(root.lookup("x"), Some(Value::Number(2.0)));

        child.declare("x", Value::Number(3.0));
        assert_eq!(child.lookup("x"), Some(Value::Number(3.0)));
        assert_eq!(root.lookup("x"), Some(Value::Number(2.0)));

        assert_eq!(child.assign("y", Value::Bool(true)), Err(Value::Bool(true)));
        assert_eq!(child.remove("x"), Some(Value::Number(3.0)));
        assert_eq!(child.remove("x"), Some(Value::Number(2.0)));
        assert_eq!(child.lookup("x"), None);
    }

    #[test]
    fn take_top_keeps_order() {
        let scope = Scope::new(None, 8);
        for n in 1..=4 {
            scope.push(Value::Number(n as f64)).unwrap();
        }
        assert_eq!(
            scope.take_top(2).unwrap(),
            vec![Value::Number(3.0), Value::Number(4.0)]
        );
        assert_eq!(scope.depth(), 2);
        assert!(scope.take_top(0).unwrap().is_empty());
    }

    #[test]
    fn stack_limits() {
        let scope = Scope::new(None, 2);
        scope.push(Value::Number(1.0)).unwrap();
        scope.push(Value::Number(2.0)).unwrap();
        assert!(matches!(
            scope.push(Value::Number(3.0)),
            Err(GemError::StackOverflow)
        ));
        assert!(matches!(scope.take_top(3), Err(GemError::StackUnderflow)));
        assert_eq!(scope.drain(), vec![Value::Number(2.0), Value::Number(1.0)]);
        assert!(matches!(scope.pop(), Err(GemError::StackUnderflow)));
        assert!(scope.pop_or_null().is_null());
    }
}
