// The heap hands out every scope the vm creates and keeps a weak handle to each.
//
// Scopes are shared through `Rc`, and a closure keeps its declaring scope alive. A closure stored
// in the scope it was declared in (every named function is) forms a cycle that reference counting
// alone never frees. The heap does not need to find those cycles while the program runs: when it is
// dropped, it empties every scope that is still alive, which drops the closures and lets the
// counts fall to zero.
//
// Handles to scopes that already died are pruned from time to time so the list stays proportional
// to the live scopes.

use std::rc::{Rc, Weak};

use log::debug;

use super::scope::{Scope, ScopeRef};

const FIRST_SWEEP: usize = 1024;

#[derive(Debug)]
/// A type for allocating and tracking scopes
pub struct ScopeHeap {
    scopes: Vec<Weak<Scope>>,
    next_sweep: usize,
    max_stack: usize,
}

impl ScopeHeap {
    /// A new, empty heap whose scopes each get a stack of `max_stack` values.
    pub fn new(max_stack: usize) -> ScopeHeap {
        ScopeHeap {
            scopes: Vec::new(),
            next_sweep: FIRST_SWEEP,
            max_stack,
        }
    }

    /// Allocate a scope with no parent.
    pub fn new_root(&mut self) -> ScopeRef {
        self.track(Rc::new(Scope::new(None, self.max_stack)))
    }

    /// Allocate a scope under `parent`.
    pub fn new_child(&mut self, parent: &ScopeRef) -> ScopeRef {
        self.track(Rc::new(Scope::new(Some(parent.clone()), self.max_stack)))
    }

    fn track(&mut self, scope: ScopeRef) -> ScopeRef {
        if self.scopes.len() >= self.next_sweep {
            self.sweep();
        }
        self.scopes.push(Rc::downgrade(&scope));
        scope
    }

    /// Forget handles to scopes nobody holds any more. Returns how many were forgotten.
    pub fn sweep(&mut self) -> usize {
        let before = self.scopes.len();
        self.scopes.retain(|weak| weak.strong_count() > 0);
        let freed = before - self.scopes.len();
        self.next_sweep = FIRST_SWEEP.max(self.scopes.len() * 2);
        debug!(
            "scope sweep: {} freed, {} live, next sweep at {}",
            freed,
            self.scopes.len(),
            self.next_sweep
        );
        freed
    }

    /// How many tracked scopes are still alive.
    pub fn live(&self) -> usize {
        self.scopes.iter().filter(|w| w.strong_count() > 0).count()
    }
}

impl Drop for ScopeHeap {
    fn drop(&mut self) {
        for weak in &self.scopes {
            if let Some(scope) = weak.upgrade() {
                scope.clear();
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::bytecode::Token;
    use crate::vm::value::{Closure, ScriptFunction, Value};

    #[test]
    fn sweep_forgets_dead_scopes() {
        let mut heap = ScopeHeap::new(16);
        let root = heap.new_root();
        {
            let _child = heap.new_child(&root);
            let _other = heap.new_child(&root);
            assert_eq!(heap.live(), 3);
        }
        assert_eq!(heap.live(), 1);
        assert_eq!(heap.sweep(), 2);
    }

    #[test]
    fn drop_breaks_closure_cycles() {
        let mut heap = ScopeHeap::new(16);
        let root = heap.new_root();
        let scope = heap.new_child(&root);
        let code: Rc<[Token]> = Vec::new().into();
        let function = ScriptFunction {
            name: "f".into(),
            params: Vec::new(),
            code,
            body: 0..0,
            scope: scope.clone(),
        };
        scope.declare("f", Value::Closure(Closure::Script(Rc::new(function))));
        let weak = Rc::downgrade(&scope);
        drop(scope);
        // The closure bound inside keeps the scope alive.
        assert!(weak.upgrade().is_some());
        drop(heap);
        assert!(weak.upgrade().is_none());
    }
}
