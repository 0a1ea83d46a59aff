//! Compile-time macros: installed on packages by `defmacro`, invoked by
//! the compiler through a nested VM run on the macro's compiled body.
//!
//! One-step expansion is pure: it either returns the expansion or the
//! input unchanged. Full expansion is destructive: it rewrites the `first`
//! fields of child cons cells in place to install expanded sub-forms, so
//! the input must be treated as consumed. The top-level result of a
//! one-step expansion is deliberately not re-expanded; only child forms
//! are walked.

use crate::context::Context;
use crate::symbol::Symbol;
use crate::value::{Closure, Value};
use crate::vm::RuntimeError;
use smallvec::SmallVec;
use std::rc::Rc;

// Global debug flag - set via environment variable MACRO_DEBUG=1
static DEBUG: std::sync::LazyLock<bool> =
    std::sync::LazyLock::new(|| std::env::var("MACRO_DEBUG").is_ok());

macro_rules! debug_trace {
    ($($arg:tt)*) => {
        if *DEBUG {
            eprintln!("[MACRO DEBUG] {}", format!($($arg)*));
        }
    };
}

/// A macro: its name, the formal argument list it was defined with, and
/// the compiled closure that produces the expansion. Stored in the name
/// symbol's home package.
#[derive(Clone)]
pub struct Macro {
    pub name: Symbol,
    pub params: Value,
    pub expander: Rc<Closure>,
}

/// The macro applied by `form`, when its head is a symbol with a macro
/// binding in its home package.
pub fn macro_of(form: &Value) -> Option<Macro> {
    let cell = form.as_cons()?;
    let head = cell.first();
    let sym = head.as_symbol()?.clone();
    let package = sym.package()?;
    package.get_macro(&sym)
}

/// Expand `form` one level: run the macro's body on the un-evaluated
/// argument forms. Returns the input unchanged when the head is not a
/// known macro.
pub fn expand_1_step(ctx: &Context, form: &Value) -> Result<Value, RuntimeError> {
    match macro_of(form) {
        Some(mac) => {
            debug_trace!("expanding ({} ...)", mac.name.name());
            let args: SmallVec<[Value; 4]> = form.rest().elements().into();
            let expansion = ctx.execute(&mac.expander, &args)?;
            debug_trace!("  => {expansion}");
            Ok(expansion)
        }
        None => Ok(form.clone()),
    }
}

/// Fully expand `form`: expand the head one level, then, when the result
/// is a cons whose head is a symbol, recursively expand every child cons
/// element, destructively replacing each cell's `first`. The expansion
/// itself is not expanded again.
pub fn expand_full(ctx: &Context, form: &Value) -> Result<Value, RuntimeError> {
    let expanded = expand_1_step(ctx, form)?;
    if let Value::Cons(head_cell) = &expanded {
        if head_cell.first().is_symbol() {
            let mut cursor = expanded.clone();
            while let Value::Cons(cell) = cursor {
                let child = cell.first();
                if child.is_cons() {
                    cell.set_first(expand_full(ctx, &child)?);
                }
                cursor = cell.rest();
            }
        }
    }
    Ok(expanded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::list_from_vec;

    #[test]
    fn test_one_step_is_identity_without_a_macro_binding() {
        let ctx = Context::new();
        let pkg = ctx.package().clone();
        let form = list_from_vec(vec![
            Value::Symbol(pkg.intern("frobnicate")),
            Value::Int(1),
        ]);
        let expanded = expand_1_step(&ctx, &form).unwrap();
        // Same cons identity: nothing was rebuilt.
        assert_eq!(expanded, form);
    }

    #[test]
    fn test_one_step_on_atoms() {
        let ctx = Context::new();
        assert_eq!(expand_1_step(&ctx, &Value::Int(3)).unwrap(), Value::Int(3));
        assert_eq!(expand_1_step(&ctx, &Value::Nil).unwrap(), Value::Nil);
    }

    #[test]
    fn test_full_expansion_rewrites_children_in_place() {
        let ctx = Context::new();
        ctx.eval_source("(defmacro twice (e) (list 'begin e e))")
            .unwrap();
        let pkg = ctx.package().clone();

        // (begin (twice 5)) - the child form gets rewritten in place.
        let child = list_from_vec(vec![Value::Symbol(pkg.intern("twice")), Value::Int(5)]);
        let form = list_from_vec(vec![Value::Symbol(pkg.intern("begin")), child]);
        let expanded = expand_full(&ctx, &form).unwrap();

        assert_eq!(expanded, form);
        assert_eq!(format!("{expanded}"), "(begin (begin 5 5))");
    }

    #[test]
    fn test_expansion_runs_the_macro_body_on_unevaluated_forms() {
        let ctx = Context::new();
        ctx.eval_source("(defmacro swap-args (a b) (list 'list b a))")
            .unwrap();
        let expr = crate::reader::parse("(swap-args x y)", ctx.package()).unwrap();
        let expanded = expand_1_step(&ctx, &expr).unwrap();
        // x and y were passed through as symbols, never evaluated.
        assert_eq!(format!("{expanded}"), "(list y x)");
    }
}
