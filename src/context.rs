//! The [`Context`]: one compiler/VM pair's worth of process-wide state.
//!
//! A context owns the default package (symbols, globals, macro table), the
//! code registry, and the primitive registry. Compilation and execution
//! both run against a context by reference; every execution constructs a
//! fresh VM state, which is what lets the compiler re-enter the VM for
//! macro expansion at any point.
//!
//! All of this state is created at construction and destroyed with the
//! context. It is shared and mutable with no internal locking; embedders
//! that share a context across threads must serialize access themselves.

use crate::builtins::{Arity, PrimitiveFn, PrimitiveRegistry};
use crate::compiler::Compiler;
use crate::macros;
use crate::reader;
use crate::symbol::Package;
use crate::value::{Closure, Value};
use crate::vm::{CodeBlock, CodeRegistry, Instruction, Opcode, RuntimeError, Vm};
use crate::Error;
use std::rc::Rc;

/// Composition of packages, code registry, primitive registry, VM, and
/// compiler. Constructing one yields a usable system.
pub struct Context {
    package: Package,
    code: CodeRegistry,
    primitives: PrimitiveRegistry,
}

impl Context {
    pub fn new() -> Self {
        let ctx = Context {
            package: Package::new("user"),
            code: CodeRegistry::new(),
            primitives: PrimitiveRegistry::with_defaults(),
        };
        ctx.install_primitive_globals();
        ctx
    }

    /// The default package expressions are read and compiled against.
    pub fn package(&self) -> &Package {
        &self.package
    }

    pub fn code_registry(&self) -> &CodeRegistry {
        &self.code
    }

    pub fn primitives(&self) -> &PrimitiveRegistry {
        &self.primitives
    }

    /// Compile a single expression into an executable closure.
    pub fn compile(&self, expr: &Value) -> Result<Rc<Closure>, Error> {
        Ok(Compiler::new(self).compile(expr)?)
    }

    /// Run a compiled closure to termination and return the result.
    pub fn execute(&self, closure: &Rc<Closure>, args: &[Value]) -> Result<Value, RuntimeError> {
        Vm::new(self, closure.clone(), args)?.run()
    }

    /// Compile and immediately execute an expression.
    pub fn eval(&self, expr: &Value) -> Result<Value, Error> {
        let closure = self.compile(expr)?;
        Ok(self.execute(&closure, &[])?)
    }

    /// Parse, compile, and execute a sequence of expressions from source
    /// text, returning the value of the last one.
    pub fn eval_source(&self, source: &str) -> Result<Value, Error> {
        let exprs = reader::parse_all(source, &self.package)?;
        let mut result = Value::Nil;
        for expr in &exprs {
            result = self.eval(expr)?;
        }
        Ok(result)
    }

    /// Expand `form` one macro level; pure, returns the input unchanged
    /// when its head is not a macro.
    pub fn macro_expand_1_step(&self, form: &Value) -> Result<Value, Error> {
        Ok(macros::expand_1_step(self, form)?)
    }

    /// Fully macro-expand `form`, destructively rewriting child forms.
    pub fn macro_expand_full(&self, form: &Value) -> Result<Value, Error> {
        Ok(macros::expand_full(self, form)?)
    }

    /// Register a primitive and bind it as a global, making it callable
    /// both through `Prim`-emitting extension paths and as an ordinary
    /// function value.
    pub fn register_primitive(&mut self, name: &str, arity: Arity, func: PrimitiveFn) {
        self.primitives.register(name, arity, func);
        self.install_primitive_global(name);
    }

    /// Bind every registered primitive as a global wrapper closure.
    fn install_primitive_globals(&self) {
        for name in self.primitives.names() {
            self.install_primitive_global(name);
        }
    }

    /// Primitives reach compiled code as closures whose body is
    /// `Prim name; Return`, so the standard calling convention applies:
    /// `CallClosure` has already staged the arguments and the argument
    /// count when the wrapper starts.
    fn install_primitive_global(&self, name: &str) {
        let handle = self.code.register(CodeBlock {
            name: Some(name.to_owned()),
            instructions: vec![
                Instruction::unary(Opcode::Prim, Value::Str(name.to_owned())),
                Instruction::nullary(Opcode::Return),
            ],
        });
        let closure = Rc::new(Closure {
            code: handle,
            env: None,
            params: Value::Nil,
            name: Some(name.to_owned()),
        });
        let sym = self.package.intern(name);
        self.package.set_value(&sym, Value::Closure(closure));
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}
