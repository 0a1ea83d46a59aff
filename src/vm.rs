//! The stack-based virtual machine: instruction set, code registry, and
//! the fetch-decode-execute loop.
//!
//! The VM is single-threaded and cooperative. One logical program counter,
//! no preemption; all suspension is explicit through the call protocol
//! (`SaveReturn` / `CallClosure` / `Return`) or loop termination. The
//! compiler re-enters the VM at compile time to expand macros, which works
//! because every execution gets its own fresh [`Vm`] state over the shared
//! context.
//!
//! Dispatch is a dense match on a single opcode enum. Set `VM_DEBUG=1` to
//! trace each instruction as it executes.

use crate::context::Context;
use crate::env::{Frame, VarPos};
use crate::value::{self, Closure, ReturnAddr, Value};
use smallvec::SmallVec;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

// Global debug flag - set via environment variable VM_DEBUG=1
static DEBUG: std::sync::LazyLock<bool> =
    std::sync::LazyLock::new(|| std::env::var("VM_DEBUG").is_ok());

macro_rules! debug_trace {
    ($($arg:tt)*) => {
        if *DEBUG {
            eprintln!("[VM DEBUG] {}", format!($($arg)*));
        }
    };
}

/// A runtime fault raised while the VM executes: runaway program counter,
/// stack underflow, arity mismatch, call to a non-closure, unknown
/// primitive. Aborts the current VM invocation; never retried in core.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeError {
    pub message: String,
}

impl RuntimeError {
    pub fn new(message: impl Into<String>) -> Self {
        RuntimeError {
            message: message.into(),
        }
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Runtime error: {}", self.message)
    }
}

impl std::error::Error for RuntimeError {}

/// Bytecode operations.
///
/// Operands live in the instruction's `first`/`second` value slots, not in
/// the opcode itself, so that labels can be rewritten in place during
/// assembly and so that instructions can be compared opcode-wise by the
/// compiler's branch-merging peephole.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    /// No-op position marker. Emitted by the compiler as a jump target and
    /// deliberately kept through assembly so resolved indices stay valid.
    Label,

    /// Push the constant in `first`
    Const,

    /// Push the environment value at (frame=`first`, slot=`second`)
    LocalGet,

    /// Write top-of-stack (peek, no pop) to (frame=`first`, slot=`second`)
    LocalSet,

    /// Push the global value of the symbol in `first`
    GlobalGet,

    /// Write top-of-stack (peek, no pop) to the global of the symbol in `first`
    GlobalSet,

    /// Discard the top of the stack
    Pop,

    /// Pop; jump to the resolved index in `second` when the value is true
    JumpIfTrue,

    /// Pop; jump to the resolved index in `second` when the value is false
    JumpIfFalse,

    /// Unconditional jump to the resolved index in `second`
    Jump,

    /// Function prologue for a fixed parameter list: require exactly
    /// `first` arguments and pop them into a fresh environment frame
    MakeEnv,

    /// Function prologue for a dotted parameter list: require at least
    /// `first` arguments, collect the excess into a list in the rest slot
    MakeEnvDot,

    /// Push a copy of the top of the stack
    Dup,

    /// Discard the caller's environment frame, pop the callee, and jump
    /// into it with `first` arguments on the stack
    CallClosure,

    /// Push a return address resuming at the label in `first` (resolved
    /// index in `second`)
    SaveReturn,

    /// Return to the saved address beneath the return value, or terminate
    /// when the return value is the only stack entry
    Return,

    /// Push a closure built from the template in `first`, capturing the
    /// current environment
    MakeClosure,

    /// Invoke the primitive named by `first` with the current argument
    /// count, pushing its result
    Prim,
}

/// One bytecode instruction: an opcode plus two value operand slots.
/// Unused slots hold `Nil`.
#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    pub op: Opcode,
    pub first: Value,
    pub second: Value,
}

impl Instruction {
    pub fn nullary(op: Opcode) -> Self {
        Instruction {
            op,
            first: Value::Nil,
            second: Value::Nil,
        }
    }

    pub fn unary(op: Opcode, first: Value) -> Self {
        Instruction {
            op,
            first,
            second: Value::Nil,
        }
    }

    pub fn binary(op: Opcode, first: Value, second: Value) -> Self {
        Instruction { op, first, second }
    }

    /// True for instructions whose `first` is a label name to be resolved
    /// into `second` by assembly.
    pub fn is_jump(&self) -> bool {
        matches!(
            self.op,
            Opcode::JumpIfTrue | Opcode::JumpIfFalse | Opcode::Jump | Opcode::SaveReturn
        )
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.op)?;
        if !self.first.is_nil() {
            write!(f, " {}", self.first)?;
        }
        if !self.second.is_nil() {
            write!(f, " {}", self.second)?;
        }
        Ok(())
    }
}

/// An assembled, immutable sequence of instructions.
#[derive(Debug, Clone, PartialEq)]
pub struct CodeBlock {
    pub name: Option<String>,
    pub instructions: Vec<Instruction>,
}

/// Handle to a registered code block. Closures refer to code through
/// handles rather than direct references, which keeps the closure/env
/// graph free of hard cycles through code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodeHandle(usize);

/// Registry of every code block compiled in a context. Blocks never
/// mutate after registration.
#[derive(Clone, Default)]
pub struct CodeRegistry {
    blocks: Rc<RefCell<Vec<Rc<CodeBlock>>>>,
}

impl CodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, block: CodeBlock) -> CodeHandle {
        let mut blocks = self.blocks.borrow_mut();
        blocks.push(Rc::new(block));
        CodeHandle(blocks.len() - 1)
    }

    pub fn get(&self, handle: CodeHandle) -> Option<Rc<CodeBlock>> {
        self.blocks.borrow().get(handle.0).cloned()
    }

    pub fn len(&self) -> usize {
        self.blocks.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.borrow().is_empty()
    }
}

/// Execution state for one VM invocation.
pub struct Vm<'ctx> {
    ctx: &'ctx Context,
    /// Current closure
    fun: Rc<Closure>,
    /// Its instruction sequence
    code: Rc<CodeBlock>,
    /// Index of the next instruction
    pc: usize,
    /// Innermost environment frame
    env: Option<Rc<Frame>>,
    /// Value stack; top at the end
    stack: Vec<Value>,
    /// Transient argument-count register set by `CallClosure`
    nargs: usize,
    /// Termination flag set by the return protocol
    done: bool,
}

impl<'ctx> Vm<'ctx> {
    /// Construct a VM poised at the first instruction of `closure`, with
    /// `args` pushed onto the stack in order.
    pub fn new(
        ctx: &'ctx Context,
        closure: Rc<Closure>,
        args: &[Value],
    ) -> Result<Self, RuntimeError> {
        let code = ctx.code_registry().get(closure.code).ok_or_else(|| {
            RuntimeError::new(format!(
                "closure {} refers to an unregistered code block",
                closure.display_name()
            ))
        })?;
        Ok(Vm {
            ctx,
            env: closure.env.clone(),
            fun: closure,
            code,
            pc: 0,
            stack: args.to_vec(),
            nargs: args.len(),
            done: false,
        })
    }

    /// Run until termination and return the top of the stack.
    pub fn run(&mut self) -> Result<Value, RuntimeError> {
        while !self.done {
            self.step()?;
        }
        self.stack
            .pop()
            .ok_or_else(|| RuntimeError::new("virtual machine terminated with an empty stack"))
    }

    fn step(&mut self) -> Result<(), RuntimeError> {
        if self.pc >= self.code.instructions.len() {
            return Err(RuntimeError::new(format!(
                "program counter ran off the end of {} (pc={})",
                self.fun.display_name(),
                self.pc
            )));
        }
        let instr = self.code.instructions[self.pc].clone();
        debug_trace!(
            "{:<16} pc={:<4} {:<28} stack={}",
            self.fun.display_name(),
            self.pc,
            format!("{instr}"),
            self.stack.len()
        );
        self.pc += 1;

        match instr.op {
            Opcode::Label => {}

            Opcode::Const => self.stack.push(instr.first),

            Opcode::LocalGet => {
                let pos = VarPos {
                    frame: operand_index(&instr.first)?,
                    slot: operand_index(&instr.second)?,
                };
                let value = self
                    .env
                    .as_ref()
                    .and_then(|env| env.lookup(pos))
                    .ok_or_else(|| {
                        RuntimeError::new(format!(
                            "invalid local variable reference ({} {})",
                            pos.frame, pos.slot
                        ))
                    })?;
                self.stack.push(value);
            }

            Opcode::LocalSet => {
                let pos = VarPos {
                    frame: operand_index(&instr.first)?,
                    slot: operand_index(&instr.second)?,
                };
                let value = self.peek()?.clone();
                let ok = match self.env.as_ref() {
                    Some(env) => env.assign(pos, value),
                    None => false,
                };
                if !ok {
                    return Err(RuntimeError::new(format!(
                        "invalid local variable assignment ({} {})",
                        pos.frame, pos.slot
                    )));
                }
            }

            Opcode::GlobalGet => {
                let sym = operand_symbol(&instr.first)?;
                let package = sym.package().ok_or_else(|| {
                    RuntimeError::new("symbol's home package has been dropped")
                })?;
                let value = package.get_value(sym).ok_or_else(|| {
                    RuntimeError::new(format!("unbound global variable: {}", sym.name()))
                })?;
                self.stack.push(value);
            }

            Opcode::GlobalSet => {
                let sym = operand_symbol(&instr.first)?;
                let package = sym.package().ok_or_else(|| {
                    RuntimeError::new("symbol's home package has been dropped")
                })?;
                let value = self.peek()?.clone();
                package.set_value(sym, value);
            }

            Opcode::Pop => {
                self.pop()?;
            }

            Opcode::JumpIfTrue => {
                let target = jump_target(&instr)?;
                if self.pop()?.is_truthy() {
                    self.pc = target;
                }
            }

            Opcode::JumpIfFalse => {
                let target = jump_target(&instr)?;
                if !self.pop()?.is_truthy() {
                    self.pc = target;
                }
            }

            Opcode::Jump => {
                self.pc = jump_target(&instr)?;
            }

            Opcode::MakeEnv => {
                let n = operand_index(&instr.first)?;
                if self.nargs != n {
                    return Err(RuntimeError::new(format!(
                        "wrong number of arguments for {}: expected {}, got {}",
                        self.fun.display_name(),
                        n,
                        self.nargs
                    )));
                }
                let frame = Frame::new(n, self.env.clone());
                for slot in (0..n).rev() {
                    frame.set_slot(slot, self.pop()?);
                }
                self.env = Some(frame);
            }

            Opcode::MakeEnvDot => {
                let n = operand_index(&instr.first)?;
                if self.nargs < n {
                    return Err(RuntimeError::new(format!(
                        "wrong number of arguments for {}: expected at least {}, got {}",
                        self.fun.display_name(),
                        n,
                        self.nargs
                    )));
                }
                let frame = Frame::new(n + 1, self.env.clone());
                // Pop the excess arguments last-first so the first excess
                // argument ends up at the head of the rest list.
                let mut rest = Value::Nil;
                for _ in 0..(self.nargs - n) {
                    rest = value::cons(self.pop()?, rest);
                }
                frame.set_slot(n, rest);
                for slot in (0..n).rev() {
                    frame.set_slot(slot, self.pop()?);
                }
                self.env = Some(frame);
            }

            Opcode::Dup => {
                let top = self.peek()?.clone();
                self.stack.push(top);
            }

            Opcode::CallClosure => {
                let n = operand_index(&instr.first)?;
                // The caller's innermost frame is dead from here on.
                self.env = self.env.as_ref().and_then(|env| env.parent());
                let callee = self.pop()?;
                match callee {
                    Value::Closure(closure) => {
                        self.code = self.ctx.code_registry().get(closure.code).ok_or_else(|| {
                            RuntimeError::new(format!(
                                "closure {} refers to an unregistered code block",
                                closure.display_name()
                            ))
                        })?;
                        self.env = closure.env.clone();
                        self.fun = closure;
                        self.pc = 0;
                        self.nargs = n;
                    }
                    other => {
                        return Err(RuntimeError::new(format!(
                            "attempt to call a non-closure value: {other}"
                        )));
                    }
                }
            }

            Opcode::SaveReturn => {
                let pc = jump_target(&instr)?;
                self.stack.push(Value::ReturnAddr(Rc::new(ReturnAddr {
                    closure: self.fun.clone(),
                    pc,
                    env: self.env.clone(),
                })));
            }

            Opcode::Return => {
                if self.stack.len() > 1 {
                    let result = self.pop()?;
                    let addr = self.pop()?;
                    match addr {
                        Value::ReturnAddr(addr) => {
                            self.stack.push(result);
                            self.code =
                                self.ctx.code_registry().get(addr.closure.code).ok_or_else(
                                    || RuntimeError::new("return into an unregistered code block"),
                                )?;
                            self.fun = addr.closure.clone();
                            self.env = addr.env.clone();
                            self.pc = addr.pc;
                        }
                        other => {
                            return Err(RuntimeError::new(format!(
                                "return protocol violated: expected a return address, found {}",
                                other.type_name()
                            )));
                        }
                    }
                } else if self.stack.len() == 1 {
                    self.done = true;
                } else {
                    return Err(RuntimeError::new("stack underflow on return"));
                }
            }

            Opcode::MakeClosure => {
                let template = match &instr.first {
                    Value::Closure(c) => c,
                    other => {
                        return Err(RuntimeError::new(format!(
                            "malformed MakeClosure operand: {}",
                            other.type_name()
                        )));
                    }
                };
                self.stack.push(Value::Closure(Rc::new(Closure {
                    code: template.code,
                    env: self.env.clone(),
                    params: template.params.clone(),
                    name: template.name.clone(),
                })));
            }

            Opcode::Prim => {
                let name = match &instr.first {
                    Value::Str(name) => name,
                    other => {
                        return Err(RuntimeError::new(format!(
                            "malformed Prim operand: {}",
                            other.type_name()
                        )));
                    }
                };
                let prim = self.ctx.primitives().lookup(name, self.nargs)?;
                let mut args: SmallVec<[Value; 4]> = SmallVec::with_capacity(self.nargs);
                for _ in 0..self.nargs {
                    args.push(self.pop()?);
                }
                args.reverse();
                let result = (prim.func)(&args)?;
                self.stack.push(result);
            }
        }

        Ok(())
    }

    fn pop(&mut self) -> Result<Value, RuntimeError> {
        self.stack
            .pop()
            .ok_or_else(|| RuntimeError::new("stack underflow"))
    }

    fn peek(&self) -> Result<&Value, RuntimeError> {
        self.stack
            .last()
            .ok_or_else(|| RuntimeError::new("stack underflow"))
    }
}

fn operand_index(value: &Value) -> Result<usize, RuntimeError> {
    match value {
        Value::Int(n) if *n >= 0 => Ok(*n as usize),
        other => Err(RuntimeError::new(format!(
            "expected a non-negative integer operand, found {other}"
        ))),
    }
}

fn operand_symbol(value: &Value) -> Result<&crate::symbol::Symbol, RuntimeError> {
    match value {
        Value::Symbol(sym) => Ok(sym),
        other => Err(RuntimeError::new(format!(
            "expected a symbol operand, found {}",
            other.type_name()
        ))),
    }
}

/// Jump targets must have been resolved to absolute indices by assembly.
fn jump_target(instr: &Instruction) -> Result<usize, RuntimeError> {
    match &instr.second {
        Value::Int(n) if *n >= 0 => Ok(*n as usize),
        _ => Err(RuntimeError::new(format!(
            "unresolved jump label: {}",
            instr.first
        ))),
    }
}
