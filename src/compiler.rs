//! The compiler: recursive descent from s-expressions to bytecode,
//! followed by a label-assembly pass.
//!
//! Compilation of every expression is driven by two flags: `val` ("is
//! this expression's result used?") and `more` ("is there work after this
//! expression?"). `val=false, more=false` cannot occur. Tail position is
//! `more=false`, and every path compiled in tail position ends in a
//! `Return`.
//!
//! Macro applications are fully expanded before compilation by running
//! the VM on the macro's compiled body; `defmacro` installs macros during
//! compilation, so later forms in the same compilation already see them.

use crate::context::Context;
use crate::env::VarPos;
use crate::macros::{self, Macro};
use crate::symbol::Symbol;
use crate::value::{self, Closure, Value};
use crate::vm::{CodeBlock, Instruction, Opcode};
use crate::MAX_MACRO_EXPANSIONS;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

/// An error raised synchronously from a compile call: bad argument
/// counts, malformed special forms, non-symbol lvalues, unknown jump
/// labels, nonsense parameter lists. Includes the offending form.
#[derive(Debug, Clone, PartialEq)]
pub struct CompileError {
    pub message: String,
    pub expression: Option<String>,
}

impl CompileError {
    pub fn new(message: impl Into<String>) -> Self {
        CompileError {
            message: message.into(),
            expression: None,
        }
    }

    pub fn with_expression(mut self, expr: &Value) -> Self {
        self.expression = Some(format!("{expr}"));
        self
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Compile error: {}", self.message)?;
        if let Some(expr) = &self.expression {
            write!(f, "\n  While compiling: {expr}")?;
        }
        Ok(())
    }
}

impl std::error::Error for CompileError {}

/// Compile-time environment: the symbol layout of each activation frame,
/// innermost first. Mirrors the runtime frame chain shape exactly, so a
/// [`VarPos`] found here is valid at runtime.
#[derive(Debug, Clone, Default)]
struct LexEnv {
    frames: Vec<Vec<Symbol>>,
}

impl LexEnv {
    fn lookup(&self, sym: &Symbol) -> Option<VarPos> {
        for (frame, names) in self.frames.iter().enumerate() {
            if let Some(slot) = names.iter().position(|name| name == sym) {
                return Some(VarPos { frame, slot });
            }
        }
        None
    }

    fn extended(&self, names: Vec<Symbol>) -> LexEnv {
        let mut frames = Vec::with_capacity(self.frames.len() + 1);
        frames.push(names);
        frames.extend(self.frames.iter().cloned());
        LexEnv { frames }
    }
}

/// One compilation pass over a context. Label numbering and the macro
/// expansion budget reset at each top-level [`Compiler::compile`] call.
pub struct Compiler<'ctx> {
    ctx: &'ctx Context,
    label_counter: usize,
    expansions: usize,
}

impl<'ctx> Compiler<'ctx> {
    pub fn new(ctx: &'ctx Context) -> Self {
        Compiler {
            ctx,
            label_counter: 0,
            expansions: 0,
        }
    }

    /// Top-level entry: wrap `expr` as the body of a zero-argument
    /// closure, ready for execution.
    pub fn compile(&mut self, expr: &Value) -> Result<Rc<Closure>, CompileError> {
        self.label_counter = 0;
        self.expansions = 0;
        let body = value::cons(expr.clone(), Value::Nil);
        self.compile_lambda(&Value::Nil, &body, &LexEnv::default(), None)
    }

    fn comp(
        &mut self,
        x: &Value,
        env: &LexEnv,
        val: bool,
        more: bool,
    ) -> Result<Vec<Instruction>, CompileError> {
        if macros::macro_of(x).is_some() {
            self.expansions += 1;
            if self.expansions > MAX_MACRO_EXPANSIONS {
                return Err(CompileError::new(format!(
                    "macro expansion exceeded {MAX_MACRO_EXPANSIONS} iterations"
                ))
                .with_expression(x));
            }
            let expanded = macros::expand_full(self.ctx, x).map_err(|e| {
                CompileError::new(format!("macro expansion failed: {}", e.message))
                    .with_expression(x)
            })?;
            return self.comp(&expanded, env, val, more);
        }

        match x {
            Value::Symbol(_) => Ok(self.comp_var(x, env, val, more)),
            Value::Cons(_) => self.comp_form(x, env, val, more),
            _ => Ok(self.comp_const(x, val, more)),
        }
    }

    fn comp_form(
        &mut self,
        x: &Value,
        env: &LexEnv,
        val: bool,
        more: bool,
    ) -> Result<Vec<Instruction>, CompileError> {
        let head = x.first();
        if let Some(sym) = head.as_symbol() {
            match sym.name().as_str() {
                "quote" => {
                    verify_arg_count(x, 1, 1)?;
                    Ok(self.comp_const(&x.second(), val, more))
                }
                "begin" => self.comp_begin(&x.rest(), env, val, more),
                "set!" => self.comp_set(x, env, val, more),
                "if" => {
                    verify_arg_count(x, 2, 3)?;
                    self.comp_if(&x.second(), &x.third(), &x.fourth(), env, val, more)
                }
                "if*" => {
                    verify_arg_count(x, 2, 2)?;
                    self.comp_if_star(&x.second(), &x.third(), env, val, more)
                }
                "lambda" => {
                    verify_arg_count_at_least(x, 1)?;
                    if !val {
                        // A closure nobody looks at compiles to nothing.
                        return Ok(Vec::new());
                    }
                    let closure =
                        self.compile_lambda(&x.second(), &x.after_second(), env, None)?;
                    let mut code =
                        vec![Instruction::unary(Opcode::MakeClosure, Value::Closure(closure))];
                    if !more {
                        code.push(Instruction::nullary(Opcode::Return));
                    }
                    Ok(code)
                }
                "defmacro" => self.comp_defmacro(x, env, val, more),
                _ => self.comp_funcall(x, &head, &x.rest(), env, val, more),
            }
        } else {
            self.comp_funcall(x, &head, &x.rest(), env, val, more)
        }
    }

    /// Variable reference: positional access for lexical variables, the
    /// package's value slot otherwise.
    fn comp_var(&self, x: &Value, env: &LexEnv, val: bool, more: bool) -> Vec<Instruction> {
        if !val {
            return Vec::new();
        }
        let sym = match x.as_symbol() {
            Some(sym) => sym,
            None => return Vec::new(),
        };
        let mut code = vec![match env.lookup(sym) {
            Some(pos) => Instruction::binary(
                Opcode::LocalGet,
                Value::Int(pos.frame as i64),
                Value::Int(pos.slot as i64),
            ),
            None => Instruction::unary(Opcode::GlobalGet, x.clone()),
        }];
        if !more {
            code.push(Instruction::nullary(Opcode::Return));
        }
        code
    }

    fn comp_const(&self, x: &Value, val: bool, more: bool) -> Vec<Instruction> {
        if !val {
            return Vec::new();
        }
        let mut code = vec![Instruction::unary(Opcode::Const, x.clone())];
        if !more {
            code.push(Instruction::nullary(Opcode::Return));
        }
        code
    }

    fn comp_begin(
        &mut self,
        exprs: &Value,
        env: &LexEnv,
        val: bool,
        more: bool,
    ) -> Result<Vec<Instruction>, CompileError> {
        match exprs {
            Value::Nil => Ok(self.comp_const(&Value::Nil, val, more)),
            Value::Cons(cell) => {
                if cell.rest().is_nil() {
                    self.comp(&cell.first(), env, val, more)
                } else {
                    let mut code = self.comp(&cell.first(), env, false, true)?;
                    code.extend(self.comp_begin(&cell.rest(), env, val, more)?);
                    Ok(code)
                }
            }
            other => {
                Err(CompileError::new("malformed expression sequence").with_expression(other))
            }
        }
    }

    fn comp_set(
        &mut self,
        x: &Value,
        env: &LexEnv,
        val: bool,
        more: bool,
    ) -> Result<Vec<Instruction>, CompileError> {
        verify_arg_count(x, 2, 2)?;
        let place = x.second();
        let sym = match place.as_symbol() {
            Some(sym) => sym.clone(),
            None => {
                return Err(CompileError::new("set! target must be a symbol").with_expression(x));
            }
        };
        let mut code = self.comp(&x.third(), env, true, true)?;
        code.push(match env.lookup(&sym) {
            Some(pos) => Instruction::binary(
                Opcode::LocalSet,
                Value::Int(pos.frame as i64),
                Value::Int(pos.slot as i64),
            ),
            None => Instruction::unary(Opcode::GlobalSet, place.clone()),
        });
        if !val {
            code.push(Instruction::nullary(Opcode::Pop));
        }
        if !more {
            code.push(Instruction::nullary(Opcode::Return));
        }
        Ok(code)
    }

    fn comp_if(
        &mut self,
        pred: &Value,
        then: &Value,
        els: &Value,
        env: &LexEnv,
        val: bool,
        more: bool,
    ) -> Result<Vec<Instruction>, CompileError> {
        // (if #f x y) => y
        if matches!(pred, Value::Bool(false)) {
            return self.comp(els, env, val, more);
        }
        // (if <constant> x y) => x; nil is excluded and takes the general path
        if matches!(
            pred,
            Value::Bool(true) | Value::Int(_) | Value::Float(_) | Value::Str(_)
        ) {
            return self.comp(then, env, val, more);
        }
        // (if (not p) x y) => (if p y x)
        if let Some(inner) = not_application(pred) {
            return self.comp_if(&inner, els, then, env, val, more);
        }

        let pcode = self.comp(pred, env, true, true)?;
        let tcode = self.comp(then, env, val, more)?;
        let ecode = self.comp(els, env, val, more)?;

        // (if p x x) => p's effects, then x
        if tcode == ecode {
            let mut code = self.comp(pred, env, false, true)?;
            code.extend(ecode);
            return Ok(code);
        }
        // Degenerate then: p (JumpIfTrue L) else-code L:
        if tcode.is_empty() {
            let l2 = self.gen_label("L");
            let mut code = pcode;
            code.push(Instruction::unary(Opcode::JumpIfTrue, l2.clone()));
            code.extend(ecode);
            code.push(Instruction::unary(Opcode::Label, l2));
            if !more {
                code.push(Instruction::nullary(Opcode::Return));
            }
            return Ok(code);
        }
        // Degenerate else: p (JumpIfFalse L) then-code L:
        if ecode.is_empty() {
            let l1 = self.gen_label("L");
            let mut code = pcode;
            code.push(Instruction::unary(Opcode::JumpIfFalse, l1.clone()));
            code.extend(tcode);
            code.push(Instruction::unary(Opcode::Label, l1));
            if !more {
                code.push(Instruction::nullary(Opcode::Return));
            }
            return Ok(code);
        }

        // General form. In tail position both branches carry their own
        // Return, so no join label is needed.
        let l1 = self.gen_label("L");
        let mut code = pcode;
        code.push(Instruction::unary(Opcode::JumpIfFalse, l1.clone()));
        code.extend(tcode);
        if more {
            let l2 = self.gen_label("L");
            code.push(Instruction::unary(Opcode::Jump, l2.clone()));
            code.push(Instruction::unary(Opcode::Label, l1));
            code.extend(ecode);
            code.push(Instruction::unary(Opcode::Label, l2));
        } else {
            code.push(Instruction::unary(Opcode::Label, l1));
            code.extend(ecode);
        }
        Ok(code)
    }

    /// Anaphoric if: `(if* p e)` yields `p` when `p` is non-false, `e`
    /// otherwise. The predicate value doubles as the result, so it is
    /// duplicated before the test and consumed or kept according to `val`.
    fn comp_if_star(
        &mut self,
        pred: &Value,
        els: &Value,
        env: &LexEnv,
        val: bool,
        more: bool,
    ) -> Result<Vec<Instruction>, CompileError> {
        let l1 = self.gen_label("L");
        let mut code = self.comp(pred, env, true, true)?;
        code.push(Instruction::nullary(Opcode::Dup));
        code.push(Instruction::unary(Opcode::JumpIfTrue, l1.clone()));
        code.push(Instruction::nullary(Opcode::Pop));
        code.extend(self.comp(els, env, true, true)?);
        if !more && !val {
            code.push(Instruction::nullary(Opcode::Return));
        }
        code.push(Instruction::unary(Opcode::Label, l1));
        if !val {
            code.push(Instruction::nullary(Opcode::Pop));
        }
        if !more {
            code.push(Instruction::nullary(Opcode::Return));
        }
        Ok(code)
    }

    fn comp_defmacro(
        &mut self,
        x: &Value,
        env: &LexEnv,
        val: bool,
        more: bool,
    ) -> Result<Vec<Instruction>, CompileError> {
        verify_arg_count_at_least(x, 2)?;
        let name_form = x.second();
        let sym = match name_form.as_symbol() {
            Some(sym) => sym.clone(),
            None => {
                return Err(
                    CompileError::new("defmacro name must be a symbol").with_expression(x)
                );
            }
        };
        let params = x.third();
        let expander =
            self.compile_lambda(&params, &x.after_third(), env, Some(sym.name()))?;
        let package = sym.package().ok_or_else(|| {
            CompileError::new("defmacro name symbol has no home package").with_expression(x)
        })?;
        package.set_macro(
            &sym,
            Macro {
                name: sym.clone(),
                params: params.clone(),
                expander,
            },
        );
        // Installation happens now, at compile time; the form itself is
        // worth nil at runtime.
        Ok(self.comp_const(&Value::Nil, val, more))
    }

    fn comp_funcall(
        &mut self,
        x: &Value,
        f: &Value,
        args: &Value,
        env: &LexEnv,
        val: bool,
        more: bool,
    ) -> Result<Vec<Instruction>, CompileError> {
        // ((lambda () body)) with no arguments unwraps to (begin body)
        if args.is_nil() && f.is_cons() {
            if let Some(head) = f.first().as_symbol() {
                if head.name() == "lambda" && f.second().is_nil() {
                    return self.comp_begin(&f.after_second(), env, val, more);
                }
            }
        }

        if !args.is_proper_list() {
            return Err(CompileError::new("malformed argument list").with_expression(x));
        }
        let n_args = Value::Int(args.list_length() as i64);

        if more {
            // Non-tail: save a continuation, then call.
            let k = self.gen_label("K");
            let mut code = vec![Instruction::unary(Opcode::SaveReturn, k.clone())];
            code.extend(self.comp_list(args, env)?);
            code.extend(self.comp(f, env, true, true)?);
            code.push(Instruction::unary(Opcode::CallClosure, n_args));
            code.push(Instruction::unary(Opcode::Label, k));
            if !val {
                code.push(Instruction::nullary(Opcode::Pop));
            }
            Ok(code)
        } else {
            // Tail call: the callee returns for us.
            let mut code = self.comp_list(args, env)?;
            code.extend(self.comp(f, env, true, true)?);
            code.push(Instruction::unary(Opcode::CallClosure, n_args));
            Ok(code)
        }
    }

    /// Emit arguments left-to-right, each for value.
    fn comp_list(&mut self, args: &Value, env: &LexEnv) -> Result<Vec<Instruction>, CompileError> {
        let mut code = Vec::new();
        for arg in args.elements() {
            code.extend(self.comp(&arg, env, true, true)?);
        }
        Ok(code)
    }

    /// Compile a function body into a fresh registered code block and
    /// wrap it in an environment-less closure template.
    fn compile_lambda(
        &mut self,
        params: &Value,
        body: &Value,
        env: &LexEnv,
        name: Option<String>,
    ) -> Result<Rc<Closure>, CompileError> {
        let (names, dotted) = parse_parameter_list(params)?;
        let n_named = names.len() - usize::from(dotted);
        let prologue = Instruction::unary(
            if dotted {
                Opcode::MakeEnvDot
            } else {
                Opcode::MakeEnv
            },
            Value::Int(n_named as i64),
        );
        let inner = env.extended(names);
        let mut code = vec![prologue];
        code.extend(self.comp_begin(body, &inner, true, false)?);
        let instructions = assemble(code)?;
        let handle = self.ctx.code_registry().register(CodeBlock {
            name: name.clone(),
            instructions,
        });
        Ok(Rc::new(Closure {
            code: handle,
            env: None,
            params: params.clone(),
            name,
        }))
    }

    fn gen_label(&mut self, prefix: &str) -> Value {
        let label = format!("{}{}", prefix, self.label_counter);
        self.label_counter += 1;
        Value::Str(label)
    }
}

/// Resolve labels: record the position of every `Label`, then write each
/// jump's absolute target index into its `second` slot. Labels survive
/// assembly so the recorded positions stay valid.
pub fn assemble(code: Vec<Instruction>) -> Result<Vec<Instruction>, CompileError> {
    let mut positions: HashMap<String, usize> = HashMap::new();
    for (index, instr) in code.iter().enumerate() {
        if instr.op == Opcode::Label {
            if let Value::Str(name) = &instr.first {
                positions.insert(name.clone(), index);
            }
        }
    }

    let mut out = code;
    for instr in &mut out {
        if instr.is_jump() {
            let name = match &instr.first {
                Value::Str(name) => name,
                other => {
                    return Err(CompileError::new(format!(
                        "jump instruction carries a non-label operand: {other:?}"
                    )));
                }
            };
            let target = positions.get(name).ok_or_else(|| {
                CompileError::new(format!("unknown jump label: {name}"))
            })?;
            instr.second = Value::Int(*target as i64);
        }
    }
    Ok(out)
}

/// True for `(not q)` applications, matched by the head symbol's full
/// name. A rebound `not` is still treated as negation here; the check is
/// cheap and conservative.
fn not_application(pred: &Value) -> Option<Value> {
    let cell = pred.as_cons()?;
    let sym_name = cell.first().as_symbol()?.name();
    if sym_name == "not" && pred.list_length() == 2 {
        Some(pred.second())
    } else {
        None
    }
}

fn parse_parameter_list(params: &Value) -> Result<(Vec<Symbol>, bool), CompileError> {
    match params {
        Value::Nil => Ok((Vec::new(), false)),
        // (lambda args body): everything lands in the rest slot
        Value::Symbol(sym) => Ok((vec![sym.clone()], true)),
        Value::Cons(_) => {
            let mut names = Vec::new();
            let mut cursor = params.clone();
            loop {
                match cursor {
                    Value::Cons(cell) => {
                        match cell.first() {
                            Value::Symbol(sym) => names.push(sym),
                            other => {
                                return Err(CompileError::new(format!(
                                    "parameter list may contain only symbols, found {}",
                                    other.type_name()
                                ))
                                .with_expression(params));
                            }
                        }
                        cursor = cell.rest();
                    }
                    Value::Nil => return Ok((names, false)),
                    Value::Symbol(sym) => {
                        names.push(sym);
                        return Ok((names, true));
                    }
                    other => {
                        return Err(CompileError::new(format!(
                            "malformed parameter list terminator: {}",
                            other.type_name()
                        ))
                        .with_expression(params));
                    }
                }
            }
        }
        other => Err(
            CompileError::new(format!("malformed parameter list: {}", other.type_name()))
                .with_expression(params),
        ),
    }
}

/// Check the argument count of a special form against an inclusive range.
fn verify_arg_count(form: &Value, min: usize, max: usize) -> Result<(), CompileError> {
    let count = form.rest().list_length();
    if count < min || count > max {
        let expected = if min == max {
            format!("{min}")
        } else {
            format!("{min} to {max}")
        };
        return Err(CompileError::new(format!(
            "wrong number of arguments: expected {expected}, got {count}"
        ))
        .with_expression(form));
    }
    Ok(())
}

fn verify_arg_count_at_least(form: &Value, min: usize) -> Result<(), CompileError> {
    let count = form.rest().list_length();
    if count < min {
        return Err(CompileError::new(format!(
            "wrong number of arguments: expected at least {min}, got {count}"
        ))
        .with_expression(form));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use crate::reader;

    /// Compile source text and return the top-level instruction sequence.
    fn compile_code(ctx: &Context, source: &str) -> Vec<Instruction> {
        let expr = reader::parse(source, ctx.package()).unwrap();
        let closure = ctx.compile(&expr).unwrap();
        ctx.code_registry()
            .get(closure.code)
            .unwrap()
            .instructions
            .clone()
    }

    fn compile_error(ctx: &Context, source: &str) -> CompileError {
        let expr = reader::parse(source, ctx.package()).unwrap();
        match ctx.compile(&expr) {
            Err(crate::Error::Compile(e)) => e,
            other => panic!("expected a compile error, got {other:?}"),
        }
    }

    /// The closure template pushed by the first MakeClosure instruction.
    fn first_inner_closure(ctx: &Context, code: &[Instruction]) -> Vec<Instruction> {
        for instr in code {
            if instr.op == Opcode::MakeClosure {
                if let Value::Closure(c) = &instr.first {
                    return ctx.code_registry().get(c.code).unwrap().instructions.clone();
                }
            }
        }
        panic!("no MakeClosure instruction in {code:?}");
    }

    #[test]
    fn test_constant_in_tail_position() {
        let ctx = Context::new();
        let code = compile_code(&ctx, "42");
        assert_eq!(
            code,
            vec![
                Instruction::unary(Opcode::MakeEnv, Value::Int(0)),
                Instruction::unary(Opcode::Const, Value::Int(42)),
                Instruction::nullary(Opcode::Return),
            ]
        );
    }

    #[test]
    fn test_assembly_resolves_every_jump() {
        let ctx = Context::new();
        let sources = [
            "(if a 1 2)",
            "(begin (if a 1 2) 3)",
            "(begin (f) (g) (h))",
            "(if* (f) 9)",
            "(if (not a) (f) (g))",
        ];
        for source in sources {
            let code = compile_code(&ctx, source);
            for instr in &code {
                if instr.is_jump() {
                    let target = match instr.second {
                        Value::Int(n) if n >= 0 => n as usize,
                        _ => panic!("unresolved jump in {source}: {instr}"),
                    };
                    assert!(target < code.len(), "target out of bounds in {source}");
                    assert_eq!(
                        code[target].op,
                        Opcode::Label,
                        "jump in {source} does not land on a label"
                    );
                    assert_eq!(
                        code[target].first, instr.first,
                        "jump in {source} lands on the wrong label"
                    );
                }
            }
        }
    }

    #[test]
    fn test_assemble_is_idempotent() {
        let ctx = Context::new();
        let code = compile_code(&ctx, "(begin (if a (f) (g)) 1)");
        let reassembled = assemble(code.clone()).unwrap();
        assert_eq!(code, reassembled);
    }

    #[test]
    fn test_assemble_rejects_unknown_labels() {
        let code = vec![
            Instruction::unary(Opcode::Jump, Value::Str("L99".into())),
            Instruction::nullary(Opcode::Return),
        ];
        let err = assemble(code).unwrap_err();
        assert!(err.message.contains("unknown jump label: L99"));
    }

    #[test]
    fn test_if_literal_false_compiles_else_branch_only() {
        let ctx = Context::new();
        assert_eq!(compile_code(&ctx, "(if #f 1 2)"), compile_code(&ctx, "2"));
    }

    #[test]
    fn test_if_constant_predicate_compiles_then_branch_only() {
        let ctx = Context::new();
        assert_eq!(compile_code(&ctx, "(if 7 1 2)"), compile_code(&ctx, "1"));
        assert_eq!(compile_code(&ctx, "(if #t 1 2)"), compile_code(&ctx, "1"));
        assert_eq!(
            compile_code(&ctx, "(if \"s\" 1 2)"),
            compile_code(&ctx, "1")
        );
    }

    #[test]
    fn test_if_nil_predicate_takes_the_general_path() {
        let ctx = Context::new();
        // nil is false at runtime, so it must not be folded as a true constant.
        let code = compile_code(&ctx, "(if nil 1 2)");
        assert!(code.iter().any(|i| i.op == Opcode::JumpIfFalse));
    }

    #[test]
    fn test_if_not_predicate_swaps_branches() {
        let ctx = Context::new();
        assert_eq!(
            compile_code(&ctx, "(if (not a) 1 2)"),
            compile_code(&ctx, "(if a 2 1)")
        );
    }

    #[test]
    fn test_if_equal_branches_collapse() {
        let ctx = Context::new();
        assert_eq!(compile_code(&ctx, "(if a 1 1)"), compile_code(&ctx, "1"));
    }

    #[test]
    fn test_if_degenerate_then_uses_jump_if_true() {
        let ctx = Context::new();
        // In effect position the then-branch compiles to nothing.
        let code = compile_code(&ctx, "(begin (if a 1 (f)) 2)");
        assert!(code.iter().any(|i| i.op == Opcode::JumpIfTrue));
        assert!(!code.iter().any(|i| i.op == Opcode::JumpIfFalse));
    }

    #[test]
    fn test_if_in_tail_position_has_no_join_jump() {
        let ctx = Context::new();
        let code = compile_code(&ctx, "(if a (f) (g))");
        // Both branches end in their own return (via tail calls); there is
        // no unconditional jump to a join point.
        assert!(!code.iter().any(|i| i.op == Opcode::Jump));
    }

    #[test]
    fn test_tail_call_has_no_save_return() {
        let ctx = Context::new();
        let code = compile_code(&ctx, "(f 1 2)");
        assert!(!code.iter().any(|i| i.op == Opcode::SaveReturn));
        assert_eq!(code.last().unwrap().op, Opcode::CallClosure);
        assert_eq!(code.last().unwrap().first, Value::Int(2));
    }

    #[test]
    fn test_nontail_call_saves_and_pops() {
        let ctx = Context::new();
        let code = compile_code(&ctx, "(begin (f) 1)");
        assert!(code.iter().any(|i| i.op == Opcode::SaveReturn));
        assert!(code.iter().any(|i| i.op == Opcode::Pop));
    }

    #[test]
    fn test_unused_lambda_compiles_to_nothing() {
        let ctx = Context::new();
        assert_eq!(
            compile_code(&ctx, "(begin (lambda (x) x) 5)"),
            compile_code(&ctx, "5")
        );
    }

    #[test]
    fn test_immediate_lambda_application_unwraps_to_begin() {
        let ctx = Context::new();
        assert_eq!(
            compile_code(&ctx, "((lambda () 1 2))"),
            compile_code(&ctx, "(begin 1 2)")
        );
    }

    #[test]
    fn test_label_numbering_resets_per_compilation() {
        let ctx = Context::new();
        assert_eq!(
            compile_code(&ctx, "(if a (f) (g))"),
            compile_code(&ctx, "(if a (f) (g))")
        );
    }

    #[test]
    fn test_lambda_prologues() {
        let ctx = Context::new();

        let proper = compile_code(&ctx, "(lambda (a b) a)");
        let inner = first_inner_closure(&ctx, &proper);
        assert_eq!(inner[0], Instruction::unary(Opcode::MakeEnv, Value::Int(2)));

        let dotted = compile_code(&ctx, "(lambda (a . rest) rest)");
        let inner = first_inner_closure(&ctx, &dotted);
        assert_eq!(
            inner[0],
            Instruction::unary(Opcode::MakeEnvDot, Value::Int(1))
        );
        // The rest slot sits after the named parameter.
        assert_eq!(
            inner[1],
            Instruction::binary(Opcode::LocalGet, Value::Int(0), Value::Int(1))
        );

        let variadic = compile_code(&ctx, "(lambda args args)");
        let inner = first_inner_closure(&ctx, &variadic);
        assert_eq!(
            inner[0],
            Instruction::unary(Opcode::MakeEnvDot, Value::Int(0))
        );
    }

    #[test]
    fn test_set_target_must_be_a_symbol() {
        let ctx = Context::new();
        let err = compile_error(&ctx, "(set! 5 1)");
        assert!(err.message.contains("set! target must be a symbol"));
        assert_eq!(err.expression.as_deref(), Some("(set! 5 1)"));
    }

    #[test]
    fn test_special_form_arity_errors_cite_the_form() {
        let ctx = Context::new();
        for source in ["(quote)", "(quote a b)", "(if)", "(if a 1 2 3)", "(set! x)", "(if* 1)"] {
            let err = compile_error(&ctx, source);
            assert!(
                err.message.contains("wrong number of arguments"),
                "{source}: {err}"
            );
            assert!(err.expression.is_some(), "{source} should cite the form");
        }
    }

    #[test]
    fn test_parameter_list_rejects_non_symbols() {
        let ctx = Context::new();
        let err = compile_error(&ctx, "(lambda (a 5) a)");
        assert!(err.message.contains("only symbols"));
    }

    #[test]
    fn test_deep_parameter_references_cross_frames() {
        let ctx = Context::new();
        let code = compile_code(&ctx, "(lambda (a) (lambda (b) a))");
        let outer = first_inner_closure(&ctx, &code);
        let inner = first_inner_closure(&ctx, &outer);
        // `a` lives one frame out from the inner body.
        assert_eq!(
            inner[1],
            Instruction::binary(Opcode::LocalGet, Value::Int(1), Value::Int(0))
        );
    }
}
