//! Primitive functions: the registry the VM's `Prim` instruction consults,
//! plus the default set every context starts with.
//!
//! The registry's surface is lookup by name and argument count. Each
//! primitive declares an [`Arity`] that the lookup validates, so primitive
//! bodies can index their argument slice without re-checking counts for
//! the declared minimum.
//!
//! Arithmetic follows integer/float contagion: an all-integer operation
//! stays exact (with checked overflow), and any float operand promotes the
//! whole operation to floats.

use crate::value::{self, Value};
use crate::vm::RuntimeError;
use std::collections::HashMap;
use std::fmt;

/// Primitive arity specification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    /// Exactly n arguments
    Exact(usize),
    /// At least n arguments
    AtLeast(usize),
    /// Between min and max arguments (inclusive)
    Range(usize, usize),
}

impl Arity {
    pub fn accepts(&self, n: usize) -> bool {
        match self {
            Arity::Exact(expected) => n == *expected,
            Arity::AtLeast(min) => n >= *min,
            Arity::Range(min, max) => n >= *min && n <= *max,
        }
    }
}

impl fmt::Display for Arity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arity::Exact(n) => write!(f, "exactly {n}"),
            Arity::AtLeast(n) => write!(f, "at least {n}"),
            Arity::Range(min, max) => write!(f, "between {min} and {max}"),
        }
    }
}

pub type PrimitiveFn = fn(&[Value]) -> Result<Value, RuntimeError>;

/// A function implemented in Rust, reachable through the VM's `Prim`
/// instruction.
#[derive(Clone, Debug)]
pub struct Primitive {
    pub name: String,
    pub arity: Arity,
    pub func: PrimitiveFn,
}

/// Lookup-by-name-and-arity surface consumed by the VM.
#[derive(Default)]
pub struct PrimitiveRegistry {
    prims: HashMap<String, Primitive>,
}

impl PrimitiveRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the default primitive set.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        for (name, arity, func) in DEFAULT_PRIMITIVES {
            registry.register(name, *arity, *func);
        }
        registry
    }

    pub fn register(&mut self, name: &str, arity: Arity, func: PrimitiveFn) {
        self.prims.insert(
            name.to_owned(),
            Primitive {
                name: name.to_owned(),
                arity,
                func,
            },
        );
    }

    /// Find a primitive and validate the argument count against its
    /// declared arity.
    pub fn lookup(&self, name: &str, nargs: usize) -> Result<&Primitive, RuntimeError> {
        let prim = self
            .prims
            .get(name)
            .ok_or_else(|| RuntimeError::new(format!("unknown primitive: {name}")))?;
        if !prim.arity.accepts(nargs) {
            return Err(RuntimeError::new(format!(
                "primitive {} expects {} arguments, got {}",
                name, prim.arity, nargs
            )));
        }
        Ok(prim)
    }

    /// Registered names, sorted for stable display.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.prims.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

const DEFAULT_PRIMITIVES: &[(&str, Arity, PrimitiveFn)] = &[
    ("+", Arity::AtLeast(0), prim_add),
    ("-", Arity::AtLeast(1), prim_sub),
    ("*", Arity::AtLeast(0), prim_mul),
    ("/", Arity::AtLeast(1), prim_div),
    ("=", Arity::AtLeast(2), prim_num_eq),
    ("<", Arity::AtLeast(2), prim_lt),
    (">", Arity::AtLeast(2), prim_gt),
    ("<=", Arity::AtLeast(2), prim_le),
    (">=", Arity::AtLeast(2), prim_ge),
    ("cons", Arity::Exact(2), prim_cons),
    ("car", Arity::Exact(1), prim_car),
    ("cdr", Arity::Exact(1), prim_cdr),
    ("list", Arity::AtLeast(0), prim_list),
    ("not", Arity::Exact(1), prim_not),
    ("null?", Arity::Exact(1), prim_null_p),
    ("pair?", Arity::Exact(1), prim_pair_p),
    ("eq?", Arity::Exact(2), prim_eq_p),
    ("print", Arity::AtLeast(0), prim_print),
];

/// Numeric working representation for the arithmetic primitives.
#[derive(Clone, Copy)]
enum Num {
    Int(i64),
    Float(f64),
}

impl Num {
    fn to_value(self) -> Value {
        match self {
            Num::Int(n) => Value::Int(n),
            Num::Float(n) => Value::Float(n),
        }
    }

    fn as_f64(self) -> f64 {
        match self {
            Num::Int(n) => n as f64,
            Num::Float(n) => n,
        }
    }
}

fn expect_number(name: &str, value: &Value) -> Result<Num, RuntimeError> {
    match value {
        Value::Int(n) => Ok(Num::Int(*n)),
        Value::Float(n) => Ok(Num::Float(*n)),
        other => Err(RuntimeError::new(format!(
            "{} expects numbers, got {}",
            name,
            other.type_name()
        ))),
    }
}

fn checked(op: &str, result: Option<i64>) -> Result<Num, RuntimeError> {
    result
        .map(Num::Int)
        .ok_or_else(|| RuntimeError::new(format!("integer overflow in {op}")))
}

fn num_add(a: Num, b: Num) -> Result<Num, RuntimeError> {
    match (a, b) {
        (Num::Int(a), Num::Int(b)) => checked("addition", a.checked_add(b)),
        _ => Ok(Num::Float(a.as_f64() + b.as_f64())),
    }
}

fn num_sub(a: Num, b: Num) -> Result<Num, RuntimeError> {
    match (a, b) {
        (Num::Int(a), Num::Int(b)) => checked("subtraction", a.checked_sub(b)),
        _ => Ok(Num::Float(a.as_f64() - b.as_f64())),
    }
}

fn num_mul(a: Num, b: Num) -> Result<Num, RuntimeError> {
    match (a, b) {
        (Num::Int(a), Num::Int(b)) => checked("multiplication", a.checked_mul(b)),
        _ => Ok(Num::Float(a.as_f64() * b.as_f64())),
    }
}

fn num_div(a: Num, b: Num) -> Result<Num, RuntimeError> {
    match (a, b) {
        (Num::Int(a), Num::Int(b)) => {
            if b == 0 {
                Err(RuntimeError::new("division by zero"))
            } else {
                checked("division", a.checked_div(b))
            }
        }
        _ => Ok(Num::Float(a.as_f64() / b.as_f64())),
    }
}

fn prim_add(args: &[Value]) -> Result<Value, RuntimeError> {
    let mut sum = Num::Int(0);
    for arg in args {
        sum = num_add(sum, expect_number("+", arg)?)?;
    }
    Ok(sum.to_value())
}

fn prim_sub(args: &[Value]) -> Result<Value, RuntimeError> {
    let first = expect_number("-", &args[0])?;
    if args.len() == 1 {
        return num_sub(Num::Int(0), first).map(Num::to_value);
    }
    let mut result = first;
    for arg in &args[1..] {
        result = num_sub(result, expect_number("-", arg)?)?;
    }
    Ok(result.to_value())
}

fn prim_mul(args: &[Value]) -> Result<Value, RuntimeError> {
    let mut product = Num::Int(1);
    for arg in args {
        product = num_mul(product, expect_number("*", arg)?)?;
    }
    Ok(product.to_value())
}

fn prim_div(args: &[Value]) -> Result<Value, RuntimeError> {
    let first = expect_number("/", &args[0])?;
    if args.len() == 1 {
        return num_div(Num::Int(1), first).map(Num::to_value);
    }
    let mut result = first;
    for arg in &args[1..] {
        result = num_div(result, expect_number("/", arg)?)?;
    }
    Ok(result.to_value())
}

fn num_compare(name: &str, a: Num, b: Num) -> Result<std::cmp::Ordering, RuntimeError> {
    match (a, b) {
        (Num::Int(a), Num::Int(b)) => Ok(a.cmp(&b)),
        _ => a.as_f64().partial_cmp(&b.as_f64()).ok_or_else(|| {
            RuntimeError::new(format!("{name} cannot order a NaN operand"))
        }),
    }
}

/// Chain a pairwise ordering predicate across all arguments.
fn fold_comparison(
    name: &str,
    args: &[Value],
    accept: fn(std::cmp::Ordering) -> bool,
) -> Result<Value, RuntimeError> {
    for pair in args.windows(2) {
        let a = expect_number(name, &pair[0])?;
        let b = expect_number(name, &pair[1])?;
        if !accept(num_compare(name, a, b)?) {
            return Ok(Value::Bool(false));
        }
    }
    Ok(Value::Bool(true))
}

fn prim_num_eq(args: &[Value]) -> Result<Value, RuntimeError> {
    fold_comparison("=", args, std::cmp::Ordering::is_eq)
}

fn prim_lt(args: &[Value]) -> Result<Value, RuntimeError> {
    fold_comparison("<", args, std::cmp::Ordering::is_lt)
}

fn prim_gt(args: &[Value]) -> Result<Value, RuntimeError> {
    fold_comparison(">", args, std::cmp::Ordering::is_gt)
}

fn prim_le(args: &[Value]) -> Result<Value, RuntimeError> {
    fold_comparison("<=", args, std::cmp::Ordering::is_le)
}

fn prim_ge(args: &[Value]) -> Result<Value, RuntimeError> {
    fold_comparison(">=", args, std::cmp::Ordering::is_ge)
}

fn prim_cons(args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(value::cons(args[0].clone(), args[1].clone()))
}

fn prim_car(args: &[Value]) -> Result<Value, RuntimeError> {
    match &args[0] {
        Value::Cons(cell) => Ok(cell.first()),
        other => Err(RuntimeError::new(format!(
            "car expects a pair, got {}",
            other.type_name()
        ))),
    }
}

fn prim_cdr(args: &[Value]) -> Result<Value, RuntimeError> {
    match &args[0] {
        Value::Cons(cell) => Ok(cell.rest()),
        other => Err(RuntimeError::new(format!(
            "cdr expects a pair, got {}",
            other.type_name()
        ))),
    }
}

fn prim_list(args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(value::list_from_vec(args.to_vec()))
}

fn prim_not(args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(Value::Bool(!args[0].is_truthy()))
}

fn prim_null_p(args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(Value::Bool(args[0].is_nil()))
}

fn prim_pair_p(args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(Value::Bool(args[0].is_cons()))
}

fn prim_eq_p(args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(Value::Bool(args[0] == args[1]))
}

fn prim_print(args: &[Value]) -> Result<Value, RuntimeError> {
    let rendered: Vec<String> = args.iter().map(|arg| format!("{arg}")).collect();
    println!("{}", rendered.join(" "));
    Ok(Value::Nil)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_validates_arity() {
        let registry = PrimitiveRegistry::with_defaults();
        assert!(registry.lookup("+", 0).is_ok());
        assert!(registry.lookup("+", 5).is_ok());
        assert!(registry.lookup("car", 1).is_ok());

        let err = registry.lookup("car", 2).unwrap_err();
        assert!(err.message.contains("exactly 1"));
        let err = registry.lookup("<", 1).unwrap_err();
        assert!(err.message.contains("at least 2"));
    }

    #[test]
    fn test_lookup_unknown_primitive() {
        let registry = PrimitiveRegistry::with_defaults();
        let err = registry.lookup("frobnicate", 1).unwrap_err();
        assert!(err.message.contains("unknown primitive: frobnicate"));
    }

    #[test]
    fn test_arithmetic_contagion() {
        let int_sum = prim_add(&[Value::Int(1), Value::Int(2)]).unwrap();
        assert_eq!(int_sum, Value::Int(3));

        let float_sum = prim_add(&[Value::Int(1), Value::Float(0.5)]).unwrap();
        assert_eq!(float_sum, Value::Float(1.5));
    }

    #[test]
    fn test_integer_overflow_is_an_error() {
        let err = prim_add(&[Value::Int(i64::MAX), Value::Int(1)]).unwrap_err();
        assert!(err.message.contains("integer overflow"));
        let err = prim_mul(&[Value::Int(i64::MAX), Value::Int(2)]).unwrap_err();
        assert!(err.message.contains("integer overflow"));
    }

    #[test]
    fn test_unary_minus_and_division() {
        assert_eq!(prim_sub(&[Value::Int(5)]).unwrap(), Value::Int(-5));
        assert_eq!(prim_div(&[Value::Int(7), Value::Int(2)]).unwrap(), Value::Int(3));
        let err = prim_div(&[Value::Int(1), Value::Int(0)]).unwrap_err();
        assert!(err.message.contains("division by zero"));
    }

    #[test]
    fn test_comparison_chains() {
        let args = [Value::Int(1), Value::Int(2), Value::Int(3)];
        assert_eq!(prim_lt(&args).unwrap(), Value::Bool(true));
        assert_eq!(prim_gt(&args).unwrap(), Value::Bool(false));
        let mixed = [Value::Int(1), Value::Float(1.0)];
        assert_eq!(prim_num_eq(&mixed).unwrap(), Value::Bool(true));
    }

    #[test]
    fn test_list_primitives() {
        let pair = prim_cons(&[Value::Int(1), Value::Nil]).unwrap();
        assert_eq!(format!("{pair}"), "(1)");
        assert_eq!(prim_car(&[pair.clone()]).unwrap(), Value::Int(1));
        assert_eq!(prim_cdr(&[pair]).unwrap(), Value::Nil);

        let err = prim_car(&[Value::Int(1)]).unwrap_err();
        assert!(err.message.contains("car expects a pair"));
    }

    #[test]
    fn test_not_follows_boolean_coercion() {
        assert_eq!(prim_not(&[Value::Nil]).unwrap(), Value::Bool(true));
        assert_eq!(prim_not(&[Value::Bool(false)]).unwrap(), Value::Bool(true));
        assert_eq!(prim_not(&[Value::Int(0)]).unwrap(), Value::Bool(false));
    }
}
