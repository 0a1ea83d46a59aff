//! Interned symbols and the packages that own them.
//!
//! A package is a namespace: it interns names to symbols, and holds the
//! global value slot and the macro slot for each of its symbols. Interning
//! is identity-preserving: two `intern` calls with the same name on the
//! same package yield equal symbols. Symbols keep a weak back-reference to
//! their home package, so values that outlive a torn-down context degrade
//! gracefully instead of keeping the whole package tree alive.
//!
//! Package bindings and macro tables are shared, mutable, process-wide
//! state with no internal locking; concurrent embedders must serialize
//! access at the context level.

use crate::macros::Macro;
use crate::value::Value;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::{Rc, Weak};
use string_interner::{DefaultBackend, DefaultSymbol, StringInterner};

/// Identity of an interned name within one package.
pub type SymbolId = DefaultSymbol;

struct PackageInner {
    name: String,
    symbols: RefCell<StringInterner<DefaultBackend>>,
    globals: RefCell<HashMap<SymbolId, Value>>,
    macros: RefCell<HashMap<SymbolId, Macro>>,
}

/// A namespace of interned symbols with their global values and macros.
#[derive(Clone)]
pub struct Package {
    inner: Rc<PackageInner>,
}

impl Package {
    pub fn new(name: impl Into<String>) -> Self {
        Package {
            inner: Rc::new(PackageInner {
                name: name.into(),
                symbols: RefCell::new(StringInterner::default()),
                globals: RefCell::new(HashMap::new()),
                macros: RefCell::new(HashMap::new()),
            }),
        }
    }

    pub fn name(&self) -> String {
        self.inner.name.clone()
    }

    /// Intern a name, returning the same symbol identity for the same
    /// name every time.
    pub fn intern(&self, name: &str) -> Symbol {
        let id = self.inner.symbols.borrow_mut().get_or_intern(name);
        Symbol {
            home: Rc::downgrade(&self.inner),
            id,
        }
    }

    /// The global value bound to a symbol, if any.
    pub fn get_value(&self, sym: &Symbol) -> Option<Value> {
        self.inner.globals.borrow().get(&sym.id).cloned()
    }

    pub fn set_value(&self, sym: &Symbol, value: Value) {
        self.inner.globals.borrow_mut().insert(sym.id, value);
    }

    pub fn has_macro(&self, sym: &Symbol) -> bool {
        self.inner.macros.borrow().contains_key(&sym.id)
    }

    pub fn get_macro(&self, sym: &Symbol) -> Option<Macro> {
        self.inner.macros.borrow().get(&sym.id).cloned()
    }

    pub fn set_macro(&self, sym: &Symbol, mac: Macro) {
        self.inner.macros.borrow_mut().insert(sym.id, mac);
    }

    fn resolve(&self, id: SymbolId) -> String {
        self.inner
            .symbols
            .borrow()
            .resolve(id)
            .unwrap_or("#<unresolved>")
            .to_owned()
    }
}

impl PartialEq for Package {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Package {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Package({})", self.inner.name)
    }
}

/// An interned identifier. Carries its identity within the home package
/// and a weak back-reference used to reach the package's global and macro
/// slots.
#[derive(Clone)]
pub struct Symbol {
    home: Weak<PackageInner>,
    id: SymbolId,
}

impl Symbol {
    /// Full name of the symbol. Falls back to a placeholder when the home
    /// package has already been dropped.
    pub fn name(&self) -> String {
        match self.home.upgrade() {
            Some(inner) => Package { inner }.resolve(self.id),
            None => "#<detached-symbol>".to_owned(),
        }
    }

    /// The home package, unless it has been dropped.
    pub fn package(&self) -> Option<Package> {
        self.home.upgrade().map(|inner| Package { inner })
    }
}

impl PartialEq for Symbol {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && Weak::ptr_eq(&self.home, &other.home)
    }
}

impl fmt::Debug for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Symbol({})", self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interning_identity() {
        let pkg = Package::new("user");
        let a = pkg.intern("foo");
        let b = pkg.intern("foo");
        let c = pkg.intern("bar");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.name(), "foo");
    }

    #[test]
    fn test_symbols_are_scoped_to_their_package() {
        let p1 = Package::new("one");
        let p2 = Package::new("two");
        assert_ne!(p1.intern("x"), p2.intern("x"));
    }

    #[test]
    fn test_global_value_slots() {
        let pkg = Package::new("user");
        let x = pkg.intern("x");
        assert_eq!(pkg.get_value(&x), None);
        pkg.set_value(&x, Value::Int(7));
        assert_eq!(pkg.get_value(&x), Some(Value::Int(7)));
        pkg.set_value(&x, Value::Int(8));
        assert_eq!(pkg.get_value(&x), Some(Value::Int(8)));
    }

    #[test]
    fn test_detached_symbol_name() {
        let sym = Package::new("ephemeral").intern("ghost");
        // The package was dropped at the end of the expression above.
        assert_eq!(sym.name(), "#<detached-symbol>");
        assert!(sym.package().is_none());
    }
}
