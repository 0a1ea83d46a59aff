//! Lexical environments: singly-linked chains of activation frames.
//!
//! Each frame is an ordered sequence of value slots; a variable position
//! is the pair (frame index, slot index), with frame 0 the innermost.
//! Frames outlive the call that created them exactly when a closure
//! captured them, which the `Rc` links express directly.

use crate::value::Value;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

/// Position of a lexical variable: how many frames outward, and which
/// slot within that frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VarPos {
    pub frame: usize,
    pub slot: usize,
}

/// One activation frame. Slot count equals the number of named parameters
/// of the function that built it, plus one for a rest slot when the
/// parameter list is dotted.
pub struct Frame {
    slots: RefCell<Vec<Value>>,
    parent: Option<Rc<Frame>>,
}

impl Frame {
    /// Create a frame of `size` nil-filled slots linked to `parent`.
    pub fn new(size: usize, parent: Option<Rc<Frame>>) -> Rc<Frame> {
        Rc::new(Frame {
            slots: RefCell::new(vec![Value::Nil; size]),
            parent,
        })
    }

    pub fn parent(&self) -> Option<Rc<Frame>> {
        self.parent.clone()
    }

    pub fn len(&self) -> usize {
        self.slots.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.borrow().is_empty()
    }

    /// Write a slot in this frame directly.
    pub fn set_slot(&self, slot: usize, value: Value) {
        self.slots.borrow_mut()[slot] = value;
    }

    /// Read the value at `pos`, walking outward from this frame.
    pub fn lookup(&self, pos: VarPos) -> Option<Value> {
        let frame = self.walk_out(pos.frame)?;
        frame.slots.borrow().get(pos.slot).cloned()
    }

    /// Write the value at `pos`, walking outward from this frame. Returns
    /// false when the position does not exist.
    pub fn assign(&self, pos: VarPos, value: Value) -> bool {
        match self.walk_out(pos.frame) {
            Some(frame) => {
                let mut slots = frame.slots.borrow_mut();
                match slots.get_mut(pos.slot) {
                    Some(slot) => {
                        *slot = value;
                        true
                    }
                    None => false,
                }
            }
            None => false,
        }
    }

    fn walk_out(&self, depth: usize) -> Option<&Frame> {
        let mut cursor = self;
        for _ in 0..depth {
            cursor = cursor.parent.as_deref()?;
        }
        Some(cursor)
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Frames can sit inside reference cycles with captured closures,
        // so the debug form stays shallow.
        write!(f, "Frame(slots={}, chained={})", self.len(), self.parent.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain() -> Rc<Frame> {
        // outer: (10 20), inner: (1)
        let outer = Frame::new(2, None);
        outer.set_slot(0, Value::Int(10));
        outer.set_slot(1, Value::Int(20));
        let inner = Frame::new(1, Some(outer));
        inner.set_slot(0, Value::Int(1));
        inner
    }

    #[test]
    fn test_lookup_walks_outward() {
        let env = chain();
        assert_eq!(env.lookup(VarPos { frame: 0, slot: 0 }), Some(Value::Int(1)));
        assert_eq!(env.lookup(VarPos { frame: 1, slot: 1 }), Some(Value::Int(20)));
        assert_eq!(env.lookup(VarPos { frame: 2, slot: 0 }), None);
        assert_eq!(env.lookup(VarPos { frame: 0, slot: 5 }), None);
    }

    #[test]
    fn test_assign_is_visible_through_shared_frames() {
        let env = chain();
        let sibling = Frame::new(0, env.parent());
        assert!(env.assign(VarPos { frame: 1, slot: 0 }, Value::Int(99)));
        // The outer frame is shared, so the sibling chain observes the write.
        assert_eq!(
            sibling.lookup(VarPos { frame: 1, slot: 0 }),
            Some(Value::Int(99))
        );
    }

    #[test]
    fn test_assign_rejects_missing_positions() {
        let env = chain();
        assert!(!env.assign(VarPos { frame: 5, slot: 0 }, Value::Nil));
        assert!(!env.assign(VarPos { frame: 0, slot: 9 }, Value::Nil));
    }
}
