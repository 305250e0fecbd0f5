//! Hierarchical counters.
//!
//! Parents own their children, children only keep a weak link back to their parent.
//! Incrementing a counter increments every ancestor as well.

use std::{
    cell::{Cell, RefCell},
    collections::BTreeMap,
    rc::{Rc, Weak},
};

#[derive(Debug)]
pub struct Counter {
    name: String,
    count: Cell<u64>,
    parent: Weak<Counter>,
    children: RefCell<Vec<Rc<Counter>>>,
}

impl Counter {
    pub fn root(name: impl Into<String>) -> Rc<Self> {
        Rc::new(Self {
            name: name.into(),
            count: Cell::new(0),
            parent: Weak::new(),
            children: RefCell::new(Vec::new()),
        })
    }

    /// create a new counter below `self`
    pub fn child(self: &Rc<Self>, name: impl Into<String>) -> Rc<Self> {
        let child = Rc::new(Self {
            name: name.into(),
            count: Cell::new(0),
            parent: Rc::downgrade(self),
            children: RefCell::new(Vec::new()),
        });
        self.children.borrow_mut().push(Rc::clone(&child));

        child
    }

    pub fn increment(&self, by: u64) {
        self.count.set(self.count.get() + by);

        if let Some(parent) = self.parent.upgrade() {
            parent.increment(by);
        }
    }

    pub fn count(&self) -> u64 {
        self.count.get()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent(&self) -> Option<Rc<Self>> {
        self.parent.upgrade()
    }

    /// topmost ancestor, `self` if this is a root
    pub fn root_of(self: &Rc<Self>) -> Rc<Self> {
        match self.parent() {
            Some(parent) => parent.root_of(),
            None => Rc::clone(self),
        }
    }

    /// counts of the direct children by name
    pub fn children(&self) -> BTreeMap<String, u64> {
        self.children
            .borrow()
            .iter()
            .map(|child| (child.name.clone(), child.count()))
            .collect()
    }
}
