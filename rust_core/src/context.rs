//! Stack of "current" context objects, one stack per context type.
//!
//! Stacks live in thread-local storage: each thread starts with empty
//! stacks and never sees another thread's contexts. A context is opened by
//! [`Context::enter`], which returns a [`Scope`]; dropping the scope (or
//! calling [`Scope::exit`]) closes it, including during unwinding.

use crate::error::ContextError;
use std::any::{type_name, Any, TypeId};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use tracing::trace;

/// Shared handle to a context object.
pub type Shared<C> = Rc<RefCell<C>>;

/// Open contexts of one type, innermost last.
#[derive(Debug)]
pub struct ContextStack<C> {
    open: Vec<Shared<C>>,
}

impl<C> Default for ContextStack<C> {
    fn default() -> Self {
        Self { open: Vec::new() }
    }
}

impl<C> ContextStack<C> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, context: Shared<C>) {
        self.open.push(context);
    }

    pub fn pop(&mut self) -> Option<Shared<C>> {
        self.open.pop()
    }

    pub fn current(&self) -> Option<Shared<C>> {
        self.open.last().cloned()
    }

    pub fn depth(&self) -> usize {
        self.open.len()
    }

    /// Remove `context` wherever it sits. Returns whether it was innermost,
    /// or `None` if it was not open.
    fn remove(&mut self, context: &Shared<C>) -> Option<bool> {
        let pos = self.open.iter().rposition(|c| Rc::ptr_eq(c, context))?;
        let innermost = pos + 1 == self.open.len();
        self.open.remove(pos);
        Some(innermost)
    }
}

thread_local! {
    static STACKS: RefCell<HashMap<TypeId, Box<dyn Any>>> = RefCell::new(HashMap::new());
}

fn with_stack<C: 'static, R>(f: impl FnOnce(&mut ContextStack<C>) -> R) -> R {
    STACKS.with(|stacks| {
        let mut stacks = stacks.borrow_mut();
        let slot = stacks
            .entry(TypeId::of::<C>())
            .or_insert_with(|| Box::new(ContextStack::<C>::new()));
        match slot.downcast_mut::<ContextStack<C>>() {
            Some(stack) => f(stack),
            // Slots are keyed by the stack's own type id.
            None => f(&mut ContextStack::new()),
        }
    })
}

/// An object that can be the ambient "current" value for its type.
pub trait Context: Sized + 'static {
    /// Make `this` the current context until the returned scope ends.
    fn enter(this: &Shared<Self>) -> Scope<Self> {
        with_stack::<Self, _>(|stack| stack.push(Rc::clone(this)));
        trace!(context = type_name::<Self>(), "enter");
        Scope {
            context: Some(Rc::clone(this)),
        }
    }

    /// The innermost open context of this type.
    fn current() -> Result<Shared<Self>, ContextError> {
        with_stack::<Self, _>(|stack| stack.current()).ok_or(ContextError::Empty {
            context: type_name::<Self>(),
        })
    }

    /// Number of open contexts of this type on the current thread.
    fn depth() -> usize {
        with_stack::<Self, _>(|stack| stack.depth())
    }
}

/// Guard for an open context. Closing it removes the context from the stack.
#[must_use = "the context closes when the scope is dropped"]
#[derive(Debug)]
pub struct Scope<C: Context> {
    context: Option<Shared<C>>,
}

impl<C: Context> Scope<C> {
    pub fn context(&self) -> Option<&Shared<C>> {
        self.context.as_ref()
    }

    /// Close the scope explicitly.
    ///
    /// Fails with `OutOfOrder` if a scope opened later is still open (this
    /// context is removed anyway), or `Empty` if nothing is open.
    pub fn exit(mut self) -> Result<(), ContextError> {
        self.close()
    }

    fn close(&mut self) -> Result<(), ContextError> {
        let Some(context) = self.context.take() else {
            return Ok(());
        };
        let removed = with_stack::<C, _>(|stack| stack.remove(&context));
        trace!(context = type_name::<C>(), "exit");
        match removed {
            Some(true) => Ok(()),
            Some(false) => Err(ContextError::OutOfOrder {
                context: type_name::<C>(),
            }),
            None => Err(ContextError::Empty {
                context: type_name::<C>(),
            }),
        }
    }
}

impl<C: Context> Drop for Scope<C> {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Run `f` with the explicitly supplied context, or with the current one
/// when `explicit` is `None`. An explicit context always wins.
pub fn with_context<C: Context, R>(
    explicit: Option<&Shared<C>>,
    f: impl FnOnce(&Shared<C>) -> R,
) -> Result<R, ContextError> {
    match explicit {
        Some(context) => Ok(f(context)),
        None => {
            let context = C::current()?;
            Ok(f(&context))
        }
    }
}
