//! Memoized selectors over snapshots.
//!
//! `compute` pairs an input function, which picks the parts of the state a
//! derived value depends on, with a result function that derives the value.
//! The result is recomputed only when some input is not identical to the one
//! seen last time. Shared values compare by pointer, which is what makes this
//! cheap: snapshots keep the `Arc` of every entity that did not change.

use std::cell::{Cell, RefCell};
use std::fmt::{self, Debug};
use std::marker::PhantomData;
use std::rc::Rc;
use std::sync::Arc;

/// Identity comparison for memo inputs.
///
/// Shared pointers are identical when they point at the same allocation.
/// Plain values are identical when they are equal.
pub trait Identity {
    /// Returns true if `self` and `other` are the same input.
    fn same(&self, other: &Self) -> bool;
}

impl<T: ?Sized> Identity for Arc<T> {
    fn same(&self, other: &Self) -> bool {
        Arc::ptr_eq(self, other)
    }
}

impl<T: ?Sized> Identity for Rc<T> {
    fn same(&self, other: &Self) -> bool {
        Rc::ptr_eq(self, other)
    }
}

impl<T: Identity> Identity for Option<T> {
    fn same(&self, other: &Self) -> bool {
        match (self, other) {
            (Some(a), Some(b)) => a.same(b),
            (None, None) => true,
            _ => false,
        }
    }
}

impl<T: Identity> Identity for Vec<T> {
    fn same(&self, other: &Self) -> bool {
        self.len() == other.len() && self.iter().zip(other.iter()).all(|(a, b)| a.same(b))
    }
}

impl Identity for () {
    fn same(&self, _: &Self) -> bool {
        true
    }
}

macro_rules! impl_identity_eq {
    ($($ty:ty),*) => {
        $(
            impl Identity for $ty {
                fn same(&self, other: &Self) -> bool {
                    self == other
                }
            }
        )*
    };
}

impl_identity_eq!(bool, char, u8, u16, u32, u64, usize, i8, i16, i32, i64, isize, f32, f64, String);

macro_rules! impl_identity_tuple {
    ($($name:ident => $idx:tt),*) => {
        impl<$($name: Identity),*> Identity for ($($name,)*) {
            fn same(&self, other: &Self) -> bool {
                $(self.$idx.same(&other.$idx))&&*
            }
        }
    };
}

impl_identity_tuple!(A => 0);
impl_identity_tuple!(A => 0, B => 1);
impl_identity_tuple!(A => 0, B => 1, C => 2);
impl_identity_tuple!(A => 0, B => 1, C => 2, D => 3);
impl_identity_tuple!(A => 0, B => 1, C => 2, D => 3, E => 4);
impl_identity_tuple!(A => 0, B => 1, C => 2, D => 3, E => 4, F => 5);

/// A memoized selector built by `compute`.
pub struct Memo<S: ?Sized, I, F, T, R> {
    inputs: I,
    result: F,
    cache: RefCell<Option<(T, R)>>,
    runs: Cell<usize>,
    _state: PhantomData<fn(&S)>,
}

/// Build a memoized selector.
///
/// ```
/// # use std::sync::Arc;
/// # use stately::{compute, Entity, Snapshot};
/// let kitties = compute(
///     |state: &Arc<Snapshot>| state.get("k1").cloned(),
///     |k1| k1.as_ref().map(|k| k.id().to_owned()),
/// );
///
/// let state = Arc::new(Snapshot::empty().with(Entity::new("k1", "kitty")));
/// assert_eq!(kitties.get(&state), Some("k1".to_owned()));
/// assert_eq!(kitties.get(&state), Some("k1".to_owned()));
/// assert_eq!(kitties.runs(), 1);
/// ```
pub fn compute<S, I, F, T, R>(inputs: I, result: F) -> Memo<S, I, F, T, R>
    where S: ?Sized,
          I: Fn(&S) -> T,
          F: Fn(&T) -> R,
          T: Identity,
          R: Clone
{
    Memo {
        inputs,
        result,
        cache: RefCell::new(None),
        runs: Cell::new(0),
        _state: PhantomData,
    }
}

impl<S, I, F, T, R> Memo<S, I, F, T, R>
    where S: ?Sized,
          I: Fn(&S) -> T,
          F: Fn(&T) -> R,
          T: Identity,
          R: Clone
{
    /// Get the derived value for a state, recomputing only if an input changed.
    pub fn get(&self, state: &S) -> R {
        let inputs = (self.inputs)(state);
        if let Some((last, value)) = &*self.cache.borrow() {
            if last.same(&inputs) {
                return value.clone();
            }
        }

        let value = (self.result)(&inputs);
        self.runs.set(self.runs.get() + 1);
        *self.cache.borrow_mut() = Some((inputs, value.clone()));
        value
    }

    /// The number of times the result function has run.
    pub fn runs(&self) -> usize {
        self.runs.get()
    }

    /// Forget the cached value.
    pub fn clear(&self) {
        self.cache.borrow_mut().take();
    }
}

impl<S: ?Sized, I, F, T, R> Debug for Memo<S, I, F, T, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Memo(runs: {}, cached: {})", self.runs.get(), self.cache.borrow().is_some())
    }
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use crate::entity::Entity;
    use crate::snapshot::Snapshot;

    use super::*;

    #[test]
    fn test_identity() {
        let a = Arc::new(1);
        let b = Arc::new(1);
        assert!(a.same(&a.clone()));
        assert!(!a.same(&b));
        assert!((1u32, "x".to_owned()).same(&(1u32, "x".to_owned())));
        assert!(!(1u32, a.clone()).same(&(1u32, b.clone())));
        assert!(vec![a.clone()].same(&vec![a.clone()]));
        assert!(!vec![a.clone()].same(&vec![a.clone(), a.clone()]));
        assert!(Some(a.clone()).same(&Some(a.clone())));
        assert!(!Some(a.clone()).same(&None));
        assert!(!f64::NAN.same(&f64::NAN));
    }

    #[test]
    fn test_recomputes_on_change() {
        let memo = compute(
            |state: &Arc<Snapshot>| state.get("k1").cloned(),
            |k1| k1.as_ref().and_then(|k| k.get("lives").cloned()),
        );

        let first = Arc::new(Snapshot::empty()
            .with(Entity::new("k1", "kitty").with("lives", 9))
            .with(Entity::new("d1", "doggo")));
        assert_eq!(memo.get(&first), Some(json!(9)));
        assert_eq!(memo.runs(), 1);

        // A different snapshot that shares k1 hits the cache.
        let mut second = (*first).clone();
        second.insert(Entity::new("d1", "doggo").with("good", true));
        let second = Arc::new(second);
        assert_eq!(memo.get(&second), Some(json!(9)));
        assert_eq!(memo.runs(), 1);

        let mut third = (*second).clone();
        third.insert(Entity::new("k1", "kitty").with("lives", 8));
        assert_eq!(memo.get(&Arc::new(third)), Some(json!(8)));
        assert_eq!(memo.runs(), 2);

        memo.clear();
        assert_eq!(memo.get(&second), Some(json!(9)));
        assert_eq!(memo.runs(), 3);
    }

    #[test]
    fn test_unit_inputs_run_once() {
        let memo = compute(|_: &Snapshot| (), |_| 42);
        let state = Snapshot::empty();
        assert_eq!(memo.get(&state), 42);
        assert_eq!(memo.get(&state.with(Entity::new("a", "t"))), 42);
        assert_eq!(memo.runs(), 1);
    }

    #[test]
    fn test_independent_memos() {
        let make = || compute(|state: &Arc<Snapshot>| state.clone(), |state| state.len());
        let a = make();
        let b = make();
        let state = Arc::new(Snapshot::empty());

        a.get(&state);
        a.get(&state);
        b.get(&state);
        assert_eq!((a.runs(), b.runs()), (1, 1));
    }
}
