//! Owning and non-owning handle slots.
//!
//! Every resource proxy keeps its raw handle in a [`Slot`]. A slot is either
//! an owner, which releases the handle exactly once, or a reference, whose
//! release is a no-op. Emptying a slot (by [`Slot::take`], explicit release or
//! giving up the raw handle) leaves a sentinel behind: every later access
//! fails with [`Error::UseAfterRelease`] before the platform is touched.

use std::fmt;

use crate::error::{Error, Result};
use crate::runtime::Runtime;

/// Whether a proxy releases its resource when dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Ownership {
    /// The proxy destroys the resource.
    Owned,
    /// The resource is owned elsewhere (or is platform-implicit).
    Borrowed,
}

impl Ownership {
    /// True for [`Ownership::Owned`].
    #[inline]
    pub fn is_owned(self) -> bool {
        self == Ownership::Owned
    }
}

/// Storage for a raw handle plus its ownership tag.
pub(crate) struct Slot<H> {
    raw: Option<H>,
    ownership: Ownership,
    kind: &'static str,
}

impl<H: Copy + fmt::Display> Slot<H> {
    pub(crate) fn new(raw: H, ownership: Ownership, kind: &'static str) -> Self {
        Self {
            raw: Some(raw),
            ownership,
            kind,
        }
    }

    /// The raw handle, or `UseAfterRelease` for a sentinel.
    #[inline]
    pub(crate) fn get(&self) -> Result<H> {
        self.raw.ok_or(Error::UseAfterRelease {
            resource: self.kind,
        })
    }

    #[inline]
    pub(crate) fn is_live(&self) -> bool {
        self.raw.is_some()
    }

    #[inline]
    pub(crate) fn ownership(&self) -> Ownership {
        self.ownership
    }

    /// Move the handle (and its ownership) out, leaving a sentinel.
    pub(crate) fn take(&mut self) -> Slot<H> {
        Slot {
            raw: self.raw.take(),
            ownership: self.ownership,
            kind: self.kind,
        }
    }

    /// A non-owning slot naming the same handle.
    pub(crate) fn borrowed(&self) -> Result<Slot<H>> {
        Ok(Slot {
            raw: Some(self.get()?),
            ownership: Ownership::Borrowed,
            kind: self.kind,
        })
    }

    /// Give up the handle without releasing it.
    pub(crate) fn relinquish(&mut self) -> Result<H> {
        self.raw.take().ok_or(Error::UseAfterRelease {
            resource: self.kind,
        })
    }

    /// Release now, propagating failures. The slot is a sentinel afterwards
    /// even if the release failed.
    pub(crate) fn release_with<F>(&mut self, release: F) -> Result<()>
    where
        F: FnOnce(H) -> Result<()>,
    {
        let raw = self.relinquish()?;
        if self.ownership.is_owned() {
            release(raw)
        } else {
            Ok(())
        }
    }

    /// Best-effort release for `Drop`: failures are reported, never raised.
    pub(crate) fn drop_with<F>(&mut self, runtime: &Runtime, release: F)
    where
        F: FnOnce(H) -> Result<()>,
    {
        if let Some(raw) = self.raw.take() {
            if self.ownership.is_owned() {
                if let Err(e) = release(raw) {
                    runtime.report_release_failure(self.kind, &raw, &e);
                }
            }
        }
    }
}

impl<H: fmt::Debug> fmt::Debug for Slot<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.raw {
            Some(raw) => write!(f, "{:?} ({:?})", raw, self.ownership),
            None => write!(f, "<released {}>", self.kind),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::StreamHandle;
    use proptest::prelude::*;
    use std::cell::Cell;

    #[test]
    fn test_take_leaves_sentinel() {
        let mut slot = Slot::new(StreamHandle(7), Ownership::Owned, "stream");
        let moved = slot.take();

        assert!(!slot.is_live());
        assert!(matches!(
            slot.get(),
            Err(Error::UseAfterRelease { resource: "stream" })
        ));
        assert_eq!(moved.get().unwrap(), StreamHandle(7));
        assert_eq!(moved.ownership(), Ownership::Owned);
    }

    #[test]
    fn test_release_runs_once() {
        let calls = Cell::new(0);
        let mut slot = Slot::new(StreamHandle(1), Ownership::Owned, "stream");

        slot.release_with(|_| {
            calls.set(calls.get() + 1);
            Ok(())
        })
        .unwrap();
        let second = slot.release_with(|_| {
            calls.set(calls.get() + 1);
            Ok(())
        });

        assert_eq!(calls.get(), 1);
        assert!(matches!(second, Err(Error::UseAfterRelease { .. })));
    }

    #[test]
    fn test_borrowed_release_is_noop() {
        let owner = Slot::new(StreamHandle(3), Ownership::Owned, "stream");
        let mut reference = owner.borrowed().unwrap();

        reference
            .release_with(|_| panic!("a reference must not release"))
            .unwrap();
        assert!(owner.is_live());
    }

    #[test]
    fn test_relinquish_skips_release() {
        let mut slot = Slot::new(StreamHandle(9), Ownership::Owned, "stream");
        assert_eq!(slot.relinquish().unwrap(), StreamHandle(9));
        assert!(slot.relinquish().is_err());
    }

    #[derive(Debug, Clone, Copy)]
    enum Step {
        Take,
        Release,
        Relinquish,
        Borrow,
    }

    fn step() -> impl Strategy<Value = Step> {
        prop_oneof![
            Just(Step::Take),
            Just(Step::Release),
            Just(Step::Relinquish),
            Just(Step::Borrow),
        ]
    }

    proptest! {
        #[test]
        fn test_owned_handle_released_at_most_once(
            steps in proptest::collection::vec(step(), 0..32)
        ) {
            let releases = Cell::new(0u32);
            let mut chain = vec![Slot::new(StreamHandle(5), Ownership::Owned, "stream")];

            for step in steps {
                let last = chain.len() - 1;
                match step {
                    Step::Take => {
                        let moved = chain[last].take();
                        chain.push(moved);
                    }
                    Step::Release => {
                        let _ = chain[last].release_with(|_| {
                            releases.set(releases.get() + 1);
                            Ok(())
                        });
                    }
                    Step::Relinquish => {
                        let _ = chain[last].relinquish();
                    }
                    Step::Borrow => {
                        if let Ok(mut reference) = chain[last].borrowed() {
                            prop_assert_eq!(reference.ownership(), Ownership::Borrowed);
                            let released = reference.release_with(|_| {
                                releases.set(releases.get() + 100);
                                Ok(())
                            });
                            prop_assert!(released.is_ok());
                        }
                    }
                }
                prop_assert!(chain.iter().filter(|slot| slot.is_live()).count() <= 1);
                for earlier in &chain[..chain.len() - 1] {
                    prop_assert!(!earlier.is_live());
                }
            }

            prop_assert!(releases.get() <= 1);
            if releases.get() == 1 {
                prop_assert!(chain.iter().all(|slot| !slot.is_live()));
            }
        }
    }
}
