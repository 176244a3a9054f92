//! Deferred release of resources acquired during an install.
//!
//! Each stage that acquires an external resource pushes a matching release
//! action; the stack runs unconditionally when the pipeline returns, on
//! success and on failure alike, and folds cleanup failures into the
//! reported result instead of dropping them.

use anyhow::Result;

type CleanupFn = Box<dyn FnOnce() -> Result<()>>;

/// A stack of cleanup actions, executed in reverse order of registration.
#[derive(Default)]
pub(crate) struct CleanupStack {
    actions: Vec<CleanupFn>,
}

impl CleanupStack {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register `action` to run when the stack unwinds. The action is
    /// invoked at most once.
    pub(crate) fn push<F>(&mut self, action: F)
    where
        F: FnOnce() -> Result<()> + 'static,
    {
        self.actions.push(Box::new(action));
    }

    /// Run every registered action in LIFO order, exactly once, regardless
    /// of `result`. A failing action does not stop the remaining ones.
    ///
    /// If `result` is already an error it stays the primary error, with any
    /// cleanup failures attached as context; otherwise the first cleanup
    /// failure becomes the returned error.
    pub(crate) fn run(mut self, result: Result<()>) -> Result<()> {
        let mut failures = Vec::new();
        while let Some(action) = self.actions.pop() {
            if let Err(err) = action() {
                tracing::warn!("Cleanup failure: {err:#}");
                failures.push(err);
            }
        }
        match result {
            Err(err) => Err(failures
                .into_iter()
                .fold(err, |err, failure| err.context(format!("cleanup failed: {failure:#}")))),
            Ok(()) => {
                let mut failures = failures.into_iter();
                match failures.next() {
                    None => Ok(()),
                    Some(first) => Err(failures.fold(first, |err, failure| {
                        err.context(format!("cleanup also failed: {failure:#}"))
                    })),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn test_runs_in_reverse_order() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let mut stack = CleanupStack::new();
        for i in 0..3 {
            let seen = Rc::clone(&seen);
            stack.push(move || {
                seen.borrow_mut().push(i);
                Ok(())
            });
        }
        stack.run(Ok(())).unwrap();
        assert_eq!(*seen.borrow(), vec![2, 1, 0]);
    }

    #[test]
    fn test_empty_stack_passes_result_through() {
        assert!(CleanupStack::new().run(Ok(())).is_ok());
        let err = CleanupStack::new().run(Err(anyhow!("boom"))).unwrap_err();
        assert_eq!(format!("{err}"), "boom");
    }

    #[test]
    fn test_cleanup_failure_becomes_error_on_success() {
        let mut stack = CleanupStack::new();
        stack.push(|| Err(anyhow!("unmount failed")));
        let err = stack.run(Ok(())).unwrap_err();
        assert!(format!("{err:#}").contains("unmount failed"));
    }

    #[test]
    fn test_incoming_error_keeps_priority() {
        let mut stack = CleanupStack::new();
        stack.push(|| Err(anyhow!("unmount failed")));
        let err = stack.run(Err(anyhow!("walk failed"))).unwrap_err();
        let rendered = format!("{err:#}");
        assert!(rendered.contains("walk failed"), "{rendered}");
        assert!(rendered.contains("unmount failed"), "{rendered}");
    }

    #[test]
    fn test_all_actions_run_despite_failure() {
        let seen = Rc::new(RefCell::new(0));
        let mut stack = CleanupStack::new();
        {
            let seen = Rc::clone(&seen);
            stack.push(move || {
                *seen.borrow_mut() += 1;
                Ok(())
            });
        }
        stack.push(|| Err(anyhow!("middle failed")));
        {
            let seen = Rc::clone(&seen);
            stack.push(move || {
                *seen.borrow_mut() += 1;
                Ok(())
            });
        }
        assert!(stack.run(Ok(())).is_err());
        assert_eq!(*seen.borrow(), 2);
    }
}
