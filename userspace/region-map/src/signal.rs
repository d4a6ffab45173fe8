// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Fault-handler signal contexts.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// Counting signal receiver, owned by the fault handler.
#[derive(Debug, Default)]
pub struct SignalContext {
    pending: Mutex<u32>,
    cond: Condvar,
}

impl SignalContext {
    /// Creates a context with no pending signals.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of signals submitted and not yet taken.
    pub fn pending(&self) -> u32 {
        *self.pending.lock()
    }

    /// Consumes all pending signals and returns their number.
    pub fn take(&self) -> u32 {
        core::mem::take(&mut *self.pending.lock())
    }

    /// Blocks until a signal is pending or `timeout` expires, then consumes
    /// all pending signals.
    pub fn wait_timeout(&self, timeout: Duration) -> u32 {
        let mut pending = self.pending.lock();
        if *pending == 0 {
            let _ = self.cond.wait_for(&mut pending, timeout);
        }
        core::mem::take(&mut *pending)
    }

    fn submit(&self) {
        *self.pending.lock() += 1;
        self.cond.notify_all();
    }
}

/// Capability naming a [`SignalContext`]. May be invalid.
#[derive(Clone, Debug, Default)]
pub struct SignalContextCapability(Option<Weak<SignalContext>>);

impl SignalContextCapability {
    /// Capability that never delivers.
    pub fn invalid() -> Self {
        Self(None)
    }

    /// Returns `true` if the target context is alive.
    pub fn is_valid(&self) -> bool {
        self.0.as_ref().is_some_and(|ctx| ctx.strong_count() > 0)
    }
}

impl From<&Arc<SignalContext>> for SignalContextCapability {
    fn from(ctx: &Arc<SignalContext>) -> Self {
        Self(Some(Arc::downgrade(ctx)))
    }
}

/// Per-map fault handler registration.
#[derive(Debug, Default)]
pub(crate) struct FaultNotifier {
    context: SignalContextCapability,
}

impl FaultNotifier {
    pub(crate) fn set(&mut self, context: SignalContextCapability) {
        self.context = context;
    }

    /// Delivers one fault signal. Returns `false` if no live context is registered.
    pub(crate) fn submit(&self) -> bool {
        match self.context.0.as_ref().and_then(Weak::upgrade) {
            Some(ctx) => {
                ctx.submit();
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notifier_without_context_fails() {
        let notifier = FaultNotifier::default();
        assert!(!notifier.submit());
    }

    #[test]
    fn notifier_counts_signals() {
        let ctx = SignalContext::new();
        let mut notifier = FaultNotifier::default();
        notifier.set(SignalContextCapability::from(&ctx));
        assert!(notifier.submit());
        assert!(notifier.submit());
        assert_eq!(ctx.pending(), 2);
        assert_eq!(ctx.take(), 2);
        assert_eq!(ctx.pending(), 0);
    }

    #[test]
    fn dropped_context_disables_notifier() {
        let ctx = SignalContext::new();
        let mut notifier = FaultNotifier::default();
        let cap = SignalContextCapability::from(&ctx);
        notifier.set(cap.clone());
        drop(ctx);
        assert!(!cap.is_valid());
        assert!(!notifier.submit());
    }

    #[test]
    fn wait_timeout_returns_pending() {
        let ctx = SignalContext::new();
        assert_eq!(ctx.wait_timeout(Duration::from_millis(1)), 0);
        let cap = SignalContextCapability::from(&ctx);
        let mut notifier = FaultNotifier::default();
        notifier.set(cap);
        let waiter = {
            let ctx = Arc::clone(&ctx);
            std::thread::spawn(move || ctx.wait_timeout(Duration::from_secs(5)))
        };
        notifier.submit();
        let got = waiter.join().unwrap();
        assert!(got <= 1);
        assert_eq!(got + ctx.take(), 1);
    }
}
