//! Kind-keyed dispatch table for inbound messages.
//!
//! Global handlers run first, then the handlers registered for the
//! message's kind, both in registration order. A handler that fails or
//! panics is logged and skipped; the rest still run.
//!
//! Handlers receive a mutable context `C` (the room session state), so
//! they run on the session's event loop and never need locks.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};

use crate::protocol::{Message, MessageKind};

/// Error returned by a failing handler.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

pub type Handler<C> = Box<dyn FnMut(&mut C, &Message) -> Result<(), HandlerError> + Send>;

/// Token returned by registration; pass to [`MessageRouter::unregister`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// Outcome of one dispatch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub invoked: usize,
    pub failed: usize,
}

pub struct MessageRouter<C> {
    global: Vec<(HandlerId, Handler<C>)>,
    by_kind: HashMap<MessageKind, Vec<(HandlerId, Handler<C>)>>,
    next_id: u64,
}

impl<C> Default for MessageRouter<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> MessageRouter<C> {
    pub fn new() -> Self {
        Self {
            global: Vec::new(),
            by_kind: HashMap::new(),
            next_id: 0,
        }
    }

    fn allocate_id(&mut self) -> HandlerId {
        self.next_id += 1;
        HandlerId(self.next_id)
    }

    pub fn register_handler<F>(&mut self, kind: MessageKind, handler: F) -> HandlerId
    where
        F: FnMut(&mut C, &Message) -> Result<(), HandlerError> + Send + 'static,
    {
        let id = self.allocate_id();
        self.by_kind
            .entry(kind)
            .or_default()
            .push((id, Box::new(handler)));
        id
    }

    /// Register a handler that sees every message.
    pub fn register_global_handler<F>(&mut self, handler: F) -> HandlerId
    where
        F: FnMut(&mut C, &Message) -> Result<(), HandlerError> + Send + 'static,
    {
        let id = self.allocate_id();
        self.global.push((id, Box::new(handler)));
        id
    }

    /// Remove a handler. Returns false if it was already gone.
    pub fn unregister(&mut self, id: HandlerId) -> bool {
        let before = self.handler_count();
        self.global.retain(|(h, _)| *h != id);
        for handlers in self.by_kind.values_mut() {
            handlers.retain(|(h, _)| *h != id);
        }
        self.by_kind.retain(|_, handlers| !handlers.is_empty());
        self.handler_count() != before
    }

    pub fn clear(&mut self) {
        self.global.clear();
        self.by_kind.clear();
    }

    pub fn handler_count(&self) -> usize {
        self.global.len() + self.by_kind.values().map(Vec::len).sum::<usize>()
    }

    pub fn dispatch(&mut self, ctx: &mut C, message: &Message) -> DispatchReport {
        let kind = message.kind();
        let mut report = DispatchReport::default();

        for (id, handler) in self.global.iter_mut() {
            run_handler(*id, handler, ctx, message, &mut report);
        }

        match self.by_kind.get_mut(&kind) {
            Some(handlers) => {
                for (id, handler) in handlers.iter_mut() {
                    run_handler(*id, handler, ctx, message, &mut report);
                }
            }
            None => log::debug!("No handlers for {kind} from {}", message.sender()),
        }

        report
    }
}

fn run_handler<C>(
    id: HandlerId,
    handler: &mut Handler<C>,
    ctx: &mut C,
    message: &Message,
    report: &mut DispatchReport,
) {
    report.invoked += 1;
    match catch_unwind(AssertUnwindSafe(|| handler(ctx, message))) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            report.failed += 1;
            log::error!("Handler {id:?} failed on {}: {e}", message.kind());
        }
        Err(panic) => {
            report.failed += 1;
            let reason = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            log::error!("Handler {id:?} panicked on {}: {reason}", message.kind());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ParticipantId;

    fn text(s: &str) -> Message {
        Message::text_update(ParticipantId::new("a"), s)
    }

    #[test]
    fn test_handlers_run_in_registration_order() {
        let mut router: MessageRouter<Vec<&'static str>> = MessageRouter::new();
        router.register_handler(MessageKind::TextUpdate, |log, _| {
            log.push("first");
            Ok(())
        });
        router.register_handler(MessageKind::TextUpdate, |log, _| {
            log.push("second");
            Ok(())
        });
        router.register_global_handler(|log, _| {
            log.push("global");
            Ok(())
        });

        let mut log = Vec::new();
        let report = router.dispatch(&mut log, &text("x"));

        assert_eq!(log, vec!["global", "first", "second"]);
        assert_eq!(report, DispatchReport { invoked: 3, failed: 0 });
    }

    #[test]
    fn test_failing_handler_does_not_block_others() {
        let mut router: MessageRouter<Vec<&'static str>> = MessageRouter::new();
        router.register_handler(MessageKind::TextUpdate, |_, _| Err("boom".into()));
        router.register_handler(MessageKind::TextUpdate, |log, _| {
            log.push("second");
            Ok(())
        });

        let mut log = Vec::new();
        let report = router.dispatch(&mut log, &text("x"));

        assert_eq!(log, vec!["second"]);
        assert_eq!(report.failed, 1);
    }

    #[test]
    fn test_panicking_handler_is_isolated() {
        let mut router: MessageRouter<u32> = MessageRouter::new();
        router.register_handler(MessageKind::TextUpdate, |_, _| panic!("handler bug"));
        router.register_handler(MessageKind::TextUpdate, |count, _| {
            *count += 1;
            Ok(())
        });

        let mut count = 0;
        let report = router.dispatch(&mut count, &text("x"));

        assert_eq!(count, 1);
        assert_eq!(report, DispatchReport { invoked: 2, failed: 1 });
    }

    #[test]
    fn test_only_matching_kind_runs() {
        let mut router: MessageRouter<u32> = MessageRouter::new();
        router.register_handler(MessageKind::FileRequest, |count, _| {
            *count += 1;
            Ok(())
        });

        let mut count = 0;
        let report = router.dispatch(&mut count, &text("x"));
        assert_eq!(count, 0);
        assert_eq!(report.invoked, 0);
    }

    #[test]
    fn test_unregister() {
        let mut router: MessageRouter<u32> = MessageRouter::new();
        let id = router.register_handler(MessageKind::TextUpdate, |count, _| {
            *count += 1;
            Ok(())
        });
        let global = router.register_global_handler(|count, _| {
            *count += 10;
            Ok(())
        });
        assert_eq!(router.handler_count(), 2);

        assert!(router.unregister(id));
        assert!(!router.unregister(id));

        let mut count = 0;
        router.dispatch(&mut count, &text("x"));
        assert_eq!(count, 10);

        router.unregister(global);
        assert_eq!(router.handler_count(), 0);
    }

    #[test]
    fn test_handler_sees_message() {
        let mut router: MessageRouter<String> = MessageRouter::new();
        router.register_handler(MessageKind::TextUpdate, |out, msg| {
            if let Message::TextUpdate { data, .. } = msg {
                out.push_str(data);
            }
            Ok(())
        });

        let mut out = String::new();
        router.dispatch(&mut out, &text("hello"));
        assert_eq!(out, "hello");
    }
}
