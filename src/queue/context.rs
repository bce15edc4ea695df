use std::sync::atomic::{AtomicU8, Ordering};

use crate::message::{MessageHeaders, SenderPrincipal};

const UNDECIDED: u8 = 0;
const ACKNOWLEDGED: u8 = 1;
const REJECTED: u8 = 2;

/// Per-attempt view of a queued message given to the listener.
///
/// The first call to [`acknowledge`](Self::acknowledge) or
/// [`reject`](Self::reject) wins; later calls are ignored.
#[derive(Debug)]
pub struct QueuedMessageContext {
    headers: MessageHeaders,
    principal: Option<SenderPrincipal>,
    attempt: u32,
    outcome: AtomicU8,
}

impl QueuedMessageContext {
    pub fn new(headers: MessageHeaders, principal: Option<SenderPrincipal>, attempt: u32) -> Self {
        Self {
            headers,
            principal,
            attempt,
            outcome: AtomicU8::new(UNDECIDED),
        }
    }

    pub fn headers(&self) -> &MessageHeaders {
        &self.headers
    }

    pub fn principal(&self) -> Option<&SenderPrincipal> {
        self.principal.as_ref()
    }

    /// 1-based number of the current delivery attempt.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn acknowledge(&self) {
        self.decide(ACKNOWLEDGED);
    }

    /// Marks the attempt as failed even when auto-acknowledgement is on.
    pub fn reject(&self) {
        self.decide(REJECTED);
    }

    pub fn is_acknowledged(&self) -> bool {
        self.outcome.load(Ordering::Acquire) == ACKNOWLEDGED
    }

    pub fn is_rejected(&self) -> bool {
        self.outcome.load(Ordering::Acquire) == REJECTED
    }

    fn decide(&self, outcome: u8) {
        let _ = self.outcome.compare_exchange(
            UNDECIDED,
            outcome,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }
}
