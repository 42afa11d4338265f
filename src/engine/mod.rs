//! The processing engine: one pass over the unseen messages
//! ([`runner`]) and the reconnecting loop around it ([`resilient`]).

pub mod resilient;
pub mod runner;

use std::sync::Arc;

use crate::handlers::SentLog;
use crate::outbound::MessageSender;
use crate::proxy::ContentProxy;

pub use resilient::{
    Backoff, LoopPhase, LoopSettings, LoopState, relay_shutdown, run_forever, run_single_pass,
};
pub use runner::{PassFailure, PassReport, run_once};

/// Services handlers reach outside the mailbox.
///
/// Lives as long as the loop, so `sent` carries across passes and
/// reconnects.
#[derive(Clone)]
pub struct Collaborators {
    pub sender: Arc<dyn MessageSender>,
    pub proxy: Option<Arc<ContentProxy>>,
    pub sent: Arc<SentLog>,
}

impl Collaborators {
    pub fn new(sender: Arc<dyn MessageSender>) -> Self {
        Self {
            sender,
            proxy: None,
            sent: Arc::new(SentLog::default()),
        }
    }

    pub fn with_proxy(mut self, proxy: Arc<ContentProxy>) -> Self {
        self.proxy = Some(proxy);
        self
    }
}
