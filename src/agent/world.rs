use crate::conversation::Conversation;
use crate::tools::SharedRegistry;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Per-run context threaded through evaluation. The conversation and
/// registry are shared handles; the tool-call counter drives periodic
/// context pruning; the cancellation token is checked at every recursive
/// entry and between I/O operations.
pub struct World {
    pub conversation: Arc<Conversation>,
    pub registry: SharedRegistry,
    pub tool_calls: usize,
    pub prune_threshold: usize,
    pub cancel: CancellationToken,
}

impl World {
    pub fn new(
        conversation: Arc<Conversation>,
        registry: SharedRegistry,
        cancel: CancellationToken,
        prune_threshold: usize,
    ) -> Self {
        Self {
            conversation,
            registry,
            tool_calls: 0,
            prune_threshold,
            cancel,
        }
    }
}
