//! Handlers shipped with the engine.

mod dead_letter_cleanup;
mod external_worker_complete;

use std::sync::Arc;

pub use dead_letter_cleanup::DeadLetterCleanupTask;
pub use external_worker_complete::{EXTERNAL_WORKER_COMPLETE, ExternalWorkerCompleteHandler};

use crate::jobs::registry::JobHandlerRegistry;

/// Register every built-in handler
pub fn register_builtin(registry: &mut JobHandlerRegistry) {
    registry
        .register::<DeadLetterCleanupTask>()
        .register_handler(Arc::new(ExternalWorkerCompleteHandler));
}
