//! Request-scoped context.
//!
//! Each operation carries an explicit context value rather than thread-local
//! state, because futures may resume on arbitrary executor threads. The
//! context answers two questions deep code needs: "am I inside a kernel
//! request?" (kernel requests must not redundantly invalidate kernel
//! caches) and "has this request been interrupted?".

use crate::error::{FsError, FsResult};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOrigin {
    /// Delivered by the kernel bridge; the kernel maintains its own caches.
    Kernel,
    /// Initiated internally (checkout, management surface, tests).
    Internal,
}

#[derive(Clone)]
pub struct RequestContext {
    origin: RequestOrigin,
    interrupted: Arc<AtomicBool>,
}

impl RequestContext {
    pub fn kernel() -> Self {
        Self::new(RequestOrigin::Kernel)
    }

    pub fn internal() -> Self {
        Self::new(RequestOrigin::Internal)
    }

    fn new(origin: RequestOrigin) -> Self {
        RequestContext {
            origin,
            interrupted: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_kernel_request(&self) -> bool {
        self.origin == RequestOrigin::Kernel
    }

    /// A handle the bridge can use to flag an interrupt from another task.
    pub fn interrupt_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupted)
    }

    /// Polled at suspension points; interruption unwinds as a normal error.
    pub fn check_interrupt(&self) -> FsResult<()> {
        if self.interrupted.load(Ordering::Relaxed) {
            Err(FsError::Interrupted)
        } else {
            Ok(())
        }
    }
}
