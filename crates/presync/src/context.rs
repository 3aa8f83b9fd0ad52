//! Explicit collaborator bundle for the presentation pipeline.
//!
//! Everything the pipeline touches - the display backend, the reference
//! clock, the host counter, and the configuration - is passed in through
//! this context object. There is no process-wide state: two pipelines with
//! two contexts coexist without interfering.

use std::sync::Arc;

use crate::config::PresentConfig;
use crate::frame::{HostClock, PresentationBackend, ReferenceClock, SystemClock};

/// Collaborators and configuration handed to
/// [`PresentScheduler::spawn`](crate::scheduler::PresentScheduler::spawn).
///
/// Construction order is the documentation: the backend and clocks must
/// outlive the scheduler, which the `Arc`s enforce.
pub struct PresentationContext<B: PresentationBackend> {
    pub backend: Arc<B>,
    pub reference: Arc<dyn ReferenceClock>,
    pub host: Arc<dyn HostClock>,
    pub config: PresentConfig,
}

impl<B: PresentationBackend> PresentationContext<B> {
    /// Creates a context with the system monotonic clock and default config.
    pub fn new(backend: Arc<B>, reference: Arc<dyn ReferenceClock>) -> Self {
        Self {
            backend,
            reference,
            host: Arc::new(SystemClock::new()),
            config: PresentConfig::default(),
        }
    }

    /// Substitutes the host counter (synthetic clocks in tests).
    pub fn with_host(mut self, host: Arc<dyn HostClock>) -> Self {
        self.host = host;
        self
    }

    pub fn with_config(mut self, config: PresentConfig) -> Self {
        self.config = config;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{ClockSample, Frame, PresentError};

    struct NullBackend;

    impl PresentationBackend for NullBackend {
        type Image = ();

        fn present(&self, _frame: &Frame<()>) -> Result<(), PresentError> {
            Ok(())
        }
        fn scanline(&self) -> Result<u32, PresentError> {
            Ok(0)
        }
        fn nominal_refresh_hz(&self) -> f64 {
            60.0
        }
        fn screen_height(&self) -> u32 {
            1080
        }
    }

    struct NullClock;

    impl ReferenceClock for NullClock {
        fn query(&self) -> Option<ClockSample> {
            None
        }
    }

    #[test]
    fn test_builder_replaces_config() {
        let context = PresentationContext::new(Arc::new(NullBackend), Arc::new(NullClock))
            .with_config(PresentConfig::default().without_correction());
        assert!(!context.config.correction_enabled);
    }
}
