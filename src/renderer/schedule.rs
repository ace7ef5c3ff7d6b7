use std::cell::Cell;

/// Host hook asking for one animation-frame callback.
pub trait FrameScheduler {
    fn request_frame(&self);
}

/// Need-repaint flag shared by the canvas and its render-list listener.
/// Requests made before the scheduled frame runs fold into that frame.
pub struct RepaintRequest {
    needed: Cell<bool>,
    scheduler: Option<Box<dyn FrameScheduler>>,
}

impl RepaintRequest {
    pub fn new(scheduler: Box<dyn FrameScheduler>) -> Self {
        Self {
            needed: Cell::new(false),
            scheduler: Some(scheduler),
        }
    }

    /// A request flag with nobody to notify.
    pub fn detached() -> Self {
        Self {
            needed: Cell::new(false),
            scheduler: None,
        }
    }

    pub fn request(&self) {
        if self.needed.replace(true) {
            return;
        }
        if let Some(scheduler) = &self.scheduler {
            scheduler.request_frame();
        }
    }

    pub fn is_needed(&self) -> bool {
        self.needed.get()
    }

    /// Clears the flag, returning whether a repaint was pending.
    pub fn take(&self) -> bool {
        self.needed.replace(false)
    }

    /// Supersedes a pending repaint before its frame fires.
    pub fn cancel(&self) {
        self.needed.set(false);
    }
}
