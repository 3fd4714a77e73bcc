//! Progress reporting for pipeline passes.

/// Callback surface for per-item pass progress.
pub trait PassProgress: Send + Sync {
    /// Called when entering a new phase of a pass.
    fn phase(&self, name: &str);
    /// Called once per processed item.
    fn item(&self, current: usize, total: usize, detail: &str);
}

/// No-op reporter for headless/test usage.
pub struct SilentProgress;

impl PassProgress for SilentProgress {
    fn phase(&self, _name: &str) {}
    fn item(&self, _current: usize, _total: usize, _detail: &str) {}
}
