//! Draw feedback: cancellation, preview mode and progress notifications.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::Notify;

/// Shared between the caller of a draw and the download handlers.
///
/// Cancelling wakes every task waiting in [`Feedback::cancelled`].
#[derive(Debug, Default)]
pub struct Feedback {
    canceled: AtomicBool,
    notify: Notify,
    preview_only: bool,
    render_partial_output: bool,
    new_data: AtomicU64,
    errors: Mutex<Vec<String>>,
}

impl Feedback {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feedback of a preview draw: only cached tiles are used.
    pub fn preview() -> Self {
        Self {
            preview_only: true,
            ..Self::default()
        }
    }

    pub fn with_partial_output(mut self, render_partial_output: bool) -> Self {
        self.render_partial_output = render_partial_output;
        self
    }

    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }

    /// Resolves once the feedback is cancelled.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_canceled() {
                return;
            }
            notified.await;
        }
    }

    pub fn is_preview_only(&self) -> bool {
        self.preview_only
    }

    pub fn render_partial_output(&self) -> bool {
        self.render_partial_output
    }

    /// Signal that more of the image is available.
    pub fn on_new_data(&self) {
        self.new_data.fetch_add(1, Ordering::Relaxed);
    }

    pub fn new_data_count(&self) -> u64 {
        self.new_data.load(Ordering::Relaxed)
    }

    pub fn append_error(&self, error: impl Into<String>) {
        if let Ok(mut errors) = self.errors.lock() {
            errors.push(error.into());
        }
    }

    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready, task};

    #[test]
    fn test_cancel_wakes_waiter() {
        let feedback = Feedback::new();
        let mut waiter = task::spawn(feedback.cancelled());
        assert_pending!(waiter.poll());

        feedback.cancel();
        assert!(waiter.is_woken());
        assert_ready!(waiter.poll());
        assert!(feedback.is_canceled());
    }

    #[tokio::test]
    async fn test_already_cancelled() {
        let feedback = Feedback::preview();
        feedback.cancel();
        feedback.cancelled().await;
        assert!(feedback.is_preview_only());
        assert!(!feedback.render_partial_output());
    }

    #[test]
    fn test_errors_and_new_data() {
        let feedback = Feedback::new().with_partial_output(true);
        feedback.on_new_data();
        feedback.on_new_data();
        feedback.append_error("boom");
        assert_eq!(feedback.new_data_count(), 2);
        assert_eq!(feedback.errors(), vec!["boom".to_string()]);
        assert!(feedback.render_partial_output());
    }
}
