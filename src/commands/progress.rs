//! Status stream rendering
//!
//! Messages already reach the terminal through `log`, so the spinner only
//! tracks the operation state and the latest message.

use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;
use tokio::task::{JoinError, JoinHandle};

use espforge_core::{Event, OperationState, SessionFactory};
use espforge_engine::{Engine, StatusReceiver};

/// Spinner reflecting the engine's status stream
struct StatusSpinner {
    pb: ProgressBar,
    state: OperationState,
}

impl StatusSpinner {
    fn new() -> Self {
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} [{elapsed_precise}] {prefix:.bold} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        pb.enable_steady_tick(Duration::from_millis(100));
        Self {
            pb,
            state: OperationState::Idle,
        }
    }

    fn handle(&mut self, event: &Event) {
        match event {
            Event::State(state) => {
                self.state = *state;
                self.pb.set_prefix(state.to_string());
            }
            Event::TaskStarted {
                step,
                total,
                address,
                len,
                ..
            } => {
                self.pb.set_message(format!(
                    "task {}/{}: {} bytes at 0x{:08X}",
                    step, total, len, address
                ));
            }
            other => self.pb.set_message(other.message()),
        }
    }

    fn finish(&self) {
        if self.state.is_terminal() {
            self.pb.finish_with_message(self.state.to_string());
        } else {
            self.pb.finish_and_clear();
        }
    }
}

/// Render `status` until `handle` resolves, then render what is left
///
/// Ctrl-C asks the engine to cancel; only discovery honours it.
pub async fn follow<F: SessionFactory, T>(
    engine: &Engine<F>,
    status: &mut StatusReceiver,
    mut handle: JoinHandle<T>,
) -> Result<T, JoinError> {
    let mut spinner = StatusSpinner::new();

    let result = loop {
        tokio::select! {
            result = &mut handle => break result,
            Some(event) = status.recv() => spinner.handle(&event),
            Ok(()) = tokio::signal::ctrl_c() => {
                if !engine.cancel() {
                    spinner.pb.set_message("finishing current operation");
                }
            }
        }
    };

    for event in status.drain() {
        spinner.handle(&event);
    }
    spinner.finish();
    result
}
