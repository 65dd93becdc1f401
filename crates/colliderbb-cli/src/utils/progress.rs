use colliderbb::engine::progress::{Progress, ProgressCallback};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};

const SPINNER_TICK_MS: u64 = 80;

/// What the bar is currently showing, so that stage and phase names survive
/// the bar being reset for a counted task.
struct BarState {
    bar: ProgressBar,
    stage: Option<u8>,
    phase: Option<&'static str>,
}

impl BarState {
    fn prefix(&self) -> String {
        self.stage.map(|s| format!("[{:02}] ", s)).unwrap_or_default()
    }

    fn apply(&mut self, event: Progress) {
        match event {
            Progress::StageStart { stage, name } => {
                self.stage = Some(stage);
                self.bar.println(format!("── stage {:02}: {}", stage, name));
            }
            Progress::StageFinish { stage } => {
                self.stage = None;
                self.bar.println(format!("── stage {:02} checkpoint written", stage));
            }
            Progress::PhaseStart { name } => {
                self.phase = Some(name);
                self.bar.reset();
                self.bar.set_length(0);
                self.bar.set_style(spinner_style());
                self.bar.set_prefix(self.prefix());
                self.bar.set_message(name);
                self.bar.enable_steady_tick(Duration::from_millis(SPINNER_TICK_MS));
            }
            Progress::PhaseFinish => {
                self.bar.disable_steady_tick();
                let done = match self.phase.take() {
                    Some(name) => format!("✓ {}", name),
                    None => "✓ Done".to_string(),
                };
                self.bar.finish_with_message(done);
            }
            Progress::TaskStart { total_steps } => {
                self.bar.disable_steady_tick();
                self.bar.reset();
                self.bar.set_style(bar_style());
                self.bar.set_prefix(self.prefix());
                self.bar.set_length(total_steps);
                self.bar.set_position(0);
                if let Some(name) = self.phase {
                    self.bar.set_message(name);
                }
            }
            Progress::TaskIncrement => self.bar.inc(1),
            Progress::TaskFinish => {
                if let Some(length) = self.bar.length() {
                    self.bar.set_position(length);
                }
                self.bar.finish();
            }
            Progress::Message(msg) => {
                info!("{}", msg);
                if self.bar.is_finished() {
                    self.bar.set_message(msg);
                } else {
                    self.bar.println(format!("   {}", msg));
                }
            }
        }
    }
}

fn spinner_style() -> ProgressStyle {
    ProgressStyle::with_template("{prefix}{spinner:.green} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}

fn bar_style() -> ProgressStyle {
    ProgressStyle::with_template("{prefix}{msg:<28} [{bar:32.cyan/blue}] {pos}/{len}")
        .map(|style| style.progress_chars("=> "))
        .unwrap_or_else(|_| ProgressStyle::default_bar())
}

/// Renders engine progress events on stderr. Clones share the same bar.
#[derive(Clone)]
pub struct CliProgressHandler {
    state: Arc<Mutex<BarState>>,
}

impl CliProgressHandler {
    pub fn new() -> Self {
        let bar = ProgressBar::with_draw_target(Some(0), ProgressDrawTarget::stderr());
        bar.finish_and_clear();
        Self {
            state: Arc::new(Mutex::new(BarState {
                bar,
                stage: None,
                phase: None,
            })),
        }
    }

    pub fn get_callback(&self) -> ProgressCallback<'static> {
        let state = Arc::clone(&self.state);
        Box::new(move |event: Progress| match state.lock() {
            Ok(mut guard) => guard.apply(event),
            Err(_) => warn!("Progress state lock was poisoned; dropping event."),
        })
    }
}

impl Default for CliProgressHandler {
    fn default() -> Self {
        Self::new()
    }
}
