/// Events emitted while the engine works through a collider, for display by the caller.
#[derive(Debug, Clone)]
pub enum Progress {
    StageStart { stage: u8, name: &'static str },
    StageFinish { stage: u8 },

    PhaseStart { name: &'static str },
    PhaseFinish,

    TaskStart { total_steps: u64 },
    TaskIncrement,
    TaskFinish,

    Message(String),
}

pub type ProgressCallback<'a> = Box<dyn Fn(Progress) + Send + Sync + 'a>;

#[derive(Default)]
pub struct ProgressReporter<'a> {
    callback: Option<ProgressCallback<'a>>,
}

impl<'a> ProgressReporter<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_callback(callback: ProgressCallback<'a>) -> Self {
        Self {
            callback: Some(callback),
        }
    }

    #[inline]
    pub fn report(&self, event: Progress) {
        if let Some(cb) = &self.callback {
            cb(event);
        }
    }

    /// Wraps `task` between `PhaseStart` and `PhaseFinish` events; the finish event is
    /// only sent when the task succeeds.
    pub fn phase<T, E>(&self, name: &'static str, task: impl FnOnce() -> Result<T, E>) -> Result<T, E> {
        self.report(Progress::PhaseStart { name });
        let result = task()?;
        self.report(Progress::PhaseFinish);
        Ok(result)
    }
}
