use tracing::Span;
use uuid::Uuid;

/// Per-invocation logging handle.
///
/// Each batch invocation builds one and hands it to the stages it runs; their
/// events are recorded inside `span`, tagged with the job name and run id.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: Uuid,
    span: Span,
}

impl RunContext {
    pub fn new(job: &'static str) -> Self {
        let run_id = Uuid::new_v4();
        let span = tracing::info_span!("batch", job, run_id = %run_id);
        Self { run_id, span }
    }

    pub fn span(&self) -> &Span {
        &self.span
    }
}
