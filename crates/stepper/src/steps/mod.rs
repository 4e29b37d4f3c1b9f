//! Steps provided by the engine.

mod cancel_jobs;

pub use cancel_jobs::CancelJobsStep;
