//! Priority-based GPU job scheduling

pub mod config;
mod job_scheduler;
pub mod optimizer;
pub mod queue;
pub mod scoring;
pub mod stats;
pub mod types;

pub use config::SchedulerConfig;
pub use job_scheduler::DispatchReport;
pub use job_scheduler::GpuJobScheduler;
pub use optimizer::Band;
pub use optimizer::OptimizerConfig;
pub use scoring::ScoringWeights;
pub use types::job_fn;
pub use types::GpuJobRequest;
pub use types::GpuJobResult;
pub use types::JobCallback;
pub use types::JobContext;
pub use types::JobError;
pub use types::JobParameters;
pub use types::JobSummary;
pub use types::JobType;
pub use types::ParamValue;
