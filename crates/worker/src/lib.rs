pub mod config;
pub mod jobs;
pub mod mailer;
pub mod telemetry;

// Re-export main types
pub use config::WorkerConfig;
pub use jobs::{discovered_modules, JobContext};
pub use mailer::{EmailAttachment, EmailMessage, LogMailer, Mailer, MailerError};
pub use telemetry::{init_telemetry, TelemetryConfig};
