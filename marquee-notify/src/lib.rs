pub mod mailer;
pub mod pipeline;

pub use mailer::{MailError, Mailer, MailtrapMailer};
pub use pipeline::{DeliveryOutcome, MailPipeline, PipelineConfig};
