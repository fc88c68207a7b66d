pub mod attempt;
pub mod clock;
pub mod config;
pub mod error;
pub mod record;
pub mod source;
pub mod time;

pub use attempt::{AttemptStatus, ParseAttempt, ParseMode, ParseOutcome, PersistReport, ResumePoint};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{Config, SchedulerConfig};
pub use error::{ConfigError, ErrorKind};
pub use record::{Attachment, MessageId, Reaction, Record};
pub use source::{Association, Source, SourceId, TenantId};
pub use time::StorageTimestamp;
