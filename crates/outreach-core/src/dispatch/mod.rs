//! Dispatch - single sends and paced batch/campaign runs

mod dispatcher;
mod stats;

pub(crate) use dispatcher::pause;
pub use dispatcher::{Dispatcher, MessageTemplate, Progress, ProgressEvent};
pub use stats::{AccountTally, CampaignStats};
