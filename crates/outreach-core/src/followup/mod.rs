//! Follow-ups - time-based rules deciding who gets re-sent to

mod engine;

pub use engine::FollowUpEngine;
