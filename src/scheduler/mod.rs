pub mod beat;
pub mod cron;
pub mod entry;

pub use beat::BeatScheduler;
