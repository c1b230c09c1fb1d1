pub mod keeper;
mod persist;

pub use keeper::{CompletedTimer, KeeperOptions, RecoveryReport, TimerSessionKeeper};
