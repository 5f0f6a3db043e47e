pub mod buffer;
pub mod clock;
pub mod config;
pub mod control;
pub mod coordinator;
pub mod device;
pub mod media;
pub mod queue;
pub mod sink;
pub mod status;
pub mod time;
