pub mod controller;
pub mod keepalive;
pub mod media;
pub mod signal_queue;

pub use controller::{ConnectionState, Controller, ControllerEvent, Intent, Notice};
