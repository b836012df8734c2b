//! Example automations exercising the full automation API end to end.
//! Not part of the core runtime; wired up from `main.rs` the way any
//! user-supplied automation would be.

pub mod pomodoro;
pub mod porch_light;
