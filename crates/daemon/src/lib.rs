//! Queue-routing daemon: one supervisor fanning notifications out to a
//! worker per routing key, plus a poller releasing due delayed records.

pub mod poller;
pub mod supervisor;
pub mod worker;

pub use supervisor::{Supervisor, SupervisorConfig, SupervisorExit};
pub use worker::{Lifeline, WorkerExit};
