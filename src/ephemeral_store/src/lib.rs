mod config;
mod copy_engine;
mod def;
mod hashing_writer;
mod host;
mod resolver;
mod scheduler;
mod session;
mod store;

pub use config::*;
pub use copy_engine::*;
pub use def::*;
pub use hashing_writer::*;
pub use host::*;
pub use resolver::*;
pub use scheduler::*;
pub use session::*;
pub use store::*;

#[macro_use]
extern crate log;

#[cfg(test)]
mod test_support;
