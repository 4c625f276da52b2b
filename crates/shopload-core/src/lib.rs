pub mod client;
pub mod config;
pub mod driver;
pub mod oracle;
pub mod ramp;
pub mod run;
pub mod stats;
pub mod verifier;

pub use client::*;
pub use config::*;
pub use driver::*;
pub use oracle::*;
pub use ramp::*;
pub use run::*;
pub use stats::*;
pub use verifier::*;
