//! Publish/subscribe bus between the debug adapter and its front-ends
//!
//! Inside the adapter process signals travel over a [`LocalBus`]; the same
//! signals cross the process boundary through a [`BusServer`] and
//! [`BusClient`] pair.
mod local;
mod net;
pub mod signal;

pub use local::{LocalBus, PeerId};
pub use net::{BusClient, BusServer};
pub use signal::{Command, JavaLaunch, PythonLaunch, RawSignal, Signal, SignalError};
