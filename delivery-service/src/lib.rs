//! Real-time delivery engine: fans events out across a fleet of server
//! processes, tracks per-recipient delivery records, and falls back to a
//! retrying queue whenever the bus cannot carry a send.

pub mod clock;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod fanout;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod presence;
pub mod queue;
pub mod registry;
pub mod rooms;
pub mod state;

pub use config::Config;
pub use error::{DeliveryError, DeliveryResult};
pub use state::ProcessContext;
