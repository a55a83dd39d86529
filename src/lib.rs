//! `n2k-aggregator`: a single-process aggregation and fan-out server for
//! decoded NMEA 2000 marine-bus messages arriving as newline-delimited JSON
//! records on standard input. See `README.md`/`DESIGN.md` for the component
//! map; `src/engine.rs` is the Fan-out Engine at the center of it.

pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod io_fd;
pub mod listeners;
pub mod parser;
pub mod registry;
pub mod snapshot;
pub mod store;

pub use config::{EngineConfig, OutputMode, DEFAULT_PORT};
pub use engine::Engine;
pub use error::EngineError;
