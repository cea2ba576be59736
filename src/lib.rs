//! # Vibration Stream
//!
//! Library behind the `vibration-stream` binary. It stages a corpus of industrial vibration
//! recordings onto shared storage and replays it, batch by batch, as live telemetry.
//!
//! Two cooperating processes use it:
//!
//! - the **stager** fetches the corpus (git clone or local copy), copies the accepted
//!   machines and operations into `<root>/<machine>/<operation>/<good|bad>/`, writes a
//!   readiness marker, then monitors the volume;
//! - the **streamer** waits for the marker, builds a deterministic catalog of data files and
//!   publishes fixed-size batches of the X/Y/Z axes at a fixed rate, looping forever.
//!
//! ## Crate Structure
//!
//! - **`config`**: figment-based configuration (TOML file plus `VIBRATION_STREAM_*` env vars).
//! - **`error`**: the `StreamError` enum and `AppResult` alias.
//! - **`logging`**: tracing subscriber setup (pretty, compact or JSON output).
//! - **`readiness`**: the `ReadinessGate` trait and its filesystem `FileMarker`.
//! - **`stager`**: the staging state machine, `Fetcher` implementations and health monitor.
//! - **`catalog`**: filename parsing, directory scan, filtering and ordering.
//! - **`reader`**: the `DatasetReader` seam with HDF5 and in-memory implementations.
//! - **`rotation`**: the cursor-driven `RotationEngine` that yields batches.
//! - **`sink`**: the `TelemetrySink` seam with logging and in-memory sinks.
//! - **`publisher`**: the fixed-interval `PublicationLoop`.
//! - **`streamer`**: wiring from readiness to the publication loop.

pub mod catalog;
pub mod config;
pub mod error;
pub mod logging;
pub mod publisher;
pub mod reader;
pub mod readiness;
pub mod rotation;
pub mod sink;
pub mod stager;
pub mod streamer;

pub use error::{AppResult, StreamError};
