//! Streaming side: wait for staged data, build the catalog, publish forever.

use crate::catalog::discover_checked;
use crate::config::StreamConfig;
use crate::error::{AppResult, StreamError};
use crate::publisher::{LoopStats, PublicationLoop};
use crate::reader::DatasetReader;
use crate::readiness::ReadinessGate;
use crate::rotation::RotationEngine;
use crate::sink::TelemetrySink;
use tokio::sync::oneshot;
use tracing::info;

/// Wires discovery, the rotation engine and the publication loop together.
pub struct Streamer<R: DatasetReader, S: TelemetrySink> {
    config: StreamConfig,
    reader: R,
    sink: S,
}

impl<R: DatasetReader, S: TelemetrySink> Streamer<R, S> {
    /// Streamer reading through `reader` and publishing into `sink`.
    pub fn new(config: StreamConfig, reader: R, sink: S) -> Self {
        Self {
            config,
            reader,
            sink,
        }
    }

    /// Wait for readiness, discover the catalog and publish until `shutdown` fires.
    ///
    /// Fails without publishing anything if readiness times out, the catalog is empty, or
    /// shutdown arrives first. Once the loop is running only shutdown ends it.
    pub async fn run(
        self,
        gate: &dyn ReadinessGate,
        mut shutdown: oneshot::Receiver<()>,
    ) -> AppResult<LoopStats> {
        let catalog = tokio::select! {
            result = discover_checked(&self.config, gate) => result?,
            _ = &mut shutdown => return Err(StreamError::Shutdown),
        };

        let summary = catalog.summary();
        info!(
            files = summary.files(),
            good = summary.good,
            bad = summary.bad,
            total_bytes = summary.total_bytes,
            "Catalog ready: {summary}"
        );

        let settings = &self.config.streamer;
        let engine = RotationEngine::new(catalog, self.reader, settings)?;
        let publication = PublicationLoop::new(engine, self.sink, settings.tick_interval())
            .with_progress_interval(settings.progress_log_interval());

        Ok(publication.run(shutdown).await)
    }
}
