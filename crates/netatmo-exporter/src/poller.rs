//! Poll loop: authenticate → fetch → project → sleep.
//!
//! Exactly one cycle is in flight at a time. Transient failures skip the
//! rest of the cycle and wait one interval; fatal ones end the loop with an
//! error. The shutdown signal is checked at the top of every cycle and raced
//! against the sleep, so in-flight HTTP calls always complete.

use reqwest::header::HeaderMap;
use std::time::Duration;
use tokio::sync::watch;

use crate::api::{RawTopology, StationsClient};
use crate::auth::TokenAuthenticator;
use crate::error::{ExporterError, Result};
use crate::metrics::MetricProjector;
use crate::topology::normalize;

/// Where the loop currently is.
#[derive(Debug)]
pub enum PollState {
    Authenticating,
    Fetching(HeaderMap),
    Projecting(RawTopology),
    Sleeping,
    ShuttingDown,
    Fatal(ExporterError),
}

impl PollState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PollState::ShuttingDown | PollState::Fatal(_))
    }
}

/// Summary of one completed projection pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollReport {
    pub stations: usize,
    pub failed_readings: usize,
}

/// Drives the session, the fetcher and the projector on a fixed interval.
pub struct Poller {
    auth: TokenAuthenticator,
    stations: StationsClient,
    projector: MetricProjector,
    interval: Duration,
    last_report: Option<PollReport>,
}

impl Poller {
    pub fn new(
        auth: TokenAuthenticator,
        stations: StationsClient,
        projector: MetricProjector,
        interval: Duration,
    ) -> Self {
        Self {
            auth,
            stations,
            projector,
            interval,
            last_report: None,
        }
    }

    pub fn authenticator(&self) -> &TokenAuthenticator {
        &self.auth
    }

    /// Report of the most recent successful projection, if any.
    pub fn last_report(&self) -> Option<PollReport> {
        self.last_report
    }

    /// Run until shutdown (`Ok`) or a fatal error (`Err`).
    pub async fn run(mut self, mut shutdown: watch::Receiver<()>) -> Result<()> {
        log::info!(
            "Polling Netatmo every {} second(s)",
            self.interval.as_secs()
        );

        let mut state = PollState::Authenticating;
        while !state.is_terminal() {
            state = self.step(state, &mut shutdown).await;
        }

        match state {
            PollState::Fatal(e) => {
                log::error!("{}", e);
                Err(e)
            }
            _ => {
                log::info!("Poll loop stopped");
                Ok(())
            }
        }
    }

    /// Perform one state transition.
    pub async fn step(
        &mut self,
        state: PollState,
        shutdown: &mut watch::Receiver<()>,
    ) -> PollState {
        match state {
            PollState::Authenticating => {
                if shutdown_requested(shutdown) {
                    return PollState::ShuttingDown;
                }
                match self.auth.ensure_valid_headers().await {
                    Ok(headers) => PollState::Fetching(headers),
                    Err(e) => self.on_error(e),
                }
            }
            PollState::Fetching(headers) => match self.stations.fetch(headers).await {
                Ok(devices) => PollState::Projecting(devices),
                Err(e) => {
                    if matches!(e, ExporterError::Auth(_)) {
                        self.auth.invalidate();
                    }
                    self.on_error(e)
                }
            },
            PollState::Projecting(devices) => {
                let topology = normalize(&devices);
                let errors = self.projector.project_all(&topology);
                let report = PollReport {
                    stations: topology.len(),
                    failed_readings: errors.len(),
                };
                log::debug!(
                    "Projected {} station(s), {} reading(s) skipped",
                    report.stations,
                    report.failed_readings
                );
                self.last_report = Some(report);
                PollState::Sleeping
            }
            PollState::Sleeping => {
                tokio::select! {
                    biased;
                    _ = shutdown.changed() => {
                        log::info!("Shutdown signal received");
                        PollState::ShuttingDown
                    }
                    _ = tokio::time::sleep(self.interval) => PollState::Authenticating,
                }
            }
            terminal => terminal,
        }
    }

    fn on_error(&self, e: ExporterError) -> PollState {
        if e.is_fatal() {
            return PollState::Fatal(e);
        }

        let secs = self.interval.as_secs();
        match &e {
            ExporterError::JsonDecode(_) => {
                log::error!("JSON Decode Error. Retry in {} second(s)...", secs)
            }
            ExporterError::Throttling => {
                log::error!("API Throttling. Retry in {} second(s)...", secs)
            }
            ExporterError::Auth(_) => {
                log::error!("{}. Retry in {} second(s)...", e, secs)
            }
            _ => log::error!("API Error. Retry in {} second(s)...", secs),
        }
        log::debug!("{}", e);
        PollState::Sleeping
    }
}

/// Whether shutdown was signalled. A dropped sender counts as shutdown.
fn shutdown_requested(shutdown: &mut watch::Receiver<()>) -> bool {
    shutdown.has_changed().unwrap_or(true)
}
