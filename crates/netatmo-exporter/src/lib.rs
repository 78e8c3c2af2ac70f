//! Netatmo weather station exporter
//!
//! Polls the Netatmo station data API on a fixed interval and republishes
//! the readings as Prometheus gauges.
//!
//! # Architecture
//!
//! - [`auth`]: OAuth2 refresh-token session, persisted through [`credentials`]
//! - [`api`]: device listing fetch and error classification
//! - [`topology`]: normalisation of the nested station/module tree
//! - [`metrics`]: gauge registry and projection of a topology onto it
//! - [`poller`]: the authenticate → fetch → project → sleep loop
//! - [`server`]: HTTP `/metrics` endpoint

pub mod api;
pub mod auth;
pub mod config;
pub mod credentials;
pub mod error;
pub mod metrics;
pub mod poller;
pub mod server;
pub mod topology;

pub use api::{http_client, StationsClient};
pub use auth::TokenAuthenticator;
pub use config::{ClientCredentials, Config, ConfigSource};
pub use credentials::{CredentialStore, Credentials};
pub use error::{ExporterError, Result};
pub use metrics::{MetricProjector, Metrics};
pub use poller::{PollReport, PollState, Poller};
pub use topology::{normalize, Topology};
