//! Fake Netatmo API shared by the integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    routing::post,
    Form, Router,
};
use netatmo_exporter::{
    ClientCredentials, CredentialStore, MetricProjector, Metrics, Poller, StationsClient,
    TokenAuthenticator,
};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

/// Canned status and JSON body.
#[derive(Debug, Clone)]
pub struct Reply {
    pub status: u16,
    pub body: String,
}

impl Reply {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn json(status: u16, body: serde_json::Value) -> Self {
        Self::new(status, body.to_string())
    }
}

#[derive(Debug)]
pub struct FakeState {
    pub token_calls: AtomicUsize,
    pub station_calls: AtomicUsize,
    token_reply: Mutex<Option<Reply>>,
    stations_reply: Mutex<Reply>,
    last_form: Mutex<Option<HashMap<String, String>>>,
    last_authorization: Mutex<Option<String>>,
}

/// A running fake API on 127.0.0.1 with an ephemeral port.
pub struct FakeNetatmo {
    pub base: String,
    pub state: Arc<FakeState>,
    stop: Option<oneshot::Sender<()>>,
}

impl FakeNetatmo {
    pub async fn start() -> Self {
        let state = Arc::new(FakeState {
            token_calls: AtomicUsize::new(0),
            station_calls: AtomicUsize::new(0),
            token_reply: Mutex::new(None),
            stations_reply: Mutex::new(Reply::json(200, stations_body())),
            last_form: Mutex::new(None),
            last_authorization: Mutex::new(None),
        });

        let app = Router::new()
            .route("/oauth2/token", post(token))
            .route("/api/getstationsdata", post(stations))
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop, stopped) = oneshot::channel::<()>();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    stopped.await.ok();
                })
                .await
                .ok();
        });

        Self {
            base: format!("http://{}", addr),
            state,
            stop: Some(stop),
        }
    }

    pub fn token_url(&self) -> String {
        format!("{}/oauth2/token", self.base)
    }

    pub fn stations_url(&self) -> String {
        format!("{}/api/getstationsdata", self.base)
    }

    /// Fix the token endpoint answer. Without one, every call issues
    /// `access-N` / `refresh-N` for the N-th call.
    pub fn set_token_reply(&self, reply: Reply) {
        *self.state.token_reply.lock().unwrap() = Some(reply);
    }

    pub fn set_stations_reply(&self, reply: Reply) {
        *self.state.stations_reply.lock().unwrap() = reply;
    }

    pub fn token_calls(&self) -> usize {
        self.state.token_calls.load(Ordering::SeqCst)
    }

    pub fn station_calls(&self) -> usize {
        self.state.station_calls.load(Ordering::SeqCst)
    }

    pub fn last_form(&self) -> HashMap<String, String> {
        self.state.last_form.lock().unwrap().clone().unwrap_or_default()
    }

    pub fn last_authorization(&self) -> Option<String> {
        self.state.last_authorization.lock().unwrap().clone()
    }

    pub fn credentials(&self) -> ClientCredentials {
        ClientCredentials {
            client_id: "client-id".to_string(),
            client_secret: "client-secret".to_string(),
            refresh_token: "seed-refresh".to_string(),
        }
    }

    pub fn authenticator(&self, token_file: &Path) -> TokenAuthenticator {
        TokenAuthenticator::new(
            reqwest::Client::new(),
            self.token_url(),
            self.credentials(),
            CredentialStore::new(token_file),
        )
    }

    pub fn stations_client(&self) -> StationsClient {
        StationsClient::new(reqwest::Client::new(), self.stations_url())
    }

    pub fn poller(&self, token_file: &Path, interval: Duration) -> (Poller, Arc<Metrics>) {
        let metrics = Arc::new(Metrics::new().unwrap());
        let poller = Poller::new(
            self.authenticator(token_file),
            self.stations_client(),
            MetricProjector::new(metrics.clone()),
            interval,
        );
        (poller, metrics)
    }
}

impl Drop for FakeNetatmo {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            stop.send(()).ok();
        }
    }
}

async fn token(
    State(state): State<Arc<FakeState>>,
    Form(form): Form<HashMap<String, String>>,
) -> impl IntoResponse {
    let n = state.token_calls.fetch_add(1, Ordering::SeqCst) + 1;
    *state.last_form.lock().unwrap() = Some(form);

    let reply = state.token_reply.lock().unwrap().clone().unwrap_or_else(|| {
        Reply::json(
            200,
            json!({
                "access_token": format!("access-{}", n),
                "refresh_token": format!("refresh-{}", n),
                "expires_in": 10800,
            }),
        )
    });
    respond(reply)
}

async fn stations(State(state): State<Arc<FakeState>>, headers: HeaderMap) -> impl IntoResponse {
    state.station_calls.fetch_add(1, Ordering::SeqCst);
    *state.last_authorization.lock().unwrap() = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let reply = state.stations_reply.lock().unwrap().clone();
    respond(reply)
}

fn respond(reply: Reply) -> impl IntoResponse {
    let status = StatusCode::from_u16(reply.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, [(header::CONTENT_TYPE, "application/json")], reply.body)
}

/// One station "S1" with an outdoor module, as returned by `getstationsdata`.
pub fn stations_body() -> serde_json::Value {
    json!({
        "body": {
            "devices": [{
                "_id": "70:ee:50:00:00:01",
                "station_name": "S1",
                "home_name": "Home",
                "module_name": "Indoor",
                "type": "NAMain",
                "reachable": true,
                "wifi_status": 56,
                "place": {
                    "city": "Berlin",
                    "country": "DE",
                    "timezone": "Europe/Berlin",
                    "altitude": 34,
                    "location": [7.5, 51.2]
                },
                "dashboard_data": {
                    "time_utc": 1700000000,
                    "Temperature": 21.5,
                    "temp_trend": "up",
                    "Humidity": 48,
                    "CO2": 612,
                    "Pressure": 1013.2,
                    "pressure_trend": "stable"
                },
                "modules": [{
                    "_id": "02:00:00:00:00:01",
                    "module_name": "Outdoor",
                    "type": "NAModule1",
                    "battery_percent": 80,
                    "rf_status": 60,
                    "reachable": true,
                    "dashboard_data": {
                        "time_utc": 1700000000,
                        "Temperature": 9.5,
                        "Humidity": 55
                    }
                }]
            }]
        },
        "status": "ok"
    })
}

/// Poll `check` until it holds or a five second deadline passes.
pub async fn wait_for(mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}
