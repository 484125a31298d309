use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::json;
use std::net::SocketAddr;
use std::thread;
use sweepcore::pipeline::ResultPublisher;
use tokio::runtime::Builder;
use warp::{http::StatusCode, Filter};

/// Default address the display collaborator polls.
pub fn gui_bind_address() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9000))
}

fn latest<T: Serialize>(value: Option<T>, what: &str) -> warp::reply::WithStatus<warp::reply::Json> {
    match value {
        Some(value) => warp::reply::with_status(warp::reply::json(&value), StatusCode::OK),
        None => warp::reply::with_status(
            warp::reply::json(&json!({ "error": format!("no {} published yet", what) })),
            StatusCode::NOT_FOUND,
        ),
    }
}

/// `GET /detection`, `GET /metadata` and `GET /calibration`, each answering
/// with the latest value the pipeline published.
pub fn routes(
    publisher: ResultPublisher,
) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
    let publisher_filter = warp::any().map(move || publisher.clone());

    let detection_route = warp::path("detection")
        .and(warp::path::end())
        .and(warp::get())
        .and(publisher_filter.clone())
        .map(|publisher: ResultPublisher| latest(publisher.detection().borrow().clone(), "detection"));

    let metadata_route = warp::path("metadata")
        .and(warp::path::end())
        .and(warp::get())
        .and(publisher_filter.clone())
        .map(|publisher: ResultPublisher| latest(publisher.metadata().borrow().clone(), "metadata"));

    let calibration_route = warp::path("calibration")
        .and(warp::path::end())
        .and(warp::get())
        .and(publisher_filter)
        .map(|publisher: ResultPublisher| {
            let statuses = publisher.calibration().borrow().clone();
            warp::reply::json(&statuses)
        });

    detection_route.or(metadata_route).or(calibration_route)
}

/// Hosts the result endpoints on a background thread.
pub struct GuiBridge {
    address: SocketAddr,
}

impl GuiBridge {
    /// Binds `address` (port 0 picks a free one) and starts serving.
    pub fn spawn(address: SocketAddr, publisher: ResultPublisher) -> Result<Self> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .context("building bridge runtime")?;
        let (bound, server) = runtime
            .block_on(async { warp::serve(routes(publisher)).try_bind_ephemeral(address) })
            .with_context(|| format!("binding result bridge to {}", address))?;

        thread::spawn(move || {
            runtime.block_on(server);
        });
        log::info!("result bridge listening on http://{}", bound);
        Ok(Self { address: bound })
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }
}
