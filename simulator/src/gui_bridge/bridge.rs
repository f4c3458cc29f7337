use crate::gui_bridge::model::{
    ErrorReply, MetricsReply, SignalsQuery, StartReply, StartRequest,
};
use crate::workflow::runner::Runner;
use log::{info, warn};
use serde::Serialize;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use sweepcore::sweep::FrequencyTarget;
use sweepcore::CoreError;
use warp::{http::StatusCode, Filter};

pub fn default_bind_address() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9000))
}

/// Rejected input maps to 400; everything else is a server-side failure.
fn error_status(err: &anyhow::Error) -> StatusCode {
    let rejected_input = err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<CoreError>(),
            Some(CoreError::InvalidConfig(_)) | Some(CoreError::DataCorruption(_))
        )
    });
    if rejected_input {
        StatusCode::BAD_REQUEST
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    }
}

fn json_reply<T: Serialize>(
    result: anyhow::Result<T>,
) -> warp::reply::WithStatus<warp::reply::Json> {
    match result {
        Ok(body) => warp::reply::with_status(warp::reply::json(&body), StatusCode::OK),
        Err(err) => {
            let status = error_status(&err);
            warn!("bridge request failed ({}): {:#}", status, err);
            warp::reply::with_status(
                warp::reply::json(&ErrorReply {
                    error: format!("{:#}", err),
                }),
                status,
            )
        }
    }
}

fn with_runner(
    runner: Arc<Runner>,
) -> impl Filter<Extract = (Arc<Runner>,), Error = Infallible> + Clone {
    warp::any().map(move || runner.clone())
}

async fn start(
    request: StartRequest,
    runner: Arc<Runner>,
) -> Result<impl warp::Reply, Infallible> {
    let targets = match request.frequencies {
        Some(frequencies) => frequencies.into_iter().map(FrequencyTarget::mhz).collect(),
        None => runner.config().targets(),
    };
    let dwell_ms = request.dwell_ms.unwrap_or(runner.config().dwell_ms);
    let result = runner.start(targets, dwell_ms).await.map(|started| {
        info!("[bridge] start -> {}", started);
        StartReply {
            started,
            status: runner.status(),
        }
    });
    Ok(json_reply(result))
}

async fn stop(runner: Arc<Runner>) -> Result<impl warp::Reply, Infallible> {
    let result = runner.stop().await.map(|_| runner.status());
    Ok(json_reply(result))
}

async fn cleanup(runner: Arc<Runner>) -> Result<impl warp::Reply, Infallible> {
    let result = runner.cleanup().await.map(|_| runner.status());
    Ok(json_reply(result))
}

async fn health(runner: Arc<Runner>) -> Result<impl warp::Reply, Infallible> {
    let result = runner.health().await;
    let code = if result.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    Ok(warp::reply::with_status(warp::reply::json(&result), code))
}

async fn signals(
    query: SignalsQuery,
    runner: Arc<Runner>,
) -> Result<impl warp::Reply, Infallible> {
    let observer = runner.config().observer;
    let radius = query.to_radius_query(observer.lat, observer.lon);
    Ok(json_reply(runner.signals_near(&radius)))
}

async fn metrics(runner: Arc<Runner>) -> Result<impl warp::Reply, Infallible> {
    let result = runner.ingest_stats().and_then(|ingest| {
        Ok(MetricsReply {
            sweep: runner.sweep_metrics(),
            store: runner.store_metrics(),
            ingest,
            statistics: runner.statistics(None)?,
        })
    });
    Ok(json_reply(result))
}

/// Control API over one runner.
pub fn routes(
    runner: Arc<Runner>,
) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
    let status_route = warp::path("status")
        .and(warp::path::end())
        .and(warp::get())
        .and(with_runner(runner.clone()))
        .map(|runner: Arc<Runner>| warp::reply::json(&runner.status()));

    let start_route = warp::path("start")
        .and(warp::path::end())
        .and(warp::post())
        .and(warp::body::content_length_limit(16 * 1024))
        .and(warp::body::json())
        .and(with_runner(runner.clone()))
        .and_then(start);

    let stop_route = warp::path("stop")
        .and(warp::path::end())
        .and(warp::post())
        .and(with_runner(runner.clone()))
        .and_then(stop);

    let cleanup_route = warp::path("cleanup")
        .and(warp::path::end())
        .and(warp::post())
        .and(with_runner(runner.clone()))
        .and_then(cleanup);

    let health_route = warp::path("health")
        .and(warp::path::end())
        .and(warp::get())
        .and(with_runner(runner.clone()))
        .and_then(health);

    let signals_route = warp::path("signals")
        .and(warp::path::end())
        .and(warp::get())
        .and(warp::query::<SignalsQuery>())
        .and(with_runner(runner.clone()))
        .and_then(signals);

    let metrics_route = warp::path("metrics")
        .and(warp::path::end())
        .and(warp::get())
        .and(with_runner(runner))
        .and_then(metrics);

    status_route
        .or(start_route)
        .or(stop_route)
        .or(cleanup_route)
        .or(health_route)
        .or(signals_route)
        .or(metrics_route)
}

/// Serves the control API until `shutdown` resolves, then stops any sweep.
pub async fn serve(
    runner: Arc<Runner>,
    addr: SocketAddr,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let (bound, server) =
        warp::serve(routes(runner.clone())).try_bind_with_graceful_shutdown(addr, shutdown)?;
    info!("[bridge] control API listening on http://{}", bound);
    server.await;
    runner.cleanup().await?;
    info!("[bridge] control API stopped");
    Ok(())
}
