//! HTTP server: JSON routes, the progress event stream and static files

use std::convert::Infallible;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures_util::StreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{error, info, warn};
use warp::filters::body::BodyDeserializeError;
use warp::http::StatusCode;
use warp::reply::Response;
use warp::sse::Event;
use warp::{Filter, Rejection, Reply};

use crate::download::{self, Engine, JobRegistry, Quality};
use crate::error::AppError;
use crate::protocol::{
    error_codes, CancelRequest, DownloadRequest, DownloadStarted, ErrorBody, FetchRequest,
    FetchResponse, InfoResponse, MessageBody, StreamQuery,
};

/// Largest accepted JSON request body
const MAX_BODY_BYTES: u64 = 16 * 1024;

/// How long open connections may keep the server alive after shutdown starts
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Server configuration
pub struct ServerConfig {
    pub host: IpAddr,
    pub port: u16,
    pub engine: Engine,
    /// `yt-dlp --version` as probed at startup
    pub engine_version: Option<String>,
    pub download_dir: PathBuf,
    pub static_dir: Option<PathBuf>,
}

/// State shared by every request handler
pub struct AppState {
    pub engine: Engine,
    pub engine_version: Option<String>,
    pub registry: JobRegistry,
    pub download_dir: PathBuf,
    shutdown: watch::Sender<bool>,
}

impl AppState {
    pub fn new(engine: Engine, engine_version: Option<String>, download_dir: PathBuf) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            engine,
            engine_version,
            registry: JobRegistry::new(),
            download_dir,
            shutdown,
        }
    }

    /// Tell every open progress stream to end
    pub fn begin_shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Resolves once shutdown has begun
    pub fn stopping(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut rx = self.shutdown.subscribe();
        async move {
            let _ = rx.wait_for(|stopping| *stopping).await;
        }
    }
}

/// Run the HTTP server until Ctrl-C, then stop every download
pub async fn run(config: ServerConfig) -> Result<()> {
    let addr = SocketAddr::new(config.host, config.port);
    let state = Arc::new(AppState::new(
        config.engine,
        config.engine_version,
        config.download_dir,
    ));

    let (bound, server) = serve(state, config.static_dir, addr, shutdown_signal())?;
    info!("HTTP server listening on http://{}", bound);
    server.await;
    Ok(())
}

/// Bind `addr` and return the bound address with the future that serves it.
///
/// Once `signal` fires, progress streams end and detached jobs are killed.
/// The future completes when connections have drained, or after
/// [`SHUTDOWN_GRACE`] if some never do.
pub fn serve<S>(
    state: Arc<AppState>,
    static_dir: Option<PathBuf>,
    addr: SocketAddr,
    signal: S,
) -> Result<(SocketAddr, impl Future<Output = ()>)>
where
    S: Future<Output = ()> + Send + 'static,
{
    let api = routes(state.clone(), static_dir);

    let stop = {
        let state = state.clone();
        async move {
            signal.await;
            state.begin_shutdown();
            stop_jobs(&state.registry).await;
        }
    };
    let (bound, server) = warp::serve(api).try_bind_with_graceful_shutdown(addr, stop)?;

    let stopping = state.stopping();
    let done = async move {
        tokio::select! {
            _ = server => {}
            _ = async {
                stopping.await;
                tokio::time::sleep(SHUTDOWN_GRACE).await;
            } => {
                warn!("Connections still open after {:?}, closing them", SHUTDOWN_GRACE);
            }
        }
        // Jobs started while connections were draining
        stop_jobs(&state.registry).await;
    };

    Ok((bound, done))
}

async fn stop_jobs(registry: &JobRegistry) {
    let jobs = registry.drain();
    if !jobs.is_empty() {
        info!("Stopping {} running download(s)", jobs.len());
    }
    for job in jobs {
        if let Err(e) = job.terminate().await {
            warn!("Failed to stop job {}: {}", job.id(), e);
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Cannot listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested, stopping server...");
}

/// All routes, with error recovery, CORS and request tracing applied
pub fn routes(
    state: Arc<AppState>,
    static_dir: Option<PathBuf>,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let with_state = warp::any().map(move || state.clone());

    let fetch = warp::path!("api" / "fetch")
        .and(warp::post())
        .and(json_body::<FetchRequest>())
        .and(with_state.clone())
        .then(handle_fetch);

    let download = warp::path!("api" / "download")
        .and(warp::post())
        .and(json_body::<DownloadRequest>())
        .and(with_state.clone())
        .then(handle_download);

    let stream = warp::path!("api" / "download" / "stream")
        .and(warp::get())
        .and(warp::query::<StreamQuery>())
        .and(with_state.clone())
        .then(handle_stream);

    let status = warp::path!("api" / "download" / String)
        .and(warp::get())
        .and(with_state.clone())
        .then(handle_status);

    let cancel = warp::path!("api" / "cancel")
        .and(warp::post())
        .and(json_body::<CancelRequest>())
        .and(with_state.clone())
        .then(handle_cancel);

    let info = warp::path!("api" / "info")
        .and(warp::get())
        .and(with_state)
        .then(handle_info);

    let api = fetch
        .or(download)
        .unify()
        .or(stream)
        .unify()
        .or(status)
        .unify()
        .or(cancel)
        .unify()
        .or(info)
        .unify();

    let static_files = warp::get()
        .and(warp::any().map(move || static_dir.clone()))
        .and_then(|dir: Option<PathBuf>| async move {
            match dir {
                Some(dir) => Ok(dir),
                None => Err(warp::reject::not_found()),
            }
        })
        .and(warp::path::tail())
        .and_then(serve_static);

    let cors = warp::cors()
        .allow_any_origin()
        .allow_methods(vec!["GET", "POST", "OPTIONS"])
        .allow_headers(vec!["Content-Type"]);

    api.or(static_files)
        .unify()
        .recover(handle_rejection)
        .unify()
        .with(cors)
        .with(warp::trace::request())
}

fn json_body<T>() -> impl Filter<Extract = (T,), Error = Rejection> + Clone
where
    T: DeserializeOwned + Send,
{
    warp::body::content_length_limit(MAX_BODY_BYTES).and(warp::body::json())
}

fn json_reply<T: Serialize>(body: &T) -> Response {
    warp::reply::json(body).into_response()
}

fn respond<T: Serialize>(result: Result<T, AppError>) -> Response {
    match result {
        Ok(body) => json_reply(&body),
        Err(e) => e.into_response(),
    }
}

async fn handle_fetch(req: FetchRequest, state: Arc<AppState>) -> Response {
    let url = match req.url.as_deref().map(str::trim).filter(|u| !u.is_empty()) {
        Some(url) => url.to_string(),
        None => return AppError::input("URL is required.").into_response(),
    };

    respond(
        download::fetch_listing(&state.engine, &url)
            .await
            .map(|(channel, videos)| FetchResponse { channel, videos }),
    )
}

async fn handle_download(req: DownloadRequest, state: Arc<AppState>) -> Response {
    let video_id = match download::validate_video_id(req.video_id.as_deref()) {
        Ok(id) => id.to_string(),
        Err(e) => return e.into_response(),
    };

    respond(
        download::launch_detached(&state.engine, &state.registry, &state.download_dir, &video_id)
            .await
            .map(|id| DownloadStarted {
                message: "Download started.".to_string(),
                job_id: id.to_string(),
            }),
    )
}

async fn handle_stream(query: StreamQuery, state: Arc<AppState>) -> Response {
    let video_id = match download::validate_video_id(query.video_id.as_deref()) {
        Ok(id) => id.to_string(),
        Err(e) => return e.into_response(),
    };
    let quality = match Quality::parse_optional(query.quality.as_deref()) {
        Ok(q) => q,
        Err(e) => return e.into_response(),
    };

    // Ending the stream drops it, which stops the engine
    let events = download::stream_download(&state.engine, &state.download_dir, &video_id, quality)
        .await
        .take_until(state.stopping())
        .map(|event| Event::default().json_data(event));

    warp::sse::reply(warp::sse::keep_alive().stream(events)).into_response()
}

async fn handle_status(job_id: String, state: Arc<AppState>) -> Response {
    respond(download::poll_job(&state.registry, &job_id).await)
}

async fn handle_cancel(req: CancelRequest, state: Arc<AppState>) -> Response {
    let job_id = match req.job_id.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        Some(id) => id.to_string(),
        None => return AppError::input("Task ID is required.").into_response(),
    };

    respond(
        download::cancel_job(&state.registry, &job_id)
            .await
            .map(|()| MessageBody::new("Download canceled.")),
    )
}

async fn handle_info(state: Arc<AppState>) -> Response {
    json_reply(&InfoResponse {
        version: env!("CARGO_PKG_VERSION"),
        engine: state.engine.program().display().to_string(),
        engine_available: state.engine_version.is_some(),
        engine_version: state.engine_version.clone(),
        download_dir: state.download_dir.display().to_string(),
        cookies: state.engine.cookies().map(|p| p.display().to_string()),
        active_jobs: state.registry.len(),
    })
}

/// Serve a file from the static directory, `index.html` for `/`
async fn serve_static(dir: PathBuf, tail: warp::path::Tail) -> Result<Response, Rejection> {
    let rel = match tail.as_str() {
        "" => "index.html",
        other => other,
    };

    // Reject anything that could climb out of the static root
    let rel_path = std::path::Path::new(rel);
    if rel_path
        .components()
        .any(|c| !matches!(c, std::path::Component::Normal(_)))
    {
        return Err(warp::reject::not_found());
    }

    let path = dir.join(rel_path);
    match tokio::fs::read(&path).await {
        Ok(data) => {
            let mime = content_type(&path);
            Ok(warp::reply::with_header(data, "Content-Type", mime).into_response())
        }
        Err(_) => Err(warp::reject::not_found()),
    }
}

fn content_type(path: &std::path::Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("html") => "text/html; charset=utf-8",
        Some("js") => "text/javascript; charset=utf-8",
        Some("css") => "text/css; charset=utf-8",
        Some("json") => "application/json",
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        Some("ico") => "image/x-icon",
        _ => "application/octet-stream",
    }
}

/// Turn warp rejections into the same `{error, code}` payload as handler errors
async fn handle_rejection(err: Rejection) -> Result<Response, Infallible> {
    let (status, code, message) = if err.is_not_found() {
        (StatusCode::NOT_FOUND, error_codes::NOT_FOUND, "Not found".to_string())
    } else if let Some(e) = err.find::<BodyDeserializeError>() {
        (
            StatusCode::BAD_REQUEST,
            error_codes::INVALID_INPUT,
            format!("Invalid JSON body: {}", e),
        )
    } else if err.find::<warp::reject::InvalidQuery>().is_some() {
        (
            StatusCode::BAD_REQUEST,
            error_codes::INVALID_INPUT,
            "Invalid query string".to_string(),
        )
    } else if err.find::<warp::reject::PayloadTooLarge>().is_some() {
        (
            StatusCode::PAYLOAD_TOO_LARGE,
            error_codes::INVALID_INPUT,
            "Request body too large".to_string(),
        )
    } else if err.find::<warp::reject::LengthRequired>().is_some() {
        (
            StatusCode::LENGTH_REQUIRED,
            error_codes::INVALID_INPUT,
            "Content-Length is required".to_string(),
        )
    } else if err.find::<warp::reject::UnsupportedMediaType>().is_some() {
        (
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            error_codes::INVALID_INPUT,
            "Expected a JSON body".to_string(),
        )
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        (
            StatusCode::METHOD_NOT_ALLOWED,
            error_codes::NOT_FOUND,
            "Method not allowed".to_string(),
        )
    } else {
        warn!("Unhandled rejection: {:?}", err);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            error_codes::INTERNAL_ERROR,
            "Internal server error".to_string(),
        )
    };

    let body = ErrorBody {
        error: message,
        code,
    };
    Ok(warp::reply::with_status(warp::reply::json(&body), status).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn test_state(engine: Engine) -> Arc<AppState> {
        Arc::new(AppState::new(
            engine,
            None,
            std::env::temp_dir().join("ytdeck-tests"),
        ))
    }

    fn missing_engine() -> Engine {
        Engine::new("/nonexistent/ytdeck-no-such-engine")
    }

    fn body_json(resp: &warp::http::Response<warp::hyper::body::Bytes>) -> Value {
        serde_json::from_slice(resp.body()).unwrap()
    }

    #[tokio::test]
    async fn test_fetch_requires_url() {
        let api = routes(test_state(missing_engine()), None);
        let resp = warp::test::request()
            .method("POST")
            .path("/api/fetch")
            .json(&json!({}))
            .reply(&api)
            .await;

        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body = body_json(&resp);
        assert_eq!(body["error"], "URL is required.");
        assert_eq!(body["code"], error_codes::INVALID_INPUT);
    }

    #[tokio::test]
    async fn test_fetch_engine_failure_is_single_error() {
        let api = routes(test_state(missing_engine()), None);
        let resp = warp::test::request()
            .method("POST")
            .path("/api/fetch")
            .json(&json!({ "url": "https://www.youtube.com/@someone/videos" }))
            .reply(&api)
            .await;

        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_json(&resp);
        assert_eq!(body["code"], error_codes::YTDLP_NOT_FOUND);
        assert!(body.get("videos").is_none());
    }

    #[tokio::test]
    async fn test_malformed_json_body() {
        let api = routes(test_state(missing_engine()), None);
        let resp = warp::test::request()
            .method("POST")
            .path("/api/cancel")
            .header("content-type", "application/json")
            .body("{not json")
            .reply(&api)
            .await;

        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(&resp)["code"], error_codes::INVALID_INPUT);
    }

    #[tokio::test]
    async fn test_download_requires_video_id() {
        let api = routes(test_state(missing_engine()), None);
        let resp = warp::test::request()
            .method("POST")
            .path("/api/download")
            .json(&json!({}))
            .reply(&api)
            .await;

        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(&resp)["error"], "Video ID is required.");
    }

    #[tokio::test]
    async fn test_cancel_requires_job_id() {
        let api = routes(test_state(missing_engine()), None);
        let resp = warp::test::request()
            .method("POST")
            .path("/api/cancel")
            .json(&json!({}))
            .reply(&api)
            .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_cancel_unknown_job() {
        let api = routes(test_state(missing_engine()), None);
        for id in [download::JobId::generate().to_string(), "nope".to_string()] {
            let resp = warp::test::request()
                .method("POST")
                .path("/api/cancel")
                .json(&json!({ "taskId": id }))
                .reply(&api)
                .await;
            assert_eq!(resp.status(), StatusCode::NOT_FOUND);
            assert_eq!(body_json(&resp)["code"], error_codes::JOB_NOT_FOUND);
        }
    }

    #[tokio::test]
    async fn test_status_unknown_job() {
        let api = routes(test_state(missing_engine()), None);
        let resp = warp::test::request()
            .path(&format!("/api/download/{}", download::JobId::generate()))
            .reply(&api)
            .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_stream_rejects_bad_quality() {
        let api = routes(test_state(missing_engine()), None);
        let resp = warp::test::request()
            .path("/api/download/stream?videoId=abc&quality=8k")
            .reply(&api)
            .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(&resp)["code"], error_codes::INVALID_INPUT);
    }

    #[tokio::test]
    async fn test_stream_reports_engine_failure_as_event() {
        let api = routes(test_state(missing_engine()), None);
        let resp = warp::test::request()
            .path("/api/download/stream?videoId=abc&quality=720p")
            .reply(&api)
            .await;

        assert_eq!(resp.status(), StatusCode::OK);
        let body = String::from_utf8_lossy(resp.body());
        assert!(body.contains(r#""status":"error""#));
        assert!(body.contains("yt-dlp not found"));
    }

    #[tokio::test]
    async fn test_unknown_route() {
        let api = routes(test_state(missing_engine()), None);
        let resp = warp::test::request().path("/api/nothing").reply(&api).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(&resp)["code"], error_codes::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_info() {
        let state = test_state(missing_engine());
        let api = routes(state, None);
        let resp = warp::test::request().path("/api/info").reply(&api).await;

        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(&resp);
        assert_eq!(body["engineAvailable"], false);
        assert_eq!(body["activeJobs"], 0);
        assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    }

    #[tokio::test]
    async fn test_info_reports_startup_version() {
        // The engine path does not exist, so the version can only come from state
        let state = Arc::new(AppState::new(
            missing_engine(),
            Some("2024.08.06".to_string()),
            std::env::temp_dir().join("ytdeck-tests"),
        ));
        let api = routes(state, None);
        let resp = warp::test::request().path("/api/info").reply(&api).await;

        let body = body_json(&resp);
        assert_eq!(body["engineAvailable"], true);
        assert_eq!(body["engineVersion"], "2024.08.06");
    }

    #[tokio::test]
    async fn test_static_files() {
        let dir = std::env::temp_dir().join(format!("ytdeck-static-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("index.html"), "<h1>ytdeck</h1>").unwrap();

        let api = routes(test_state(missing_engine()), Some(dir.clone()));
        let resp = warp::test::request().path("/").reply(&api).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()["content-type"], "text/html; charset=utf-8");
        assert_eq!(resp.body().as_ref(), b"<h1>ytdeck</h1>");

        let resp = warp::test::request().path("/missing.js").reply(&api).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_download_then_cancel() {
        let state = test_state(Engine::scripted("exec sleep 30"));
        let api = routes(state.clone(), None);

        let resp = warp::test::request()
            .method("POST")
            .path("/api/download")
            .json(&json!({ "videoId": "abc" }))
            .reply(&api)
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(&resp);
        assert_eq!(body["message"], "Download started.");
        let job_id = body["jobId"].as_str().unwrap().to_string();
        assert_eq!(state.registry.len(), 1);

        let resp = warp::test::request()
            .path(&format!("/api/download/{}", job_id))
            .reply(&api)
            .await;
        assert_eq!(body_json(&resp)["state"], "running");

        let resp = warp::test::request()
            .method("POST")
            .path("/api/cancel")
            .json(&json!({ "jobId": job_id }))
            .reply(&api)
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(&resp)["message"], "Download canceled.");
        assert!(state.registry.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stream_events_over_sse() {
        let state = test_state(Engine::scripted(
            "echo '[download]  42.0% of ~ 10.5MiB'; echo '[download] Destination: foo.mp4'",
        ));
        let api = routes(state, None);
        let resp = warp::test::request()
            .path("/api/download/stream?videoId=abc")
            .reply(&api)
            .await;

        assert_eq!(resp.status(), StatusCode::OK);
        let body = String::from_utf8_lossy(resp.body()).to_string();
        let events: Vec<Value> = body
            .lines()
            .filter_map(|l| l.strip_prefix("data:"))
            .map(|d| serde_json::from_str(d.trim()).unwrap())
            .collect();

        assert_eq!(events.len(), 2);
        assert_eq!(events[0]["status"], "progress");
        assert_eq!(events[0]["percent"], 42.0);
        assert_eq!(events[0]["size_str"], "10.5MiB");
        assert_eq!(events[1]["status"], "finished");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shutdown_ends_open_streams_and_jobs() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let state = test_state(Engine::scripted(
            "echo '[download]  10.0% of 1.00MiB'; exec sleep 30",
        ));
        let job_id =
            download::launch_detached(&state.engine, &state.registry, &state.download_dir, "bg")
                .await
                .unwrap();
        let job = state.registry.lookup(&job_id).unwrap();

        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let addr: SocketAddr = ([127, 0, 0, 1], 0).into();
        let (bound, server) = serve(state.clone(), None, addr, async move {
            let _ = stop_rx.await;
        })
        .unwrap();

        let client = async move {
            let mut conn = tokio::net::TcpStream::connect(bound).await.unwrap();
            conn.write_all(
                b"GET /api/download/stream?videoId=abc HTTP/1.1\r\nHost: localhost\r\n\r\n",
            )
            .await
            .unwrap();

            let mut received = Vec::new();
            let mut buf = [0u8; 1024];
            while !String::from_utf8_lossy(&received).contains("\"progress\"") {
                let n = conn.read(&mut buf).await.unwrap();
                assert!(n > 0, "connection closed before the first event");
                received.extend_from_slice(&buf[..n]);
            }

            stop_tx.send(()).unwrap();
            // The stream ends, then the server closes the connection
            let _ = conn.read_to_end(&mut received).await;
        };

        let finished = tokio::time::timeout(Duration::from_secs(5), async {
            tokio::join!(server, client);
        })
        .await;
        assert!(finished.is_ok(), "server kept running after the shutdown signal");
        assert!(state.registry.is_empty());
        assert!(job.try_exit().await.unwrap().is_some());
    }
}
