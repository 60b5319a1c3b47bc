//! Static file server publishing the manifest and segments.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::http::{HeaderValue, header};
use axum_server::Handle;
use axum_server::tls_rustls::{RustlsConfig, from_tcp_rustls};
use tokio_util::sync::CancellationToken;
use tower_http::services::ServeDir;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::{Level, debug, info, warn};

use crate::pipeline::FileServer;
use crate::{Error, Result};

/// Default time in-flight requests get to complete during shutdown.
pub const DEFAULT_SHUTDOWN_DEADLINE: Duration = Duration::from_secs(5);

/// Extra time allowed on top of the drain deadline for connections to be torn down.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Static server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind.
    pub bind_address: IpAddr,
    /// Port to bind (0 picks a free port).
    pub port: u16,
    /// Directory to serve.
    pub directory: PathBuf,
    /// PEM certificate chain. HTTPS is used when both this and `tls_key` are set.
    pub tls_cert: Option<PathBuf>,
    /// PEM private key.
    pub tls_key: Option<PathBuf>,
    /// Value of the `Access-Control-Allow-Origin` header, if any.
    pub cors: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 8080,
            directory: PathBuf::from("."),
            tls_cert: None,
            tls_key: None,
            cors: None,
        }
    }
}

impl ServerConfig {
    pub fn new(port: u16, directory: impl Into<PathBuf>) -> Self {
        Self {
            port,
            directory: directory.into(),
            ..Self::default()
        }
    }

    pub fn with_bind_address(mut self, address: IpAddr) -> Self {
        self.bind_address = address;
        self
    }

    pub fn with_tls(mut self, cert: impl Into<PathBuf>, key: impl Into<PathBuf>) -> Self {
        self.tls_cert = Some(cert.into());
        self.tls_key = Some(key.into());
        self
    }

    pub fn with_cors(mut self, cors: impl Into<String>) -> Self {
        self.cors = Some(cors.into());
        self
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.port)
    }

    /// Certificate and key paths, when TLS is configured.
    pub fn tls_paths(&self) -> Option<(&Path, &Path)> {
        match (&self.tls_cert, &self.tls_key) {
            (Some(cert), Some(key)) => Some((cert.as_path(), key.as_path())),
            _ => None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.tls_cert.is_some() != self.tls_key.is_some() {
            return Err(Error::config("TLS requires both a certificate and a key"));
        }
        if let Some(cors) = &self.cors {
            HeaderValue::from_str(cors)
                .map_err(|_| Error::config(format!("Invalid CORS header value: {:?}", cors)))?;
        }
        Ok(())
    }
}

/// HTTP(S) server for the segment directory.
pub struct StaticServer {
    config: ServerConfig,
    cors: Option<HeaderValue>,
    handle: Handle,
    serving: AtomicBool,
    stop_requested: CancellationToken,
    finished: CancellationToken,
}

impl StaticServer {
    pub fn new(config: ServerConfig) -> Result<Self> {
        config.validate()?;
        let cors = config
            .cors
            .as_deref()
            .map(HeaderValue::from_str)
            .transpose()
            .map_err(|e| Error::config(format!("Invalid CORS header value: {}", e)))?;

        Ok(Self {
            config,
            cors,
            handle: Handle::new(),
            serving: AtomicBool::new(false),
            stop_requested: CancellationToken::new(),
            finished: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Address the server is listening on, once it is listening.
    ///
    /// Resolves to `None` if the server stops before it starts listening.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.handle.listening().await
    }

    /// Build the router serving the configured directory.
    pub fn router(&self) -> Router {
        let mut router = Router::new().fallback_service(ServeDir::new(&self.config.directory));

        if let Some(cors) = &self.cors {
            router = router.layer(SetResponseHeaderLayer::overriding(
                header::ACCESS_CONTROL_ALLOW_ORIGIN,
                cors.clone(),
            ));
        }

        // Segment fetches are frequent, keep them at debug.
        router.layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
        )
    }

    async fn serve(&self) -> Result<()> {
        let directory = &self.config.directory;
        let is_dir = tokio::fs::metadata(directory)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false);
        if !is_dir {
            return Err(Error::InvalidDirectory(directory.clone()));
        }

        let addr = self.config.socket_addr();
        let listener =
            std::net::TcpListener::bind(addr).map_err(|source| Error::Bind { addr, source })?;
        listener
            .set_nonblocking(true)
            .map_err(|source| Error::Bind { addr, source })?;

        let app = self.router().into_make_service();

        let served = match self.config.tls_paths() {
            Some((cert, key)) => {
                let tls = RustlsConfig::from_pem_file(cert, key).await.map_err(|e| {
                    Error::Tls(format!(
                        "failed to load {} / {}: {}",
                        cert.display(),
                        key.display(),
                        e
                    ))
                })?;
                info!(
                    "Serving {} on https://{}",
                    directory.display(),
                    listener.local_addr().unwrap_or(addr)
                );
                from_tcp_rustls(listener, tls)
                    .handle(self.handle.clone())
                    .serve(app)
                    .await
            }
            None => {
                info!(
                    "Serving {} on http://{}",
                    directory.display(),
                    listener.local_addr().unwrap_or(addr)
                );
                axum_server::from_tcp(listener)
                    .handle(self.handle.clone())
                    .serve(app)
                    .await
            }
        };

        served.map_err(Error::Serve)?;
        info!("Static server stopped");
        Ok(())
    }
}

#[async_trait]
impl FileServer for StaticServer {
    async fn listen_and_serve(&self) -> Result<()> {
        if self.stop_requested.is_cancelled() {
            debug!("Static server stopped before it started");
            return Ok(());
        }
        if self.serving.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyStarted("static server"));
        }

        let _finished = self.finished.clone().drop_guard();
        self.serve().await
    }

    async fn shutdown(&self, deadline: Duration) {
        if self.stop_requested.is_cancelled() {
            debug!("Static server shutdown already requested");
        }
        self.stop_requested.cancel();
        self.handle.graceful_shutdown(Some(deadline));

        if !self.serving.load(Ordering::SeqCst) {
            return;
        }

        if tokio::time::timeout(deadline + SHUTDOWN_GRACE, self.finished.cancelled())
            .await
            .is_err()
        {
            warn!(?deadline, "Static server did not stop within its deadline");
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::extract::Request;
    use axum::http::StatusCode;
    use tower::ServiceExt;

    use super::*;

    fn request(path: &str) -> Request {
        Request::builder().uri(path).body(Body::empty()).unwrap()
    }

    #[test]
    fn test_config_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_address, IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        assert!(config.tls_paths().is_none());
        assert!(config.cors.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_tls_requires_cert_and_key() {
        let mut config = ServerConfig::new(8443, "/srv/stream");
        config.tls_cert = Some(PathBuf::from("cert.pem"));
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));

        let config = ServerConfig::new(8443, "/srv/stream").with_tls("cert.pem", "key.pem");
        assert!(config.validate().is_ok());
        assert_eq!(
            config.tls_paths(),
            Some((Path::new("cert.pem"), Path::new("key.pem")))
        );
    }

    #[test]
    fn test_invalid_cors_value() {
        let config = ServerConfig::new(8080, ".").with_cors("bad\nvalue");
        assert!(StaticServer::new(config).is_err());
    }

    #[tokio::test]
    async fn test_manifest_served_with_cors_header() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("manifest.mpd"), "<MPD/>").unwrap();

        let server =
            StaticServer::new(ServerConfig::new(0, dir.path()).with_cors("*")).unwrap();
        let response = server.router().oneshot(request("/manifest.mpd")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(),
            "*"
        );
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"<MPD/>");
    }

    #[tokio::test]
    async fn test_no_cors_header_by_default() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("manifest.mpd"), "<MPD/>").unwrap();

        let server = StaticServer::new(ServerConfig::new(0, dir.path())).unwrap();
        let response = server.router().oneshot(request("/manifest.mpd")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).is_none());
    }

    #[tokio::test]
    async fn test_missing_file_keeps_cors_header() {
        let dir = tempfile::tempdir().unwrap();
        let server = StaticServer::new(
            ServerConfig::new(0, dir.path()).with_cors("https://player.example"),
        )
        .unwrap();

        let response = server
            .router()
            .oneshot(request("/chunk-stream0-00042.m4s"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            response.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(),
            "https://player.example"
        );
    }

    #[tokio::test]
    async fn test_missing_directory_is_distinguished() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("does-not-exist");

        let server = StaticServer::new(ServerConfig::new(0, &missing)).unwrap();
        match server.listen_and_serve().await {
            Err(Error::InvalidDirectory(path)) => assert_eq!(path, missing),
            other => panic!("expected invalid directory, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_shutdown_before_serve() {
        let dir = tempfile::tempdir().unwrap();
        let server = StaticServer::new(ServerConfig::new(0, dir.path())).unwrap();

        server.shutdown(Duration::from_millis(100)).await;
        server.shutdown(Duration::from_millis(100)).await;
        assert!(server.listen_and_serve().await.is_ok());
    }
}
