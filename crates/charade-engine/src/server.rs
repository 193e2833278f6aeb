//! HTTP adapter.
//!
//! Converts hyper requests into `HttpExchange`s, dispatches them through
//! the router, and writes the resulting response sink back to the client.

use crate::exchange::{BodySource, HttpExchange, RequestView};
use crate::features::EngineFeatures;
use crate::metrics;
use crate::router::Router;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

pub struct HttpServer {
    listener: TcpListener,
    router: Arc<Router>,
    features: EngineFeatures,
}

impl HttpServer {
    pub async fn bind(
        addr: SocketAddr,
        router: Arc<Router>,
        features: EngineFeatures,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!("Listening on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            router,
            features,
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until the surrounding task is dropped.
    pub async fn serve(self) {
        loop {
            match self.listener.accept().await {
                Ok((stream, _)) => {
                    let router = Arc::clone(&self.router);
                    let features = self.features;
                    tokio::spawn(async move {
                        let io = TokioIo::new(stream);
                        let service = service_fn(move |req| {
                            let router = Arc::clone(&router);
                            async move { handle_request(req, router, features).await }
                        });
                        if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                            debug!("Connection error: {}", e);
                        }
                    });
                }
                Err(e) => error!("Accept error: {}", e),
            }
        }
    }
}

async fn handle_request(
    req: Request<Incoming>,
    router: Arc<Router>,
    features: EngineFeatures,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let method = req.method().clone();
    let uri = req.uri().clone();
    let headers = req.headers().clone();

    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            debug!("Failed to read request body: {}", e);
            Bytes::new()
        }
    };

    let request = RequestView::new(
        method.clone(),
        uri.path().to_string(),
        RequestView::parse_query(uri.query()),
        headers,
        body,
    );
    let mut exchange = HttpExchange::new(request);

    router.dispatch(&mut exchange).await;

    let status = exchange.response.status_code();
    if features.metrics {
        metrics::record_request(method.as_str(), status);
    }

    Ok(write_response(exchange).await)
}

/// Materialise the response sink into a hyper response.
async fn write_response(exchange: HttpExchange) -> Response<Full<Bytes>> {
    let sink = &exchange.response;
    let mut builder = Response::builder().status(
        StatusCode::from_u16(sink.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
    );
    for (name, value) in sink.headers() {
        builder = builder.header(name.as_str(), value.as_str());
    }

    let body = match sink.body() {
        BodySource::Empty => Bytes::new(),
        BodySource::Buffer(bytes) => bytes.clone(),
        BodySource::File(path) => match tokio::fs::read(path).await {
            Ok(contents) => Bytes::from(contents),
            Err(e) => {
                error!("Failed to read response file {}: {}", path.display(), e);
                return Response::builder()
                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                    .header("Content-Type", "text/plain")
                    .body(Full::new(Bytes::from("Internal Server Error")))
                    .unwrap();
            }
        },
    };

    builder
        .body(Full::new(body))
        .unwrap_or_else(|e| {
            error!("Failed to build response: {}", e);
            Response::new(Full::new(Bytes::new()))
        })
}
