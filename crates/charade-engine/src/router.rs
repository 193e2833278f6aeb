//! Request routing and error dispatch.
//!
//! Routes map `(method, path pattern)` to handlers over the exchange.
//! Patterns are literal, `{name}`-parameterised, or absent (catch-all);
//! candidates are tried in registration order. Failures attached to the
//! exchange are routed to per-status error handlers, with a logging default.

use crate::exchange::HttpExchange;
use crate::matcher::PathTemplate;
use crate::response::{CONTENT_TYPE, CONTENT_TYPE_PLAIN};
use crate::EngineError;
use bytes::Bytes;
use hyper::{Method, StatusCode};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, error, warn};

pub const NOT_FOUND_BODY: &str = "Resource not found";

pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = Result<(), EngineError>> + Send + 'a>>;

/// A per-route request handler. The future borrows the exchange for the
/// duration of the request.
pub trait RouteHandler: Send + Sync {
    fn handle<'a>(&'a self, exchange: &'a mut HttpExchange) -> HandlerFuture<'a>;
}

pub type ErrorHandler = Arc<dyn Fn(&mut HttpExchange) + Send + Sync>;

struct Route {
    method: Option<Method>,
    template: Option<PathTemplate>,
    handler: Arc<dyn RouteHandler>,
}

/// Dispatch table populated at startup, read-only while serving.
#[derive(Default)]
pub struct Router {
    routes: Vec<Route>,
    error_handlers: HashMap<u16, ErrorHandler>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a route. A `None` path is a catch-all matching every path.
    pub fn route(
        &mut self,
        method: Option<Method>,
        path: Option<&str>,
        handler: Arc<dyn RouteHandler>,
    ) -> Result<(), EngineError> {
        let template = path.map(PathTemplate::parse).transpose()?;
        debug!(
            "Registered route {} {}",
            method.as_ref().map(|m| m.as_str()).unwrap_or("*"),
            template.as_ref().map(|t| t.raw()).unwrap_or("*"),
        );
        self.routes.push(Route {
            method,
            template,
            handler,
        });
        Ok(())
    }

    /// Register a handler for failures with the given status code.
    pub fn error_handler(&mut self, status_code: u16, handler: ErrorHandler) {
        self.error_handlers.insert(status_code, handler);
    }

    /// Route the exchange to the first matching handler, then resolve any
    /// failure through the error handlers.
    pub async fn dispatch(&self, exchange: &mut HttpExchange) {
        let matched = self.routes.iter().find_map(|route| {
            if let Some(method) = &route.method {
                if method != exchange.request().method() {
                    return None;
                }
            }
            match &route.template {
                None => Some((route, HashMap::new())),
                Some(template) => template
                    .match_path(exchange.request().path())
                    .map(|params| (route, params)),
            }
        });

        match matched {
            Some((route, params)) => {
                exchange.set_path_params(params);
                if let Err(e) = route.handler.handle(exchange).await {
                    let status = e.status_code();
                    exchange.fail(status, Some(e.into()));
                }
            }
            None => send_not_found(exchange),
        }

        if let Some(failure) = exchange.take_failure() {
            self.handle_failure(exchange, failure.status_code, failure.cause);
        }
    }

    fn handle_failure(
        &self,
        exchange: &mut HttpExchange,
        status_code: u16,
        cause: Option<anyhow::Error>,
    ) {
        let request_line = format!(
            "{} {}",
            exchange.request().method(),
            exchange.request().path()
        );
        match &cause {
            Some(cause) if status_code >= 500 => {
                error!("Error handling {}: {:#}", request_line, cause)
            }
            Some(cause) => warn!("Error handling {}: {:#}", request_line, cause),
            None if status_code >= 500 => error!("Failing {} with {}", request_line, status_code),
            None => warn!("Failing {} with {}", request_line, status_code),
        }

        if let Some(handler) = self.error_handlers.get(&status_code) {
            exchange.response.set_status_code(status_code);
            handler(exchange);
            return;
        }

        // default: status plus its canonical description
        let reason = StatusCode::from_u16(status_code)
            .ok()
            .and_then(|s| s.canonical_reason())
            .unwrap_or("Error");
        exchange.response.set_status_code(status_code);
        exchange.response.put_header(CONTENT_TYPE, CONTENT_TYPE_PLAIN);
        exchange.response.end(Some(Bytes::from(reason)));
    }
}

/// Standard 404 emitted when no route (or no resource) matches.
pub fn send_not_found(exchange: &mut HttpExchange) {
    exchange.response.set_status_code(404);
    exchange.response.put_header(CONTENT_TYPE, CONTENT_TYPE_PLAIN);
    exchange.response.end(Some(Bytes::from(NOT_FOUND_BODY)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{BodySource, RequestView};
    use hyper::HeaderMap;

    fn exchange(method: Method, path: &str) -> HttpExchange {
        HttpExchange::new(RequestView::new(
            method,
            path.to_string(),
            Vec::new(),
            HeaderMap::new(),
            Bytes::new(),
        ))
    }

    struct Echo(&'static str);

    impl RouteHandler for Echo {
        fn handle<'a>(&'a self, exchange: &'a mut HttpExchange) -> HandlerFuture<'a> {
            Box::pin(async move {
                exchange.response.end(Some(Bytes::from(self.0)));
                Ok(())
            })
        }
    }

    struct Failing(EngineError);

    impl RouteHandler for Failing {
        fn handle<'a>(&'a self, _exchange: &'a mut HttpExchange) -> HandlerFuture<'a> {
            let status = self.0.status_code();
            let message = self.0.to_string();
            Box::pin(async move {
                Err(match status {
                    404 => EngineError::RouteNotFound,
                    _ => EngineError::Render(message),
                })
            })
        }
    }

    struct ExplicitFail(u16);

    impl RouteHandler for ExplicitFail {
        fn handle<'a>(&'a self, exchange: &'a mut HttpExchange) -> HandlerFuture<'a> {
            let status = self.0;
            Box::pin(async move {
                exchange.fail(status, None);
                Ok(())
            })
        }
    }

    #[tokio::test]
    async fn test_literal_route_dispatch() {
        let mut router = Router::new();
        router
            .route(Some(Method::GET), Some("/ping"), Arc::new(Echo("pong")))
            .unwrap();

        let mut ex = exchange(Method::GET, "/ping");
        router.dispatch(&mut ex).await;
        assert_eq!(*ex.response.body(), BodySource::Buffer(Bytes::from("pong")));
    }

    #[tokio::test]
    async fn test_registration_order_wins() {
        let mut router = Router::new();
        router
            .route(Some(Method::GET), Some("/users/{id}"), Arc::new(Echo("first")))
            .unwrap();
        router
            .route(
                Some(Method::GET),
                Some("/users/{name}"),
                Arc::new(Echo("second")),
            )
            .unwrap();

        let mut ex = exchange(Method::GET, "/users/42");
        router.dispatch(&mut ex).await;
        assert_eq!(
            *ex.response.body(),
            BodySource::Buffer(Bytes::from("first"))
        );
        assert_eq!(ex.path_params()["id"], "42");
    }

    #[tokio::test]
    async fn test_unmatched_is_404_resource_not_found() {
        let mut router = Router::new();
        router
            .route(Some(Method::GET), Some("/known"), Arc::new(Echo("ok")))
            .unwrap();

        let mut ex = exchange(Method::POST, "/unknown");
        router.dispatch(&mut ex).await;
        assert_eq!(ex.response.status_code(), 404);
        assert_eq!(ex.response.header(CONTENT_TYPE), Some(CONTENT_TYPE_PLAIN));
        assert_eq!(
            *ex.response.body(),
            BodySource::Buffer(Bytes::from(NOT_FOUND_BODY))
        );
    }

    #[tokio::test]
    async fn test_catch_all_route() {
        let mut router = Router::new();
        router.route(None, None, Arc::new(Echo("caught"))).unwrap();

        let mut ex = exchange(Method::PUT, "/whatever/deeply/nested");
        router.dispatch(&mut ex).await;
        assert_eq!(
            *ex.response.body(),
            BodySource::Buffer(Bytes::from("caught"))
        );
    }

    #[tokio::test]
    async fn test_handler_error_routes_to_default_500() {
        let mut router = Router::new();
        router
            .route(
                None,
                Some("/explode"),
                Arc::new(Failing(EngineError::Render("boom".to_string()))),
            )
            .unwrap();

        let mut ex = exchange(Method::GET, "/explode");
        router.dispatch(&mut ex).await;
        assert_eq!(ex.response.status_code(), 500);
        assert_eq!(
            *ex.response.body(),
            BodySource::Buffer(Bytes::from("Internal Server Error"))
        );
    }

    #[tokio::test]
    async fn test_registered_error_handler_invoked() {
        let mut router = Router::new();
        router
            .route(
                None,
                Some("/explode"),
                Arc::new(Failing(EngineError::Render("boom".to_string()))),
            )
            .unwrap();
        router.error_handler(
            500,
            Arc::new(|exchange| {
                exchange
                    .response
                    .end(Some(Bytes::from(r#"{"error": "custom"}"#)));
            }),
        );

        let mut ex = exchange(Method::GET, "/explode");
        router.dispatch(&mut ex).await;
        assert_eq!(ex.response.status_code(), 500);
        assert_eq!(
            *ex.response.body(),
            BodySource::Buffer(Bytes::from(r#"{"error": "custom"}"#))
        );
    }

    #[tokio::test]
    async fn test_explicit_fail_routes_to_handler() {
        let mut router = Router::new();
        router
            .route(None, Some("/drain"), Arc::new(ExplicitFail(503)))
            .unwrap();

        let mut ex = exchange(Method::GET, "/drain");
        router.dispatch(&mut ex).await;
        assert_eq!(ex.response.status_code(), 503);
    }
}
