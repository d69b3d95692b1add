use crate::engine_api::lab_engine::LabEngine;
use crate::http::handlers::{
    handle_engine_status, handle_lab_status, handle_ping, handle_reload_templates, handle_report_activity,
    handle_request_lab, handle_stop_lab,
};
use anyhow::Result;
use axum::{
    routing::{get, post},
    Extension, Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

#[derive(Clone)]
pub struct HttpServer {
    pub addr: SocketAddr,
    pub engine: Arc<LabEngine>,
}

impl HttpServer {
    pub fn new(addr: SocketAddr, engine: Arc<LabEngine>) -> Self {
        Self { addr, engine }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/ping", get(handle_ping))
            .route("/labs", post(handle_request_lab))
            .route("/labs/activity", post(handle_report_activity))
            .route("/labs/stop", post(handle_stop_lab))
            .route("/labs/status", get(handle_lab_status))
            .route("/status", get(handle_engine_status))
            .route("/templates/reload", post(handle_reload_templates))
            .layer(Extension(self.clone()))
    }

    pub async fn run(self) -> Result<()> {
        let listener = TcpListener::bind(self.addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        info!("Starting HTTP server on: {}", self.addr);
        let app = self.router();
        axum::serve(listener, app.into_make_service()).await?;
        Ok(())
    }
}
