pub mod handlers;
pub mod http_server;
use crate::engine_api::lab_engine::LabEngine;
use crate::http::http_server::HttpServer;
use labforge_library::utils::port::Port;
use std::net::SocketAddr;
use std::sync::Arc;

pub async fn create_http_server(address: &str, port: Port, engine: Arc<LabEngine>) -> Result<HttpServer, String> {
    let socket_addr: SocketAddr = format!("{}:{}", address, port)
        .parse()
        .map_err(|e| format!("Failed to parse SocketAddr: {}", e))?;

    Ok(http_server::HttpServer::new(socket_addr, engine))
}
