use std::future::poll_fn;
use std::sync::Arc;
use std::time::Duration;

use http::Uri;
use hyper::client::conn::http1::{self, SendRequest};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::connect::HttpConnector;
use tower_service::Service;
use tracing::debug;

use crate::body::ReqBody;
use crate::error::Error;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Opens HTTP/1.1 connections (plain or rustls) to one origin.
#[derive(Clone)]
pub(crate) struct Transport {
    connector: HttpsConnector<HttpConnector>,
    origin: Uri,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Transport")
            .field("origin", &self.origin)
            .finish()
    }
}

impl Transport {
    pub(crate) fn new(origin: Uri, connect_timeout: Duration) -> Result<Self, Error> {
        let mut http = HttpConnector::new();
        http.enforce_http(false);
        http.set_nodelay(true);
        http.set_connect_timeout(Some(connect_timeout));

        let connector = HttpsConnectorBuilder::new()
            .with_tls_config(build_rustls_tls_config()?)
            .https_or_http()
            .enable_http1()
            .wrap_connector(http);
        Ok(Self { connector, origin })
    }

    pub(crate) fn origin(&self) -> &Uri {
        &self.origin
    }

    /// Dials the origin and completes the HTTP/1.1 handshake. The connection
    /// driver runs on its own task until the returned sender is dropped.
    pub(crate) async fn connect(&self) -> Result<SendRequest<ReqBody>, BoxError> {
        let mut connector = self.connector.clone();
        poll_fn(|cx| connector.poll_ready(cx)).await?;
        let io = connector.call(self.origin.clone()).await?;
        let (sender, connection) = http1::handshake(io).await?;
        tokio::spawn(async move {
            if let Err(error) = connection.await {
                debug!(error = %error, "connection closed with error");
            }
        });
        Ok(sender)
    }
}

fn build_rustls_tls_config() -> Result<rustls::ClientConfig, Error> {
    let root_store =
        rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|source| Error::InvalidConfig {
            field: "tls",
            message: source.to_string(),
        })?
        .with_root_certificates(root_store)
        .with_no_client_auth();
    Ok(config)
}
