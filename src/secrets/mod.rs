//! Remote link lookup: template names and saved secrets over gRPC.
//!
//! The daemon never stores credentials itself; every webhook or connection
//! request resolves its link against this service.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint, Identity};
use tracing::error;

const RPC_TIMEOUT: Duration = Duration::from_secs(3);

/// Link lookup request message.
#[derive(Clone, PartialEq, prost::Message)]
pub struct GetLinkRequest {
    #[prost(string, tag = "1")]
    pub link_id: String,
}

/// Link lookup response message.
#[derive(Clone, PartialEq, prost::Message)]
pub struct GetLinkResponse {
    /// Service-type tag selecting the handler for this link.
    #[prost(string, tag = "1")]
    pub template: String,
}

/// Credentials lookup request message.
#[derive(Clone, PartialEq, prost::Message)]
pub struct GetCredentialsRequest {
    #[prost(string, tag = "1")]
    pub link_id: String,
}

/// Credentials lookup response message.
#[derive(Clone, PartialEq, prost::Message)]
pub struct GetCredentialsResponse {
    /// Saved secrets; empty until the link's auth flow has completed.
    #[prost(map = "string, string", tag = "1")]
    pub credentials: HashMap<String, String>,
}

/// Generated-style gRPC client module.
pub mod link_client {
    use super::*;
    use tonic::codegen::*;

    /// Link service client.
    #[derive(Debug, Clone)]
    pub struct LinkServiceClient<T> {
        inner: tonic::client::Grpc<T>,
    }

    impl LinkServiceClient<tonic::transport::Channel> {
        /// Create a new client from a channel.
        pub fn new(channel: tonic::transport::Channel) -> Self {
            let inner = tonic::client::Grpc::new(channel);
            Self { inner }
        }
    }

    impl<T> LinkServiceClient<T>
    where
        T: tonic::client::GrpcService<tonic::body::BoxBody>,
        T::Error: Into<StdError> + std::fmt::Debug,
        T::ResponseBody: Body<Data = Bytes> + std::marker::Send + 'static,
        <T::ResponseBody as Body>::Error: Into<StdError> + std::marker::Send,
    {
        pub async fn get_link(
            &mut self,
            request: impl tonic::IntoRequest<GetLinkRequest>,
        ) -> std::result::Result<tonic::Response<GetLinkResponse>, tonic::Status> {
            self.inner.ready().await.map_err(|e| {
                tonic::Status::new(tonic::Code::Unknown, format!("Service not ready: {e:?}"))
            })?;

            let codec = tonic::codec::ProstCodec::default();
            let path = http::uri::PathAndQuery::from_static("/links.v1.LinkService/GetLink");
            let mut req = request.into_request();
            req.extensions_mut()
                .insert(GrpcMethod::new("links.v1.LinkService", "GetLink"));
            self.inner.unary(req, path, codec).await
        }

        pub async fn get_credentials(
            &mut self,
            request: impl tonic::IntoRequest<GetCredentialsRequest>,
        ) -> std::result::Result<tonic::Response<GetCredentialsResponse>, tonic::Status> {
            self.inner.ready().await.map_err(|e| {
                tonic::Status::new(tonic::Code::Unknown, format!("Service not ready: {e:?}"))
            })?;

            let codec = tonic::codec::ProstCodec::default();
            let path =
                http::uri::PathAndQuery::from_static("/links.v1.LinkService/GetCredentials");
            let mut req = request.into_request();
            req.extensions_mut()
                .insert(GrpcMethod::new("links.v1.LinkService", "GetCredentials"));
            self.inner.unary(req, path, codec).await
        }
    }
}

use link_client::LinkServiceClient;

/// Everything the daemon needs to know about one link.
#[derive(Clone, Debug)]
pub struct LinkInfo {
    pub template: String,
    /// Empty until the link's auth flow has completed.
    pub secrets: HashMap<String, String>,
}

/// TLS material for the secrets connection, loaded from PEM files.
#[derive(Clone, Debug, Default)]
pub struct SecretsTls {
    pub server_ca_cert: Option<PathBuf>,
    pub client_cert: Option<PathBuf>,
    pub client_key: Option<PathBuf>,
}

/// Client for the secrets service. Connections are short-lived: each lookup
/// opens a channel, like the callers' request handling itself.
#[derive(Clone)]
pub struct SecretsClient {
    addr: String,
    tls: Option<ClientTlsConfig>,
}

impl SecretsClient {
    /// Plaintext client for development setups.
    pub fn plaintext(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            tls: None,
        }
    }

    /// TLS client, optionally with a private CA and mutual-auth identity.
    pub fn with_tls(addr: impl Into<String>, tls: &SecretsTls) -> anyhow::Result<Self> {
        let mut config = ClientTlsConfig::new().with_webpki_roots();
        if let Some(ca) = &tls.server_ca_cert {
            config = config.ca_certificate(Certificate::from_pem(read_pem(ca)?));
        }
        if let (Some(cert), Some(key)) = (&tls.client_cert, &tls.client_key) {
            config = config.identity(Identity::from_pem(read_pem(cert)?, read_pem(key)?));
        }
        Ok(Self {
            addr: addr.into(),
            tls: Some(config),
        })
    }

    /// The template name and saved secrets of a link. Reports transport and
    /// server errors, but an unknown link is `None`, not an error.
    pub async fn link_data(&self, link_id: &str) -> anyhow::Result<Option<LinkInfo>> {
        let mut client = self.connect().await?;

        let link = GetLinkRequest {
            link_id: link_id.to_string(),
        };
        let template = match call(client.get_link(link)).await {
            Ok(resp) => resp.into_inner().template,
            Err(status) if status.code() == tonic::Code::NotFound => return Ok(None),
            Err(status) => {
                error!(error = %status, "link lookup failed");
                return Err(status.into());
            }
        };

        let creds = GetCredentialsRequest {
            link_id: link_id.to_string(),
        };
        let secrets = match call(client.get_credentials(creds)).await {
            Ok(resp) => resp.into_inner().credentials,
            Err(status) => {
                error!(error = %status, "credentials lookup failed");
                return Err(status.into());
            }
        };

        Ok(Some(LinkInfo { template, secrets }))
    }

    /// The template name of a link, or `None` when the link is unknown.
    pub async fn link_template(&self, link_id: &str) -> anyhow::Result<Option<String>> {
        let mut client = self.connect().await?;

        let link = GetLinkRequest {
            link_id: link_id.to_string(),
        };
        match call(client.get_link(link)).await {
            Ok(resp) => Ok(Some(resp.into_inner().template)),
            Err(status) if status.code() == tonic::Code::NotFound => Ok(None),
            Err(status) => {
                error!(error = %status, "link lookup failed");
                Err(status.into())
            }
        }
    }

    async fn connect(&self) -> anyhow::Result<LinkServiceClient<Channel>> {
        let scheme = if self.tls.is_some() { "https" } else { "http" };
        let mut endpoint = Endpoint::from_shared(format!("{scheme}://{}", self.addr))
            .with_context(|| format!("invalid secrets server address {:?}", self.addr))?
            .connect_timeout(RPC_TIMEOUT);
        if let Some(tls) = &self.tls {
            endpoint = endpoint.tls_config(tls.clone())?;
        }

        let channel = endpoint
            .connect()
            .await
            .with_context(|| format!("failed to reach secrets server at {:?}", self.addr))?;
        Ok(LinkServiceClient::new(channel))
    }
}

/// Applies the per-call deadline shared by all lookups.
async fn call<T>(
    fut: impl std::future::Future<Output = Result<tonic::Response<T>, tonic::Status>>,
) -> Result<tonic::Response<T>, tonic::Status> {
    match tokio::time::timeout(RPC_TIMEOUT, fut).await {
        Ok(result) => result,
        Err(_) => Err(tonic::Status::new(
            tonic::Code::DeadlineExceeded,
            "secrets lookup timed out",
        )),
    }
}

fn read_pem(path: &Path) -> anyhow::Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("failed to read PEM file {}", path.display()))
}
