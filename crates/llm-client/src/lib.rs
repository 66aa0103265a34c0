//! LLM gateway client used for optional recommendation reranking.
//!
//! This crate provides:
//! - [`ContentGenerator`], the prompt-in/text-out seam the reranker depends on
//! - [`GrpcLlmClient`], its implementation over the `llm.LlmGateway` gRPC service
//!
//! Timeouts are the caller's concern; the reranker wraps every call in
//! `tokio::time::timeout` and drops the future on expiry.

use async_trait::async_trait;
use thiserror::Error;
use tonic::transport::{Channel, Endpoint};
use tracing::{debug, error, info};

// Include the generated protobuf code
pub mod llm {
    tonic::include_proto!("llm");
}

use llm::{llm_gateway_client::LlmGatewayClient, GenerateRequest};

/// Errors that can occur when talking to the LLM gateway
#[derive(Error, Debug)]
pub enum LlmClientError {
    #[error("Invalid gateway address {addr}: {reason}")]
    InvalidAddress { addr: String, reason: String },

    #[error("Failed to connect to LLM gateway: {0}")]
    Connection(String),

    #[error("LLM request failed: {0}")]
    Request(String),

    #[error("LLM gateway returned an empty response")]
    EmptyResponse,
}

pub type Result<T> = std::result::Result<T, LlmClientError>;

/// Anything that turns a prompt into generated text
#[async_trait]
pub trait ContentGenerator: Send + Sync {
    async fn generate_content(&self, prompt: &str) -> Result<String>;
}

/// gRPC client for the LLM gateway.
///
/// The underlying tonic client is cheap to clone; each call works on its own
/// clone so the client can be shared behind `Arc`.
#[derive(Clone)]
pub struct GrpcLlmClient {
    client: LlmGatewayClient<Channel>,
    gateway_addr: String,
    model: String,
}

impl GrpcLlmClient {
    fn endpoint(addr: &str) -> Result<Endpoint> {
        Endpoint::from_shared(addr.to_string()).map_err(|e| LlmClientError::InvalidAddress {
            addr: addr.to_string(),
            reason: e.to_string(),
        })
    }

    /// Connect eagerly, failing if the gateway is unreachable
    pub async fn connect(addr: impl Into<String>) -> Result<Self> {
        let addr = addr.into();
        info!("Connecting to LLM gateway at {}", addr);

        let channel = Self::endpoint(&addr)?
            .connect()
            .await
            .map_err(|e| LlmClientError::Connection(e.to_string()))?;

        Ok(Self {
            client: LlmGatewayClient::new(channel),
            gateway_addr: addr,
            model: String::new(),
        })
    }

    /// Build a client that connects on first use
    pub fn connect_lazy(addr: impl Into<String>) -> Result<Self> {
        let addr = addr.into();
        let channel = Self::endpoint(&addr)?.connect_lazy();
        Ok(Self {
            client: LlmGatewayClient::new(channel),
            gateway_addr: addr,
            model: String::new(),
        })
    }

    /// Request a specific model instead of the gateway default
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Get the address of the gateway this client talks to.
    pub fn gateway_address(&self) -> &str {
        &self.gateway_addr
    }
}

#[async_trait]
impl ContentGenerator for GrpcLlmClient {
    async fn generate_content(&self, prompt: &str) -> Result<String> {
        debug!("Sending {} byte prompt to {}", prompt.len(), self.gateway_addr);
        let request = tonic::Request::new(GenerateRequest {
            prompt: prompt.to_string(),
            model: self.model.clone(),
        });

        let mut client = self.client.clone();
        let response = client.generate_content(request).await.map_err(|e| {
            error!("gRPC error while generating content: {}", e);
            LlmClientError::Request(e.to_string())
        })?;

        let text = response.into_inner().text;
        if text.trim().is_empty() {
            return Err(LlmClientError::EmptyResponse);
        }
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use llm::llm_gateway_server::{LlmGateway, LlmGatewayServer};
    use llm::GenerateResponse;
    use tokio::net::TcpListener;
    use tokio_stream::wrappers::TcpListenerStream;
    use tonic::transport::Server;
    use tonic::{Request, Response, Status};

    /// Gateway that answers with a fixed text, or fails when it is empty
    struct MockGateway {
        reply: String,
    }

    #[tonic::async_trait]
    impl LlmGateway for MockGateway {
        async fn generate_content(
            &self,
            request: Request<GenerateRequest>,
        ) -> std::result::Result<Response<GenerateResponse>, Status> {
            if request.get_ref().prompt.contains("fail") {
                return Err(Status::unavailable("gateway overloaded"));
            }
            Ok(Response::new(GenerateResponse {
                text: self.reply.clone(),
            }))
        }
    }

    async fn start_mock_gateway(reply: &str) -> (String, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind mock gateway");
        let addr = listener.local_addr().expect("Failed to get local address");
        let service = LlmGatewayServer::new(MockGateway {
            reply: reply.to_string(),
        });

        let handle = tokio::spawn(async move {
            Server::builder()
                .add_service(service)
                .serve_with_incoming(TcpListenerStream::new(listener))
                .await
                .expect("Mock gateway failed");
        });

        (format!("http://{}", addr), handle)
    }

    #[tokio::test]
    async fn test_generate_content_round_trip() {
        let (addr, handle) = start_mock_gateway(r#"{"ids":[3,1,2]}"#).await;
        let client = GrpcLlmClient::connect(addr.clone()).await.unwrap();
        assert_eq!(client.gateway_address(), addr);

        let text = client.generate_content("rank these").await.unwrap();
        assert_eq!(text, r#"{"ids":[3,1,2]}"#);
        handle.abort();
    }

    #[tokio::test]
    async fn test_gateway_status_becomes_request_error() {
        let (addr, handle) = start_mock_gateway("ok").await;
        let client = GrpcLlmClient::connect(addr).await.unwrap();
        let err = client.generate_content("please fail").await.unwrap_err();
        assert!(matches!(err, LlmClientError::Request(_)));
        handle.abort();
    }

    #[tokio::test]
    async fn test_blank_reply_is_empty_response() {
        let (addr, handle) = start_mock_gateway("   ").await;
        let client = GrpcLlmClient::connect(addr).await.unwrap().with_model("small");
        assert!(matches!(
            client.generate_content("rank").await,
            Err(LlmClientError::EmptyResponse)
        ));
        handle.abort();
    }

    #[test]
    fn test_invalid_address_is_rejected() {
        assert!(matches!(
            GrpcLlmClient::connect_lazy("not a uri"),
            Err(LlmClientError::InvalidAddress { .. })
        ));
    }
}
