use tokio::sync::mpsc;
use tokio_stream::{wrappers::ReceiverStream, StreamExt};
use tonic::{Request, Response, Status, Streaming};

use crate::pb;

/// Bounded channel depth for the streaming echo's response side.
const STREAM_BUFFER: usize = 16;

pub struct EchoServiceImpl;

#[tonic::async_trait]
impl pb::echo_service_server::EchoService for EchoServiceImpl {
    async fn unary_echo(
        &self,
        request: Request<pb::EchoRequest>,
    ) -> Result<Response<pb::EchoResponse>, Status> {
        let message = request.into_inner().message;
        Ok(Response::new(pb::EchoResponse {
            message: format!("Backend says: {message}"),
        }))
    }
}

pub struct SecureServiceImpl;

#[tonic::async_trait]
impl pb::secure_service_server::SecureService for SecureServiceImpl {
    async fn secure_echo(
        &self,
        request: Request<pb::SecureEnvelope>,
    ) -> Result<Response<pb::SecureEnvelope>, Status> {
        Ok(Response::new(request.into_inner()))
    }

    type SecureEchoStreamStream = ReceiverStream<Result<pb::SecureEnvelope, Status>>;

    async fn secure_echo_stream(
        &self,
        request: Request<Streaming<pb::SecureEnvelope>>,
    ) -> Result<Response<Self::SecureEchoStreamStream>, Status> {
        let mut inbound = request.into_inner();
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);

        tokio::spawn(async move {
            while let Some(envelope) = inbound.next().await {
                match envelope {
                    Ok(envelope) => {
                        if tx.send(Ok(envelope)).await.is_err() {
                            return;
                        }
                    }
                    Err(status) => {
                        let _ = tx.send(Err(status)).await;
                        return;
                    }
                }
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }
}
