use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_stream::stream;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::{IntoStreamingRequest, Request, Response, Status, Streaming};

use crate::codec::RawBytesCodec;
use crate::connection;
use crate::crypto::CryptoMaterials;
use crate::descriptor::DescriptorRegistry;
use crate::envelope::{self, Direction};
use crate::metadata;
use crate::route::RouteTable;

/// Backlog of in-flight frames the client-to-server pump may buffer before the
/// outbound call catches up. Deliberately small: this is message-aware request
/// forwarding, not a queue meant to decouple the two sides indefinitely.
const PUMP_BUFFER: usize = 16;

/// Builds one [`DirectorCall`] per inbound request and drives it through
/// `tonic::server::Grpc`. This is the piece that stands in for the
/// named-service dispatch `tonic::transport::Server` would otherwise generate
/// from a `.proto` file: here every method path the backend exposes is only
/// known at runtime, from the descriptor registry, so routing has to happen
/// per-request instead of being baked into a generated `Service` impl.
#[derive(Clone)]
pub struct StreamDirector {
    registry: Arc<DescriptorRegistry>,
    routes: Arc<RouteTable>,
    crypto: Arc<CryptoMaterials>,
    backend_address: Arc<str>,
}

impl StreamDirector {
    pub fn new(
        registry: Arc<DescriptorRegistry>,
        routes: Arc<RouteTable>,
        crypto: Arc<CryptoMaterials>,
        backend_address: impl Into<Arc<str>>,
    ) -> Self {
        StreamDirector {
            registry,
            routes,
            crypto,
            backend_address: backend_address.into(),
        }
    }

    /// Handle one HTTP/2 request of any method path. Always returns a
    /// response; failures are encoded as a gRPC status in the trailers rather
    /// than surfaced as an HTTP-level error, matching how `tonic::server::Grpc`
    /// itself behaves.
    pub async fn handle<B>(&self, req: http::Request<B>) -> http::Response<tonic::body::Body>
    where
        B: http_body::Body<Data = bytes::Bytes> + Send + 'static,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>> + Send,
    {
        let method_id = req.uri().path().to_string();
        let call = DirectorCall {
            method_id,
            backend_address: Arc::clone(&self.backend_address),
            registry: Arc::clone(&self.registry),
            routes: Arc::clone(&self.routes),
            crypto: Arc::clone(&self.crypto),
        };
        let mut grpc = tonic::server::Grpc::new(RawBytesCodec::default());
        grpc.streaming(call, req).await
    }
}

/// A single RPC's worth of state, constructed fresh for every request so that
/// `method_id` and the route it resolves to never leak across calls.
#[derive(Clone)]
struct DirectorCall {
    method_id: String,
    backend_address: Arc<str>,
    registry: Arc<DescriptorRegistry>,
    routes: Arc<RouteTable>,
    crypto: Arc<CryptoMaterials>,
}

type BoxStream = Pin<Box<dyn tokio_stream::Stream<Item = Result<Vec<u8>, Status>> + Send + 'static>>;

impl tonic::server::StreamingService<Vec<u8>> for DirectorCall {
    type Response = Vec<u8>;
    type ResponseStream = BoxStream;
    type Future =
        Pin<Box<dyn Future<Output = Result<Response<Self::ResponseStream>, Status>> + Send + 'static>>;

    fn call(&mut self, request: Request<Streaming<Vec<u8>>>) -> Self::Future {
        let this = self.clone();
        Box::pin(async move { this.run(request).await })
    }
}

impl DirectorCall {
    /// Dial the backend, open the paired outbound call, and spin up the two
    /// pumps. Any failure to even reach the backend is a per-RPC fatal error
    /// and is returned as a `Status` before any frame is forwarded; once both
    /// pumps are running, failures on either side only ever cancel the shared
    /// scope, they never panic the task.
    async fn run(
        self,
        request: Request<Streaming<Vec<u8>>>,
    ) -> Result<Response<BoxStream>, Status> {
        let rule = self.routes.match_method(&self.method_id);
        let outbound_metadata = metadata::mirror(request.metadata());

        let channel = connection::dial_backend(&self.backend_address)
            .await
            .map_err(|e| Status::unavailable(e.to_string()))?;

        let (tx, rx) = mpsc::channel::<Vec<u8>>(PUMP_BUFFER);
        let cancel = CancellationToken::new();
        let (err_tx, err_rx) = oneshot::channel::<Status>();

        let mut inbound = request.into_inner();
        let method_id = self.method_id.clone();
        let registry = Arc::clone(&self.registry);
        let crypto = Arc::clone(&self.crypto);
        let c2s_rule = rule.clone();
        let c2s_cancel = cancel.clone();

        // Client-to-server pump: reads frames off the inbound stream in
        // order, processes each per the route, and forwards it. Dropping `tx`
        // on the way out half-closes the outbound call exactly once, after
        // every prior frame has already been sent.
        let c2s = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = c2s_cancel.cancelled() => break,
                    frame = inbound.message() => {
                        match frame {
                            Ok(Some(bytes)) => {
                                let out = envelope::process(
                                    &method_id,
                                    Direction::Request,
                                    bytes,
                                    &c2s_rule,
                                    &registry,
                                    &crypto,
                                );
                                if tx.send(out).await.is_err() {
                                    break;
                                }
                            }
                            Ok(None) => break,
                            Err(status) => {
                                c2s_cancel.cancel();
                                let _ = err_tx.send(status);
                                break;
                            }
                        }
                    }
                }
            }
        });

        let mut outbound_request = ReceiverStream::new(rx).into_streaming_request();
        *outbound_request.metadata_mut() = outbound_metadata;

        let path = match http::uri::PathAndQuery::try_from(self.method_id.as_str()) {
            Ok(path) => path,
            Err(e) => {
                cancel.cancel();
                return Err(Status::internal(format!("invalid method path: {e}")));
            }
        };

        let mut client = tonic::client::Grpc::new(channel);
        if let Err(e) = client.ready().await {
            cancel.cancel();
            return Err(Status::unavailable(format!("backend not ready: {e}")));
        }
        let response = match client
            .streaming(outbound_request, path, RawBytesCodec::default())
            .await
        {
            Ok(response) => response,
            Err(status) => {
                cancel.cancel();
                return Err(status);
            }
        };

        let response_metadata = response.metadata().clone();
        let mut backend_stream = response.into_inner();

        let method_id = self.method_id;
        let registry = self.registry;
        let crypto = self.crypto;
        let s2c_cancel = cancel.clone();
        let mut err_rx = err_rx;

        let response_stream = stream! {
            loop {
                tokio::select! {
                    biased;
                    Ok(status) = &mut err_rx => {
                        yield Err(status);
                        break;
                    }
                    frame = backend_stream.message() => {
                        match frame {
                            Ok(Some(bytes)) => {
                                let out = envelope::process(
                                    &method_id,
                                    Direction::Response,
                                    bytes,
                                    &rule,
                                    &registry,
                                    &crypto,
                                );
                                yield Ok(out);
                            }
                            Ok(None) => break,
                            Err(status) => {
                                s2c_cancel.cancel();
                                yield Err(status);
                                break;
                            }
                        }
                    }
                }
            }
            let _ = c2s.await;
        };

        let mut resp = Response::new(Box::pin(response_stream) as BoxStream);
        *resp.metadata_mut() = response_metadata;
        Ok(resp)
    }
}

/// Lets a [`StreamDirector`] serve HTTP/2 connections directly through hyper,
/// bypassing `tonic::transport::Server`'s router (which dispatches on a fixed
/// set of service names baked in at build time and has no way to route a
/// method the proxy only discovers at startup from the descriptor registry).
impl hyper::service::Service<http::Request<hyper::body::Incoming>> for StreamDirector {
    type Response = http::Response<tonic::body::Body>;
    type Error = std::convert::Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn call(&self, req: http::Request<hyper::body::Incoming>) -> Self::Future {
        let this = self.clone();
        Box::pin(async move { Ok(this.handle(req).await) })
    }
}
