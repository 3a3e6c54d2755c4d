use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Mutex;

use prost::Message;
use prost_reflect::DescriptorPool;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::Channel;
use tonic_reflection::pb::v1;
use tonic_reflection::pb::v1::server_reflection_client::ServerReflectionClient as V1Client;
use tonic_reflection::pb::v1alpha;

use crate::error::{ProxyError, Result};

const VERSION_UNKNOWN: u8 = 0;
const VERSION_V1: u8 = 1;
const VERSION_V1ALPHA: u8 = 2;

/// Talks gRPC Server Reflection against the backend, building a descriptor
/// pool as it goes. Negotiates v1 vs v1alpha once, then sticks with whichever
/// worked (matches the auto-negotiating reflection clients in most gRPC
/// ecosystems: try v1, fall back to v1alpha on Unimplemented).
pub struct ReflectionClient {
    channel: Channel,
    pool: Mutex<DescriptorPool>,
    version: AtomicU8,
}

impl ReflectionClient {
    pub fn new(channel: Channel) -> Self {
        ReflectionClient {
            channel,
            pool: Mutex::new(DescriptorPool::new()),
            version: AtomicU8::new(VERSION_UNKNOWN),
        }
    }

    /// List every service the backend exposes, including the reflection
    /// service itself -- callers filter that out.
    pub async fn list_services(&self) -> Result<Vec<String>> {
        let msg = v1::server_reflection_request::MessageRequest::ListServices(String::new());
        let resp = self.reflect(msg).await?;
        match resp {
            v1::server_reflection_response::MessageResponse::ListServicesResponse(list) => {
                Ok(list.service.into_iter().map(|s| s.name).collect())
            }
            _ => Err(ProxyError::Descriptor(
                "unexpected reflection response for list_services".into(),
            )),
        }
    }

    /// Fetch and merge into the pool the file descriptor containing `symbol`
    /// (a fully-qualified service, message, or other named element), along
    /// with its transitive dependencies.
    pub async fn ensure_symbol(&self, symbol: &str) -> Result<()> {
        let msg =
            v1::server_reflection_request::MessageRequest::FileContainingSymbol(symbol.into());
        let resp = self.reflect(msg).await?;
        if let v1::server_reflection_response::MessageResponse::FileDescriptorResponse(fdr) = resp
        {
            self.add_file_descriptors(&fdr.file_descriptor_proto)
                .await?;
        }
        Ok(())
    }

    /// Snapshot the pool built so far.
    pub fn pool(&self) -> Result<DescriptorPool> {
        let pool = self
            .pool
            .lock()
            .map_err(|_| ProxyError::Descriptor("reflection pool lock poisoned".into()))?;
        Ok(pool.clone())
    }

    async fn reflect(
        &self,
        message_request: v1::server_reflection_request::MessageRequest,
    ) -> Result<v1::server_reflection_response::MessageResponse> {
        let cached = self.version.load(Ordering::Relaxed);
        match cached {
            VERSION_V1 => return self.reflect_v1(message_request).await,
            VERSION_V1ALPHA => return self.reflect_v1alpha(message_request).await,
            _ => {}
        }

        match self.reflect_v1(message_request.clone()).await {
            Ok(resp) => {
                self.version.store(VERSION_V1, Ordering::Relaxed);
                Ok(resp)
            }
            Err(e) if is_unimplemented(&e) => {
                let resp = self.reflect_v1alpha(message_request).await?;
                self.version.store(VERSION_V1ALPHA, Ordering::Relaxed);
                Ok(resp)
            }
            Err(e) => Err(e),
        }
    }

    async fn reflect_v1(
        &self,
        message_request: v1::server_reflection_request::MessageRequest,
    ) -> Result<v1::server_reflection_response::MessageResponse> {
        let request = v1::ServerReflectionRequest {
            host: String::new(),
            message_request: Some(message_request),
        };

        let (tx, rx) = mpsc::channel(1);
        tx.send(request)
            .await
            .map_err(|_| ProxyError::Other("failed to send reflection request".into()))?;
        drop(tx);

        let mut client = V1Client::new(self.channel.clone());
        let req = tonic::Request::new(ReceiverStream::new(rx));
        let response = client
            .server_reflection_info(req)
            .await
            .map_err(map_status_error)?;

        let mut stream = response.into_inner();
        let resp = stream
            .message()
            .await?
            .ok_or_else(|| ProxyError::Other("empty reflection response stream".into()))?;

        extract_response(resp.message_response)
    }

    async fn reflect_v1alpha(
        &self,
        message_request: v1::server_reflection_request::MessageRequest,
    ) -> Result<v1::server_reflection_response::MessageResponse> {
        let alpha_request = convert_request_to_v1alpha(message_request);

        let (tx, rx) = mpsc::channel(1);
        tx.send(alpha_request)
            .await
            .map_err(|_| ProxyError::Other("failed to send reflection request".into()))?;
        drop(tx);

        let mut client =
            v1alpha::server_reflection_client::ServerReflectionClient::new(self.channel.clone());
        let req = tonic::Request::new(ReceiverStream::new(rx));
        let response = client
            .server_reflection_info(req)
            .await
            .map_err(map_status_error)?;

        let mut stream = response.into_inner();
        let resp = stream
            .message()
            .await?
            .ok_or_else(|| ProxyError::Other("empty reflection response stream".into()))?;

        convert_response_from_v1alpha(resp)
    }

    /// Merge serialized `FileDescriptorProto`s into the pool, recursively
    /// fetching any missing dependency (e.g. well-known types) from the
    /// backend first so `add_file_descriptor_set` never sees a dangling
    /// import.
    async fn add_file_descriptors(&self, serialized_fds: &[Vec<u8>]) -> Result<()> {
        let new_files = {
            let pool = self
                .pool
                .lock()
                .map_err(|_| ProxyError::Descriptor("reflection pool lock poisoned".into()))?;
            let mut files = Vec::new();
            for bytes in serialized_fds {
                let fdp = prost_types::FileDescriptorProto::decode(bytes.as_slice())
                    .map_err(|e| ProxyError::Descriptor(format!("decoding file descriptor: {e}")))?;
                let file_name = fdp.name.as_deref().unwrap_or("");
                if pool.get_file_by_name(file_name).is_some() {
                    continue;
                }
                files.push(fdp);
            }
            files
        };

        if new_files.is_empty() {
            return Ok(());
        }

        let missing = {
            let pool = self
                .pool
                .lock()
                .map_err(|_| ProxyError::Descriptor("reflection pool lock poisoned".into()))?;
            let new_names: std::collections::HashSet<_> =
                new_files.iter().filter_map(|f| f.name.as_deref()).collect();
            let mut missing_files = Vec::new();
            for fdp in &new_files {
                for dep in &fdp.dependency {
                    if pool.get_file_by_name(dep).is_none() && !new_names.contains(dep.as_str()) {
                        missing_files.push(dep.clone());
                    }
                }
            }
            missing_files
        };

        for dep_name in missing {
            let msg = v1::server_reflection_request::MessageRequest::FileByFilename(dep_name);
            if let Ok(v1::server_reflection_response::MessageResponse::FileDescriptorResponse(
                fdr,
            )) = self.reflect(msg).await
            {
                Box::pin(self.add_file_descriptors(&fdr.file_descriptor_proto)).await?;
            }
        }

        let mut pool = self
            .pool
            .lock()
            .map_err(|_| ProxyError::Descriptor("reflection pool lock poisoned".into()))?;
        let final_files: Vec<_> = new_files
            .into_iter()
            .filter(|fdp| {
                let name = fdp.name.as_deref().unwrap_or("");
                pool.get_file_by_name(name).is_none()
            })
            .collect();
        if !final_files.is_empty() {
            let fds = prost_types::FileDescriptorSet {
                file: final_files.clone(),
            };
            if pool.add_file_descriptor_set(fds).is_err() {
                // One dependency in the batch may still be unresolved; add
                // the rest one at a time rather than losing the whole batch.
                for fdp in final_files {
                    let name = fdp.name.clone().unwrap_or_else(|| "<unknown>".into());
                    let single = prost_types::FileDescriptorSet { file: vec![fdp] };
                    if let Err(e) = pool.add_file_descriptor_set(single) {
                        eprintln!("warning: skipping file descriptor {name}: {e}");
                    }
                }
            }
        }
        Ok(())
    }
}

fn map_status_error(status: tonic::Status) -> ProxyError {
    if status.code() == tonic::Code::Unimplemented {
        ProxyError::ReflectionUnavailable
    } else {
        ProxyError::Transport(status)
    }
}

fn is_unimplemented(err: &ProxyError) -> bool {
    matches!(err, ProxyError::ReflectionUnavailable)
        || matches!(err, ProxyError::Transport(s) if s.code() == tonic::Code::Unimplemented)
}

fn extract_response(
    msg: Option<v1::server_reflection_response::MessageResponse>,
) -> Result<v1::server_reflection_response::MessageResponse> {
    let msg = msg.ok_or_else(|| ProxyError::Other("reflection response has no message".into()))?;

    if let v1::server_reflection_response::MessageResponse::ErrorResponse(ref err) = msg {
        return Err(ProxyError::Descriptor(format!(
            "reflection error (code {}): {}",
            err.error_code, err.error_message
        )));
    }

    Ok(msg)
}

fn convert_request_to_v1alpha(
    msg: v1::server_reflection_request::MessageRequest,
) -> v1alpha::ServerReflectionRequest {
    use v1::server_reflection_request::MessageRequest;
    let alpha_msg = match msg {
        MessageRequest::FileByFilename(s) => {
            v1alpha::server_reflection_request::MessageRequest::FileByFilename(s)
        }
        MessageRequest::FileContainingSymbol(s) => {
            v1alpha::server_reflection_request::MessageRequest::FileContainingSymbol(s)
        }
        MessageRequest::FileContainingExtension(ext) => {
            v1alpha::server_reflection_request::MessageRequest::FileContainingExtension(
                v1alpha::ExtensionRequest {
                    containing_type: ext.containing_type,
                    extension_number: ext.extension_number,
                },
            )
        }
        MessageRequest::AllExtensionNumbersOfType(s) => {
            v1alpha::server_reflection_request::MessageRequest::AllExtensionNumbersOfType(s)
        }
        MessageRequest::ListServices(s) => {
            v1alpha::server_reflection_request::MessageRequest::ListServices(s)
        }
    };
    v1alpha::ServerReflectionRequest {
        host: String::new(),
        message_request: Some(alpha_msg),
    }
}

fn convert_response_from_v1alpha(
    resp: v1alpha::ServerReflectionResponse,
) -> Result<v1::server_reflection_response::MessageResponse> {
    use v1alpha::server_reflection_response::MessageResponse;
    let msg = resp
        .message_response
        .ok_or_else(|| ProxyError::Other("reflection response has no message".into()))?;

    let v1_msg = match msg {
        MessageResponse::FileDescriptorResponse(fdr) => {
            v1::server_reflection_response::MessageResponse::FileDescriptorResponse(
                v1::FileDescriptorResponse {
                    file_descriptor_proto: fdr.file_descriptor_proto,
                },
            )
        }
        MessageResponse::AllExtensionNumbersResponse(ext) => {
            v1::server_reflection_response::MessageResponse::AllExtensionNumbersResponse(
                v1::ExtensionNumberResponse {
                    base_type_name: ext.base_type_name,
                    extension_number: ext.extension_number,
                },
            )
        }
        MessageResponse::ListServicesResponse(list) => {
            v1::server_reflection_response::MessageResponse::ListServicesResponse(
                v1::ListServiceResponse {
                    service: list
                        .service
                        .into_iter()
                        .map(|s| v1::ServiceResponse { name: s.name })
                        .collect(),
                },
            )
        }
        MessageResponse::ErrorResponse(err) => {
            return Err(ProxyError::Descriptor(format!(
                "reflection error (code {}): {}",
                err.error_code, err.error_message
            )));
        }
    };

    Ok(v1_msg)
}
