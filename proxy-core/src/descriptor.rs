use std::collections::HashMap;
use std::path::Path;

use prost::Message;
use prost_reflect::{DescriptorPool, MessageDescriptor, MethodDescriptor};
use tonic::transport::Channel;

use crate::error::{ProxyError, Result};
use crate::reflection::ReflectionClient;

const RESERVED_SERVICES: &[&str] = &[
    "grpc.reflection.v1.ServerReflection",
    "grpc.reflection.v1alpha.ServerReflection",
];

/// The complete, immutable view of the backend's protobuf schema, built once
/// at startup. Looks up a method by its wire path (`/pkg.Service/Method`) and
/// a message by the suffix of a type URL (`type.googleapis.com/pkg.Msg`'s
/// `pkg.Msg`, or any shorter dotted suffix of it).
pub struct DescriptorRegistry {
    pool: DescriptorPool,
    methods: HashMap<String, MethodDescriptor>,
    messages: Vec<(String, MessageDescriptor)>,
}

impl DescriptorRegistry {
    /// Build the registry from a pre-compiled `FileDescriptorSet` on disk
    /// (`schema.method: pb`).
    pub fn from_file_descriptor_set(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path).map_err(|e| {
            ProxyError::Descriptor(format!(
                "reading descriptor set '{}': {e}",
                path.display()
            ))
        })?;
        let fds = prost_types::FileDescriptorSet::decode(bytes.as_slice())
            .map_err(|e| ProxyError::Descriptor(format!("decoding descriptor set: {e}")))?;
        let pool = DescriptorPool::from_file_descriptor_set(fds)
            .map_err(|e| ProxyError::Descriptor(format!("building descriptor pool: {e}")))?;
        Ok(Self::from_pool(pool))
    }

    /// Build the registry by walking every service the backend exposes over
    /// gRPC Server Reflection (`schema.method: reflect`). Unlike a CLI that
    /// resolves symbols on demand, a proxy needs every method routable from
    /// the first request, so this eagerly enumerates and fetches all of them.
    pub async fn from_reflection(channel: Channel) -> Result<Self> {
        let client = ReflectionClient::new(channel);
        let services = client.list_services().await?;
        if services.iter().all(|s| RESERVED_SERVICES.contains(&s.as_str())) {
            return Err(ProxyError::Descriptor(
                "backend reflection reported no application services".into(),
            ));
        }
        for service in &services {
            if RESERVED_SERVICES.contains(&service.as_str()) {
                continue;
            }
            client.ensure_symbol(service).await?;
        }
        let pool = client.pool()?;
        Ok(Self::from_pool(pool))
    }

    pub(crate) fn from_pool(pool: DescriptorPool) -> Self {
        let mut methods = HashMap::new();
        let mut messages = Vec::new();
        let mut seen_messages = std::collections::HashSet::new();

        for service in pool.services() {
            for method in service.methods() {
                let method_id = format!("/{}/{}", service.full_name(), method.name());
                for msg in [method.input(), method.output()] {
                    let name = msg.full_name().to_string();
                    if seen_messages.insert(name.clone()) {
                        messages.push((name, msg));
                    }
                }
                methods.insert(method_id, method);
            }
        }

        DescriptorRegistry {
            pool,
            methods,
            messages,
        }
    }

    /// Look up a method by its wire path, e.g. `/echo.EchoService/UnaryEcho`.
    pub fn method(&self, method_id: &str) -> Option<&MethodDescriptor> {
        self.methods.get(method_id)
    }

    /// Find a message type whose fully-qualified name ends with `suffix`
    /// (matched on a `.`-boundary). Used to resolve a type URL's trailing
    /// component against the registry without requiring an exact package
    /// match, since a type URL's host/prefix is not meaningful here.
    ///
    /// First match in registration order wins; an ambiguous suffix shared by
    /// two unrelated messages is a misconfiguration the proxy does not try
    /// to disambiguate.
    pub fn message_by_type_url_suffix(&self, suffix: &str) -> Option<&MessageDescriptor> {
        self.messages.iter().find_map(|(fqn, msg)| {
            let matches = fqn == suffix
                || fqn
                    .strip_suffix(suffix)
                    .is_some_and(|rest| rest.ends_with('.'));
            matches.then_some(msg)
        })
    }

    pub fn pool(&self) -> &DescriptorPool {
        &self.pool
    }
}
