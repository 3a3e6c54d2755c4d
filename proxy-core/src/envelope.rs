use prost::Message;
use prost_reflect::{DynamicMessage, SerializeOptions, Value};

use crate::config::RouteMode;
use crate::crypto::CryptoMaterials;
use crate::descriptor::DescriptorRegistry;
use crate::route::RouteRule;

/// Which side of the call a frame belongs to, since a method's input and
/// output descriptors usually differ.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Request,
    Response,
}

/// Decode, inspect, and (depending on route mode) mutate one frame. Never
/// returns an error: any failure along the way falls back to the original
/// bytes, per the per-frame-recoverable error class.
pub fn process(
    method_id: &str,
    direction: Direction,
    bytes: Vec<u8>,
    rule: &RouteRule,
    registry: &DescriptorRegistry,
    crypto: &CryptoMaterials,
) -> Vec<u8> {
    if rule.mode == RouteMode::PassThru {
        return bytes;
    }

    let Some(method) = registry.method(method_id) else {
        return bytes;
    };
    let desc = match direction {
        Direction::Request => method.input(),
        Direction::Response => method.output(),
    };

    let msg = match DynamicMessage::decode(desc.clone(), bytes.as_slice()) {
        Ok(msg) => msg,
        Err(e) => {
            eprintln!("warning: {method_id}: failed to decode envelope, forwarding unchanged: {e}");
            return bytes;
        }
    };

    log_envelope(method_id, &msg);
    inspect_inner_payload(registry, rule, &msg);

    if rule.mode == RouteMode::InspectOuter {
        return bytes;
    }

    debug_assert_eq!(rule.mode, RouteMode::InspectVerifySign);
    verify_and_sign(method_id, bytes, rule, crypto, msg)
}

fn verify_and_sign(
    method_id: &str,
    original: Vec<u8>,
    rule: &RouteRule,
    crypto: &CryptoMaterials,
    mut msg: DynamicMessage,
) -> Vec<u8> {
    let payload = bytes_field(&msg, &rule.envelope.payload_field);
    let client_sig = bytes_field(&msg, &rule.envelope.client_sig_field);

    if !client_sig.is_empty() {
        if let Some(trust) = crypto.trust_anchor_pem() {
            match crypto.engine().verify(&payload, &client_sig, trust) {
                true => eprintln!("{method_id}: client signature verified"),
                false => eprintln!("{method_id}: client signature verification failed"),
            }
        }
    }

    let proxy_sig = match crypto.signing_key_pem() {
        Some(key) => match crypto.engine().sign(&payload, key) {
            Some(sig) => sig,
            None => {
                eprintln!("warning: {method_id}: signing failed, forwarding unchanged");
                return original;
            }
        },
        None => [b"proxy_signed_".as_slice(), &payload].concat(),
    };

    if write_bytes_field(&mut msg, &rule.envelope.proxy_sig_field, proxy_sig).is_err() {
        eprintln!(
            "warning: {method_id}: proxy_sig_field '{}' not present on message, forwarding unchanged",
            rule.envelope.proxy_sig_field
        );
        return original;
    }

    let _ = original;
    msg.encode_to_vec()
}

fn inspect_inner_payload(registry: &DescriptorRegistry, rule: &RouteRule, msg: &DynamicMessage) {
    let payload = bytes_field(msg, &rule.envelope.payload_field);
    let type_url = string_field(msg, &rule.envelope.type_url_field);
    if payload.is_empty() || type_url.is_empty() {
        return;
    }
    let Some(suffix) = type_url.rsplit_once('/').map(|(_, s)| s) else {
        return;
    };
    let Some(inner_desc) = registry.message_by_type_url_suffix(suffix) else {
        return;
    };
    match DynamicMessage::decode(inner_desc.clone(), payload.as_slice()) {
        Ok(inner) => log_envelope(&format!("inner:{suffix}"), &inner),
        Err(e) => eprintln!("warning: inner payload for type '{suffix}' failed to decode: {e}"),
    }
}

fn log_envelope(label: &str, msg: &DynamicMessage) {
    let options = SerializeOptions::new().stringify_64_bit_integers(true);
    let mut buf = Vec::new();
    let mut serializer = serde_json::Serializer::new(&mut buf);
    if msg.serialize_with_options(&mut serializer, &options).is_err() {
        return;
    }
    if let Ok(json) = String::from_utf8(buf) {
        eprintln!("{label}: {json}");
    }
}

/// Typed bytes-field read. Absent field, empty name, or type mismatch all
/// read as the typed zero (empty `Vec<u8>`).
fn bytes_field(msg: &DynamicMessage, name: &str) -> Vec<u8> {
    if name.is_empty() {
        return Vec::new();
    }
    let Some(field) = msg.descriptor().get_field_by_name(name) else {
        return Vec::new();
    };
    match msg.get_field(&field).as_ref() {
        Value::Bytes(b) => b.to_vec(),
        _ => Vec::new(),
    }
}

/// Typed string-field read. Absent field, empty name, or type mismatch all
/// read as the typed zero (empty string).
fn string_field(msg: &DynamicMessage, name: &str) -> String {
    if name.is_empty() {
        return String::new();
    }
    let Some(field) = msg.descriptor().get_field_by_name(name) else {
        return String::new();
    };
    match msg.get_field(&field).as_ref() {
        Value::String(s) => s.clone(),
        _ => String::new(),
    }
}

/// Typed bytes-field write. Fails distinctly when the field is absent (an
/// empty name is always treated as absent) so the caller can fall back to
/// forwarding the original frame.
fn write_bytes_field(msg: &mut DynamicMessage, name: &str, value: Vec<u8>) -> Result<(), ()> {
    if name.is_empty() {
        return Err(());
    }
    let Some(field) = msg.descriptor().get_field_by_name(name) else {
        return Err(());
    };
    msg.set_field(&field, Value::Bytes(value.into()));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EnvelopeConfig;
    use crate::crypto::{CryptoEngineKind, CryptoMaterials};
    use crate::route::Envelope;
    use prost_reflect::DescriptorPool;
    use prost_types::{
        DescriptorProto, FieldDescriptorProto, FileDescriptorProto, FileDescriptorSet,
        MethodDescriptorProto, ServiceDescriptorProto,
    };

    fn bytes_field_proto(name: &str, number: i32) -> FieldDescriptorProto {
        FieldDescriptorProto {
            name: Some(name.into()),
            number: Some(number),
            label: Some(1),
            r#type: Some(12), // TYPE_BYTES
            ..Default::default()
        }
    }

    fn string_field_proto(name: &str, number: i32) -> FieldDescriptorProto {
        FieldDescriptorProto {
            name: Some(name.into()),
            number: Some(number),
            label: Some(1),
            r#type: Some(9), // TYPE_STRING
            ..Default::default()
        }
    }

    fn registry_and_rule() -> (DescriptorRegistry, RouteRule) {
        let envelope = DescriptorProto {
            name: Some("SecureEnvelope".into()),
            field: vec![
                bytes_field_proto("payload", 1),
                string_field_proto("type_url", 2),
                bytes_field_proto("client_signature", 3),
                bytes_field_proto("proxy_signature", 4),
            ],
            ..Default::default()
        };
        let method = MethodDescriptorProto {
            name: Some("SecureEcho".into()),
            input_type: Some(".echo.SecureEnvelope".into()),
            output_type: Some(".echo.SecureEnvelope".into()),
            ..Default::default()
        };
        let service = ServiceDescriptorProto {
            name: Some("SecureService".into()),
            method: vec![method],
            ..Default::default()
        };
        let file = FileDescriptorProto {
            name: Some("echo.proto".into()),
            package: Some("echo".into()),
            message_type: vec![envelope],
            service: vec![service],
            syntax: Some("proto3".into()),
            ..Default::default()
        };
        let pool =
            DescriptorPool::from_file_descriptor_set(FileDescriptorSet { file: vec![file] })
                .unwrap();
        let registry = DescriptorRegistry::from_pool(pool);

        let rule = RouteRule {
            pattern: "/echo.SecureService/*".into(),
            mode: RouteMode::InspectVerifySign,
            envelope: Envelope {
                payload_field: "payload".into(),
                type_url_field: "type_url".into(),
                client_sig_field: "client_signature".into(),
                proxy_sig_field: "proxy_signature".into(),
                metadata_field: String::new(),
            },
        };
        let _ = EnvelopeConfig::default();
        (registry, rule)
    }

    fn encode_envelope(registry: &DescriptorRegistry, payload: &[u8]) -> Vec<u8> {
        let method = registry.method("/echo.SecureService/SecureEcho").unwrap();
        let desc = method.input();
        let mut msg = DynamicMessage::new(desc.clone());
        msg.set_field(
            &desc.get_field_by_name("payload").unwrap(),
            Value::Bytes(payload.to_vec().into()),
        );
        msg.encode_to_vec()
    }

    #[test]
    fn pass_thru_never_decodes() {
        let (registry, mut rule) = registry_and_rule();
        rule.mode = RouteMode::PassThru;
        let crypto = CryptoMaterials::for_test(CryptoEngineKind::Native);
        let garbage = vec![0xff, 0xfe, 0xfd];
        let out = process(
            "/echo.SecureService/SecureEcho",
            Direction::Request,
            garbage.clone(),
            &rule,
            &registry,
            &crypto,
        );
        assert_eq!(out, garbage);
    }

    #[test]
    fn inspect_outer_returns_original_bytes_unmodified() {
        let (registry, mut rule) = registry_and_rule();
        rule.mode = RouteMode::InspectOuter;
        let crypto = CryptoMaterials::for_test(CryptoEngineKind::Native);
        let original = encode_envelope(&registry, b"abc");
        let out = process(
            "/echo.SecureService/SecureEcho",
            Direction::Request,
            original.clone(),
            &rule,
            &registry,
            &crypto,
        );
        assert_eq!(out, original);
    }

    #[test]
    fn inspect_verify_sign_injects_proxy_signature_and_preserves_payload() {
        let (registry, rule) = registry_and_rule();
        let crypto = CryptoMaterials::for_test(CryptoEngineKind::Native);
        let original = encode_envelope(&registry, b"abc");
        let out = process(
            "/echo.SecureService/SecureEcho",
            Direction::Request,
            original.clone(),
            &rule,
            &registry,
            &crypto,
        );
        assert_ne!(out, original);

        let method = registry.method("/echo.SecureService/SecureEcho").unwrap();
        let decoded = DynamicMessage::decode(method.input().clone(), out.as_slice()).unwrap();
        let payload = bytes_field(&decoded, "payload");
        let sig = bytes_field(&decoded, "proxy_signature");
        assert_eq!(payload, b"abc");
        assert!(!sig.is_empty());
        assert!(crypto.engine().verify(&payload, &sig, crypto.trust_anchor_pem().unwrap()));
    }

    #[test]
    fn unknown_method_id_is_forwarded_unchanged() {
        let (registry, rule) = registry_and_rule();
        let crypto = CryptoMaterials::for_test(CryptoEngineKind::Native);
        let garbage = vec![1, 2, 3];
        let out = process(
            "/does.not/Exist",
            Direction::Request,
            garbage.clone(),
            &rule,
            &registry,
            &crypto,
        );
        assert_eq!(out, garbage);
    }

    #[test]
    fn undecodable_bytes_are_forwarded_unchanged() {
        let (registry, rule) = registry_and_rule();
        let crypto = CryptoMaterials::for_test(CryptoEngineKind::Native);
        let garbage = vec![0xff, 0xff, 0xff, 0xff, 0xff];
        let out = process(
            "/echo.SecureService/SecureEcho",
            Direction::Request,
            garbage.clone(),
            &rule,
            &registry,
            &crypto,
        );
        assert_eq!(out, garbage);
    }

    #[test]
    fn write_to_absent_field_falls_back_to_original_bytes() {
        let (registry, mut rule) = registry_and_rule();
        rule.envelope.proxy_sig_field = "does_not_exist".into();
        let crypto = CryptoMaterials::for_test(CryptoEngineKind::Native);
        let original = encode_envelope(&registry, b"abc");
        let out = process(
            "/echo.SecureService/SecureEcho",
            Direction::Request,
            original.clone(),
            &rule,
            &registry,
            &crypto,
        );
        assert_eq!(out, original);
    }

    #[test]
    fn empty_field_names_read_as_typed_zero() {
        let (registry, _) = registry_and_rule();
        let msg = DynamicMessage::new(
            registry
                .method("/echo.SecureService/SecureEcho")
                .unwrap()
                .input()
                .clone(),
        );
        assert_eq!(bytes_field(&msg, ""), Vec::<u8>::new());
        assert_eq!(string_field(&msg, ""), String::new());
    }
}
