use tonic::metadata::MetadataMap;

/// Copy every entry of `inbound` into a fresh `MetadataMap` suitable for
/// attaching to the outbound request the director opens against the backend.
///
/// Mirroring happens exactly once, when the outbound call is built; the
/// transport handles trailers on its own from that point on (§4.6's "no
/// subsequent propagation of trailers beyond what the transport already
/// handles").
pub fn mirror(inbound: &MetadataMap) -> MetadataMap {
    let mut outbound = MetadataMap::new();
    for kv in inbound.iter() {
        match kv {
            tonic::metadata::KeyAndValueRef::Ascii(key, value) => {
                outbound.append(key.clone(), value.clone());
            }
            tonic::metadata::KeyAndValueRef::Binary(key, value) => {
                outbound.append_bin(key.clone(), value.clone());
            }
        }
    }
    outbound
}
