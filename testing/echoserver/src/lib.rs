pub mod service;

pub mod pb {
    tonic::include_proto!("echo");

    pub const FILE_DESCRIPTOR_SET: &[u8] = tonic::include_file_descriptor_set!("echo_descriptor");
}
