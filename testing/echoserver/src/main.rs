use clap::Parser;
use tonic::transport::Server;
use tonic_reflection::server::Builder as ReflectionBuilder;

use echoserver::{pb, service};

#[derive(Parser, Debug)]
#[command(name = "echoserver", about = "Demo backend for the gRPC proxy")]
struct Cli {
    /// Port to listen on (0 for ephemeral).
    #[arg(short = 'p', long = "port", default_value_t = 0)]
    port: u16,

    /// Disable server reflection.
    #[arg(long = "noreflect")]
    noreflect: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let addr: std::net::SocketAddr = format!("127.0.0.1:{}", cli.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;
    println!("Listening on {}", local_addr);

    let echo_service = pb::echo_service_server::EchoServiceServer::new(service::EchoServiceImpl);
    let secure_service =
        pb::secure_service_server::SecureServiceServer::new(service::SecureServiceImpl);

    let mut builder = Server::builder();

    if !cli.noreflect {
        let reflection_service = ReflectionBuilder::configure()
            .register_encoded_file_descriptor_set(pb::FILE_DESCRIPTOR_SET)
            .build_v1()?;

        let reflection_service_alpha = ReflectionBuilder::configure()
            .register_encoded_file_descriptor_set(pb::FILE_DESCRIPTOR_SET)
            .build_v1alpha()?;

        builder
            .add_service(reflection_service)
            .add_service(reflection_service_alpha)
            .add_service(echo_service)
            .add_service(secure_service)
            .serve_with_incoming(tokio_stream::wrappers::TcpListenerStream::new(listener))
            .await?;
    } else {
        builder
            .add_service(echo_service)
            .add_service(secure_service)
            .serve_with_incoming(tokio_stream::wrappers::TcpListenerStream::new(listener))
            .await?;
    }

    Ok(())
}
