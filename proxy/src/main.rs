mod cli;

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use clap::Parser;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use proxy_core::config::SchemaMethod;
use proxy_core::{Config, CryptoEngineKind, CryptoMaterials, DescriptorRegistry, RouteTable, StreamDirector};

use cli::Cli;

#[tokio::main]
async fn main() {
    std::process::exit(run().await);
}

async fn run() -> i32 {
    let cli = Cli::parse();

    let config = match Config::load(Path::new(&cli.config)) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e}");
            return 1;
        }
    };

    let crypto_kind = match CryptoEngineKind::from_str(&cli.crypto) {
        Ok(kind) => kind,
        Err(_) => {
            eprintln!(
                "error: unknown crypto engine '{}' (expected native or foreign)",
                cli.crypto
            );
            return 1;
        }
    };

    let registry = match build_registry(&config).await {
        Ok(registry) => registry,
        Err(e) => {
            eprintln!("error: {e}");
            return 1;
        }
    };

    let crypto = match CryptoMaterials::load(&config.cms, crypto_kind) {
        Ok(crypto) => crypto,
        Err(e) => {
            eprintln!("error: {e}");
            return 1;
        }
    };

    let routes = RouteTable::from_config(&config);

    let director = StreamDirector::new(
        Arc::new(registry),
        Arc::new(routes),
        Arc::new(crypto),
        config.backend.address.clone(),
    );

    let listener = match TcpListener::bind(&config.server.listen_address).await {
        Ok(listener) => listener,
        Err(e) => {
            eprintln!("error: failed to bind {}: {e}", config.server.listen_address);
            return 1;
        }
    };
    eprintln!("listening on {}", config.server.listen_address);

    let shutdown = CancellationToken::new();
    let ctrl_c_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        eprintln!("shutting down...");
        ctrl_c_shutdown.cancel();
    });

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => {
                let (stream, _peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        eprintln!("accept error: {e}");
                        continue;
                    }
                };
                let director = director.clone();
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);
                    let builder = hyper::server::conn::http2::Builder::new(TokioExecutor::new());
                    if let Err(e) = builder.serve_connection(io, director).await {
                        eprintln!("connection error: {e}");
                    }
                });
            }
        }
    }

    0
}

/// Build the descriptor registry per `schema.method`: either from a
/// pre-compiled `FileDescriptorSet` on disk, or by dialing the backend and
/// walking its gRPC Server Reflection service.
async fn build_registry(config: &proxy_core::Config) -> proxy_core::Result<DescriptorRegistry> {
    match config.schema.method {
        SchemaMethod::Pb => {
            let path = config
                .schema
                .pb_path
                .as_deref()
                .expect("validated at config load: pb method always has a pb_path");
            DescriptorRegistry::from_file_descriptor_set(Path::new(path))
        }
        SchemaMethod::Reflect => {
            let channel = proxy_core::connection::dial_backend(&config.backend.address).await?;
            DescriptorRegistry::from_reflection(channel).await
        }
    }
}
