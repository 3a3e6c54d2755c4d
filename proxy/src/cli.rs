use clap::Parser;

#[derive(Parser)]
#[command(name = "proxy", about = "Message-aware gRPC reverse proxy")]
pub struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "config.yaml")]
    pub config: String,

    /// Which crypto engine backs signing/verification: native (RustCrypto) or
    /// foreign (the extern "C" stand-in).
    #[arg(long, default_value = "native")]
    pub crypto: String,
}
