// Each integration test file is compiled as its own binary crate and pulls in
// its own copy of this module; helpers unused by a given binary would
// otherwise trigger spurious dead_code warnings there.
#![allow(dead_code)]

use std::io::Write;
use std::net::TcpListener;
use std::path::PathBuf;
use std::process::{Child, Command};
use std::time::{Duration, Instant};

use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::RsaPrivateKey;

/// Bind to an ephemeral port and immediately release it, handing the proxy or
/// echoserver a port the OS just proved is free.
pub fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .expect("failed to bind ephemeral port")
        .local_addr()
        .unwrap()
        .port()
}

/// Block until something is accepting connections on `port`, or panic.
pub fn wait_for_port(port: u16, timeout: Duration) {
    let start = Instant::now();
    loop {
        if std::net::TcpStream::connect_timeout(
            &format!("127.0.0.1:{port}").parse().unwrap(),
            Duration::from_millis(100),
        )
        .is_ok()
        {
            return;
        }
        if start.elapsed() > timeout {
            panic!("timed out waiting for a listener on port {port}");
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}

/// The `echoserver` binary is a workspace member, not a dependency of the
/// `proxy` package's test binary, so Cargo does not set `CARGO_BIN_EXE_echoserver`
/// for it. Both binaries land in the same target directory, though, so the
/// path is derived relative to the proxy test binary's own sibling `proxy`
/// executable -- the same trick the reference crate's CLI tests use to find
/// `testserver` from `grpcurl`'s `CARGO_BIN_EXE_grpcurl`.
pub fn echoserver_bin() -> PathBuf {
    let proxy_bin = PathBuf::from(env!("CARGO_BIN_EXE_proxy"));
    let target_dir = proxy_bin.parent().expect("proxy binary has no parent dir");
    target_dir.join("echoserver")
}

/// A running `echoserver` instance on an ephemeral port, with reflection left
/// enabled so `schema.method: reflect` proxy configs can resolve it.
pub struct EchoBackend {
    process: Child,
    pub addr: String,
}

impl EchoBackend {
    pub fn start() -> Self {
        let port = free_port();
        let process = Command::new(echoserver_bin())
            .args(["--port", &port.to_string()])
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn()
            .unwrap_or_else(|e| panic!("failed to start echoserver: {e}"));
        wait_for_port(port, Duration::from_secs(10));
        EchoBackend {
            process,
            addr: format!("127.0.0.1:{port}"),
        }
    }
}

impl Drop for EchoBackend {
    fn drop(&mut self) {
        let _ = self.process.kill();
        let _ = self.process.wait();
    }
}

/// A running `proxy` instance pointed at a given backend, configured from a
/// YAML string written to a temp file.
pub struct ProxyUnderTest {
    process: Child,
    pub addr: String,
    _dir: tempfile::TempDir,
}

impl ProxyUnderTest {
    /// `config_template` must contain the literal placeholder
    /// `{listen_address}` where `server.listen_address` belongs; the harness
    /// picks a free port and substitutes it in before writing the file, since
    /// the test needs to know the address before the proxy process exists.
    pub fn start(config_template: &str) -> Self {
        let port = free_port();
        let addr = format!("127.0.0.1:{port}");
        let config_yaml = config_template.replace("{listen_address}", &addr);

        let dir = tempfile::tempdir().expect("failed to create temp config dir");
        let config_path = dir.path().join("config.yaml");
        std::fs::write(&config_path, config_yaml).expect("failed to write config.yaml");

        let process = Command::new(env!("CARGO_BIN_EXE_proxy"))
            .args(["--config", config_path.to_str().unwrap()])
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn()
            .unwrap_or_else(|e| panic!("failed to start proxy: {e}"));
        wait_for_port(port, Duration::from_secs(10));

        ProxyUnderTest {
            process,
            addr,
            _dir: dir,
        }
    }
}

impl Drop for ProxyUnderTest {
    fn drop(&mut self) {
        let _ = self.process.kill();
        let _ = self.process.wait();
    }
}

/// A throwaway RSA keypair plus the PEM files a proxy config needs: the
/// private key it signs with, and the "trust store" PEM (really just the
/// matching SPKI public key -- see `crypto::read_trust_anchor`) it verifies
/// client signatures against.
pub struct TestKeypair {
    pub private_key: RsaPrivateKey,
    pub private_key_path: PathBuf,
    pub public_key_path: PathBuf,
    _dir: tempfile::TempDir,
}

impl TestKeypair {
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let private_key = RsaPrivateKey::new(&mut rng, 2048).expect("generate RSA test key");
        let public_key = rsa::RsaPublicKey::from(&private_key);

        let dir = tempfile::tempdir().expect("failed to create temp key dir");
        let private_key_path = dir.path().join("key.pem");
        let public_key_path = dir.path().join("trust.pem");

        let mut f = std::fs::File::create(&private_key_path).unwrap();
        f.write_all(
            private_key
                .to_pkcs8_pem(LineEnding::LF)
                .expect("encode private key")
                .as_bytes(),
        )
        .unwrap();

        let mut f = std::fs::File::create(&public_key_path).unwrap();
        f.write_all(
            public_key
                .to_public_key_pem(LineEnding::LF)
                .expect("encode public key")
                .as_bytes(),
        )
        .unwrap();

        TestKeypair {
            private_key,
            private_key_path,
            public_key_path,
            _dir: dir,
        }
    }
}
