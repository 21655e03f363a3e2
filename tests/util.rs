use std::fs;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::thread::sleep;
use std::time::Duration;

use tempfile::{tempdir, TempDir};

fn get_unused_port() -> Option<u16> {
    TcpListener::bind(("localhost", 0))
        .ok()
        .map(|listener| listener.local_addr().unwrap().port())
}

fn wait_for_port(port: u16) -> bool {
    for _ in 0..1000 {
        if let Ok(_) = TcpStream::connect(("localhost", port)) {
            return true;
        }
        sleep(Duration::from_millis(1));
    }
    false
}

struct ScopedChild(Child);

impl Drop for ScopedChild {
    fn drop(&mut self) {
        self.0.kill().ok();
    }
}

impl From<Child> for ScopedChild {
    fn from(child: Child) -> Self {
        ScopedChild(child)
    }
}

pub struct Server {
    _child: ScopedChild,
    port: u16,
    root: TempDir,
}
impl Server {
    pub fn with_args(args: &[&str]) -> Self {
        let root = tempdir().expect("failed to create tempdir");
        // The resolver requires world permissions from the document root on
        // down; tempdir() creates the directory mode 700.
        fs::set_permissions(root.path(), fs::Permissions::from_mode(0o755))
            .expect("failed to set root permissions");

        // Get an unused port. Assumes the port won't be reused before we start
        // the server.
        let port = get_unused_port().expect("failed to get unused port");

        let child = Command::new(env!("CARGO_BIN_EXE_thirteen"))
            .args(&[
                "--root",
                root.path().to_str().expect("path is not valid UTF-8"),
                "--listen",
                &format!("127.0.0.1:{}", port),
                "--serverhost",
                "localhost",
            ])
            .args(args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("failed to spawn thirteen")
            .into();

        // Create server early so it will be dropped if it fails to start.
        let server = Self {
            _child: child,
            port,
            root,
        };

        // Wait until the socket is open.
        assert!(wait_for_port(port), "failed to connect to thirteen");

        server
    }
    pub fn port(&self) -> u16 {
        self.port
    }
    pub fn root(&self) -> &Path {
        self.root.path()
    }
    pub fn create_dir(&self, name: &str) {
        let path = self.root.path().join(name);
        fs::create_dir(&path).expect("failed to create directory");
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755))
            .expect("failed to set directory permissions");
    }
    pub fn create_file(&self, name: &str, contents: &[u8]) {
        self.create_file_with_mode(name, contents, 0o644);
    }
    pub fn create_file_with_mode(&self, name: &str, contents: &[u8], mode: u32) {
        let path = self.root.path().join(name);
        fs::write(&path, contents).expect("failed to create file");
        fs::set_permissions(&path, fs::Permissions::from_mode(mode))
            .expect("failed to set file permissions");
    }
    /// Write an executable shell script the server can run as a CGI.
    pub fn create_cgi(&self, name: &str, script: &str) {
        let path = self.root.path().join(name);
        fs::write(&path, format!("#!/bin/sh\n{}\n", script)).expect("failed to create script");
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755))
            .expect("failed to set script permissions");
    }
    pub fn stream(&self) -> TcpStream {
        let stream =
            TcpStream::connect(("localhost", self.port)).expect("failed to connect to thirteen");
        // Set timeouts to prevent tests from hanging
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
            .set_write_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
    }
    /// Send one selector line and read the whole response.
    pub fn request(&self, selector: &str) -> Vec<u8> {
        self.raw_request(format!("{}\r\n", selector).as_bytes())
    }
    pub fn raw_request(&self, request: &[u8]) -> Vec<u8> {
        let mut stream = self.stream();
        stream.write_all(request).expect("failed to write request");
        let mut buf = Vec::new();
        stream
            .read_to_end(&mut buf)
            .expect("failed to read response");
        buf
    }
    /// The error menu entry the server renders for a status message.
    pub fn error_entry(&self, message: &str) -> Vec<u8> {
        format!("3{}\t\tlocalhost\t{}\r\n.\r\n", message, self.port).into_bytes()
    }
}
