use std::fs::{create_dir, set_permissions, Permissions};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread::sleep;
use std::time::Duration;
use tempfile::{tempdir, TempDir};

fn get_unused_port() -> Option<u16> {
    TcpListener::bind(("127.0.0.1", 0))
        .ok()
        .map(|listener| listener.local_addr().unwrap().port())
}

fn wait_for_port(port: u16) -> bool {
    for _ in 0..500 {
        if TcpStream::connect(("127.0.0.1", port)).is_ok() {
            return true;
        }
        sleep(Duration::from_millis(10));
    }
    false
}

struct ScopedChild(Child);

impl Drop for ScopedChild {
    fn drop(&mut self) {
        self.0.kill().ok();
        self.0.wait().ok();
    }
}

impl From<Child> for ScopedChild {
    fn from(child: Child) -> Self {
        ScopedChild(child)
    }
}

/// Path to the server binary built by cargo for these tests.
pub fn binary() -> &'static str {
    env!("CARGO_BIN_EXE_tiny-rs")
}

pub struct Server {
    _child: ScopedChild,
    port: u16,
    root: TempDir,
}
impl Server {
    pub fn new() -> Self {
        Self::start(&[], &[])
    }
    pub fn with_args(args: &[&str]) -> Self {
        Self::start(args, &[])
    }
    pub fn start(args: &[&str], envs: &[(&str, &str)]) -> Self {
        let root = tempdir().expect("failed to create tempdir");

        // Get an unused port. Assumes the port won't be reused before the server starts.
        let port = get_unused_port().expect("failed to get unused port");

        let child = Command::new(binary())
            .arg(port.to_string())
            .args(&[
                "--addr",
                "127.0.0.1",
                "--root",
                root.path().to_str().expect("path is not valid UTF-8"),
            ])
            .args(args)
            .envs(envs.iter().copied())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("failed to spawn server")
            .into();

        // Wait until the socket is open.
        assert!(wait_for_port(port), "failed to connect to server");

        Self {
            _child: child,
            port,
            root,
        }
    }
    pub fn root(&self) -> &Path {
        self.root.path()
    }
    pub fn create_dir(&self, name: &str) {
        create_dir(self.root().join(name)).expect("failed to create directory");
    }
    /// Create a file under the document root with the given contents and permission bits.
    pub fn create_file(&self, name: &str, contents: &[u8], mode: u32) -> PathBuf {
        let path = self.root().join(name);
        std::fs::write(&path, contents).expect("failed to write file");
        set_permissions(&path, Permissions::from_mode(mode)).expect("failed to set permissions");
        path
    }
    pub fn stream(&self) -> TcpStream {
        TcpStream::connect(("127.0.0.1", self.port)).expect("failed to connect to server")
    }
    /// Send raw request bytes and read the response until the server closes the connection.
    pub fn request(&self, request: &str) -> Response {
        let mut stream = self.stream();
        // Set timeouts to prevent tests from hanging
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
            .set_write_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream.write_all(request.as_bytes()).unwrap();
        let mut buf = Vec::new();
        stream
            .read_to_end(&mut buf)
            .expect("failed to read response");
        Response::from_bytes(&buf)
    }
    pub fn get(&self, target: &str) -> Response {
        self.request(&format!(
            "GET {} HTTP/1.0\r\nHost: localhost\r\nUser-Agent: tests\r\n\r\n",
            target
        ))
    }
}

/// HTTP Response from the server.
#[derive(Debug)]
pub struct Response {
    response_line: String,
    headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}
impl Response {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let split = find(b"\r\n\r\n", bytes).expect("response has no end of headers");
        let head = std::str::from_utf8(&bytes[..split]).expect("response header is not valid UTF-8");
        let mut lines = head.split("\r\n");
        let response_line = lines.next().expect("empty response").to_string();
        let headers = lines
            .map(|line| {
                let mut header = line.splitn(2, ": ");
                let key = header.next().expect("invalid header").to_string();
                let value = header.next().expect("invalid header").to_string();
                (key, value)
            })
            .collect();
        Self {
            response_line,
            headers,
            body: bytes[split + 4..].to_vec(),
        }
    }
    pub fn response_line(&self) -> &str {
        &self.response_line
    }
    pub fn status(&self) -> &str {
        self.response_line
            .splitn(2, ' ')
            .nth(1)
            .expect("invalid response line")
    }
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
    pub fn header_names(&self) -> Vec<&str> {
        self.headers.iter().map(|(key, _)| key.as_str()).collect()
    }
    pub fn text(&self) -> &str {
        std::str::from_utf8(&self.body).expect("body is not valid UTF-8")
    }
}

fn find(needle: &[u8], haystack: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
