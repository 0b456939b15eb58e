use std::cmp::min;
use std::convert::TryFrom;
use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::mem::MaybeUninit;
use std::net::{
    AddrParseError, IpAddr, Ipv4Addr, Shutdown, SocketAddr, SocketAddrV4, TcpListener, TcpStream,
};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, RawFd};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Local};
use nix::errno::Errno;
use nix::sys::select::{select, FdSet};
use nix::sys::signal::{signal, SigHandler, Signal};
use nix::unistd::chdir;

const SERVER_NAME: &str = "Tiny Web Server";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_DOCUMENT: &str = "home.html";
const DYNAMIC_MARKER: &str = "cgi-bin";
const DEFAULT_CONTENT_TYPE: &str = "text/plain";
const SENDFILE_SIZE_LIMIT: usize = 1 << 20;

// Bounds on what a client may send before the request is dropped.
const MAX_LINE_LENGTH: usize = 8192;
const MAX_HEADER_LINES: usize = 100;

// How long, and how much, to drain after replying before the socket is closed.
const LINGER_TIMEOUT: Duration = Duration::from_millis(500);
const LINGER_MAX_BYTES: u64 = 1 << 16;

const OWNER_READ: u32 = libc::S_IRUSR as u32;
const OWNER_EXECUTE: u32 = libc::S_IXUSR as u32;

static RUNNING: AtomicBool = AtomicBool::new(true);

extern "C" fn stop_running(_signal: libc::c_int) {
    RUNNING.store(false, Ordering::Relaxed);
}

fn is_running() -> bool {
    RUNNING.load(Ordering::Relaxed)
}

fn main() -> Result<()> {
    println!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));

    let server = Server::from_command_line()?;

    if let Some(root) = &server.root {
        chdir(root.as_path())
            .with_context(|| format!("failed to change working directory to {}", root.display()))?;
        println!("serving documents from `{}'", root.display());
    }

    let listener = server.create_listener()?;

    // set signal handlers
    unsafe { signal(Signal::SIGPIPE, SigHandler::SigIgn) }
        .context("failed to set SIGPIPE handler")?;
    unsafe { signal(Signal::SIGINT, SigHandler::Handler(stop_running)) }
        .context("failed to set SIGINT handler")?;
    unsafe { signal(Signal::SIGTERM, SigHandler::Handler(stop_running)) }
        .context("failed to set SIGTERM handler")?;

    let server = Arc::new(server);

    // main loop
    while is_running() {
        httpd_poll(&server, &listener);
    }

    if !server.logs_to_stdout() {
        server.stats.print()?;
    }
    Ok(())
}

/// Where to put the access log.
#[derive(Debug)]
enum LogSink {
    Stdout,
    Syslog,
    File(BufWriter<File>),
}
impl LogSink {
    fn log(&mut self, message: &str) -> std::io::Result<()> {
        match self {
            Self::Stdout => {
                print!("{}", message);
            }
            Self::Syslog => {
                let message = CString::new(message)
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
                let format = b"%s\0".as_ptr() as *const libc::c_char;
                unsafe { libc::syslog(libc::LOG_INFO, format, message.as_ptr()) };
            }
            Self::File(file) => {
                write!(file, "{}", message)?;
                file.flush()?;
            }
        }
        Ok(())
    }
}
impl Default for LogSink {
    fn default() -> Self {
        Self::Stdout
    }
}

#[derive(Debug, Default)]
struct Server {
    bindaddr: Option<String>,
    bindport: u16,
    root: Option<PathBuf>,
    timeout: Option<Duration>,
    concurrent: bool,
    log_sink: Mutex<LogSink>,
    stats: ServerStats,
}
impl Server {
    fn from_command_line() -> Result<Self> {
        let mut args = std::env::args();
        let name = args.next().unwrap_or_else(|| env!("CARGO_PKG_NAME").to_string());
        Self::from_args(&name, args)
    }
    fn from_args<I: Iterator<Item = String>>(name: &str, mut args: I) -> Result<Self> {
        let mut server = Self {
            timeout: Some(DEFAULT_TIMEOUT),
            ..Default::default()
        };
        let mut port = None;
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--help" => {
                    print!("{}", Usage(name));
                    std::process::exit(0);
                }
                "--addr" => {
                    server.bindaddr = Some(args.next().context("missing ip after --addr")?);
                }
                "--root" => {
                    let dir = args.next().context("missing directory after --root")?;
                    server.root = Some(PathBuf::from(dir));
                }
                "--timeout" => {
                    let number = args.next().context("missing number after --timeout")?;
                    let timeout_secs = number
                        .parse::<u64>()
                        .with_context(|| format!("timeout number {} is invalid", number))?;
                    server.timeout = match timeout_secs {
                        0 => None,
                        timeout_secs => Some(Duration::from_secs(timeout_secs)),
                    };
                }
                "--log" => {
                    let filename = args.next().context("missing filename after --log")?;
                    server.log_sink = Mutex::new(LogSink::File(BufWriter::new(
                        OpenOptions::new()
                            .append(true)
                            .create(true)
                            .open(&filename)
                            .with_context(|| format!("failed to open log file {}", filename))?,
                    )));
                }
                "--syslog" => server.log_sink = Mutex::new(LogSink::Syslog),
                "--concurrent" => server.concurrent = true,
                flag if flag.starts_with("--") => {
                    return Err(anyhow!("unknown argument `{}'", flag));
                }
                positional => {
                    if port.is_some() {
                        return Err(anyhow!("unexpected argument `{}'", positional));
                    }
                    port = Some(
                        positional
                            .parse::<u16>()
                            .with_context(|| format!("port number {} is invalid", positional))?,
                    );
                }
            }
        }
        match port {
            Some(port) => server.bindport = port,
            None => {
                eprint!("{}", Usage(name));
                std::process::exit(1);
            }
        }
        Ok(server)
    }
    fn socket_addr(&self) -> Result<SocketAddr, AddrParseError> {
        let addr = Ipv4Addr::from_str(self.bindaddr.as_deref().unwrap_or("0.0.0.0"))?;
        Ok(SocketAddr::V4(SocketAddrV4::new(addr, self.bindport)))
    }
    /// Initialize the TcpListener. This is the socket that we accept connections from.
    fn create_listener(&self) -> Result<TcpListener> {
        let socket_addr = self.socket_addr().context("malformed --addr argument")?;
        let listener = TcpListener::bind(socket_addr)
            .with_context(|| format!("failed to create listening socket for {}", socket_addr))?;
        println!("listening on: http://{}/", socket_addr);
        Ok(listener)
    }
    fn logs_to_stdout(&self) -> bool {
        match self.log_sink.lock() {
            Ok(sink) => matches!(*sink, LogSink::Stdout),
            Err(_) => true,
        }
    }
    fn log(&self, message: &str) {
        let result = match self.log_sink.lock() {
            Ok(mut sink) => sink.log(message),
            Err(_) => return,
        };
        if let Err(e) = result {
            eprintln!("warning: failed to write log message: {}", e);
        }
    }
}

/// Command line help text.
struct Usage<'a>(&'a str);

impl<'a> std::fmt::Display for Usage<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "usage:\t{} <port> [flags]\n\n\
            flags:\t--addr ip (default: all)\n\
            \t\tIf multiple interfaces are present, specifies\n\
            \t\twhich one to bind the listening port to.\n\n\
            \t--root dir (default: current directory)\n\
            \t\tDocument tree to serve files and programs from.\n\n\
            \t--timeout secs (default: {})\n\
            \t\tIf a client is silent for more than this many seconds,\n\
            \t\tthe connection is dropped. Set to zero to disable timeouts.\n\n\
            \t--log filename (default: stdout)\n\
            \t\tSpecifies which file to append the request log to.\n\n\
            \t--syslog\n\
            \t\tUse syslog for request log.\n\n\
            \t--concurrent\n\
            \t\tHandle each connection on its own thread instead of\n\
            \t\tone request at a time.\n\n",
            self.0,
            DEFAULT_TIMEOUT.as_secs(),
        )
    }
}

#[derive(Debug, Default)]
struct ServerStats {
    num_requests: AtomicU64,
    total_in: AtomicU64,
    total_out: AtomicU64,
}
impl ServerStats {
    fn print(&self) -> Result<()> {
        let rusage = getrusage().context("failed to get resource usage")?;
        println!(
            "CPU time used: {}.{:02} user, {}.{:02} system",
            rusage.ru_utime.tv_sec,
            rusage.ru_utime.tv_usec / 10000,
            rusage.ru_stime.tv_sec,
            rusage.ru_stime.tv_usec / 10000,
        );
        println!("Requests: {}", self.num_requests.load(Ordering::Relaxed));
        println!(
            "Bytes: {} in, {} out",
            self.total_in.load(Ordering::Relaxed),
            self.total_out.load(Ordering::Relaxed)
        );
        Ok(())
    }
}

/// Safe wrapper for `libc::getrusage`.
fn getrusage() -> std::io::Result<libc::rusage> {
    let mut rusage = MaybeUninit::<libc::rusage>::zeroed();
    if unsafe { libc::getrusage(libc::RUSAGE_SELF, rusage.as_mut_ptr()) } == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(unsafe { rusage.assume_init() })
}

/// The first line of a request, split into its three fields.
#[derive(Debug, Clone, Default, PartialEq)]
struct Request {
    method: String,
    target: String,
    version: String,
}
impl Request {
    /// Split a request line on whitespace. Missing fields are left empty and extra fields are
    /// ignored.
    fn parse(line: &str) -> Self {
        let mut fields = line.split_whitespace().map(str::to_string);
        Self {
            method: fields.next().unwrap_or_default(),
            target: fields.next().unwrap_or_default(),
            version: fields.next().unwrap_or_default(),
        }
    }
    fn is_get(&self) -> bool {
        self.method.eq_ignore_ascii_case("GET")
    }
}

/// Where a request target lives on disk, and whether it is a program to run.
#[derive(Debug, Clone, PartialEq)]
struct ResolvedResource {
    is_dynamic: bool,
    filesystem_path: String,
    query_args: String,
}
impl ResolvedResource {
    /// Map a raw request target to a path relative to the working directory.
    ///
    /// Any target containing `cgi-bin` is dynamic, and has its query string split off at the
    /// first `?`. Static targets are used verbatim, with the default document appended to
    /// directory targets.
    fn resolve(target: &str) -> Self {
        if target.contains(DYNAMIC_MARKER) {
            let (path, query_args) = match target.find('?') {
                Some(index) => (&target[..index], &target[index + 1..]),
                None => (target, ""),
            };
            Self {
                is_dynamic: true,
                filesystem_path: format!(".{}", path),
                query_args: query_args.to_string(),
            }
        } else {
            let mut filesystem_path = format!(".{}", target);
            if target.ends_with('/') {
                filesystem_path.push_str(DEFAULT_DOCUMENT);
            }
            Self {
                is_dynamic: false,
                filesystem_path,
                query_args: String::new(),
            }
        }
    }
}

/// What a single stat of the resolved path says about it.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct FileMetadata {
    exists: bool,
    is_regular_file: bool,
    readable: bool,
    executable: bool,
    size_bytes: u64,
}
impl FileMetadata {
    fn query(path: &str) -> Self {
        match std::fs::metadata(path) {
            Ok(metadata) => Self::from_metadata(&metadata),
            Err(_) => Self::default(),
        }
    }
    fn from_metadata(metadata: &std::fs::Metadata) -> Self {
        let mode = metadata.permissions().mode();
        Self {
            exists: true,
            is_regular_file: metadata.is_file(),
            readable: mode & OWNER_READ != 0,
            executable: mode & OWNER_EXECUTE != 0,
            size_bytes: metadata.len(),
        }
    }
}

/// Request failures that are reported to the client with an error page.
#[derive(Debug, Clone, Copy, PartialEq)]
enum HttpError {
    NotImplemented,
    NotFound,
    Forbidden,
}
impl HttpError {
    fn code(self) -> u16 {
        match self {
            Self::NotImplemented => 501,
            Self::NotFound => 404,
            Self::Forbidden => 403,
        }
    }
    fn short_message(self) -> &'static str {
        match self {
            Self::NotImplemented => "Not implemented",
            Self::NotFound => "Not found",
            Self::Forbidden => "Forbidden",
        }
    }
}

/// Content type table, checked in order. The first extension found anywhere in the name wins.
const CONTENT_TYPES: &[(&str, &str)] = &[
    (".html", "text/html"),
    (".gif", "image/gif"),
    (".png", "image/png"),
    (".jpg", "image/jpeg"),
];

/// Get content type for a filename.
fn content_type(filename: &str) -> &'static str {
    CONTENT_TYPES
        .iter()
        .find(|(extension, _)| filename.contains(extension))
        .map(|(_, mimetype)| *mimetype)
        .unwrap_or(DEFAULT_CONTENT_TYPE)
}

/// Resolve //, /./, and /../ in a URL path.
///
/// Returns None if the path climbs above the root.
fn make_safe_url(url: &str) -> Option<String> {
    let mut url = url.as_bytes().to_vec();

    // URLs not starting with a slash are illegal.
    if !url.starts_with(&[b'/']) {
        return None;
    }

    let mut src_index = 0;
    let mut dst_index = 0;
    while src_index < url.len() {
        if url[src_index] == b'/' && url.get(src_index + 1) == Some(&b'/') {
            // skip slash
            src_index += 1;
        } else if url[src_index] == b'/'
            && url.get(src_index + 1) == Some(&b'.')
            && matches!(url.get(src_index + 2), Some(&b'/') | None)
        {
            // skip slash dot slash
            src_index += 2;
        } else if url[src_index] == b'/'
            && url.get(src_index + 1) == Some(&b'.')
            && url.get(src_index + 2) == Some(&b'.')
            && matches!(url.get(src_index + 3), Some(&b'/') | None)
        {
            // skip slash dot dot slash
            src_index += 3;
            // overwrite previous component
            loop {
                if dst_index == 0 {
                    return None;
                }
                dst_index -= 1;
                if url[dst_index] == b'/' {
                    break;
                }
            }
        } else {
            url[dst_index] = url[src_index];
            src_index += 1;
            dst_index += 1;
        }
    }

    // Always preserve leading slash
    dst_index = dst_index.max(1);
    url.truncate(dst_index);

    String::from_utf8(url).ok()
}

/// Escape < > & ' " into HTML entities.
struct HtmlEscaped<'a>(&'a str);

impl<'a> std::fmt::Display for HtmlEscaped<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for c in self.0.chars() {
            match c {
                '<' => write!(f, "&lt;")?,
                '>' => write!(f, "&gt;")?,
                '&' => write!(f, "&amp;")?,
                '\'' => write!(f, "&apos;")?,
                '"' => write!(f, "&quot;")?,
                c => write!(f, "{}", c)?,
            }
        }
        Ok(())
    }
}

/// Encode string for logging. Logs should not contain control characters or double quotes.
struct LogEncoded<'a>(&'a str);

impl<'a> std::fmt::Display for LogEncoded<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for c in self.0.chars() {
            if !c.is_ascii() || c.is_ascii_control() || c == '"' {
                let mut buf = [0; 4];
                c.encode_utf8(&mut buf);
                for b in buf.iter().take(c.len_utf8()) {
                    write!(f, "%{:02X}", b)?;
                }
            } else {
                write!(f, "{}", c)?;
            }
        }
        Ok(())
    }
}

/// Common Log Format (CLF) formatted date in local timezone.
struct ClfDate(SystemTime);

impl std::fmt::Display for ClfDate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let datetime = DateTime::<Local>::from(self.0);
        write!(f, "{}", datetime.format("[%d/%b/%Y:%H:%M:%S %z]"))
    }
}

#[derive(Debug)]
enum Body {
    Generated(String),
    /// An open file and the number of bytes to send from it.
    FromFile(File, u64),
    /// A program whose standard output becomes the rest of the response.
    FromProcess(Command),
}

/// A response ready to be written to the client. Headers are written in insertion order.
#[derive(Debug)]
struct Response {
    status_code: u16,
    status_text: &'static str,
    headers: Vec<(&'static str, String)>,
    body: Body,
}
impl Response {
    fn new(status_code: u16, status_text: &'static str, body: Body) -> Self {
        Self {
            status_code,
            status_text,
            headers: Vec::new(),
            body,
        }
    }
    fn header(mut self, name: &'static str, value: impl ToString) -> Self {
        self.headers.push((name, value.to_string()));
        self
    }
    /// Status line, headers, and the blank line that ends them.
    fn head(&self) -> String {
        let mut head = format!("HTTP/1.0 {} {}\r\n", self.status_code, self.status_text);
        for (name, value) in &self.headers {
            head.push_str(&format!("{}: {}\r\n", name, value));
        }
        if !matches!(self.body, Body::FromProcess(_)) {
            head.push_str("\r\n");
        }
        head
    }
}

/// A structured error page.
fn error_reply(error: HttpError, long_message: &str, cause: &str) -> Response {
    let body = format!(
        "<html><title>Tiny Error</title>\
        <body bgcolor=\"ffffff\">\r\n\
        {}: {}\r\n\
        <p>{}: {}\r\n\
        <hr><em>The Tiny Web server</em>\r\n",
        error.code(),
        error.short_message(),
        long_message,
        HtmlEscaped(cause),
    );
    let len = body.len();
    Response::new(error.code(), error.short_message(), Body::Generated(body))
        .header("Content-type", "text/html")
        .header("Content-length", len)
}

/// Open the file and describe it with the success header block.
///
/// The open is the authoritative permission check; the length sent is taken from the opened
/// handle rather than the earlier stat.
fn static_reply(resource: &ResolvedResource) -> Response {
    let path = &resource.filesystem_path;
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) => {
            return match e.kind() {
                std::io::ErrorKind::NotFound => {
                    error_reply(HttpError::NotFound, "Tiny couldn't find this file", path)
                }
                _ => error_reply(HttpError::Forbidden, "Tiny couldn't read the file", path),
            };
        }
    };
    let metadata = match file.metadata() {
        Ok(metadata) if metadata.is_file() => FileMetadata::from_metadata(&metadata),
        _ => return error_reply(HttpError::Forbidden, "Tiny couldn't read the file", path),
    };
    Response::new(200, "OK", Body::FromFile(file, metadata.size_bytes))
        .header("Server", SERVER_NAME)
        .header("Connection", "close")
        .header("Content-length", metadata.size_bytes)
        .header("Content-type", content_type(path))
}

/// Describe a program to run, with its query string passed as `QUERY_STRING`.
///
/// The environment override applies to the child only, so concurrent requests never see each
/// other's query strings.
fn dynamic_reply(resource: &ResolvedResource) -> Response {
    let mut command = Command::new(&resource.filesystem_path);
    command
        .env("QUERY_STRING", &resource.query_args)
        .stdin(Stdio::null());
    Response::new(200, "OK", Body::FromProcess(command)).header("Server", SERVER_NAME)
}

/// Decide how to answer a GET for `target`.
fn prepare_reply(target: &str) -> Response {
    if !target.starts_with('/') {
        return error_reply(HttpError::NotFound, "Tiny couldn't find this file", target);
    }

    let resource = ResolvedResource::resolve(target);
    if make_safe_url(&resource.filesystem_path[1..]).is_none() {
        return error_reply(
            HttpError::Forbidden,
            "Tiny won't serve files outside the document tree",
            &resource.filesystem_path,
        );
    }

    let metadata = FileMetadata::query(&resource.filesystem_path);
    if !metadata.exists {
        return error_reply(
            HttpError::NotFound,
            "Tiny couldn't find this file",
            &resource.filesystem_path,
        );
    }

    if resource.is_dynamic {
        if !metadata.is_regular_file || !metadata.executable {
            return error_reply(
                HttpError::Forbidden,
                "Tiny couldn't run the CGI program",
                &resource.filesystem_path,
            );
        }
        dynamic_reply(&resource)
    } else {
        if !metadata.is_regular_file || !metadata.readable {
            return error_reply(
                HttpError::Forbidden,
                "Tiny couldn't read the file",
                &resource.filesystem_path,
            );
        }
        static_reply(&resource)
    }
}

/// Read one line, including its terminator. Returns an empty buffer at end of stream.
fn read_line<R: BufRead>(reader: &mut R) -> Result<Vec<u8>> {
    let mut line = Vec::new();
    reader
        .take(MAX_LINE_LENGTH as u64)
        .read_until(b'\n', &mut line)
        .context("failed to read from client")?;
    if line.len() >= MAX_LINE_LENGTH && !line.ends_with(b"\n") {
        bail!("line longer than {} bytes", MAX_LINE_LENGTH);
    }
    Ok(line)
}

/// Consume header lines up to and including the blank line. Returns the number of bytes read.
fn skip_headers<R: BufRead>(reader: &mut R, max_lines: usize) -> Result<usize> {
    let mut total = 0;
    for _ in 0..max_lines {
        let line = read_line(reader)?;
        if line.is_empty() {
            bail!("connection closed before end of headers");
        }
        total += line.len();
        if line == b"\r\n" {
            return Ok(total);
        }
    }
    Err(anyhow!("more than {} header lines", max_lines))
}

/// Safe wrapper for `libc::sendfile64`.
fn sendfile64(
    out_fd: RawFd,
    in_fd: RawFd,
    offset: &mut libc::off64_t,
    count: usize,
) -> std::io::Result<usize> {
    let ret = unsafe { libc::sendfile64(out_fd, in_fd, offset as *mut _, count) };
    if ret == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(ret as usize)
}

/// Send exactly `len` bytes of `file`, or fail.
fn send_file(socket: &TcpStream, file: &File, len: u64) -> Result<u64> {
    let len = libc::off64_t::try_from(len).context("file too large")?;
    let mut offset: libc::off64_t = 0;
    while offset < len {
        // `off64_t` may be wider than `usize`, so saturate when casting.
        let remaining = usize::try_from(len - offset).unwrap_or(usize::MAX);
        let size = min(remaining, SENDFILE_SIZE_LIMIT); // Limit size per syscall.
        match sendfile64(socket.as_raw_fd(), file.as_raw_fd(), &mut offset, size) {
            Ok(0) => bail!("file shrank to {} bytes during transfer", offset),
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e).context("failed to send file"),
        }
    }
    Ok(offset as u64)
}

/// Run the program with its standard output attached to the client socket, and wait for it.
fn run_program(socket: &TcpStream, mut command: Command) -> Result<()> {
    let socket = socket
        .try_clone()
        .context("failed to duplicate client socket")?;
    let stdout = unsafe { Stdio::from_raw_fd(socket.into_raw_fd()) };
    let mut child = command
        .stdout(stdout)
        .spawn()
        .with_context(|| format!("failed to run {:?}", command.get_program()))?;
    let program = command.get_program().to_owned();
    // release our copy of the socket before blocking on the child
    drop(command);
    let status = child
        .wait()
        .with_context(|| format!("failed to wait for process {}", child.id()))?;
    if !status.success() {
        eprintln!("warning: {:?} exited with {}", program, status);
    }
    Ok(())
}

/// One accepted client and what has happened on it so far.
struct Connection {
    reader: BufReader<TcpStream>,
    client: IpAddr,
    request: Option<Request>,
    http_code: u16,
    total_in: usize,
    total_sent: Option<u64>,
}
impl Connection {
    fn new(socket: TcpStream, client: IpAddr) -> Self {
        Self {
            reader: BufReader::new(socket),
            client,
            request: None,
            http_code: 0,
            total_in: 0,
            total_sent: None,
        }
    }

    fn socket(&self) -> &TcpStream {
        self.reader.get_ref()
    }

    fn set_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.socket()
            .set_read_timeout(timeout)
            .context("failed to set read timeout")?;
        self.socket()
            .set_write_timeout(timeout)
            .context("failed to set write timeout")
    }

    /// Read the request line. Returns None if the client went away without sending anything.
    fn receive_request(&mut self) -> Result<Option<Request>> {
        let line = read_line(&mut self.reader)?;
        if line.is_empty() {
            return Ok(None);
        }
        self.total_in += line.len();
        Ok(Some(Request::parse(&String::from_utf8_lossy(&line))))
    }

    /// Write the response. Once the first byte is out there is no way to report an error page,
    /// so failures from here on are connection errors.
    fn send(&mut self, response: Response) -> Result<()> {
        self.http_code = response.status_code;
        let head = response.head();
        let mut socket = self.socket();
        socket
            .write_all(head.as_bytes())
            .context("failed to send header")?;
        let head_len = head.len() as u64;
        let total_sent = match response.body {
            Body::Generated(reply) => {
                socket
                    .write_all(reply.as_bytes())
                    .context("failed to send reply")?;
                Some(head_len + reply.len() as u64)
            }
            Body::FromFile(file, len) => Some(head_len + send_file(socket, &file, len)?),
            Body::FromProcess(command) => {
                run_program(socket, command)?;
                None
            }
        };
        self.total_sent = total_sent;
        Ok(())
    }

    /// Half-close, then discard whatever the client still sends so the reply isn't lost to a
    /// reset.
    fn close(self) {
        let socket = self.reader.into_inner();
        if socket.shutdown(Shutdown::Write).is_err() {
            return;
        }
        if socket.set_read_timeout(Some(LINGER_TIMEOUT)).is_ok() {
            std::io::copy(&mut (&socket).take(LINGER_MAX_BYTES), &mut std::io::sink()).ok();
        }
    }
}

/// Run one request through to completion: parse, check, and reply.
fn process_request(conn: &mut Connection) -> Result<()> {
    let request = match conn.receive_request()? {
        Some(request) => request,
        None => return Ok(()),
    };
    conn.request = Some(request.clone());

    if !request.is_get() {
        let reply = error_reply(
            HttpError::NotImplemented,
            "Tiny does not implement this method",
            &request.method,
        );
        return conn.send(reply);
    }

    conn.total_in += skip_headers(&mut conn.reader, MAX_HEADER_LINES)?;

    let reply = prepare_reply(&request.target);
    conn.send(reply)
}

/// Add a request's details to the log.
fn log_request(server: &Server, conn: &Connection, now: SystemTime) {
    let request = match &conn.request {
        Some(request) => request,
        None => return,
    };
    if conn.http_code == 0 {
        return; // died before replying
    }
    let sent = conn
        .total_sent
        .map(|sent| sent.to_string())
        .unwrap_or_else(|| "-".to_string());
    let message = format!(
        "{} - - {} \"{} {} {}\" {} {}\n",
        conn.client,
        ClfDate(now),
        LogEncoded(&request.method),
        LogEncoded(&request.target),
        LogEncoded(&request.version),
        conn.http_code,
        sent,
    );
    server.log(&message);
}

/// Handle everything for one accepted connection, then close it.
fn handle_connection(server: &Server, socket: TcpStream, client: IpAddr) {
    let mut conn = Connection::new(socket, client);

    let result = conn
        .set_timeout(server.timeout)
        .and_then(|()| process_request(&mut conn));

    if conn.request.is_some() {
        server.stats.num_requests.fetch_add(1, Ordering::Relaxed);
    }
    server
        .stats
        .total_in
        .fetch_add(conn.total_in as u64, Ordering::Relaxed);
    if let Some(sent) = conn.total_sent {
        server.stats.total_out.fetch_add(sent, Ordering::Relaxed);
    }

    match result {
        Ok(()) => log_request(server, &conn, SystemTime::now()),
        Err(e) => eprintln!("warning: {}: {:#}", client, e),
    }
    conn.close();
}

/// Accept a connection from TcpListener and handle it, either right here or on its own thread.
fn accept_connection(server: &Arc<Server>, listener: &TcpListener) {
    let (stream, addr) = match listener.accept() {
        Ok((stream, addr)) => (stream, addr),
        Err(e) => {
            eprintln!("warning: accept() failed: {}", e);
            return;
        }
    };

    if server.concurrent {
        let server = Arc::clone(server);
        let spawned = std::thread::Builder::new()
            .name(format!("conn-{}", addr))
            .spawn(move || handle_connection(&server, stream, addr.ip()));
        if let Err(e) = spawned {
            eprintln!("warning: failed to spawn connection thread: {}", e);
        }
    } else {
        handle_connection(server, stream, addr.ip());
    }
}

/// Wait for the listener to become readable, so that signals can interrupt the wait, then
/// accept.
fn httpd_poll(server: &Arc<Server>, listener: &TcpListener) {
    let mut recv_set = FdSet::new();
    recv_set.insert(listener.as_raw_fd());

    match select(None, Some(&mut recv_set), None, None, None) {
        Ok(_) => {}
        Err(e) => {
            if e.as_errno() == Some(Errno::EINTR) {
                return; // interrupted by signal
            } else {
                eprintln!("warning: select() failed: {}", e);
                return;
            }
        }
    }

    if recv_set.contains(listener.as_raw_fd()) {
        accept_connection(server, listener);
    }
}
