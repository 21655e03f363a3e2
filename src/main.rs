use std::collections::HashSet;
use std::env;
use std::ffi::OsStr;
use std::fs::{self, File};
use std::io::{Cursor, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Local, SecondsFormat};
use nix::unistd::{setuid, User};
use once_cell::sync::Lazy;

const DEFAULT_SITE_ROOT: &str = "/srv/gopher";

// the PATH handed to CGI children
const SAFE_PATH: &str = "/usr/bin:/bin";

const MAX_REQUEST_SIZE: usize = 16384;
const READ_CHUNK_SIZE: usize = 4096;
const RESPONSE_CHUNK_SIZE: usize = 1000;

const CGI_EXT: &[u8] = b".cgi";

// Index files probed in each directory, in order of preference.
const INDEX_NAMES: &[&[u8]] = &[b"/index.cgi", b"/index.map"];

static REQUEST_COUNT: AtomicU64 = AtomicU64::new(0);
static BYTES_TRANSFERRED: AtomicU64 = AtomicU64::new(0);
static START_TIME: Lazy<Instant> = Lazy::new(Instant::now);

/// Prints message to standard error and exits with code 1.
macro_rules! abort {
    ($($arg:tt)*) => ({
        eprint!("{}: ", env!("CARGO_PKG_NAME"));
        eprintln!($($arg)*);
        std::process::exit(1);
    })
}

fn usage(config: &Config, argv0: &str) {
    let rtmo = config.request_timeout.map_or(0, |t| t.as_secs());
    let wtmo = config.response_timeout.map_or(0, |t| t.as_secs());
    print!(
        "usage:\t{} [flags]\n\n\
        flags:\t--desc text (default: none)\n\
        \t\tThe server description passed to CGI scripts.\n\n\
        \t--exclude extension\n\
        \t\tNever serve files with this extension. May be given\n\
        \t\tmultiple times; a leading dot is optional.\n\n\
        \t--listen [host:]port (default: {})\n\
        \t\tThe address to listen on. An empty host means all\n\
        \t\tinterfaces.\n\n\
        \t--maxconn number (default: {})\n\
        \t\tThe maximum number of simultaneous connections.\n\n\
        \t--root directory (default: {})\n\
        \t\tThe site root directory.\n\n\
        \t--rtmo seconds (default: {})\n\
        \t\tHow long to wait to receive a complete request.\n\
        \t\tSetting to 0 disables the request timeout (not\n\
        \t\trecommended).\n\n\
        \t--serverhost name (default: {})\n\
        \t\tThe server host name to include in menus.\n\n\
        \t--serverport port (default: the listen port)\n\
        \t\tThe port to include in menus.\n\n\
        \t--user name (default: don't change user)\n\
        \t\tThe user to run as after binding the listen port.\n\n\
        \t--wtmo seconds (default: {})\n\
        \t\tHow long to wait for progress to be made on the\n\
        \t\tresponse. Setting to 0 disables the response timeout.\n\n",
        argv0, config.listen, config.maxconn, config.root, rtmo, config.serverhost, wtmo,
    );
}

fn main() -> Result<()> {
    Lazy::force(&START_TIME);

    let mut config = Config::new();
    parse_commandline(&mut config)?;

    let (host, port) = parse_listen(&config.listen)?;
    if config.serverport == 0 {
        config.serverport = port;
    }

    if !config.root.starts_with('/') {
        let cwd = env::current_dir().context("failed to get working directory")?;
        config.root = format!("{}/{}", cwd.display(), config.root);
    }
    // Strip ending slashes so fs paths split cleanly into root and selector.
    while config.root.len() > 1 && config.root.ends_with('/') {
        config.root.pop();
    }

    let listener = match TcpListener::bind((host.as_str(), port)) {
        Ok(listener) => listener,
        Err(e) => abort!("failed to bind {}:{}: {}", host, port, e),
    };

    if !config.user.is_empty() {
        change_user(&config.user)?;
    }

    println!(
        "{}/{}, listening on gopher://{}:{}/",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        config.serverhost,
        config.serverport,
    );

    let semaphore = Semaphore::new(config.maxconn);
    let config = Arc::new(config);

    loop {
        let slot = Arc::clone(&semaphore).acquire();
        match listener.accept() {
            Ok((stream, peer)) => {
                let config = Arc::clone(&config);
                thread::spawn(move || handle_connection(stream, peer, config, slot));
            }
            // Failed to accept, but keep serving existing connections.
            Err(e) => eprintln!("warning: accept() failed: {}", e),
        }
    }
}

#[derive(Debug)]
struct Config {
    desc: String,
    listen: String,
    maxconn: usize,
    root: String,
    request_timeout: Option<Duration>,
    serverhost: String,
    serverport: u16,
    user: String,
    response_timeout: Option<Duration>,
    excluded: HashSet<Vec<u8>>,
}
impl Config {
    fn new() -> Self {
        Self {
            desc: String::new(),
            listen: "70".to_string(),
            maxconn: 1000,
            root: DEFAULT_SITE_ROOT.to_string(),
            request_timeout: Some(Duration::from_secs(60)),
            serverhost: "localhost".to_string(),
            serverport: 0,
            user: String::new(),
            response_timeout: Some(Duration::from_secs(300)),
            excluded: HashSet::new(),
        }
    }
}

fn parse_commandline(config: &mut Config) -> Result<()> {
    let mut args = env::args();

    let argv0 = args.next().expect("expected at least one argument");

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--help" => {
                usage(config, &argv0);
                std::process::exit(0);
            }
            "--desc" => {
                config.desc = args.next().context("missing text after --desc")?;
            }
            "--exclude" => {
                let extension = args.next().context("missing extension after --exclude")?;
                add_excluded(&mut config.excluded, &extension)?;
            }
            "--listen" => {
                config.listen = args.next().context("missing [host:]port after --listen")?;
            }
            "--maxconn" => {
                let number = args.next().context("missing number after --maxconn")?;
                let number: i64 = number
                    .parse()
                    .with_context(|| format!("maxconn number {} is invalid", number))?;
                if number < 1 {
                    return Err(anyhow!("maxconn must be at least 1"));
                }
                config.maxconn = number as usize;
            }
            "--root" => {
                config.root = args.next().context("missing directory after --root")?;
            }
            "--rtmo" => {
                config.request_timeout = parse_timeout(args.next(), "rtmo")?;
            }
            "--serverhost" => {
                config.serverhost = args.next().context("missing name after --serverhost")?;
            }
            "--serverport" => {
                let number = args.next().context("missing port after --serverport")?;
                config.serverport = number
                    .parse()
                    .with_context(|| format!("serverport number {} is invalid", number))?;
            }
            "--user" => {
                config.user = args.next().context("missing name after --user")?;
            }
            "--wtmo" => {
                config.response_timeout = parse_timeout(args.next(), "wtmo")?;
            }
            _ => {
                return Err(anyhow!("unknown argument `{}'", arg));
            }
        }
    }
    Ok(())
}

/// Parse a timeout flag value; 0 disables the timeout.
fn parse_timeout(arg: Option<String>, name: &str) -> Result<Option<Duration>> {
    let number = arg.with_context(|| format!("missing seconds after --{}", name))?;
    let secs: i64 = number
        .parse()
        .with_context(|| format!("{} number {} is invalid", name, number))?;
    if secs < 0 {
        return Err(anyhow!("{} must be at least 0", name));
    }
    Ok((secs > 0).then(|| Duration::from_secs(secs as u64)))
}

/// Register an extension that must never be served. A missing leading dot is
/// tolerated; an extension with an internal dot is rejected.
fn add_excluded(excluded: &mut HashSet<Vec<u8>>, extension: &str) -> Result<()> {
    if extension.is_empty() {
        return Ok(());
    }
    let extension = if extension.starts_with('.') {
        extension.to_string()
    } else {
        format!(".{}", extension)
    };
    if extension[1..].contains('.') {
        return Err(anyhow!("extension contains two or more dots"));
    }
    excluded.insert(extension.into_bytes());
    Ok(())
}

/// Split a `[host:]port` listen address at the last colon; an empty host
/// means the wildcard address.
fn parse_listen(listen: &str) -> Result<(String, u16)> {
    let (host, port) = match listen.rsplit_once(':') {
        Some((host, port)) => (host, port),
        None => ("", listen),
    };
    let port = port
        .parse::<u16>()
        .ok()
        .filter(|&port| port >= 1)
        .context("port must be between 1 and 65535")?;
    let host = if host.is_empty() { "0.0.0.0" } else { host };
    Ok((host.to_string(), port))
}

/// Look up a user by name and switch to their UID. Must run after the listen
/// port is bound.
fn change_user(username: &str) -> Result<()> {
    let user = User::from_name(username)
        .with_context(|| format!("getpwnam failed for `{}'", username))?
        .with_context(|| format!("no such user: `{}'", username))?;
    setuid(user.uid).with_context(|| format!("failed to set user ID to {}", user.uid))?;
    Ok(())
}

const OK_STATUS: u16 = 200;

/// Request-path failures, each with a fixed status and client message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResponseError {
    BadRequest,
    Forbidden,
    FileNotFound,
    InternalServerError,
}
impl ResponseError {
    fn status(self) -> u16 {
        match self {
            Self::BadRequest => 400,
            Self::Forbidden => 403,
            Self::FileNotFound => 404,
            Self::InternalServerError => 500,
        }
    }
    fn message(self) -> &'static str {
        match self {
            Self::BadRequest => "Bad request.",
            Self::Forbidden => "Forbidden.",
            Self::FileNotFound => "File not found.",
            Self::InternalServerError => "Internal server error.",
        }
    }
}

/// A response body plus the status to log and, for CGIs, the child to reap.
struct Response {
    reader: Box<dyn Read>,
    status: u16,
    child: Option<Child>,
}
impl Response {
    fn from_error(config: &Config, err: ResponseError) -> Self {
        let entry = dir_entry(b'3', err.message(), &config.serverhost, config.serverport);
        Response {
            reader: Box::new(Cursor::new(entry)),
            status: err.status(),
            child: None,
        }
    }
    /// Drop the body, then reap the CGI child, if any. The order matters: a
    /// child still writing only exits once its stdout pipe is closed.
    fn finish(self) {
        let Response { reader, child, .. } = self;
        drop(reader);
        if let Some(mut child) = child {
            child.wait().ok();
        }
    }
}

/// Format a Gopher menu entry followed by the menu terminator.
fn dir_entry(item_type: u8, text: &str, host: &str, port: u16) -> Vec<u8> {
    format!("{}{}\t\t{}\t{}\r\n.\r\n", item_type as char, text, host, port).into_bytes()
}

/// Everything the request log needs to know about one connection.
struct RequestInfo {
    host: String,
    request_time: DateTime<Local>,
    request: Vec<u8>,
    status: u16,
    transferred: u64,
}
impl RequestInfo {
    /// Update the global counters, then write one log line to stderr. The
    /// counters are bumped first so a log line never reports more than they
    /// hold.
    fn log(&self) {
        REQUEST_COUNT.fetch_add(1, Ordering::Relaxed);
        BYTES_TRANSFERRED.fetch_add(self.transferred, Ordering::Relaxed);

        let transferred = if self.transferred == 0 {
            "-".to_string()
        } else {
            self.transferred.to_string()
        };
        eprintln!(
            "{} - - [{}] \"{}\" {} {}",
            self.host,
            self.request_time.to_rfc3339_opts(SecondsFormat::Secs, false),
            LogQuoted(&self.request),
            self.status,
            transferred,
        );
    }
}

/// Render raw request bytes as a single printable log token.
struct LogQuoted<'a>(&'a [u8]);

impl<'a> std::fmt::Display for LogQuoted<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for &b in self.0 {
            match b {
                b'\t' => write!(f, "\\t")?,
                b'\r' => write!(f, "\\r")?,
                b'\n' => write!(f, "\\n")?,
                b'"' => write!(f, "\\\"")?,
                b'\\' => write!(f, "\\\\")?,
                0x20..=0x7e => write!(f, "{}", b as char)?,
                _ => write!(f, "\\x{:02x}", b)?,
            }
        }
        Ok(())
    }
}

/// Serve one connection: read the request, resolve it, stream the response
/// under the write-progress timeout, reap any CGI child, and log. The
/// concurrency slot passed in by the accept loop is released on return.
fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    config: Arc<Config>,
    _slot: SlotGuard,
) {
    let (request, mut response) = match read_request(&mut stream, config.request_timeout) {
        Ok(request) => {
            let response = response_for_request(&config, &peer, &split_request(&request));
            (request, response)
        }
        Err(err) => (Vec::new(), Response::from_error(&config, err)),
    };

    let mut info = RequestInfo {
        host: peer.ip().to_string(),
        request_time: Local::now(),
        request,
        status: response.status,
        transferred: 0,
    };

    // The write timeout applies to each write call separately, so every
    // chunk written below gets a fresh progress deadline.
    stream.set_write_timeout(config.response_timeout).ok();

    let mut buf = [0; RESPONSE_CHUNK_SIZE];
    'stream: loop {
        let n = match response.reader.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        // Count whatever actually reached the socket, even when a write
        // fails partway through a chunk.
        let mut written = 0;
        while written < n {
            match stream.write(&buf[written..n]) {
                Ok(0) | Err(_) => break 'stream,
                Ok(sent) => {
                    info.transferred += sent as u64;
                    written += sent;
                }
            }
        }
    }

    response.finish();
    info.log();
}

/// Read a request line from the client.
///
/// A request must end in LF or CR LF (a CR, if present, must be immediately
/// before the LF) and must not contain a NUL byte. The configured request
/// timeout bounds the whole read.
fn read_request(
    stream: &mut TcpStream,
    timeout: Option<Duration>,
) -> Result<Vec<u8>, ResponseError> {
    const INITIAL_REQUEST_SIZE: usize = 256;

    let deadline = timeout.map(|timeout| Instant::now() + timeout);
    let mut request = Vec::with_capacity(INITIAL_REQUEST_SIZE);
    let mut chunk = [0; READ_CHUNK_SIZE];
    while request.len() < MAX_REQUEST_SIZE {
        if let Some(deadline) = deadline {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ResponseError::BadRequest);
            }
            stream
                .set_read_timeout(Some(remaining))
                .map_err(|_| ResponseError::BadRequest)?;
        }
        let n = match stream.read(&mut chunk) {
            Ok(0) | Err(_) => return Err(ResponseError::BadRequest),
            Ok(n) => n,
        };
        let chunk = &chunk[..n];
        if chunk.contains(&0) {
            return Err(ResponseError::BadRequest);
        }
        match chunk.iter().position(|&b| b == b'\n') {
            Some(lf) => {
                request.extend_from_slice(&chunk[..lf]);
                // A CR is only tolerated immediately before the LF.
                if let Some(cr) = request.iter().position(|&b| b == b'\r') {
                    if cr != request.len() - 1 {
                        return Err(ResponseError::BadRequest);
                    }
                    request.truncate(cr);
                }
                return Ok(request);
            }
            None => request.extend_from_slice(chunk),
        }
    }
    Err(ResponseError::BadRequest)
}

/// A request split into its selector, path, query, and search parts.
struct SplitRequest<'a> {
    selector: &'a [u8],
    path: &'a [u8],
    query: &'a [u8],
    search: &'a [u8],
}

/// Split a request at the first tab into selector and search, discarding
/// anything after a second tab (Gopher+ clients append one), then split the
/// selector at the first `?` into path and query.
fn split_request(request: &[u8]) -> SplitRequest<'_> {
    let (selector, search) = cut(request, b'\t');
    let (search, _) = cut(search, b'\t');
    let (path, query) = cut(selector, b'?');
    SplitRequest {
        selector,
        path,
        query,
        search,
    }
}

/// Split a slice around the first occurrence of `sep`. The second half is
/// empty when `sep` is absent.
fn cut(bytes: &[u8], sep: u8) -> (&[u8], &[u8]) {
    match bytes.iter().position(|&b| b == sep) {
        Some(i) => (&bytes[..i], &bytes[i + 1..]),
        None => (bytes, &bytes[bytes.len()..]),
    }
}

/// Decode %XX escapes. A `%` not followed by two hex digits, or an escape
/// decoding to NUL, is a bad request.
fn percent_decode(path: &[u8]) -> Result<Vec<u8>, ResponseError> {
    let mut decoded = Vec::with_capacity(path.len());
    let mut i = 0;
    while i < path.len() {
        let b = path[i];
        if b == b'%' {
            match (path.get(i + 1), path.get(i + 2)) {
                (Some(&hi), Some(&lo)) if hi.is_ascii_hexdigit() && lo.is_ascii_hexdigit() => {
                    decoded.push(hex_to_digit(hi) * 16 + hex_to_digit(lo));
                    i += 3;
                }
                _ => return Err(ResponseError::BadRequest),
            }
        } else {
            decoded.push(b);
            i += 1;
        }
    }
    if decoded.contains(&0) {
        return Err(ResponseError::BadRequest);
    }
    Ok(decoded)
}

/// Convert hex digit to integer.
fn hex_to_digit(hex: u8) -> u8 {
    if hex >= b'A' && hex <= b'F' {
        hex - b'A' + 10
    } else if hex >= b'a' && hex <= b'f' {
        hex - b'a' + 10
    } else {
        hex - b'0'
    }
}

/// Lexically normalize a path. Every component in the output starts with a
/// slash; an input ending in a slash keeps a trailing slash; a missing
/// leading slash is implied. Dot, dot-dot, and slash runs are condensed.
/// Popping more dot-dots than preceding components fails.
fn normalize_path(path: &[u8]) -> Option<Vec<u8>> {
    let mut components: Vec<&[u8]> = Vec::new();
    let mut start = 0;
    let mut end = 0;
    while end < path.len() {
        while start < path.len() && path[start] == b'/' {
            start += 1;
        }
        end = start;
        while end < path.len() && path[end] != b'/' {
            end += 1;
        }
        let component = &path[start..end];
        if component == b".." {
            components.pop()?;
        } else if component != b"." {
            components.push(component);
        }
        start = end + 1;
    }
    let mut out = Vec::with_capacity(path.len());
    for component in components {
        out.push(b'/');
        out.extend_from_slice(component);
    }
    Some(out)
}

/// Where a selector path landed in the filesystem.
#[derive(Debug, PartialEq, Eq)]
struct ResolvedPath {
    fs_path: Vec<u8>,
    script_name: Vec<u8>,
    path_info: Vec<u8>,
}

/// View raw path bytes as a filesystem path.
fn native_path(bytes: &[u8]) -> &Path {
    Path::new(OsStr::from_bytes(bytes))
}

// Regular files must be world-readable; directories and CGIs must be
// world-executable as well.
const WORLD_READ: u32 = libc::S_IROTH as u32;
const WORLD_READ_EXEC: u32 = (libc::S_IROTH | libc::S_IXOTH) as u32;

/// What a stat says about one candidate path.
#[derive(Default)]
struct PathStats {
    is_file: bool,
    is_dir: bool,
    err: Option<ResponseError>,
}

/// Classify a candidate path against the permission rules. An excluded
/// extension is policy-hidden and reported as forbidden.
fn path_stats(path: &[u8], excluded: &HashSet<Vec<u8>>) -> PathStats {
    let mut stats = PathStats::default();
    let metadata = match fs::metadata(native_path(path)) {
        Ok(metadata) => metadata,
        Err(e) => {
            stats.err = Some(if e.kind() == std::io::ErrorKind::NotFound {
                ResponseError::FileNotFound
            } else {
                ResponseError::Forbidden
            });
            return stats;
        }
    };
    let mut need_mode = WORLD_READ;
    if metadata.is_file() {
        if excluded.contains(extension(path)) {
            stats.err = Some(ResponseError::Forbidden);
            return stats;
        }
        stats.is_file = true;
        if path.ends_with(CGI_EXT) {
            need_mode = WORLD_READ_EXEC;
        }
    } else if metadata.is_dir() {
        stats.is_dir = true;
        need_mode = WORLD_READ_EXEC;
    }
    if metadata.permissions().mode() & need_mode != need_mode {
        stats.err = Some(ResponseError::Forbidden);
    }
    stats
}

/// File extension including the dot, or empty: the suffix of the last
/// component starting at its last dot.
fn extension(path: &[u8]) -> &[u8] {
    let start = path.iter().rposition(|&b| b == b'/').map_or(0, |i| i + 1);
    match path[start..].iter().rposition(|&b| b == b'.') {
        Some(dot) => &path[start + dot..],
        None => b"",
    }
}

/// Resolve a selector path to a file under the document root, the script
/// name that consumed it, and any trailing path info.
fn resolve_path(
    root: &[u8],
    path: &[u8],
    excluded: &HashSet<Vec<u8>>,
) -> Result<ResolvedPath, ResponseError> {
    let path = percent_decode(path)?;
    let path = normalize_path(&path).ok_or(ResponseError::Forbidden)?;
    let mut full = Vec::with_capacity(root.len() + path.len());
    full.extend_from_slice(root);
    full.extend_from_slice(&path);
    locate_path(&full, root.len(), excluded)
}

/// Walk `path` one component at a time looking for a regular file or a
/// directory index, keeping the deepest index seen as the best candidate.
/// The component where the walk stops becomes the script boundary; the
/// remainder of the path is path info.
fn locate_path(
    path: &[u8],
    root_len: usize,
    excluded: &HashSet<Vec<u8>>,
) -> Result<ResolvedPath, ResponseError> {
    let resolved = |fs_path: Vec<u8>, split: usize| ResolvedPath {
        fs_path,
        script_name: path[root_len..split].to_vec(),
        path_info: path[split..].to_vec(),
    };

    let stats = path_stats(path, excluded);
    if stats.err.is_none() && stats.is_file {
        return Ok(resolved(path.to_vec(), path.len()));
    }
    // A direct target that exists but is policy-hidden stays forbidden even
    // when nothing else resolves.
    let default_err = match stats.err {
        Some(ResponseError::Forbidden) => ResponseError::Forbidden,
        _ => ResponseError::FileNotFound,
    };

    // An excluded .cgi extension disables the index scan outright.
    if excluded.contains(CGI_EXT) {
        return Err(default_err);
    }

    let mut best: Option<(Vec<u8>, usize)> = None;
    let mut n = root_len;
    loop {
        let cur = &path[..n];
        let stats = path_stats(cur, excluded);
        if stats.is_file {
            if let Some(err) = stats.err {
                return Err(err);
            }
            return Ok(resolved(cur.to_vec(), n));
        }
        if stats.err.is_some() || !stats.is_dir {
            break;
        }
        for index in INDEX_NAMES {
            let mut candidate = cur.to_vec();
            candidate.extend_from_slice(index);
            let stats = path_stats(&candidate, excluded);
            if stats.err.is_none() && stats.is_file {
                best = Some((candidate, n));
                break;
            }
        }
        if n == path.len() {
            break;
        }
        // advance to the next component
        n += 1;
        while n < path.len() && path[n] != b'/' {
            n += 1;
        }
        // a trailing empty component is never statted
        if n == path.len() && path[n - 1] == b'/' {
            break;
        }
    }
    match best {
        Some((fs_path, split)) => Ok(resolved(fs_path, split)),
        None => Err(default_err),
    }
}

/// Turn a split request into a response, running CGIs and opening files.
fn response_for_request(config: &Config, peer: &SocketAddr, split: &SplitRequest) -> Response {
    let result = resolve_path(config.root.as_bytes(), split.path, &config.excluded)
        .and_then(|resolved| response_from_path(config, peer, split, &resolved));
    match result {
        Ok(response) => response,
        Err(err) => Response::from_error(config, err),
    }
}

fn response_from_path(
    config: &Config,
    peer: &SocketAddr,
    split: &SplitRequest,
    resolved: &ResolvedPath,
) -> Result<Response, ResponseError> {
    if resolved.fs_path.ends_with(CGI_EXT) {
        return run_cgi(config, peer, split, resolved);
    }

    // Trailing path info is only meaningful to a CGI.
    if !resolved.path_info.is_empty() {
        return Err(ResponseError::FileNotFound);
    }

    let file = File::open(native_path(&resolved.fs_path)).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            ResponseError::FileNotFound
        } else {
            ResponseError::Forbidden
        }
    })?;
    Ok(Response {
        reader: Box::new(file),
        status: OK_STATUS,
        child: None,
    })
}

/// Run a CGI script and stream its stdout as the response.
///
/// Request details are passed both as positional arguments and as CGI/1.1
/// environment variables, with each value aliased under the names other
/// Gopher servers use so existing scripts run unchanged. The child gets a
/// scratch-built environment and runs in the script's directory.
fn run_cgi(
    config: &Config,
    peer: &SocketAddr,
    split: &SplitRequest,
    resolved: &ResolvedPath,
) -> Result<Response, ResponseError> {
    let script_dir = match resolved.fs_path.iter().rposition(|&b| b == b'/') {
        Some(slash) => &resolved.fs_path[..slash],
        None => config.root.as_bytes(),
    };

    let serverport = config.serverport.to_string();
    let remote_addr = peer.ip().to_string();
    let remote_port = peer.port().to_string();

    let path_translated = if resolved.path_info.is_empty() {
        Vec::new()
    } else {
        let mut translated = config.root.clone().into_bytes();
        translated.extend_from_slice(&resolved.path_info);
        translated
    };
    let mut request_var = resolved.script_name.clone();
    request_var.extend_from_slice(&resolved.path_info);

    let mut command = Command::new(native_path(&resolved.fs_path));
    command
        .arg(OsStr::from_bytes(split.search))
        .arg(OsStr::from_bytes(split.query))
        .arg(&config.serverhost)
        .arg(&serverport)
        .arg(OsStr::from_bytes(&resolved.path_info))
        .arg(OsStr::from_bytes(split.selector))
        .current_dir(native_path(script_dir))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .env_clear()
        .env("PATH", SAFE_PATH)
        .env("GATEWAY_INTERFACE", "CGI/1.1")
        .env("SERVER_PROTOCOL", "GOPHER")
        .env(
            "SERVER_SOFTWARE",
            concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")),
        )
        .env("REQUEST_METHOD", "GET")
        .env("PATH_INFO", OsStr::from_bytes(&resolved.path_info))
        .env("PATH_TRANSLATED", OsStr::from_bytes(&path_translated))
        .env("SERVER_NAME", &config.serverhost)
        .env("SERVER_HOST", &config.serverhost)
        .env("SERVER_PORT", &serverport)
        .env("QUERY_STRING", OsStr::from_bytes(split.query))
        .env("QUERY_STRING_URL", OsStr::from_bytes(split.query))
        .env("REMOTE_ADDR", &remote_addr)
        .env("REMOTE_HOST", &remote_addr)
        .env("REMOTE_PORT", &remote_port)
        .env("SCRIPT_NAME", OsStr::from_bytes(&resolved.script_name))
        .env("SCRIPT_FILENAME", OsStr::from_bytes(&resolved.fs_path))
        .env("GOPHER_SCRIPT_FILENAME", OsStr::from_bytes(&resolved.fs_path))
        .env("DOCUMENT_ROOT", &config.root)
        .env("GOPHER_DOCUMENT_ROOT", &config.root)
        .env("SERVER_DESCRIPTION", &config.desc)
        .env("SEARCHREQUEST", OsStr::from_bytes(split.search))
        .env("X_GOPHER_SEARCH", OsStr::from_bytes(split.search))
        .env("QUERY_STRING_SEARCH", OsStr::from_bytes(split.search))
        .env("SELECTOR", OsStr::from_bytes(split.selector))
        .env("GOPHER_DOCUMENT_SELECTOR", OsStr::from_bytes(split.selector))
        .env("REQUEST", OsStr::from_bytes(&request_var))
        .env(
            "THIRTEEN_UPTIME",
            START_TIME.elapsed().as_secs().to_string(),
        )
        .env(
            "THIRTEEN_REQUESTS",
            REQUEST_COUNT.load(Ordering::Relaxed).to_string(),
        )
        .env(
            "THIRTEEN_BYTES",
            BYTES_TRANSFERRED.load(Ordering::Relaxed).to_string(),
        );

    let mut child = command
        .spawn()
        .map_err(|_| ResponseError::InternalServerError)?;
    let stdout = child
        .stdout
        .take()
        .ok_or(ResponseError::InternalServerError)?;
    Ok(Response {
        reader: Box::new(stdout),
        status: OK_STATUS,
        child: Some(child),
    })
}

/// Counting semaphore bounding concurrent connection handlers.
struct Semaphore {
    permits: Mutex<usize>,
    available: Condvar,
}

/// Holds one semaphore permit; released on drop.
struct SlotGuard {
    semaphore: Arc<Semaphore>,
}

impl Semaphore {
    fn new(permits: usize) -> Arc<Self> {
        Arc::new(Semaphore {
            permits: Mutex::new(permits),
            available: Condvar::new(),
        })
    }
    /// Block until a permit is free and take it.
    fn acquire(self: Arc<Self>) -> SlotGuard {
        {
            let mut permits = self.permits.lock().expect("semaphore mutex poisoned");
            while *permits == 0 {
                permits = self
                    .available
                    .wait(permits)
                    .expect("semaphore mutex poisoned");
            }
            *permits -= 1;
        }
        SlotGuard { semaphore: self }
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        let mut permits = self
            .semaphore
            .permits
            .lock()
            .expect("semaphore mutex poisoned");
        *permits += 1;
        self.semaphore.available.notify_one();
    }
}
