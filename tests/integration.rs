mod util;

use util::Server;

#[test]
fn serves_static_file() {
    let server = Server::with_args(&[]);
    server.create_file("text.txt", b"hello gopher\n");
    assert_eq!(server.request("/text.txt"), b"hello gopher\n");
}

#[test]
fn serves_nested_static_file() {
    let server = Server::with_args(&[]);
    server.create_dir("docs");
    server.create_file("docs/readme.txt", b"nested\n");
    assert_eq!(server.request("/docs/readme.txt"), b"nested\n");
}

#[test]
fn serves_root_index_map() {
    let server = Server::with_args(&[]);
    let menu = b"0about\t/about.txt\tlocalhost\t70\r\n.\r\n";
    server.create_file("index.map", menu);
    assert_eq!(server.request(""), menu.to_vec());
}

#[test]
fn decodes_percent_escapes() {
    let server = Server::with_args(&[]);
    server.create_file("text.txt", b"decoded\n");
    assert_eq!(server.request("/%74ext.txt"), b"decoded\n");
}

#[test]
fn ignores_query_for_static_file() {
    let server = Server::with_args(&[]);
    server.create_file("text.txt", b"queried\n");
    assert_eq!(server.request("/text.txt?ignored=1"), b"queried\n");
}

#[test]
fn tolerates_gopher_plus_tab() {
    let server = Server::with_args(&[]);
    server.create_file("text.txt", b"plus\n");
    assert_eq!(server.raw_request(b"/text.txt\tsearch\t$\r\n"), b"plus\n");
}

#[test]
fn missing_file_not_found() {
    let server = Server::with_args(&[]);
    assert_eq!(
        server.request("/missing.txt"),
        server.error_entry("File not found.")
    );
}

#[test]
fn traversal_above_root_forbidden() {
    let server = Server::with_args(&[]);
    assert_eq!(
        server.request("/../passwd"),
        server.error_entry("Forbidden.")
    );
}

#[test]
fn unreadable_file_forbidden() {
    let server = Server::with_args(&[]);
    server.create_file_with_mode("secret.txt", b"secret\n", 0o600);
    assert_eq!(
        server.request("/secret.txt"),
        server.error_entry("Forbidden.")
    );
}

#[test]
fn excluded_extension_forbidden() {
    let server = Server::with_args(&["--exclude", "txt"]);
    server.create_file("secret.txt", b"secret\n");
    assert_eq!(
        server.request("/secret.txt"),
        server.error_entry("Forbidden.")
    );
}

#[test]
fn invalid_percent_encoding_bad_request() {
    let server = Server::with_args(&[]);
    assert_eq!(
        server.request("/%2.text.txt"),
        server.error_entry("Bad request.")
    );
}

#[test]
fn nul_byte_bad_request() {
    let server = Server::with_args(&[]);
    assert_eq!(
        server.raw_request(b"/foo\x00bar\r\n"),
        server.error_entry("Bad request.")
    );
}

#[test]
fn static_file_never_takes_path_info() {
    let server = Server::with_args(&[]);
    server.create_file("plain.txt", b"plain\n");
    assert_eq!(
        server.request("/plain.txt/extra"),
        server.error_entry("File not found.")
    );
}

#[test]
fn cgi_stdout_streamed_verbatim() {
    let server = Server::with_args(&[]);
    server.create_cgi("lines.cgi", r"printf '123456789\n123456789\n123456789\n'");
    let response = server.request("/lines.cgi");
    assert_eq!(response, b"123456789\n123456789\n123456789\n");
    assert_eq!(response.len(), 30);
}

#[test]
fn cgi_positional_args() {
    let server = Server::with_args(&[]);
    server.create_cgi(
        "args.cgi",
        r#"printf '%s|%s|%s|%s|%s|%s\n' "$1" "$2" "$3" "$4" "$5" "$6""#,
    );
    let response = server.raw_request(b"/args.cgi/extra?q=1\tneedle\r\n");
    let expected = format!(
        "needle|q=1|localhost|{}|/extra|/args.cgi/extra?q=1\n",
        server.port()
    );
    assert_eq!(response, expected.into_bytes());
}

#[test]
fn cgi_environment() {
    let server = Server::with_args(&[]);
    server.create_cgi(
        "env.cgi",
        r#"printf '%s|%s|%s|%s|%s|%s|%s\n' "$QUERY_STRING" "$SEARCHREQUEST" "$PATH_INFO" "$SCRIPT_NAME" "$REQUEST" "$REMOTE_ADDR" "$GATEWAY_INTERFACE""#,
    );
    let response = server.raw_request(b"/env.cgi/x/y?a=b\tfind me\r\n");
    assert_eq!(
        response,
        b"a=b|find me|/x/y|/env.cgi|/env.cgi/x/y|127.0.0.1|CGI/1.1\n".to_vec()
    );
}

#[test]
fn cgi_index_takes_path_info() {
    let server = Server::with_args(&[]);
    server.create_dir("app");
    server.create_cgi("app/index.cgi", r#"printf '%s:%s\n' "$PATH_INFO" "$SCRIPT_NAME""#);
    assert_eq!(server.request("/app/x/y"), b"/x/y:/app\n");
}

#[test]
fn cgi_runs_in_script_directory() {
    let server = Server::with_args(&[]);
    server.create_dir("app");
    server.create_cgi("app/where.cgi", "pwd");
    // pwd reports the physical directory, so compare against the resolved
    // root path.
    let canonical = std::fs::canonicalize(server.root()).expect("failed to canonicalize root");
    let expected = format!("{}/app\n", canonical.display());
    assert_eq!(server.request("/app/where.cgi"), expected.into_bytes());
}

#[test]
fn cgi_sees_request_counters() {
    let server = Server::with_args(&[]);
    server.create_file("text.txt", b"hello\n");
    server.create_cgi(
        "stats.cgi",
        r#"printf '%s|%s\n' "$THIRTEEN_REQUESTS" "$THIRTEEN_BYTES""#,
    );
    assert_eq!(server.request("/text.txt"), b"hello\n");
    assert_eq!(server.request("/text.txt"), b"hello\n");
    assert_eq!(server.request("/stats.cgi"), b"2|12\n");
}

#[test]
fn broken_cgi_internal_server_error() {
    let server = Server::with_args(&[]);
    server.create_file_with_mode("broken.cgi", b"#!/nonexistent-interpreter\n", 0o755);
    assert_eq!(
        server.request("/broken.cgi"),
        server.error_entry("Internal server error.")
    );
}

#[test]
fn request_timeout_bad_request() {
    let server = Server::with_args(&["--rtmo", "1"]);
    let mut stream = server.stream();
    // send nothing; the server must give up and answer on its own
    let mut buf = Vec::new();
    std::io::Read::read_to_end(&mut stream, &mut buf).expect("failed to read response");
    assert_eq!(buf, server.error_entry("Bad request."));
}
