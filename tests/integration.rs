//! E2E Integration tests for pmtidy
//!
//! The formatting service is played by a loopback HTTP responder, so these
//! tests never leave the machine.
//!
//! Run with: cargo test --test integration
//! Verbose:  TEST_VERBOSE=1 cargo test --test integration -- --nocapture

use std::fs;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;
use tempfile::TempDir;

/// Test logging macro - prints when TEST_VERBOSE is set
macro_rules! test_log {
    ($level:expr, $($arg:tt)*) => {
        if std::env::var("TEST_VERBOSE").is_ok() {
            eprintln!("[{}] [integration:{}] {}",
                $level,
                line!(),
                format!($($arg)*)
            );
        }
    };
}

const FIXTURE: &str = "tests/fixtures/thread.html";

fn fixture_path() -> String {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join(FIXTURE)
        .display()
        .to_string()
}

fn get_binary_path() -> PathBuf {
    if let Ok(bin_path) = std::env::var("CARGO_BIN_EXE_pmtidy") {
        let path = PathBuf::from(bin_path);
        if path.exists() {
            return path;
        }
    }

    let manifest_dir = env!("CARGO_MANIFEST_DIR");
    let release_path = PathBuf::from(manifest_dir).join("target/release/pmtidy");
    let debug_path = PathBuf::from(manifest_dir).join("target/debug/pmtidy");

    if let Ok(target_dir) = std::env::var("CARGO_TARGET_DIR") {
        let custom_release = PathBuf::from(&target_dir).join("release/pmtidy");
        let custom_debug = PathBuf::from(&target_dir).join("debug/pmtidy");
        if custom_release.exists() {
            return custom_release;
        }
        if custom_debug.exists() {
            return custom_debug;
        }
    }

    if release_path.exists() {
        release_path
    } else if debug_path.exists() {
        debug_path
    } else {
        panic!(
            "pmtidy binary not found. Run 'cargo build' or 'cargo build --release' first.\n\
             Looked in:\n  - {}\n  - {}",
            release_path.display(),
            debug_path.display()
        );
    }
}

fn run_pmtidy_stdin(input: &str, args: &[&str]) -> (String, String, i32) {
    test_log!("RUN", "pmtidy with args: {:?}", args);
    test_log!("INPUT", "Input length: {} bytes", input.len());

    let binary = get_binary_path();
    let mut child = Command::new(&binary)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("Failed to spawn pmtidy");

    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(input.as_bytes())
            .expect("Failed to write to stdin");
    }

    let output = child.wait_with_output().expect("Failed to wait on pmtidy");

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let code = output.status.code().unwrap_or(-1);

    test_log!("OUTPUT", "Exit code: {}", code);
    if !stderr.is_empty() {
        test_log!("STDERR", "{}", stderr);
    }

    (stdout, stderr, code)
}

fn run_pmtidy_file(file_path: &str, args: &[&str]) -> (String, String, i32) {
    test_log!("RUN", "pmtidy {} with args: {:?}", file_path, args);

    let mut cmd_args: Vec<&str> = args.to_vec();
    cmd_args.push(file_path);
    run_pmtidy_args(&cmd_args)
}

fn run_pmtidy_args(args: &[&str]) -> (String, String, i32) {
    test_log!("RUN", "pmtidy with args: {:?}", args);

    let binary = get_binary_path();
    let output = Command::new(&binary)
        .args(args)
        .output()
        .expect("Failed to run pmtidy");

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let code = output.status.code().unwrap_or(-1);

    test_log!("OUTPUT", "Exit code: {}", code);
    if !stderr.is_empty() {
        test_log!("STDERR", "{}", stderr);
    }

    (stdout, stderr, code)
}

// ============================================================================
// Loopback formatting service
// ============================================================================

/// A request as seen by the fake service
#[derive(Debug, Clone)]
struct CapturedRequest {
    head: String,
    body: String,
}

type Captured = Arc<Mutex<Vec<CapturedRequest>>>;

/// Read one HTTP/1.1 request: header block plus a Content-Length body
fn read_request(stream: &TcpStream) -> Option<CapturedRequest> {
    let mut reader = BufReader::new(stream);
    let mut head = String::new();
    let mut content_length = 0usize;

    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).ok()? == 0 {
            return None;
        }
        if line == "\r\n" {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("content-length") {
                content_length = value.trim().parse().ok()?;
            }
        }
        head.push_str(&line);
    }

    let mut body = vec![0u8; content_length];
    reader.read_exact(&mut body).ok()?;

    Some(CapturedRequest {
        head,
        body: String::from_utf8_lossy(&body).to_string(),
    })
}

/// Start a responder on an ephemeral port. `respond` maps a request body to
/// (status, reply body). Returns the endpoint URL and the captured requests.
fn spawn_service<F>(respond: F) -> (String, Captured)
where
    F: Fn(&str) -> (u16, String) + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").expect("Failed to bind loopback");
    let port = listener.local_addr().expect("local addr").port();
    let captured: Captured = Arc::new(Mutex::new(Vec::new()));
    let respond = Arc::new(respond);

    let sink = Arc::clone(&captured);
    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { continue };
            let sink = Arc::clone(&sink);
            let respond = Arc::clone(&respond);
            thread::spawn(move || {
                let Some(request) = read_request(&stream) else {
                    return;
                };
                let (status, body) = respond(&request.body);
                sink.lock().expect("capture lock").push(request);
                let reply = format!(
                    "HTTP/1.1 {} Fake\r\nContent-Type: text/html; charset=UTF-8\r\n\
                     Content-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                );
                let _ = stream.write_all(reply.as_bytes());
                let _ = stream.flush();
            });
        }
    });

    (format!("http://127.0.0.1:{}/perl/pmtidy/", port), captured)
}

fn xml_reply(highlighted: &str, tidied: &str) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<tidyresp>\
         <hilited><![CDATA[{}]]></hilited><tidied><![CDATA[{}]]></tidied></tidyresp>",
        highlighted, tidied
    )
}

/// URL of a port nothing listens on
fn dead_endpoint() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").expect("Failed to bind loopback");
    let port = listener.local_addr().expect("local addr").port();
    drop(listener);
    format!("http://127.0.0.1:{}/", port)
}

// ============================================================================
// Fetching and batch commands
// ============================================================================

#[test]
fn test_e2e_highlight_all_xml() {
    test_log!("START", "Highlight all blocks over XML framing");

    let (endpoint, captured) =
        spawn_service(|_| (200, xml_reply("<span class=\"k\">print</span>", "print")));
    let (stdout, _stderr, code) = run_pmtidy_file(
        &fixture_path(),
        &["--no-config", "--endpoint", &endpoint, "-c", "highlight"],
    );

    assert_eq!(code, 0, "Should exit successfully");
    assert!(stdout.contains("id=\"pmtidy-style\""), "Should inject styles");
    assert_eq!(
        stdout.matches("<span>[hilite]</span>").count(),
        2,
        "Both blocks should show hilite as current"
    );
    assert!(stdout.contains("[download]"), "Download link should survive");
    assert!(
        stdout.contains("<font size=\"-1\"><span class=\"k\">print</span></font>"),
        "Inline block should be highlighted inside its font"
    );

    let requests = captured.lock().expect("capture lock");
    assert_eq!(requests.len(), 2, "One request per located block");
    assert!(requests.iter().all(|r| r.body.contains("<tidyreq>")));
    assert!(requests.iter().any(|r| r.body.contains("<tag>PRE</tag>")));
    assert!(requests.iter().any(|r| r.body.contains("<tag>P</tag>")));
    assert!(requests.iter().all(|r| r.head.contains("PMTidy/1.5")));
    assert!(requests.iter().all(|r| r.head.starts_with("POST ")));

    test_log!("END", "Test PASSED");
}

#[test]
fn test_e2e_tidy_with_delimited_framing() {
    test_log!("START", "Tidy all blocks over delimited framing");

    let (endpoint, captured) = spawn_service(|_| {
        (
            200,
            "<html><div id=\"highlight\">HL</div><div id=\"tidy\">TIDIED</div></html>".to_string(),
        )
    });
    let (stdout, _stderr, code) = run_pmtidy_file(
        &fixture_path(),
        &[
            "--no-config",
            "--endpoint",
            &endpoint,
            "--framing",
            "delimited",
            "-c",
            "tidy",
        ],
    );

    assert_eq!(code, 0);
    assert_eq!(stdout.matches("TIDIED").count(), 2);
    assert!(!stdout.contains("HL"));

    let requests = captured.lock().expect("capture lock");
    assert!(requests.iter().all(|r| r.body.starts_with("code=")));
    assert!(requests.iter().any(|r| r.body.ends_with(";tag=PRE")));
    // %h is escaped once by us and once by the form encoding
    assert!(requests.iter().any(|r| r.body.contains("%2525h")));
    assert!(
        requests
            .iter()
            .all(|r| r.head.contains("application/x-www-form-urlencoded"))
    );

    test_log!("END", "Test PASSED");
}

#[test]
fn test_e2e_service_error_shows_cgi_error() {
    test_log!("START", "Non-200 reply freezes blocks");

    let (endpoint, _captured) = spawn_service(|_| (500, "Internal Server Error".to_string()));
    let (stdout, _stderr, code) = run_pmtidy_file(
        &fixture_path(),
        &["--no-config", "--endpoint", &endpoint, "-c", "tidy"],
    );

    assert_eq!(code, 0, "Block errors are not fatal without --strict");
    assert_eq!(stdout.matches("<span>[cgi error]</span>").count(), 2);
    assert!(!stdout.contains("[plain]"), "Toggles are replaced by the error");
    assert!(!stdout.contains("Loading..."), "Frozen blocks show the original");

    test_log!("END", "Test PASSED");
}

#[test]
fn test_e2e_strict_exit_code() {
    test_log!("START", "--strict exits 3 on block errors");

    let (endpoint, _captured) = spawn_service(|_| (503, String::new()));
    let (_stdout, _stderr, code) = run_pmtidy_file(
        &fixture_path(),
        &["--no-config", "--endpoint", &endpoint, "--strict"],
    );

    assert_eq!(code, 3);

    test_log!("END", "Test PASSED");
}

#[test]
fn test_e2e_unperlish_shows_skipped() {
    test_log!("START", "Sentinel reply marks code as not Perl");

    let (endpoint, _captured) =
        spawn_service(|_| (200, "How very unperlish of you!".to_string()));
    let (stdout, _stderr, code) = run_pmtidy_file(
        &fixture_path(),
        &[
            "--no-config",
            "--endpoint",
            &endpoint,
            "--framing",
            "delimited",
            "-c",
            "highlight",
        ],
    );

    assert_eq!(code, 0);
    assert_eq!(stdout.matches("<span>[skipped]</span>").count(), 2);
    assert!(stdout.contains("print join"), "Original code stays visible");

    test_log!("END", "Test PASSED");
}

#[test]
fn test_e2e_xml_error_element_shows_skipped() {
    test_log!("START", "XML <error> reply marks code as not Perl");

    let (endpoint, _captured) = spawn_service(|body| {
        if body.contains("<tag>PRE</tag>") {
            (200, "<tidyresp><error>syntax error</error></tidyresp>".to_string())
        } else {
            (200, xml_reply("H", "T"))
        }
    });
    let (stdout, _stderr, code) = run_pmtidy_file(
        &fixture_path(),
        &["--no-config", "--endpoint", &endpoint, "--json"],
    );

    assert_eq!(code, 0);
    let json: serde_json::Value = serde_json::from_str(&stdout).expect("valid JSON");
    assert_eq!(json["blocks"][0]["status"], "original");
    assert_eq!(json["blocks"][0]["resolved"], true);
    assert_eq!(json["blocks"][1]["status"], "error_syntax");
    assert_eq!(json["status"], "block_errors");

    test_log!("END", "Test PASSED");
}

#[test]
fn test_e2e_unreachable_service() {
    test_log!("START", "Connection failure is a transport error");

    let endpoint = dead_endpoint();
    let (stdout, _stderr, code) = run_pmtidy_file(
        &fixture_path(),
        &[
            "--no-config",
            "--endpoint",
            &endpoint,
            "--timeout-secs",
            "2",
            "-c",
            "highlight",
        ],
    );

    assert_eq!(code, 0);
    assert_eq!(stdout.matches("[cgi error]").count(), 2);

    test_log!("END", "Test PASSED");
}

#[test]
fn test_e2e_set_single_block() {
    test_log!("START", "--set switches one block");

    let (endpoint, _captured) = spawn_service(|_| (200, xml_reply("HL", "TIDIED")));
    let (stdout, _stderr, code) = run_pmtidy_file(
        &fixture_path(),
        &["--no-config", "--endpoint", &endpoint, "--set", "1=tidy"],
    );

    assert_eq!(code, 0);
    assert_eq!(stdout.matches("TIDIED").count(), 1);
    assert!(stdout.contains("print join"), "Block 0 stays plain");
    assert!(stdout.contains("data-pmtidy-block=\"1\" data-pmtidy-view=\"plain\""));

    test_log!("END", "Test PASSED");
}

// ============================================================================
// Offline behavior
// ============================================================================

#[test]
fn test_e2e_no_fetch_keeps_placeholders() {
    test_log!("START", "--no-fetch leaves placeholders");

    let (stdout, _stderr, code) =
        run_pmtidy_file(&fixture_path(), &["--no-config", "--no-fetch", "-c", "tidy"]);

    assert_eq!(code, 0);
    assert_eq!(stdout.matches("Loading...").count(), 2);
    assert_eq!(stdout.matches("<span>[tidy]</span>").count(), 2);

    test_log!("END", "Test PASSED");
}

#[test]
fn test_e2e_no_fetch_plain_adds_affordances() {
    test_log!("START", "Affordances are added to every located block");

    let (stdout, _stderr, code) = run_pmtidy_file(&fixture_path(), &["--no-config", "--no-fetch"]);

    assert_eq!(code, 0);
    assert_eq!(stdout.matches("<span>[plain]</span>").count(), 2);
    assert_eq!(stdout.matches("data-pmtidy-view=\"hilite\"").count(), 2);
    assert!(stdout.contains("<div class=\"embed-code-dl\">"), "Top-level block gets a row");
    assert!(stdout.contains("not a code block"), "Rejected leaves are untouched");

    test_log!("END", "Test PASSED");
}

#[test]
fn test_e2e_no_style() {
    test_log!("START", "--no-style skips the style sheet");

    let (stdout, _stderr, code) =
        run_pmtidy_file(&fixture_path(), &["--no-config", "--no-fetch", "--no-style"]);

    assert_eq!(code, 0);
    assert!(!stdout.contains("pmtidy-style"));

    test_log!("END", "Test PASSED");
}

#[test]
fn test_e2e_style_injected_once() {
    test_log!("START", "Style sheet is not injected twice");

    let (first, _stderr, code) = run_pmtidy_file(&fixture_path(), &["--no-config", "--no-fetch"]);
    assert_eq!(code, 0);

    let (second, _stderr, code) = run_pmtidy_stdin(&first, &["--no-config", "--no-fetch"]);
    assert_eq!(code, 0);
    assert_eq!(second.matches("id=\"pmtidy-style\"").count(), 1);

    test_log!("END", "Test PASSED");
}

#[test]
fn test_e2e_stdin_input() {
    test_log!("START", "Page from stdin");

    let input = "<html><head></head><body><pre class=\"code\">\
                 <tt class=\"codetext\">print 1;</tt></pre></body></html>";
    let (stdout, _stderr, code) = run_pmtidy_stdin(input, &["--no-config", "--no-fetch"]);

    assert_eq!(code, 0);
    assert!(stdout.contains("<tt class=\"codetext\">print 1;</tt>"));
    assert!(stdout.contains("[plain]"));

    test_log!("END", "Test PASSED");
}

#[test]
fn test_e2e_page_without_blocks() {
    test_log!("START", "Page with no code blocks");

    let input = "<html><head></head><body><p>No code here.</p></body></html>";
    let (stdout, _stderr, code) = run_pmtidy_stdin(input, &["--no-config"]);

    assert_eq!(code, 0);
    assert!(stdout.contains("No code here."));
    assert!(!stdout.contains("[plain]"));

    test_log!("END", "Test PASSED");
}

#[test]
fn test_e2e_verbose_mode() {
    test_log!("START", "Verbose mode reports located blocks");

    let (stdout, stderr, code) = run_pmtidy_file(
        &fixture_path(),
        &["--no-config", "--no-fetch", "-v", "--color", "never"],
    );

    assert_eq!(code, 0);
    let combined = format!("{}{}", stdout, stderr);
    assert!(combined.contains("Located"));
    assert!(combined.contains("Skipped code text"));
    assert!(combined.contains("Summary"));

    test_log!("END", "Test PASSED");
}

// ============================================================================
// Output Modes
// ============================================================================

#[test]
fn test_e2e_json_output() {
    test_log!("START", "JSON output");

    let (endpoint, _captured) = spawn_service(|_| (200, xml_reply("HL", "TD")));
    let (stdout, _stderr, code) = run_pmtidy_file(
        &fixture_path(),
        &["--no-config", "--endpoint", &endpoint, "-c", "highlight", "--json"],
    );

    assert_eq!(code, 0);
    let json: serde_json::Value = serde_json::from_str(&stdout).expect("valid JSON");
    assert_eq!(json["status"], "ok");
    assert_eq!(json["blocks"].as_array().map(Vec::len), Some(2));
    assert_eq!(json["blocks"][0]["tag"], "P");
    assert_eq!(json["blocks"][1]["tag"], "PRE");
    assert_eq!(json["blocks"][1]["status"], "highlighted");
    assert_eq!(json["processing"]["leaves_found"], 4);
    assert_eq!(json["processing"]["blocks_rejected"], 2);
    assert_eq!(json["processing"]["requests_sent"], 2);
    assert!(
        json["content"]
            .as_str()
            .is_some_and(|html| html.contains("HL"))
    );

    test_log!("END", "Test PASSED");
}

#[test]
fn test_e2e_diff_mode() {
    test_log!("START", "Diff output");

    let (stdout, _stderr, code) =
        run_pmtidy_file(&fixture_path(), &["--no-config", "--no-fetch", "-d"]);

    assert_eq!(code, 0);
    assert!(stdout.starts_with("--- a/"));
    assert!(stdout.contains("+++ b/"));
    assert!(stdout.lines().any(|l| l.starts_with('+') && l.contains("[plain]")));

    test_log!("END", "Test PASSED");
}

#[test]
fn test_e2e_in_place_with_backup() {
    test_log!("START", "In-place edit with backup");

    let dir = TempDir::new().expect("tempdir");
    let page = dir.path().join("thread.html");
    let original = fs::read_to_string(fixture_path()).expect("read fixture");
    fs::write(&page, &original).expect("write page");
    let page_arg = page.display().to_string();

    let (stdout, _stderr, code) =
        run_pmtidy_file(&page_arg, &["--no-config", "--no-fetch", "-i", "--backup"]);

    assert_eq!(code, 0);
    assert!(stdout.is_empty(), "In-place mode writes nothing to stdout");
    let rewritten = fs::read_to_string(&page).expect("read page");
    assert!(rewritten.contains("pmtidy-style"));
    let backup = fs::read_to_string(dir.path().join("thread.html.bak")).expect("read backup");
    assert_eq!(backup, original);

    test_log!("END", "Test PASSED");
}

#[test]
fn test_e2e_multiple_files() {
    test_log!("START", "Multiple inputs get headers");

    let dir = TempDir::new().expect("tempdir");
    let a = dir.path().join("a.html");
    let b = dir.path().join("b.html");
    fs::write(&a, "<pre class=\"code\"><tt class=\"codetext\">1;</tt></pre>").expect("write a");
    fs::write(&b, "<pre class=\"code\"><tt class=\"codetext\">2;</tt></pre>").expect("write b");
    let a_arg = a.display().to_string();
    let b_arg = b.display().to_string();

    let (stdout, _stderr, code) =
        run_pmtidy_args(&["--no-config", "--no-fetch", &a_arg, &b_arg]);

    assert_eq!(code, 0);
    assert!(stdout.contains(&format!("==> {} <==", a_arg)));
    assert!(stdout.contains(&format!("==> {} <==", b_arg)));

    test_log!("END", "Test PASSED");
}

// ============================================================================
// Subcommands
// ============================================================================

#[test]
fn test_e2e_blocks_subcommand() {
    test_log!("START", "blocks lists located code blocks");

    let (stdout, stderr, code) = run_pmtidy_args(&["blocks", &fixture_path()]);

    assert_eq!(code, 0);
    let lines: Vec<&str> = stdout.lines().collect();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].starts_with("#0") && lines[0].contains("P "));
    assert!(lines[1].starts_with("#1") && lines[1].contains("PRE"));
    assert_eq!(stderr.matches("skipped:").count(), 2);

    test_log!("END", "Test PASSED");
}

#[test]
fn test_e2e_blocks_json() {
    test_log!("START", "blocks --json");

    let (stdout, _stderr, code) = run_pmtidy_args(&["blocks", "--json", &fixture_path()]);

    assert_eq!(code, 0);
    let json: serde_json::Value = serde_json::from_str(&stdout).expect("valid JSON");
    assert_eq!(json["leaves_found"], 4);
    assert_eq!(json["blocks"].as_array().map(Vec::len), Some(2));
    assert_eq!(json["rejected"].as_array().map(Vec::len), Some(2));
    assert_eq!(json["blocks"][0]["status"], "original");

    test_log!("END", "Test PASSED");
}

#[test]
fn test_e2e_config_file_is_used() {
    test_log!("START", ".pmtidyrc next to the input");

    let (endpoint, captured) = spawn_service(|_| (200, xml_reply("HL", "FROM-CONFIG")));
    let dir = TempDir::new().expect("tempdir");
    fs::write(
        dir.path().join(".pmtidyrc"),
        format!("endpoint = \"{}\"\ncommand = \"tidy\"\n", endpoint),
    )
    .expect("write config");
    let page = dir.path().join("page.html");
    fs::write(&page, "<pre class=\"code\"><tt class=\"codetext\">1;</tt></pre>")
        .expect("write page");

    let (stdout, _stderr, code) = run_pmtidy_args(&[&page.display().to_string()]);

    assert_eq!(code, 0);
    assert!(stdout.contains("FROM-CONFIG"));
    assert_eq!(captured.lock().expect("capture lock").len(), 1);

    test_log!("END", "Test PASSED");
}

// ============================================================================
// Exit Codes
// ============================================================================

#[test]
fn test_e2e_exit_code_missing_file() {
    test_log!("START", "Missing input exits 1");

    let (_stdout, stderr, code) =
        run_pmtidy_args(&["--no-config", "--no-fetch", "/nonexistent/page.html"]);

    assert_eq!(code, 1);
    assert!(stderr.contains("Error"));

    test_log!("END", "Test PASSED");
}

#[test]
fn test_e2e_exit_code_invalid_args() {
    test_log!("START", "Invalid arguments exit 2");

    let (_stdout, _stderr, code) = run_pmtidy_args(&["--set", "nonsense"]);
    assert_eq!(code, 2);

    let (_stdout, _stderr, code) = run_pmtidy_args(&["-c", "sparkle"]);
    assert_eq!(code, 2);

    let (_stdout, _stderr, code) =
        run_pmtidy_stdin("<p></p>", &["--no-config", "--endpoint", "ftp://example.org/"]);
    assert_eq!(code, 2);

    test_log!("END", "Test PASSED");
}

#[test]
fn test_e2e_exit_code_huge_wait() {
    test_log!("START", "Out-of-range waits exit 2");

    let (_stdout, stderr, code) = run_pmtidy_file(
        &fixture_path(),
        &["--no-config", "--wait-secs", "18446744073709551615"],
    );
    assert_eq!(code, 2);
    assert!(stderr.contains("wait_secs"));

    let (_stdout, _stderr, code) = run_pmtidy_file(
        &fixture_path(),
        &["--no-config", "--timeout-secs", "18446744073709551615"],
    );
    assert_eq!(code, 2);

    test_log!("END", "Test PASSED");
}

#[test]
fn test_e2e_exit_code_unknown_block() {
    test_log!("START", "--set on a missing block exits 2");

    let (_stdout, stderr, code) = run_pmtidy_file(
        &fixture_path(),
        &["--no-config", "--no-fetch", "--set", "9=tidy"],
    );

    assert_eq!(code, 2);
    assert!(stderr.contains("No code block #9"));

    test_log!("END", "Test PASSED");
}

#[test]
fn test_e2e_exit_code_binary_input() {
    test_log!("START", "Binary input exits 4");

    let dir = TempDir::new().expect("tempdir");
    let page = dir.path().join("blob.html");
    fs::write(&page, [b'<', b'p', b'>', 0, 1, 2]).expect("write blob");

    let (_stdout, stderr, code) =
        run_pmtidy_file(&page.display().to_string(), &["--no-config", "--no-fetch"]);

    assert_eq!(code, 4);
    assert!(stderr.contains("binary"));

    test_log!("END", "Test PASSED");
}

#[test]
fn test_e2e_help_and_version() {
    test_log!("START", "--help and --version exit 0");

    let (stdout, _stderr, code) = run_pmtidy_args(&["--help"]);
    assert_eq!(code, 0);
    assert!(stdout.contains("EXIT CODES"));

    let (stdout, _stderr, code) = run_pmtidy_args(&["--version"]);
    assert_eq!(code, 0);
    assert!(stdout.contains("pmtidy"));

    test_log!("END", "Test PASSED");
}
