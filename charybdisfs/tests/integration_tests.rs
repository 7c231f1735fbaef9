//! End-to-end scenarios driving a real mount, matching the pattern the
//! vendored library's own tests use for self-testing a live mount:
//! `tempfile::tempdir`, spawn, operate through the mount, unmount on drop.

use std::fs;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpStream;
use std::os::unix::fs::MetadataExt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use charybdisfs::configuration::Configuration;
use charybdisfs::control_api;
use charybdisfs::operations::CharybdisOperations;
use fuser::{BackgroundSession, MountOption};

struct Fixture {
    _source: tempfile::TempDir,
    target: tempfile::TempDir,
    _session: BackgroundSession,
    config: Arc<Configuration>,
}

impl Fixture {
    fn mount() -> Fixture {
        let source = tempfile::tempdir().expect("create source tempdir");
        let target = tempfile::tempdir().expect("create target tempdir");
        let config = Arc::new(Configuration::new());
        let ops = CharybdisOperations::new(source.path().to_path_buf(), config.clone());
        let options = vec![MountOption::FSName("charybdisfs".to_string())];
        let session = fuser::spawn_mount2(ops, target.path(), &options).expect("mount");

        Fixture {
            _source: source,
            target,
            _session: session,
            config,
        }
    }

    fn target_path(&self, name: &str) -> std::path::PathBuf {
        self.target.path().join(name)
    }
}

/// Sends one raw HTTP/1.0 request and returns `(status_code, body)`.
fn http_request(port: u16, method: &str, path: &str, body: Option<&str>) -> (u16, String) {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).expect("connect to control api");
    let body = body.unwrap_or("");
    let request = format!(
        "{method} {path} HTTP/1.0\r\nHost: localhost\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(request.as_bytes()).expect("write request");
    let mut reader = BufReader::new(stream);
    let mut status_line = String::new();
    reader.read_line(&mut status_line).expect("read status line");
    let status: u16 = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .expect("status line has a numeric code");

    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).unwrap_or(0) == 0 {
            break;
        }
        if line == "\r\n" {
            break;
        }
    }
    let mut rest = String::new();
    let _ = reader.read_to_string(&mut rest);
    (status, rest)
}

#[test]
fn passthrough_echo_roundtrips_bytes_through_the_backing_file() {
    let fixture = Fixture::mount();
    let path = fixture.target_path("a.txt");

    fs::write(&path, b"hello").expect("write through mount");
    assert_eq!(fs::read(&path).expect("read back through mount"), b"hello");
    assert_eq!(fs::metadata(&path).expect("stat through mount").size(), 5);
    assert_eq!(fs::read(fixture._source.path().join("a.txt")).expect("read backing file"), b"hello");
}

#[test]
fn hardlinks_share_one_inode_and_survive_the_original_being_unlinked() {
    let fixture = Fixture::mount();
    let x = fixture.target_path("x");
    let y = fixture.target_path("y");

    fs::write(&x, b"content").expect("create x");
    fs::hard_link(&x, &y).expect("link y to x");

    let ino_x = fs::metadata(&x).expect("stat x").ino();
    let ino_y = fs::metadata(&y).expect("stat y").ino();
    assert_eq!(ino_x, ino_y);

    fs::remove_file(&x).expect("unlink x");
    assert_eq!(fs::read(&y).expect("y still readable"), b"content");
}

#[test]
fn rename_keeps_an_open_handle_writing_to_the_new_backing_path() {
    let fixture = Fixture::mount();
    let a = fixture.target_path("a");
    let b = fixture.target_path("b");

    fs::write(&a, b"").expect("create a");
    let mut handle = fs::OpenOptions::new().write(true).open(&a).expect("open a");
    let ino_before = fs::metadata(&a).expect("stat a").ino();

    fs::rename(&a, &b).expect("rename a to b");
    handle.write_all(b"after rename").expect("write through stale handle");
    drop(handle);

    assert_eq!(fs::read(&b).expect("read b"), b"after rename");
    assert_eq!(fs::metadata(&b).expect("stat b").ino(), ino_before);
}

#[test]
fn an_error_fault_injected_directly_into_the_registry_fails_subsequent_writes() {
    use charybdisfs::fault::{Fault, SysCall};

    let fixture = Fixture::mount();
    let f = fixture.target_path("f");
    fs::write(&f, b"").expect("create f");

    fixture
        .config
        .add("enospc".to_string(), Fault::error(SysCall::Write, 100, libc::ENOSPC))
        .expect("install fault");

    let mut handle = fs::OpenOptions::new().write(true).open(&f).expect("open f");
    let err = handle.write(b"will not fit").expect_err("write should fail");
    assert_eq!(err.raw_os_error(), Some(libc::ENOSPC));

    fixture.config.remove("enospc");
    drop(handle);
    fs::write(&f, b"now it fits").expect("write succeeds once the fault is removed");
}

#[test]
fn a_latency_fault_stalls_reads_by_at_least_the_configured_delay() {
    use charybdisfs::fault::{Fault, SysCall};

    let fixture = Fixture::mount();
    let path = fixture.target_path("slow");
    fs::write(&path, b"data").expect("create file");

    fixture
        .config
        .add("slow-read".to_string(), Fault::latency(SysCall::Read, 100, 50_000))
        .expect("install fault");

    let started = Instant::now();
    let _ = fs::read(&path).expect("read through mount");
    assert!(started.elapsed() >= Duration::from_micros(50_000));
}

#[test]
fn closing_a_handle_after_writes_still_surfaces_the_data_through_a_flush() {
    let fixture = Fixture::mount();
    let path = fixture.target_path("flushed");

    let mut handle = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .open(&path)
        .expect("create flushed");
    handle.write_all(b"written before close").expect("write through mount");
    drop(handle);

    assert_eq!(fs::read(&path).expect("read back after close"), b"written before close");
}

#[test]
fn the_http_control_api_enforces_the_hundred_percent_probability_budget() {
    use charybdisfs::fault::{Fault, SysCall};

    const PORT: u16 = 18_080;
    let config = Arc::new(Configuration::new());
    let _control_thread = control_api::spawn(config.clone(), PORT).expect("bind control api");

    config
        .add("base".to_string(), Fault::error(SysCall::Write, 60, libc::ENOSPC))
        .expect("seed a 60% rule");

    let (status, body) = http_request(
        PORT,
        "POST",
        "/faults",
        Some(r#"{"fault_type":"ErrorFault","sys_call":"write","probability":50,"error_no":28}"#),
    );
    assert_eq!(status, 400, "response body was: {body}");

    let (status, body) = http_request(
        PORT,
        "POST",
        "/faults",
        Some(r#"{"fault_type":"ErrorFault","sys_call":"write","probability":40,"error_no":28}"#),
    );
    assert_eq!(status, 200, "response body was: {body}");
    assert!(body.contains("\"fault_id\""), "response body was: {body}");

    let (status, body) = http_request(
        PORT,
        "POST",
        "/faults",
        Some(r#"{"fault_type":"ErrorFault","sys_call":"*","probability":1,"error_no":28}"#),
    );
    assert_eq!(status, 400, "response body was: {body}");
}
