use beacon_core::Database;
use std::fs;
use std::io::{Read, Write};
use std::net::TcpListener;
use std::path::PathBuf;
use std::process::{Command, Output};
use std::thread::JoinHandle;
use tempfile::TempDir;

struct CliTestEnv {
    _temp_dir: TempDir,
    home: PathBuf,
    xdg_data: PathBuf,
    xdg_config: PathBuf,
    xdg_state: PathBuf,
}

impl CliTestEnv {
    fn new() -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let base = temp_dir.path().to_path_buf();
        let home = base.join("home");
        let xdg_data = base.join("xdg-data");
        let xdg_config = base.join("xdg-config");
        let xdg_state = base.join("xdg-state");

        fs::create_dir_all(&home).expect("failed to create HOME");
        fs::create_dir_all(&xdg_data).expect("failed to create XDG_DATA_HOME");
        fs::create_dir_all(&xdg_config).expect("failed to create XDG_CONFIG_HOME");
        fs::create_dir_all(&xdg_state).expect("failed to create XDG_STATE_HOME");

        Self {
            _temp_dir: temp_dir,
            home,
            xdg_data,
            xdg_config,
            xdg_state,
        }
    }

    fn db_path(&self) -> PathBuf {
        self.xdg_data.join("beacon/queue.db")
    }

    fn write_config(&self, content: &str) {
        let dir = self.xdg_config.join("beacon");
        fs::create_dir_all(&dir).expect("failed to create config dir");
        fs::write(dir.join("config.toml"), content).expect("failed to write config");
    }

    fn open_db(&self) -> Database {
        let db = Database::open(&self.db_path()).expect("failed to open db");
        db.migrate().expect("failed to migrate db");
        db
    }
}

fn run(env: &CliTestEnv, args: &[&str]) -> Output {
    Command::new(PathBuf::from(assert_cmd::cargo::cargo_bin!("beacon")))
        .args(args)
        .env("HOME", &env.home)
        .env("XDG_DATA_HOME", &env.xdg_data)
        .env("XDG_CONFIG_HOME", &env.xdg_config)
        .env("XDG_STATE_HOME", &env.xdg_state)
        .output()
        .unwrap_or_else(|e| panic!("failed to execute beacon: {e}"))
}

fn assert_success(args: &[&str], output: &Output) {
    if output.status.success() {
        return;
    }
    panic!(
        "beacon {} failed\nstatus: {}\nstdout:\n{}\nstderr:\n{}",
        args.join(" "),
        output.status,
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
}

#[test]
fn enqueue_stores_one_entry_per_dispatcher() {
    let env = CliTestEnv::new();
    let args = [
        "enqueue",
        "page_view",
        "--dispatcher",
        "first",
        "--dispatcher",
        "second",
        "--data",
        r#"{"path": "/home"}"#,
    ];

    let output = run(&env, &args);
    assert_success(&args, &output);

    let db = env.open_db();
    assert_eq!(db.queue_size("first").unwrap(), 1);
    assert_eq!(db.queue_size("second").unwrap(), 1);
    assert_eq!(db.dispatch_count().unwrap(), 1);

    let queued = db.dequeue("first", 10).unwrap();
    assert_eq!(queued[0].name(), Some("page_view"));
    assert_eq!(queued[0].payload["path"], "/home");
}

#[test]
fn status_lists_queue_sizes() {
    let env = CliTestEnv::new();
    let enqueue = ["enqueue", "app_launch"];
    assert_success(&enqueue, &run(&env, &enqueue));

    let output = run(&env, &["status"]);
    assert_success(&["status"], &output);

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Queued dispatches: 1"), "unexpected status:\n{stdout}");
    assert!(stdout.contains("collect"), "unexpected status:\n{stdout}");
}

#[test]
fn purge_removes_only_the_named_dispatcher() {
    let env = CliTestEnv::new();
    let enqueue = ["enqueue", "tap", "-d", "keep", "-d", "drop"];
    assert_success(&enqueue, &run(&env, &enqueue));

    let purge = ["purge", "drop"];
    let output = run(&env, &purge);
    assert_success(&purge, &output);
    assert!(String::from_utf8_lossy(&output.stdout).contains("Removed 1 entries for drop"));

    let db = env.open_db();
    assert_eq!(db.queue_size("drop").unwrap(), 0);
    assert_eq!(db.queue_size("keep").unwrap(), 1);
}

#[test]
fn prune_keeps_fresh_entries() {
    let env = CliTestEnv::new();
    let enqueue = ["enqueue", "tap"];
    assert_success(&enqueue, &run(&env, &enqueue));

    let output = run(&env, &["prune"]);
    assert_success(&["prune"], &output);
    assert!(String::from_utf8_lossy(&output.stdout).contains("Removed 0 expired entries"));
    assert_eq!(env.open_db().queue_size("collect").unwrap(), 1);
}

#[test]
fn enqueue_rejects_non_object_data() {
    let env = CliTestEnv::new();
    let output = run(&env, &["enqueue", "tap", "--data", "[1, 2]"]);
    assert!(!output.status.success());
}

#[test]
fn send_requires_collect_configuration() {
    let env = CliTestEnv::new();
    env.write_config("[queue]\nmax_queue_size = 10\n");

    let output = run(&env, &["send"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("collect dispatcher is not configured"));
}

/// Answer one HTTP request with 200 and hand back its body.
fn serve_once() -> (String, JoinHandle<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("failed to bind listener");
    let url = format!("http://{}/events", listener.local_addr().unwrap());

    let server = std::thread::spawn(move || {
        let (mut socket, _) = listener.accept().expect("no request arrived");
        let mut request = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = socket.read(&mut buf).expect("failed to read request");
            request.extend_from_slice(&buf[..n]);
            let text = String::from_utf8_lossy(&request);
            if let Some(header_end) = text.find("\r\n\r\n") {
                let length = text[..header_end]
                    .lines()
                    .find_map(|line| {
                        let (name, value) = line.split_once(':')?;
                        name.eq_ignore_ascii_case("content-length")
                            .then(|| value.trim().parse::<usize>().ok())
                            .flatten()
                    })
                    .unwrap_or(0);
                if request.len() >= header_end + 4 + length {
                    break;
                }
            }
            if n == 0 {
                break;
            }
        }
        socket
            .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\nconnection: close\r\n\r\n")
            .expect("failed to write response");
        let text = String::from_utf8_lossy(&request).to_string();
        text.split("\r\n\r\n").nth(1).unwrap_or_default().to_string()
    });

    (url, server)
}

#[test]
fn send_delivers_queued_dispatch_to_collect() {
    let env = CliTestEnv::new();
    let (url, server) = serve_once();
    env.write_config(&format!(
        "[collect]\nenabled = true\nurl = \"{url}\"\ndispatch_limit = 10\n"
    ));

    let args = ["enqueue", "checkout", "--data", r#"{"total": 12}"#];
    let output = run(&env, &args);
    assert_success(&args, &output);

    let args = ["send", "--timeout", "10"];
    let output = run(&env, &args);
    assert_success(&args, &output);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Delivered 1, 0 still queued"), "stdout:\n{stdout}");

    let body = server.join().expect("server thread panicked");
    assert!(body.contains("checkout"));
    assert_eq!(env.open_db().dispatch_count().unwrap(), 0);
}
