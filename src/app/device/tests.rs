use super::*;

use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::{json, Map, Value};
use tempfile::TempDir;

use crate::app::adb::locator::ToolPaths;
use crate::app::adb::runner::{CommandOutput, CommandRunner};
use crate::app::config::Timings;
use crate::app::error::{AppError, Result, TransportKind};
use crate::app::models::SessionState;
use crate::app::protocol::{Action, HttpClient, RequestOptions, Transport};

const APP_BADGING: &str = "package: name='com.example.app' versionCode='3' versionName='1.0'\n\
launchable-activity: name='com.example.app.MainActivity'  label='Example' icon=''\n";
const TEST_BADGING: &str = "package: name='com.example.app.test' versionCode='1'\n";
const FOCUSED: &str = "  mCurrentFocus=Window{42 u0 com.example.app/com.example.app.MainActivity}\n  mFocusedApp=AppWindowToken{41 token=Token{40 ActivityRecord{3 u0 com.example.app/.MainActivity t7}}}\n";
const LOCKED: &str = "  mCurrentFocus=Window{7 u0 StatusBar Keyguard}\n";

/// Scripted `adb`/`aapt` pair backed by an in-memory package list.
struct FakeTools {
    calls: Mutex<Vec<String>>,
    installed: Mutex<Vec<String>>,
    install_output: String,
    install_registers: bool,
    install_error: Option<&'static str>,
    forward_exit: i32,
    keyguard: Mutex<VecDeque<bool>>,
    keyguard_default: bool,
    logcat: String,
    last_tag: Mutex<Option<String>>,
}

impl Default for FakeTools {
    fn default() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            installed: Mutex::new(Vec::new()),
            install_output: "Performing Streamed Install\nSuccess\n".to_string(),
            install_registers: true,
            install_error: None,
            forward_exit: 0,
            keyguard: Mutex::new(VecDeque::new()),
            keyguard_default: false,
            logcat: String::new(),
            last_tag: Mutex::new(None),
        }
    }
}

impl FakeTools {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls").clone()
    }

    fn calls_matching(&self, needle: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|call| call.contains(needle))
            .collect()
    }
}

fn package_for(path: &str) -> &'static str {
    if path.ends_with("test.apk") {
        "com.example.app.test"
    } else {
        "com.example.app"
    }
}

fn ok(stdout: &str) -> CommandOutput {
    CommandOutput {
        stdout: stdout.to_string(),
        stderr: String::new(),
        exit_code: Some(0),
    }
}

impl CommandRunner for FakeTools {
    fn run(&self, program: &str, args: &[String], _timeout: Duration) -> Result<CommandOutput> {
        self.calls
            .lock()
            .expect("calls")
            .push(format!("{program} {}", args.join(" ")));

        if program == "aapt" {
            let apk = args.last().map(String::as_str).unwrap_or_default();
            return Ok(ok(if package_for(apk).ends_with(".test") {
                TEST_BADGING
            } else {
                APP_BADGING
            }));
        }

        assert_eq!(args[0], "-s");
        let rest: Vec<&str> = args[2..].iter().map(String::as_str).collect();
        match rest.as_slice() {
            ["forward", ..] => Ok(CommandOutput {
                stdout: String::new(),
                stderr: "error: cannot bind listener".to_string(),
                exit_code: Some(self.forward_exit),
            }),
            ["install", .., path] => {
                if let Some(message) = self.install_error {
                    return Err(AppError::tool(message));
                }
                if self.install_registers {
                    self.installed
                        .lock()
                        .expect("installed")
                        .push(package_for(path).to_string());
                }
                Ok(ok(&self.install_output))
            }
            ["uninstall", package] => {
                self.installed
                    .lock()
                    .expect("installed")
                    .retain(|existing| existing.as_str() != *package);
                Ok(ok("Success\n"))
            }
            ["shell", "pm", "list", "packages"] => {
                let listing: String = self
                    .installed
                    .lock()
                    .expect("installed")
                    .iter()
                    .map(|package| format!("package:{package}\n"))
                    .collect();
                Ok(ok(&listing))
            }
            ["shell", "dumpsys", "window", "windows"] => {
                let locked = self
                    .keyguard
                    .lock()
                    .expect("keyguard")
                    .pop_front()
                    .unwrap_or(self.keyguard_default);
                Ok(ok(if locked { LOCKED } else { FOCUSED }))
            }
            ["shell", "am", "instrument", extras @ ..] => {
                if let Some(index) = extras.iter().position(|arg| *arg == "logcat") {
                    *self.last_tag.lock().expect("tag") = Some(extras[index + 1].to_string());
                }
                Ok(ok("INSTRUMENTATION_CODE: -1\n"))
            }
            ["logcat", ..] => {
                let tag = self.last_tag.lock().expect("tag").clone().unwrap_or_default();
                Ok(ok(&self.logcat.replace("{tag}", &tag)))
            }
            _ => Ok(ok("")),
        }
    }
}

type Handler = Box<dyn FnMut(&str, &Value) -> Result<Vec<u8>> + Send>;
type RequestLog = Arc<Mutex<Vec<(String, Value)>>>;

fn respond<F>(handler: F) -> Handler
where
    F: FnMut(&str, &Value) -> Result<Vec<u8>> + Send + 'static,
{
    Box::new(handler)
}

struct ScriptedTransport {
    handler: Handler,
    log: RequestLog,
}

impl Transport for ScriptedTransport {
    fn post(&mut self, path: &str, body: &Value, _options: &RequestOptions) -> Result<Vec<u8>> {
        self.log
            .lock()
            .expect("log")
            .push((path.to_string(), body.clone()));
        (self.handler)(path, body)
    }
}

fn requests_to(log: &RequestLog, path: &str) -> usize {
    log.lock()
        .expect("log")
        .iter()
        .filter(|(requested, _)| requested == path)
        .count()
}

fn tool_paths() -> ToolPaths {
    ToolPaths {
        adb: "adb".to_string(),
        aapt: "aapt".to_string(),
        zipalign: "zipalign".to_string(),
        keytool: "keytool".to_string(),
        jarsigner: "jarsigner".to_string(),
    }
}

fn session(tools: &Arc<FakeTools>, handler: Handler) -> (Device, RequestLog) {
    let log: RequestLog = Arc::new(Mutex::new(Vec::new()));
    let device = Device::from_parts(DeviceParts {
        serial: "emulator-5554".to_string(),
        server_port: 34777,
        test_server_port: 7102,
        app_path: Some(PathBuf::from("/builds/app.apk")),
        test_server_path: Some(PathBuf::from("/builds/test.apk")),
        screenshot_prefix: String::new(),
        endpoint: "http://127.0.0.1:34777/".to_string(),
        client_version: "1.2.3".to_string(),
        tools: tool_paths(),
        timings: Timings::immediate(),
        runner: tools.clone(),
        transport: Box::new(ScriptedTransport {
            handler,
            log: log.clone(),
        }),
        run_guard: RunGuard::new(),
    });
    (device, log)
}

/// A healthy server whose `/ready` turns true on call `ready_on` and reports `version`.
fn server(ready_on: u32, version: &'static str) -> Handler {
    let mut ready_calls = 0;
    respond(move |path, _body| match path {
        "/ping" => Ok(b"pong".to_vec()),
        "/ready" => {
            ready_calls += 1;
            let body: &[u8] = if ready_calls >= ready_on { b"true" } else { b"false" };
            Ok(body.to_vec())
        }
        "/" => Ok(format!(r#"{{"success":true,"message":"{version}","bonusInformation":[]}}"#).into_bytes()),
        "/kill" => Ok(Vec::new()),
        other => panic!("unexpected request to {other}"),
    })
}

fn unreachable(kind: TransportKind) -> Handler {
    respond(move |path, _body| Err(AppError::transport(kind, format!("{path} unreachable"))))
}

#[test]
fn ready_on_tenth_attempt_reaches_ready_state() {
    let tools = Arc::new(FakeTools::default());
    let (mut device, log) = session(&tools, server(10, "1.2.3"));

    device.start_test_server(&[]).expect("start");

    assert_eq!(device.state(), SessionState::Ready);
    assert_eq!(requests_to(&log, "/ready"), 10);
    assert!(!device.run_guard().is_aborted());

    let launches = tools.calls_matching("am instrument");
    assert_eq!(launches.len(), 1);
    let launch = &launches[0];
    assert!(!launch.contains(" -w "));
    assert!(launch.contains("-e target_package com.example.app "));
    assert!(launch.contains("-e main_activity com.example.app.MainActivity "));
    assert!(launch.contains("-e test_server_port 7102 "));
    assert!(launch.ends_with(
        "com.example.app.test/sh.calaba.instrumentationbackend.CalabashInstrumentationTestRunner"
    ));
}

#[test]
fn ready_on_eleventh_attempt_times_out_and_aborts_run() {
    let tools = Arc::new(FakeTools::default());
    let (mut device, log) = session(&tools, server(11, "1.2.3"));

    let err = device.start_test_server(&[]).unwrap_err();

    assert!(matches!(err, AppError::ReadinessTimeout { .. }));
    assert!(err.to_string().contains("http://127.0.0.1:34777/"));
    assert!(err.to_string().contains("logcat"));
    assert_eq!(requests_to(&log, "/ready"), 10);
    assert_eq!(requests_to(&log, "/"), 0);
    assert!(device.run_guard().is_aborted());
}

#[test]
fn matching_versions_pass_handshake() {
    assert!(check_versions("1.2.3", "1.2.3").is_ok());
}

#[test]
fn version_mismatch_names_both_versions() {
    let tools = Arc::new(FakeTools::default());
    let (mut device, _log) = session(&tools, server(1, "1.2.4"));

    let err = device.start_test_server(&[]).unwrap_err();

    assert_eq!(err.code(), "ERR_VERSION_MISMATCH");
    let message = err.to_string();
    assert!(message.contains("1.2.3"));
    assert!(message.contains("1.2.4"));
    assert_eq!(device.state(), SessionState::ReadinessPolling);
}

#[test]
fn unreadable_server_version_asks_for_reinstall() {
    let tools = Arc::new(FakeTools::default());
    let handler = respond(|path, _body| match path {
        "/ping" => Ok(b"pong".to_vec()),
        "/ready" => Ok(b"true".to_vec()),
        _ => Ok(br#"{"success":false,"message":"no version action"}"#.to_vec()),
    });
    let (mut device, _log) = session(&tools, handler);

    let err = device.start_test_server(&[]).unwrap_err();

    assert_eq!(err.code(), "ERR_VERSION_UNAVAILABLE");
    assert!(err.to_string().contains("reinstall_test_server"));
}

#[test]
fn app_that_never_answers_ping_did_not_start() {
    let tools = Arc::new(FakeTools::default());
    let (mut device, log) = session(&tools, unreachable(TransportKind::Refused));

    let err = device.start_test_server(&[]).unwrap_err();

    assert!(matches!(err, AppError::AppNotStarted));
    assert_eq!(requests_to(&log, "/ping"), 10);
    assert_eq!(requests_to(&log, "/ready"), 0);
}

#[test]
fn persistent_lock_screen_fails_before_launch() {
    let tools = Arc::new(FakeTools {
        keyguard_default: true,
        ..FakeTools::default()
    });
    let (mut device, log) = session(&tools, server(1, "1.2.3"));

    let err = device.start_test_server(&[]).unwrap_err();

    assert!(matches!(err, AppError::LockScreen));
    assert_eq!(tools.calls_matching("WakeUp").len(), 1);
    assert!(tools.calls_matching("am instrument").is_empty());
    assert!(log.lock().expect("log").is_empty());
}

#[test]
fn lock_screen_cleared_by_wake_up_continues_launch() {
    let tools = Arc::new(FakeTools {
        keyguard: Mutex::new(VecDeque::from(vec![true, true, false])),
        ..FakeTools::default()
    });
    let (mut device, _log) = session(&tools, server(1, "1.2.3"));

    device.start_test_server(&[]).expect("start");

    let wake = tools.calls_matching("WakeUp");
    assert_eq!(wake.len(), 1);
    assert!(wake[0].contains(
        "am start -a android.intent.action.MAIN -n com.example.app.test/sh.calaba.instrumentationbackend.WakeUp"
    ));
    assert_eq!(device.state(), SessionState::Ready);
}

#[test]
fn caller_overrides_win_over_defaults() {
    let extras = instrumentation_extras(
        "com.example.app",
        "com.example.app.MainActivity",
        7102,
        &[
            ("main_activity".to_string(), "com.example.app.DeepLink".to_string()),
            ("reset".to_string(), "true".to_string()),
        ],
    );
    let lookup = |key: &str| {
        extras
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    };
    assert_eq!(lookup("main_activity"), Some("com.example.app.DeepLink"));
    assert_eq!(lookup("reset"), Some("true"));
    assert_eq!(
        lookup("class"),
        Some("sh.calaba.instrumentationbackend.InstrumentationBackend")
    );
    assert_eq!(extras.iter().filter(|(k, _)| k == "main_activity").count(), 1);
}

#[test]
fn shutdown_against_unreachable_server_returns_normally() {
    for kind in [
        TransportKind::Reset,
        TransportKind::Timeout,
        TransportKind::EndOfStream,
    ] {
        let tools = Arc::new(FakeTools::default());
        let (mut device, log) = session(&tools, unreachable(kind));

        device.shutdown_test_server();

        assert_eq!(device.state(), SessionState::Stopped);
        assert_eq!(requests_to(&log, "/kill"), 1);
    }
}

#[test]
fn shutdown_gives_up_waiting_on_a_server_that_keeps_running() {
    let tools = Arc::new(FakeTools::default());
    let (mut device, log) = session(&tools, server(1, "1.2.3"));

    device.shutdown_test_server();

    assert_eq!(device.state(), SessionState::Stopped);
    assert!(requests_to(&log, "/ping") >= 1);
}

/// Answers `/kill`, then accepts every later request and never replies.
fn hanging_server() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().expect("addr").port();
    std::thread::spawn(move || {
        let mut held = Vec::new();
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { break };
            let mut reader = BufReader::new(stream.try_clone().expect("clone"));
            let mut request_line = String::new();
            let mut content_length = 0usize;
            reader.read_line(&mut request_line).expect("request line");
            loop {
                let mut line = String::new();
                reader.read_line(&mut line).expect("header");
                if let Some(value) = line.to_ascii_lowercase().strip_prefix("content-length:") {
                    content_length = value.trim().parse().expect("length");
                }
                if line == "\r\n" || line.is_empty() {
                    break;
                }
            }
            let mut body = vec![0u8; content_length];
            reader.read_exact(&mut body).expect("body");
            if request_line.starts_with("POST /kill") {
                stream
                    .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                    .expect("write");
            } else {
                held.push(stream);
            }
        }
    });
    port
}

#[test]
fn shutdown_wait_bounds_pings_to_a_hung_server() {
    let port = hanging_server();
    let tools = Arc::new(FakeTools::default());
    let mut device = Device::from_parts(DeviceParts {
        serial: "emulator-5554".to_string(),
        server_port: port,
        test_server_port: 7102,
        app_path: None,
        test_server_path: None,
        screenshot_prefix: String::new(),
        endpoint: format!("http://127.0.0.1:{port}/"),
        client_version: "1.2.3".to_string(),
        tools: tool_paths(),
        timings: Timings::default(),
        runner: tools.clone(),
        transport: Box::new(HttpClient::for_port(port, None, false)),
        run_guard: RunGuard::new(),
    });

    let started = Instant::now();
    device.shutdown_test_server();

    assert_eq!(device.state(), SessionState::Stopped);
    assert!(started.elapsed() < Duration::from_secs(4), "{:?}", started.elapsed());
}

#[test]
fn missing_package_after_install_aborts_the_run() {
    let tools = Arc::new(FakeTools {
        install_registers: false,
        install_output: "Performing Streamed Install\nFailure [INSTALL_FAILED_OLDER_SDK]\n".to_string(),
        ..FakeTools::default()
    });
    let (mut device, log) = session(&tools, server(1, "1.2.3"));

    let err = device.install_app(&PathBuf::from("/builds/app.apk")).unwrap_err();

    match &err {
        AppError::Installation { package, reason } => {
            assert_eq!(package, "com.example.app");
            assert_eq!(reason, "Failure [INSTALL_FAILED_OLDER_SDK]");
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert!(device.run_guard().is_aborted());

    let refused = device.perform_action(&Action::Version).unwrap_err();
    assert!(matches!(refused, AppError::RunAborted));
    let refused = device.start_test_server(&[]).unwrap_err();
    assert!(matches!(refused, AppError::RunAborted));
    assert!(log.lock().expect("log").is_empty());
}

#[test]
fn failing_install_command_aborts_the_run() {
    let tools = Arc::new(FakeTools {
        install_error: Some("Command 'adb install' timed out after 180s"),
        ..FakeTools::default()
    });
    let (mut device, log) = session(&tools, server(1, "1.2.3"));

    let err = device.install_app(&PathBuf::from("/builds/app.apk")).unwrap_err();

    assert_eq!(err.code(), "ERR_INSTALLATION");
    assert!(err.to_string().contains("timed out after 180s"));
    assert!(device.run_guard().is_aborted());
    assert!(matches!(
        device.perform_action(&Action::Version).unwrap_err(),
        AppError::RunAborted
    ));
    assert!(log.lock().expect("log").is_empty());

    let tools = Arc::new(FakeTools {
        install_error: Some("Failed to spawn adb: No such file or directory"),
        ..FakeTools::default()
    });
    let (mut device, _log) = session(&tools, server(1, "1.2.3"));
    let err = device.update_app(&PathBuf::from("/builds/app.apk")).unwrap_err();
    assert_eq!(err.code(), "ERR_INSTALLATION");
    assert!(device.run_guard().is_aborted());
}

#[test]
fn reinstall_apps_replaces_app_then_test_server() {
    let tools = Arc::new(FakeTools::default());
    let (mut device, _log) = session(&tools, server(1, "1.2.3"));

    device.reinstall_apps().expect("reinstall");

    let steps: Vec<String> = tools
        .calls()
        .into_iter()
        .filter(|call| call.contains(" install ") || call.contains(" uninstall "))
        .map(|call| call.replace("adb -s emulator-5554 ", ""))
        .collect();
    assert_eq!(
        steps,
        vec![
            "uninstall com.example.app",
            "install /builds/app.apk",
            "uninstall com.example.app.test",
            "install /builds/test.apk",
        ]
    );
    assert_eq!(device.state(), SessionState::Installed);
    assert_eq!(tools.calls_matching("dump badging").len(), 2);
}

#[test]
fn update_requires_success_marker() {
    let tools = Arc::new(FakeTools {
        install_output: "Failure [INSTALL_FAILED_VERSION_DOWNGRADE]\n".to_string(),
        ..FakeTools::default()
    });
    let (mut device, _log) = session(&tools, server(1, "1.2.3"));

    let err = device.update_app(&PathBuf::from("/builds/app.apk")).unwrap_err();

    assert_eq!(err.code(), "ERR_INSTALLATION");
    assert!(tools.calls_matching("install -r /builds/app.apk").len() == 1);
}

#[test]
fn failed_port_forward_is_reported() {
    let tools = Arc::new(FakeTools {
        forward_exit: 1,
        ..FakeTools::default()
    });
    let (mut device, _log) = session(&tools, server(1, "1.2.3"));

    let err = device.forward_port().unwrap_err();

    assert_eq!(err.code(), "ERR_TOOL");
    assert!(err.to_string().contains("cannot bind listener"));
    assert_eq!(device.state(), SessionState::Uninitialized);

    let tools = Arc::new(FakeTools::default());
    let (mut device, _log) = session(&tools, server(1, "1.2.3"));
    device.forward_port().expect("forward");
    assert_eq!(device.state(), SessionState::PortForwarded);
    assert_eq!(tools.calls_matching("forward tcp:34777 tcp:7102").len(), 1);
}

#[test]
fn action_failures_are_classified() {
    let tools = Arc::new(FakeTools::default());
    let mut replies = VecDeque::from(vec![
        Vec::new(),
        br#"{"success":false,"message":"View not found"}"#.to_vec(),
        br#"{"success":true,"bonusInformation":[{"token":"abc"}]}"#.to_vec(),
    ]);
    let handler = respond(move |_path, _body| Ok(replies.pop_front().unwrap_or_default()));
    let (mut device, log) = session(&tools, handler);

    let err = device.press_key("back").unwrap_err();
    assert!(matches!(err, AppError::EmptyResponse));

    let err = device.hide_soft_keyboard().unwrap_err();
    assert_eq!(err.to_string(), "Action 'hide_soft_keyboard' unsuccessful: View not found");

    let value = device.backdoor("login", json!("alice")).expect("backdoor");
    assert_eq!(value, json!({"token": "abc"}));

    let bodies = log.lock().expect("log").clone();
    assert_eq!(bodies[0].1, json!({"command": "press_key", "arguments": ["back"]}));
    assert_eq!(bodies[2].1, json!({"command": "backdoor", "arguments": ["login", "alice"]}));
}

#[test]
fn action_past_deadline_is_action_timeout() {
    let tools = Arc::new(FakeTools::default());
    let handler = respond(|_path, _body| {
        std::thread::sleep(Duration::from_millis(30));
        Err(AppError::transport(TransportKind::Timeout, "operation timed out"))
    });
    let (mut device, _log) = session(&tools, handler);
    device.timings.action_deadline = Duration::from_millis(10);

    let err = device.perform_action(&Action::custom("drag", vec![])).unwrap_err();

    assert_eq!(err.code(), "ERR_ACTION_TIMEOUT");
    assert!(err.to_string().contains("'drag'"));
    assert!(err.to_string().contains("10ms"), "{err}");
}

#[test]
fn early_transport_timeout_stays_transport_error() {
    let tools = Arc::new(FakeTools::default());
    let (mut device, _log) = session(&tools, unreachable(TransportKind::Timeout));

    let err = device.perform_action(&Action::Version).unwrap_err();

    assert_eq!(err.code(), "ERR_TRANSPORT");
}

#[test]
fn query_posts_converted_operations_to_map() {
    let tools = Arc::new(FakeTools::default());
    let handler = respond(|path, _body| {
        assert_eq!(path, "/map");
        Ok(br#"{"outcome":"SUCCESS","results":["ok"]}"#.to_vec())
    });
    let (mut device, log) = session(&tools, handler);

    let results = device
        .query("button marked:'Save'", &[json!({"setText": "hi"})])
        .expect("query");

    assert_eq!(results, vec![json!("ok")]);
    let (_, body) = log.lock().expect("log")[0].clone();
    assert_eq!(
        body,
        json!({
            "query": "button marked:'Save'",
            "operation": {
                "method_name": "query",
                "arguments": [{"method_name": "setText", "arguments": ["hi"]}]
            }
        })
    );
}

#[test]
fn preferences_use_the_action_protocol_when_app_runs() {
    let tools = Arc::new(FakeTools::default());
    let handler = respond(|path, _body| match path {
        "/ping" => Ok(b"pong".to_vec()),
        _ => Ok(br#"{"success":true,"bonusInformation":["{\"key\":\"user\",\"value\":\"alice\"}"]}"#.to_vec()),
    });
    let (mut device, log) = session(&tools, handler);

    let preferences = device.get_preferences("session").expect("prefs");

    assert_eq!(preferences["user"], json!("alice"));
    let bodies = log.lock().expect("log").clone();
    assert_eq!(bodies[1].1, json!({"command": "get_preferences", "arguments": ["session"]}));
    assert!(tools.calls_matching("GetPreferences").is_empty());
}

#[test]
fn preferences_fall_back_to_tagged_logcat_reply() {
    let tools = Arc::new(FakeTools {
        logcat: concat!(
            "I/1699999999_7: {\"success\":true,\"bonusInformation\":[\"{\\\"key\\\":\\\"stale\\\",\\\"value\\\":1}\"]}\n",
            "I/{tag}: {\"success\":true,\"bonusInformation\":[\"{\\\"key\\\":\\\"user\\\",\\\"value\\\":\\\"alice\\\"}\"]}\n",
        )
        .to_string(),
        ..FakeTools::default()
    });
    let (mut device, _log) = session(&tools, unreachable(TransportKind::Refused));

    let preferences = device.get_preferences("session").expect("prefs");

    assert_eq!(preferences.len(), 1);
    assert_eq!(preferences["user"], json!("alice"));
    let launches = tools.calls_matching("GetPreferences");
    assert_eq!(launches.len(), 1);
    assert!(launches[0].contains("am instrument -w -e logcat "));
    assert!(launches[0].contains("-e name session "));
}

#[test]
fn set_preferences_fallback_passes_values_as_extras() {
    let tools = Arc::new(FakeTools {
        logcat: "I/{tag}: {\"success\":true}\n".to_string(),
        ..FakeTools::default()
    });
    let (mut device, _log) = session(&tools, unreachable(TransportKind::Refused));
    let mut values = Map::new();
    values.insert("user".to_string(), json!("bob"));
    values.insert("count".to_string(), json!(2));

    device.set_preferences("session", &values).expect("set");

    let launch = &tools.calls_matching("SetPreferences")[0];
    assert!(launch.contains("-e user bob"));
    assert!(launch.contains("-e count 2"));
}

#[test]
fn missing_tagged_reply_is_preferences_error() {
    let tools = Arc::new(FakeTools {
        logcat: "I/someone_else: {\"success\":true}\n".to_string(),
        ..FakeTools::default()
    });
    let (mut device, _log) = session(&tools, unreachable(TransportKind::Refused));

    let err = device.clear_preferences("session").unwrap_err();

    assert_eq!(err.to_string(), "Could not clear preferences 'session'");
}

#[test]
fn screenshots_are_numbered_per_session() {
    let tmp = TempDir::new().expect("tmp");
    let tools = Arc::new(FakeTools::default());
    let handler = respond(|path, _body| {
        assert_eq!(path, "/screenshot");
        Ok(b"\x89PNG".to_vec())
    });
    let (mut device, _log) = session(&tools, handler);
    let prefix = format!("{}/shots/", tmp.path().display());

    let first = device.screenshot(Some(&prefix), Some("login.PNG")).expect("shot");
    let second = device.screenshot(Some(&prefix), None).expect("shot");

    assert_eq!(first, PathBuf::from(format!("{prefix}login_0.png")));
    assert_eq!(second, PathBuf::from(format!("{prefix}screenshot_1.png")));
    assert_eq!(std::fs::read(&first).expect("read"), b"\x89PNG");
}

#[test]
fn clear_app_data_waits_for_instrumentation() {
    let tools = Arc::new(FakeTools::default());
    let (mut device, _log) = session(&tools, server(1, "1.2.3"));

    device.clear_app_data().expect("clear");

    let launch = &tools.calls_matching("ClearAppData")[0];
    assert!(launch.ends_with(
        "am instrument -w com.example.app.test/sh.calaba.instrumentationbackend.ClearAppData"
    ));
}

#[test]
fn current_activity_reads_focused_app() {
    let tools = Arc::new(FakeTools::default());
    let (device, _log) = session(&tools, server(1, "1.2.3"));

    assert_eq!(
        device.current_activity().expect("activity").as_deref(),
        Some("MainActivity")
    );
}

#[test]
fn run_guard_is_shared_between_clones() {
    let guard = RunGuard::new();
    let other = guard.clone();
    other.abort();
    assert!(guard.is_aborted());
}

#[test]
fn poll_until_reports_the_successful_attempt() {
    assert_eq!(poll_until(10, Duration::ZERO, |attempt| attempt == 10), Some(10));
    assert_eq!(poll_until(10, Duration::ZERO, |attempt| attempt == 11), None);
}
