use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use droid_driver_lib::app::adb::locator::validate_tool;
use droid_driver_lib::app::adb::runner::{CommandRunner, SystemRunner};
use droid_driver_lib::app::apk::fingerprint::FingerprintExtractor;
use droid_driver_lib::app::apk::keystore::Keystore;
use droid_driver_lib::app::apk::manifest::ManifestResolver;
use droid_driver_lib::app::apk::signer::PackageSigner;
use droid_driver_lib::app::config::DriverConfig;
use droid_driver_lib::app::device::{Device, RunGuard};
use droid_driver_lib::app::error::AppError;
use droid_driver_lib::app::logging::init_logging;
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

const TOOL_NAME: &str = "droid_driver_smoke";

#[derive(Debug, Clone, Default)]
struct Args {
    serial: Option<String>,
    app_path: Option<PathBuf>,
    test_server_path: Option<PathBuf>,
    resign: bool,
    fingerprint: bool,
    reinstall: bool,
    json: bool,
    verbose: bool,
}

#[derive(Serialize)]
struct SmokeSummary {
    tool: &'static str,
    status: &'static str,
    trace_id: String,
    serial: Option<String>,
    checks: Vec<SmokeCheck>,
}

#[derive(Serialize)]
struct SmokeCheck {
    name: &'static str,
    status: &'static str, // pass|fail|skip
    duration_ms: u128,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_code: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

fn parse_args() -> Result<Args, String> {
    let mut args = Args::default();
    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--serial" => {
                args.serial = it
                    .next()
                    .map(|v| v.trim().to_string())
                    .filter(|v| !v.is_empty());
                if args.serial.is_none() {
                    return Err("--serial requires a value".to_string());
                }
            }
            "--app" => {
                let value = it
                    .next()
                    .ok_or_else(|| "--app requires a value".to_string())?;
                args.app_path = Some(PathBuf::from(value));
            }
            "--test-server" => {
                let value = it
                    .next()
                    .ok_or_else(|| "--test-server requires a value".to_string())?;
                args.test_server_path = Some(PathBuf::from(value));
            }
            "--resign" => args.resign = true,
            "--fingerprint" => args.fingerprint = true,
            "--reinstall" => args.reinstall = true,
            "--json" => args.json = true,
            "-v" | "--verbose" => args.verbose = true,
            "-h" | "--help" => {
                return Err(
                    "Usage: cargo run --bin smoke -- [--serial SERIAL] [--app APK] [--test-server APK] [--resign] [--fingerprint] [--reinstall] [--json] [-v]\n"
                        .to_string(),
                );
            }
            other => return Err(format!("Unknown arg: {other}")),
        }
    }
    Ok(args)
}

fn run_check<F>(checks: &mut Vec<SmokeCheck>, name: &'static str, f: F) -> Result<(), ()>
where
    F: FnOnce() -> Result<Option<String>, AppError>,
{
    let start = Instant::now();
    match f() {
        Ok(detail) => {
            checks.push(SmokeCheck {
                name,
                status: "pass",
                duration_ms: start.elapsed().as_millis(),
                detail,
                error_code: None,
                error: None,
            });
            Ok(())
        }
        Err(err) => {
            checks.push(SmokeCheck {
                name,
                status: "fail",
                duration_ms: start.elapsed().as_millis(),
                detail: None,
                error_code: Some(err.code()),
                error: Some(err.to_string()),
            });
            Err(())
        }
    }
}

fn skip(checks: &mut Vec<SmokeCheck>, name: &'static str) {
    checks.push(SmokeCheck {
        name,
        status: "skip",
        duration_ms: 0,
        detail: None,
        error_code: None,
        error: None,
    });
}

fn finish(summary: SmokeSummary, json: bool) -> ! {
    let output = if json {
        serde_json::to_string_pretty(&summary).unwrap_or_else(|_| "{}".to_string())
    } else {
        let mut lines = vec![
            format!("status: {}", summary.status),
            format!("trace_id: {}", summary.trace_id),
        ];
        for check in &summary.checks {
            let mut line = format!("  {:<20} {}", check.name, check.status);
            if let Some(detail) = &check.detail {
                line.push_str(&format!(" ({detail})"));
            }
            if let Some(error) = &check.error {
                line.push_str(&format!(": {error}"));
            }
            lines.push(line);
        }
        lines.join("\n")
    };
    println!("{output}");
    std::process::exit(if summary.status == "pass" { 0 } else { 1 });
}

fn main() {
    let args = match parse_args() {
        Ok(v) => v,
        Err(msg) => {
            eprintln!("{msg}");
            std::process::exit(2);
        }
    };
    init_logging(args.verbose);

    let trace_id = Uuid::new_v4().to_string();
    let mut checks: Vec<SmokeCheck> = Vec::new();
    let summary = |status: &'static str, serial: Option<String>, checks: Vec<SmokeCheck>| SmokeSummary {
        tool: TOOL_NAME,
        status,
        trace_id: trace_id.clone(),
        serial,
        checks,
    };

    let mut config = match DriverConfig::from_env() {
        Ok(cfg) => cfg,
        Err(err) => {
            checks.push(SmokeCheck {
                name: "load_config",
                status: "fail",
                duration_ms: 0,
                detail: None,
                error_code: Some(err.code()),
                error: Some(err.to_string()),
            });
            finish(summary("fail", args.serial, checks), args.json);
        }
    };
    config.verbose |= args.verbose;
    if args.serial.is_some() {
        config.serial = args.serial.clone();
    }
    if args.app_path.is_some() {
        config.app_path = args.app_path.clone();
    }
    if args.test_server_path.is_some() {
        config.test_server_path = args.test_server_path.clone();
    }
    info!(trace_id = %trace_id, serial = ?config.serial, "smoke run starting");

    let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner);

    if run_check(&mut checks, "locate_tools", || {
        validate_tool(&config.tools.adb, "adb")?;
        validate_tool(&config.tools.aapt, "aapt")?;
        Ok(Some(config.tools.adb.clone()))
    })
    .is_err()
    {
        finish(summary("fail", config.serial.clone(), checks), args.json);
    }

    if run_check(&mut checks, "resolve_manifest", || {
        let resolver = ManifestResolver::new(config.tools.aapt.clone(), runner.clone());
        let identity = resolver.identity(config.require_app_path()?)?;
        let test_package = resolver.package_name(config.require_test_server_path()?)?;
        Ok(Some(format!(
            "{}/{} tested by {test_package}",
            identity.package_name, identity.launchable_activity
        )))
    })
    .is_err()
    {
        finish(summary("fail", config.serial.clone(), checks), args.json);
    }

    if args.resign {
        if run_check(&mut checks, "resign", || {
            let keystore = Keystore::first_available(&config.settings_file)?;
            let signer = PackageSigner::new(
                config.tools.jarsigner.clone(),
                config.tools.zipalign.clone(),
                keystore.clone(),
                runner.clone(),
            );
            signer.resign(config.require_app_path()?)?;
            signer.resign(config.require_test_server_path()?)?;
            Ok(Some(keystore.alias))
        })
        .is_err()
        {
            finish(summary("fail", config.serial.clone(), checks), args.json);
        }
    } else {
        skip(&mut checks, "resign");
    }

    if args.fingerprint {
        if run_check(&mut checks, "fingerprint", || {
            let extractor = FingerprintExtractor::new(config.tools.keytool.clone(), runner.clone());
            let fingerprint = extractor.fingerprint(config.require_test_server_path()?)?;
            Ok(Some(fingerprint.to_string()))
        })
        .is_err()
        {
            finish(summary("fail", config.serial.clone(), checks), args.json);
        }
    } else {
        skip(&mut checks, "fingerprint");
    }

    let mut device = None;
    if run_check(&mut checks, "connect", || {
        let connected = Device::connect(&config, RunGuard::new())?;
        let detail = format!("{} on port {}", connected.serial(), connected.server_port());
        device = Some(connected);
        Ok(Some(detail))
    })
    .is_err()
    {
        finish(summary("fail", config.serial.clone(), checks), args.json);
    }
    let Some(mut device) = device else {
        finish(summary("fail", config.serial.clone(), checks), args.json);
    };
    let serial = Some(device.serial().to_string());

    let mut status = "pass";
    if args.reinstall {
        if run_check(&mut checks, "reinstall", || device.reinstall_apps().map(|_| None)).is_err() {
            finish(summary("fail", serial, checks), args.json);
        }
    } else {
        skip(&mut checks, "reinstall");
    }

    if run_check(&mut checks, "start_test_server", || {
        device.start_test_server(&[]).map(|_| None)
    })
    .is_err()
    {
        status = "fail";
    } else if run_check(&mut checks, "server_version", || {
        device.server_version().map(Some)
    })
    .is_err()
    {
        status = "fail";
    }

    let _ = run_check(&mut checks, "shutdown", || {
        device.shutdown_test_server();
        Ok(None)
    });

    finish(summary(status, serial, checks), args.json);
}
