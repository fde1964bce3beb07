use super::*;

use std::sync::Mutex;
use std::time::Duration;

use crate::app::adb::runner::CommandOutput;

const BADGING: &str = "package: name='com.example.shop' versionCode='42' versionName='4.2'\n\
sdkVersion:'21'\n\
launchable-activity: name='com.example.shop.MainActivity'  label='Shop' icon=''\n";

const ALIAS_TREE: &str = r#"N: android=http://schemas.android.com/apk/res/android
  E: manifest (line=2)
    A: package="com.example.shop" (Raw: "com.example.shop")
    E: application (line=10)
      E: activity (line=12)
        A: android:name(0x01010003)="com.example.shop.SplashActivity" (Raw: "com.example.shop.SplashActivity")
      E: activity-alias (line=20)
        A: android:name(0x01010003)="com.example.shop.Launcher" (Raw: "com.example.shop.Launcher")
        A: android:targetActivity(0x01010202)="com.example.shop.SplashActivity" (Raw: "com.example.shop.SplashActivity")
        E: intent-filter (line=23)
          E: action (line=24)
            A: android:name(0x01010003)="android.intent.action.MAIN" (Raw: "android.intent.action.MAIN")
          E: category (line=25)
            A: android:name(0x01010003)="android.intent.category.LAUNCHER" (Raw: "android.intent.category.LAUNCHER")
"#;

#[test]
fn parses_package_name_from_badging() {
    assert_eq!(parse_package_name(BADGING).expect("package"), "com.example.shop");
}

#[test]
fn missing_package_line_is_manifest_error() {
    let err = parse_package_name("sdkVersion:'21'\n").unwrap_err();
    assert_eq!(err.code(), "ERR_MANIFEST");
    assert!(err.to_string().contains("'package' not found"));
}

#[test]
fn parses_launchable_activity_from_badging() {
    assert_eq!(
        parse_launchable_activity(BADGING).expect("activity"),
        "com.example.shop.MainActivity"
    );
    assert!(parse_launchable_activity("package: name='x'\n").is_err());
}

#[test]
fn resolves_alias_target_activity() {
    assert_eq!(
        resolve_activity_from_xmltree(ALIAS_TREE).expect("activity"),
        "com.example.shop.SplashActivity"
    );
}

#[test]
fn zero_launchers_is_an_error() {
    let tree = ALIAS_TREE.replace("category.LAUNCHER", "category.DEFAULT");
    let err = resolve_activity_from_xmltree(&tree).unwrap_err();
    assert!(err.to_string().contains("No launchable activity"));
}

#[test]
fn two_launchers_is_ambiguous() {
    let tree = format!(
        "{ALIAS_TREE}            A: android:name(0x01010003)=\"android.intent.category.LAUNCHER\" (Raw: \"android.intent.category.LAUNCHER\")\n"
    );
    let err = resolve_activity_from_xmltree(&tree).unwrap_err();
    assert!(err.to_string().contains("More than one launchable activity"));
}

#[test]
fn alias_without_target_is_ambiguous() {
    let tree: String = ALIAS_TREE
        .lines()
        .filter(|line| !line.contains("targetActivity"))
        .map(|line| format!("{line}\n"))
        .collect();
    let err = resolve_activity_from_xmltree(&tree).unwrap_err();
    assert!(err.to_string().contains("activity alias"));
}

#[test]
fn target_above_launcher_without_intent_filter_is_not_found() {
    // The targetActivity line sits above the launcher, but no intent-filter boundary is
    // crossed on the way up, so the resolve phase never starts.
    let tree = "E: activity-alias\n  A: android:targetActivity(0x01010202)=\"com.x.Main\"\n    A: android:name(0x01010003)=\"android.intent.category.LAUNCHER\"\n";
    let err = resolve_activity_from_xmltree(tree).unwrap_err();
    assert!(err.to_string().contains("Could not find launchable activity"));
}

#[test]
fn target_below_launcher_is_never_considered() {
    let tree = "E: activity-alias\n  E: intent-filter\n    A: android:name(0x01010003)=\"android.intent.category.LAUNCHER\"\n  A: android:targetActivity(0x01010202)=\"com.x.Main\"\n";
    let err = resolve_activity_from_xmltree(tree).unwrap_err();
    assert!(err.to_string().contains("activity alias"));
}

struct AaptScript {
    badging: String,
    xmltree: String,
    calls: Mutex<Vec<Vec<String>>>,
}

impl CommandRunner for AaptScript {
    fn run(&self, _program: &str, args: &[String], _timeout: Duration) -> Result<CommandOutput> {
        self.calls.lock().expect("calls").push(args.to_vec());
        let stdout = if args.iter().any(|a| a == "xmltree") {
            self.xmltree.clone()
        } else {
            self.badging.clone()
        };
        Ok(CommandOutput {
            stdout,
            stderr: String::new(),
            exit_code: Some(0),
        })
    }
}

#[test]
fn resolver_falls_back_to_manifest_tree_scan() {
    let script = Arc::new(AaptScript {
        badging: "package: name='com.example.shop'\n".to_string(),
        xmltree: ALIAS_TREE.to_string(),
        calls: Mutex::new(Vec::new()),
    });
    let resolver = ManifestResolver::new("aapt", script.clone());

    let identity = resolver.identity(Path::new("/apps/shop.apk")).expect("identity");
    assert_eq!(identity.package_name, "com.example.shop");
    assert_eq!(identity.launchable_activity, "com.example.shop.SplashActivity");

    let calls = script.calls.lock().expect("calls");
    let last = calls.last().expect("xmltree call");
    assert_eq!(last, &vec!["dump", "xmltree", "/apps/shop.apk", "AndroidManifest.xml"]);
}

#[test]
fn resolver_prefers_badging_metadata() {
    let script = Arc::new(AaptScript {
        badging: BADGING.to_string(),
        xmltree: String::new(),
        calls: Mutex::new(Vec::new()),
    });
    let resolver = ManifestResolver::new("aapt", script.clone());
    assert_eq!(
        resolver.launchable_activity(Path::new("a.apk")).expect("activity"),
        "com.example.shop.MainActivity"
    );
    assert_eq!(script.calls.lock().expect("calls").len(), 1);
}
