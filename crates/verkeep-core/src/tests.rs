use super::*;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

const HOST_TOML: &str = r#"
state_dir = "/var/lib/verkeep-test"
history_limit = 3

[components.runtime]
version = "21"
source = "https://downloads.example.test/openjdk-{version}_linux-x64_bin.tar.gz"
install_root = "/opt/openjdk-{version}"
strip_components = 1

[components.runtime.env]
file = "/etc/environment"
var = "JAVA_HOME"

[components.app-server]
version = "10.1.24"
source = "https://downloads.example.test/apache-tomcat-{version}.tar.gz"
install_root = "/opt/tomcat-{version}"
depends_on = "runtime"
owner = "tomcat:tomcat"

[components.app-server.service]
name = "tomcat-{version}"
user = "tomcat"
group = "tomcat"
exec_start = "{install_root}/bin/catalina.sh run"
exec_stop = "{install_root}/bin/shutdown.sh"

[components.app-server.service.environment]
JAVA_HOME = "{dep:runtime}"
CATALINA_HOME = "{install_root}"
"#;

#[test]
fn parse_host_config_assigns_component_ids() {
    let config = HostConfig::from_toml_str(HOST_TOML).expect("must parse");
    assert_eq!(config.state_dir, PathBuf::from("/var/lib/verkeep-test"));
    assert_eq!(config.history_limit, 3);
    assert_eq!(config.step_timeout_secs, 900);

    let runtime = config
        .component(&ComponentId::new("runtime"))
        .expect("runtime configured");
    assert_eq!(runtime.id.as_str(), "runtime");
    assert_eq!(runtime.strip_components, 1);
    assert_eq!(
        runtime.env.as_ref().map(|env| env.var.as_str()),
        Some("JAVA_HOME")
    );

    let app = config
        .component(&ComponentId::new("app-server"))
        .expect("app-server configured");
    assert_eq!(app.depends_on, Some(ComponentId::new("runtime")));
}

#[test]
fn defaults_apply_when_omitted() {
    let config = HostConfig::from_toml_str("").expect("empty config is valid");
    assert_eq!(config.state_dir, PathBuf::from("/var/lib/verkeep"));
    assert_eq!(config.history_limit, 2);
    assert!(config.components.is_empty());
}

#[test]
fn dependency_order_places_dependency_first() {
    let config = HostConfig::from_toml_str(HOST_TOML).expect("must parse");
    assert_eq!(
        config.dependency_order(),
        vec![ComponentId::new("runtime"), ComponentId::new("app-server")]
    );
    assert_eq!(
        config.dependents_of(&ComponentId::new("runtime")),
        vec![ComponentId::new("app-server")]
    );
    assert!(config
        .dependents_of(&ComponentId::new("app-server"))
        .is_empty());
}

#[test]
fn reject_install_root_without_version_placeholder() {
    let raw = r#"
[components.runtime]
version = "17"
source = "https://example.test/jdk-{version}.tgz"
install_root = "/opt/java"
"#;
    let err = HostConfig::from_toml_str(raw).expect_err("must reject");
    assert!(
        err.to_string().contains("install_root must contain {version}"),
        "unexpected error: {err}"
    );
}

#[test]
fn reject_escaped_version_placeholder_in_install_root_and_source() {
    let escaped_root = r#"
[components.runtime]
version = "17"
source = "https://example.test/jdk-{version}.tgz"
install_root = "/opt/jdk-{{version}}"
"#;
    let err = HostConfig::from_toml_str(escaped_root).expect_err("must reject shared root");
    assert!(
        err.to_string().contains("install_root must contain {version}"),
        "unexpected error: {err}"
    );

    let escaped_source = r#"
[components.runtime]
version = "17"
source = "https://example.test/jdk-{{version}}.tgz"
install_root = "/opt/jdk-{version}"
"#;
    let err = HostConfig::from_toml_str(escaped_source).expect_err("must reject fixed source");
    assert!(
        err.to_string().contains("source must contain {version}"),
        "unexpected error: {err}"
    );
}

#[test]
fn reject_install_root_with_unavailable_placeholder() {
    let raw = r#"
[components.runtime]
version = "17"
source = "https://example.test/jdk-{version}.tgz"
install_root = "/opt/{service}/jdk-{version}"
"#;
    let err = HostConfig::from_toml_str(raw).expect_err("must reject");
    assert!(
        format!("{err:#}").contains("invalid install_root template"),
        "unexpected error: {err:#}"
    );
}

#[test]
fn reject_unknown_dependency_and_cycles() {
    let unknown = r#"
[components.app]
version = "1"
source = "https://example.test/app-{version}.tgz"
install_root = "/opt/app-{version}"
depends_on = "missing"
"#;
    let err = HostConfig::from_toml_str(unknown).expect_err("must reject unknown dependency");
    assert!(err.to_string().contains("unknown component 'missing'"));

    let cycle = r#"
[components.a]
version = "1"
source = "https://example.test/a-{version}.tgz"
install_root = "/opt/a-{version}"
depends_on = "b"

[components.b]
version = "1"
source = "https://example.test/b-{version}.tgz"
install_root = "/opt/b-{version}"
depends_on = "a"
"#;
    let err = HostConfig::from_toml_str(cycle).expect_err("must reject cycle");
    assert!(err.to_string().contains("dependency cycle"));
}

#[test]
fn reject_zero_history_limit() {
    let err = HostConfig::from_toml_str("history_limit = 0").expect_err("must reject");
    assert!(err.to_string().contains("history_limit"));
}

#[test]
fn reject_unknown_fields() {
    let raw = r#"
[components.runtime]
version = "17"
source = "https://example.test/jdk-{version}.tgz"
install_root = "/opt/jdk-{version}"
instal_root = "/typo"
"#;
    assert!(HostConfig::from_toml_str(raw).is_err());
}

#[test]
fn install_root_and_source_render_version() {
    let config = HostConfig::from_toml_str(HOST_TOML).expect("must parse");
    let runtime = config
        .component(&ComponentId::new("runtime"))
        .expect("runtime configured");
    assert_eq!(
        runtime.install_root("17").expect("must render"),
        PathBuf::from("/opt/openjdk-17")
    );
    assert_eq!(
        runtime.source_locator("17").expect("must render"),
        "https://downloads.example.test/openjdk-17_linux-x64_bin.tar.gz"
    );
}

#[test]
fn render_unit_embeds_dependency_root() {
    let config = HostConfig::from_toml_str(HOST_TOML).expect("must parse");
    let app = config
        .component(&ComponentId::new("app-server"))
        .expect("app-server configured");
    let mut deps = BTreeMap::new();
    deps.insert(ComponentId::new("runtime"), PathBuf::from("/opt/openjdk-21"));

    let unit = app
        .render_unit("10.1.24", &deps)
        .expect("must render")
        .expect("service configured");
    assert!(unit.contains("Environment=\"JAVA_HOME=/opt/openjdk-21\""));
    assert!(unit.contains("Environment=\"CATALINA_HOME=/opt/tomcat-10.1.24\""));
    assert!(unit.contains("ExecStart=/opt/tomcat-10.1.24/bin/catalina.sh run"));
    assert!(unit.contains("User=tomcat"));
    assert_eq!(
        app.unit_path("10.1.24").expect("must render"),
        Some(PathBuf::from("/etc/systemd/system/tomcat-10.1.24.service"))
    );
}

#[test]
fn render_unit_fails_without_installed_dependency() {
    let config = HostConfig::from_toml_str(HOST_TOML).expect("must parse");
    let app = config
        .component(&ComponentId::new("app-server"))
        .expect("app-server configured");
    let err = app
        .render_unit("10.1.24", &BTreeMap::new())
        .expect_err("missing dependency root must fail");
    assert!(format!("{err:#}").contains("dependency 'runtime' has no installed root"));
}

#[test]
fn render_unit_is_none_without_service() {
    let config = HostConfig::from_toml_str(HOST_TOML).expect("must parse");
    let runtime = config
        .component(&ComponentId::new("runtime"))
        .expect("runtime configured");
    assert_eq!(runtime.render_unit("21", &BTreeMap::new()).expect("ok"), None);
    assert_eq!(runtime.service_name("21").expect("ok"), None);
}

#[test]
fn template_escapes_and_rejects_unknown_placeholders() {
    let vars = TemplateVars::version("9");
    assert_eq!(
        render_template("ExecStart=/bin/sh -c 'echo ${{HOME}} {version}'", &vars).expect("ok"),
        "ExecStart=/bin/sh -c 'echo ${HOME} 9'"
    );
    assert!(render_template("{verison}", &vars).is_err());
    assert!(render_template("{version", &vars).is_err());
    assert!(render_template("{install_root}", &vars).is_err());
}

#[test]
fn sha256_of_known_input() {
    assert_eq!(
        sha256_hex(b""),
        "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
    );
}

#[test]
fn verify_sha256_file_detects_mismatch() {
    let root = test_dir();
    fs::create_dir_all(&root).expect("must create dir");
    let path = root.join("artifact.tar.gz");
    fs::write(&path, b"payload").expect("must write");

    let expected = sha256_hex(b"payload");
    verify_sha256_file(&path, &expected.to_uppercase()).expect("case-insensitive match");
    let err = verify_sha256_file(&path, &sha256_hex(b"other")).expect_err("must mismatch");
    assert!(err.to_string().contains("sha256 mismatch"));

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn tree_digest_tracks_content_and_layout() {
    let root = test_dir();
    write_file(&root.join("a/bin/java"), "bin");
    write_file(&root.join("a/lib/rt.jar"), "jar");
    write_file(&root.join("b/lib/rt.jar"), "jar");
    write_file(&root.join("b/bin/java"), "bin");

    let a = tree_sha256(&root.join("a")).expect("digest a");
    let b = tree_sha256(&root.join("b")).expect("digest b");
    assert_eq!(a, b);
    assert_eq!(a.file_count, 2);

    write_file(&root.join("b/lib/rt.jar"), "changed");
    let changed = tree_sha256(&root.join("b")).expect("digest b");
    assert_ne!(a.sha256, changed.sha256);

    let _ = fs::remove_dir_all(&root);
}

fn write_file(path: &Path, contents: &str) {
    fs::create_dir_all(path.parent().expect("parent")).expect("must create parent");
    fs::write(path, contents).expect("must write file");
}

fn test_dir() -> PathBuf {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system time")
        .as_nanos();
    let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!(
        "verkeep-core-test-{}-{nanos}-{seq}",
        std::process::id()
    ))
}

#[test]
fn validate_version_rejects_path_like_values() {
    validate_version("17").expect("plain version");
    validate_version("10.1.24").expect("dotted version");
    validate_version("21.0.2+13").expect("build metadata");
    for bad in ["", " 17", "../17", "17/lib", ".hidden", "1 7"] {
        assert!(validate_version(bad).is_err(), "'{bad}' should be rejected");
    }
}
