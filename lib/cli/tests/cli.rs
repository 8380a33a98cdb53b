use std::{path::Path, sync::Arc, thread};

use assert_cmd::Command;
use predicates::str::contains;
use tempfile::TempDir;
use tiny_http::{Response, Server};

const VERSION: &str = env!("CARGO_PKG_VERSION");
const MOUNT: &str = "xyz-f4m123.chdfs.ap-guangzhou.myqcloud.com";

fn ofs_loader() -> Command {
    let mut cmd = Command::cargo_bin("ofs-loader").unwrap();
    for var in [
        "ALL_PROXY",
        "all_proxy",
        "HTTPS_PROXY",
        "https_proxy",
        "HTTP_PROXY",
        "http_proxy",
        "RUST_LOG",
        "OFS_LOADER_CONFIG",
        "OFS_LOADER_CACHE_DIR",
    ] {
        cmd.env_remove(var);
    }
    cmd
}

fn write_config(dir: &Path, extra: &str) -> std::path::PathBuf {
    let path = dir.join("loader.toml");
    let cache_dir = dir.join("cache");
    let config = format!(
        "appid = 1250000000\ncache_dir = {:?}\n{extra}\n\n[retry.orchestrate]\nattempts = 1\nmin_delay = \"0s\"\nmax_delay = \"0s\"\n\n[retry.fetch]\nattempts = 1\nmin_delay = \"0s\"\nmax_delay = \"0s\"\n",
        cache_dir.display().to_string(),
    );
    std::fs::write(&path, config).unwrap();
    path
}

#[test]
fn version_string() {
    ofs_loader()
        .arg("--version")
        .assert()
        .success()
        .stdout(contains(format!("ofs-loader {VERSION}")));
}

#[test]
fn cache_dir_comes_from_the_config() {
    let temp = TempDir::new().unwrap();
    let config = write_config(temp.path(), "");

    ofs_loader()
        .arg("cache")
        .arg("--config")
        .arg(&config)
        .arg("dir")
        .assert()
        .success()
        .stdout(contains(temp.path().join("cache").display().to_string()));
}

#[test]
fn cache_dir_can_be_overridden() {
    let temp = TempDir::new().unwrap();
    let config = write_config(temp.path(), "");
    let other = temp.path().join("elsewhere");

    ofs_loader()
        .env("OFS_LOADER_CONFIG", &config)
        .arg("cache")
        .arg("--cache-dir")
        .arg(&other)
        .arg("dir")
        .assert()
        .success()
        .stdout(contains(other.display().to_string()));
}

#[test]
fn cache_clean_removes_artifacts() {
    let temp = TempDir::new().unwrap();
    let config = write_config(temp.path(), "");
    let cache = temp.path().join("cache");
    std::fs::create_dir_all(&cache).unwrap();
    std::fs::write(cache.join("ofs_plugin-v1.so"), "").unwrap();
    std::fs::write(cache.join("ofs_plugin-v1.so.LOCK"), "").unwrap();
    std::fs::write(cache.join("ofs_plugin-v1.so.0a1b2c.part"), "").unwrap();
    std::fs::write(cache.join("keep-me"), "").unwrap();

    ofs_loader()
        .args(["cache", "--config"])
        .arg(&config)
        .arg("clean")
        .assert()
        .success()
        .stderr(contains("Removed 2 cached file(s)."));

    assert!(!cache.join("ofs_plugin-v1.so").exists());
    assert!(cache.join("ofs_plugin-v1.so.LOCK").exists());
    assert!(cache.join("keep-me").exists());
}

#[test]
fn relative_cache_dir_is_rejected() {
    let temp = TempDir::new().unwrap();
    let config = temp.path().join("loader.toml");
    std::fs::write(&config, "appid = 1\ncache_dir = \"relative\"\n").unwrap();

    ofs_loader()
        .args(["cache", "--config"])
        .arg(&config)
        .arg("dir")
        .assert()
        .failure()
        .stderr(contains("must be absolute path"));
}

#[test]
fn invalid_mount_point() {
    let temp = TempDir::new().unwrap();
    let config = write_config(temp.path(), "");

    ofs_loader()
        .args(["resolve", "not_a_mount_point", "--config"])
        .arg(&config)
        .assert()
        .failure()
        .stderr(contains("init ofs impl failed after 1 attempt(s)"))
        .stderr(contains("mountPointAddr not_a_mount_point is invalid"));
}

#[test]
fn describe_queries_the_metadata_service() {
    let server = Arc::new(Server::http("127.0.0.1:0").unwrap());
    let addr = server.server_addr().to_ip().unwrap();
    let worker = {
        let server = Arc::clone(&server);
        thread::spawn(move || {
            if let Ok(request) = server.recv() {
                let body = r#"{"Response":{"HadoopPluginJar":{"VersionId":"v3","JarPath":"http://host/a-v3.jar","JarMd5":"5EB63BBBE01EEED093CB22BB8F5ACDC3"}}}"#;
                let _ = request.respond(Response::from_string(body));
            }
        })
    };
    let temp = TempDir::new().unwrap();
    let config = write_config(
        temp.path(),
        &format!("meta_use_tls = false\nmeta_indirection = \"{addr}\""),
    );

    ofs_loader()
        .args(["describe", MOUNT, "--config"])
        .arg(&config)
        .assert()
        .success()
        .stdout(contains(r#""version_id": "v3""#))
        .stdout(contains(r#""checksum": "5eb63bbbe01eeed093cb22bb8f5acdc3""#))
        .stdout(contains(r#""cached": false"#));

    worker.join().unwrap();
}
