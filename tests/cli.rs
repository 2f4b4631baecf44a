use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;

fn vmlab() -> assert_cmd::Command {
    cargo_bin_cmd!("vmlab").into()
}

fn with_config(dir: &tempfile::TempDir) -> assert_cmd::Command {
    let mut cmd = vmlab();
    cmd.arg("--config-dir").arg(dir.path());
    cmd
}

#[test]
fn help_works() {
    vmlab()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Libvirt VM provisioning"));
}

#[test]
fn vm_subcommand_help_lists_operations() {
    vmlab()
        .args(["vm", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("set-cpu"))
        .stdout(predicate::str::contains("set-password"))
        .stdout(predicate::str::contains("fix-permissions"));
}

#[test]
fn init_installs_default_templates() {
    let dir = tempfile::tempdir().unwrap();

    with_config(&dir)
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("Initialized vmlab"));

    assert!(dir.path().join("vmlab.toml").exists());
    assert!(dir.path().join("templates/ubuntu-24.04.yaml").exists());
    assert!(dir.path().join("templates/debian-12.yaml").exists());

    with_config(&dir)
        .args(["template", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("ubuntu-24.04"))
        .stdout(predicate::str::contains("debian-13"));
}

#[test]
fn template_create_list_delete() {
    let dir = tempfile::tempdir().unwrap();

    with_config(&dir)
        .args([
            "template", "create", "fedora-41", "--os", "fedora", "--version", "41",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("created"));

    with_config(&dir)
        .args(["template", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("fedora-41"))
        .stdout(predicate::str::contains("fedora41").not());

    with_config(&dir)
        .args(["template", "delete", "fedora-41"])
        .assert()
        .success()
        .stdout(predicate::str::contains("deleted"));

    with_config(&dir)
        .args(["template", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No templates found"));
}

#[test]
fn template_list_json() {
    let dir = tempfile::tempdir().unwrap();

    with_config(&dir)
        .args([
            "template",
            "create",
            "custom",
            "--os",
            "ubuntu",
            "--version",
            "24.04",
            "--cloud-image-url",
            "https://example.test/img.qcow2",
        ])
        .assert()
        .success();

    with_config(&dir)
        .args(["template", "list", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"custom\""))
        .stdout(predicate::str::contains("https://example.test/img.qcow2"));
}

#[test]
fn template_delete_unknown_fails() {
    let dir = tempfile::tempdir().unwrap();

    with_config(&dir)
        .args(["template", "delete", "no-such-template"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not found"));
}

#[test]
fn broken_settings_file_shows_error() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("vmlab.toml"), "libvirt_uri = [not toml").unwrap();

    with_config(&dir)
        .args(["template", "list"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to parse settings"));
}

#[test]
fn image_list_with_empty_cache() {
    let dir = tempfile::tempdir().unwrap();
    let cache = dir.path().join("cache");
    std::fs::write(
        dir.path().join("vmlab.toml"),
        format!("cache_dir = \"{}\"\n", cache.display()),
    )
    .unwrap();

    with_config(&dir)
        .args(["image", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No cached images"));
}

#[test]
fn image_delete_unknown_fails() {
    let dir = tempfile::tempdir().unwrap();
    let cache = dir.path().join("cache");
    std::fs::create_dir_all(&cache).unwrap();
    std::fs::write(
        dir.path().join("vmlab.toml"),
        format!("cache_dir = \"{}\"\n", cache.display()),
    )
    .unwrap();

    with_config(&dir)
        .args(["image", "delete", "missing.img"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not found"));
}
