use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::tempdir;

#[test]
fn help_shows_usage() {
    let mut cmd = Command::cargo_bin("animica-p2p").unwrap();
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Animica P2P core"));
}

#[test]
fn init_creates_peer_store() {
    let temp = tempdir().unwrap();
    let data_dir = temp.path().join("data");
    let mut cmd = Command::cargo_bin("animica-p2p").unwrap();
    cmd.arg("--data-dir").arg(&data_dir).arg("init").assert().success();
    assert!(data_dir.join("p2p").join("peers.db").exists());
}

#[test]
fn add_then_list_shows_peer() {
    let temp = tempdir().unwrap();
    let data_dir = temp.path().join("data");

    Command::cargo_bin("animica-p2p")
        .unwrap()
        .arg("--data-dir")
        .arg(&data_dir)
        .arg("add")
        .arg("tcp/127.0.0.1:30333")
        .arg("--peer-id")
        .arg("peer1")
        .assert()
        .success();

    Command::cargo_bin("animica-p2p")
        .unwrap()
        .arg("--data-dir")
        .arg(&data_dir)
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("peer1"));
}

#[test]
fn ban_then_forget_removes_peer() {
    let temp = tempdir().unwrap();
    let data_dir = temp.path().join("data");

    Command::cargo_bin("animica-p2p")
        .unwrap()
        .arg("--data-dir")
        .arg(&data_dir)
        .arg("add")
        .arg("tcp/127.0.0.1:30334")
        .arg("--peer-id")
        .arg("peer2")
        .assert()
        .success();

    Command::cargo_bin("animica-p2p")
        .unwrap()
        .arg("--data-dir")
        .arg(&data_dir)
        .arg("ban")
        .arg("peer2")
        .assert()
        .success();

    Command::cargo_bin("animica-p2p")
        .unwrap()
        .arg("--data-dir")
        .arg(&data_dir)
        .arg("forget")
        .arg("peer2")
        .assert()
        .success();
}

#[test]
fn export_then_import_round_trips() {
    let temp = tempdir().unwrap();
    let data_dir = temp.path().join("data");
    let seed_file = temp.path().join("seeds.json");

    Command::cargo_bin("animica-p2p")
        .unwrap()
        .arg("--data-dir")
        .arg(&data_dir)
        .arg("add")
        .arg("tcp/127.0.0.1:30335")
        .arg("--peer-id")
        .arg("peer3")
        .assert()
        .success();

    Command::cargo_bin("animica-p2p")
        .unwrap()
        .arg("--data-dir")
        .arg(&data_dir)
        .arg("export")
        .arg(&seed_file)
        .assert()
        .success();

    assert!(seed_file.exists());

    let data_dir_2 = temp.path().join("data2");
    Command::cargo_bin("animica-p2p")
        .unwrap()
        .arg("--data-dir")
        .arg(&data_dir_2)
        .arg("import")
        .arg(&seed_file)
        .assert()
        .success();
}
