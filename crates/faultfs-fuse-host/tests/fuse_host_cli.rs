// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

#![allow(clippy::disallowed_methods)]

#[cfg(target_os = "linux")]
mod linux_tests {
    use std::fs;
    use std::path::PathBuf;
    use std::process::Command;

    fn bin_path() -> PathBuf {
        PathBuf::from(env!("CARGO_BIN_EXE_faultfs-fuse-host"))
    }

    #[test]
    fn fuse_host_binary_help_runs() {
        // Running with --help should not attempt a mount and must succeed
        let output = Command::new(bin_path())
            .arg("--help")
            .output()
            .expect("able to execute faultfs-fuse-host");

        assert!(output.status.success(), "--help should succeed");
        let help = String::from_utf8_lossy(&output.stdout);
        for flag in ["--config", "--call-db", "--log-call", "--log-level"] {
            assert!(help.contains(flag), "help should mention {flag}");
        }
    }

    #[test]
    fn missing_mount_point_is_rejected() {
        let status = Command::new(bin_path())
            .arg("/tmp")
            .status()
            .expect("able to execute faultfs-fuse-host");
        assert!(!status.success());
    }

    #[test]
    fn unreadable_config_fails_before_mounting() {
        let dir = tempfile::tempdir().expect("tempdir");
        let output = Command::new(bin_path())
            .arg(dir.path())
            .arg(dir.path().join("mnt"))
            .arg("--config")
            .arg(dir.path().join("missing.json"))
            .output()
            .expect("able to execute faultfs-fuse-host");

        assert!(!output.status.success());
        let stderr = String::from_utf8_lossy(&output.stderr);
        assert!(stderr.contains("loading config"), "stderr: {stderr}");
    }

    #[test]
    fn missing_replacement_file_fails_before_mounting() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = dir.path().join("faults.json");
        fs::write(
            &config,
            r#"{"modifiers": [{
                "path": "/disk.img",
                "replace": {"source": "file", "filename": "/nonexistent/payload.bin", "start": 0, "length": 16},
                "trigger": {"type": "byte_read_count", "byte": 0, "value": 0}
            }]}"#,
        )
        .expect("write config");

        let output = Command::new(bin_path())
            .arg(dir.path())
            .arg(dir.path().join("mnt"))
            .arg("--config")
            .arg(&config)
            .output()
            .expect("able to execute faultfs-fuse-host");

        assert!(!output.status.success());
        let stderr = String::from_utf8_lossy(&output.stderr);
        assert!(stderr.contains("building injection rules"), "stderr: {stderr}");
    }

    #[cfg(not(feature = "fuse"))]
    #[test]
    fn configures_without_mounting_when_fuse_is_disabled() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = dir.path().join("calls.db");
        let output = Command::new(bin_path())
            .arg(dir.path())
            .arg(dir.path().join("mnt"))
            .arg("--call-db")
            .arg(&db)
            .output()
            .expect("able to execute faultfs-fuse-host");

        assert!(output.status.success());
        assert!(db.exists());
        let stderr = String::from_utf8_lossy(&output.stderr);
        assert!(stderr.contains("nothing mounted"), "stderr: {stderr}");
    }
}
