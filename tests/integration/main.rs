//! Integration tests for Kiln

mod cli_tests {
    use assert_cmd::{cargo::cargo_bin_cmd, Command};
    use predicates::prelude::*;

    fn kiln() -> Command {
        cargo_bin_cmd!("kiln")
    }

    #[test]
    fn help_displays() {
        kiln()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("GPU inference cache staging"));
    }

    #[test]
    fn version_displays() {
        kiln()
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("kiln"));
    }

    #[test]
    fn config_path() {
        kiln()
            .args(["config", "path"])
            .assert()
            .success()
            .stdout(predicate::str::contains("config.toml"));
    }

    #[test]
    fn config_show() {
        kiln()
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("[server]"));
    }

    #[test]
    fn ensure_without_pointer_fails() {
        kiln()
            .args(["ensure", "--model", "/models/m"])
            .env("RUN_META_FILE", "/definitely/not/here.env")
            .assert()
            .failure()
            .stderr(predicate::str::contains("Run manifest pointer not ready"));
    }

    #[test]
    fn inspect_empty_cache_root() {
        let temp = tempfile::TempDir::new().unwrap();

        kiln()
            .args(["inspect", "--cache-root"])
            .arg(temp.path())
            .assert()
            .success()
            .stdout(predicate::str::contains("deep_gemm"))
            .stdout(predicate::str::contains("\"valid\": false"));
    }
}

mod ensure_flow {
    use assert_cmd::{cargo::cargo_bin_cmd, Command};
    use predicates::prelude::*;
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    fn kiln() -> Command {
        cargo_bin_cmd!("kiln")
    }

    struct Fixture {
        _temp: TempDir,
        config_path: PathBuf,
        pointer_path: PathBuf,
    }

    /// Full on-disk fixture: cache root, stub compiler, run manifest and
    /// pointer file, and a config that wires them together.
    fn fixture() -> Fixture {
        let temp = TempDir::new().unwrap();
        let cache_root = temp.path().join("profiles");
        let run_dir = temp.path().join("run");
        std::fs::create_dir_all(&run_dir).unwrap();
        let log_file = temp.path().join("session.log");
        std::fs::write(&log_file, "").unwrap();

        let compiler = temp.path().join("compiler.sh");
        std::fs::write(
            &compiler,
            "#!/bin/sh\necho compiling with kv_cache_dtype=auto\ntouch \"$SGL_DG_CACHE_DIR/kernel.bin\"\n",
        )
        .unwrap();
        std::fs::set_permissions(&compiler, std::fs::Permissions::from_mode(0o755)).unwrap();

        let manifest_path = run_dir.join("run_meta.json");
        std::fs::write(
            &manifest_path,
            serde_json::to_string_pretty(&serde_json::json!({
                "container_run_id": "it-run",
                "storage": {"log_file": log_file.display().to_string()},
                "paths": {"container": {}}
            }))
            .unwrap(),
        )
        .unwrap();

        let pointer_path = temp.path().join("pointer.env");
        std::fs::write(
            &pointer_path,
            format!("CONTAINER_RUN_META_JSON={}\n", manifest_path.display()),
        )
        .unwrap();

        let config_path = temp.path().join("kiln.toml");
        std::fs::write(
            &config_path,
            format!(
                r#"
[paths]
cache_root = "{}"

[stages.deep_gemm]
compiler = ["{}"]
"#,
                cache_root.display(),
                compiler.display()
            ),
        )
        .unwrap();

        Fixture {
            _temp: temp,
            config_path,
            pointer_path,
        }
    }

    fn run_ensure(f: &Fixture) -> assert_cmd::assert::Assert {
        kiln()
            .args([
                "ensure",
                "--model",
                "/models/it-model",
                "--moe",
                "skip",
                "--flashinfer",
                "skip",
                "--inductor",
                "skip",
            ])
            .arg("--config")
            .arg(&f.config_path)
            .env("RUN_META_FILE", &f.pointer_path)
            .assert()
    }

    #[test]
    fn ensure_compiles_then_noops() {
        let f = fixture();

        run_ensure(&f).success().stdout(
            predicate::str::contains("RESULT_STATUS ok")
                .and(predicate::str::contains("deep_gemm:ok"))
                .and(predicate::str::contains("moe_tune:skipped")),
        );

        run_ensure(&f)
            .success()
            .stdout(predicate::str::contains("deep_gemm:noop"));
    }

    #[test]
    fn ensure_writes_run_record_and_updates_manifest() {
        let f = fixture();
        let output = run_ensure(&f).success().get_output().stdout.clone();
        let stdout = String::from_utf8(output).unwrap();

        let record_path = stdout
            .lines()
            .find_map(|line| line.strip_prefix("RESULT_JSON "))
            .expect("RESULT_JSON line missing");
        let record: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(Path::new(record_path)).unwrap())
                .unwrap();

        assert_eq!(record["schema_version"], 1);
        assert_eq!(record["status"], "ok");
        assert_eq!(record["run"]["run_id"], "it-run");
        assert_eq!(record["stages"]["deep_gemm"]["status"], "ok");

        // Manifest now points at the record
        let manifest_path = f._temp.path().join("run/run_meta.json");
        let manifest: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(manifest_path).unwrap()).unwrap();
        assert_eq!(
            manifest["paths"]["container"]["prep_result"],
            record_path
        );
    }
}
