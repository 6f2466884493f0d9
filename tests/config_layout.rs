use anyhow::Result;

use pkgforge::cli::CliArgs;
use pkgforge::config::BuildConfig;

fn args(build_dir: std::path::PathBuf) -> CliArgs {
    CliArgs {
        specs: vec![build_dir.join("SPECS/foo/foo.spec")],
        capabilities: vec![],
        spec_data: build_dir.join("specs.json"),
        input_repo_dir: build_dir.join("input-repo"),
        build_dir,
        worker_tar: "worker.tar.gz".into(),
        source_url: "https://sources.example.invalid".into(),
        dist_tag: ".fc40".into(),
        max_dirt: 2,
        allow_cache_any_level: true,
        add_toolchain_packages: false,
        toolchain_package: "core-toolchain".into(),
        limiter_capacity: 4,
        sequential: false,
        log_level: None,
    }
}

#[test]
fn tiered_directories_follow_the_documented_layout() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let build_dir = dir.path().join("build");
    let config = BuildConfig::from_args(&args(build_dir.clone()))?;

    assert_eq!(config.rpms_dir(0), build_dir.join("RPMS"));
    assert_eq!(config.rpms_dir(1), build_dir.join("RPMS-dirty/1"));
    assert_eq!(config.rpms_dir(2), build_dir.join("RPMS-dirty/2"));
    assert_eq!(config.srpms_dir(0), build_dir.join("SRPMS"));
    assert_eq!(config.srpms_dir(1), build_dir.join("SRPMS-dirty/1"));
    assert_eq!(config.rpms_cache_dir, build_dir.join("RPMS-cache"));
    Ok(())
}

#[test]
fn ensure_layout_creates_every_tier() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let build_dir = dir.path().join("build");
    let config = BuildConfig::from_args(&args(build_dir.clone()))?;
    config.ensure_layout()?;

    for path in [
        build_dir.join("RPMS"),
        build_dir.join("RPMS-dirty/1"),
        build_dir.join("RPMS-dirty/2"),
        build_dir.join("SRPMS"),
        build_dir.join("SRPMS-dirty/1"),
        build_dir.join("SRPMS-dirty/2"),
        build_dir.join("RPMS-cache"),
    ] {
        assert!(path.is_dir(), "missing {}", path.display());
    }
    Ok(())
}

#[test]
fn zero_max_dirt_is_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut bad = args(dir.path().to_path_buf());
    bad.max_dirt = 0;
    assert!(BuildConfig::from_args(&bad).is_err());
}

#[test]
fn empty_dist_tag_is_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut bad = args(dir.path().to_path_buf());
    bad.dist_tag = "  ".into();
    assert!(BuildConfig::from_args(&bad).is_err());
}
