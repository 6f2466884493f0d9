use std::collections::BTreeSet;
use std::path::PathBuf;

use anyhow::Result;

use pkgforge::cli::CliArgs;
use pkgforge::config::BuildConfig;
use pkgforge::repo;

fn config(max_dirt: u32) -> Result<(tempfile::TempDir, BuildConfig)> {
    let dir = tempfile::tempdir()?;
    let args = CliArgs {
        specs: vec![],
        capabilities: vec!["bash".into()],
        spec_data: dir.path().join("specs.json"),
        input_repo_dir: dir.path().join("input-repo"),
        build_dir: dir.path().join("build"),
        worker_tar: dir.path().join("worker.tar.gz"),
        source_url: "https://sources.example.invalid".into(),
        dist_tag: ".fc40".into(),
        max_dirt,
        allow_cache_any_level: false,
        add_toolchain_packages: false,
        toolchain_package: "core-toolchain".into(),
        limiter_capacity: 4,
        sequential: true,
        log_level: None,
    };
    let config = BuildConfig::from_args(&args)?;
    Ok((dir, config))
}

fn priorities(overlays: &[pkgforge::sandbox::OverlayMount]) -> BTreeSet<u32> {
    overlays.iter().map(|o| o.priority).collect()
}

#[test]
fn clean_level_exposes_only_tier_zero() -> Result<()> {
    let (_dir, config) = config(2)?;

    let overlays = repo::overlays_for_dirt(&config, 0, false)?;
    assert_eq!(priorities(&overlays), BTreeSet::from([0]));
    assert_eq!(overlays[0].dest, PathBuf::from("/repos/0"));
    assert_eq!(overlays[0].source, config.rpms_dir(0));
    Ok(())
}

#[test]
fn always_cache_adds_the_upstream_tier_at_any_level() -> Result<()> {
    let (_dir, config) = config(2)?;

    let overlays = repo::overlays_for_dirt(&config, 0, true)?;
    assert_eq!(priorities(&overlays), BTreeSet::from([0, 3]));

    let cache = overlays
        .iter()
        .find(|o| o.priority == 3)
        .expect("cache overlay missing");
    assert_eq!(cache.dest, PathBuf::from("/repos/upstream"));
    assert_eq!(cache.source, config.rpms_cache_dir);
    Ok(())
}

#[test]
fn intermediate_dirt_levels_stack_local_tiers() -> Result<()> {
    let (_dir, config) = config(3)?;

    let overlays = repo::overlays_for_dirt(&config, 1, false)?;
    assert_eq!(priorities(&overlays), BTreeSet::from([0, 1]));

    let overlays = repo::overlays_for_dirt(&config, 2, false)?;
    assert_eq!(priorities(&overlays), BTreeSet::from([0, 1, 2]));
    Ok(())
}

#[test]
fn reaching_max_dirt_brings_in_the_input_repo_and_cache() -> Result<()> {
    let (_dir, config) = config(2)?;

    // At max dirt: local tiers 0..max-1, the input repo at max, the cache
    // one past it - even without always_cache.
    let overlays = repo::overlays_for_dirt(&config, 2, false)?;
    assert_eq!(priorities(&overlays), BTreeSet::from([0, 1, 2, 3]));

    let input = overlays.iter().find(|o| o.priority == 2).expect("input");
    assert_eq!(input.source, config.input_repo_dir);
    assert_eq!(input.dest, PathBuf::from("/repos/2"));

    // Past max dirt the set stays the same.
    let beyond = repo::overlays_for_dirt(&config, 3, false)?;
    assert_eq!(priorities(&beyond), BTreeSet::from([0, 1, 2, 3]));
    Ok(())
}

#[test]
fn all_overlays_is_the_full_stack() -> Result<()> {
    let (_dir, config) = config(2)?;

    let overlays = repo::all_overlays(&config)?;
    assert_eq!(priorities(&overlays), BTreeSet::from([0, 1, 2, 3]));
    Ok(())
}

#[test]
fn lower_priorities_come_first() -> Result<()> {
    let (_dir, config) = config(3)?;

    let overlays = repo::overlays_for_dirt(&config, 3, true)?;
    let listed: Vec<u32> = overlays.iter().map(|o| o.priority).collect();
    let mut sorted = listed.clone();
    sorted.sort();
    assert_eq!(listed, sorted);
    Ok(())
}
