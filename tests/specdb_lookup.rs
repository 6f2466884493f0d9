use std::io::Write;
use std::str::FromStr;

use anyhow::Result;

use pkgforge::capability::Capability;
use pkgforge::specdb::SpecDb;

fn write_db(contents: &str) -> Result<(tempfile::TempDir, std::path::PathBuf)> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("specs.json");
    let mut file = std::fs::File::create(&path)?;
    file.write_all(contents.as_bytes())?;
    Ok((dir, path))
}

#[test]
fn lookup_selects_the_spec_whose_provide_covers_the_request() -> Result<()> {
    let (_dir, path) = write_db(
        r#"{
            "Repo": [
                {
                    "Provides": { "Name": "bash", "Version": "5.0-1", "Condition": "=" },
                    "SpecPath": "SPECS/bash/bash.spec"
                },
                {
                    "Provides": { "Name": "openssl", "Version": "3.0.7" },
                    "SpecPath": "SPECS/openssl/openssl.spec"
                },
                {
                    "Provides": { "Name": "zlib" },
                    "SpecPath": "SPECS/zlib/zlib.spec"
                }
            ]
        }"#,
    )?;
    let db = SpecDb::load(&path)?;
    assert_eq!(db.len(), 3);

    // Exact name, unversioned request.
    let entry = db
        .lookup(&Capability::from_str("bash")?)
        .expect("bash should resolve");
    assert_eq!(entry.spec_path, std::path::PathBuf::from("SPECS/bash/bash.spec"));

    // Ranged request inside the provided version.
    let entry = db
        .lookup(&Capability::from_str("openssl >= 3.0")?)
        .expect("openssl should resolve");
    assert_eq!(
        entry.spec_path,
        std::path::PathBuf::from("SPECS/openssl/openssl.spec")
    );

    // Ranged request outside the provided version.
    assert!(db.lookup(&Capability::from_str("openssl >= 4.0")?).is_none());

    // Unversioned provide covers any request.
    assert!(db.lookup(&Capability::from_str("zlib = 1.2.13")?).is_some());

    // Unknown capability.
    assert!(db.lookup(&Capability::from_str("no-such-package")?).is_none());
    Ok(())
}

#[test]
fn an_empty_database_resolves_nothing() -> Result<()> {
    let (_dir, path) = write_db(r#"{ "Repo": [] }"#)?;
    let db = SpecDb::load(&path)?;
    assert!(db.is_empty());
    assert!(db.lookup(&Capability::from_str("bash")?).is_none());
    Ok(())
}

#[test]
fn malformed_databases_are_rejected() -> Result<()> {
    let (_dir, path) = write_db("not json at all")?;
    assert!(SpecDb::load(&path).is_err());
    Ok(())
}
