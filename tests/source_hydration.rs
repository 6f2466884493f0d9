use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use pkgforge::artifacts::{SourceFile, SourceKind, SpecFile};
use pkgforge::buildtasks::sources::{
    hydrate_sources, load_signatures, sha256_hex, verify_signature,
};
use pkgforge::fetch::CancelFlag;

struct Fixture {
    _dir: tempfile::TempDir,
    spec_dir: PathBuf,
    dest: PathBuf,
}

fn fixture() -> Result<Fixture> {
    let dir = tempfile::tempdir()?;
    let spec_dir = dir.path().join("SPECS/foo");
    let dest = dir.path().join("dest");
    std::fs::create_dir_all(&spec_dir)?;
    std::fs::create_dir_all(&dest)?;
    std::fs::write(spec_dir.join("foo.spec"), "Name: foo\n")?;
    Ok(Fixture {
        _dir: dir,
        spec_dir,
        dest,
    })
}

fn spec_with_sources(spec_dir: &Path, sources: Vec<SourceFile>) -> Arc<SpecFile> {
    Arc::new(SpecFile {
        path: spec_dir.join("foo.spec"),
        provided_rpms: vec![],
        predicted_provides: vec![],
        sources,
    })
}

fn write_signatures(spec_dir: &Path, entries: &[(&str, &str)]) -> Result<()> {
    let table: Vec<String> = entries
        .iter()
        .map(|(name, hash)| format!("\"{name}\": \"{hash}\""))
        .collect();
    std::fs::write(
        spec_dir.join("foo.signatures.json"),
        format!("{{ \"Signatures\": {{ {} }} }}", table.join(", ")),
    )?;
    Ok(())
}

/// Serve the same fixed body for every request.
async fn serve(body: &'static [u8]) -> Result<String> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let mut buf = [0u8; 2048];
            let _ = socket.read(&mut buf).await;
            let header = format!(
                "HTTP/1.1 200 OK\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
                body.len()
            );
            let _ = socket.write_all(header.as_bytes()).await;
            let _ = socket.write_all(body).await;
            let _ = socket.shutdown().await;
        }
    });
    Ok(format!("http://{addr}"))
}

#[tokio::test]
async fn local_sources_with_good_signatures_hydrate() -> Result<()> {
    let fx = fixture()?;
    std::fs::write(fx.spec_dir.join("foo-1.0.tar.gz"), b"tarball bytes")?;
    std::fs::write(fx.spec_dir.join("fix-build.patch"), b"--- a\n+++ b\n")?;

    let digest = sha256_hex(&fx.spec_dir.join("foo-1.0.tar.gz"))?;
    write_signatures(&fx.spec_dir, &[("foo-1.0.tar.gz", &digest)])?;

    let spec = spec_with_sources(
        &fx.spec_dir,
        vec![
            SourceFile {
                name: "foo-1.0.tar.gz".into(),
                kind: SourceKind::Source,
            },
            SourceFile {
                name: "fix-build.patch".into(),
                kind: SourceKind::Patch,
            },
        ],
    );

    hydrate_sources(
        &spec,
        &fx.dest,
        "http://127.0.0.1:1/unused",
        &CancelFlag::new(),
    )
    .await?;

    assert!(fx.dest.join("foo-1.0.tar.gz").is_file());
    assert!(fx.dest.join("fix-build.patch").is_file());
    Ok(())
}

#[tokio::test]
async fn a_local_source_with_a_wrong_signature_is_fatal() -> Result<()> {
    let fx = fixture()?;
    std::fs::write(fx.spec_dir.join("foo-1.0.tar.gz"), b"tarball bytes")?;
    write_signatures(
        &fx.spec_dir,
        &[(
            "foo-1.0.tar.gz",
            "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa",
        )],
    )?;

    let spec = spec_with_sources(
        &fx.spec_dir,
        vec![SourceFile {
            name: "foo-1.0.tar.gz".into(),
            kind: SourceKind::Source,
        }],
    );

    let err = hydrate_sources(
        &spec,
        &fx.dest,
        "http://127.0.0.1:1/unused",
        &CancelFlag::new(),
    )
    .await
    .expect_err("mismatching local signature must fail");
    assert!(format!("{err:#}").contains("mismatching signature"));
    Ok(())
}

#[tokio::test]
async fn a_source_without_a_signature_entry_is_fatal() -> Result<()> {
    let fx = fixture()?;
    std::fs::write(fx.spec_dir.join("foo-1.0.tar.gz"), b"tarball bytes")?;
    write_signatures(&fx.spec_dir, &[])?;

    let spec = spec_with_sources(
        &fx.spec_dir,
        vec![SourceFile {
            name: "foo-1.0.tar.gz".into(),
            kind: SourceKind::Source,
        }],
    );

    let err = hydrate_sources(
        &spec,
        &fx.dest,
        "http://127.0.0.1:1/unused",
        &CancelFlag::new(),
    )
    .await
    .expect_err("source without a recorded signature must fail");
    assert!(format!("{err:#}").contains("no signature recorded"));
    Ok(())
}

#[tokio::test]
async fn a_mismatching_download_is_deleted_and_reported() -> Result<()> {
    let fx = fixture()?;
    write_signatures(
        &fx.spec_dir,
        &[(
            "foo-1.0.tar.gz",
            // Signature of something other than what the server serves.
            "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb",
        )],
    )?;

    let url = serve(b"unexpected content").await?;
    let spec = spec_with_sources(
        &fx.spec_dir,
        vec![SourceFile {
            name: "foo-1.0.tar.gz".into(),
            kind: SourceKind::Source,
        }],
    );

    let err = hydrate_sources(&spec, &fx.dest, &url, &CancelFlag::new())
        .await
        .expect_err("rejected download must leave the source unhydrated");
    assert!(format!("{err:#}").contains("foo-1.0.tar.gz"));

    // The rejected download must not linger in the destination.
    assert!(!fx.dest.join("foo-1.0.tar.gz").exists());
    Ok(())
}

#[tokio::test]
async fn downloaded_patches_need_no_signature() -> Result<()> {
    let fx = fixture()?;
    write_signatures(&fx.spec_dir, &[])?;

    let url = serve(b"--- a\n+++ b\n").await?;
    let spec = spec_with_sources(
        &fx.spec_dir,
        vec![SourceFile {
            name: "remote.patch".into(),
            kind: SourceKind::Patch,
        }],
    );

    hydrate_sources(&spec, &fx.dest, &url, &CancelFlag::new()).await?;
    assert!(fx.dest.join("remote.patch").is_file());
    Ok(())
}

#[tokio::test]
async fn cancellation_short_circuits_the_remote_loop() -> Result<()> {
    let fx = fixture()?;
    write_signatures(&fx.spec_dir, &[])?;

    let cancel = CancelFlag::new();
    cancel.cancel();

    let spec = spec_with_sources(
        &fx.spec_dir,
        vec![SourceFile {
            name: "never-fetched.tar.gz".into(),
            kind: SourceKind::Source,
        }],
    );

    let err = hydrate_sources(&spec, &fx.dest, "http://127.0.0.1:1/unused", &cancel)
        .await
        .expect_err("cancelled hydration must not succeed");
    assert!(format!("{err:#}").contains("cancelled"));
    Ok(())
}

#[test]
fn absent_signature_files_are_tolerated() -> Result<()> {
    let fx = fixture()?;
    let signatures = load_signatures(&fx.spec_dir.join("foo.spec"))?;
    assert!(signatures.is_empty());
    Ok(())
}

#[test]
fn verify_signature_is_case_insensitive() -> Result<()> {
    let fx = fixture()?;
    let file = fx.spec_dir.join("data.bin");
    std::fs::write(&file, b"payload")?;

    let digest = sha256_hex(&file)?.to_uppercase();
    let mut signatures = std::collections::BTreeMap::new();
    signatures.insert("data.bin".to_string(), digest);

    verify_signature(&file, &signatures)?;
    Ok(())
}
