mod common;

use std::collections::HashMap;

use chrono::{Duration, Local};
use color_eyre::Result;
use ctor::ctor;
use kagami::mirror::Mirror;
use pretty_env_logger::formatted_timed_builder;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use crate::common::{digests, packages_index, release_index, test_config, Upstream};

const DEB: &[u8] = b"fake debian package";
const DEB_PATH: &str = "pool/main/h/hello/hello_1.0_amd64.deb";
const PACKAGES_PATH: &str = "dists/noble/main/binary-amd64/Packages";

#[ctor]
fn init() {
    color_eyre::install().unwrap();

    let mut log_builder = formatted_timed_builder();
    log_builder.parse_filters("kagami=debug");
    log_builder.try_init().unwrap();
}

/// A one-suite archive: Release, a binary-amd64 Packages index and
/// the listed pool files.
fn archive(by_hash: bool, items: &[(&str, &[u8])]) -> HashMap<String, Vec<u8>> {
    let packages = packages_index(items);

    let mut files = HashMap::new();
    files.insert(
        "dists/noble/Release".to_string(),
        release_index(by_hash, &[("main/binary-amd64/Packages", packages.as_bytes())])
            .into_bytes(),
    );
    files.insert(PACKAGES_PATH.to_string(), packages.into_bytes());
    for (path, data) in items {
        files.insert(path.to_string(), data.to_vec());
    }
    files
}

#[tokio::test]
async fn fresh_update_publishes_a_snapshot() -> Result<()> {
    let dir = TempDir::new()?;
    let upstream = Upstream::serve(archive(false, &[(DEB_PATH, DEB)])).await?;
    let config = test_config(dir.path(), &upstream.base_url)?;

    let mirror = Mirror::new(Local::now(), "test", &config).await?;
    mirror.update(&CancellationToken::new()).await?;

    let published = dir.path().join("test");
    assert!(tokio::fs::symlink_metadata(&published).await?.is_symlink());
    assert_eq!(tokio::fs::read(published.join(DEB_PATH)).await?, DEB);
    assert_eq!(
        tokio::fs::read(published.join(PACKAGES_PATH)).await?,
        packages_index(&[(DEB_PATH, DEB)]).into_bytes()
    );
    Ok(())
}

#[tokio::test]
async fn second_update_reuses_downloaded_files() -> Result<()> {
    let dir = TempDir::new()?;
    let upstream = Upstream::serve(archive(false, &[(DEB_PATH, DEB)])).await?;
    let config = test_config(dir.path(), &upstream.base_url)?;

    let t = Local::now();
    Mirror::new(t, "test", &config)
        .await?
        .update(&CancellationToken::new())
        .await?;

    upstream.clear_requests();
    let mirror = Mirror::new(t + Duration::seconds(1), "test", &config).await?;
    mirror.update(&CancellationToken::new()).await?;

    // only the Release variants may be fetched again; the index and
    // the pool files are hardlinked from the published snapshot
    let requested = upstream.requested();
    assert!(
        requested.iter().all(|p| p.starts_with("dists/noble/")),
        "{requested:?}"
    );
    assert!(
        !requested.iter().any(|p| p == PACKAGES_PATH),
        "{requested:?}"
    );

    let published = dir.path().join("test");
    assert_eq!(tokio::fs::read(published.join(DEB_PATH)).await?, DEB);
    Ok(())
}

#[tokio::test]
async fn missing_items_are_skipped() -> Result<()> {
    let missing = "pool/main/g/gone/gone_1.0_amd64.deb";
    let mut files = archive(false, &[(DEB_PATH, DEB), (missing, b"vanished")]);
    files.remove(missing);
    let upstream = Upstream::serve(files).await?;

    let dir = TempDir::new()?;
    let config = test_config(dir.path(), &upstream.base_url)?;
    Mirror::new(Local::now(), "test", &config)
        .await?
        .update(&CancellationToken::new())
        .await?;

    let published = dir.path().join("test");
    assert_eq!(tokio::fs::read(published.join(DEB_PATH)).await?, DEB);
    assert!(tokio::fs::metadata(published.join(missing)).await.is_err());
    Ok(())
}

#[tokio::test]
async fn failed_update_keeps_the_published_snapshot() -> Result<()> {
    let dir = TempDir::new()?;
    let upstream = Upstream::serve(archive(false, &[(DEB_PATH, DEB)])).await?;
    let config = test_config(dir.path(), &upstream.base_url)?;

    let t = Local::now();
    Mirror::new(t, "test", &config)
        .await?
        .update(&CancellationToken::new())
        .await?;

    // the upstream now advertises new content but still serves the
    // old bytes, so the item download cannot validate
    let mut files = archive(false, &[(DEB_PATH, b"hello 2.0")]);
    files.insert(DEB_PATH.to_string(), DEB.to_vec());
    let upstream2 = Upstream::serve(files).await?;
    let config2 = test_config(dir.path(), &upstream2.base_url)?;

    let mirror = Mirror::new(t + Duration::seconds(1), "test", &config2).await?;
    assert!(mirror.update(&CancellationToken::new()).await.is_err());

    assert_eq!(
        tokio::fs::read(dir.path().join("test").join(DEB_PATH)).await?,
        DEB
    );
    Ok(())
}

#[tokio::test]
async fn by_hash_mirrors_store_indices_under_their_digests() -> Result<()> {
    let dir = TempDir::new()?;
    let upstream = Upstream::serve(archive(true, &[(DEB_PATH, DEB)])).await?;
    let config = test_config(dir.path(), &upstream.base_url)?;

    Mirror::new(Local::now(), "test", &config)
        .await?
        .update(&CancellationToken::new())
        .await?;

    let packages = packages_index(&[(DEB_PATH, DEB)]);
    let (md5, sha1, sha256) = digests(packages.as_bytes());
    let published = dir.path().join("test");

    for location in [
        format!("dists/noble/main/binary-amd64/by-hash/SHA256/{sha256}"),
        format!("dists/noble/main/binary-amd64/by-hash/SHA1/{sha1}"),
        format!("dists/noble/main/binary-amd64/by-hash/MD5Sum/{md5}"),
    ] {
        assert_eq!(
            tokio::fs::read(published.join(&location)).await?,
            packages.as_bytes(),
            "{location}"
        );
    }

    // the natural index path is not materialized in by-hash mode
    assert!(tokio::fs::metadata(published.join(PACKAGES_PATH))
        .await
        .is_err());
    assert_eq!(tokio::fs::read(published.join(DEB_PATH)).await?, DEB);
    Ok(())
}

#[tokio::test]
async fn stale_index_content_falls_back_to_by_hash() -> Result<()> {
    let packages = packages_index(&[(DEB_PATH, DEB)]);
    let (_, _, sha256) = digests(packages.as_bytes());

    let mut files = archive(true, &[(DEB_PATH, DEB)]);
    files.insert(PACKAGES_PATH.to_string(), b"stale garbage".to_vec());
    files.insert(
        format!("dists/noble/main/binary-amd64/by-hash/SHA256/{sha256}"),
        packages.clone().into_bytes(),
    );
    let upstream = Upstream::serve(files).await?;

    let dir = TempDir::new()?;
    let config = test_config(dir.path(), &upstream.base_url)?;
    Mirror::new(Local::now(), "test", &config)
        .await?
        .update(&CancellationToken::new())
        .await?;

    let published = dir.path().join("test");
    assert_eq!(tokio::fs::read(published.join(DEB_PATH)).await?, DEB);
    assert_eq!(
        tokio::fs::read(published.join(format!(
            "dists/noble/main/binary-amd64/by-hash/SHA256/{sha256}"
        )))
        .await?,
        packages.as_bytes()
    );
    Ok(())
}

#[tokio::test]
async fn cancelled_update_fails_without_publishing() -> Result<()> {
    let dir = TempDir::new()?;
    let upstream = Upstream::serve(archive(false, &[(DEB_PATH, DEB)])).await?;
    let config = test_config(dir.path(), &upstream.base_url)?;

    let cancel = CancellationToken::new();
    cancel.cancel();

    let mirror = Mirror::new(Local::now(), "test", &config).await?;
    assert!(mirror.update(&cancel).await.is_err());
    assert!(tokio::fs::symlink_metadata(dir.path().join("test"))
        .await
        .is_err());
    Ok(())
}
