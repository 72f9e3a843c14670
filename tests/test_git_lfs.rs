// Copyright (c) 2019 Jason White
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in
// all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
// SOFTWARE.
//! Drives the gateway with a real `git lfs` client. Skipped when `git lfs`
//! is not installed.

mod common;

use std::path::Path;

use rand::rngs::StdRng;
use rand::SeedableRng;

use lfs_gateway::storage::generate_storage_key;

use common::{have_git_lfs, init_logger, sha256_hex, GitRepo, TestServer};
use common::{READER_TOKEN, WRITER_TOKEN};

#[tokio::test(flavor = "multi_thread")]
async fn push_then_pull() -> Result<(), Box<dyn std::error::Error>> {
    if !have_git_lfs() {
        eprintln!("Skipping test. git-lfs is not installed.");
        return Ok(());
    }

    let _guard = init_logger();
    let server = TestServer::spawn().await;
    let addr = server.server.addr();

    let mut rng = StdRng::seed_from_u64(42);

    let repo = GitRepo::init(addr, "acme/widgets", WRITER_TOKEN)?;
    let small = repo.add_random(Path::new("small.bin"), 4 * 1024, &mut rng)?;
    let large =
        repo.add_random(Path::new("large.bin"), 4 * 1024 * 1024, &mut rng)?;
    repo.commit("Add LFS objects")?;

    repo.lfs_push()?;

    for data in [&small, &large] {
        let key = generate_storage_key(&sha256_hex(data), "sha256")?;
        assert!(server.storage.contains(&key), "{} was not uploaded", key);
    }
    let uploads = server.storage.put_count();
    assert_eq!(uploads, 2);

    // Everything is already there, so a second push uploads nothing.
    repo.lfs_push()?;
    assert_eq!(server.storage.put_count(), uploads);

    repo.clean_lfs()?;
    repo.lfs_pull()?;
    assert_eq!(std::fs::read(repo.path().join("large.bin"))?, large);

    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn reader_cannot_push() -> Result<(), Box<dyn std::error::Error>> {
    if !have_git_lfs() {
        eprintln!("Skipping test. git-lfs is not installed.");
        return Ok(());
    }

    let _guard = init_logger();
    let server = TestServer::spawn().await;

    let mut rng = StdRng::seed_from_u64(7);

    let repo =
        GitRepo::init(server.server.addr(), "acme/widgets", READER_TOKEN)?;
    repo.add_random(Path::new("denied.bin"), 1024, &mut rng)?;
    repo.commit("Add LFS object")?;

    assert!(repo.lfs_push().is_err());
    assert_eq!(server.storage.put_count(), 0);

    Ok(())
}
