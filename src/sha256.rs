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
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::Stream;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("expected sha256 {expected}, got {found} ({len} bytes)")]
pub struct Sha256VerifyError {
    pub expected: String,
    pub found: String,
    pub len: u64,
}

struct State {
    hasher: Sha256,
    len: u64,
}

/// Running digest shared between a [`HashingStream`] and whoever needs the
/// result once the stream has been drained.
#[derive(Clone)]
pub struct Tally(Arc<Mutex<State>>);

impl Tally {
    fn new() -> Self {
        Tally(Arc::new(Mutex::new(State {
            hasher: Sha256::new(),
            len: 0,
        })))
    }

    /// Number of bytes seen so far.
    pub fn bytes_seen(&self) -> u64 {
        self.0.lock().len
    }

    /// Lower-case hex digest of everything seen so far.
    pub fn hex_digest(&self) -> String {
        hex::encode(self.0.lock().hasher.clone().finalize())
    }

    /// Compares the digest against `expected`, ignoring case.
    pub fn verify(&self, expected: &str) -> Result<u64, Sha256VerifyError> {
        let found = self.hex_digest();
        let len = self.bytes_seen();

        if found.eq_ignore_ascii_case(expected) {
            Ok(len)
        } else {
            Err(Sha256VerifyError {
                expected: expected.to_owned(),
                found,
                len,
            })
        }
    }
}

/// Passes chunks through unchanged while feeding them into a SHA-256 digest.
pub struct HashingStream<S> {
    inner: S,
    tally: Tally,
}

impl<S> HashingStream<S> {
    pub fn new(inner: S) -> (Self, Tally) {
        let tally = Tally::new();
        (
            HashingStream {
                inner,
                tally: tally.clone(),
            },
            tally,
        )
    }
}

impl<S> Stream for HashingStream<S>
where
    S: Stream<Item = io::Result<Bytes>> + Unpin,
{
    type Item = io::Result<Bytes>;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Self::Item>> {
        let item = Pin::new(&mut self.inner).poll_next(cx);

        if let Poll::Ready(Some(Ok(chunk))) = &item {
            let mut state = self.tally.0.lock();
            state.hasher.update(chunk);
            state.len += chunk.len() as u64;
        }

        item
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}
