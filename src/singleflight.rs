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
//! Coalesces concurrent calls for the same key into one.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;

type Call<V, E> = Shared<BoxFuture<'static, Result<V, E>>>;

/// At most one call per key is in flight; later callers for the same key
/// wait for that call's result instead of starting their own.
pub struct Group<K, V, E> {
    calls: Arc<Mutex<HashMap<K, Call<V, E>>>>,
}

impl<K, V, E> Default for Group<K, V, E> {
    fn default() -> Self {
        Group {
            calls: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<K, V, E> Group<K, V, E>
where
    K: Hash + Eq + Clone + Send + 'static,
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `f` unless a call for `key` is already running, in which case
    /// its result is shared.
    ///
    /// If every waiter is dropped the call is parked, not cancelled; the next
    /// caller for the key picks it up where it stopped.
    pub async fn run<F, Fut>(&self, key: K, f: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        let call = {
            let mut calls = self.calls.lock();
            match calls.get(&key) {
                Some(call) => call.clone(),
                None => {
                    let call = f().boxed().shared();
                    calls.insert(key.clone(), call.clone());
                    call
                }
            }
        };

        let result = call.clone().await;

        let mut calls = self.calls.lock();
        if calls.get(&key).is_some_and(|c| c.ptr_eq(&call)) {
            calls.remove(&key);
        }

        result
    }

    /// Detaches the in-flight call for `key`, if any. Callers already waiting
    /// on it still get its result; the next caller starts a fresh call.
    pub fn forget(&self, key: &K) {
        self.calls.lock().remove(key);
    }

    /// Number of calls currently in flight.
    pub fn in_flight(&self) -> usize {
        self.calls.lock().len()
    }
}
