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
//! Key layout of everything the server keeps in the key-value store.

use crate::lfs::Oid;

pub fn object(owner: &str, repo: &str, oid: &Oid) -> String {
    format!("lfs:obj:{}/{}:{}", owner, repo, oid)
}

/// Tombstone recording that an object was looked up and not found.
pub fn missing(owner: &str, repo: &str, oid: &Oid) -> String {
    format!("lfs:neg:{}/{}:{}", owner, repo, oid)
}

pub fn allow(owner: &str, repo: &str) -> String {
    format!("lfs:allow:{}/{}", owner, repo)
}

pub fn session(id: &str) -> String {
    format!("lfs:session:{}", id)
}

pub fn oauth_state(state: &str) -> String {
    format!("lfs:oauth:state:{}", state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout() {
        let oid: Oid = "abcd".parse().unwrap();
        assert_eq!(
            object("acme", "widgets", &oid),
            "lfs:obj:acme/widgets:abcd"
        );
        assert_eq!(
            missing("acme", "widgets", &oid),
            "lfs:neg:acme/widgets:abcd"
        );
        assert_eq!(allow("acme", "widgets"), "lfs:allow:acme/widgets");
        assert_eq!(session("s1"), "lfs:session:s1");
        assert_eq!(oauth_state("x"), "lfs:oauth:state:x");
    }
}
