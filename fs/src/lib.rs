// Copyright 2024 Kevin Ludwig
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

pub use tapir_err::*;

/// Driver-facing interface over a mounted volume. Paths are UTF-8 and
/// slash-delimited; the empty path names the root directory.
pub trait FileSystem {
    /// Lists the entries of the directory at `path`.
    fn list(&mut self, path: &str) -> Result<Vec<Entry>>;

    /// Resolves `path` to its directory entry.
    fn lookup(&mut self, path: &str) -> Result<Entry>;

    /// Creates a file or directory named `name` inside the directory at
    /// `dir_path` and returns its first cluster.
    fn create(&mut self, dir_path: &str, name: &str, kind: EntryKind) -> Result<u32>;

    /// Reads from the file at `path` starting `offset` bytes in. Returns
    /// the number of bytes read, clamped to the file size.
    fn read(&mut self, path: &str, offset: u32, buffer: &mut [u8]) -> Result<usize>;

    /// Writes to the file at `path` starting `offset` bytes in, extending
    /// the file as needed. Returns the number of bytes written, which is
    /// short only when the volume runs out of clusters.
    fn write(&mut self, path: &str, offset: u32, buffer: &[u8]) -> Result<usize>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
}

/// Decoded directory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub name: String,
    pub kind: EntryKind,
    pub size: u32,
    pub first_cluster: u32,
}

impl Entry {
    pub fn is_directory(&self) -> bool {
        self.kind == EntryKind::Directory
    }
}
