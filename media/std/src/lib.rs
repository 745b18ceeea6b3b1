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

use std::{
    cell::RefCell,
    fs::{File, OpenOptions},
    io,
    os::unix::fs::FileExt,
};

use tapir_media::{IoError, Medium, Result};

/// Medium backed by a regular file holding the disk image.
pub struct FileMedium {
    file: File,
}

impl FileMedium {
    pub fn open(file_path: &str) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(file_path)
            .map_err(IoError::Medium)?;
        Ok(Self { file })
    }
}

impl Medium for FileMedium {
    fn read(&self, offset: u64, buffer: &mut [u8]) -> Result<()> {
        self.file
            .read_exact_at(buffer, offset)
            .map_err(IoError::Medium)?;
        Ok(())
    }

    fn write(&self, offset: u64, buffer: &[u8]) -> Result<()> {
        self.file
            .write_all_at(buffer, offset)
            .map_err(IoError::Medium)?;
        Ok(())
    }
}

/// Medium backed by an in-memory image, fixed in size. Accesses past the
/// end fail like a short file would.
#[derive(Debug)]
pub struct RamMedium {
    bytes: RefCell<Vec<u8>>,
}

impl RamMedium {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes: RefCell::new(bytes),
        }
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.bytes.into_inner()
    }

    fn range(&self, offset: u64, length: usize) -> Result<(usize, usize)> {
        let start = usize::try_from(offset)
            .map_err(|_| IoError::Medium(io::ErrorKind::UnexpectedEof.into()))?;
        let end = start
            .checked_add(length)
            .filter(|&end| end <= self.bytes.borrow().len())
            .ok_or_else(|| IoError::Medium(io::ErrorKind::UnexpectedEof.into()))?;
        Ok((start, end))
    }
}

impl Medium for RamMedium {
    fn read(&self, offset: u64, buffer: &mut [u8]) -> Result<()> {
        let (start, end) = self.range(offset, buffer.len())?;
        buffer.copy_from_slice(&self.bytes.borrow()[start..end]);
        Ok(())
    }

    fn write(&self, offset: u64, buffer: &[u8]) -> Result<()> {
        let (start, end) = self.range(offset, buffer.len())?;
        self.bytes.borrow_mut()[start..end].copy_from_slice(buffer);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ram_medium_round_trip() {
        let medium = RamMedium::new(vec![0; 64]);
        medium.write(16, b"tapir").unwrap();

        let mut buffer = [0; 5];
        medium.read(16, &mut buffer).unwrap();
        assert_eq!(&buffer, b"tapir");
    }

    #[test]
    fn ram_medium_rejects_access_past_end() {
        let medium = RamMedium::new(vec![0; 64]);

        let mut buffer = [0; 8];
        assert!(medium.read(60, &mut buffer).is_err());
        assert!(medium.write(64, &buffer).is_err());
    }
}
