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

pub use salvage_err::*;

use std::cell::RefCell;

/// Byte-addressed access to a volume image. All offsets are absolute from
/// the start of the volume; partial reads and writes are not expressible,
/// a request either completes for the whole buffer or fails.
pub trait DataStorage {
    fn len(&self) -> Result<u64>;

    fn read(&self, offset: u64, buffer: &mut [u8]) -> Result<()>;

    fn write(&self, offset: u64, buffer: &[u8]) -> Result<()>;
}

/// Volume image held entirely in memory, used by tests and for building
/// synthetic volumes.
pub struct MemStorage {
    bytes: RefCell<Vec<u8>>,
}

impl MemStorage {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes: RefCell::new(bytes),
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes.into_inner()
    }

    fn check_range(&self, offset: u64, length: usize) -> Result<usize> {
        let offset = offset as usize;
        let end = offset
            .checked_add(length)
            .filter(|&end| end <= self.bytes.borrow().len());
        match end {
            Some(_) => Ok(offset),
            None => {
                log::error!("Access at {offset}+{length} is outside the image");
                Err(Error::Io(std::io::ErrorKind::UnexpectedEof.into()))
            }
        }
    }
}

impl DataStorage for MemStorage {
    fn len(&self) -> Result<u64> {
        Ok(self.bytes.borrow().len() as u64)
    }

    fn read(&self, offset: u64, buffer: &mut [u8]) -> Result<()> {
        let offset = self.check_range(offset, buffer.len())?;
        buffer.copy_from_slice(&self.bytes.borrow()[offset..offset + buffer.len()]);
        Ok(())
    }

    fn write(&self, offset: u64, buffer: &[u8]) -> Result<()> {
        let offset = self.check_range(offset, buffer.len())?;
        self.bytes.borrow_mut()[offset..offset + buffer.len()].copy_from_slice(buffer);
        Ok(())
    }
}
