// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fs::{File, OpenOptions},
    io::{Read, Seek, SeekFrom},
    path::{Path, PathBuf},
    sync::Mutex,
};

use crate::{
    retry,
    source::{Error, Metadata, ReadStreamOptions, Result, SourceDestination},
};

/// A regular file acting as an image source or a flash destination. Used
/// directly for `.img`-style images and scratch files, and as the base for
/// tests exercising the transfer engine.
#[derive(Debug)]
pub struct LocalFile {
    path: PathBuf,
    writable: bool,
    file: Mutex<Option<File>>,
    metadata: Mutex<Option<Metadata>>,
}

impl LocalFile {
    pub fn new(path: impl AsRef<Path>, writable: bool) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            writable,
            file: Mutex::new(None),
            metadata: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open_handle(&self) -> Result<File> {
        let mut options = OpenOptions::new();
        if self.writable {
            options.read(true).write(true).create(true);
        } else {
            options.read(true);
        }

        Ok(options.open(&self.path)?)
    }

    #[cfg(unix)]
    fn read_at_impl(file: &File, buf: &mut [u8], offset: u64) -> Result<usize> {
        use std::os::unix::fs::FileExt;
        Ok(FileExt::read_at(file, buf, offset)?)
    }

    #[cfg(windows)]
    fn read_at_impl(file: &File, buf: &mut [u8], offset: u64) -> Result<usize> {
        use std::os::windows::fs::FileExt;
        Ok(FileExt::seek_read(file, buf, offset)?)
    }

    #[cfg(unix)]
    fn write_at_impl(file: &File, buf: &[u8], offset: u64) -> Result<usize> {
        use std::os::unix::fs::FileExt;
        Ok(FileExt::write_at(file, buf, offset)?)
    }

    #[cfg(windows)]
    fn write_at_impl(file: &File, buf: &[u8], offset: u64) -> Result<usize> {
        use std::os::windows::fs::FileExt;
        Ok(FileExt::seek_write(file, buf, offset)?)
    }
}

impl SourceDestination for LocalFile {
    fn open(&self) -> Result<()> {
        let mut file = self.file.lock().unwrap();
        if file.is_none() {
            // Opening a drive right after it was plugged in can fail while
            // the OS is still settling.
            *file = Some(retry_open(|| self.open_handle())?);
        }

        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.file.lock().unwrap().take();
        Ok(())
    }

    fn metadata(&self) -> Result<Metadata> {
        let mut metadata = self.metadata.lock().unwrap();
        if metadata.is_none() {
            *metadata = Some(Metadata {
                name: self
                    .path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned()),
                size: Some(std::fs::metadata(&self.path)?.len()),
                ..Default::default()
            });
        }

        Ok(metadata.clone().unwrap())
    }

    fn can_read(&self) -> bool {
        true
    }

    fn can_write(&self) -> bool {
        self.writable
    }

    fn can_create_read_stream(&self) -> bool {
        true
    }

    fn can_create_write_stream(&self) -> bool {
        self.writable
    }

    fn can_create_sparse_write_stream(&self) -> bool {
        self.writable
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let file = self.file.lock().unwrap();
        let file = file.as_ref().ok_or(Error::NotOpen)?;

        Self::read_at_impl(file, buf, offset)
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize> {
        let file = self.file.lock().unwrap();
        let file = file.as_ref().ok_or(Error::NotOpen)?;

        Self::write_at_impl(file, buf, offset)
    }

    fn create_read_stream(
        &self,
        options: ReadStreamOptions,
    ) -> Result<Box<dyn Read + Send + '_>> {
        // A fresh handle so the stream's cursor is independent of positioned
        // reads going through the shared handle.
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(options.start))?;

        match options.end {
            Some(end) => {
                let remain = end
                    .checked_sub(options.start)
                    .map(|n| n + 1)
                    .unwrap_or_default();
                Ok(Box::new(file.take(remain)))
            }
            None => Ok(Box::new(file)),
        }
    }
}

fn retry_open(op: impl Fn() -> Result<File>) -> Result<File> {
    retry::retry_on_transient(retry::MAX_RETRIES, retry::RETRY_BASE_TIMEOUT, || op())
}
