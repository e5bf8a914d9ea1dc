//! Offset-addressed reads and writes on a shared file handle.
//!
//! Segment tasks never share a cursor: every write names its own offset, so
//! one `Arc<File>` serves all of them without locking. The blocking syscalls
//! run on tokio's blocking pool.

use std::fs::File;
use std::io;
use std::sync::Arc;

use bytes::Bytes;

/// Writes all of `data` at `offset`.
pub(crate) async fn write_all_at(file: Arc<File>, offset: u64, data: Bytes) -> io::Result<()> {
    tokio::task::spawn_blocking(move || write_all_at_blocking(&file, offset, &data))
        .await
        .map_err(io::Error::other)?
}

/// Flushes file data and metadata to stable storage.
pub(crate) async fn sync_all(file: Arc<File>) -> io::Result<()> {
    tokio::task::spawn_blocking(move || file.sync_all())
        .await
        .map_err(io::Error::other)?
}

/// Resizes the file, zero-filling any extension.
pub(crate) async fn set_len(file: Arc<File>, len: u64) -> io::Result<()> {
    tokio::task::spawn_blocking(move || file.set_len(len))
        .await
        .map_err(io::Error::other)?
}

/// Current on-disk length.
pub(crate) async fn len(file: Arc<File>) -> io::Result<u64> {
    tokio::task::spawn_blocking(move || file.metadata().map(|meta| meta.len()))
        .await
        .map_err(io::Error::other)?
}

#[cfg(unix)]
fn write_all_at_blocking(file: &File, offset: u64, data: &[u8]) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(data, offset)
}

#[cfg(windows)]
fn write_all_at_blocking(file: &File, mut offset: u64, mut data: &[u8]) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !data.is_empty() {
        match file.seek_write(data, offset) {
            Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
            Ok(written) => {
                data = &data[written..];
                offset += written as u64;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Reads up to `buf.len()` bytes at `offset`; 0 means end of file.
#[cfg(unix)]
pub(crate) fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.read_at(buf, offset)
}

/// Reads up to `buf.len()` bytes at `offset`; 0 means end of file.
#[cfg(windows)]
pub(crate) fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::os::windows::fs::FileExt;
    file.seek_read(buf, offset)
}
