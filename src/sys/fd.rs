use std::io::{self, Read, Write};
use std::fs::File;
use std::os::unix::io::{FromRawFd, AsRawFd, IntoRawFd, RawFd};

/// An owned descriptor wrapped in `std::fs::File` purely to get `Drop`
/// (`close(2)` on drop) and buffered-free `Read`/`Write` for free.
#[derive(Debug)]
pub struct FileDesc(File);

impl FileDesc {
    /// # Safety
    /// `fd` must be an open, owned descriptor; ownership moves into the
    /// returned `FileDesc`, which closes it on drop.
    pub unsafe fn new(fd: RawFd) -> Self {
        FileDesc(File::from_raw_fd(fd))
    }
}

impl FromRawFd for FileDesc {
    unsafe fn from_raw_fd(fd: RawFd) -> Self {
        FileDesc(File::from_raw_fd(fd))
    }
}

impl AsRawFd for FileDesc {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

impl IntoRawFd for FileDesc {
    fn into_raw_fd(self) -> RawFd {
        self.0.into_raw_fd()
    }
}

impl Read for FileDesc {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

impl Read for &FileDesc {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (&self.0).read(buf)
    }
}

impl Write for FileDesc {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Write for &FileDesc {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (&self.0).write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

