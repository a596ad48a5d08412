//! Byte streams over sockets.
//!
//! [Stream](trait.Stream.html) is the minimal interface protocol code needs:
//! partial reads and writes plus the exact-length loops built on top of them.
//! [SocketStream](struct.SocketStream.html) adapts a
//! [Socket](../socket/struct.Socket.html) and adds
//! [ByteBuffer](../buffer/struct.ByteBuffer.html) transfers that move bytes
//! with scatter/gather syscalls instead of an intermediate copy.

use std::io;

use crate::buffer::ByteBuffer;
use crate::socket::Socket;

pub trait Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;
    fn close(&mut self) -> io::Result<()>;

    /// Read until `buf` is full. A clean peer close before that is
    /// `UnexpectedEof`.
    fn read_exact(&mut self, buf: &mut [u8]) -> io::Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.read(&mut buf[filled..])?;
            if n == 0 {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
            filled += n;
        }
        Ok(())
    }

    /// Write all of `buf`.
    fn write_exact(&mut self, buf: &[u8]) -> io::Result<()> {
        let mut sent = 0;
        while sent < buf.len() {
            let n = self.write(&buf[sent..])?;
            if n == 0 {
                return Err(io::ErrorKind::WriteZero.into());
            }
            sent += n;
        }
        Ok(())
    }
}

pub struct SocketStream {
    socket: Socket,
}

impl SocketStream {
    pub fn new(socket: Socket) -> SocketStream {
        SocketStream { socket }
    }

    pub fn socket(&self) -> &Socket {
        &self.socket
    }

    pub fn into_socket(self) -> Socket {
        self.socket
    }

    /// Receive up to `len` bytes into `buf` with one scatter read. Returns
    /// the byte count (0 on peer close).
    pub fn read_buffer(&mut self, buf: &mut ByteBuffer, len: usize) -> io::Result<usize> {
        let iovs = buf.writable_iovecs(len);
        let n = unsafe { self.socket.recv_vectored(&iovs) }?;
        buf.advance_write(n);
        Ok(n)
    }

    /// Send up to `len` readable bytes from `buf` with one gather write.
    pub fn write_buffer(&mut self, buf: &mut ByteBuffer, len: usize) -> io::Result<usize> {
        let iovs = buf.readable_iovecs(len);
        if iovs.is_empty() {
            return Ok(0);
        }
        let n = unsafe { self.socket.send_vectored(&iovs) }?;
        buf.advance_read(n);
        Ok(n)
    }
}

impl Stream for SocketStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.socket.recv(buf)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.socket.send(buf)
    }

    fn close(&mut self) -> io::Result<()> {
        self.socket.close()
    }
}
