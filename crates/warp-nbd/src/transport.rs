//! Byte-stream transports
//!
//! A transport is a connected, non-blocking socket. Establishing TLS or
//! spawning servers is left to the caller; anything that implements
//! [`Transport`] can be handed to [`crate::Handle::connect_socket`].

use std::fmt::Debug;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;

/// Pollable byte stream carrying one NBD connection
pub trait Transport: Read + Write + AsRawFd + Send + Debug {
    /// Switch the descriptor to non-blocking mode
    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()>;

    /// Close both directions
    fn shutdown_both(&self) -> io::Result<()>;
}

impl Transport for TcpStream {
    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        TcpStream::set_nonblocking(self, nonblocking)
    }

    fn shutdown_both(&self) -> io::Result<()> {
        self.shutdown(Shutdown::Both)
    }
}

impl Transport for UnixStream {
    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        UnixStream::set_nonblocking(self, nonblocking)
    }

    fn shutdown_both(&self) -> io::Result<()> {
        self.shutdown(Shutdown::Both)
    }
}
