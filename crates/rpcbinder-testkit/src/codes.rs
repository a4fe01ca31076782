//! Transaction codes understood by [`crate::EchoService`].

/// Reply with the request payload, descriptors included.
pub const ECHO: u32 = 1;
/// Fail with `PermissionDenied`.
pub const FAIL: u32 = 2;
/// Panic inside the handler.
pub const PANIC: u32 = 3;
/// Count a ping; meant to be sent oneway.
pub const PING: u32 = 4;
/// Payload is the 8-byte address of an object on the caller's side. The
/// handler calls `ECHO` on it with [`CALLBACK_REPLY`] and returns the result.
pub const CALLBACK: u32 = 5;
/// Block until the service's gate opens, then echo.
pub const BLOCK: u32 = 6;
/// Reply with the number of descriptors received, as a little-endian u32.
pub const COUNT_FDS: u32 = 7;

pub const CALLBACK_REPLY: &[u8] = b"called back";
