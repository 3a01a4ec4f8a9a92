//! Rendezvous socket path allocation.

use std::io;
use std::path::{Path, PathBuf};

use uuid::Uuid;

const SOCKET_PREFIX: &str = "pcruntime";
const MAX_ALLOCATION_ATTEMPTS: usize = 16;

/// Picks a socket path under `dir` that does not exist yet.
///
/// Candidates are regenerated on collision. The path is not reserved: the
/// subordinate creates the socket file itself once it starts listening.
pub fn allocate(dir: &Path) -> io::Result<PathBuf> {
    for _ in 0..MAX_ALLOCATION_ATTEMPTS {
        let candidate = dir.join(format!("{SOCKET_PREFIX}-{}.sock", Uuid::new_v4().simple()));
        if !candidate.try_exists()? {
            return Ok(candidate);
        }
    }
    Err(io::Error::new(
        io::ErrorKind::AlreadyExists,
        format!(
            "could not allocate a unique socket path in {} after {MAX_ALLOCATION_ATTEMPTS} attempts",
            dir.display()
        ),
    ))
}
