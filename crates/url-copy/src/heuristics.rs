//! Error recoverability and timeout heuristics.

use fts_types::ErrorScope;
use std::time::Duration;

/// Extra time granted on top of the size-derived timeout.
const TIMEOUT_FLOOR: Duration = Duration::from_secs(600);

/// Whether an error is considered transient — caused by overload or a
/// passing condition — rather than something that would happen again on
/// retry.
pub fn is_recoverable(scope: ErrorScope, code: i32) -> bool {
    if code == libc::ETIMEDOUT {
        return true;
    }
    if code == libc::ECANCELED {
        return false;
    }

    match scope {
        ErrorScope::Source => !matches!(
            code,
            libc::ENOENT
                | libc::EPERM
                | libc::EACCES
                | libc::EISDIR
                | libc::ENAMETOOLONG
                | libc::E2BIG
                | libc::ENOTDIR
                | libc::EPROTONOSUPPORT
        ),
        ErrorScope::Destination => !matches!(
            code,
            libc::EPERM
                | libc::EACCES
                | libc::EISDIR
                | libc::ENAMETOOLONG
                | libc::E2BIG
                | libc::EPROTONOSUPPORT
        ),
        _ => !matches!(
            code,
            libc::ENOSPC
                | libc::EPERM
                | libc::EACCES
                | libc::EEXIST
                | libc::EFBIG
                | libc::EROFS
                | libc::ENAMETOOLONG
                | libc::EPROTONOSUPPORT
        ),
    }
}

/// Timeout derived from the file size: two seconds per started MiB, plus a
/// fixed floor for session setup.
pub fn timeout_for_size(size: u64) -> Duration {
    const MIB: u64 = 1024 * 1024;
    let mib = size.div_ceil(MIB);
    Duration::from_secs(mib * 2) + TIMEOUT_FLOOR
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeouts_are_always_recoverable() {
        for scope in [
            ErrorScope::Source,
            ErrorScope::Destination,
            ErrorScope::Transfer,
            ErrorScope::Agent,
        ] {
            assert!(is_recoverable(scope, libc::ETIMEDOUT));
        }
    }

    #[test]
    fn cancellation_is_never_recoverable() {
        for scope in [
            ErrorScope::Source,
            ErrorScope::Destination,
            ErrorScope::Transfer,
            ErrorScope::Agent,
        ] {
            assert!(!is_recoverable(scope, libc::ECANCELED));
        }
    }

    #[test]
    fn filesystem_semantics_by_scope() {
        // A missing source will stay missing.
        assert!(!is_recoverable(ErrorScope::Source, libc::ENOENT));
        // A missing destination entry is not terminal: the copy creates it.
        assert!(is_recoverable(ErrorScope::Destination, libc::ENOENT));
        assert!(!is_recoverable(ErrorScope::Destination, libc::EACCES));
        assert!(!is_recoverable(ErrorScope::Transfer, libc::ENOSPC));
        assert!(!is_recoverable(ErrorScope::Transfer, libc::EEXIST));
        // Connection refused is worth retrying everywhere.
        assert!(is_recoverable(ErrorScope::Source, libc::ECONNREFUSED));
        assert!(is_recoverable(ErrorScope::Transfer, libc::ECONNREFUSED));
    }

    #[test]
    fn timeout_scales_with_size() {
        assert_eq!(timeout_for_size(0), Duration::from_secs(600));
        assert_eq!(timeout_for_size(1), Duration::from_secs(602));
        assert_eq!(
            timeout_for_size(100 * 1024 * 1024),
            Duration::from_secs(200 + 600)
        );
    }
}
