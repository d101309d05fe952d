//! Runtime configuration.

use serde::{Deserialize, Serialize};

/// Readiness table capacity used when the OS limit cannot be determined.
pub const DEFAULT_MAX_FDS: usize = 1024;

/// Upper bound on the capacity derived from the OS limit. Hosts commonly
/// raise `RLIMIT_NOFILE` into the millions or billions, and the table is
/// allocated up front.
pub const MAX_AUTO_FDS: usize = 1 << 20;

/// Configuration for a fiber runtime.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FiberConfig {
    /// Stack size for fibers created with `spawn`, in bytes. Default: 512KB.
    pub stack_size: usize,
    /// Stack size of the event-loop fiber. Default: 256KB.
    pub event_loop_stack_size: usize,
    /// Stack size for fibers created with `create_timer`. Default: 64KB.
    pub timer_stack_size: usize,
    /// Readiness table capacity. `None` uses the process open-file limit,
    /// capped at [`MAX_AUTO_FDS`].
    ///
    /// The table holds one slot per descriptor number and is allocated when
    /// the runtime first needs I/O. An explicit value is used as given, so a
    /// process that really keeps more than [`MAX_AUTO_FDS`] descriptors open
    /// must set it; one that raises its limit far above what it uses should
    /// set it lower.
    pub max_fds: Option<usize>,
}

impl Default for FiberConfig {
    fn default() -> Self {
        Self {
            stack_size: 512 * 1024,
            event_loop_stack_size: 256 * 1024,
            timer_stack_size: 64 * 1024,
            max_fds: None,
        }
    }
}

impl FiberConfig {
    /// Number of handle slots the readiness table and multiplexer are sized for.
    pub fn fd_capacity(&self) -> usize {
        match self.max_fds {
            Some(n) if n > 0 => n,
            _ => capacity_from_limit(open_file_limit()),
        }
    }
}

fn capacity_from_limit(limit: Option<usize>) -> usize {
    limit.map_or(DEFAULT_MAX_FDS, |limit| limit.min(MAX_AUTO_FDS))
}

/// Returns the soft `RLIMIT_NOFILE` of the process, if finite and queryable.
pub fn open_file_limit() -> Option<usize> {
    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: getrlimit only writes into the struct we hand it.
    let rc = unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) };
    if rc != 0 || limit.rlim_cur == libc::RLIM_INFINITY || limit.rlim_cur == 0 {
        return None;
    }
    usize::try_from(limit.rlim_cur).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_max_fds_wins() {
        let config = FiberConfig {
            max_fds: Some(64),
            ..FiberConfig::default()
        };
        assert_eq!(config.fd_capacity(), 64);
    }

    #[test]
    fn test_zero_max_fds_falls_back_to_os_limit() {
        let config = FiberConfig {
            max_fds: Some(0),
            ..FiberConfig::default()
        };
        let expected = capacity_from_limit(open_file_limit());
        assert_eq!(config.fd_capacity(), expected);
        assert!(config.fd_capacity() <= MAX_AUTO_FDS);
    }

    #[test]
    fn test_huge_os_limit_is_capped() {
        assert_eq!(capacity_from_limit(Some(1 << 30)), MAX_AUTO_FDS);
        assert_eq!(capacity_from_limit(Some(usize::MAX)), MAX_AUTO_FDS);
        assert_eq!(capacity_from_limit(Some(4096)), 4096);
        assert_eq!(capacity_from_limit(None), DEFAULT_MAX_FDS);
    }

    #[test]
    fn test_explicit_max_fds_is_not_capped() {
        let config = FiberConfig {
            max_fds: Some(MAX_AUTO_FDS + 1),
            ..FiberConfig::default()
        };
        assert_eq!(config.fd_capacity(), MAX_AUTO_FDS + 1);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: FiberConfig = serde_json::from_str(r#"{ "max_fds": 128 }"#).unwrap();
        assert_eq!(config.max_fds, Some(128));
        assert_eq!(config.stack_size, FiberConfig::default().stack_size);
        assert_eq!(config.timer_stack_size, 64 * 1024);
    }
}
