//! Tunable limits for sessions and servers.
//!
//! Every limit has a default and can be overridden through an environment
//! variable. Values that fail to parse, or are zero, fall back to the default.

use std::str::FromStr;
use std::time::Duration;

/// Default number of threads a server advertises per session.
pub const DEFAULT_MAX_THREADS: usize = 1;

/// Default cap on outgoing connections a client opens.
pub const DEFAULT_MAX_OUTGOING_CONNECTIONS: usize = usize::MAX;

/// Largest command body accepted off the wire (16 MiB).
pub const DEFAULT_MAX_COMMAND_BODY: u32 = 16 * 1024 * 1024;

/// How many random ids the server tries before giving up on a new session.
pub const DEFAULT_SESSION_ID_RETRIES: usize = 5;

/// Interval between "still shutting down" diagnostics.
pub const DEFAULT_SHUTDOWN_LOG_INTERVAL: Duration = Duration::from_secs(1);

pub const DEFAULT_LISTEN_BACKLOG: i32 = 50;

/// Largest datagram carried by the message-channel transport (64 KiB).
pub const DEFAULT_CHANNEL_MESSAGE_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Limits {
    /// Incoming threads per session that a server offers its clients.
    pub max_threads: usize,
    /// Upper bound on outgoing connections opened by a client session.
    pub max_outgoing_connections: usize,
    /// Incoming (server-to-client) connections a client session opens.
    pub max_incoming_threads: usize,
    pub max_command_body: u32,
    pub session_id_retries: usize,
    pub shutdown_log_interval: Duration,
    pub listen_backlog: i32,
    /// Per-message cap picked up by [`TransportFactory::channel`](crate::TransportFactory::channel).
    pub channel_message_size: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_threads: DEFAULT_MAX_THREADS,
            max_outgoing_connections: DEFAULT_MAX_OUTGOING_CONNECTIONS,
            max_incoming_threads: 0,
            max_command_body: DEFAULT_MAX_COMMAND_BODY,
            session_id_retries: DEFAULT_SESSION_ID_RETRIES,
            shutdown_log_interval: DEFAULT_SHUTDOWN_LOG_INTERVAL,
            listen_backlog: DEFAULT_LISTEN_BACKLOG,
            channel_message_size: DEFAULT_CHANNEL_MESSAGE_SIZE,
        }
    }
}

impl Limits {
    /// Defaults, with `RPCBINDER_*` environment overrides applied.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_threads: env_or("RPCBINDER_MAX_THREADS", defaults.max_threads),
            max_outgoing_connections: env_or(
                "RPCBINDER_MAX_OUTGOING_CONNECTIONS",
                defaults.max_outgoing_connections,
            ),
            // zero is the meaningful default here, so only positive overrides apply
            max_incoming_threads: env_or(
                "RPCBINDER_MAX_INCOMING_THREADS",
                defaults.max_incoming_threads,
            ),
            max_command_body: env_or("RPCBINDER_MAX_COMMAND_BODY", defaults.max_command_body),
            session_id_retries: env_or(
                "RPCBINDER_SESSION_ID_RETRIES",
                defaults.session_id_retries,
            ),
            shutdown_log_interval: Duration::from_millis(env_or(
                "RPCBINDER_SHUTDOWN_LOG_INTERVAL_MS",
                defaults.shutdown_log_interval.as_millis() as u64,
            )),
            listen_backlog: env_or("RPCBINDER_LISTEN_BACKLOG", defaults.listen_backlog),
            channel_message_size: env_or(
                "RPCBINDER_CHANNEL_MESSAGE_SIZE",
                defaults.channel_message_size,
            ),
        }
    }
}

fn env_or<T>(key: &str, default: T) -> T
where
    T: FromStr + PartialEq + Default,
{
    let Ok(raw) = std::env::var(key) else {
        return default;
    };
    match raw.trim().parse::<T>() {
        Ok(value) if value != T::default() => value,
        _ => {
            tracing::warn!(key, value = %raw, "ignoring invalid override");
            default
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::Arc;

    use parking_lot::Mutex;

    #[test]
    fn env_override_ignores_garbage_and_zero() {
        std::env::set_var("RPCBINDER_TEST_LIMIT_A", "7");
        std::env::set_var("RPCBINDER_TEST_LIMIT_B", "zero");
        std::env::set_var("RPCBINDER_TEST_LIMIT_C", "0");
        assert_eq!(env_or("RPCBINDER_TEST_LIMIT_A", 3usize), 7);
        assert_eq!(env_or("RPCBINDER_TEST_LIMIT_B", 3usize), 3);
        assert_eq!(env_or("RPCBINDER_TEST_LIMIT_C", 3usize), 3);
        assert_eq!(env_or("RPCBINDER_TEST_LIMIT_UNSET", 3usize), 3);
    }

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn rejected_override_is_logged() {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();

        std::env::set_var("RPCBINDER_TEST_LIMIT_D", "lots");
        std::env::set_var("RPCBINDER_TEST_LIMIT_E", "9");
        tracing::subscriber::with_default(subscriber, || {
            assert_eq!(env_or("RPCBINDER_TEST_LIMIT_D", 3usize), 3);
            assert_eq!(env_or("RPCBINDER_TEST_LIMIT_E", 3usize), 9);
        });

        let logs = String::from_utf8(captured.0.lock().clone()).unwrap();
        assert!(logs.contains("ignoring invalid override"), "{logs}");
        assert!(logs.contains("RPCBINDER_TEST_LIMIT_D"), "{logs}");
        assert!(!logs.contains("RPCBINDER_TEST_LIMIT_E"), "{logs}");
    }
}
