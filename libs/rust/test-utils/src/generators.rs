//! Shared proptest generators for client profiles and errors.

use proptest::prelude::*;
use resilient_client::{
    ClassifiedError, ClientProfile, ErrorKind, PoolConfig, RetryConfig, TimeoutConfig,
};

/// Generate destination names.
pub fn destination_name_strategy() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9-]{2,20}"
}

/// Generate absolute base URLs.
pub fn address_strategy() -> impl Strategy<Value = String> {
    (
        prop_oneof![Just("http"), Just("https")],
        "[a-z][a-z0-9]{2,12}",
        1u16..65535,
    )
        .prop_map(|(scheme, host, port)| format!("{scheme}://{host}.internal:{port}"))
}

/// Generate valid retry blocks.
pub fn retry_config_strategy() -> impl Strategy<Value = RetryConfig> {
    (1u32..8, 1u64..2_000, 1.0f64..4.0, 0u64..30_000, any::<bool>()).prop_map(
        |(attempts, backoff, multiplier, extra_cap, jitter)| {
            let config = RetryConfig::default()
                .with_max_attempts(attempts)
                .with_backoff(backoff, multiplier)
                .with_max_backoff(backoff + extra_cap);
            if jitter { config.with_jitter() } else { config }
        },
    )
}

/// Generate timeout blocks.
pub fn timeout_config_strategy() -> impl Strategy<Value = TimeoutConfig> {
    (1u64..5_000, 1u64..300_000, 1u64..60_000).prop_map(|(c, r, w)| TimeoutConfig::new(c, r, w))
}

/// Generate pool blocks.
pub fn pool_config_strategy() -> impl Strategy<Value = PoolConfig> {
    (1usize..4_000, 0usize..4_000, any::<bool>()).prop_map(|(connections, pending, fail_fast)| {
        let pool = PoolConfig::default()
            .with_max_connections(connections)
            .with_max_pending(pending);
        if fail_fast { pool.with_fail_fast() } else { pool }
    })
}

/// Generate valid profiles without authentication.
pub fn profile_strategy() -> impl Strategy<Value = ClientProfile> {
    (
        destination_name_strategy(),
        address_strategy(),
        retry_config_strategy(),
        timeout_config_strategy(),
        pool_config_strategy(),
    )
        .prop_map(|(name, address, retry, timeout, pool)| {
            ClientProfile::new(name, address)
                .with_retry(retry)
                .with_timeout(timeout)
                .with_pool(pool)
        })
}

/// Generate error kinds.
pub fn error_kind_strategy() -> impl Strategy<Value = ErrorKind> {
    prop_oneof![
        Just(ErrorKind::Transient),
        Just(ErrorKind::Unretryable),
        Just(ErrorKind::Auth),
    ]
}

/// Generate classified errors.
pub fn classified_error_strategy() -> impl Strategy<Value = ClassifiedError> {
    (error_kind_strategy(), "[a-z_]{3,20}", "[a-zA-Z0-9 ]{0,40}")
        .prop_map(|(kind, code, message)| ClassifiedError::new(kind, code, message))
}

/// Generate downstream statuses that fail a call.
pub fn failure_status_strategy() -> impl Strategy<Value = u16> {
    prop_oneof![400u16..401, 402u16..500, 500u16..600]
}
