/// Protocol version reported by the health endpoint
pub const PROTOCOL_VERSION: &str = "parley/1";

/// Maximum length of a user identity
pub const MAX_USER_ID_LEN: usize = 64;

/// Maximum message text length in characters
pub const MAX_TEXT_LEN: usize = 4096;

/// Maximum length of the client-generated idempotency key
pub const MAX_CLIENT_UUID_LEN: usize = 64;

/// Default acknowledgment timeout per push attempt, in milliseconds
pub const DEFAULT_ACK_TIMEOUT_MS: u64 = 5_000;

/// Default number of push attempts before giving up
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default HTTP / WebSocket port
pub const DEFAULT_HTTP_PORT: u16 = 8080;
