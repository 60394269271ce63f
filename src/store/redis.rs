//! Redis lock backend.
//!
//! Every mutation executes inside a server-side Lua script, so the
//! read-verify-mutate sequence is atomic and `now` comes from the Redis
//! `TIME` command -- the server is the time authority, uniformly for every
//! client. The backend itself only retains the script sources.
//!
//! # Key Schema
//!
//! | Key | Type | Purpose |
//! |-----|------|---------|
//! | `{prefix}:{key}` | String (JSON) | Lock record `{lock_id, fence, acquired_at_ms, expires_at_ms, key}` |
//! | `{prefix}:id:{lock_id}` | String | Reverse index, value = lock key; co-expires with the record |
//! | `{prefix}:fence:{key}` | String (integer) | Fence counter; **no TTL, never deleted** |
//!
//! The reverse index makes release/extend O(1) without scanning; it is an
//! optimisation, not an authority -- the scripts re-verify ownership and
//! liveness against the record it points to, so a stale index entry simply
//! reads as absent.
//!
//! Physical key TTLs are set to `ttl_ms + tolerance` so the mutation
//! scripts can observe (and uniformly reject) records through the tolerance
//! window; liveness is always decided by the shared predicate, never by key
//! existence.
//!
//! # Consistency
//!
//! Single-instance Redis gives full mutual exclusion here. Under Cluster or
//! Sentinel failover, asynchronous replication can briefly yield two
//! holders; fencing tokens, not the lock itself, are the correctness
//! mechanism for downstream writes.
//!
//! # Usage
//!
//! ```rust,no_run
//! use syncguard::store::redis::RedisBackend;
//!
//! # async fn example() -> syncguard::Result<()> {
//! let backend = RedisBackend::connect("redis://127.0.0.1:6379")
//!     .await?
//!     .with_prefix("my-app")?
//!     .with_cleanup_in_is_locked(false);
//! # let _ = backend;
//! # Ok(())
//! # }
//! ```

use ::redis::aio::MultiplexedConnection;
use ::redis::Script;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::backend::{
    ensure_not_cancelled, AcquireOutcome, AcquiredLock, BackendCapabilities, ExtendOutcome,
    LockBackend, LookupQuery, RawLockInfo, ReleaseOutcome, TimeAuthority,
};
use crate::constants::{STORAGE_KEY_LIMIT_BYTES, STORAGE_KEY_RESERVE_BYTES, TOLERANCE_MS};
use crate::error::{LockError, Result};
use crate::keys::{derive_fence_key, derive_storage_key, generate_lock_id};
use crate::store::LockRecord;
use crate::validate::{normalize_key, validate_lock_id, validate_ttl_ms};

// ---------------------------------------------------------------------------
// Lua script constants
// ---------------------------------------------------------------------------

/// Acquire: reject live records, advance the fence counter, write the
/// record and its reverse index with a shared TTL.
///
/// KEYS[1] = lock key, KEYS[2] = id key, KEYS[3] = fence key.
/// ARGV[1] = lock_id, ARGV[2] = ttl_ms, ARGV[3] = tolerance_ms,
/// ARGV[4] = user key, ARGV[5] = storage key (id-key value).
/// Returns {1, fence, acquired_at_ms, expires_at_ms} or {0, '', 0, 0}.
const LUA_ACQUIRE: &str = r"
local time = redis.call('TIME')
local now_ms = time[1] * 1000 + math.floor(time[2] / 1000)
local tolerance_ms = tonumber(ARGV[3])

local body = redis.call('GET', KEYS[1])
if body then
    local record = cjson.decode(body)
    if now_ms < tonumber(record.expires_at_ms) + tolerance_ms then
        return {0, '', 0, 0}
    end
end

local fence = redis.call('INCR', KEYS[3])
if fence > 900000000000000 then
    return redis.error_reply('fence counter overflow')
end
local fence_str = string.format('%015.0f', fence)

local ttl_ms = tonumber(ARGV[2])
local expires_at = now_ms + ttl_ms
local record = cjson.encode({
    lock_id = ARGV[1],
    fence = fence_str,
    acquired_at_ms = now_ms,
    expires_at_ms = expires_at,
    key = ARGV[4],
})
local px = ttl_ms + tolerance_ms
redis.call('SET', KEYS[1], record, 'PX', px)
redis.call('SET', KEYS[2], ARGV[5], 'PX', px)
return {1, fence_str, now_ms, expires_at}
";

/// Release: follow the reverse index, verify ownership and liveness, then
/// delete record and index. Stale index, expiry, and wrong owner all read
/// uniformly as absent. The fence counter is never touched.
///
/// KEYS[1] = id key. ARGV[1] = lock_id, ARGV[2] = tolerance_ms.
/// Returns 1 (released) or 0 (absent).
const LUA_RELEASE: &str = r"
local time = redis.call('TIME')
local now_ms = time[1] * 1000 + math.floor(time[2] / 1000)

local lock_key = redis.call('GET', KEYS[1])
if not lock_key then
    return 0
end
local body = redis.call('GET', lock_key)
if not body then
    redis.call('DEL', KEYS[1])
    return 0
end
local record = cjson.decode(body)
if record.lock_id ~= ARGV[1] then
    return 0
end
if now_ms >= tonumber(record.expires_at_ms) + tonumber(ARGV[2]) then
    return 0
end
redis.call('DEL', lock_key)
redis.call('DEL', KEYS[1])
return 1
";

/// Extend: same verification as release, then rewrite the record with a
/// fresh deadline and refresh both TTLs.
///
/// KEYS[1] = id key. ARGV[1] = lock_id, ARGV[2] = ttl_ms,
/// ARGV[3] = tolerance_ms.
/// Returns {1, expires_at_ms} or {0, 0}.
const LUA_EXTEND: &str = r"
local time = redis.call('TIME')
local now_ms = time[1] * 1000 + math.floor(time[2] / 1000)
local tolerance_ms = tonumber(ARGV[3])

local lock_key = redis.call('GET', KEYS[1])
if not lock_key then
    return {0, 0}
end
local body = redis.call('GET', lock_key)
if not body then
    redis.call('DEL', KEYS[1])
    return {0, 0}
end
local record = cjson.decode(body)
if record.lock_id ~= ARGV[1] then
    return {0, 0}
end
if now_ms >= tonumber(record.expires_at_ms) + tolerance_ms then
    return {0, 0}
end

local ttl_ms = tonumber(ARGV[2])
local expires_at = now_ms + ttl_ms
record.expires_at_ms = expires_at
local px = ttl_ms + tolerance_ms
redis.call('SET', lock_key, cjson.encode(record), 'PX', px)
redis.call('SET', KEYS[1], lock_key, 'PX', px)
return {1, expires_at}
";

/// Liveness probe, optionally culling a non-live record (and its index
/// entry -- never the fence counter).
///
/// KEYS[1] = lock key. ARGV[1] = tolerance_ms, ARGV[2] = '1' to cull,
/// ARGV[3] = id-key prefix (`{prefix}:id:`).
/// Returns 1 (live) or 0.
const LUA_IS_LOCKED: &str = r"
local time = redis.call('TIME')
local now_ms = time[1] * 1000 + math.floor(time[2] / 1000)

local body = redis.call('GET', KEYS[1])
if not body then
    return 0
end
local record = cjson.decode(body)
if now_ms < tonumber(record.expires_at_ms) + tonumber(ARGV[1]) then
    return 1
end
if ARGV[2] == '1' then
    redis.call('DEL', KEYS[1])
    redis.call('DEL', ARGV[3] .. record.lock_id)
end
return 0
";

/// Lookup by key: the record body when live, else nil.
///
/// KEYS[1] = lock key. ARGV[1] = tolerance_ms.
const LUA_LOOKUP_BY_KEY: &str = r"
local time = redis.call('TIME')
local now_ms = time[1] * 1000 + math.floor(time[2] / 1000)

local body = redis.call('GET', KEYS[1])
if not body then
    return false
end
local record = cjson.decode(body)
if now_ms >= tonumber(record.expires_at_ms) + tonumber(ARGV[1]) then
    return false
end
return body
";

/// Lookup by ID: follow the index, verify the record still belongs to the
/// queried ID and is live, return its body or nil.
///
/// KEYS[1] = id key. ARGV[1] = lock_id, ARGV[2] = tolerance_ms.
const LUA_LOOKUP_BY_ID: &str = r"
local time = redis.call('TIME')
local now_ms = time[1] * 1000 + math.floor(time[2] / 1000)

local lock_key = redis.call('GET', KEYS[1])
if not lock_key then
    return false
end
local body = redis.call('GET', lock_key)
if not body then
    return false
end
local record = cjson.decode(body)
if record.lock_id ~= ARGV[1] then
    return false
end
if now_ms >= tonumber(record.expires_at_ms) + tonumber(ARGV[2]) then
    return false
end
return body
";

// ---------------------------------------------------------------------------
// RedisBackend
// ---------------------------------------------------------------------------

const DEFAULT_PREFIX: &str = "syncguard";

/// Lock backend over a single Redis instance.
///
/// Holds a [`MultiplexedConnection`], which clones cheaply -- every clone
/// shares one TCP connection, so a `RedisBackend` can be shared across
/// tasks freely.
#[derive(Debug, Clone)]
pub struct RedisBackend {
    conn: MultiplexedConnection,
    prefix: String,
    cleanup_in_is_locked: bool,
}

/// Rejects prefixes that would collide with the fence-counter namespace.
fn validate_prefix(prefix: &str) -> Result<()> {
    if prefix.is_empty() {
        return Err(LockError::invalid_argument("prefix must not be empty"));
    }
    if prefix.contains("fence:") || prefix.ends_with("fence") {
        return Err(LockError::invalid_argument(
            "prefix must not contain 'fence:' or end with 'fence'",
        ));
    }
    Ok(())
}

/// Maps a Redis failure onto the library error taxonomy. Script-raised
/// fence overflow becomes an internal invariant violation.
fn map_redis_error(err: ::redis::RedisError, op: &str) -> LockError {
    use ::redis::ErrorKind;

    if err.to_string().contains("fence counter overflow") {
        return LockError::internal(format!("{op}: fence counter overflow"));
    }
    if err.is_timeout() {
        return LockError::NetworkTimeout {
            message: format!("{op}: {err}"),
            source: Some(Box::new(err)),
        };
    }
    match err.kind() {
        ErrorKind::AuthenticationFailed => LockError::AuthFailed {
            message: format!("{op}: {err}"),
        },
        ErrorKind::BusyLoadingError | ErrorKind::TryAgain => LockError::RateLimited {
            message: format!("{op}: {err}"),
        },
        _ => LockError::ServiceUnavailable {
            message: format!("{op}: {err}"),
            source: Some(Box::new(err)),
        },
    }
}

impl RedisBackend {
    /// Connects to Redis at `url` (`redis://[:<password>@]<host>:<port>[/<db>]`)
    /// with the default key prefix. Fails fast when the connection cannot be
    /// established.
    ///
    /// # Errors
    ///
    /// [`LockError::ServiceUnavailable`] (or a more specific transport
    /// variant) when the client cannot be created or connected.
    pub async fn connect(url: &str) -> Result<Self> {
        let client =
            ::redis::Client::open(url).map_err(|e| map_redis_error(e, "redis client open"))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| map_redis_error(e, "redis connect"))?;
        Ok(Self::with_connection(conn))
    }

    /// Wraps a pre-built multiplexed connection, for embedders that manage
    /// connection lifecycle themselves.
    pub fn with_connection(conn: MultiplexedConnection) -> Self {
        Self {
            conn,
            prefix: DEFAULT_PREFIX.to_string(),
            cleanup_in_is_locked: false,
        }
    }

    /// Sets the key prefix (builder style). Each embedder -- and each
    /// integration-test run -- should use its own prefix.
    ///
    /// # Errors
    ///
    /// [`LockError::InvalidArgument`] when the prefix is empty, contains
    /// `fence:`, or ends with `fence` (which would collide with the
    /// fence-counter namespace).
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Result<Self> {
        let prefix = prefix.into();
        validate_prefix(&prefix)?;
        self.prefix = prefix;
        Ok(self)
    }

    /// Opts into culling non-live records during `is_locked` (builder
    /// style). The fence counter is never culled.
    pub fn with_cleanup_in_is_locked(mut self, cleanup: bool) -> Self {
        self.cleanup_in_is_locked = cleanup;
        self
    }

    fn lock_key(&self, normalized_key: &str) -> Result<String> {
        derive_storage_key(
            &self.prefix,
            normalized_key,
            STORAGE_KEY_LIMIT_BYTES,
            STORAGE_KEY_RESERVE_BYTES,
        )
    }

    fn id_key(&self, lock_id: &str) -> String {
        format!("{}:id:{lock_id}", self.prefix)
    }

    fn id_key_prefix(&self) -> String {
        format!("{}:id:", self.prefix)
    }

    fn fence_key(&self, lock_key: &str) -> Result<String> {
        derive_fence_key(&self.prefix, lock_key, STORAGE_KEY_LIMIT_BYTES, 0)
    }

    fn parse_body(&self, body: &str) -> Result<LockRecord> {
        serde_json::from_str(body).map_err(|e| LockError::Internal {
            message: format!("malformed lock record in Redis: {e}"),
            key: None,
            source: Some(Box::new(e)),
        })
    }
}

#[async_trait]
impl LockBackend for RedisBackend {
    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            supports_fencing: true,
            time_authority: TimeAuthority::Server,
        }
    }

    async fn acquire(
        &self,
        key: &str,
        ttl_ms: i64,
        cancel: &CancellationToken,
    ) -> Result<AcquireOutcome> {
        let normalized = normalize_key(key)?;
        validate_ttl_ms(ttl_ms)?;
        ensure_not_cancelled(cancel)?;

        let lock_key = self.lock_key(&normalized)?;
        let fence_key = self.fence_key(&lock_key)?;
        let lock_id = generate_lock_id();
        let id_key = self.id_key(&lock_id);

        let script = Script::new(LUA_ACQUIRE);
        let (ok, fence, acquired_at_ms, expires_at_ms): (i64, String, i64, i64) = script
            .key(&lock_key)
            .key(&id_key)
            .key(&fence_key)
            .arg(&lock_id)
            .arg(ttl_ms)
            .arg(TOLERANCE_MS)
            .arg(&normalized)
            .arg(&lock_key)
            .invoke_async(&mut self.conn.clone())
            .await
            .map_err(|e| map_redis_error(e, "acquire"))?;

        if ok != 1 {
            return Ok(AcquireOutcome::Locked);
        }
        debug!(key_hash = %crate::keys::hash_key(&normalized), fence = %fence, "lock acquired");
        Ok(AcquireOutcome::Acquired(AcquiredLock {
            lock_id,
            fence,
            acquired_at_ms,
            expires_at_ms,
        }))
    }

    async fn release(&self, lock_id: &str, cancel: &CancellationToken) -> Result<ReleaseOutcome> {
        validate_lock_id(lock_id)?;
        ensure_not_cancelled(cancel)?;

        let script = Script::new(LUA_RELEASE);
        let released: i64 = script
            .key(self.id_key(lock_id))
            .arg(lock_id)
            .arg(TOLERANCE_MS)
            .invoke_async(&mut self.conn.clone())
            .await
            .map_err(|e| map_redis_error(e, "release"))?;

        Ok(if released == 1 {
            ReleaseOutcome::Released
        } else {
            ReleaseOutcome::Absent
        })
    }

    async fn extend(
        &self,
        lock_id: &str,
        ttl_ms: i64,
        cancel: &CancellationToken,
    ) -> Result<ExtendOutcome> {
        validate_lock_id(lock_id)?;
        validate_ttl_ms(ttl_ms)?;
        ensure_not_cancelled(cancel)?;

        let script = Script::new(LUA_EXTEND);
        let (ok, expires_at_ms): (i64, i64) = script
            .key(self.id_key(lock_id))
            .arg(lock_id)
            .arg(ttl_ms)
            .arg(TOLERANCE_MS)
            .invoke_async(&mut self.conn.clone())
            .await
            .map_err(|e| map_redis_error(e, "extend"))?;

        Ok(if ok == 1 {
            ExtendOutcome::Extended { expires_at_ms }
        } else {
            ExtendOutcome::Absent
        })
    }

    async fn is_locked(&self, key: &str, cancel: &CancellationToken) -> Result<bool> {
        let normalized = normalize_key(key)?;
        ensure_not_cancelled(cancel)?;
        let lock_key = self.lock_key(&normalized)?;

        let script = Script::new(LUA_IS_LOCKED);
        let live: i64 = script
            .key(&lock_key)
            .arg(TOLERANCE_MS)
            .arg(if self.cleanup_in_is_locked { "1" } else { "0" })
            .arg(self.id_key_prefix())
            .invoke_async(&mut self.conn.clone())
            .await
            .map_err(|e| map_redis_error(e, "is_locked"))?;

        Ok(live == 1)
    }

    async fn lookup(
        &self,
        query: &LookupQuery,
        cancel: &CancellationToken,
    ) -> Result<Option<RawLockInfo>> {
        let body: Option<String> = match query {
            LookupQuery::ByKey(key) => {
                let normalized = normalize_key(key)?;
                ensure_not_cancelled(cancel)?;
                let lock_key = self.lock_key(&normalized)?;
                Script::new(LUA_LOOKUP_BY_KEY)
                    .key(&lock_key)
                    .arg(TOLERANCE_MS)
                    .invoke_async(&mut self.conn.clone())
                    .await
                    .map_err(|e| map_redis_error(e, "lookup by key"))?
            },
            LookupQuery::ByLockId(lock_id) => {
                validate_lock_id(lock_id)?;
                ensure_not_cancelled(cancel)?;
                Script::new(LUA_LOOKUP_BY_ID)
                    .key(self.id_key(lock_id))
                    .arg(lock_id)
                    .arg(TOLERANCE_MS)
                    .invoke_async(&mut self.conn.clone())
                    .await
                    .map_err(|e| map_redis_error(e, "lookup by id"))?
            },
        };

        match body {
            None => Ok(None),
            Some(body) => {
                let record = self.parse_body(&body)?;
                Ok(Some(record.to_raw_info(true)))
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_validation_rejects_fence_namespace() {
        assert!(validate_prefix("app").is_ok());
        assert!(validate_prefix("app:sub").is_ok());
        assert!(validate_prefix("").is_err());
        assert!(validate_prefix("app:fence:x").is_err());
        assert!(validate_prefix("fence").is_err());
        assert!(validate_prefix("appfence").is_err());
    }
}

// ---------------------------------------------------------------------------
// Integration tests -- run against a live Redis
// ---------------------------------------------------------------------------
