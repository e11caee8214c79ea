//! Server-side scripts for atomic multi-key mutations.
//!
//! Every mutation that spans a task record, a queue, and a state counter
//! runs inside one of these scripts so the membership and counter
//! invariants hold at every instant. State counters are never written
//! outside this module.
//!
//! Script replies are single-word verdicts (`OK`, `EXISTS`, `NOT_FOUND`,
//! `CONFLICT:<state>`, ...) parsed by the repository layer; connection
//! errors surface separately through the store adapter.

use once_cell::sync::Lazy;
use store::Script;

/// Create a task record, seed its history, count it, and enqueue it.
///
/// KEYS: task hash, primary queue, pending counter
/// ARGV: task_id, task_type, payload, max_retries, now_iso
///
/// Returns `OK`, or `EXISTS` when the id is already taken.
pub static CREATE_TASK: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
  return 'EXISTS'
end
local history = cjson.encode({{state = 'PENDING', timestamp = ARGV[5]}})
redis.call('HSET', KEYS[1],
  'task_id', ARGV[1],
  'task_type', ARGV[2],
  'payload', ARGV[3],
  'state', 'PENDING',
  'retry_count', '0',
  'max_retries', ARGV[4],
  'created_at', ARGV[5],
  'updated_at', ARGV[5],
  'state_history', history,
  'error_history', '[]')
redis.call('INCR', KEYS[3])
redis.call('LPUSH', KEYS[2], ARGV[1])
return 'OK'
"#,
    )
});

/// Compare-and-swap state transition with patch, queue ops, counter move,
/// and history append.
///
/// KEYS: task hash, primary, retry, scheduled, dlq list, counter_from,
///       counter_to, dlq copy hash
/// ARGV: from_state, to_state, now_iso, patch_json, queue_ops_json,
///       scheduled_score
///
/// Returns `OK`, `NOT_FOUND`, or `CONFLICT:<observed_state>`.
pub static TRANSITION_TASK: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
local state = redis.call('HGET', KEYS[1], 'state')
if not state then
  return 'NOT_FOUND'
end
if state ~= ARGV[1] then
  return 'CONFLICT:' .. state
end
local patch = cjson.decode(ARGV[4])
for field, value in pairs(patch) do
  redis.call('HSET', KEYS[1], field, value)
end
redis.call('HSET', KEYS[1], 'state', ARGV[2], 'updated_at', ARGV[3])
local history = cjson.decode(redis.call('HGET', KEYS[1], 'state_history') or '[]')
table.insert(history, {state = ARGV[2], timestamp = ARGV[3]})
redis.call('HSET', KEYS[1], 'state_history', cjson.encode(history))
local task_id = redis.call('HGET', KEYS[1], 'task_id')
local ops = cjson.decode(ARGV[5])
for _, op in ipairs(ops) do
  if op == 'push_primary' then
    redis.call('LPUSH', KEYS[2], task_id)
  elseif op == 'push_retry' then
    redis.call('LPUSH', KEYS[3], task_id)
  elseif op == 'push_retry_tail' then
    redis.call('RPUSH', KEYS[3], task_id)
  elseif op == 'add_scheduled' then
    redis.call('ZADD', KEYS[4], tonumber(ARGV[6]), task_id)
  elseif op == 'remove_scheduled' then
    redis.call('ZREM', KEYS[4], task_id)
  elseif op == 'remove_primary' then
    redis.call('LREM', KEYS[2], 0, task_id)
  elseif op == 'remove_retry' then
    redis.call('LREM', KEYS[3], 0, task_id)
  elseif op == 'remove_dlq' then
    redis.call('LREM', KEYS[5], 0, task_id)
  elseif op == 'drop_dlq_copy' then
    redis.call('DEL', KEYS[8])
  elseif op == 'push_dlq' then
    redis.call('LPUSH', KEYS[5], task_id)
    local record = redis.call('HGETALL', KEYS[1])
    redis.call('DEL', KEYS[8])
    redis.call('HSET', KEYS[8], unpack(record))
  end
end
if ARGV[1] ~= ARGV[2] then
  redis.call('DECR', KEYS[6])
  redis.call('INCR', KEYS[7])
end
return 'OK'
"#,
    )
});

/// Append to the error history and refresh `last_error`/`error_type`.
///
/// KEYS: task hash
/// ARGV: error_type, message, now_iso
pub static RECORD_ERROR: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
  return 'NOT_FOUND'
end
local history = cjson.decode(redis.call('HGET', KEYS[1], 'error_history') or '[]')
table.insert(history, {error_type = ARGV[1], message = ARGV[2], timestamp = ARGV[3]})
redis.call('HSET', KEYS[1],
  'error_history', cjson.encode(history),
  'last_error', ARGV[2],
  'error_type', ARGV[1],
  'updated_at', ARGV[3])
return 'OK'
"#,
    )
});

/// Remove a task record, all queue memberships, the DLQ copy, and its
/// state counter contribution.
///
/// KEYS: task hash, primary, retry, scheduled, dlq list, dlq copy hash
/// ARGV: counter key prefix
///
/// Returns the state the task was in, or `NOT_FOUND`.
pub static DELETE_TASK: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
local state = redis.call('HGET', KEYS[1], 'state')
if not state then
  return 'NOT_FOUND'
end
local task_id = redis.call('HGET', KEYS[1], 'task_id')
redis.call('LREM', KEYS[2], 0, task_id)
redis.call('LREM', KEYS[3], 0, task_id)
redis.call('ZREM', KEYS[4], task_id)
redis.call('LREM', KEYS[5], 0, task_id)
redis.call('DEL', KEYS[6])
redis.call('DEL', KEYS[1])
redis.call('DECR', ARGV[1] .. string.lower(state))
return state
"#,
    )
});

/// Token bucket acquire: refill from elapsed wall time, then grant or
/// compute the wait.
///
/// KEYS: bucket hash, config hash
/// ARGV: now_epoch_secs (float), requested, default_capacity,
///       default_refill_rate
///
/// Returns `{granted, wait_secs, tokens}` with wait/tokens as strings
/// (script numbers truncate to integers on reply).
pub static ACQUIRE_TOKENS: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
local bucket = redis.call('HMGET', KEYS[1], 'tokens', 'capacity', 'refill_rate', 'last_refill')
local tokens = tonumber(bucket[1])
local capacity = tonumber(bucket[2])
local refill_rate = tonumber(bucket[3])
local last_refill = tonumber(bucket[4])
if not capacity or not refill_rate then
  local cfg = redis.call('HMGET', KEYS[2], 'requests', 'interval')
  local requests = tonumber(cfg[1])
  local interval = tonumber(cfg[2])
  if requests and interval and interval > 0 then
    capacity = requests
    refill_rate = requests / interval
  else
    capacity = tonumber(ARGV[3])
    refill_rate = tonumber(ARGV[4])
  end
  tokens = capacity
  last_refill = tonumber(ARGV[1])
end
local now = tonumber(ARGV[1])
local elapsed = now - last_refill
if elapsed < 0 then
  elapsed = 0
end
tokens = math.min(capacity, tokens + elapsed * refill_rate)
local requested = tonumber(ARGV[2])
local granted = 0
local wait = 0
if tokens >= requested then
  tokens = tokens - requested
  granted = 1
else
  wait = (requested - tokens) / refill_rate
end
redis.call('HSET', KEYS[1],
  'tokens', tostring(tokens),
  'capacity', tostring(capacity),
  'refill_rate', tostring(refill_rate),
  'last_refill', tostring(now))
return {granted, tostring(wait), tostring(tokens)}
"#,
    )
});

/// Apply a new rate-limit configuration, clipping tokens to the new
/// capacity.
///
/// KEYS: bucket hash, config hash
/// ARGV: requests, interval_secs, now_iso, now_epoch_secs
pub static UPDATE_RATE_CONFIG: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
redis.call('HSET', KEYS[2], 'requests', ARGV[1], 'interval', ARGV[2], 'updated_at', ARGV[3])
local capacity = tonumber(ARGV[1])
local refill_rate = capacity / tonumber(ARGV[2])
local tokens = tonumber(redis.call('HGET', KEYS[1], 'tokens'))
if not tokens or tokens > capacity then
  tokens = capacity
end
redis.call('HSET', KEYS[1],
  'tokens', tostring(tokens),
  'capacity', tostring(capacity),
  'refill_rate', tostring(refill_rate))
if not redis.call('HGET', KEYS[1], 'last_refill') then
  redis.call('HSET', KEYS[1], 'last_refill', ARGV[4])
end
return 'OK'
"#,
    )
});

/// Requeue one orphaned PENDING task (in no queue) onto the retry queue.
///
/// KEYS: task hash, primary, retry
///
/// Returns `REQUEUED`, `QUEUED` (already in a queue), or `SKIP` (not
/// PENDING).
pub static REQUEUE_ORPHAN: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
local state = redis.call('HGET', KEYS[1], 'state')
if state ~= 'PENDING' then
  return 'SKIP'
end
local task_id = redis.call('HGET', KEYS[1], 'task_id')
if redis.call('LPOS', KEYS[2], task_id) then
  return 'QUEUED'
end
if redis.call('LPOS', KEYS[3], task_id) then
  return 'QUEUED'
end
redis.call('LPUSH', KEYS[3], task_id)
return 'REQUEUED'
"#,
    )
});
