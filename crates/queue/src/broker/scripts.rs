//! Lua scripts: one per atomic job-state transition.
//!
//! Per-queue keys (`{prefix}:{queue}:…`): `meta` (hash), `seq` (counter),
//! `waiting`, `delayed`, `active`, `completed`, `failed` (sorted sets of ids),
//! `job:{id}` (hash) and `result:{id}` (hash with a TTL, written when retention
//! deletes a finished job). Waiting score is `(255 - priority) * 2^40 + seq`;
//! delayed is scored by ready time, active by lease expiry, terminal sets by
//! finish time.

use redis::Script;

/// Prepended to scripts that apply retention. Keeps the newest `keep` ids of a
/// terminal set; each evicted job leaves its state, result and error under
/// `result:{id}` for `ttl` milliseconds.
const TRIM: &str = r#"
local function trim(set, keep, jobPrefix, resultPrefix, ttl)
  local old = redis.call("ZRANGE", set, 0, -(keep + 1))
  for _, oid in ipairs(old) do
    local jk = jobPrefix .. oid
    local rk = resultPrefix .. oid
    local f = redis.call("HMGET", jk, "state", "result", "error")
    redis.call("DEL", rk)
    redis.call("HSET", rk, "state", f[1] or "failed", "result", f[2] or "null", "error", f[3] or "")
    redis.call("PEXPIRE", rk, ttl)
    redis.call("DEL", jk)
  end
  if #old > 0 then
    redis.call("ZREMRANGEBYRANK", set, 0, #old - 1)
  end
end
"#;

/// KEYS: meta, seq, waiting, delayed, completed, failed, job, result
/// ARGV: id, name, data, settings, priority, created_at, ready_at ("" = now), now
/// Returns `{1, job}` when added, `{0, job}` for a live duplicate.
const ADD: &str = r#"
if redis.call("EXISTS", KEYS[1]) == 0 then
  return redis.error_reply("ERR queue does not exist")
end
redis.call("DEL", KEYS[8])
local state = redis.call("HGET", KEYS[7], "state")
if state then
  if state ~= "completed" and state ~= "failed" then
    return {0, redis.call("HGETALL", KEYS[7])}
  end
  redis.call("ZREM", KEYS[5], ARGV[1])
  redis.call("ZREM", KEYS[6], ARGV[1])
  redis.call("DEL", KEYS[7])
end
local seq = redis.call("INCR", KEYS[2])
redis.call("HSET", KEYS[7],
  "id", ARGV[1], "name", ARGV[2], "data", ARGV[3], "settings", ARGV[4],
  "priority", ARGV[5], "seq", seq, "created_at", ARGV[6],
  "attempts", 0, "stalled_count", 0, "history", "[]")
local readyAt = tonumber(ARGV[7])
if readyAt and readyAt > tonumber(ARGV[8]) then
  redis.call("HSET", KEYS[7], "state", "delayed", "ready_at", ARGV[7])
  redis.call("ZADD", KEYS[4], readyAt, ARGV[1])
else
  redis.call("HSET", KEYS[7], "state", "waiting")
  redis.call("ZADD", KEYS[3], (255 - tonumber(ARGV[5])) * 1099511627776 + seq, ARGV[1])
end
return {1, redis.call("HGETALL", KEYS[7])}
"#;

/// KEYS: meta, waiting, delayed, active
/// ARGV: job key prefix, now, lock_until, token
/// Returns the claimed job hash, or nil.
const CLAIM: &str = r#"
if redis.call("EXISTS", KEYS[1]) == 0 then
  return redis.error_reply("ERR queue does not exist")
end
local due = redis.call("ZRANGEBYSCORE", KEYS[3], "-inf", ARGV[2])
for _, id in ipairs(due) do
  local jk = ARGV[1] .. id
  local p = tonumber(redis.call("HGET", jk, "priority") or "0")
  local s = tonumber(redis.call("HGET", jk, "seq") or "0")
  redis.call("ZREM", KEYS[3], id)
  redis.call("ZADD", KEYS[2], (255 - p) * 1099511627776 + s, id)
  redis.call("HSET", jk, "state", "waiting")
end
local head = redis.call("ZRANGE", KEYS[2], 0, 0)
if #head == 0 then
  return false
end
local id = head[1]
local jk = ARGV[1] .. id
redis.call("ZREM", KEYS[2], id)
redis.call("ZADD", KEYS[4], ARGV[3], id)
redis.call("HINCRBY", jk, "attempts", 1)
redis.call("HSET", jk, "state", "active", "processed_at", ARGV[2],
  "lock_token", ARGV[4], "lock_until", ARGV[3])
return redis.call("HGETALL", jk)
"#;

/// KEYS: active, job
/// ARGV: id, token, lock_until
const RENEW: &str = r#"
if redis.call("HGET", KEYS[2], "state") ~= "active"
  or redis.call("HGET", KEYS[2], "lock_token") ~= ARGV[2] then
  return 0
end
redis.call("ZADD", KEYS[1], ARGV[3], ARGV[1])
redis.call("HSET", KEYS[2], "lock_until", ARGV[3])
return 1
"#;

/// KEYS: active, job, terminal set, waiting, delayed
/// ARGV: id, token, outcome ("completed" | "failed" | "retry"), finished_at,
///       field ("result" | "error"), value, history, keep ("" = all), retry_at,
///       job key prefix, result key prefix, result ttl
const FINISH: &str = r#"
local jk = KEYS[2]
if redis.call("HGET", jk, "state") ~= "active"
  or redis.call("HGET", jk, "lock_token") ~= ARGV[2] then
  return 0
end
redis.call("ZREM", KEYS[1], ARGV[1])
redis.call("HDEL", jk, "lock_token", "lock_until")
redis.call("HSET", jk, ARGV[5], ARGV[6], "history", ARGV[7])
if ARGV[3] == "retry" then
  local retryAt = tonumber(ARGV[9])
  if retryAt > tonumber(ARGV[4]) then
    redis.call("HSET", jk, "state", "delayed", "ready_at", ARGV[9])
    redis.call("ZADD", KEYS[5], retryAt, ARGV[1])
  else
    local p = tonumber(redis.call("HGET", jk, "priority") or "0")
    local s = tonumber(redis.call("HGET", jk, "seq") or "0")
    redis.call("HDEL", jk, "ready_at")
    redis.call("HSET", jk, "state", "waiting")
    redis.call("ZADD", KEYS[4], (255 - p) * 1099511627776 + s, ARGV[1])
  end
  return 1
end
redis.call("HSET", jk, "state", ARGV[3], "finished_at", ARGV[4])
redis.call("ZADD", KEYS[3], ARGV[4], ARGV[1])
if ARGV[8] ~= "" then
  trim(KEYS[3], tonumber(ARGV[8]), ARGV[10], ARGV[11], ARGV[12])
end
return 1
"#;

/// KEYS: active, waiting, failed
/// ARGV: now, max_stalled_count, job key prefix, terminal error, result key prefix,
///       result ttl
/// Returns `{id, name, attempts, stalled_count, "requeued" | "failed"}` per expired lease.
const STALLED: &str = r#"
local expired = redis.call("ZRANGEBYSCORE", KEYS[1], "-inf", "(" .. ARGV[1])
local out = {}
for _, id in ipairs(expired) do
  local jk = ARGV[3] .. id
  redis.call("ZREM", KEYS[1], id)
  redis.call("HDEL", jk, "lock_token", "lock_until")
  local name = redis.call("HGET", jk, "name") or ""
  local count = tonumber(redis.call("HGET", jk, "stalled_count") or "0")
  local attempts = tonumber(redis.call("HGET", jk, "attempts") or "0")
  if count < tonumber(ARGV[2]) then
    count = count + 1
    if attempts > 0 then
      attempts = attempts - 1
    end
    local p = tonumber(redis.call("HGET", jk, "priority") or "0")
    local s = tonumber(redis.call("HGET", jk, "seq") or "0")
    redis.call("HSET", jk, "state", "waiting", "stalled_count", count, "attempts", attempts)
    redis.call("ZADD", KEYS[2], (255 - p) * 1099511627776 + s, id)
    table.insert(out, {id, name, attempts, count, "requeued"})
  else
    redis.call("HSET", jk, "state", "failed", "error", ARGV[4], "finished_at", ARGV[1])
    redis.call("ZADD", KEYS[3], ARGV[1], id)
    local settings = cjson.decode(redis.call("HGET", jk, "settings") or "{}")
    local keep = settings["remove_on_fail"]
    if keep ~= nil and keep ~= cjson.null then
      trim(KEYS[3], keep, ARGV[3], ARGV[5], ARGV[6])
    end
    table.insert(out, {id, name, attempts, count, "failed"})
  end
end
return out
"#;

pub(super) struct Scripts {
    pub add: Script,
    pub claim: Script,
    pub renew: Script,
    pub finish: Script,
    pub stalled: Script,
}

impl Scripts {
    pub fn load() -> Self {
        Self {
            add: Script::new(ADD),
            claim: Script::new(CLAIM),
            renew: Script::new(RENEW),
            finish: Script::new(&format!("{TRIM}{FINISH}")),
            stalled: Script::new(&format!("{TRIM}{STALLED}")),
        }
    }
}
