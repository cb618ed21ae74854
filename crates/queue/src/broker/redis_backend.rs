//! Redis-backed broker (durable, shared between processes).
//!
//! One synchronous connection guarded by a mutex; every state transition is a
//! single Lua script (see `scripts.rs`), so concurrent workers in any number of
//! processes never claim the same job twice.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use redis::{ErrorKind, IntoConnectionInfo, RedisError, RedisResult};
use serde::de::DeserializeOwned;
use tracing::{debug, instrument};

use pdfgen_core::{from_millis, millis_after, JobId, LockToken};

use super::scripts::Scripts;
use super::{
    AddOutcome, Backend, BackendError, BackendResult, Completion, FINISHED_OUTCOME_TTL, Failure,
    FinishedOutcome, STALLED_TOO_MANY_TIMES, StalledOutcome, StalledRecovery,
};
use crate::config::BrokerConfig;
use crate::jobs::{Job, JobCounts, JobState, Lease};

pub struct RedisBackend {
    client: redis::Client,
    prefix: String,
    connect_timeout: Duration,
    command_timeout: Duration,
    conn: Mutex<Option<redis::Connection>>,
    scripts: Scripts,
}

impl std::fmt::Debug for RedisBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBackend")
            .field("prefix", &self.prefix)
            .field("connect_timeout", &self.connect_timeout)
            .field("command_timeout", &self.command_timeout)
            .finish_non_exhaustive()
    }
}

/// Key names for one queue.
struct Keys {
    base: String,
}

impl Keys {
    fn new(prefix: &str, queue: &str) -> Self {
        Self {
            base: format!("{prefix}:{queue}"),
        }
    }

    fn key(&self, name: &str) -> String {
        format!("{}:{name}", self.base)
    }

    fn job_prefix(&self) -> String {
        format!("{}:job:", self.base)
    }

    fn job(&self, id: &JobId) -> String {
        format!("{}:job:{id}", self.base)
    }

    fn result_prefix(&self) -> String {
        format!("{}:result:", self.base)
    }

    fn result(&self, id: &JobId) -> String {
        format!("{}:result:{id}", self.base)
    }
}

fn outcome_ttl_ms() -> u64 {
    FINISHED_OUTCOME_TTL.as_millis() as u64
}

impl RedisBackend {
    /// Build a client from the config. Does not connect.
    pub fn new(config: &BrokerConfig) -> BackendResult<Self> {
        let mut info = config
            .redis_url()
            .as_str()
            .into_connection_info()
            .map_err(map_redis_error)?;
        info.redis.password = config.password.clone();

        let client = redis::Client::open(info).map_err(map_redis_error)?;

        Ok(Self {
            client,
            prefix: config.key_prefix.clone(),
            connect_timeout: config.connect_timeout,
            command_timeout: config.command_timeout,
            conn: Mutex::new(None),
            scripts: Scripts::load(),
        })
    }

    fn guard(&self) -> MutexGuard<'_, Option<redis::Connection>> {
        self.conn.lock().unwrap()
    }

    /// Run `f` on the live connection; a connection-level failure drops it so
    /// the next `connect` starts fresh.
    fn with_conn<T, F>(&self, f: F) -> BackendResult<T>
    where
        F: FnOnce(&mut redis::Connection) -> RedisResult<T>,
    {
        let mut guard = self.guard();
        let conn = guard
            .as_mut()
            .ok_or_else(|| BackendError::Connection("not connected".to_string()))?;

        f(conn).map_err(|e| {
            let err = map_redis_error(e);
            if err.is_connection_level() {
                *guard = None;
            }
            err
        })
    }
}

fn map_redis_error(e: RedisError) -> BackendError {
    match e.kind() {
        ErrorKind::ReadOnly => BackendError::ReadOnly(e.to_string()),
        ErrorKind::BusyLoadingError => BackendError::Connection(e.to_string()),
        _ if e.is_io_error()
            || e.is_connection_dropped()
            || e.is_connection_refusal()
            || e.is_timeout() =>
        {
            BackendError::Connection(e.to_string())
        }
        _ => BackendError::Command(e.to_string()),
    }
}

fn opt_ms(ms: Option<i64>) -> String {
    ms.map(|v| v.to_string()).unwrap_or_default()
}

fn field<'a>(fields: &'a HashMap<String, String>, name: &str) -> Option<&'a str> {
    fields.get(name).map(String::as_str).filter(|v| !v.is_empty())
}

fn parse_field<T: std::str::FromStr>(
    fields: &HashMap<String, String>,
    name: &str,
) -> BackendResult<Option<T>> {
    field(fields, name)
        .map(|v| {
            v.parse::<T>()
                .map_err(|_| BackendError::Corrupt(format!("field `{name}` = `{v}`")))
        })
        .transpose()
}

fn json_field<T: DeserializeOwned>(
    fields: &HashMap<String, String>,
    name: &str,
) -> BackendResult<Option<T>> {
    field(fields, name)
        .map(|v| {
            serde_json::from_str(v)
                .map_err(|e| BackendError::Corrupt(format!("field `{name}`: {e}")))
        })
        .transpose()
}

fn required<T>(value: Option<T>, name: &str) -> BackendResult<T> {
    value.ok_or_else(|| BackendError::Corrupt(format!("missing field `{name}`")))
}

/// Rebuild a [`Job`] from its hash.
fn decode_job(queue: &str, fields: &HashMap<String, String>) -> BackendResult<Job> {
    let id: JobId = required(parse_field(fields, "id")?, "id")?;
    let state: JobState = required(parse_field(fields, "state")?, "state")?;
    let ms = |name: &str| parse_field::<i64>(fields, name).map(|v| v.map(from_millis));

    let lease = match (
        parse_field::<LockToken>(fields, "lock_token")?,
        parse_field::<i64>(fields, "lock_until")?,
    ) {
        (Some(token), Some(until)) => Some(Lease {
            token,
            expires_at: from_millis(until),
        }),
        _ => None,
    };

    Ok(Job {
        id,
        queue: queue.to_string(),
        name: required(field(fields, "name"), "name")?.to_string(),
        payload: required(json_field(fields, "data")?, "data")?,
        state,
        attempts: parse_field(fields, "attempts")?.unwrap_or(0),
        stalled_count: parse_field(fields, "stalled_count")?.unwrap_or(0),
        settings: required(json_field(fields, "settings")?, "settings")?,
        priority: parse_field(fields, "priority")?.unwrap_or(0),
        seq: parse_field(fields, "seq")?.unwrap_or(0),
        result: json_field(fields, "result")?,
        error: field(fields, "error").map(str::to_string),
        created_at: required(ms("created_at")?, "created_at")?,
        processed_at: ms("processed_at")?,
        finished_at: ms("finished_at")?,
        ready_at: ms("ready_at")?,
        lease,
        history: json_field(fields, "history")?.unwrap_or_default(),
    })
}

fn decode_outcome(fields: &HashMap<String, String>) -> BackendResult<FinishedOutcome> {
    match field(fields, "state") {
        Some("completed") => Ok(FinishedOutcome::Completed(
            json_field(fields, "result")?.unwrap_or(serde_json::Value::Null),
        )),
        _ => Ok(FinishedOutcome::Failed(
            field(fields, "error").unwrap_or_default().to_string(),
        )),
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> BackendResult<String> {
    serde_json::to_string(value).map_err(|e| BackendError::Command(e.to_string()))
}

impl Backend for RedisBackend {
    #[instrument(skip(self), fields(prefix = %self.prefix))]
    fn connect(&self) -> BackendResult<()> {
        let conn = self
            .client
            .get_connection_with_timeout(self.connect_timeout)
            .map_err(map_redis_error)?;
        conn.set_read_timeout(Some(self.command_timeout))
            .map_err(map_redis_error)?;
        conn.set_write_timeout(Some(self.command_timeout))
            .map_err(map_redis_error)?;

        *self.guard() = Some(conn);
        debug!("redis connection opened");
        Ok(())
    }

    /// `PING`, then refuse while the server is still loading its dataset.
    fn ping(&self) -> BackendResult<()> {
        let info: String = self.with_conn(|conn| {
            redis::cmd("PING").query::<String>(conn)?;
            redis::cmd("INFO").arg("persistence").query(conn)
        })?;

        if info.lines().any(|line| line.trim() == "loading:1") {
            return Err(BackendError::Connection(
                "server is loading its dataset".to_string(),
            ));
        }
        Ok(())
    }

    fn disconnect(&self) {
        self.guard().take();
    }

    fn ensure_queue(&self, queue: &str) -> BackendResult<()> {
        let keys = Keys::new(&self.prefix, queue);
        let now = pdfgen_core::now_millis();
        self.with_conn(|conn| {
            redis::cmd("HSETNX")
                .arg(keys.key("meta"))
                .arg("created_at")
                .arg(now)
                .query::<i64>(conn)
                .map(|_| ())
        })
    }

    fn queue_exists(&self, queue: &str) -> BackendResult<bool> {
        let keys = Keys::new(&self.prefix, queue);
        self.with_conn(|conn| redis::cmd("EXISTS").arg(keys.key("meta")).query(conn))
    }

    fn add_job(&self, job: &Job, now_ms: i64) -> BackendResult<AddOutcome> {
        let keys = Keys::new(&self.prefix, &job.queue);
        let data = to_json(&job.payload)?;
        let settings = to_json(&job.settings)?;
        let ready_at = opt_ms(job.ready_at.map(|at| at.timestamp_millis()));

        let (added, fields): (i64, HashMap<String, String>) = self.with_conn(|conn| {
            self.scripts
                .add
                .key(keys.key("meta"))
                .key(keys.key("seq"))
                .key(keys.key("waiting"))
                .key(keys.key("delayed"))
                .key(keys.key("completed"))
                .key(keys.key("failed"))
                .key(keys.job(&job.id))
                .key(keys.result(&job.id))
                .arg(job.id.as_str())
                .arg(&job.name)
                .arg(data)
                .arg(settings)
                .arg(u32::from(job.priority))
                .arg(job.created_at.timestamp_millis())
                .arg(ready_at)
                .arg(now_ms)
                .invoke(conn)
        })?;

        let stored = decode_job(&job.queue, &fields)?;
        Ok(if added == 1 {
            AddOutcome::Added(stored)
        } else {
            AddOutcome::Duplicate(stored)
        })
    }

    fn claim_next(
        &self,
        queue: &str,
        token: LockToken,
        now_ms: i64,
        lock_ms: u64,
    ) -> BackendResult<Option<Job>> {
        let keys = Keys::new(&self.prefix, queue);
        let fields: Option<HashMap<String, String>> = self.with_conn(|conn| {
            self.scripts
                .claim
                .key(keys.key("meta"))
                .key(keys.key("waiting"))
                .key(keys.key("delayed"))
                .key(keys.key("active"))
                .arg(keys.job_prefix())
                .arg(now_ms)
                .arg(millis_after(now_ms, Duration::from_millis(lock_ms)))
                .arg(token.to_string())
                .invoke(conn)
        })?;

        fields.map(|f| decode_job(queue, &f)).transpose()
    }

    fn renew_lease(
        &self,
        queue: &str,
        job_id: &JobId,
        token: LockToken,
        until_ms: i64,
    ) -> BackendResult<bool> {
        let keys = Keys::new(&self.prefix, queue);
        let renewed: i64 = self.with_conn(|conn| {
            self.scripts
                .renew
                .key(keys.key("active"))
                .key(keys.job(job_id))
                .arg(job_id.as_str())
                .arg(token.to_string())
                .arg(until_ms)
                .invoke(conn)
        })?;
        Ok(renewed == 1)
    }

    fn complete(
        &self,
        queue: &str,
        job_id: &JobId,
        token: LockToken,
        completion: &Completion,
    ) -> BackendResult<bool> {
        let keys = Keys::new(&self.prefix, queue);
        let result = to_json(&completion.result)?;
        let history = to_json(&completion.history)?;
        let keep = completion.keep.map(|k| k.to_string()).unwrap_or_default();

        let done: i64 = self.with_conn(|conn| {
            self.scripts
                .finish
                .key(keys.key("active"))
                .key(keys.job(job_id))
                .key(keys.key("completed"))
                .key(keys.key("waiting"))
                .key(keys.key("delayed"))
                .arg(job_id.as_str())
                .arg(token.to_string())
                .arg("completed")
                .arg(completion.finished_at_ms)
                .arg("result")
                .arg(result)
                .arg(history)
                .arg(keep)
                .arg("")
                .arg(keys.job_prefix())
                .arg(keys.result_prefix())
                .arg(outcome_ttl_ms())
                .invoke(conn)
        })?;
        Ok(done == 1)
    }

    fn fail(
        &self,
        queue: &str,
        job_id: &JobId,
        token: LockToken,
        failure: &Failure,
    ) -> BackendResult<bool> {
        let keys = Keys::new(&self.prefix, queue);
        let history = to_json(&failure.history)?;
        let outcome = if failure.retry_at_ms.is_some() {
            "retry"
        } else {
            "failed"
        };
        let keep = failure.keep.map(|k| k.to_string()).unwrap_or_default();

        let done: i64 = self.with_conn(|conn| {
            self.scripts
                .finish
                .key(keys.key("active"))
                .key(keys.job(job_id))
                .key(keys.key("failed"))
                .key(keys.key("waiting"))
                .key(keys.key("delayed"))
                .arg(job_id.as_str())
                .arg(token.to_string())
                .arg(outcome)
                .arg(failure.finished_at_ms)
                .arg("error")
                .arg(&failure.error)
                .arg(history)
                .arg(keep)
                .arg(opt_ms(failure.retry_at_ms))
                .arg(keys.job_prefix())
                .arg(keys.result_prefix())
                .arg(outcome_ttl_ms())
                .invoke(conn)
        })?;
        Ok(done == 1)
    }

    fn recover_stalled(
        &self,
        queue: &str,
        now_ms: i64,
        max_stalled_count: u32,
    ) -> BackendResult<Vec<StalledRecovery>> {
        let keys = Keys::new(&self.prefix, queue);
        let rows: Vec<(String, String, u32, u32, String)> = self.with_conn(|conn| {
            self.scripts
                .stalled
                .key(keys.key("active"))
                .key(keys.key("waiting"))
                .key(keys.key("failed"))
                .arg(now_ms)
                .arg(max_stalled_count)
                .arg(keys.job_prefix())
                .arg(STALLED_TOO_MANY_TIMES)
                .arg(keys.result_prefix())
                .arg(outcome_ttl_ms())
                .invoke(conn)
        })?;

        rows.into_iter()
            .map(|(id, job_name, attempts, stalled_count, outcome)| {
                let job_id = id
                    .parse::<JobId>()
                    .map_err(|e| BackendError::Corrupt(e.to_string()))?;
                let outcome = match outcome.as_str() {
                    "requeued" => StalledOutcome::Requeued,
                    _ => StalledOutcome::Failed,
                };
                Ok(StalledRecovery {
                    job_id,
                    job_name,
                    attempts,
                    stalled_count,
                    outcome,
                })
            })
            .collect()
    }

    fn get_job(&self, queue: &str, job_id: &JobId) -> BackendResult<Option<Job>> {
        let keys = Keys::new(&self.prefix, queue);
        let fields: HashMap<String, String> =
            self.with_conn(|conn| redis::cmd("HGETALL").arg(keys.job(job_id)).query(conn))?;

        if fields.is_empty() {
            return Ok(None);
        }
        decode_job(queue, &fields).map(Some)
    }

    /// Expiry is left to the key TTL, so `now_ms` is unused here.
    fn finished_outcome(
        &self,
        queue: &str,
        job_id: &JobId,
        _now_ms: i64,
    ) -> BackendResult<Option<FinishedOutcome>> {
        let keys = Keys::new(&self.prefix, queue);
        let fields: HashMap<String, String> =
            self.with_conn(|conn| redis::cmd("HGETALL").arg(keys.result(job_id)).query(conn))?;

        if fields.is_empty() {
            return Ok(None);
        }
        decode_outcome(&fields).map(Some)
    }

    fn counts(&self, queue: &str) -> BackendResult<JobCounts> {
        let keys = Keys::new(&self.prefix, queue);
        let (waiting, active, delayed, completed, failed): (usize, usize, usize, usize, usize) =
            self.with_conn(|conn| {
                redis::pipe()
                    .cmd("ZCARD")
                    .arg(keys.key("waiting"))
                    .cmd("ZCARD")
                    .arg(keys.key("active"))
                    .cmd("ZCARD")
                    .arg(keys.key("delayed"))
                    .cmd("ZCARD")
                    .arg(keys.key("completed"))
                    .cmd("ZCARD")
                    .arg(keys.key("failed"))
                    .query(conn)
            })?;

        Ok(JobCounts {
            waiting,
            active,
            delayed,
            completed,
            failed,
        })
    }
}
